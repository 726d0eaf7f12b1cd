use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};

use melody_plane::ml::{
    melody::{AugmentConfig, Backend, MelodyConfig},
    NodeValue,
};

#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    #[arg(short = 'i', long, default_value = None)]
    #[serde(default)]
    pub input_txt_path: Option<String>,

    #[arg(short = 'L', long, default_value_t = 32)]
    pub block_size: usize,

    #[arg(short = 'n', long, default_value_t = 64)]
    pub embedding_dim: usize,

    #[arg(short = 'a', long, default_value_t = 4)]
    pub head_count: usize,

    #[arg(short = 'l', long, default_value_t = 4)]
    pub block_count: usize,

    #[arg(short = 'd', long, default_value_t = 0.2)]
    pub dropout_rate: NodeValue,

    #[arg(short = 'b', long, default_value_t = 16)]
    pub batch_size: usize,

    #[arg(short = 'e', long, default_value_t = 100)]
    pub eval_interval: usize,

    #[arg(short = 'E', long, default_value_t = 20)]
    pub eval_iters: usize,

    #[arg(short = 'c', long, default_value_t = 2000)]
    pub max_iters: usize,

    #[arg(short = 'r', long, default_value_t = 1e-3)]
    pub learn_rate: NodeValue,

    #[arg(short = 's', long, default_value_t = 0.1)]
    pub label_smoothing: NodeValue,

    #[arg(long, default_value_t = 0.02)]
    pub init_std: NodeValue,

    #[arg(short = 'S', long, default_value_t = 1337)]
    pub seed: u32,

    #[arg(short = 'x', long, default_value = "cpu")]
    #[serde(default)]
    pub backend: Backend,

    #[arg(long, default_value_t = 1)]
    pub stretch_factor: usize,

    #[arg(long, default_value_t = 0.0)]
    pub deletion_prob: NodeValue,

    /// inclusive bounds on how many times each symbol is repeated after deletion
    #[arg(short = 'J', long, value_parser = parse_range::<usize>, default_value = "1..1")]
    pub jitter_bounds: (usize, usize),

    #[arg(short = 'g', long, default_value_t = 200)]
    pub generate_tokens: usize,

    #[arg(short = 't', long, default_value_t = 1.0)]
    pub temperature: NodeValue,

    #[arg(long, default_value = None)]
    #[serde(default)]
    pub seed_text: Option<String>,

    #[arg(short = 'o', long, default_value = None)]
    #[serde(default)]
    pub output_dir: Option<String>,

    #[arg(short = 'O', long, default_value = None)]
    #[serde(default)]
    pub output_label: Option<String>,

    /// also write a model snapshot at every evaluation checkpoint
    #[arg(long, default_value_t = false)]
    #[serde(default)]
    pub checkpoint: bool,
}

impl TrainConfig {
    pub fn melody_config(&self) -> MelodyConfig {
        MelodyConfig {
            block_size: self.block_size,
            embedding_dim: self.embedding_dim,
            head_count: self.head_count,
            block_count: self.block_count,
            dropout_rate: self.dropout_rate,
            batch_size: self.batch_size,
            eval_interval: self.eval_interval,
            eval_iters: self.eval_iters,
            max_iters: self.max_iters,
            learn_rate: self.learn_rate,
            label_smoothing: self.label_smoothing,
            init_std: self.init_std,
            seed: self.seed,
            backend: self.backend,
        }
    }

    pub fn augment_config(&self) -> AugmentConfig {
        let (jitter_min, jitter_max) = self.jitter_bounds;
        AugmentConfig {
            stretch_factor: self.stretch_factor,
            deletion_prob: self.deletion_prob,
            jitter_min,
            jitter_max,
        }
    }

    pub fn label(&self) -> &str {
        self.output_label.as_deref().unwrap_or("melody")
    }
}

#[derive(Args, Debug, Clone)]
pub struct GenerateConfig {
    pub file_path: String,

    #[arg(short = 'g', long, default_value_t = 200)]
    pub tokens: usize,

    #[arg(short = 't', long, default_value_t = 1.0)]
    pub temperature: NodeValue,

    #[arg(long, default_value = None)]
    pub seed_text: Option<String>,

    #[arg(short = 'o', long, default_value = None)]
    pub output_dir: Option<String>,

    #[arg(short = 'O', long, default_value = None)]
    pub output_label: Option<String>,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "melody", args_conflicts_with_subcommands = true)]
pub struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    train_command: TrainConfig,
}

impl Cli {
    pub fn command(&self) -> Command {
        self.command
            .clone()
            .unwrap_or(Command::Train(self.train_command.clone()))
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    #[command(name = "train", author, version, about, long_about = None)]
    Train(TrainConfig),

    #[command(name = "generate", arg_required_else_help = true)]
    Generate(GenerateConfig),
}

fn parse_range<T>(s: &str) -> Result<(T, T), Box<dyn std::error::Error + Send + Sync + 'static>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let pos = s.find("..");
    let pos = pos.ok_or_else(|| format!("invalid range: no `..` found in `{s}`"))?;

    let range = (s[..pos].parse()?, s[pos + 2..].parse()?);
    Ok(range)
}
