use std::{fs, path::Path};

use anyhow::{Context, Result};
use itertools::Itertools;
use tracing::info;

use melody_plane::ml::{
    melody::{
        Checkpoint, CorpusPreparer, EncodedCorpus, MelodyModel, Partition, Trainer, TrainerState,
        Vocab,
    },
    NodeValue, RngStrategy,
};

use crate::config::{GenerateConfig, TrainConfig};

pub fn setup_and_train_model(config: &TrainConfig) -> Result<MelodyModel> {
    let melody_config = config.melody_config();
    melody_config.validate()?;
    let rng = RngStrategy::seeded(melody_config.seed);

    let input_txt_path = config
        .input_txt_path
        .as_deref()
        .context("no corpus provided, pass one with --input-txt-path")?;
    let lines = read_corpus(input_txt_path)?;

    let preparer = CorpusPreparer::new(&config.augment_config(), rng.fork())?;
    let augmented = preparer.augment(&lines);
    let fpath = writer::write_lines_to_disk(
        &augmented,
        "augmented.txt",
        config.output_dir.as_deref(),
        config.label(),
    )?;
    info!("Wrote augmented corpus to {}", fpath.display());

    let vocab = Vocab::from_corpus(&augmented);
    info!(
        "Built vocabulary of {} symbols: {}",
        vocab.len(),
        vocab.symbols().iter().join("")
    );

    let corpus = EncodedCorpus::encode(&vocab, &augmented)?;
    info!(
        "Encoded corpus of {} tokens ({} train, {} validation)",
        corpus.len(),
        corpus.partition(Partition::Train).len(),
        corpus.partition(Partition::Validation).len()
    );

    let mut model = MelodyModel::new(&melody_config, vocab, rng.fork())?;
    info!(
        "Created model with {} parameters on {:?} backend",
        model.parameter_count(),
        model.backend()
    );

    let mut trainer = Trainer::new(&melody_config, corpus, rng.fork())?;
    let state = trainer
        .run(&mut model, |checkpoint, model| {
            info!("{}", format_checkpoint(checkpoint));
            if config.checkpoint {
                let state = TrainerState {
                    iteration: checkpoint.iteration,
                    checkpoints: vec![checkpoint.clone()],
                    train_loss_history: vec![],
                };
                let label = format!("{}-i{}", config.label(), checkpoint.iteration);
                writer::write_model_to_disk(
                    model,
                    config,
                    &state,
                    config.output_dir.as_deref(),
                    &label,
                )?;
            }
            Ok(())
        })?
        .clone();
    info!("Completed {} training iterations", state.iteration);

    let fpath = writer::write_model_to_disk(
        &model,
        config,
        &state,
        config.output_dir.as_deref(),
        config.label(),
    )?;
    info!("Wrote model snapshot to {}", fpath.display());

    let melody = generate_melody(
        &model,
        config.seed_text.as_deref(),
        config.generate_tokens,
        config.temperature,
    )?;
    let fpath = writer::write_lines_to_disk(
        &[&melody],
        "melody.txt",
        config.output_dir.as_deref(),
        config.label(),
    )?;
    info!("Wrote generated melody to {}", fpath.display());
    println!("{melody}");

    Ok(model)
}

pub fn generate_from_snapshot(config: &GenerateConfig) -> Result<String> {
    let (snapshot, train_config, state) = writer::read_model_from_disk(&config.file_path)?;
    let model = MelodyModel::from_snapshot(&snapshot)?;
    info!(
        "Loaded model trained for {} iterations with {} parameters",
        state.iteration,
        model.parameter_count()
    );

    let melody = generate_melody(
        &model,
        config.seed_text.as_deref(),
        config.tokens,
        config.temperature,
    )?;

    let label = config
        .output_label
        .as_deref()
        .unwrap_or_else(|| train_config.label());
    let fpath = writer::write_lines_to_disk(
        &[&melody],
        "melody.txt",
        config.output_dir.as_deref().or(train_config.output_dir.as_deref()),
        label,
    )?;
    info!("Wrote generated melody to {}", fpath.display());
    println!("{melody}");

    Ok(melody)
}

/// Seeds with `seed_text` when given, otherwise with the first vocabulary symbol.
fn generate_melody(
    model: &MelodyModel,
    seed_text: Option<&str>,
    token_count: usize,
    temperature: NodeValue,
) -> Result<String> {
    let seed_text = match seed_text {
        Some(seed_text) => seed_text.to_string(),
        None => model
            .vocab()
            .symbols()
            .first()
            .map(|x| x.to_string())
            .context("model vocabulary is empty")?,
    };
    model.generate_text(&seed_text, token_count, temperature)
}

pub fn read_corpus<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read corpus from {}", path.display()))?;

    Ok(contents
        .lines()
        .map(|line| line.trim_end_matches('\r').to_string())
        .collect())
}

pub fn format_checkpoint(checkpoint: &Checkpoint) -> String {
    format!(
        "iter = {:<6} |  train_loss = {:<12.8}, val_loss = {:<12.8}, perplexity = {:<10.4}, levenshtein = {:<8.4}, jaccard = {:<6.4}",
        checkpoint.iteration,
        checkpoint.train_loss,
        checkpoint.val_loss,
        checkpoint.metrics.perplexity,
        checkpoint.metrics.levenshtein,
        checkpoint.metrics.jaccard
    )
}

pub mod writer {
    use std::{
        fs::File,
        io::{BufReader, Write},
        path::PathBuf,
    };

    use anyhow::{Context, Result};
    use itertools::Itertools;
    use serde_json::Value;
    use tracing::info;

    use melody_plane::ml::melody::{MelodyModel, TrainerState};

    use crate::config::TrainConfig;

    pub fn read_model_from_disk(file_path: &str) -> Result<(String, TrainConfig, TrainerState)> {
        info!("Loading model from path: {file_path}");
        let file = File::open(file_path)
            .with_context(|| format!("failed to open model snapshot {file_path}"))?;
        let reader = BufReader::new(file);

        let mut snapshot: Value = serde_json::from_reader(reader)?;

        let config: TrainConfig = serde_json::from_value(snapshot["_trainer_config"].take())
            .context("unable to extract trainer config from saved model")?;

        let state: TrainerState = serde_json::from_value(snapshot["_trainer_state"].take())
            .context("unable to extract trainer state from saved model")?;

        if let Value::Object(fields) = &mut snapshot {
            fields.remove("_trainer_config");
            fields.remove("_trainer_state");
        }
        let snapshot = serde_json::to_string(&snapshot)?;

        info!("Extracted model configuration and training state from file");
        Ok((snapshot, config, state))
    }

    pub fn write_model_to_disk(
        model: &MelodyModel,
        config: &TrainConfig,
        state: &TrainerState,
        output_dir: Option<&str>,
        label: &str,
    ) -> Result<PathBuf> {
        let snapshot = model.snapshot()?;
        let mut snapshot: Value = serde_json::from_str(&snapshot)?;

        snapshot["_trainer_config"] = serde_json::to_value(config)?;
        snapshot["_trainer_state"] = serde_json::to_value(state)?;

        let snapshot_pretty = serde_json::to_string_pretty(&snapshot)?;
        let fpath = path::create_output_fpath("model.json", output_dir, label)?;

        File::create(&fpath)
            .and_then(|mut file| file.write_all(snapshot_pretty.as_bytes()))
            .with_context(|| format!("failed to write model to {}", fpath.display()))?;

        Ok(fpath)
    }

    pub fn write_lines_to_disk<S: AsRef<str>>(
        lines: &[S],
        fname_suffix: &str,
        output_dir: Option<&str>,
        label: &str,
    ) -> Result<PathBuf> {
        let fpath = path::create_output_fpath(fname_suffix, output_dir, label)?;
        let contents = lines.iter().map(|x| x.as_ref()).join("\n");

        File::create(&fpath)
            .and_then(|mut file| writeln!(file, "{contents}"))
            .with_context(|| format!("failed to write {}", fpath.display()))?;

        Ok(fpath)
    }

    mod path {
        use std::{
            fs::DirBuilder,
            path::{Path, PathBuf},
        };

        use anyhow::{Context, Result};

        pub fn create_output_fpath(
            fname_suffix: &str,
            output_dir: Option<&str>,
            label: &str,
        ) -> Result<PathBuf> {
            let dir_path = create_output_dir(output_dir)?;
            Ok(dir_path.join(format!("{label}-{fname_suffix}")))
        }

        fn create_output_dir(output_dir: Option<&str>) -> Result<PathBuf> {
            let dir_path = Path::new(output_dir.unwrap_or("out"));
            DirBuilder::new()
                .recursive(true)
                .create(dir_path)
                .with_context(|| format!("failed to create output dir {}", dir_path.display()))?;
            Ok(dir_path.to_path_buf())
        }
    }
}
