use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::ml::NodeValue;

use super::MelodyError;

/// Where the per-sequence work of a training batch runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Backend {
    /// Sequential and bit-reproducible for a fixed seed.
    #[default]
    Cpu,
    /// Sequences of a batch run on the rayon pool. Masks and batches are still drawn on
    /// the calling thread, but gradients are summed in completion order, so results can
    /// differ from [`Backend::Cpu`] and between runs in the last bits.
    ThreadPool,
}

impl Backend {
    /// Falls back to [`Backend::Cpu`] when the crate was built without a thread pool.
    pub fn resolve(self) -> Self {
        match self {
            Backend::ThreadPool if !cfg!(feature = "threadpool") => {
                warn!("thread pool backend unavailable in this build, using cpu backend");
                Backend::Cpu
            }
            backend => backend,
        }
    }
}

impl std::str::FromStr for Backend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(Backend::Cpu),
            "threadpool" | "thread-pool" => Ok(Backend::ThreadPool),
            _ => Err(MelodyError::InvalidConfig(format!("unknown backend '{s}'")).into()),
        }
    }
}

/// Hyperparameters for one training run. Built once, then only ever read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MelodyConfig {
    pub block_size: usize,
    pub embedding_dim: usize,
    pub head_count: usize,
    pub block_count: usize,
    pub dropout_rate: NodeValue,
    pub batch_size: usize,
    pub eval_interval: usize,
    pub eval_iters: usize,
    pub max_iters: usize,
    pub learn_rate: NodeValue,
    pub label_smoothing: NodeValue,
    pub init_std: NodeValue,
    pub seed: u32,
    pub backend: Backend,
}

impl Default for MelodyConfig {
    fn default() -> Self {
        Self {
            block_size: 32,
            embedding_dim: 64,
            head_count: 4,
            block_count: 4,
            dropout_rate: 0.2,
            batch_size: 16,
            eval_interval: 100,
            eval_iters: 20,
            max_iters: 2000,
            learn_rate: 1e-3,
            label_smoothing: 0.1,
            init_std: 0.02,
            seed: 1337,
            backend: Backend::default(),
        }
    }
}

impl MelodyConfig {
    pub fn validate(&self) -> Result<()> {
        let sizes = [
            ("block_size", self.block_size),
            ("embedding_dim", self.embedding_dim),
            ("head_count", self.head_count),
            ("block_count", self.block_count),
            ("batch_size", self.batch_size),
            ("eval_interval", self.eval_interval),
            ("eval_iters", self.eval_iters),
        ];
        if let Some((name, _)) = sizes.iter().find(|(_, size)| *size == 0) {
            Err(MelodyError::InvalidConfig(format!("{name} must be non-zero")))?;
        }
        if self.embedding_dim % self.head_count != 0 {
            Err(MelodyError::InvalidConfig(format!(
                "head_count={} is not a factor of embedding_dim={}",
                self.head_count, self.embedding_dim
            )))?;
        }
        if !(0.0..=1.0).contains(&self.dropout_rate) {
            Err(MelodyError::InvalidConfig(format!(
                "dropout_rate={} must lie in [0, 1]",
                self.dropout_rate
            )))?;
        }
        if !(0.0..=1.0).contains(&self.label_smoothing) {
            Err(MelodyError::InvalidConfig(format!(
                "label_smoothing={} must lie in [0, 1]",
                self.label_smoothing
            )))?;
        }
        if !(self.learn_rate > 0.0 && self.learn_rate.is_finite()) {
            Err(MelodyError::InvalidConfig(format!(
                "learn_rate={} must be positive",
                self.learn_rate
            )))?;
        }
        if !(self.init_std > 0.0 && self.init_std.is_finite()) {
            Err(MelodyError::InvalidConfig(format!(
                "init_std={} must be positive",
                self.init_std
            )))?;
        }
        Ok(())
    }

    pub fn head_dim(&self) -> usize {
        self.embedding_dim / self.head_count.max(1)
    }
}

/// Parameters of the per-line augmentation transforms, applied in field order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AugmentConfig {
    /// Every symbol is repeated this many times.
    pub stretch_factor: usize,
    /// Chance of dropping each symbol.
    pub deletion_prob: NodeValue,
    /// Each symbol is then repeated a random count in `jitter_min..=jitter_max`.
    pub jitter_min: usize,
    pub jitter_max: usize,
}

impl Default for AugmentConfig {
    fn default() -> Self {
        Self {
            stretch_factor: 1,
            deletion_prob: 0.0,
            jitter_min: 1,
            jitter_max: 1,
        }
    }
}

impl AugmentConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.deletion_prob) {
            Err(MelodyError::InvalidConfig(format!(
                "deletion_prob={} must lie in [0, 1]",
                self.deletion_prob
            )))?;
        }
        if self.jitter_min > self.jitter_max {
            Err(MelodyError::InvalidConfig(format!(
                "jitter_min={} exceeds jitter_max={}",
                self.jitter_min, self.jitter_max
            )))?;
        }
        Ok(())
    }
}
