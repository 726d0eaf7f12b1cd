mod batch;
mod config;
mod corpus;
mod error;
mod loss;
pub mod metrics;
mod model;
mod trainer;
mod vocab;

pub use batch::{Batch, BatchSampler};
pub use config::{AugmentConfig, Backend, MelodyConfig};
pub use corpus::{CorpusPreparer, EncodedCorpus, Partition, TRAIN_SPLIT};
pub use error::MelodyError;
pub use loss::{LabelSmoothedLoss, LossTerms};
pub use metrics::MelodyMetrics;
pub use model::{BatchEvaluation, MelodyModel};
pub use trainer::{Checkpoint, Trainer, TrainerState};
pub use vocab::Vocab;
