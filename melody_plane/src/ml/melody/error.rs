use crate::ml::NodeValue;

/// Failures with a meaning of their own. Everything else travels as a plain
/// [`anyhow::Error`]; these can be recovered with `downcast_ref::<MelodyError>()`.
#[derive(Debug, Clone, PartialEq)]
pub enum MelodyError {
    UnknownSymbol(char),
    InsufficientData { len: usize, block_size: usize },
    DegenerateMetric(&'static str),
    TrainingDiverged { iteration: usize, loss: NodeValue },
    InvalidConfig(String),
}

impl std::fmt::Display for MelodyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MelodyError::UnknownSymbol(symbol) => {
                write!(f, "symbol {symbol:?} is not in the vocabulary")
            }
            MelodyError::InsufficientData { len, block_size } => write!(
                f,
                "partition of {len} tokens is too short for a context window of {block_size}"
            ),
            MelodyError::DegenerateMetric(reason) => write!(f, "degenerate metric: {reason}"),
            MelodyError::TrainingDiverged { iteration, loss } => {
                write!(f, "training diverged at iteration {iteration} (loss = {loss})")
            }
            MelodyError::InvalidConfig(reason) => write!(f, "invalid configuration: {reason}"),
        }
    }
}

impl std::error::Error for MelodyError {}
