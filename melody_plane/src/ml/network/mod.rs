use serde::{Deserialize, Serialize};

pub use layer::{LayerValues, NodeValue};

pub mod layer;
pub mod transformer;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum NetworkActivationMode {
    Linear,
    RelU,
}

impl std::fmt::Display for NetworkActivationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkActivationMode::Linear => write!(f, "Linear"),
            NetworkActivationMode::RelU => write!(f, "RelU"),
        }
    }
}

impl NetworkActivationMode {
    pub fn apply(&self, output: &[NodeValue]) -> LayerValues {
        match self {
            NetworkActivationMode::Linear => output.into(),
            NetworkActivationMode::RelU => output.iter().map(|x| x.max(0.0)).collect(),
        }
    }

    /// Multiplies `output_gradients` by the activation derivative, evaluated from the
    /// already activated outputs.
    pub fn derivative(&self, output_gradients: &[NodeValue], activation: &[NodeValue]) -> LayerValues {
        match self {
            NetworkActivationMode::Linear => output_gradients.into(),
            NetworkActivationMode::RelU => activation
                .iter()
                .zip(output_gradients)
                .map(|(&x, &grad)| if x > 0.0 { grad } else { 0.0 })
                .collect(),
        }
    }
}

impl Default for NetworkActivationMode {
    fn default() -> Self {
        Self::Linear
    }
}
