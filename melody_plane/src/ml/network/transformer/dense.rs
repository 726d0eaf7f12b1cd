use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::ml::{layer::LayerInitStrategy, NetworkActivationMode, RngStrategy};

use super::{
    linear::Linear,
    params::{keys, Trainable, TrainableLinear},
    solver::source::OptimizerSource,
};

/// Fully connected layer applied row by row: `activation(inputs * weights + bias)`.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Dense {
    weights: TrainableLinear,
    bias: TrainableLinear,
    activation: Option<NetworkActivationMode>,
    inputs_count: usize,
    outputs_count: usize,
}

impl Dense {
    pub fn new(
        inputs_count: usize,
        outputs_count: usize,
        strategy: &LayerInitStrategy,
        rng: &RngStrategy,
    ) -> Self {
        let mut weights = Linear::new(inputs_count, outputs_count);
        weights.initialize_as_layer(strategy, rng);

        let mut bias = Linear::new(1, outputs_count);
        bias.initialize_as_layer_bias(strategy, rng);

        Self {
            weights: weights.into(),
            bias: bias.into(),
            activation: None,
            inputs_count,
            outputs_count,
        }
    }

    pub fn forward(&self, inputs: &Linear) -> Result<Linear> {
        let mut outputs = self.compute_weighted_inputs(inputs)?;

        if let Some(activation) = &self.activation {
            outputs.rows_iter_mut().for_each(|row| {
                let activated = activation.apply(row);
                row.copy_from_slice(&activated)
            });
        }

        Ok(outputs)
    }

    fn compute_weighted_inputs(&self, inputs: &Linear) -> Result<Linear> {
        if inputs.stride() != self.inputs_count {
            Err(anyhow!(
                "mismatched input vector size: expected {}, got {}",
                self.inputs_count,
                inputs.stride()
            ))?;
        }

        // -> output = inputs * weights
        let output = inputs.matrix_product(self.weights.value());

        Ok(output
            .iter()
            .add(self.bias.iter().stack(inputs.count()))
            .collect())
    }

    pub fn backward(&self, inputs: &Linear, output_gradients: &Linear) -> Result<Linear> {
        if output_gradients.stride() != self.outputs_count {
            Err(anyhow!("mismatched output gradients size"))?;
        }
        let weighted_inputs_gradients = match &self.activation {
            Some(activation) => {
                let mut activated = self.forward(inputs)?;
                activated
                    .rows_iter_mut()
                    .zip(output_gradients.rows_iter())
                    .for_each(|(row, grads)| {
                        let grads = activation.derivative(grads, row);
                        row.copy_from_slice(&grads)
                    });
                activated
            }
            None => output_gradients.clone(),
        };

        // -> weights_gradients = inputs.T * weighted_inputs_gradients
        let weights_gradients = inputs.matrix_product_lhs_transposed(&weighted_inputs_gradients);
        self.weights.queue_gradients(weights_gradients.iter());

        let bias_gradients = weighted_inputs_gradients.iter_transpose().flatten_sum();
        self.bias.queue_gradients(bias_gradients.iter_transpose());

        // -> input_gradients = weighted_inputs_gradients * weights.T
        let input_gradients =
            weighted_inputs_gradients.matrix_product_rhs_transposed(self.weights.value());

        Ok(input_gradients)
    }

    pub fn set_activation(&mut self, activation: NetworkActivationMode) {
        self.activation = Some(activation);
    }

    pub fn inputs_count(&self) -> usize {
        self.inputs_count
    }

    pub fn outputs_count(&self) -> usize {
        self.outputs_count
    }
}

impl Trainable for Dense {
    fn parameters(&self) -> Vec<&TrainableLinear> {
        vec![&self.weights, &self.bias]
    }

    fn apply_gradients<T: OptimizerSource>(&mut self, optimizer: &T) -> Result<()> {
        self.weights.apply_gradients(optimizer, keys::DENSE_WEIGHT)?;
        self.bias.apply_gradients(optimizer, keys::DENSE_BIAS)
    }
}
