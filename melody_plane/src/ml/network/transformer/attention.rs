use std::iter;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::ml::{layer::LayerInitStrategy, NodeValue, RngStrategy};

use super::{
    layers::DropoutMask,
    linear::Linear,
    params::{keys, Trainable, TrainableLinear},
    solver::source::OptimizerSource,
};

/// Independent causal heads whose outputs are concatenated along the feature axis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiHeadAttention {
    heads: Vec<AttentionHead>,
}

impl MultiHeadAttention {
    pub fn new(
        sequence_len: usize,
        embedding_dimension: usize,
        head_count: usize,
        kqv_weights_init_strategy: &LayerInitStrategy,
        rng: &RngStrategy,
    ) -> Self {
        let heads = iter::repeat_with(|| {
            AttentionHead::new_head(
                sequence_len,
                embedding_dimension,
                head_count,
                kqv_weights_init_strategy,
                rng,
            )
        })
        .take(head_count)
        .collect();

        Self { heads }
    }

    pub fn head_count(&self) -> usize {
        self.heads.len()
    }

    pub fn forward(&self, inputs: &Linear, dropout_masks: &[DropoutMask]) -> Result<Linear> {
        let mut head_outputs = vec![];
        for (idx, head) in self.heads.iter().enumerate() {
            let mask = dropout_masks.get(idx).and_then(|x| x.as_ref());
            head_outputs.push(head.forward_advanced(inputs, mask)?);
        }

        let attention_output = head_outputs
            .into_iter()
            .reduce(|concat, head| concat.concat(&head).collect())
            .context("attention requires at least one head")?;

        Ok(attention_output)
    }

    /// Returns the summed input gradients of every head.
    pub fn backward(
        &self,
        inputs: &Linear,
        dropout_masks: &[DropoutMask],
        output_gradients: &Linear,
    ) -> Result<Linear> {
        let head_output_gradients = output_gradients.split(self.heads.len());

        let mut input_gradients = Linear::with_dimensions(inputs);
        for (idx, (head, output_gradients)) in
            self.heads.iter().zip(&head_output_gradients).enumerate()
        {
            let mask = dropout_masks.get(idx).and_then(|x| x.as_ref());
            let head_input_gradients = head.backward_advanced(inputs, mask, output_gradients)?;
            input_gradients = input_gradients.iter().add(head_input_gradients.iter()).collect();
        }

        Ok(input_gradients)
    }
}

impl Trainable for MultiHeadAttention {
    fn parameters(&self) -> Vec<&TrainableLinear> {
        self.heads.iter().flat_map(|x| x.parameters()).collect()
    }

    fn apply_gradients<T: OptimizerSource>(&mut self, optimizer: &T) -> Result<()> {
        for (idx, head) in self.heads.iter_mut().enumerate() {
            head.apply_gradients(&optimizer.with_index(idx))?;
        }
        Ok(())
    }
}

/// Single causal self-attention head projecting `embedding_dimension` inputs down to
/// `embedding_dimension / head_count` wide keys, queries and values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttentionHead {
    key_weights: TrainableLinear,
    query_weights: TrainableLinear,
    value_weights: TrainableLinear,
    embedding_dimension: usize,
    sequence_len: usize,
}

impl AttentionHead {
    pub fn new_head(
        sequence_len: usize,
        embedding_dimension: usize,
        head_count: usize,
        kqv_weights_init_strategy: &LayerInitStrategy,
        rng: &RngStrategy,
    ) -> Self {
        let strategy = kqv_weights_init_strategy;
        let head_dim = embedding_dimension / head_count.max(1);
        Self {
            key_weights: Self::new_kqv_linear(embedding_dimension, head_dim, strategy, rng),
            query_weights: Self::new_kqv_linear(embedding_dimension, head_dim, strategy, rng),
            value_weights: Self::new_kqv_linear(embedding_dimension, head_dim, strategy, rng),
            embedding_dimension,
            sequence_len,
        }
    }

    pub fn head_dimension(&self) -> usize {
        self.key_weights.stride()
    }

    pub fn forward(&self, inputs: &Linear) -> Result<Linear> {
        self.forward_advanced(inputs, None)
    }

    pub fn forward_advanced(&self, inputs: &Linear, dropout_mask: Option<&Linear>) -> Result<Linear> {
        self.validate_inputs(inputs)?;
        let keys = inputs.matrix_product(self.key_weights.value());
        let queries = inputs.matrix_product(self.query_weights.value());
        let values = inputs.matrix_product(self.value_weights.value());

        let attention_weights = self.attention_weights(&keys, &queries);
        let attention_weights = Self::apply_dropout(attention_weights, dropout_mask)?;

        Ok(attention_weights.matrix_product(&values))
    }

    pub fn backward(&self, inputs: &Linear, output_gradients: &Linear) -> Result<Linear> {
        self.backward_advanced(inputs, None, output_gradients)
    }

    pub fn backward_advanced(
        &self,
        inputs: &Linear,
        dropout_mask: Option<&Linear>,
        output_gradients: &Linear,
    ) -> Result<Linear> {
        self.validate_inputs(inputs)?;
        if output_gradients.stride() != self.head_dimension()
            || output_gradients.count() != inputs.count()
        {
            Err(anyhow!("mismatched output gradients shape"))?;
        }

        // forward pass
        let keys = inputs.matrix_product(self.key_weights.value());
        let queries = inputs.matrix_product(self.query_weights.value());
        let values = inputs.matrix_product(self.value_weights.value());

        let attention_weights = self.attention_weights(&keys, &queries);
        let dropped_weights = Self::apply_dropout(attention_weights.clone(), dropout_mask)?;

        // backward pass
        // output = dropped_weights * values
        let dvalues = dropped_weights.matrix_product_lhs_transposed(output_gradients);
        let ddropped_weights = output_gradients.matrix_product_rhs_transposed(&values);
        let dattention_weights = Self::apply_dropout(ddropped_weights, dropout_mask)?;

        // masked positions hold zero probability, so their score gradients vanish here
        let dattention_scores = dattention_weights
            .softmax_d(&attention_weights)
            .iter()
            .multiply_scalar(self.scale_factor())
            .collect();

        // attention_scores = queries * keys.T
        let dqueries = dattention_scores.matrix_product(&keys);
        let dkeys = dattention_scores.matrix_product_lhs_transposed(&queries);

        let dkey_weights = inputs.matrix_product_lhs_transposed(&dkeys);
        let dquery_weights = inputs.matrix_product_lhs_transposed(&dqueries);
        let dvalue_weights = inputs.matrix_product_lhs_transposed(&dvalues);

        self.key_weights.queue_gradients(dkey_weights.iter());
        self.query_weights.queue_gradients(dquery_weights.iter());
        self.value_weights.queue_gradients(dvalue_weights.iter());

        let dkey_inputs = dkeys.matrix_product_rhs_transposed(self.key_weights.value());
        let dquery_inputs = dqueries.matrix_product_rhs_transposed(self.query_weights.value());
        let dvalue_inputs = dvalues.matrix_product_rhs_transposed(self.value_weights.value());

        Ok(dkey_inputs
            .iter()
            .add(dquery_inputs.iter())
            .add(dvalue_inputs.iter())
            .collect())
    }

    fn attention_weights(&self, keys: &Linear, queries: &Linear) -> Linear {
        // attention_scores = queries * keys.T
        let attention_scores = queries.matrix_product_rhs_transposed(keys);
        let causal_mask = Linear::causal_mask(attention_scores.count());

        attention_scores
            .iter()
            .multiply_scalar(self.scale_factor())
            .set_mask(causal_mask.iter(), NodeValue::NEG_INFINITY)
            .softmax()
    }

    fn scale_factor(&self) -> NodeValue {
        (self.head_dimension() as NodeValue).powf(-0.5)
    }

    fn apply_dropout(values: Linear, dropout_mask: Option<&Linear>) -> Result<Linear> {
        match dropout_mask {
            Some(mask) if mask.stride() != values.stride() || mask.count() != values.count() => {
                Err(anyhow!("mismatched attention dropout mask shape"))
            }
            Some(mask) => Ok(values.iter().dot_product(mask.iter()).collect()),
            None => Ok(values),
        }
    }

    fn validate_inputs(&self, inputs: &Linear) -> Result<()> {
        if inputs.count() == 0 {
            Err(anyhow!("no values provided for input vectors"))?;
        }
        if inputs.count() > self.sequence_len {
            Err(anyhow!(
                "sequence of {} exceeds context length {}",
                inputs.count(),
                self.sequence_len
            ))?;
        }
        if inputs.stride() != self.embedding_dimension {
            Err(anyhow!("mismatched input vector size"))?;
        }
        Ok(())
    }

    fn new_kqv_linear(
        embedding_dimension: usize,
        head_dimension: usize,
        strategy: &LayerInitStrategy,
        rng: &RngStrategy,
    ) -> TrainableLinear {
        let mut linear = Linear::new(embedding_dimension, head_dimension);
        linear.initialize_as_layer(strategy, rng);
        linear.into()
    }
}

impl Trainable for AttentionHead {
    fn parameters(&self) -> Vec<&TrainableLinear> {
        vec![&self.key_weights, &self.query_weights, &self.value_weights]
    }

    fn apply_gradients<T: OptimizerSource>(&mut self, optimizer: &T) -> Result<()> {
        self.key_weights
            .apply_gradients(optimizer, keys::ATTENTION_KEY)?;
        self.query_weights
            .apply_gradients(optimizer, keys::ATTENTION_QUERY)?;
        self.value_weights
            .apply_gradients(optimizer, keys::ATTENTION_VALUE)?;
        Ok(())
    }
}
