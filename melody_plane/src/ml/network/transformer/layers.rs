use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::ml::{layer::LayerInitStrategy, NetworkActivationMode, NodeValue, RngStrategy};

use super::{
    attention::MultiHeadAttention,
    dense::Dense,
    linear::Linear,
    params::{keys, Trainable, TrainableLinear},
    solver::source::OptimizerSource,
};

/// Inverted dropout keep-mask holding `0.0` or `1 / (1 - rate)` per value.
/// `None` passes values through unchanged, as in inference.
pub type DropoutMask = Option<Linear>;

/// Dropout masks for one pass through a [`MultiHeadSelfAttentionLayer`].
#[derive(Debug, Clone, Default)]
pub struct SelfAttentionMasks {
    pub heads: Vec<DropoutMask>,
    pub projection: DropoutMask,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiHeadSelfAttentionLayer {
    attention: MultiHeadAttention,
    dense_layer: Dense,
    dropout: DropoutLayer,
}

impl MultiHeadSelfAttentionLayer {
    pub fn new(
        sequence_len: usize,
        embedding_dimension: usize,
        head_count: usize,
        dropout_rate: NodeValue,
        strategy: &LayerInitStrategy,
        rng: &RngStrategy,
    ) -> Self {
        let attention = MultiHeadAttention::new(
            sequence_len,
            embedding_dimension,
            head_count,
            strategy,
            rng,
        );
        let dense_layer = Dense::new(embedding_dimension, embedding_dimension, strategy, rng);

        Self {
            attention,
            dense_layer,
            dropout: DropoutLayer::new(dropout_rate),
        }
    }

    pub fn head_count(&self) -> usize {
        self.attention.head_count()
    }

    pub fn forward(&self, inputs: &Linear) -> Result<Linear> {
        self.forward_with_masks(inputs, &SelfAttentionMasks::default())
    }

    pub fn forward_with_masks(&self, inputs: &Linear, masks: &SelfAttentionMasks) -> Result<Linear> {
        let attention_output = self.attention.forward(inputs, &masks.heads)?;
        let projected = self.dense_layer.forward(&attention_output)?;
        self.dropout.forward(projected, &masks.projection)
    }

    pub fn backward(&self, inputs: &Linear, output_gradients: &Linear) -> Result<Linear> {
        self.backward_with_masks(inputs, &SelfAttentionMasks::default(), output_gradients)
    }

    pub fn backward_with_masks(
        &self,
        inputs: &Linear,
        masks: &SelfAttentionMasks,
        output_gradients: &Linear,
    ) -> Result<Linear> {
        // forward pass
        let attention_output = self.attention.forward(inputs, &masks.heads)?;

        // backward pass
        let projected_gradients = self
            .dropout
            .backward(output_gradients.clone(), &masks.projection)?;
        let attention_output_gradients = self
            .dense_layer
            .backward(&attention_output, &projected_gradients)?;

        self.attention
            .backward(inputs, &masks.heads, &attention_output_gradients)
    }

    pub fn sample_masks(&self, sequence_len: usize, rng: &RngStrategy) -> SelfAttentionMasks {
        let heads = (0..self.attention.head_count())
            .map(|_| self.dropout.sample_mask(sequence_len, sequence_len, rng))
            .collect();
        let projection =
            self.dropout
                .sample_mask(sequence_len, self.dense_layer.outputs_count(), rng);
        SelfAttentionMasks { heads, projection }
    }
}

impl Trainable for MultiHeadSelfAttentionLayer {
    fn parameters(&self) -> Vec<&TrainableLinear> {
        let mut params = self.attention.parameters();
        params.extend(self.dense_layer.parameters());
        params
    }

    fn apply_gradients<T: OptimizerSource>(&mut self, optimizer: &T) -> Result<()> {
        self.attention
            .apply_gradients(&optimizer.with_scope("heads"))?;
        self.dense_layer
            .apply_gradients(&optimizer.with_scope("projection"))?;
        Ok(())
    }
}

/// Position-wise `C -> hidden -> C` network with a rectified hidden layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedForwardLayer {
    hidden_layer: Dense,
    output_layer: Dense,
    dropout: DropoutLayer,
}

impl FeedForwardLayer {
    pub fn new(
        model_dimensions: usize,
        hidden_dimension: usize,
        dropout_rate: NodeValue,
        strategy: &LayerInitStrategy,
        rng: &RngStrategy,
    ) -> Self {
        let mut hidden_layer = Dense::new(model_dimensions, hidden_dimension, strategy, rng);
        hidden_layer.set_activation(NetworkActivationMode::RelU);

        let output_layer = Dense::new(hidden_dimension, model_dimensions, strategy, rng);
        Self {
            hidden_layer,
            output_layer,
            dropout: DropoutLayer::new(dropout_rate),
        }
    }

    pub fn forward(&self, inputs: &Linear) -> Result<Linear> {
        self.forward_with_mask(inputs, &None)
    }

    pub fn forward_with_mask(&self, inputs: &Linear, mask: &DropoutMask) -> Result<Linear> {
        let hidden_layer = self.hidden_layer.forward(inputs)?;
        let layer_output = self.output_layer.forward(&hidden_layer)?;
        self.dropout.forward(layer_output, mask)
    }

    pub fn backward(&self, inputs: &Linear, output_gradients: &Linear) -> Result<Linear> {
        self.backward_with_mask(inputs, &None, output_gradients)
    }

    pub fn backward_with_mask(
        &self,
        inputs: &Linear,
        mask: &DropoutMask,
        output_gradients: &Linear,
    ) -> Result<Linear> {
        let final_layer_inputs = self.hidden_layer.forward(inputs)?;
        let output_gradients = self.dropout.backward(output_gradients.clone(), mask)?;
        let final_layer_gradients = self
            .output_layer
            .backward(&final_layer_inputs, &output_gradients)?;

        self.hidden_layer.backward(inputs, &final_layer_gradients)
    }

    pub fn sample_mask(&self, sequence_len: usize, rng: &RngStrategy) -> DropoutMask {
        self.dropout
            .sample_mask(sequence_len, self.output_layer.outputs_count(), rng)
    }
}

impl Trainable for FeedForwardLayer {
    fn parameters(&self) -> Vec<&TrainableLinear> {
        let mut params = self.hidden_layer.parameters();
        params.extend(self.output_layer.parameters());
        params
    }

    fn apply_gradients<T: OptimizerSource>(&mut self, optimizer: &T) -> Result<()> {
        self.hidden_layer
            .apply_gradients(&optimizer.with_scope("hidden"))?;
        self.output_layer
            .apply_gradients(&optimizer.with_scope("output"))?;
        Ok(())
    }
}

/// Lookup table mapping each token id to a learned `model_dimensions` wide row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingLayer {
    embeddings: TrainableLinear,
    vocab_size: usize,
    model_dimensions: usize,
}

impl EmbeddingLayer {
    pub fn new(
        model_dimensions: usize,
        vocab_size: usize,
        strategy: &LayerInitStrategy,
        rng: &RngStrategy,
    ) -> Self {
        let mut linear = Linear::new(vocab_size, model_dimensions);
        linear.initialize_as_layer(strategy, rng);

        Self {
            embeddings: linear.into(),
            vocab_size,
            model_dimensions,
        }
    }

    pub fn forward<T: AsRef<[usize]>>(&self, token_sequence: T) -> Result<Linear> {
        let token_sequence = token_sequence.as_ref();
        let mut output = Linear::new(token_sequence.len(), self.model_dimensions);

        for (idx, &token) in token_sequence.iter().enumerate() {
            if token >= self.vocab_size {
                return Err(anyhow!(
                    "token {token} not in embedding range of {}",
                    self.vocab_size
                ));
            }
            output.copy_stride_into(self.embeddings.value(), token, idx);
        }

        Ok(output)
    }

    pub fn backward<T: AsRef<[usize]>>(
        &self,
        token_sequence: T,
        output_gradients: &Linear,
    ) -> Result<()> {
        let token_sequence = token_sequence.as_ref();
        if output_gradients.count() != token_sequence.len() {
            return Err(anyhow!("mismatched gradient vector count"));
        }

        let mut table_gradients = Linear::with_dimensions(self.embeddings.value());
        {
            let mut rows: Vec<&mut [NodeValue]> = table_gradients.rows_iter_mut().collect();
            for (&token, grad) in token_sequence.iter().zip(output_gradients.rows_iter()) {
                let row = rows
                    .get_mut(token)
                    .context("token not in embedding range")?;
                row.iter_mut().zip(grad).for_each(|(x, g)| *x += g);
            }
        }

        self.embeddings.queue_gradients(table_gradients.iter());
        Ok(())
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    pub fn model_dimensions(&self) -> usize {
        self.model_dimensions
    }
}

impl Trainable for EmbeddingLayer {
    fn parameters(&self) -> Vec<&TrainableLinear> {
        vec![&self.embeddings]
    }

    fn apply_gradients<T: OptimizerSource>(&mut self, optimizer: &T) -> Result<()> {
        self.embeddings
            .apply_gradients(optimizer, keys::EMBEDDING_TABLE)
    }
}

/// Learned absolute positions `0..max_sequence_len`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionalEmbeddingLayer {
    embeddings: EmbeddingLayer,
}

impl PositionalEmbeddingLayer {
    pub fn new(
        model_dimensions: usize,
        max_sequence_len: usize,
        strategy: &LayerInitStrategy,
        rng: &RngStrategy,
    ) -> Self {
        Self {
            embeddings: EmbeddingLayer::new(model_dimensions, max_sequence_len, strategy, rng),
        }
    }

    pub fn forward(&self, start_index: usize, count: usize) -> Result<Linear> {
        let positions = self.positions(start_index, count)?;
        self.embeddings.forward(positions)
    }

    pub fn backward(
        &self,
        start_index: usize,
        count: usize,
        output_gradients: &Linear,
    ) -> Result<()> {
        let positions = self.positions(start_index, count)?;
        self.embeddings.backward(positions, output_gradients)
    }

    pub fn max_sequence_len(&self) -> usize {
        self.embeddings.vocab_size()
    }

    fn positions(&self, start_index: usize, count: usize) -> Result<Vec<usize>> {
        let end_index = start_index + count;
        if end_index > self.embeddings.vocab_size() {
            return Err(anyhow!(
                "positional index {end_index} out of range {}",
                self.embeddings.vocab_size()
            ));
        }
        Ok((start_index..end_index).collect())
    }
}

impl Trainable for PositionalEmbeddingLayer {
    fn parameters(&self) -> Vec<&TrainableLinear> {
        self.embeddings.parameters()
    }

    fn apply_gradients<T: OptimizerSource>(&mut self, optimizer: &T) -> Result<()> {
        self.embeddings.apply_gradients(optimizer)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DropoutLayer {
    dropout_rate: NodeValue,
}

impl DropoutLayer {
    pub fn new(dropout_rate: NodeValue) -> Self {
        Self { dropout_rate }
    }

    /// Draws a fresh keep-mask, or `None` when dropout is disabled.
    pub fn sample_mask(&self, count: usize, stride: usize, rng: &RngStrategy) -> DropoutMask {
        if self.dropout_rate <= 0.0 {
            return None;
        }
        let keep_value = if self.dropout_rate < 1.0 {
            1.0 / (1.0 - self.dropout_rate)
        } else {
            0.0
        };
        let mut mask = Linear::new(count, stride);
        mask.rows_iter_mut().flatten().for_each(|x| {
            *x = if rng.rand() < self.dropout_rate {
                0.0
            } else {
                keep_value
            }
        });
        Some(mask)
    }

    pub fn forward(&self, input: Linear, mask: &DropoutMask) -> Result<Linear> {
        Self::apply_mask(input, mask)
    }

    pub fn backward(&self, output_gradients: Linear, mask: &DropoutMask) -> Result<Linear> {
        Self::apply_mask(output_gradients, mask)
    }

    fn apply_mask(values: Linear, mask: &DropoutMask) -> Result<Linear> {
        match mask {
            Some(mask) if mask.count() != values.count() || mask.stride() != values.stride() => {
                Err(anyhow!("mismatched dropout mask shape"))
            }
            Some(mask) => Ok(values.iter().dot_product(mask.iter()).collect()),
            None => Ok(values),
        }
    }

    pub fn dropout_rate(&self) -> NodeValue {
        self.dropout_rate
    }
}

/// Normalises each position across its features, then scales by `gamma` and shifts by
/// `beta` (both learned per feature).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerNormalization {
    beta: TrainableLinear,
    gamma: TrainableLinear,
}

impl LayerNormalization {
    const EPSILON: NodeValue = 1e-5;

    pub fn new(model_dimensions: usize) -> Self {
        Self {
            beta: Linear::with_value(1, model_dimensions, 0.0).into(),
            gamma: Linear::with_value(1, model_dimensions, 1.0).into(),
        }
    }

    pub fn forward(&self, input: &Linear) -> Result<Linear> {
        self.validate_inputs(input)?;
        let (normalised, _) = Self::normalise(input)?;

        // layer_norm(x) = norm(x) * gamma + beta
        let count = input.count();
        Ok(normalised
            .iter()
            .dot_product(self.gamma.iter().stack(count))
            .add(self.beta.iter().stack(count))
            .collect())
    }

    pub fn backward(&self, input: &Linear, output_gradients: &Linear) -> Result<Linear> {
        self.validate_inputs(input)?;
        let (normalised, inv_std_devs) = Self::normalise(input)?;
        let stride = input.stride() as NodeValue;

        let dbeta = output_gradients.iter_transpose().flatten_sum();
        let dgamma = output_gradients
            .iter()
            .dot_product(normalised.iter())
            .collect()
            .iter_transpose()
            .flatten_sum();

        self.beta.queue_gradients(dbeta.iter_transpose());
        self.gamma.queue_gradients(dgamma.iter_transpose());

        // dnorm = dy * gamma
        // dx = inv_std * (dnorm - mean(dnorm) - norm * mean(dnorm * norm))
        let dnormalised = output_gradients
            .iter()
            .dot_product(self.gamma.iter().stack(input.count()))
            .collect();

        let mut input_gradients = Linear::with_dimensions(input);
        for (((dx, dnorm), norm), inv_std) in input_gradients
            .rows_iter_mut()
            .zip(dnormalised.rows_iter())
            .zip(normalised.rows_iter())
            .zip(inv_std_devs)
        {
            let mean_dnorm = dnorm.iter().sum::<NodeValue>() / stride;
            let mean_dnorm_norm = dnorm.iter().zip(norm).map(|(d, n)| d * n).sum::<NodeValue>() / stride;

            for ((dx, &d), &n) in dx.iter_mut().zip(dnorm).zip(norm) {
                *dx = inv_std * (d - mean_dnorm - n * mean_dnorm_norm);
            }
        }

        Ok(input_gradients)
    }

    /// Returns the normalised rows and each row's `1 / sqrt(var + eps)`.
    fn normalise(input: &Linear) -> Result<(Linear, Vec<NodeValue>)> {
        let stride = input.stride() as NodeValue;
        let mut inv_std_devs = Vec::with_capacity(input.count());
        let mut normalised = input.clone();

        for row in normalised.rows_iter_mut() {
            let mean = row.iter().sum::<NodeValue>() / stride;
            let variance = row.iter().map(|x| (x - mean).powi(2)).sum::<NodeValue>() / stride;
            let inv_std = (variance + Self::EPSILON).sqrt().recip();

            row.iter_mut().for_each(|x| *x = (*x - mean) * inv_std);
            inv_std_devs.push(inv_std);
        }

        Ok((normalised, inv_std_devs))
    }

    fn validate_inputs(&self, input: &Linear) -> Result<()> {
        if input.stride() != self.gamma.stride() {
            return Err(anyhow!(
                "mismatched layer norm input size: expected {}, got {}",
                self.gamma.stride(),
                input.stride()
            ));
        }
        Ok(())
    }
}

impl Trainable for LayerNormalization {
    fn parameters(&self) -> Vec<&TrainableLinear> {
        vec![&self.gamma, &self.beta]
    }

    fn apply_gradients<T: OptimizerSource>(&mut self, optimizer: &T) -> Result<()> {
        self.gamma.apply_gradients(optimizer, keys::NORM_GAMMA)?;
        self.beta.apply_gradients(optimizer, keys::NORM_BETA)?;
        Ok(())
    }
}
