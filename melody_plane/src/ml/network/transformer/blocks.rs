use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::ml::RngStrategy;

use super::{
    layers::{
        DropoutMask, FeedForwardLayer, LayerNormalization, MultiHeadSelfAttentionLayer,
        SelfAttentionMasks,
    },
    linear::Linear,
    params::{Trainable, TrainableLinear},
    solver::source::OptimizerSource,
};

/// Dropout masks for one pass through a [`DecoderBlock`].
#[derive(Debug, Clone, Default)]
pub struct BlockMasks {
    pub attention: SelfAttentionMasks,
    pub feed_forward: DropoutMask,
}

/// Pre-norm residual block:
/// `x = x + attention(norm(x))`, then `x = x + feed_forward(norm(x))`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecoderBlock {
    self_attention: MultiHeadSelfAttentionLayer,
    network: FeedForwardLayer,
    layer_norm: (LayerNormalization, LayerNormalization),
}

impl DecoderBlock {
    pub fn new(sequence_len: usize, model_dimension: usize, head_count: usize) -> Result<Self> {
        Self::new_builder(sequence_len, model_dimension, head_count).build()
    }

    pub fn new_builder(
        sequence_len: usize,
        model_dimension: usize,
        head_count: usize,
    ) -> builder::DecoderBlockBuilder {
        builder::DecoderBlockBuilder::new(sequence_len, model_dimension, head_count)
    }

    pub fn head_count(&self) -> usize {
        self.self_attention.head_count()
    }

    pub fn forward(&self, inputs: &Linear) -> Result<Linear> {
        self.forward_with_masks(inputs, &BlockMasks::default())
    }

    pub fn forward_with_masks(&self, inputs: &Linear, masks: &BlockMasks) -> Result<Linear> {
        let attention_inputs = self.layer_norm.0.forward(inputs)?;
        let attention_output = self
            .self_attention
            .forward_with_masks(&attention_inputs, &masks.attention)?;
        let residual = attention_output.iter().add(inputs.iter()).collect();

        let ff_inputs = self.layer_norm.1.forward(&residual)?;
        let ff_output = self
            .network
            .forward_with_mask(&ff_inputs, &masks.feed_forward)?;

        Ok(ff_output.iter().add(residual.iter()).collect())
    }

    pub fn backward(&self, inputs: &Linear, output_gradients: &Linear) -> Result<Linear> {
        self.backward_with_masks(inputs, &BlockMasks::default(), output_gradients)
    }

    pub fn backward_with_masks(
        &self,
        inputs: &Linear,
        masks: &BlockMasks,
        output_gradients: &Linear,
    ) -> Result<Linear> {
        // forward pass
        let attention_inputs = self.layer_norm.0.forward(inputs)?;
        let attention_output = self
            .self_attention
            .forward_with_masks(&attention_inputs, &masks.attention)?;
        let residual: Linear = attention_output.iter().add(inputs.iter()).collect();
        let ff_inputs = self.layer_norm.1.forward(&residual)?;

        // backward pass
        let d_ff_inputs = self.network.backward_with_mask(
            &ff_inputs,
            &masks.feed_forward,
            output_gradients,
        )?;
        let d_residual_norm = self.layer_norm.1.backward(&residual, &d_ff_inputs)?;
        let d_residual: Linear = output_gradients
            .iter()
            .add(d_residual_norm.iter())
            .collect();

        let d_attention_inputs = self.self_attention.backward_with_masks(
            &attention_inputs,
            &masks.attention,
            &d_residual,
        )?;
        let d_inputs_norm = self.layer_norm.0.backward(inputs, &d_attention_inputs)?;

        Ok(d_residual.iter().add(d_inputs_norm.iter()).collect())
    }

    /// Draws every dropout mask this block needs for a `sequence_len` long pass.
    pub fn sample_masks(&self, sequence_len: usize, rng: &RngStrategy) -> BlockMasks {
        BlockMasks {
            attention: self.self_attention.sample_masks(sequence_len, rng),
            feed_forward: self.network.sample_mask(sequence_len, rng),
        }
    }
}

impl Trainable for DecoderBlock {
    fn parameters(&self) -> Vec<&TrainableLinear> {
        let mut params = self.layer_norm.0.parameters();
        params.extend(self.self_attention.parameters());
        params.extend(self.layer_norm.1.parameters());
        params.extend(self.network.parameters());
        params
    }

    fn apply_gradients<T: OptimizerSource>(&mut self, optimizer: &T) -> Result<()> {
        self.self_attention
            .apply_gradients(&optimizer.with_scope("self_attention"))?;
        self.network
            .apply_gradients(&optimizer.with_scope("feed_forward"))?;
        self.layer_norm
            .0
            .apply_gradients(&optimizer.with_scope("norm_0"))?;
        self.layer_norm
            .1
            .apply_gradients(&optimizer.with_scope("norm_1"))?;
        Ok(())
    }
}

pub mod builder {
    use anyhow::{anyhow, Result};

    use crate::ml::{layer::LayerInitStrategy, NodeValue, RngStrategy};

    use super::{
        super::layers::{FeedForwardLayer, LayerNormalization, MultiHeadSelfAttentionLayer},
        DecoderBlock,
    };

    #[derive(Debug, Clone)]
    pub struct DecoderBlockBuilder {
        sequence_len: usize,
        model_dimension: usize,
        head_count: usize,
        rng: RngStrategy,
        init_strategy: LayerInitStrategy,
        feed_forward_hidden_dimension: usize,
        dropout_rate: NodeValue,
    }

    impl DecoderBlockBuilder {
        pub fn new(sequence_len: usize, model_dimension: usize, head_count: usize) -> Self {
            Self {
                sequence_len,
                model_dimension,
                head_count,
                rng: Default::default(),
                init_strategy: LayerInitStrategy::Normal { std: 0.02 },
                feed_forward_hidden_dimension: model_dimension * 4,
                dropout_rate: 0.2,
            }
        }

        pub fn build(self) -> Result<DecoderBlock> {
            if self.head_count == 0 || self.model_dimension % self.head_count != 0 {
                return Err(anyhow!("head_count is not a factor of model_dimension"));
            }

            let self_attention = MultiHeadSelfAttentionLayer::new(
                self.sequence_len,
                self.model_dimension,
                self.head_count,
                self.dropout_rate,
                &self.init_strategy,
                &self.rng,
            );
            let network = FeedForwardLayer::new(
                self.model_dimension,
                self.feed_forward_hidden_dimension,
                self.dropout_rate,
                &self.init_strategy,
                &self.rng,
            );
            let layer_norm1 = LayerNormalization::new(self.model_dimension);
            let layer_norm2 = LayerNormalization::new(self.model_dimension);

            Ok(DecoderBlock {
                self_attention,
                network,
                layer_norm: (layer_norm1, layer_norm2),
            })
        }

        pub fn with_rng(mut self, rng: RngStrategy) -> Self {
            self.rng = rng;
            self
        }

        pub fn with_init_strategy(mut self, init_strategy: LayerInitStrategy) -> Self {
            self.init_strategy = init_strategy;
            self
        }

        pub fn with_feed_forward_hidden_dimension(mut self, hidden_dimension: usize) -> Self {
            self.feed_forward_hidden_dimension = hidden_dimension;
            self
        }

        pub fn with_dropout_rate(mut self, dropout_rate: NodeValue) -> Self {
            self.dropout_rate = dropout_rate;
            self
        }
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use crate::ml::{
        layer::LayerInitStrategy,
        transformer::{
            solver,
            tests::helpers::{assert_input_gradients, assert_optimisation_converges, new_linear},
        },
    };

    use super::*;

    #[test]
    fn decoder_block_can_process_inputs() {
        let seq_len = 3;
        let embed_dim = 12;
        let head_count = 3;

        let rng = RngStrategy::testable(1234);
        let decoder_block = DecoderBlock::new_builder(seq_len, embed_dim, head_count)
            .with_rng(rng.clone())
            .build()
            .unwrap();

        let inputs = new_linear(seq_len, embed_dim, &rng);
        let output = decoder_block.forward(&inputs).unwrap();

        assert_eq!(output.count(), seq_len);
        assert_eq!(output.stride(), embed_dim);
        assert!(output.is_finite());
    }

    #[test]
    fn decoder_block_rejects_indivisible_head_count() {
        let result = DecoderBlock::new(3, 10, 3);
        let err = result.unwrap_err();
        assert_eq!("head_count is not a factor of model_dimension", err.to_string());
    }

    #[test]
    fn decoder_block_samples_masks_for_each_head() {
        let rng = RngStrategy::testable(1234);
        let decoder_block = DecoderBlock::new_builder(4, 8, 2)
            .with_rng(rng.clone())
            .with_dropout_rate(0.5)
            .build()
            .unwrap();

        let masks = decoder_block.sample_masks(3, &rng);
        assert_eq!(2, masks.attention.heads.len());
        let head_mask = masks.attention.heads[0].as_ref().unwrap();
        assert_eq!((3, 3), (head_mask.count(), head_mask.stride()));
        let ff_mask = masks.feed_forward.as_ref().unwrap();
        assert_eq!((3, 8), (ff_mask.count(), ff_mask.stride()));

        let no_dropout = DecoderBlock::new_builder(4, 8, 2)
            .with_dropout_rate(0.0)
            .build()
            .unwrap();
        let masks = no_dropout.sample_masks(3, &rng);
        assert!(masks.feed_forward.is_none());
        assert!(masks.attention.heads.iter().all(Option::is_none));
    }

    #[test]
    fn decoder_block_can_compute_valid_gradients() {
        let seq_len = 3;
        let embed_dim = 6;
        let head_count = 2;

        assert_input_gradients(
            &move |rng| {
                let decoder_block = DecoderBlock::new_builder(seq_len, embed_dim, head_count)
                    .with_rng(rng.clone())
                    .with_init_strategy(LayerInitStrategy::Normal { std: 0.3 })
                    .with_dropout_rate(0.0)
                    .build()
                    .unwrap();
                let inputs = new_linear(seq_len, embed_dim, &rng);
                let target = new_linear(seq_len, embed_dim, &rng);
                (decoder_block, inputs, target)
            },
            &move |decoder_block, inputs| decoder_block.forward(inputs).unwrap(),
            &move |decoder_block, inputs, dloss| decoder_block.backward(inputs, &dloss).unwrap(),
        );
    }

    #[test]
    fn decoder_block_can_compute_valid_gradients_with_dropout() {
        let seq_len = 3;
        let embed_dim = 4;
        let head_count = 2;

        let mask_rng = RngStrategy::testable(42);
        let template = DecoderBlock::new_builder(seq_len, embed_dim, head_count)
            .with_dropout_rate(0.3)
            .build()
            .unwrap();
        let masks = template.sample_masks(seq_len, &mask_rng);
        let forward_masks = masks.clone();

        assert_input_gradients(
            &move |rng| {
                let decoder_block = DecoderBlock::new_builder(seq_len, embed_dim, head_count)
                    .with_rng(rng.clone())
                    .with_init_strategy(LayerInitStrategy::Normal { std: 0.3 })
                    .with_dropout_rate(0.3)
                    .build()
                    .unwrap();
                let inputs = new_linear(seq_len, embed_dim, &rng);
                let target = new_linear(seq_len, embed_dim, &rng);
                (decoder_block, inputs, target)
            },
            &move |decoder_block, inputs| {
                decoder_block
                    .forward_with_masks(inputs, &forward_masks)
                    .unwrap()
            },
            &move |decoder_block, inputs, dloss| {
                decoder_block
                    .backward_with_masks(inputs, &masks, &dloss)
                    .unwrap()
            },
        );
    }

    #[test]
    fn decoder_block_can_optimise() {
        let seq_len = 3;
        let embed_dim = 12;
        let head_count = 3;
        let optimizer = solver::AdamOptimizer::new_cache(0.001);

        assert_optimisation_converges(
            &move |rng| {
                let decoder_block = DecoderBlock::new_builder(seq_len, embed_dim, head_count)
                    .with_rng(rng.clone())
                    .with_dropout_rate(0.0)
                    .build()
                    .unwrap();
                let inputs = new_linear(seq_len, embed_dim, &rng);
                let target = new_linear(seq_len, embed_dim, &rng);
                (decoder_block, inputs, target)
            },
            &move |decoder_block, inputs| decoder_block.forward(inputs).unwrap(),
            &move |decoder_block, inputs, dloss| {
                let grads = decoder_block.backward(inputs, &dloss).unwrap();
                decoder_block.apply_gradients(&optimizer).unwrap();
                grads
            },
            50,
        );
    }
}
