use anyhow::{anyhow, Context, Result};
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::ml::RngStrategy;

use super::{
    blocks::{BlockMasks, DecoderBlock},
    dense::Dense,
    layers::{EmbeddingLayer, LayerNormalization, PositionalEmbeddingLayer},
    linear::Linear,
    params::{Trainable, TrainableLinear},
    solver::source::OptimizerSource,
};

/// Dropout masks for one sequence through the whole [`Decoder`].
#[derive(Debug, Clone, Default)]
pub struct DecoderMasks {
    pub blocks: Vec<BlockMasks>,
}

impl DecoderMasks {
    /// Masks that leave every activation untouched.
    pub fn none() -> Self {
        Self::default()
    }
}

/// Decoder-only transformer mapping token ids to next-token logits at every position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decoder {
    token_embedding: EmbeddingLayer,
    position_embedding: PositionalEmbeddingLayer,
    blocks: Vec<DecoderBlock>,
    final_norm: LayerNormalization,
    output_dense: Dense,
    sequence_len: usize,
}

impl Decoder {
    pub fn new_builder(
        sequence_len: usize,
        model_dimension: usize,
        vocab_size: usize,
    ) -> builder::DecoderBuilder {
        builder::DecoderBuilder::new(sequence_len, model_dimension, vocab_size)
    }

    /// Returns `(tokens.len(), vocab_size)` logits.
    pub fn forward<T: AsRef<[usize]>>(&self, tokens: T, masks: &DecoderMasks) -> Result<Linear> {
        let block_inputs = self.forward_blocks(tokens.as_ref(), masks)?;
        let block_output = block_inputs.last().context("missing block output")?;

        let normalised = self.final_norm.forward(block_output)?;
        self.output_dense.forward(&normalised)
    }

    /// Queues gradients on every parameter for `dlogits`, the loss gradient with respect
    /// to the logits of a previous `forward` with the same tokens and masks.
    pub fn backward<T: AsRef<[usize]>>(
        &self,
        tokens: T,
        masks: &DecoderMasks,
        output_gradients: &Linear,
    ) -> Result<()> {
        let tokens = tokens.as_ref();

        // forward pass
        let block_inputs = self.forward_blocks(tokens, masks)?;
        let block_output = block_inputs.last().context("missing block output")?;
        let normalised = self.final_norm.forward(block_output)?;

        // backward pass
        let d_normalised = self.output_dense.backward(&normalised, output_gradients)?;
        let mut d_block_output = self.final_norm.backward(block_output, &d_normalised)?;

        for (idx, (block, inputs)) in self.blocks.iter().zip(&block_inputs).enumerate().rev() {
            let block_masks = masks.blocks.get(idx).cloned().unwrap_or_default();
            d_block_output = block.backward_with_masks(inputs, &block_masks, &d_block_output)?;
        }

        let d_embeddings = d_block_output;
        self.token_embedding.backward(tokens, &d_embeddings)?;
        self.position_embedding
            .backward(0, tokens.len(), &d_embeddings)?;

        Ok(())
    }

    /// Draws dropout masks for one `sequence_len` long pass through every block.
    pub fn sample_masks(&self, sequence_len: usize, rng: &RngStrategy) -> DecoderMasks {
        DecoderMasks {
            blocks: self
                .blocks
                .iter()
                .map(|block| block.sample_masks(sequence_len, rng))
                .collect(),
        }
    }

    pub fn sequence_len(&self) -> usize {
        self.sequence_len
    }

    pub fn vocab_size(&self) -> usize {
        self.token_embedding.vocab_size()
    }

    pub fn model_dimension(&self) -> usize {
        self.token_embedding.model_dimensions()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Attention heads per block, or `None` when the blocks disagree or there are none.
    pub fn head_count(&self) -> Option<usize> {
        let mut counts = self.blocks.iter().map(|block| block.head_count()).dedup();
        match (counts.next(), counts.next()) {
            (Some(count), None) => Some(count),
            _ => None,
        }
    }

    /// Embeds the tokens and returns the input to each block followed by the last output.
    fn forward_blocks(&self, tokens: &[usize], masks: &DecoderMasks) -> Result<Vec<Linear>> {
        if tokens.is_empty() {
            return Err(anyhow!("no tokens provided to decoder"));
        }
        if tokens.len() > self.sequence_len {
            return Err(anyhow!(
                "sequence of {} exceeds context length {}",
                tokens.len(),
                self.sequence_len
            ));
        }

        let token_embeddings = self.token_embedding.forward(tokens)?;
        let position_embeddings = self.position_embedding.forward(0, tokens.len())?;
        let embeddings = token_embeddings
            .iter()
            .add(position_embeddings.iter())
            .collect();

        let mut block_inputs = vec![embeddings];
        for (idx, block) in self.blocks.iter().enumerate() {
            let block_input = block_inputs.last().context("missing block input")?;
            let block_output = match masks.blocks.get(idx) {
                Some(block_masks) => block.forward_with_masks(block_input, block_masks)?,
                None => block.forward(block_input)?,
            };
            block_inputs.push(block_output);
        }

        Ok(block_inputs)
    }
}

impl Trainable for Decoder {
    fn parameters(&self) -> Vec<&TrainableLinear> {
        let mut params = self.token_embedding.parameters();
        params.extend(self.position_embedding.parameters());
        params.extend(self.blocks.iter().flat_map(|x| x.parameters()));
        params.extend(self.final_norm.parameters());
        params.extend(self.output_dense.parameters());
        params
    }

    fn apply_gradients<T: OptimizerSource>(&mut self, optimizer: &T) -> Result<()> {
        let block_scope = optimizer.with_scope("blocks");
        for (idx, block) in self.blocks.iter_mut().enumerate() {
            block.apply_gradients(&block_scope.with_index(idx))?;
        }
        self.token_embedding
            .apply_gradients(&optimizer.with_scope("token_embedding"))?;
        self.position_embedding
            .apply_gradients(&optimizer.with_scope("position_embedding"))?;
        self.final_norm
            .apply_gradients(&optimizer.with_scope("final_norm"))?;
        self.output_dense
            .apply_gradients(&optimizer.with_scope("output"))?;

        Ok(())
    }
}

pub mod builder {
    use anyhow::{anyhow, Result};

    use crate::ml::{layer::LayerInitStrategy, NodeValue, RngStrategy};

    use super::{
        super::{
            blocks::DecoderBlock,
            dense::Dense,
            layers::{EmbeddingLayer, LayerNormalization, PositionalEmbeddingLayer},
        },
        Decoder,
    };

    #[derive(Debug, Clone)]
    pub struct DecoderBuilder {
        sequence_len: usize,
        model_dimension: usize,
        vocab_size: usize,
        head_count: usize,
        block_count: usize,
        rng: RngStrategy,
        init_strategy: LayerInitStrategy,
        feed_forward_hidden_dimension: usize,
        dropout_rate: NodeValue,
    }

    impl DecoderBuilder {
        pub fn new(sequence_len: usize, model_dimension: usize, vocab_size: usize) -> Self {
            Self {
                sequence_len,
                model_dimension,
                vocab_size,
                head_count: 4,
                block_count: 4,
                rng: Default::default(),
                init_strategy: LayerInitStrategy::Normal { std: 0.02 },
                feed_forward_hidden_dimension: model_dimension * 4,
                dropout_rate: 0.2,
            }
        }

        pub fn build(self) -> Result<Decoder> {
            if self.head_count == 0 || self.model_dimension % self.head_count != 0 {
                return Err(anyhow!(
                    "head_count is not a factor of model_dimension={}",
                    self.model_dimension
                ));
            }
            if self.sequence_len == 0 || self.vocab_size == 0 {
                return Err(anyhow!("decoder requires a non-empty context and vocabulary"));
            }

            let blocks = std::iter::repeat_with(|| {
                DecoderBlock::new_builder(self.sequence_len, self.model_dimension, self.head_count)
                    .with_rng(self.rng.clone())
                    .with_init_strategy(self.init_strategy.clone())
                    .with_feed_forward_hidden_dimension(self.feed_forward_hidden_dimension)
                    .with_dropout_rate(self.dropout_rate)
                    .build()
            })
            .take(self.block_count)
            .collect::<Result<Vec<_>>>()?;

            let token_embedding = EmbeddingLayer::new(
                self.model_dimension,
                self.vocab_size,
                &self.init_strategy,
                &self.rng,
            );
            let position_embedding = PositionalEmbeddingLayer::new(
                self.model_dimension,
                self.sequence_len,
                &self.init_strategy,
                &self.rng,
            );
            let final_norm = LayerNormalization::new(self.model_dimension);
            let output_dense = Dense::new(
                self.model_dimension,
                self.vocab_size,
                &self.init_strategy,
                &self.rng,
            );

            Ok(Decoder {
                token_embedding,
                position_embedding,
                blocks,
                final_norm,
                output_dense,
                sequence_len: self.sequence_len,
            })
        }

        pub fn with_head_count(mut self, head_count: usize) -> Self {
            self.head_count = head_count;
            self
        }

        pub fn with_block_count(mut self, block_count: usize) -> Self {
            self.block_count = block_count;
            self
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

    use crate::ml::{layer::LayerInitStrategy, transformer::solver, NodeValue};

    use super::*;

    fn new_decoder(rng: &RngStrategy, dropout_rate: NodeValue) -> Decoder {
        Decoder::new_builder(4, 8, 5)
            .with_head_count(2)
            .with_block_count(2)
            .with_dropout_rate(dropout_rate)
            .with_rng(rng.clone())
            .build()
            .unwrap()
    }

    #[test]
    fn decoder_outputs_logits_per_position() {
        let rng = RngStrategy::testable(1234);
        let decoder = new_decoder(&rng, 0.0);

        let logits = decoder.forward([0, 3, 4], &DecoderMasks::none()).unwrap();

        assert_eq!(3, logits.count());
        assert_eq!(5, logits.stride());
        assert!(logits.is_finite());
    }

    #[test]
    fn decoder_rejects_invalid_inputs() {
        let rng = RngStrategy::testable(1234);
        let decoder = new_decoder(&rng, 0.0);

        assert!(decoder.forward(Vec::<usize>::new(), &DecoderMasks::none()).is_err());
        assert!(decoder.forward([0, 1, 2, 3, 4], &DecoderMasks::none()).is_err());
        assert!(decoder.forward([5], &DecoderMasks::none()).is_err());
    }

    #[test]
    fn decoder_rejects_indivisible_head_count() {
        let result = Decoder::new_builder(4, 6, 5).with_head_count(4).build();
        assert!(result
            .unwrap_err()
            .to_string()
            .starts_with("head_count is not a factor of model_dimension"));
    }

    #[test]
    fn decoder_logits_are_causal() {
        let rng = RngStrategy::testable(1234);
        let decoder = new_decoder(&rng, 0.0);

        let logits = decoder.forward([1, 2, 3, 0], &DecoderMasks::none()).unwrap();
        let altered = decoder.forward([1, 2, 3, 4], &DecoderMasks::none()).unwrap();

        for i in 0..3 {
            assert_eq!(logits.row(i), altered.row(i), "row {i} saw the future");
        }
        assert_ne!(logits.row(3), altered.row(3));
    }

    #[test]
    fn decoder_masks_cover_every_block() {
        let rng = RngStrategy::testable(1234);
        let decoder = new_decoder(&rng, 0.5);
        let masks = decoder.sample_masks(3, &rng);

        assert_eq!(decoder.block_count(), masks.blocks.len());

        let masked = decoder.forward([1, 2, 3], &masks).unwrap();
        let unmasked = decoder.forward([1, 2, 3], &DecoderMasks::none()).unwrap();
        assert_ne!(masked, unmasked);
    }

    #[test]
    fn decoder_backward_queues_gradients_for_every_parameter() {
        let rng = RngStrategy::testable(1234);
        let decoder = new_decoder(&rng, 0.0);
        let tokens = [1, 2, 3];

        let logits = decoder.forward(tokens, &DecoderMasks::none()).unwrap();
        let dlogits = Linear::with_value(logits.count(), logits.stride(), 0.1);
        decoder
            .backward(tokens, &DecoderMasks::none(), &dlogits)
            .unwrap();

        assert!(decoder
            .parameters()
            .iter()
            .all(|x| x.pending_gradients().is_some()));

        decoder.zero_gradients();
        assert!(decoder
            .parameters()
            .iter()
            .all(|x| x.pending_gradients().is_none()));
    }

    #[test]
    fn decoder_can_fit_repeated_sequence() {
        let rng = RngStrategy::testable(1234);
        let mut decoder = Decoder::new_builder(4, 8, 5)
            .with_head_count(2)
            .with_block_count(1)
            .with_dropout_rate(0.0)
            .with_init_strategy(LayerInitStrategy::Normal { std: 0.1 })
            .with_rng(rng)
            .build()
            .unwrap();
        let optimizer = solver::AdamOptimizer::new_cache(0.01);

        let inputs = [0, 1, 2, 3];
        let targets = [1, 2, 3, 4];
        let cross_entropy = |logits: &Linear| -> NodeValue {
            let log_probs = logits.iter().log_softmax();
            targets
                .iter()
                .zip(log_probs.rows_iter())
                .map(|(&t, row)| -row[t])
                .sum::<NodeValue>()
                / targets.len() as NodeValue
        };

        let initial_loss = cross_entropy(&decoder.forward(inputs, &DecoderMasks::none()).unwrap());
        for _ in 0..50 {
            let logits = decoder.forward(inputs, &DecoderMasks::none()).unwrap();
            let mut dlogits = logits.iter().softmax();
            for (row, &t) in dlogits.rows_iter_mut().zip(&targets) {
                row[t] -= 1.0;
                row.iter_mut().for_each(|x| *x /= targets.len() as NodeValue);
            }
            decoder
                .backward(inputs, &DecoderMasks::none(), &dlogits)
                .unwrap();
            decoder.apply_gradients(&optimizer).unwrap();
        }
        let final_loss = cross_entropy(&decoder.forward(inputs, &DecoderMasks::none()).unwrap());

        assert!(
            final_loss < initial_loss * 0.5,
            "loss failed to optimise (start={initial_loss:.3}, end={final_loss:.3})"
        );
    }
}
