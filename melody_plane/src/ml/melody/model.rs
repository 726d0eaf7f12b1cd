use anyhow::{anyhow, Context, Result};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::ml::{
    layer::{LayerInitStrategy, LayerValues},
    transformer::{
        decoder::{Decoder, DecoderMasks},
        linear::Linear,
        params::Trainable,
        solver::source::OptimizerSource,
    },
    NodeValue, RngStrategy, SamplingRng,
};

use super::{
    metrics, Backend, Batch, LabelSmoothedLoss, MelodyConfig, MelodyError, MelodyMetrics, Vocab,
};

/// Logits, mean loss and validation metrics for one batch scored without dropout.
#[derive(Debug, Clone)]
pub struct BatchEvaluation {
    pub logits: Vec<Linear>,
    pub loss: NodeValue,
    pub metrics: MelodyMetrics,
}

/// Character level melody generator: a [`Decoder`] paired with the vocabulary it was
/// trained on and the configuration that shaped it.
#[derive(Debug, Serialize, Deserialize)]
pub struct MelodyModel {
    network: Decoder,
    vocab: Vocab,
    config: MelodyConfig,
    loss: LabelSmoothedLoss,
    rng: RngStrategy,
    backend: Backend,
}

impl MelodyModel {
    pub fn new(config: &MelodyConfig, vocab: Vocab, rng: RngStrategy) -> Result<Self> {
        config.validate()?;
        if vocab.is_empty() {
            Err(MelodyError::InvalidConfig("vocabulary is empty".to_string()))?;
        }

        let network = Decoder::new_builder(config.block_size, config.embedding_dim, vocab.len())
            .with_head_count(config.head_count)
            .with_block_count(config.block_count)
            .with_dropout_rate(config.dropout_rate)
            .with_feed_forward_hidden_dimension(config.embedding_dim * 4)
            .with_init_strategy(LayerInitStrategy::Normal {
                std: config.init_std,
            })
            .with_rng(rng.clone())
            .build()?;

        let model = Self {
            network,
            vocab,
            config: config.clone(),
            loss: LabelSmoothedLoss::new(config.label_smoothing)?,
            rng,
            backend: config.backend.resolve(),
        };

        debug!(
            "created melody model with {} parameters over {} symbols",
            model.network.parameter_count(),
            model.vocab.len()
        );
        Ok(model)
    }

    /// Per-sequence `(block_size, vocab_size)` logits for every input of the batch.
    pub fn forward_logits(&self, batch: &Batch) -> Result<Vec<Linear>> {
        batch
            .inputs()
            .map(|inputs| self.network.forward(inputs, &DecoderMasks::none()))
            .collect()
    }

    /// Logits and mean label-smoothed loss for the batch, without dropout.
    pub fn score(&self, batch: &Batch) -> Result<(Vec<Linear>, NodeValue)> {
        let logits = self.forward_logits(batch)?;
        let losses = logits
            .iter()
            .zip(batch.targets())
            .map(|(logits, targets)| self.loss.loss(logits, targets))
            .collect::<Result<Vec<_>>>()?;

        Ok((logits, LayerValues::new(losses).ave()))
    }

    /// Scores the batch and compares greedy argmax predictions against the targets.
    pub fn evaluate_batch(&self, batch: &Batch) -> Result<BatchEvaluation> {
        let (logits, loss) = self.score(batch)?;

        let perplexity = metrics::perplexity(logits.iter().zip(batch.targets()))?;
        let predictions = logits
            .iter()
            .map(|x| self.vocab.decode(&greedy_decode(x)?))
            .collect::<Result<Vec<_>>>()?;
        let targets = batch
            .targets()
            .map(|x| self.vocab.decode(x))
            .collect::<Result<Vec<_>>>()?;

        let metrics = MelodyMetrics {
            perplexity,
            levenshtein: metrics::mean_levenshtein(&predictions, &targets)?,
            jaccard: metrics::mean_jaccard(&predictions, &targets)?,
        };

        Ok(BatchEvaluation {
            logits,
            loss,
            metrics,
        })
    }

    /// One optimisation step over the batch, returning its mean loss. A non-finite loss
    /// is returned without touching the parameters. An update the optimizer rejects as
    /// non-finite is reported as a NaN loss.
    #[instrument(level = "info", name = "melody_train_step", skip_all)]
    pub fn train_step<O: OptimizerSource>(&mut self, batch: &Batch, optimizer: &O) -> Result<NodeValue> {
        if batch.is_empty() {
            return Err(anyhow!("no sequences provided to train step"));
        }
        self.network.zero_gradients();

        let masks = batch
            .inputs()
            .map(|inputs| self.network.sample_masks(inputs.len(), &self.rng))
            .collect_vec();
        let samples = batch.iter().zip(&masks).collect_vec();
        let scale = 1.0 / batch.len() as NodeValue;

        let model = &*self;
        let losses: Vec<NodeValue> = match self.backend {
            #[cfg(feature = "threadpool")]
            Backend::ThreadPool => {
                use rayon::prelude::*;
                samples
                    .par_iter()
                    .map(|&((inputs, targets), masks)| {
                        model.train_sample(inputs, targets, masks, scale)
                    })
                    .collect::<Result<_>>()?
            }
            _ => samples
                .iter()
                .map(|&((inputs, targets), masks)| model.train_sample(inputs, targets, masks, scale))
                .collect::<Result<_>>()?,
        };

        let loss = LayerValues::new(losses).ave();
        if !loss.is_finite() {
            self.network.zero_gradients();
            return Ok(loss);
        }

        if let Err(err) = self.network.apply_gradients(optimizer) {
            warn!("optimizer rejected update at loss = {loss}: {err}");
            self.network.zero_gradients();
            return Ok(NodeValue::NAN);
        }
        Ok(loss)
    }

    fn train_sample(
        &self,
        inputs: &[usize],
        targets: &[usize],
        masks: &DecoderMasks,
        scale: NodeValue,
    ) -> Result<NodeValue> {
        let logits = self.network.forward(inputs, masks)?;
        let (loss, dlogits) = self.loss.loss_and_gradients(&logits, targets, scale)?;
        self.network.backward(inputs, masks, &dlogits)?;
        Ok(loss)
    }

    /// Grows `seed` by `token_count` sampled tokens. Each step only sees the last
    /// `block_size` tokens and samples from `softmax(logits / temperature)`.
    pub fn generate(
        &self,
        seed: &[usize],
        token_count: usize,
        temperature: NodeValue,
    ) -> Result<Vec<usize>> {
        if seed.is_empty() {
            return Err(anyhow!("generation requires at least one seed token"));
        }
        if !(temperature > 0.0 && temperature.is_finite()) {
            Err(MelodyError::InvalidConfig(format!(
                "temperature={temperature} must be positive"
            )))?;
        }

        let mut sequence = seed.to_vec();
        for _ in 0..token_count {
            let context_start = sequence.len().saturating_sub(self.config.block_size);
            let logits = self
                .network
                .forward(&sequence[context_start..], &DecoderMasks::none())?;

            let last_row = logits
                .rows_iter()
                .last()
                .context("decoder returned no logits")?;
            let probabilities = Linear::from_iter(last_row.len(), last_row.iter().copied())?
                .iter()
                .multiply_scalar(1.0 / temperature)
                .softmax();

            let token = self
                .rng
                .sample_uniform(probabilities.row(0).context("missing probability row")?)?;
            sequence.push(token);
        }

        Ok(sequence)
    }

    pub fn generate_text(
        &self,
        seed_text: &str,
        token_count: usize,
        temperature: NodeValue,
    ) -> Result<String> {
        let seed = self.vocab.encode(seed_text)?;
        let sequence = self.generate(&seed, token_count, temperature)?;
        self.vocab.decode(&sequence)
    }

    pub fn snapshot(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn snapshot_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Reloads a model written by [`MelodyModel::snapshot`], rejecting snapshots whose
    /// parameters disagree with their own vocabulary or configuration.
    pub fn from_snapshot(json: &str) -> Result<Self> {
        let mut model: Self =
            serde_json::from_str(json).context("failed to parse melody model snapshot")?;

        let checks = [
            ("vocab size", model.vocab.len(), model.network.vocab_size()),
            (
                "block_size",
                model.config.block_size,
                model.network.sequence_len(),
            ),
            (
                "embedding_dim",
                model.config.embedding_dim,
                model.network.model_dimension(),
            ),
            (
                "block_count",
                model.config.block_count,
                model.network.block_count(),
            ),
            (
                "head_count",
                model.config.head_count,
                model.network.head_count().unwrap_or(0),
            ),
        ];
        for (name, expected, actual) in checks {
            if expected != actual {
                Err(MelodyError::InvalidConfig(format!(
                    "snapshot {name}={expected} does not match parameters of {actual}"
                )))?;
            }
        }

        model.config.validate()?;
        model.backend = model.config.backend.resolve();
        Ok(model)
    }

    pub fn vocab(&self) -> &Vocab {
        &self.vocab
    }

    pub fn config(&self) -> &MelodyConfig {
        &self.config
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn parameter_count(&self) -> usize {
        self.network.parameter_count()
    }
}

fn greedy_decode(logits: &Linear) -> Result<Vec<usize>> {
    logits
        .rows_iter()
        .map(|row| {
            LayerValues::from(row)
                .position_max()
                .context("failed to perform argmax on logits")
        })
        .collect()
}
