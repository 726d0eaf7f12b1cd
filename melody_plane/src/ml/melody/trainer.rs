use anyhow::Result;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::ml::{
    layer::LayerValues,
    transformer::solver::{AdamOptimizer, AdamOptimizerCache},
    NodeValue, RngStrategy,
};

use super::{
    BatchSampler, EncodedCorpus, MelodyConfig, MelodyError, MelodyMetrics, MelodyModel, Partition,
};

/// Losses and validation metrics estimated before the step at `iteration`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub iteration: usize,
    pub train_loss: NodeValue,
    pub val_loss: NodeValue,
    pub metrics: MelodyMetrics,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainerState {
    pub iteration: usize,
    pub checkpoints: Vec<Checkpoint>,
    pub train_loss_history: Vec<NodeValue>,
}

/// Drives a [`MelodyModel`] through `max_iters` optimisation steps, evaluating at the
/// first step, every `eval_interval` steps and the last step.
pub struct Trainer {
    config: MelodyConfig,
    corpus: EncodedCorpus,
    sampler: BatchSampler,
    rng: RngStrategy,
    optimizer: AdamOptimizerCache,
    state: TrainerState,
}

impl Trainer {
    pub fn new(config: &MelodyConfig, corpus: EncodedCorpus, rng: RngStrategy) -> Result<Self> {
        config.validate()?;
        let sampler = BatchSampler::new(config);
        sampler.check_partition(corpus.partition(Partition::Train))?;
        sampler.check_partition(corpus.partition(Partition::Validation))?;

        Ok(Self {
            config: config.clone(),
            corpus,
            sampler,
            rng,
            optimizer: AdamOptimizer::new_cache(config.learn_rate),
            state: TrainerState::default(),
        })
    }

    /// Runs the remaining iterations. `on_checkpoint` sees every evaluation as soon as it
    /// is taken, before the following step.
    pub fn run<F>(&mut self, model: &mut MelodyModel, mut on_checkpoint: F) -> Result<&TrainerState>
    where
        F: FnMut(&Checkpoint, &MelodyModel) -> Result<()>,
    {
        while self.state.iteration < self.config.max_iters {
            if self.is_checkpoint(self.state.iteration) {
                let checkpoint = self.evaluate(model)?;
                on_checkpoint(&checkpoint, model)?;
                self.state.checkpoints.push(checkpoint);
            }
            self.step(model)?;
        }

        Ok(&self.state)
    }

    /// Samples one training batch and applies a single optimizer update.
    pub fn step(&mut self, model: &mut MelodyModel) -> Result<NodeValue> {
        let batch = self
            .sampler
            .sample(self.corpus.partition(Partition::Train), &self.rng)?;
        let loss = model.train_step(&batch, &self.optimizer)?;

        if !loss.is_finite() {
            Err(MelodyError::TrainingDiverged {
                iteration: self.state.iteration,
                loss,
            })?;
        }

        self.state.train_loss_history.push(loss);
        self.state.iteration += 1;
        Ok(loss)
    }

    /// Mean loss over `eval_iters` fresh batches per partition. The validation batches
    /// also give the averaged melody metrics.
    #[instrument(level = "info", name = "melody_evaluate", skip_all)]
    pub fn evaluate(&self, model: &MelodyModel) -> Result<Checkpoint> {
        let train_losses = (0..self.config.eval_iters)
            .map(|_| {
                let batch = self
                    .sampler
                    .sample(self.corpus.partition(Partition::Train), &self.rng)?;
                Ok(model.score(&batch)?.1)
            })
            .collect::<Result<Vec<_>>>()?;

        let evaluations = (0..self.config.eval_iters)
            .map(|_| {
                let batch = self
                    .sampler
                    .sample(self.corpus.partition(Partition::Validation), &self.rng)?;
                model.evaluate_batch(&batch)
            })
            .collect::<Result<Vec<_>>>()?;

        let val_losses = evaluations.iter().map(|x| x.loss).collect_vec();
        let metrics = MelodyMetrics::mean(&evaluations.iter().map(|x| x.metrics).collect_vec())?;

        let checkpoint = Checkpoint {
            iteration: self.state.iteration,
            train_loss: LayerValues::new(train_losses).ave(),
            val_loss: LayerValues::new(val_losses).ave(),
            metrics,
        };
        debug!("evaluated checkpoint {checkpoint:?}");
        Ok(checkpoint)
    }

    pub fn is_checkpoint(&self, iteration: usize) -> bool {
        iteration % self.config.eval_interval == 0 || iteration + 1 == self.config.max_iters
    }

    pub fn state(&self) -> &TrainerState {
        &self.state
    }

    pub fn sampler(&self) -> &BatchSampler {
        &self.sampler
    }

    pub fn corpus(&self) -> &EncodedCorpus {
        &self.corpus
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use crate::ml::melody::{AugmentConfig, CorpusPreparer, Vocab};

    use super::*;

    fn test_config() -> MelodyConfig {
        MelodyConfig {
            block_size: 2,
            embedding_dim: 8,
            head_count: 2,
            block_count: 1,
            dropout_rate: 0.1,
            batch_size: 4,
            eval_interval: 4,
            eval_iters: 2,
            max_iters: 10,
            learn_rate: 0.01,
            init_std: 0.1,
            ..Default::default()
        }
    }

    fn stretched_corpus(rng: &RngStrategy) -> (Vocab, EncodedCorpus) {
        let augment = AugmentConfig {
            stretch_factor: 3,
            ..Default::default()
        };
        let preparer = CorpusPreparer::new(&augment, rng.fork()).unwrap();
        let lines = preparer.augment(["AABR", "GGR"]);
        let vocab = Vocab::from_corpus(&lines);
        let corpus = EncodedCorpus::encode(&vocab, &lines).unwrap();
        (vocab, corpus)
    }

    fn train_once(seed: u32) -> (TrainerState, NodeValue) {
        let config = test_config();
        let rng = RngStrategy::testable(seed);
        let (vocab, corpus) = stretched_corpus(&rng);

        let mut model = MelodyModel::new(&config, vocab, rng.fork()).unwrap();
        let mut trainer = Trainer::new(&config, corpus, rng.fork()).unwrap();
        let state = trainer.run(&mut model, |_, _| Ok(())).unwrap().clone();
        let final_loss = trainer.evaluate(&model).unwrap().train_loss;

        (state, final_loss)
    }

    #[test]
    fn trainer_end_to_end_is_reproducible() {
        let (first_state, first_loss) = train_once(1337);
        let (second_state, second_loss) = train_once(1337);

        assert!(first_loss.is_finite());
        assert_eq!(first_loss, second_loss);
        assert_eq!(first_state, second_state);
        assert_eq!(10, first_state.iteration);
        assert_eq!(10, first_state.train_loss_history.len());
    }

    #[test]
    fn trainer_batches_stay_within_vocab() {
        let rng = RngStrategy::testable(1234);
        let (vocab, corpus) = stretched_corpus(&rng);
        assert_eq!(&['A', 'B', 'G', 'R'], vocab.symbols());

        let trainer = Trainer::new(&test_config(), corpus, rng.fork()).unwrap();
        for partition in [Partition::Train, Partition::Validation] {
            for _ in 0..20 {
                let batch = trainer
                    .sampler()
                    .sample(trainer.corpus().partition(partition), &rng)
                    .unwrap();
                assert!(batch.inputs().chain(batch.targets()).flatten().all(|&x| x <= 3));
            }
        }
    }

    #[test]
    fn trainer_checkpoints_first_interval_and_last_iterations() {
        let config = test_config();
        let rng = RngStrategy::testable(99);
        let (vocab, corpus) = stretched_corpus(&rng);
        let mut model = MelodyModel::new(&config, vocab, rng.fork()).unwrap();
        let mut trainer = Trainer::new(&config, corpus, rng.fork()).unwrap();

        let mut seen = vec![];
        let state = trainer
            .run(&mut model, |checkpoint, _| {
                seen.push(checkpoint.iteration);
                Ok(())
            })
            .unwrap();

        assert_eq!(vec![0, 4, 8, 9], seen);
        assert_eq!(seen, state.checkpoints.iter().map(|x| x.iteration).collect_vec());
        for checkpoint in &state.checkpoints {
            assert!(checkpoint.train_loss.is_finite());
            assert!(checkpoint.val_loss.is_finite());
            assert!(checkpoint.metrics.perplexity >= 1.0);
            assert!((0.0..=1.0).contains(&checkpoint.metrics.jaccard));
        }
    }

    #[test]
    fn trainer_stops_with_training_diverged_on_exploding_updates() {
        let config = MelodyConfig {
            learn_rate: 1e307,
            ..test_config()
        };
        let rng = RngStrategy::testable(1337);
        let (vocab, corpus) = stretched_corpus(&rng);
        let mut model = MelodyModel::new(&config, vocab, rng.fork()).unwrap();
        let mut trainer = Trainer::new(&config, corpus, rng.fork()).unwrap();

        let err = trainer.run(&mut model, |_, _| Ok(())).unwrap_err();

        match err.downcast_ref::<MelodyError>() {
            Some(MelodyError::TrainingDiverged { iteration, loss }) => {
                assert!(!loss.is_finite());
                assert!(*iteration < config.max_iters);
                assert_eq!(*iteration, trainer.state().iteration);
                assert_eq!(*iteration, trainer.state().train_loss_history.len());
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn trainer_rejects_short_validation_partition() {
        let lines = ["AABR", "GGR"];
        let vocab = Vocab::from_corpus(lines);
        let corpus = EncodedCorpus::encode(&vocab, lines).unwrap();

        let result = Trainer::new(&test_config(), corpus, RngStrategy::testable(1));
        let err = result.err().unwrap();
        assert_eq!(
            Some(&MelodyError::InsufficientData {
                len: 1,
                block_size: 2
            }),
            err.downcast_ref::<MelodyError>()
        );
    }
}
