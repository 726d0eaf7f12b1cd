use std::iter;

use anyhow::Result;
use tracing::debug;

use crate::ml::RngStrategy;

use super::{AugmentConfig, Vocab};

/// Share of the encoded corpus kept for training, the rest is validation.
pub const TRAIN_SPLIT: f64 = 0.9;

/// Applies the augmentation transforms to raw melody lines.
#[derive(Debug, Clone)]
pub struct CorpusPreparer {
    config: AugmentConfig,
    rng: RngStrategy,
}

impl CorpusPreparer {
    pub fn new(config: &AugmentConfig, rng: RngStrategy) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: config.clone(),
            rng,
        })
    }

    pub fn augment<I, S>(&self, lines: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let augmented: Vec<String> = lines
            .into_iter()
            .map(|line| self.augment_line(line.as_ref()))
            .collect();

        debug!(
            "augmented {} lines into {} symbols",
            augmented.len(),
            augmented.iter().map(|x| x.chars().count()).sum::<usize>()
        );
        augmented
    }

    /// Stretch, then random deletion, then random duration jitter. The result may be empty.
    pub fn augment_line(&self, line: &str) -> String {
        let stretched = line
            .chars()
            .flat_map(|c| iter::repeat(c).take(self.config.stretch_factor));

        let kept = stretched
            .filter(|_| {
                self.config.deletion_prob <= 0.0 || self.rng.rand() >= self.config.deletion_prob
            })
            .collect::<Vec<_>>();

        kept.into_iter()
            .flat_map(|c| iter::repeat(c).take(self.jitter_count()))
            .collect()
    }

    fn jitter_count(&self) -> usize {
        let (min, max) = (self.config.jitter_min, self.config.jitter_max);
        if min == max {
            min
        } else {
            self.rng.rand_range(min, max + 1)
        }
    }
}

/// Flat encoded token stream split into a leading train partition and trailing
/// validation partition.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedCorpus {
    train: Vec<usize>,
    validation: Vec<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partition {
    Train,
    Validation,
}

impl std::fmt::Display for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Partition::Train => write!(f, "train"),
            Partition::Validation => write!(f, "validation"),
        }
    }
}

impl EncodedCorpus {
    /// Concatenates the encoded lines with no separator and splits the stream.
    pub fn encode<I, S>(vocab: &Vocab, lines: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut tokens = vec![];
        for line in lines {
            tokens.extend(vocab.encode(line.as_ref())?);
        }
        Ok(Self::split(tokens))
    }

    pub fn split(mut tokens: Vec<usize>) -> Self {
        let split_idx = (tokens.len() as f64 * TRAIN_SPLIT) as usize;
        let validation = tokens.split_off(split_idx);
        Self {
            train: tokens,
            validation,
        }
    }

    pub fn partition(&self, partition: Partition) -> &[usize] {
        match partition {
            Partition::Train => &self.train,
            Partition::Validation => &self.validation,
        }
    }

    pub fn len(&self) -> usize {
        self.train.len() + self.validation.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use itertools::Itertools;
    use test_log::test;

    use super::*;

    fn preparer(config: AugmentConfig) -> CorpusPreparer {
        CorpusPreparer::new(&config, RngStrategy::testable(1234)).unwrap()
    }

    #[test]
    fn corpus_preparer_default_is_identity() {
        let preparer = preparer(AugmentConfig::default());
        assert_eq!(vec!["AABR", "GGR"], preparer.augment(["AABR", "GGR"]));
    }

    #[test]
    fn corpus_preparer_stretches_symbols() {
        let preparer = preparer(AugmentConfig {
            stretch_factor: 3,
            ..Default::default()
        });
        assert_eq!("AAABBBRRR", preparer.augment_line("ABR"));
    }

    #[test]
    fn corpus_preparer_deletes_everything_at_full_probability() {
        let preparer = preparer(AugmentConfig {
            deletion_prob: 1.0,
            ..Default::default()
        });
        assert_eq!(vec!["", ""], preparer.augment(["ABC", "DEF"]));
    }

    #[test]
    fn corpus_preparer_jitter_stays_in_range() {
        let preparer = preparer(AugmentConfig {
            jitter_min: 1,
            jitter_max: 3,
            ..Default::default()
        });
        let augmented = preparer.augment_line("ABCDEFGH");

        let runs = augmented.chars().dedup_with_count().collect::<Vec<_>>();
        assert_eq!(8, runs.len());
        assert!(runs.iter().all(|(count, _)| (1..=3).contains(count)), "{runs:?}");
    }

    #[test]
    fn corpus_preparer_is_reproducible() {
        let config = AugmentConfig {
            stretch_factor: 2,
            deletion_prob: 0.3,
            jitter_min: 0,
            jitter_max: 2,
        };
        let lines = ["CDEFGABR", "RRCC#D"];
        assert_eq!(preparer(config.clone()).augment(lines), preparer(config).augment(lines));
    }

    #[test]
    fn corpus_preparer_rejects_bad_probability() {
        let config = AugmentConfig {
            deletion_prob: 2.0,
            ..Default::default()
        };
        assert!(CorpusPreparer::new(&config, RngStrategy::testable(1)).is_err());
    }

    #[test]
    fn encoded_corpus_splits_ninety_ten() {
        let corpus = EncodedCorpus::split((0..20).collect());

        assert_eq!(18, corpus.partition(Partition::Train).len());
        assert_eq!(&[18, 19], corpus.partition(Partition::Validation));
        assert_eq!(20, corpus.len());
    }

    #[test]
    fn encoded_corpus_concatenates_lines() {
        let lines = ["AABR", "", "GGR"];
        let vocab = Vocab::from_corpus(lines);
        let corpus = EncodedCorpus::encode(&vocab, lines).unwrap();

        let mut all = corpus.partition(Partition::Train).to_vec();
        all.extend(corpus.partition(Partition::Validation));
        assert_eq!(vec![0, 0, 1, 3, 2, 2, 3], all);
    }
}
