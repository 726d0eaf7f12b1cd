use anyhow::Result;

use crate::ml::RngStrategy;

use super::{MelodyConfig, MelodyError};

/// `(inputs, targets)` windows, where each target is its input shifted one token later.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    samples: Vec<(Vec<usize>, Vec<usize>)>,
}

impl Batch {
    pub fn new(samples: Vec<(Vec<usize>, Vec<usize>)>) -> Self {
        Self { samples }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[usize], &[usize])> {
        self.samples.iter().map(|(x, y)| (x.as_slice(), y.as_slice()))
    }

    pub fn inputs(&self) -> impl Iterator<Item = &[usize]> {
        self.samples.iter().map(|(x, _)| x.as_slice())
    }

    pub fn targets(&self) -> impl Iterator<Item = &[usize]> {
        self.samples.iter().map(|(_, y)| y.as_slice())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSampler {
    batch_size: usize,
    block_size: usize,
}

impl BatchSampler {
    pub fn new(config: &MelodyConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            block_size: config.block_size,
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Fails unless the partition holds at least one full window plus its shifted target.
    pub fn check_partition(&self, partition: &[usize]) -> Result<()> {
        if partition.len() <= self.block_size {
            Err(MelodyError::InsufficientData {
                len: partition.len(),
                block_size: self.block_size,
            })?;
        }
        Ok(())
    }

    /// Draws `batch_size` windows at offsets uniform in `0..partition.len() - block_size`.
    pub fn sample(&self, partition: &[usize], rng: &RngStrategy) -> Result<Batch> {
        self.check_partition(partition)?;

        let exclusive_max = partition.len() - self.block_size;
        let samples = (0..self.batch_size)
            .map(|_| {
                let offset = rng.rand_range(0, exclusive_max);
                let inputs = partition[offset..offset + self.block_size].to_vec();
                let targets = partition[offset + 1..offset + self.block_size + 1].to_vec();
                (inputs, targets)
            })
            .collect();

        Ok(Batch::new(samples))
    }
}
