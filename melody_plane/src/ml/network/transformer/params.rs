use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::ml::NodeValue;

use super::{
    linear::{Linear, LinearIter},
    solver::{source::OptimizerSource, Optimizer},
};

/// Anything holding [`TrainableLinear`] parameters that an optimizer can step.
pub trait Trainable {
    fn parameters(&self) -> Vec<&TrainableLinear>;
    fn apply_gradients<T: OptimizerSource>(&mut self, optimizer: &T) -> Result<()>;

    fn parameter_count(&self) -> usize {
        self.parameters()
            .iter()
            .map(|x| x.count() * x.stride())
            .sum()
    }

    fn zero_gradients(&self) {
        self.parameters().iter().for_each(|x| x.clear_gradients());
    }
}

/// Learned matrix paired with an accumulator for the gradients queued against it
/// during a backward pass. Only the value is persisted.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrainableLinear {
    value: Linear,
    #[serde(skip)]
    gradients: GradientStore,
}

impl TrainableLinear {
    pub fn value(&self) -> &Linear {
        &self.value
    }

    pub fn iter<'a>(&'a self) -> LinearIter<'a, impl Iterator<Item = NodeValue> + 'a> {
        self.value.iter()
    }

    pub fn stride(&self) -> usize {
        self.value.stride()
    }

    pub fn count(&self) -> usize {
        self.value.count()
    }

    /// Adds to the pending gradient sum. Safe to call from several batch workers at once.
    pub fn queue_gradients<'a>(&self, gradients: LinearIter<'a, impl Iterator<Item = NodeValue>>) {
        self.gradients.add(gradients);
    }

    pub fn pending_gradients(&self) -> Option<Linear> {
        self.gradients.lock().clone()
    }

    pub fn clear_gradients(&self) {
        self.gradients.lock().take();
    }

    /// Steps the value with the optimizer instance registered under `name` and empties
    /// the accumulator. Parameters without pending gradients are left untouched.
    pub fn apply_gradients<T: OptimizerSource>(&mut self, optimizer: &T, name: &str) -> Result<()> {
        let gradients = match self.gradients.lock().take() {
            Some(gradients) => gradients,
            None => return Ok(()),
        };
        let mut instance = optimizer.create(self.count(), self.stride(), name);
        instance.update(&mut self.value, &gradients)
    }
}

impl From<Linear> for TrainableLinear {
    fn from(value: Linear) -> Self {
        Self {
            value,
            gradients: Default::default(),
        }
    }
}

#[derive(Debug, Default)]
struct GradientStore(Arc<Mutex<Option<Linear>>>);

impl GradientStore {
    fn lock(&self) -> MutexGuard<'_, Option<Linear>> {
        match self.0.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn add<'a>(&self, gradients: LinearIter<'a, impl Iterator<Item = NodeValue>>) {
        let mut store = self.lock();
        *store = Some(match store.take() {
            Some(existing) => existing.iter().add(gradients).collect(),
            None => gradients.collect(),
        });
    }
}

// clones start with an empty accumulator
impl Clone for GradientStore {
    fn clone(&self) -> Self {
        Self::default()
    }
}

impl PartialEq for GradientStore {
    fn eq(&self, _: &Self) -> bool {
        true
    }
}

pub mod keys {
    pub const ATTENTION_KEY: &str = "attention.key";
    pub const ATTENTION_QUERY: &str = "attention.query";
    pub const ATTENTION_VALUE: &str = "attention.value";

    pub const DENSE_WEIGHT: &str = "dense.weight";
    pub const DENSE_BIAS: &str = "dense.bias";

    pub const NORM_GAMMA: &str = "norm.gamma";
    pub const NORM_BETA: &str = "norm.beta";

    pub const EMBEDDING_TABLE: &str = "embedding.table";
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::super::solver::SGDOptimizer;
    use super::*;

    #[test]
    fn trainable_linear_accumulates_queued_gradients() {
        let param: TrainableLinear = Linear::with_value(2, 2, 1.0).into();
        let grads = Linear::with_value(2, 2, 0.5);

        param.queue_gradients(grads.iter());
        param.queue_gradients(grads.iter());

        let pending = param.pending_gradients().unwrap();
        assert_eq!(Linear::with_value(2, 2, 1.0), pending);
    }

    #[test]
    fn trainable_linear_applies_and_clears_gradients() {
        let mut param: TrainableLinear = Linear::with_value(1, 3, 1.0).into();
        param.queue_gradients(Linear::with_value(1, 3, 2.0).iter());

        let optimizer = SGDOptimizer::new_cache(0.25);
        param.apply_gradients(&optimizer, keys::DENSE_WEIGHT).unwrap();

        assert_eq!(&Linear::with_value(1, 3, 0.5), param.value());
        assert!(param.pending_gradients().is_none());

        // nothing pending, nothing changes
        param.apply_gradients(&optimizer, keys::DENSE_WEIGHT).unwrap();
        assert_eq!(&Linear::with_value(1, 3, 0.5), param.value());
    }

    #[test]
    fn trainable_linear_clone_has_fresh_gradients() {
        let param: TrainableLinear = Linear::with_value(1, 1, 1.0).into();
        param.queue_gradients(Linear::with_value(1, 1, 1.0).iter());

        let cloned = param.clone();
        assert!(cloned.pending_gradients().is_none());
        assert!(param.pending_gradients().is_some());
    }
}
