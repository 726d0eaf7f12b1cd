use anyhow::{anyhow, Result};

use crate::ml::NodeValue;

use self::source::{DefaultOptimizerCache, DynamicOptimizerFactory};

use super::linear::Linear;

pub trait Optimizer {
    fn update(&mut self, target: &mut Linear, dloss_dtarget: &Linear) -> Result<()>;
}

pub struct AdamOptimizer {
    momentum: Linear,
    rms: Linear,
    beta: (NodeValue, NodeValue),
    epsilon: NodeValue,
    eta: NodeValue,
    t: u64,
}

impl AdamOptimizer {
    pub fn new(param_count: usize, param_dimension: usize, learn_rate: NodeValue) -> Self {
        Self::new_builder(param_count, param_dimension)
            .with_eta(learn_rate)
            .build()
    }

    pub fn new_builder(param_count: usize, param_dimension: usize) -> builder::AdamOptimizerBuilder {
        builder::AdamOptimizerBuilder::new(param_count, param_dimension)
    }

    pub fn new_cache(learn_rate: NodeValue) -> AdamOptimizerCache {
        DefaultOptimizerCache::new(DynamicOptimizerFactory::new(
            move |param_count, param_dimension| Self::new(param_count, param_dimension, learn_rate),
        ))
    }
}

pub type AdamOptimizerCache = DefaultOptimizerCache<DynamicOptimizerFactory<AdamOptimizer>, AdamOptimizer>;

impl Optimizer for AdamOptimizer {
    fn update(&mut self, target: &mut Linear, dloss_dtarget: &Linear) -> Result<()> {
        if !dloss_dtarget.is_finite() {
            Err(anyhow!("failed to update target: invalid gradients"))?;
        }
        let (beta1, beta2) = self.beta;
        let t = self.t as i32;

        self.momentum = self
            .momentum
            .iter()
            .multiply_scalar(beta1)
            .add(dloss_dtarget.iter().multiply_scalar(1.0 - beta1))
            .collect();

        self.rms = self
            .rms
            .iter()
            .multiply_scalar(beta2)
            .add(dloss_dtarget.iter().powi_scalar(2).multiply_scalar(1.0 - beta2))
            .collect();

        let momentum_corrected = self.momentum.iter().multiply_scalar(1.0 / (1.0 - beta1.powi(t)));
        let rms_corrected = self.rms.iter().multiply_scalar(1.0 / (1.0 - beta2.powi(t)));

        let step = momentum_corrected
            .div(rms_corrected.sqrt(), Some(self.epsilon))
            .multiply_scalar(-self.eta);

        let next_value = target.iter().add(step).collect();
        if !next_value.is_finite() {
            Err(anyhow!("failed to update target: non-finite parameters"))?;
        }

        self.t += 1;
        *target = next_value;
        Ok(())
    }
}

pub struct SGDOptimizer {
    learn_rate: NodeValue,
}

impl SGDOptimizer {
    pub fn new(learn_rate: NodeValue) -> Self {
        Self { learn_rate }
    }

    pub fn new_cache(
        learn_rate: NodeValue,
    ) -> DefaultOptimizerCache<DynamicOptimizerFactory<Self>, Self> {
        DefaultOptimizerCache::new(DynamicOptimizerFactory::new(move |_, _| {
            Self::new(learn_rate)
        }))
    }
}

impl Optimizer for SGDOptimizer {
    fn update(&mut self, target: &mut Linear, dloss_dtarget: &Linear) -> Result<()> {
        let next_value = target
            .iter()
            .sub(dloss_dtarget.iter().multiply_scalar(self.learn_rate))
            .collect();
        if !next_value.is_finite() {
            Err(anyhow!("failed to update target: invalid gradients"))?;
        }

        *target = next_value;
        Ok(())
    }
}

pub mod source {
    use std::{cell::RefCell, collections::HashMap, rc::Rc, sync::Arc};

    use tracing::debug;

    use super::{Linear, Optimizer};

    /// Hands out optimizer state per parameter. Scopes keep parameters with the same
    /// name in different blocks (or heads) on separate optimizer instances.
    pub trait OptimizerSource: Clone {
        type Optimizer: Optimizer;

        fn create(
            &self,
            param_count: usize,
            param_dimension: usize,
            instance_name: &str,
        ) -> Self::Optimizer;

        fn with_scope(&self, scope: &str) -> Self;

        fn with_index(&self, index: usize) -> Self {
            self.with_scope(&index.to_string())
        }
    }

    pub trait DefaultOptimizerFactory<O>: Clone {
        fn create(&self, param_count: usize, param_dimension: usize) -> O;
    }

    pub struct DefaultOptimizerCache<F, O>
    where
        F: DefaultOptimizerFactory<O>,
    {
        factory: F,
        instances: Rc<RefCell<HashMap<String, Rc<RefCell<O>>>>>,
        scope: String,
    }

    impl<F, O> Clone for DefaultOptimizerCache<F, O>
    where
        F: DefaultOptimizerFactory<O>,
    {
        fn clone(&self) -> Self {
            Self {
                factory: self.factory.clone(),
                instances: self.instances.clone(),
                scope: self.scope.clone(),
            }
        }
    }

    impl<F: DefaultOptimizerFactory<O>, O> DefaultOptimizerCache<F, O> {
        pub fn new(factory: F) -> Self {
            Self {
                factory,
                instances: Rc::new(RefCell::new(HashMap::new())),
                scope: String::new(),
            }
        }

        pub fn len(&self) -> usize {
            self.instances.borrow().len()
        }

        pub fn is_empty(&self) -> bool {
            self.len() == 0
        }
    }

    impl<F, O> OptimizerSource for DefaultOptimizerCache<F, O>
    where
        F: DefaultOptimizerFactory<O>,
        O: Optimizer + 'static,
    {
        type Optimizer = OptimizerCacheEntry<O>;

        fn create(
            &self,
            param_count: usize,
            param_dimension: usize,
            instance_name: &str,
        ) -> Self::Optimizer {
            let key = format!("{}/{instance_name}_{param_count}x{param_dimension}", self.scope);
            let value = self
                .instances
                .borrow_mut()
                .entry(key)
                .or_insert_with_key(|key| {
                    debug!("created new optimiser instance with key='{}'", key);
                    Rc::new(RefCell::new(
                        self.factory.create(param_count, param_dimension),
                    ))
                })
                .clone();
            OptimizerCacheEntry(value)
        }

        fn with_scope(&self, scope: &str) -> Self {
            Self {
                factory: self.factory.clone(),
                instances: self.instances.clone(),
                scope: format!("{}/{scope}", self.scope),
            }
        }
    }

    pub struct OptimizerCacheEntry<O>(Rc<RefCell<O>>);

    impl<T: Optimizer> Optimizer for OptimizerCacheEntry<T> {
        fn update(&mut self, target: &mut Linear, dloss_dtarget: &Linear) -> anyhow::Result<()> {
            self.0.borrow_mut().update(target, dloss_dtarget)
        }
    }

    pub struct DynamicOptimizerFactory<O> {
        inner: Arc<dyn Fn(usize, usize) -> O>,
    }

    impl<O> Clone for DynamicOptimizerFactory<O> {
        fn clone(&self) -> Self {
            Self {
                inner: self.inner.clone(),
            }
        }
    }

    impl<O> DynamicOptimizerFactory<O> {
        pub fn new<F: Fn(usize, usize) -> O + 'static>(inner: F) -> Self {
            Self {
                inner: Arc::new(inner),
            }
        }
    }

    impl<O> DefaultOptimizerFactory<O> for DynamicOptimizerFactory<O> {
        fn create(&self, param_count: usize, param_dimension: usize) -> O {
            (self.inner)(param_count, param_dimension)
        }
    }
}

pub mod builder {
    use super::*;

    pub struct AdamOptimizerBuilder {
        momentum: Linear,
        rms: Linear,
        beta: (NodeValue, NodeValue),
        epsilon: NodeValue,
        eta: NodeValue,
    }

    impl AdamOptimizerBuilder {
        pub fn new(param_count: usize, param_dimension: usize) -> Self {
            Self {
                momentum: Linear::new(param_count, param_dimension),
                rms: Linear::new(param_count, param_dimension),
                beta: (0.9, 0.999),
                epsilon: 1e-8,
                eta: 0.001,
            }
        }

        pub fn with_eta(mut self, eta: NodeValue) -> Self {
            self.eta = eta;
            self
        }

        pub fn build(self) -> AdamOptimizer {
            AdamOptimizer {
                momentum: self.momentum,
                rms: self.rms,
                beta: self.beta,
                epsilon: self.epsilon,
                eta: self.eta,
                t: 1,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use test_log::test;

    use crate::ml::transformer::tests::helpers::{assert_optimisation_converges, new_linear};

    use super::{source::OptimizerSource, *};

    #[test]
    fn adam_can_optimise_linear() {
        let batch_count = 12;
        let input_dimension = 48;
        let output_dimension = 8;

        let optimizer = AdamOptimizer::new_builder(output_dimension, input_dimension)
            .with_eta(0.1)
            .build();
        let optimizer = RefCell::new(optimizer);

        assert_optimisation_converges(
            &move |rng| {
                let weights = new_linear(output_dimension, input_dimension, &rng);
                let inputs = new_linear(batch_count, input_dimension, &rng);
                let target = new_linear(batch_count, output_dimension, &rng);
                (weights, inputs, target)
            },
            &move |weights, inputs| inputs.matrix_product_rhs_transposed(weights),
            &move |weights, inputs, dloss| {
                let dweights = dloss.matrix_product_lhs_transposed(inputs);
                let dinputs = dloss.matrix_product(weights);
                optimizer.borrow_mut().update(weights, &dweights).unwrap();
                dinputs
            },
            100,
        );
    }

    #[test]
    fn sgd_can_optimise_linear() {
        let batch_count = 12;
        let input_dimension = 48;
        let output_dimension = 8;

        let optimizer = RefCell::new(SGDOptimizer::new(0.01));

        assert_optimisation_converges(
            &move |rng| {
                let weights = new_linear(output_dimension, input_dimension, &rng);
                let inputs = new_linear(batch_count, input_dimension, &rng);
                let target = new_linear(batch_count, output_dimension, &rng);
                (weights, inputs, target)
            },
            &move |weights, inputs| inputs.matrix_product_rhs_transposed(weights),
            &move |weights, inputs, dloss| {
                let dweights = dloss.matrix_product_lhs_transposed(inputs);
                let dinputs = dloss.matrix_product(weights);
                optimizer.borrow_mut().update(weights, &dweights).unwrap();
                dinputs
            },
            100,
        );
    }

    #[test]
    fn adam_rejects_non_finite_gradients() {
        let mut optimizer = AdamOptimizer::new(1, 2, 0.01);
        let mut target = Linear::with_value(1, 2, 1.0);
        let grads = Linear::with_value(1, 2, NodeValue::NAN);

        assert!(optimizer.update(&mut target, &grads).is_err());
        assert_eq!(Linear::with_value(1, 2, 1.0), target);
    }

    #[test]
    fn optimizer_cache_separates_scopes() {
        let cache = AdamOptimizer::new_cache(0.01);
        cache.with_index(0).create(2, 2, "weights");
        cache.with_index(0).create(2, 2, "weights");
        cache.with_index(1).create(2, 2, "weights");
        cache.with_scope("output").create(2, 2, "weights");

        assert_eq!(3, cache.len());
    }
}
