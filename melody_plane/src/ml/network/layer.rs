use std::ops::{Deref, DerefMut};

use serde::{Deserialize, Serialize};

use crate::ml::RngStrategy;

#[cfg(not(feature = "short_floats"))]
pub type NodeValue = f64;

#[cfg(feature = "short_floats")]
pub type NodeValue = f32;

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerValues(Vec<NodeValue>);

impl<T> From<T> for LayerValues
where
    T: AsRef<[NodeValue]>,
{
    fn from(value: T) -> Self {
        Self(value.as_ref().to_vec())
    }
}

impl FromIterator<NodeValue> for LayerValues {
    fn from_iter<T: IntoIterator<Item = NodeValue>>(iter: T) -> Self {
        LayerValues(iter.into_iter().collect())
    }
}

impl Deref for LayerValues {
    type Target = Vec<NodeValue>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for LayerValues {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl LayerValues {
    pub fn new(inner: Vec<NodeValue>) -> Self {
        Self(inner)
    }
    pub fn ave(&self) -> NodeValue {
        if !self.is_empty() {
            self.iter().sum::<NodeValue>() / self.len() as NodeValue
        } else {
            0.0
        }
    }
    pub fn position_max(&self) -> Option<usize> {
        itertools::Itertools::position_max_by(self.iter(), |x, y| {
            x.partial_cmp(y).unwrap_or(std::cmp::Ordering::Equal)
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum LayerInitStrategy {
    #[cfg(test)]
    Kaiming,
    #[cfg(test)]
    KaimingZeroBias,
    /// zero-mean gaussian weights with a fixed standard deviation, zero bias
    Normal { std: NodeValue },
}

impl LayerInitStrategy {
    #[cfg_attr(not(test), allow(unused_variables))]
    pub fn apply<'a>(
        &self,
        weights: impl Iterator<Item = &'a mut NodeValue>,
        bias: impl Iterator<Item = &'a mut NodeValue>,
        inputs_count: usize,
        rng: &RngStrategy,
    ) {
        use LayerInitStrategy::*;

        match self {
            #[cfg(test)]
            Kaiming => {
                let scale_factor = (inputs_count as NodeValue).powf(-0.5) * 5.0 / 3.0;
                for value in weights.chain(bias) {
                    *value = rng.rand_normal(0.0, 1.0) * scale_factor;
                }
            }
            #[cfg(test)]
            KaimingZeroBias => {
                let scale_factor = (inputs_count as NodeValue).powf(-0.5) * 5.0 / 3.0;
                for value in weights {
                    *value = rng.rand_normal(0.0, 1.0) * scale_factor;
                }
                for value in bias {
                    *value = 0.0;
                }
            }
            Normal { std } => {
                for value in weights {
                    *value = rng.rand_normal(0.0, *std);
                }
                for value in bias {
                    *value = 0.0;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;

    #[test]
    fn normal_init_has_requested_spread_and_zero_bias() {
        let rng = RngStrategy::testable(1234);
        let strategy = LayerInitStrategy::Normal { std: 0.02 };
        let mut weights = vec![0.0; 4000];
        let mut bias = vec![1.0; 8];

        strategy.apply(weights.iter_mut(), bias.iter_mut(), 10, &rng);

        let weights = LayerValues::new(weights);
        let mean = weights.ave();
        let std = weights.iter().map(|x| (x - mean).powi(2)).sum::<NodeValue>() / 4000.0;
        let std = std.sqrt();

        assert!(mean.abs() < 0.002, "mean too far from zero: {mean}");
        assert!((std - 0.02).abs() < 0.002, "unexpected std: {std}");
        assert!(bias.iter().all(|x| *x == 0.0));
    }

    #[test]
    fn position_max_finds_largest_value() {
        let values = LayerValues::new(vec![0.1, 0.7, 0.2]);
        assert_eq!(Some(1), values.position_max());
        assert_eq!(None, LayerValues::default().position_max());
    }
}
