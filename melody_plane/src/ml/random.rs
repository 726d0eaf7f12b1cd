use std::{ops::Deref, sync::Arc};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::ml::NodeValue;

use super::cell::MutexCell;

/// Where an [`RngStrategy`] draws its randomness from. This is what gets persisted,
/// the live generator state is never serialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RngSource {
    Entropy,
    Seeded { seed: u32 },
}

/// Owned, injectable random source. Clones share the same underlying generator so a
/// model and its layers draw from a single reproducible stream.
#[derive(Clone, Serialize, Deserialize)]
#[serde(from = "RngSource", into = "RngSource")]
pub struct RngStrategy {
    source: RngSource,
    rng: Arc<dyn RNG>,
}

impl Default for RngStrategy {
    fn default() -> Self {
        RngSource::Entropy.into()
    }
}

impl From<RngSource> for RngStrategy {
    fn from(source: RngSource) -> Self {
        let rng: Arc<dyn RNG> = match source {
            RngSource::Entropy => Arc::new(EntropyRng::default()),
            RngSource::Seeded { seed } => Arc::new(SeedableRng::new(seed)),
        };
        Self { source, rng }
    }
}

impl From<RngStrategy> for RngSource {
    fn from(value: RngStrategy) -> Self {
        value.source
    }
}

impl Deref for RngStrategy {
    type Target = dyn RNG;

    fn deref(&self) -> &Self::Target {
        self.rng.as_ref()
    }
}

impl RngStrategy {
    pub fn seeded(seed: u32) -> Self {
        RngSource::Seeded { seed }.into()
    }

    pub fn testable(seed: u32) -> Self {
        Self::seeded(seed)
    }

    /// Independent generator derived from this one. Used to hand a component its own
    /// stream without coupling the draw order of unrelated components.
    pub fn fork(&self) -> Self {
        match self.source {
            RngSource::Entropy => Self::default(),
            RngSource::Seeded { .. } => {
                let seed = (self.rng.rand() * u32::MAX as NodeValue) as u32;
                Self::seeded(seed)
            }
        }
    }

    pub fn source(&self) -> RngSource {
        self.source
    }

    #[must_use]
    pub fn is_seeded(&self) -> bool {
        matches!(self.source, RngSource::Seeded { .. })
    }
}

impl std::fmt::Debug for RngStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RngStrategy")
            .field("source", &self.source)
            .finish()
    }
}

#[cfg(any(test, feature = "threadrng"))]
pub struct EntropyRng(MutexCell<rand::rngs::StdRng>);

#[cfg(any(test, feature = "threadrng"))]
impl Default for EntropyRng {
    fn default() -> Self {
        use rand::SeedableRng as _;
        Self(MutexCell::new(rand::rngs::StdRng::from_entropy()))
    }
}

#[cfg(any(test, feature = "threadrng"))]
impl RNG for EntropyRng {
    fn rand(&self) -> NodeValue {
        use rand::Rng;
        self.0.with_inner(|rng| rng.gen())
    }
}

#[cfg(not(any(test, feature = "threadrng")))]
pub struct EntropyRng(SeedableRng);

#[cfg(not(any(test, feature = "threadrng")))]
impl Default for EntropyRng {
    fn default() -> Self {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|x| x.subsec_nanos())
            .unwrap_or_default();
        Self(SeedableRng::new(nanos))
    }
}

#[cfg(not(any(test, feature = "threadrng")))]
impl RNG for EntropyRng {
    fn rand(&self) -> NodeValue {
        self.0.rand()
    }
}

pub struct SeedableRng(MutexCell<algo::mersenne_twister::MersenneTwister>);

impl SeedableRng {
    pub fn new(seed: u32) -> Self {
        Self(MutexCell::new(
            algo::mersenne_twister::MersenneTwister::new(seed),
        ))
    }
}

impl RNG for SeedableRng {
    fn rand(&self) -> NodeValue {
        let rand = self.0.with_inner(|inner| inner.rand());
        // keeps samples in [0, 1)
        (rand as f64 * algo::mersenne_twister::F64_MULTIPLIER) as NodeValue
    }
}

pub trait RNG: Send + Sync {
    fn rand(&self) -> NodeValue;
    fn rand_range(&self, min: usize, exclusive_max: usize) -> usize {
        let idx = (self.rand() * (exclusive_max - min) as NodeValue) as usize + min;
        idx.min(exclusive_max.saturating_sub(1).max(min))
    }
    fn rand_normal(&self, mu: NodeValue, sigma: NodeValue) -> NodeValue {
        use std::f64::consts::PI;
        let u1 = (1.0 - self.rand()).max(NodeValue::MIN_POSITIVE);
        let u2 = self.rand();
        let z0 = (-2.0 * u1.ln()).sqrt() * (2.0 * PI as NodeValue * u2).cos();
        mu + sigma * z0
    }
}

pub trait SamplingRng {
    fn sample_uniform(&self, probabilities: &[NodeValue]) -> Result<usize>;
}

impl<T: Deref<Target = dyn RNG>> SamplingRng for T {
    fn sample_uniform(&self, probabilities: &[NodeValue]) -> Result<usize> {
        let total: NodeValue = probabilities.iter().sum();
        if !total.is_finite() || total <= 0.0 {
            return Err(anyhow!(
                "failed to sample from provided probabilities: {probabilities:?}"
            ));
        }

        let mut remaining = self.rand() * total;
        let mut last_nonzero = None;
        for (idx, &p) in probabilities.iter().enumerate() {
            if p <= 0.0 {
                continue;
            }
            last_nonzero = Some(idx);
            if remaining < p {
                return Ok(idx);
            }
            remaining -= p;
        }

        // rounding can leave a sliver of mass past the last bucket
        last_nonzero.ok_or_else(|| anyhow!("no probability mass to sample from"))
    }
}

mod algo {
    pub mod mersenne_twister {
        pub const F64_MULTIPLIER: f64 = 1.0 / (u32::MAX as f64 + 1.0);

        pub struct MersenneTwister {
            state: [u32; 624],
            index: usize,
        }

        impl MersenneTwister {
            pub fn new(seed: u32) -> Self {
                let mut mt = Self {
                    state: [0; 624],
                    index: 624,
                };
                mt.state[0] = seed;
                for i in 1..624 {
                    let prev = mt.state[i - 1];
                    mt.state[i] = 0x6c078965_u32
                        .wrapping_mul(prev ^ (prev >> 30))
                        .wrapping_add(i as u32);
                }
                mt
            }

            pub fn rand(&mut self) -> u32 {
                if self.index >= 624 {
                    self.twist();
                }
                let mut y = self.state[self.index];
                y ^= y >> 11;
                y ^= (y << 7) & 0x9d2c_5680;
                y ^= (y << 15) & 0xefc6_0000;
                y ^= y >> 18;
                self.index += 1;
                y
            }

            fn twist(&mut self) {
                const MATRIX_A: u32 = 0x9908_b0df;
                const UPPER_MASK: u32 = 0x8000_0000;
                const LOWER_MASK: u32 = 0x7fff_ffff;
                for i in 0..624 {
                    let x = (self.state[i] & UPPER_MASK) | (self.state[(i + 1) % 624] & LOWER_MASK);
                    let mut x_a = x >> 1;
                    if x % 2 != 0 {
                        x_a ^= MATRIX_A;
                    }
                    self.state[i] = self.state[(i + 397) % 624] ^ x_a;
                }
                self.index = 0;
            }
        }
    }
}
