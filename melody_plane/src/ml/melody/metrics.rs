use std::collections::BTreeSet;

use anyhow::{anyhow, Result};
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::ml::{transformer::linear::Linear, NodeValue};

use super::MelodyError;

/// Validation metrics reported at each evaluation checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MelodyMetrics {
    pub perplexity: NodeValue,
    pub levenshtein: NodeValue,
    pub jaccard: NodeValue,
}

impl MelodyMetrics {
    pub fn mean(samples: &[MelodyMetrics]) -> Result<Self> {
        if samples.is_empty() {
            Err(MelodyError::DegenerateMetric("no metric samples to average"))?;
        }
        let count = samples.len() as NodeValue;
        Ok(Self {
            perplexity: samples.iter().map(|x| x.perplexity).sum::<NodeValue>() / count,
            levenshtein: samples.iter().map(|x| x.levenshtein).sum::<NodeValue>() / count,
            jaccard: samples.iter().map(|x| x.jaccard).sum::<NodeValue>() / count,
        })
    }
}

/// `exp` of the mean cross-entropy over every row of every sequence. A true class with
/// zero probability yields `+inf`.
pub fn perplexity<'a, I>(batch: I) -> Result<NodeValue>
where
    I: IntoIterator<Item = (&'a Linear, &'a [usize])>,
{
    let mut total = 0.0;
    let mut positions = 0;

    for (logits, targets) in batch {
        if logits.count() != targets.len() {
            return Err(anyhow!("mismatched logits count for perplexity targets"));
        }
        let log_probs = logits.iter().log_softmax();
        for (row, &target) in log_probs.rows_iter().zip(targets) {
            let log_prob = *row
                .get(target)
                .ok_or_else(|| anyhow!("target {target} out of vocab range"))?;
            if log_prob == NodeValue::NEG_INFINITY || log_prob.is_nan() {
                return Ok(NodeValue::INFINITY);
            }
            total -= log_prob;
            positions += 1;
        }
    }

    if positions == 0 {
        Err(MelodyError::DegenerateMetric("perplexity over zero positions"))?;
    }
    Ok((total / positions as NodeValue).exp())
}

/// Minimum single-symbol insertions, deletions and substitutions turning `a` into `b`.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a = a.chars().collect_vec();
    let b = b.chars().collect_vec();

    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(ca != cb);
            current[j + 1] = substitution
                .min(previous[j + 1] + 1)
                .min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }

    previous[b.len()]
}

/// Intersection over union of the distinct symbols in `a` and `b`. Two empty strings
/// are identical, so they score `1.0`.
pub fn jaccard(a: &str, b: &str) -> NodeValue {
    let a: BTreeSet<char> = a.chars().collect();
    let b: BTreeSet<char> = b.chars().collect();

    let union = a.union(&b).count();
    if union == 0 {
        return 1.0;
    }
    a.intersection(&b).count() as NodeValue / union as NodeValue
}

pub fn mean_levenshtein<A: AsRef<str>, B: AsRef<str>>(
    predictions: &[A],
    targets: &[B],
) -> Result<NodeValue> {
    mean_pairwise(predictions, targets, |a, b| levenshtein(a, b) as NodeValue)
}

pub fn mean_jaccard<A: AsRef<str>, B: AsRef<str>>(
    predictions: &[A],
    targets: &[B],
) -> Result<NodeValue> {
    mean_pairwise(predictions, targets, jaccard)
}

fn mean_pairwise<A: AsRef<str>, B: AsRef<str>>(
    predictions: &[A],
    targets: &[B],
    metric: impl Fn(&str, &str) -> NodeValue,
) -> Result<NodeValue> {
    if predictions.len() != targets.len() {
        return Err(anyhow!(
            "mismatched prediction count {} for {} targets",
            predictions.len(),
            targets.len()
        ));
    }
    if predictions.is_empty() {
        Err(MelodyError::DegenerateMetric("no examples to average"))?;
    }

    let total: NodeValue = predictions
        .iter()
        .zip(targets)
        .map(|(a, b)| metric(a.as_ref(), b.as_ref()))
        .sum();

    Ok(total / predictions.len() as NodeValue)
}
