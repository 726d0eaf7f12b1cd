use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::ml::{transformer::linear::Linear, NodeValue};

use super::MelodyError;

/// `(1 - epsilon) * nll + epsilon * smoothing`, where `smoothing` is the negative mean
/// log-probability across the whole vocabulary. Both terms are averaged over positions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LabelSmoothedLoss {
    epsilon: NodeValue,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossTerms {
    pub nll: NodeValue,
    pub smoothing: NodeValue,
    pub loss: NodeValue,
}

impl LabelSmoothedLoss {
    pub fn new(epsilon: NodeValue) -> Result<Self> {
        if !(0.0..=1.0).contains(&epsilon) {
            Err(MelodyError::InvalidConfig(format!(
                "label_smoothing={epsilon} must lie in [0, 1]"
            )))?;
        }
        Ok(Self { epsilon })
    }

    pub fn epsilon(&self) -> NodeValue {
        self.epsilon
    }

    /// Loss terms for one sequence of `(positions, vocab)` logits.
    pub fn terms(&self, logits: &Linear, targets: &[usize]) -> Result<LossTerms> {
        Self::validate(logits, targets)?;
        let log_probs = logits.iter().log_softmax();
        let positions = targets.len() as NodeValue;
        let vocab_size = logits.stride() as NodeValue;

        let mut nll = 0.0;
        let mut smoothing = 0.0;
        for (row, &target) in log_probs.rows_iter().zip(targets) {
            nll -= row[target];
            smoothing -= row.iter().sum::<NodeValue>() / vocab_size;
        }
        let (nll, smoothing) = (nll / positions, smoothing / positions);

        Ok(LossTerms {
            nll,
            smoothing,
            loss: (1.0 - self.epsilon) * nll + self.epsilon * smoothing,
        })
    }

    pub fn loss(&self, logits: &Linear, targets: &[usize]) -> Result<NodeValue> {
        Ok(self.terms(logits, targets)?.loss)
    }

    /// Returns the loss and its gradient with respect to the logits, multiplied by `scale`.
    /// Per row: `(softmax - ((1 - epsilon) * one_hot + epsilon / vocab)) / positions`.
    pub fn loss_and_gradients(
        &self,
        logits: &Linear,
        targets: &[usize],
        scale: NodeValue,
    ) -> Result<(NodeValue, Linear)> {
        let loss = self.loss(logits, targets)?;

        let positions = targets.len() as NodeValue;
        let uniform_target = self.epsilon / logits.stride() as NodeValue;
        let factor = scale / positions;

        let mut gradients = logits.iter().softmax();
        for (row, &target) in gradients.rows_iter_mut().zip(targets) {
            row.iter_mut().for_each(|x| *x -= uniform_target);
            row[target] -= 1.0 - self.epsilon;
            row.iter_mut().for_each(|x| *x *= factor);
        }

        Ok((loss, gradients))
    }

    fn validate(logits: &Linear, targets: &[usize]) -> Result<()> {
        if targets.is_empty() {
            return Err(anyhow!("no targets provided to loss"));
        }
        if logits.count() != targets.len() {
            return Err(anyhow!(
                "mismatched logits count {} for {} targets",
                logits.count(),
                targets.len()
            ));
        }
        if let Some(target) = targets.iter().find(|&&x| x >= logits.stride()) {
            return Err(anyhow!(
                "target {target} out of range for vocab of {}",
                logits.stride()
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use crate::ml::transformer::tests::helpers::compute_expected_dloss_dinput;

    use super::*;

    fn logits() -> Linear {
        "
         1.0  -0.5  0.25  2.0
        -1.0   0.0  3.00  0.5
         0.2   0.2  0.20  0.2
        "
        .parse()
        .unwrap()
    }

    #[test]
    fn label_smoothed_loss_without_smoothing_is_nll() {
        let logits = logits();
        let targets = [3, 0, 1];
        let loss = LabelSmoothedLoss::new(0.0).unwrap();

        let log_probs = logits.iter().log_softmax();
        let expected_nll = -(log_probs.row(0).unwrap()[3]
            + log_probs.row(1).unwrap()[0]
            + log_probs.row(2).unwrap()[1])
            / 3.0;

        let terms = loss.terms(&logits, &targets).unwrap();
        assert!((terms.loss - expected_nll).abs() < 1e-12);
        assert!((terms.nll - expected_nll).abs() < 1e-12);
    }

    #[test]
    fn label_smoothed_loss_full_smoothing_is_smoothing_term() {
        let logits = logits();
        let loss = LabelSmoothedLoss::new(1.0).unwrap();

        let terms = loss.terms(&logits, &[3, 0, 1]).unwrap();
        assert!((terms.loss - terms.smoothing).abs() < 1e-12);

        // the smoothing term ignores the targets entirely
        let other = loss.terms(&logits, &[0, 0, 0]).unwrap();
        assert!((terms.loss - other.loss).abs() < 1e-12);
    }

    #[test]
    fn label_smoothed_loss_is_finite_and_non_negative() {
        let loss = LabelSmoothedLoss::new(0.1).unwrap();
        let terms = loss.terms(&logits(), &[2, 2, 2]).unwrap();

        assert!(terms.loss.is_finite());
        assert!(terms.loss >= 0.0);
        // mean of -log p over the vocabulary is never below ln(vocab)
        assert!(terms.smoothing >= (4.0 as NodeValue).ln() - 1e-12);
    }

    #[test]
    fn label_smoothed_loss_uniform_logits_give_log_vocab() {
        let logits = Linear::with_value(2, 4, 0.3);
        let loss = LabelSmoothedLoss::new(0.1).unwrap();
        let value = loss.loss(&logits, &[0, 3]).unwrap();
        assert!((value - (4.0 as NodeValue).ln()).abs() < 1e-12);
    }

    #[test]
    fn label_smoothed_loss_gradients_match_finite_differences() {
        let logits = logits();
        let targets = [3, 0, 1];
        let loss = LabelSmoothedLoss::new(0.1).unwrap();

        let (_, gradients) = loss.loss_and_gradients(&logits, &targets, 1.0).unwrap();
        let expected = compute_expected_dloss_dinput(
            |x| x.clone(),
            |x| loss.loss(x, &targets).unwrap(),
            &logits,
            1e-6,
        );

        let delta = gradients
            .iter()
            .sub(expected.iter())
            .round(6)
            .abs()
            .collect();
        assert_eq!(Linear::with_dimensions(&delta), delta);
    }

    #[test]
    fn label_smoothed_loss_gradient_rows_sum_to_zero() {
        let loss = LabelSmoothedLoss::new(0.3).unwrap();
        let (_, gradients) = loss.loss_and_gradients(&logits(), &[0, 1, 2], 0.5).unwrap();

        for row in gradients.rows_iter() {
            assert!(row.iter().sum::<NodeValue>().abs() < 1e-12);
        }
    }

    #[test]
    fn label_smoothed_loss_rejects_invalid_inputs() {
        assert!(LabelSmoothedLoss::new(1.5).is_err());

        let loss = LabelSmoothedLoss::new(0.1).unwrap();
        assert!(loss.loss(&logits(), &[0, 1]).is_err());
        assert!(loss.loss(&logits(), &[0, 1, 4]).is_err());
    }
}
