// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use super::controller::{SampleRateController, SrlStateDict};
use super::sampler::PairSampler;
use super::SrlSettings;
use crate::loss::{ElementwiseLoss, Loss};
use crate::{PureResult, Tensor, TensorError};

/// Positive/negative split of one batch and the aggregate built from it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossBreakdown {
    pub loss: f32,
    /// Mean over rows with a non-zero label, NaN when there are none.
    pub positive_loss: f32,
    /// Mean over rows labelled zero, NaN when there are none.
    pub negative_loss: f32,
    pub positives: usize,
    pub batch: usize,
}

impl LossBreakdown {
    /// Feedback for the rate controller.
    pub fn signal(&self) -> f64 {
        self.negative_loss as f64 - self.positive_loss as f64
    }

    /// `d loss / d l_i` for a positive and a negative row.
    fn row_weights(&self, normalise: bool) -> (f32, f32) {
        let negatives = self.batch - self.positives;
        if !normalise {
            let w = 1.0 / self.batch as f32;
            return (w, w);
        }
        if self.positives == 0 || negatives == 0 {
            return (0.0, 0.0);
        }
        let scale = balance(self.positives, self.batch);
        (
            (scale / self.positives as f64) as f32,
            (scale / negatives as f64) as f32,
        )
    }
}

/// `sqrt(p * (1 - p))` for the positive fraction `p`.
fn balance(positives: usize, batch: usize) -> f64 {
    let p = positives as f64 / batch as f64;
    (p * (1.0 - p)).sqrt()
}

fn mean_of(values: impl Iterator<Item = f32>) -> f32 {
    let (sum, count) = values.fold((0.0f64, 0usize), |(s, c), v| (s + v as f64, c + 1));
    if count == 0 {
        f32::NAN
    } else {
        (sum / count as f64) as f32
    }
}

fn split(losses: &[f32], positive: &[bool], normalise: bool) -> PureResult<LossBreakdown> {
    if losses.len() != positive.len() {
        return Err(TensorError::DataLength {
            expected: losses.len(),
            got: positive.len(),
        });
    }
    if losses.is_empty() {
        return Err(TensorError::EmptyInput("rate_adaptive_loss"));
    }
    let pairs = || losses.iter().zip(positive);
    let positive_loss = mean_of(pairs().filter(|(_, p)| **p).map(|(l, _)| *l));
    let negative_loss = mean_of(pairs().filter(|(_, p)| !**p).map(|(l, _)| *l));
    let positives = positive.iter().filter(|&&p| p).count();
    let batch = losses.len();
    let loss = if !normalise {
        mean_of(losses.iter().copied())
    } else if positive_loss.is_nan() {
        negative_loss * 0.0
    } else if negative_loss.is_nan() {
        positive_loss * 0.0
    } else {
        ((positive_loss as f64 + negative_loss as f64) * balance(positives, batch)) as f32
    };
    Ok(LossBreakdown {
        loss,
        positive_loss,
        negative_loss,
        positives,
        batch,
    })
}

/// Rows with a non-zero label are positives, in every variant.
fn positives_of(labels: &Tensor) -> Vec<bool> {
    labels.data().iter().map(|&label| label != 0.0).collect()
}

/// Elementwise loss split into positive and negative halves whose gap drives
/// a [`SampleRateController`] on every call to [`RateAdaptiveLoss::compute`].
#[derive(Debug)]
pub struct RateAdaptiveLoss {
    controller: SampleRateController,
    variant: ElementwiseLoss,
    normalise: bool,
    recent: Option<LossBreakdown>,
}

impl RateAdaptiveLoss {
    pub fn new(controller: SampleRateController, variant: ElementwiseLoss, normalise: bool) -> Self {
        Self {
            controller,
            variant,
            normalise,
            recent: None,
        }
    }

    pub fn from_settings(sampler: &dyn PairSampler, settings: &SrlSettings) -> PureResult<Self> {
        let variant = settings.loss_variant()?;
        let controller = SampleRateController::from_sampler(sampler, settings)?;
        Ok(Self::new(controller, variant, settings.norm))
    }

    pub fn controller(&self) -> &SampleRateController {
        &self.controller
    }

    pub fn variant(&self) -> ElementwiseLoss {
        self.variant
    }

    pub fn normalise(&self) -> bool {
        self.normalise
    }

    /// `(positive_loss, negative_loss)` of the latest batch.
    pub fn recent_losses(&self) -> Option<(f32, f32)> {
        self.recent
            .map(|breakdown| (breakdown.positive_loss, breakdown.negative_loss))
    }

    pub fn last_breakdown(&self) -> Option<&LossBreakdown> {
        self.recent.as_ref()
    }

    /// Aggregates precomputed per-sample losses, records them and steps the
    /// controller with `negative_loss - positive_loss`.
    pub fn aggregate(&mut self, losses: &[f32], positive: &[bool]) -> PureResult<LossBreakdown> {
        let breakdown = split(losses, positive, self.normalise)?;
        if self.normalise {
            if breakdown.positive_loss.is_nan() {
                tracing::warn!(batch = breakdown.batch, "positive loss is NaN, batch has no positive pairs");
            } else if breakdown.negative_loss.is_nan() {
                tracing::warn!(batch = breakdown.batch, "negative loss is NaN, batch has no negative pairs");
            }
        }
        self.recent = Some(breakdown);
        self.controller.step(breakdown.signal());
        Ok(breakdown)
    }

    /// Full step: elementwise losses, split, feedback, aggregate.
    pub fn compute(&mut self, scores: &Tensor, labels: &Tensor) -> PureResult<LossBreakdown> {
        let losses = self.variant.per_sample(scores, labels)?;
        self.aggregate(&losses, &positives_of(labels))
    }

    /// Gradient of the aggregate with respect to `scores`. Has no effect on
    /// the controller.
    pub fn grad(&self, scores: &Tensor, labels: &Tensor) -> PureResult<Tensor> {
        let losses = self.variant.per_sample(scores, labels)?;
        let positive = positives_of(labels);
        let breakdown = split(&losses, &positive, self.normalise)?;
        let (pos_weight, neg_weight) = breakdown.row_weights(self.normalise);
        let mut grad = self.variant.per_sample_grad(scores, labels)?;
        let cols = grad.cols();
        for (row, is_positive) in grad.data_mut().chunks_mut(cols).zip(&positive) {
            let weight = if *is_positive { pos_weight } else { neg_weight };
            for value in row {
                *value *= weight;
            }
        }
        Ok(grad)
    }

    pub fn state_dict(&self) -> SrlStateDict {
        self.controller.state_dict()
    }

    pub fn load_state_dict(&mut self, state: &SrlStateDict) -> PureResult<()> {
        self.controller.load_state_dict(state)
    }
}

impl Loss for RateAdaptiveLoss {
    fn forward(&mut self, prediction: &Tensor, target: &Tensor) -> PureResult<Tensor> {
        let breakdown = self.compute(prediction, target)?;
        Tensor::from_vec(1, 1, vec![breakdown.loss])
    }

    fn backward(&mut self, prediction: &Tensor, target: &Tensor) -> PureResult<Tensor> {
        self.grad(prediction, target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optim::{OptimizerConfig, OptimizerKind};
    use crate::srl::RateHandle;
    use approx::assert_abs_diff_eq;

    fn module(variant: ElementwiseLoss, normalise: bool) -> RateAdaptiveLoss {
        let controller = SampleRateController::new(
            Box::new(RateHandle::new(0.5)),
            OptimizerConfig::new(OptimizerKind::Sgd, 1.0),
        )
        .unwrap();
        RateAdaptiveLoss::new(controller, variant, normalise)
    }

    #[test]
    fn unnormalised_loss_is_the_plain_mean() {
        let mut loss = module(ElementwiseLoss::BinaryCrossEntropy, false);
        let out = loss
            .aggregate(&[1.0, 2.0, 3.0, 6.0], &[true, false, false, false])
            .unwrap();
        assert_abs_diff_eq!(out.loss, 3.0);
        let (pos, neg) = loss.recent_losses().unwrap();
        assert_eq!(pos, 1.0);
        assert_abs_diff_eq!(neg, 11.0 / 3.0, epsilon = 1e-6);
    }

    #[test]
    fn all_positive_batch_zeroes_the_loss() {
        let mut loss = module(ElementwiseLoss::BinaryCrossEntropy, true);
        let rate = loss.controller().rate();
        let out = loss.aggregate(&[0.4, 0.6], &[true, true]).unwrap();
        assert!(out.negative_loss.is_nan());
        assert_eq!(out.loss, 0.0);
        assert_eq!(loss.controller().rate(), rate);
    }

    #[test]
    fn gradient_matches_finite_differences() {
        let loss = module(ElementwiseLoss::BinaryCrossEntropy, true);
        let scores = Tensor::from_vec(4, 1, vec![0.3, -1.2, 0.8, 2.0]).unwrap();
        let labels = Tensor::from_vec(4, 1, vec![1.0, 0.0, 0.0, 0.0]).unwrap();
        let grad = loss.grad(&scores, &labels).unwrap();
        let positive = positives_of(&labels);
        let value = |s: &Tensor| {
            let losses = loss.variant.per_sample(s, &labels).unwrap();
            split(&losses, &positive, true).unwrap().loss
        };
        let h = 1e-2;
        for idx in 0..4 {
            let mut plus = scores.clone();
            plus.data_mut()[idx] += h;
            let mut minus = scores.clone();
            minus.data_mut()[idx] -= h;
            let numeric = (value(&plus) - value(&minus)) / (2.0 * h);
            assert_abs_diff_eq!(grad.data()[idx], numeric, epsilon = 1e-3);
        }
    }

    #[test]
    fn categorical_variant_treats_class_zero_as_negative() {
        let mut loss = module(ElementwiseLoss::CategoricalCrossEntropy, false);
        let scores = Tensor::from_vec(3, 3, vec![0.0; 9]).unwrap();
        let labels = Tensor::from_vec(3, 1, vec![0.0, 2.0, 1.0]).unwrap();
        let out = loss.compute(&scores, &labels).unwrap();
        assert_eq!(out.positives, 2);
        assert_abs_diff_eq!(out.loss, 3.0f32.ln(), epsilon = 1e-6);
        // equal losses on both sides leave the rate where it was
        assert_abs_diff_eq!(loss.controller().rate(), 0.5, epsilon = 1e-12);
    }

    #[test]
    fn loss_trait_forward_steps_the_controller_once() {
        let mut loss = module(ElementwiseLoss::BinaryCrossEntropy, true);
        let scores = Tensor::from_vec(2, 1, vec![3.0, 3.0]).unwrap();
        let labels = Tensor::from_vec(2, 1, vec![1.0, 0.0]).unwrap();
        let value = Loss::forward(&mut loss, &scores, &labels).unwrap();
        assert_eq!(value.shape(), (1, 1));
        // negatives scored high are hard, so positives become rarer
        assert!(loss.controller().rate() < 0.5);
        let rate = loss.controller().rate();
        Loss::backward(&mut loss, &scores, &labels).unwrap();
        assert_eq!(loss.controller().rate(), rate);
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        let mut loss = module(ElementwiseLoss::BinaryCrossEntropy, true);
        assert!(loss.aggregate(&[1.0, 2.0], &[true]).is_err());
        assert!(loss.aggregate(&[], &[]).is_err());
    }
}
