// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use super::Loss;
use crate::{PureResult, Tensor, TensorError};
use std::fmt;
use std::str::FromStr;

/// Lower bound applied to log-probabilities, matching `nn.BCELoss`.
const LOG_FLOOR: f32 = -100.0;

/// Per-sample losses over pair scores. Targets are a `(batch, 1)` column:
/// `0/1` for the binary variant and class ids for the categorical one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementwiseLoss {
    /// Binary cross entropy on `sigmoid(score)`; scores are `(batch, 1)`.
    BinaryCrossEntropy,
    /// Softmax cross entropy; scores are `(batch, classes)`.
    CategoricalCrossEntropy,
}

impl fmt::Display for ElementwiseLoss {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElementwiseLoss::BinaryCrossEntropy => f.write_str("bce"),
            ElementwiseLoss::CategoricalCrossEntropy => f.write_str("ce"),
        }
    }
}

impl FromStr for ElementwiseLoss {
    type Err = TensorError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "bce" | "binary_cross_entropy" => Ok(ElementwiseLoss::BinaryCrossEntropy),
            "ce" | "cross_entropy" | "categorical_cross_entropy" => {
                Ok(ElementwiseLoss::CategoricalCrossEntropy)
            }
            _ => Err(TensorError::UnsupportedLossVariant {
                variant: value.to_string(),
            }),
        }
    }
}

fn softplus(x: f32) -> f32 {
    if x > 0.0 {
        x + (-x).exp().ln_1p()
    } else {
        x.exp().ln_1p()
    }
}

fn sigmoid(x: f32) -> f32 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

impl ElementwiseLoss {
    fn check(&self, scores: &Tensor, targets: &Tensor) -> PureResult<()> {
        let (rows, cols) = scores.shape();
        if targets.shape() != (rows, 1) {
            return Err(TensorError::ShapeMismatch {
                left: (rows, 1),
                right: targets.shape(),
            });
        }
        match self {
            ElementwiseLoss::BinaryCrossEntropy if cols != 1 => Err(TensorError::ShapeMismatch {
                left: (rows, 1),
                right: scores.shape(),
            }),
            ElementwiseLoss::CategoricalCrossEntropy => {
                for &label in targets.data() {
                    if !(label >= 0.0) || label.fract() != 0.0 {
                        return Err(TensorError::InvalidValue {
                            label: "cross_entropy_class_id",
                        });
                    }
                    if label as usize >= cols {
                        return Err(TensorError::IndexOutOfBounds {
                            index: label as usize,
                            len: cols,
                        });
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// One loss value per row of `scores`.
    pub fn per_sample(&self, scores: &Tensor, targets: &Tensor) -> PureResult<Vec<f32>> {
        self.check(scores, targets)?;
        let losses = match self {
            ElementwiseLoss::BinaryCrossEntropy => scores
                .data()
                .iter()
                .zip(targets.data())
                .map(|(&s, &y)| {
                    let log_p = (-softplus(-s)).max(LOG_FLOOR);
                    let log_q = (-softplus(s)).max(LOG_FLOOR);
                    -(y * log_p + (1.0 - y) * log_q)
                })
                .collect(),
            ElementwiseLoss::CategoricalCrossEntropy => (0..scores.rows())
                .map(|r| {
                    let row = scores.row(r);
                    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                    let lse = max + row.iter().map(|&v| (v - max).exp()).sum::<f32>().ln();
                    lse - row[targets.data()[r] as usize]
                })
                .collect(),
        };
        Ok(losses)
    }

    /// Gradient of each per-sample loss with respect to its own score row.
    pub fn per_sample_grad(&self, scores: &Tensor, targets: &Tensor) -> PureResult<Tensor> {
        self.check(scores, targets)?;
        match self {
            ElementwiseLoss::BinaryCrossEntropy => {
                let grad = scores
                    .data()
                    .iter()
                    .zip(targets.data())
                    .map(|(&s, &y)| sigmoid(s) - y)
                    .collect();
                Tensor::from_vec(scores.rows(), 1, grad)
            }
            ElementwiseLoss::CategoricalCrossEntropy => {
                let (rows, cols) = scores.shape();
                let mut grad = Vec::with_capacity(rows * cols);
                for r in 0..rows {
                    let row = scores.row(r);
                    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                    let total: f32 = row.iter().map(|&v| (v - max).exp()).sum();
                    let label = targets.data()[r] as usize;
                    for (c, &v) in row.iter().enumerate() {
                        let p = (v - max).exp() / total;
                        grad.push(if c == label { p - 1.0 } else { p });
                    }
                }
                Tensor::from_vec(rows, cols, grad)
            }
        }
    }
}

impl Loss for ElementwiseLoss {
    fn forward(&mut self, prediction: &Tensor, target: &Tensor) -> PureResult<Tensor> {
        let losses = self.per_sample(prediction, target)?;
        let mean = losses.iter().sum::<f32>() / losses.len() as f32;
        Tensor::from_vec(1, 1, vec![mean])
    }

    fn backward(&mut self, prediction: &Tensor, target: &Tensor) -> PureResult<Tensor> {
        let inv_batch = 1.0 / prediction.rows() as f32;
        self.per_sample_grad(prediction, target)?.scale(inv_batch)
    }
}
