// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::module::{Module, Parameter};
use crate::{PureResult, Tensor, TensorError};
use std::cell::{Cell, RefCell};

/// How the columns of a flattened row map onto normalised channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureLayout {
    /// `(batch, features)`: one channel per column.
    Flat { features: usize },
    /// `(batch, channels * height * width)`: statistics reduce over the batch
    /// and every spatial position of a channel.
    Spatial {
        channels: usize,
        height: usize,
        width: usize,
    },
}

impl FeatureLayout {
    /// Builds a layout from a full input shape including the batch axis.
    /// Only `[batch, features]` and `[batch, channels, height, width]` are
    /// accepted.
    pub fn from_dims(dims: &[usize]) -> PureResult<Self> {
        let layout = match *dims {
            [_, features] => FeatureLayout::Flat { features },
            [_, channels, height, width] => FeatureLayout::Spatial {
                channels,
                height,
                width,
            },
            _ => return Err(TensorError::UnsupportedInputRank { rank: dims.len() }),
        };
        if layout.channels() == 0 || layout.spatial() == 0 {
            return Err(TensorError::InvalidDimensions {
                rows: layout.channels(),
                cols: layout.spatial(),
            });
        }
        Ok(layout)
    }

    pub fn channels(&self) -> usize {
        match *self {
            FeatureLayout::Flat { features } => features,
            FeatureLayout::Spatial { channels, .. } => channels,
        }
    }

    /// Positions averaged per channel in a single row.
    pub fn spatial(&self) -> usize {
        match *self {
            FeatureLayout::Flat { .. } => 1,
            FeatureLayout::Spatial { height, width, .. } => height * width,
        }
    }

    /// Column count of a flattened row.
    pub fn width(&self) -> usize {
        self.channels() * self.spatial()
    }

    pub(crate) fn guard(&self, input: &Tensor, label: &'static str) -> PureResult<()> {
        let (rows, cols) = input.shape();
        if cols != self.width() {
            return Err(TensorError::ShapeMismatch {
                left: (rows, cols),
                right: (rows, self.width()),
            });
        }
        if rows == 0 {
            return Err(TensorError::EmptyInput(label));
        }
        Ok(())
    }

    /// Per-channel mean and population variance over the listed rows.
    pub(crate) fn channel_stats(&self, input: &Tensor, rows: &[usize]) -> (Vec<f32>, Vec<f32>) {
        let channels = self.channels();
        let spatial = self.spatial();
        let count = (rows.len() * spatial) as f32;
        let mut mean = vec![0.0f32; channels];
        for &row in rows {
            for (channel, map) in input.row(row).chunks(spatial).enumerate() {
                mean[channel] += map.iter().sum::<f32>();
            }
        }
        for value in mean.iter_mut() {
            *value /= count;
        }
        let mut variance = vec![0.0f32; channels];
        for &row in rows {
            for (channel, map) in input.row(row).chunks(spatial).enumerate() {
                variance[channel] += map
                    .iter()
                    .map(|v| (v - mean[channel]) * (v - mean[channel]))
                    .sum::<f32>();
            }
        }
        for value in variance.iter_mut() {
            *value /= count;
        }
        (mean, variance)
    }

    /// `y = (x - mean_c) * inv_std_c * gamma_c + beta_c` for every element.
    pub(crate) fn normalise(
        &self,
        input: &Tensor,
        mean: &[f32],
        inv_std: &[f32],
        affine: Option<(&[f32], &[f32])>,
    ) -> PureResult<Tensor> {
        let spatial = self.spatial();
        let (rows, cols) = input.shape();
        let mut output = Vec::with_capacity(rows * cols);
        for row in 0..rows {
            for (col, value) in input.row(row).iter().enumerate() {
                let c = col / spatial;
                let normed = (value - mean[c]) * inv_std[c];
                output.push(match affine {
                    Some((gamma, beta)) => normed * gamma[c] + beta[c],
                    None => normed,
                });
            }
        }
        Tensor::from_vec(rows, cols, output)
    }
}

/// Batch normalisation over flat features or spatial channel maps.
#[derive(Debug)]
pub struct BatchNorm {
    layout: FeatureLayout,
    epsilon: f32,
    momentum: f32,
    gamma: Parameter,
    beta: Parameter,
    running_mean: RefCell<Tensor>,
    running_var: RefCell<Tensor>,
    training: Cell<bool>,
    last_mean: RefCell<Option<Vec<f32>>>,
    last_inv_std: RefCell<Option<Vec<f32>>>,
}

impl BatchNorm {
    pub fn new(
        name: impl Into<String>,
        layout: FeatureLayout,
        momentum: f32,
        epsilon: f32,
    ) -> PureResult<Self> {
        if layout.channels() == 0 || layout.spatial() == 0 {
            return Err(TensorError::InvalidDimensions {
                rows: layout.channels(),
                cols: layout.spatial(),
            });
        }
        if !(0.0..=1.0).contains(&momentum) || !momentum.is_finite() {
            return Err(TensorError::InvalidValue {
                label: "batchnorm_momentum",
            });
        }
        if epsilon <= 0.0 || !epsilon.is_finite() {
            return Err(TensorError::NonFiniteValue {
                label: "batchnorm_epsilon",
                value: epsilon,
            });
        }
        let name = name.into();
        let channels = layout.channels();
        Ok(Self {
            layout,
            epsilon,
            momentum,
            gamma: Parameter::new(format!("{name}::gamma"), Tensor::full(1, channels, 1.0)?),
            beta: Parameter::new(format!("{name}::beta"), Tensor::zeros(1, channels)?),
            running_mean: RefCell::new(Tensor::zeros(1, channels)?),
            running_var: RefCell::new(Tensor::full(1, channels, 1.0)?),
            training: Cell::new(true),
            last_mean: RefCell::new(None),
            last_inv_std: RefCell::new(None),
        })
    }

    /// `BatchNorm1d(features)` with the usual `momentum = 0.1, eps = 1e-5`.
    pub fn flat(name: impl Into<String>, features: usize) -> PureResult<Self> {
        Self::new(name, FeatureLayout::Flat { features }, 0.1, 1e-5)
    }

    /// `BatchNorm2d(channels)` over `height x width` maps.
    pub fn spatial(
        name: impl Into<String>,
        channels: usize,
        height: usize,
        width: usize,
    ) -> PureResult<Self> {
        Self::new(
            name,
            FeatureLayout::Spatial {
                channels,
                height,
                width,
            },
            0.1,
            1e-5,
        )
    }

    pub fn layout(&self) -> FeatureLayout {
        self.layout
    }

    pub fn momentum(&self) -> f32 {
        self.momentum
    }

    pub fn epsilon(&self) -> f32 {
        self.epsilon
    }

    pub fn gamma(&self) -> &Parameter {
        &self.gamma
    }

    pub fn beta(&self) -> &Parameter {
        &self.beta
    }

    pub fn running_mean(&self) -> Tensor {
        self.running_mean.borrow().clone()
    }

    pub fn running_var(&self) -> Tensor {
        self.running_var.borrow().clone()
    }

    pub fn is_training(&self) -> bool {
        self.training.get()
    }

    pub fn train(&self) {
        self.training.set(true);
    }

    pub fn eval(&self) {
        self.training.set(false);
    }

    fn inv_std(&self, variance: &[f32]) -> Vec<f32> {
        variance
            .iter()
            .map(|v| 1.0 / (v + self.epsilon).sqrt())
            .collect()
    }

    fn blend_running(&self, target: &RefCell<Tensor>, batch_stat: &[f32]) {
        let mut running = target.borrow_mut();
        for (slot, value) in running.data_mut().iter_mut().zip(batch_stat) {
            *slot = self.momentum * value + (1.0 - self.momentum) * *slot;
        }
    }
}

impl Module for BatchNorm {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        self.layout.guard(input, "batchnorm_input")?;
        let (mean, inv_std) = if self.training.get() {
            let rows: Vec<usize> = (0..input.shape().0).collect();
            let (mean, variance) = self.layout.channel_stats(input, &rows);
            self.blend_running(&self.running_mean, &mean);
            self.blend_running(&self.running_var, &variance);
            let inv_std = self.inv_std(&variance);
            *self.last_mean.borrow_mut() = Some(mean.clone());
            *self.last_inv_std.borrow_mut() = Some(inv_std.clone());
            (mean, inv_std)
        } else {
            let mean = self.running_mean.borrow().data().to_vec();
            let inv_std = self.inv_std(self.running_var.borrow().data());
            (mean, inv_std)
        };
        self.layout.normalise(
            input,
            &mean,
            &inv_std,
            Some((self.gamma.value().data(), self.beta.value().data())),
        )
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        self.layout.guard(input, "batchnorm_input")?;
        if input.shape() != grad_output.shape() {
            return Err(TensorError::ShapeMismatch {
                left: input.shape(),
                right: grad_output.shape(),
            });
        }
        if !self.training.get() {
            return Err(TensorError::InvalidValue {
                label: "batchnorm_backward_eval",
            });
        }
        let mean = self
            .last_mean
            .borrow()
            .clone()
            .ok_or(TensorError::InvalidValue {
                label: "batchnorm_cached_mean",
            })?;
        let inv_std = self
            .last_inv_std
            .borrow()
            .clone()
            .ok_or(TensorError::InvalidValue {
                label: "batchnorm_cached_invstd",
            })?;

        let (batch, cols) = input.shape();
        let channels = self.layout.channels();
        let spatial = self.layout.spatial();
        let count = (batch * spatial) as f32;
        let gamma = self.gamma.value().data();
        let x = input.data();
        let g = grad_output.data();

        let mut grad_gamma = vec![0.0f32; channels];
        let mut grad_beta = vec![0.0f32; channels];
        for idx in 0..batch * cols {
            let c = (idx % cols) / spatial;
            let normed = (x[idx] - mean[c]) * inv_std[c];
            grad_gamma[c] += g[idx] * normed;
            grad_beta[c] += g[idx];
        }
        let mut grad_input = vec![0.0f32; batch * cols];
        for idx in 0..batch * cols {
            let c = (idx % cols) / spatial;
            let normed = (x[idx] - mean[c]) * inv_std[c];
            let term = count * g[idx] - grad_beta[c] - normed * grad_gamma[c];
            grad_input[idx] = gamma[c] * inv_std[c] * term / count;
        }

        self.gamma
            .accumulate_euclidean(&Tensor::from_vec(1, channels, grad_gamma)?)?;
        self.beta
            .accumulate_euclidean(&Tensor::from_vec(1, channels, grad_beta)?)?;
        Tensor::from_vec(batch, cols, grad_input)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&self.gamma)?;
        visitor(&self.beta)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&mut self.gamma)?;
        visitor(&mut self.beta)
    }

    fn set_training(&self, training: bool) {
        self.training.set(training);
    }
}
