// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Batch normalisation whose statistics are the uniform average of per-class
//! statistics, so the class mix of a sampled batch does not move the running
//! estimates.

use super::normalization::{BatchNorm, FeatureLayout};
use crate::module::{Module, Parameter};
use crate::{PureResult, Tensor, TensorError};
use std::cell::{Cell, RefCell};
use tracing::warn;

/// Row indices of one batch grouped by class id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchPartition {
    groups: Vec<Vec<usize>>,
}

impl BatchPartition {
    pub fn new(groups: Vec<Vec<usize>>) -> Self {
        Self { groups }
    }

    pub fn groups(&self) -> &[Vec<usize>] {
        &self.groups
    }

    pub fn num_groups(&self) -> usize {
        self.groups.len()
    }

    /// Same grouping with every index shifted by `offset`.
    fn shifted(&self, offset: usize) -> Self {
        Self {
            groups: self
                .groups
                .iter()
                .map(|group| group.iter().map(|row| row + offset).collect())
                .collect(),
        }
    }
}

/// The two partitions a braided step produces: one for tensors holding a
/// single branch (`batch_size` rows) and one for tensors where both branches
/// were concatenated on the batch axis (`2 * batch_size` rows).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionBook {
    batch_size: usize,
    indices: BatchPartition,
    braid_indices: BatchPartition,
}

impl PartitionBook {
    pub fn new(batch_size: usize, indices: BatchPartition, braid_indices: BatchPartition) -> Self {
        Self {
            batch_size,
            indices,
            braid_indices,
        }
    }

    /// Groups pair labels by class. Branch B rows of the braided partition sit
    /// `labels.len()` rows after their branch A counterparts.
    pub fn from_labels(labels: &[usize], num_classes: usize) -> PureResult<Self> {
        if labels.is_empty() {
            return Err(TensorError::EmptyInput("partition_labels"));
        }
        let mut groups = vec![Vec::new(); num_classes];
        for (row, &label) in labels.iter().enumerate() {
            let group = groups.get_mut(label).ok_or(TensorError::IndexOutOfBounds {
                index: label,
                len: num_classes,
            })?;
            group.push(row);
        }
        let indices = BatchPartition::new(groups);
        let shifted = indices.shifted(labels.len());
        let braid_indices = BatchPartition::new(
            indices
                .groups()
                .iter()
                .zip(shifted.groups())
                .map(|(a, b)| a.iter().chain(b).copied().collect())
                .collect(),
        );
        Ok(Self::new(labels.len(), indices, braid_indices))
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Picks the primary partition when `rows` equals the primary batch size,
    /// the braided one otherwise.
    pub fn select(&self, rows: usize) -> &BatchPartition {
        if rows == self.batch_size {
            &self.indices
        } else {
            &self.braid_indices
        }
    }
}

/// Class-conditional batch normalisation with bias-corrected running
/// statistics.
#[derive(Debug)]
pub struct ClassConditionalBatchNorm {
    layout: FeatureLayout,
    num_classes: usize,
    epsilon: f32,
    momentum: f32,
    gamma: Option<Parameter>,
    beta: Option<Parameter>,
    running_mean: RefCell<Vec<f32>>,
    running_var: RefCell<Vec<f32>>,
    class_means: RefCell<Vec<Vec<f32>>>,
    class_vars: RefCell<Vec<Vec<f32>>>,
    batches_tracked: Cell<u64>,
    training: Cell<bool>,
    partitions: RefCell<Option<PartitionBook>>,
    last_inv_std: RefCell<Option<Vec<f32>>>,
}

impl ClassConditionalBatchNorm {
    pub fn new(
        name: impl Into<String>,
        layout: FeatureLayout,
        num_classes: usize,
        momentum: f32,
        epsilon: f32,
        affine: bool,
    ) -> PureResult<Self> {
        let channels = layout.channels();
        if channels == 0 || layout.spatial() == 0 || num_classes == 0 {
            return Err(TensorError::InvalidDimensions {
                rows: num_classes,
                cols: channels,
            });
        }
        // momentum = 0 would make the bias correction divide by zero
        if !(momentum > 0.0 && momentum <= 1.0) {
            return Err(TensorError::InvalidValue {
                label: "class_batchnorm_momentum",
            });
        }
        if epsilon <= 0.0 || !epsilon.is_finite() {
            return Err(TensorError::NonFiniteValue {
                label: "class_batchnorm_epsilon",
                value: epsilon,
            });
        }
        let name = name.into();
        let (gamma, beta) = if affine {
            (
                Some(Parameter::new(
                    format!("{name}::gamma"),
                    Tensor::full(1, channels, 1.0)?,
                )),
                Some(Parameter::new(
                    format!("{name}::beta"),
                    Tensor::zeros(1, channels)?,
                )),
            )
        } else {
            (None, None)
        };
        Ok(Self {
            layout,
            num_classes,
            epsilon,
            momentum,
            gamma,
            beta,
            running_mean: RefCell::new(vec![0.0; channels]),
            running_var: RefCell::new(vec![0.0; channels]),
            class_means: RefCell::new(vec![vec![0.0; channels]; num_classes]),
            class_vars: RefCell::new(vec![vec![0.0; channels]; num_classes]),
            batches_tracked: Cell::new(0),
            training: Cell::new(true),
            partitions: RefCell::new(None),
            last_inv_std: RefCell::new(None),
        })
    }

    /// Builds the layer for inputs shaped like `dims` (batch axis first).
    /// Only rank 2 and rank 4 inputs are supported.
    pub fn for_input_dims(
        name: impl Into<String>,
        dims: &[usize],
        num_classes: usize,
    ) -> PureResult<Self> {
        let layout = FeatureLayout::from_dims(dims)?;
        Self::new(name, layout, num_classes, 0.1, 1e-5, true)
    }

    /// Converts a plain batch norm, keeping its affine parameters and running
    /// statistics.
    pub fn from_batch_norm(
        name: impl Into<String>,
        source: &BatchNorm,
        num_classes: usize,
    ) -> PureResult<Self> {
        let mut layer = Self::new(
            name,
            source.layout(),
            num_classes,
            source.momentum(),
            source.epsilon(),
            true,
        )?;
        *layer.running_mean.get_mut() = source.running_mean().data().to_vec();
        *layer.running_var.get_mut() = source.running_var().data().to_vec();
        if let Some(gamma) = layer.gamma.as_mut() {
            gamma.load_value(source.gamma().value())?;
        }
        if let Some(beta) = layer.beta.as_mut() {
            beta.load_value(source.beta().value())?;
        }
        Ok(layer)
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn batches_tracked(&self) -> u64 {
        self.batches_tracked.get()
    }

    pub fn running_mean(&self) -> Vec<f32> {
        self.running_mean.borrow().clone()
    }

    pub fn running_var(&self) -> Vec<f32> {
        self.running_var.borrow().clone()
    }

    /// Running mean of a single class, `None` for an unknown class id.
    pub fn class_running_mean(&self, class: usize) -> Option<Vec<f32>> {
        self.class_means.borrow().get(class).cloned()
    }

    pub fn class_running_var(&self, class: usize) -> Option<Vec<f32>> {
        self.class_vars.borrow().get(class).cloned()
    }

    pub fn train(&self) {
        self.training.set(true);
    }

    pub fn eval(&self) {
        self.training.set(false);
    }

    /// Stores the partitions used by [`Module::forward`] until replaced.
    pub fn set_partitions(&self, book: PartitionBook) {
        *self.partitions.borrow_mut() = Some(book);
    }

    /// `1 - (1 - momentum)^t`; `1` before the first tracked batch.
    pub fn correction_factor(&self) -> f32 {
        let tracked = self.batches_tracked.get();
        if tracked == 0 {
            return 1.0;
        }
        let exponent = i32::try_from(tracked).unwrap_or(i32::MAX);
        1.0 - (1.0 - self.momentum).powi(exponent)
    }

    /// Normalises `input` using the partition that matches its batch size.
    pub fn forward_with(&self, input: &Tensor, book: &PartitionBook) -> PureResult<Tensor> {
        self.layout.guard(input, "class_batchnorm_input")?;
        if self.training.get() {
            self.track(input, book.select(input.shape().0))?;
        }
        self.apply(input)
    }

    fn track(&self, input: &Tensor, partition: &BatchPartition) -> PureResult<()> {
        if partition.num_groups() != self.num_classes {
            return Err(TensorError::PartitionSizeMismatch {
                expected: self.num_classes,
                got: partition.num_groups(),
            });
        }
        let rows = input.shape().0;
        if let Some(&index) = partition.groups().iter().flatten().find(|&&index| index >= rows) {
            return Err(TensorError::IndexOutOfBounds { index, len: rows });
        }
        let channels = self.layout.channels();
        let mut mean_sum = vec![0.0f32; channels];
        let mut var_sum = vec![0.0f32; channels];
        let mut present = 0usize;
        {
            let mut class_means = self.class_means.borrow_mut();
            let mut class_vars = self.class_vars.borrow_mut();
            for (class, group) in partition.groups().iter().enumerate() {
                if group.is_empty() {
                    warn!(
                        class,
                        "no sample of this class in the current batch; skipping its statistics"
                    );
                    continue;
                }
                let (mean, var) = self.layout.channel_stats(input, group);
                self.blend(&mut class_means[class], &mean);
                self.blend(&mut class_vars[class], &var);
                for c in 0..channels {
                    mean_sum[c] += mean[c];
                    var_sum[c] += var[c];
                }
                present += 1;
            }
        }
        if present == 0 {
            return Err(TensorError::EmptyInput("class_batchnorm_partition"));
        }
        let scale = 1.0 / present as f32;
        let di_mean: Vec<f32> = mean_sum.iter().map(|v| v * scale).collect();
        let di_var: Vec<f32> = var_sum.iter().map(|v| v * scale).collect();
        self.blend(&mut self.running_mean.borrow_mut(), &di_mean);
        self.blend(&mut self.running_var.borrow_mut(), &di_var);
        self.batches_tracked.set(self.batches_tracked.get() + 1);
        Ok(())
    }

    fn blend(&self, running: &mut [f32], batch_stat: &[f32]) {
        for (slot, value) in running.iter_mut().zip(batch_stat) {
            *slot = (1.0 - self.momentum) * *slot + self.momentum * value;
        }
    }

    fn apply(&self, input: &Tensor) -> PureResult<Tensor> {
        let correction = self.correction_factor();
        let mean: Vec<f32> = self
            .running_mean
            .borrow()
            .iter()
            .map(|m| m / correction)
            .collect();
        let inv_std: Vec<f32> = self
            .running_var
            .borrow()
            .iter()
            .map(|v| 1.0 / (v / correction + self.epsilon).sqrt())
            .collect();
        let affine = match (self.gamma.as_ref(), self.beta.as_ref()) {
            (Some(gamma), Some(beta)) => Some((gamma.value().data(), beta.value().data())),
            _ => None,
        };
        let output = self.layout.normalise(input, &mean, &inv_std, affine)?;
        *self.last_inv_std.borrow_mut() = Some(inv_std);
        Ok(output)
    }
}

impl Module for ClassConditionalBatchNorm {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        if !self.training.get() {
            self.layout.guard(input, "class_batchnorm_input")?;
            return self.apply(input);
        }
        let book = self.partitions.borrow().clone();
        match book {
            Some(book) => self.forward_with(input, &book),
            None => Err(TensorError::InvalidValue {
                label: "class_batchnorm_partitions",
            }),
        }
    }

    /// Running statistics are constants of the forward graph, so the input
    /// gradient is a per-channel rescale.
    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        self.layout.guard(input, "class_batchnorm_input")?;
        if input.shape() != grad_output.shape() {
            return Err(TensorError::ShapeMismatch {
                left: input.shape(),
                right: grad_output.shape(),
            });
        }
        let inv_std = self
            .last_inv_std
            .borrow()
            .clone()
            .ok_or(TensorError::InvalidValue {
                label: "class_batchnorm_cached_invstd",
            })?;
        let correction = self.correction_factor();
        let mean: Vec<f32> = self
            .running_mean
            .borrow()
            .iter()
            .map(|m| m / correction)
            .collect();
        let (rows, cols) = input.shape();
        let channels = self.layout.channels();
        let spatial = self.layout.spatial();
        let ones = vec![1.0f32; channels];
        let gamma = self
            .gamma
            .as_ref()
            .map(|g| g.value().data().to_vec())
            .unwrap_or(ones);

        let mut grad_gamma = vec![0.0f32; channels];
        let mut grad_beta = vec![0.0f32; channels];
        let mut grad_input = Vec::with_capacity(rows * cols);
        for (idx, (x, g)) in input.data().iter().zip(grad_output.data()).enumerate() {
            let c = (idx % cols) / spatial;
            let normed = (x - mean[c]) * inv_std[c];
            grad_gamma[c] += g * normed;
            grad_beta[c] += g;
            grad_input.push(g * gamma[c] * inv_std[c]);
        }
        if let Some(param) = self.gamma.as_mut() {
            param.accumulate_euclidean(&Tensor::from_vec(1, channels, grad_gamma)?)?;
        }
        if let Some(param) = self.beta.as_mut() {
            param.accumulate_euclidean(&Tensor::from_vec(1, channels, grad_beta)?)?;
        }
        Tensor::from_vec(rows, cols, grad_input)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        if let Some(gamma) = self.gamma.as_ref() {
            visitor(gamma)?;
        }
        if let Some(beta) = self.beta.as_ref() {
            visitor(beta)?;
        }
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        if let Some(gamma) = self.gamma.as_mut() {
            visitor(gamma)?;
        }
        if let Some(beta) = self.beta.as_mut() {
            visitor(beta)?;
        }
        Ok(())
    }

    fn set_training(&self, training: bool) {
        self.training.set(training);
    }

    fn bind_partitions(&self, partitions: &PartitionBook) {
        self.set_partitions(partitions.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn two_class_book() -> PartitionBook {
        PartitionBook::from_labels(&[1, 0, 0, 1], 2).unwrap()
    }

    #[test]
    fn partition_book_offsets_braided_rows() {
        let book = two_class_book();
        assert_eq!(book.select(4).groups(), &[vec![1, 2], vec![0, 3]]);
        assert_eq!(
            book.select(8).groups(),
            &[vec![1, 2, 5, 6], vec![0, 3, 4, 7]]
        );
        let err = PartitionBook::from_labels(&[0, 2], 2).unwrap_err();
        assert!(matches!(err, TensorError::IndexOutOfBounds { index: 2, .. }));
    }

    #[test]
    fn group_count_must_match_num_classes() {
        let bn = ClassConditionalBatchNorm::new(
            "ccbn",
            FeatureLayout::Flat { features: 2 },
            3,
            0.1,
            1e-5,
            true,
        )
        .unwrap();
        let input = Tensor::random_normal(4, 2, 0.0, 1.0, Some(1)).unwrap();
        let err = bn.forward_with(&input, &two_class_book()).unwrap_err();
        assert!(matches!(
            err,
            TensorError::PartitionSizeMismatch {
                expected: 3,
                got: 2
            }
        ));
        assert_eq!(bn.batches_tracked(), 0);
    }

    #[test]
    fn rejects_unsupported_rank() {
        let err = ClassConditionalBatchNorm::for_input_dims("ccbn", &[4, 2, 3], 2).unwrap_err();
        assert!(matches!(err, TensorError::UnsupportedInputRank { rank: 3 }));
        assert!(ClassConditionalBatchNorm::for_input_dims("ccbn", &[4, 2, 3, 3], 2).is_ok());
    }

    #[test]
    fn first_step_normalises_with_class_averaged_statistics() {
        let bn = ClassConditionalBatchNorm::new(
            "ccbn",
            FeatureLayout::Flat { features: 1 },
            2,
            0.1,
            1e-5,
            false,
        )
        .unwrap();
        // class 0 rows {0, 1, 2}: mean 1, var 2/3; class 1 row {3}: mean 10, var 0
        let input = Tensor::from_vec(4, 1, vec![0.0, 1.0, 2.0, 10.0]).unwrap();
        let book = PartitionBook::from_labels(&[0, 0, 0, 1], 2).unwrap();
        let out = bn.forward_with(&input, &book).unwrap();
        assert_eq!(bn.batches_tracked(), 1);
        let mean = 5.5f32;
        let var = 1.0f32 / 3.0;
        for (got, x) in out.data().iter().zip(input.data()) {
            assert_abs_diff_eq!(*got, (x - mean) / (var + 1e-5).sqrt(), epsilon = 1e-3);
        }
        assert_abs_diff_eq!(bn.class_running_mean(1).unwrap()[0], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn spatial_statistics_reduce_over_batch_and_positions() {
        let bn = ClassConditionalBatchNorm::new(
            "ccbn",
            FeatureLayout::Spatial {
                channels: 2,
                height: 1,
                width: 2,
            },
            2,
            0.1,
            1e-5,
            false,
        )
        .unwrap();
        // rows are [c0 (1x2) | c1 (1x2)]
        let input = Tensor::from_vec(
            3,
            4,
            vec![
                1.0, 3.0, 0.0, 0.0, //
                5.0, 7.0, 2.0, 2.0, //
                10.0, 10.0, -4.0, 4.0,
            ],
        )
        .unwrap();
        let book = PartitionBook::from_labels(&[0, 0, 1], 2).unwrap();
        let out = bn.forward_with(&input, &book).unwrap();

        // class 0: c0 {1,3,5,7} -> (4, 5), c1 {0,0,2,2} -> (1, 1)
        // class 1: c0 {10,10} -> (10, 0), c1 {-4,4} -> (0, 16)
        let class0 = bn.class_running_mean(0).unwrap();
        assert_abs_diff_eq!(class0[0], 0.4, epsilon = 1e-6);
        assert_abs_diff_eq!(class0[1], 0.1, epsilon = 1e-6);
        let class1 = bn.class_running_var(1).unwrap();
        assert_abs_diff_eq!(class1[0], 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(class1[1], 1.6, epsilon = 1e-6);

        let mean = [7.0f32, 0.5];
        let var = [2.5f32, 8.5];
        for row in 0..3 {
            for (col, got) in out.row(row).iter().enumerate() {
                let channel = col / 2;
                let x = input.row(row)[col];
                let expected = (x - mean[channel]) / (var[channel] + 1e-5).sqrt();
                assert_abs_diff_eq!(*got, expected, epsilon = 1e-4);
            }
        }
    }

    #[test]
    fn empty_group_is_skipped() {
        let bn = ClassConditionalBatchNorm::new(
            "ccbn",
            FeatureLayout::Flat { features: 1 },
            2,
            0.5,
            1e-5,
            false,
        )
        .unwrap();
        let input = Tensor::from_vec(2, 1, vec![1.0, 3.0]).unwrap();
        let book = PartitionBook::from_labels(&[0, 0], 2).unwrap();
        bn.forward_with(&input, &book).unwrap();
        assert_abs_diff_eq!(bn.running_mean()[0], 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(bn.running_var()[0], 0.5, epsilon = 1e-6);
        assert_eq!(bn.class_running_mean(1).unwrap(), vec![0.0]);
    }

    #[test]
    fn evaluation_freezes_statistics() {
        let bn = ClassConditionalBatchNorm::new(
            "ccbn",
            FeatureLayout::Flat { features: 1 },
            2,
            0.1,
            1e-5,
            true,
        )
        .unwrap();
        let input = Tensor::from_vec(4, 1, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        bn.set_partitions(two_class_book());
        bn.forward(&input).unwrap();
        let mean = bn.running_mean();
        bn.eval();
        let out = bn.forward(&input).unwrap();
        assert_eq!(bn.running_mean(), mean);
        assert_eq!(bn.batches_tracked(), 1);
        // t = 1 so the correction factor restores the batch statistics
        assert_abs_diff_eq!(bn.correction_factor(), 0.1, epsilon = 1e-6);
        assert_abs_diff_eq!(out.data()[0] + out.data()[3], 0.0, epsilon = 1e-4);
    }

    #[test]
    fn training_forward_requires_partitions() {
        let bn = ClassConditionalBatchNorm::for_input_dims("ccbn", &[2, 1], 2).unwrap();
        let input = Tensor::from_vec(2, 1, vec![1.0, 2.0]).unwrap();
        assert!(bn.forward(&input).is_err());
    }

    #[test]
    fn converts_from_plain_batch_norm() {
        let source = BatchNorm::flat("bn", 2).unwrap();
        source
            .forward(&Tensor::from_vec(2, 2, vec![1.0, 2.0, 3.0, 4.0]).unwrap())
            .unwrap();
        let converted = ClassConditionalBatchNorm::from_batch_norm("ccbn", &source, 2).unwrap();
        assert_eq!(converted.running_mean(), source.running_mean().data().to_vec());
        assert_eq!(converted.num_classes(), 2);
        assert_eq!(converted.state_dict().unwrap().len(), 2);
    }

    #[test]
    fn backward_rescales_by_inverse_std() {
        let mut bn = ClassConditionalBatchNorm::new(
            "ccbn",
            FeatureLayout::Flat { features: 1 },
            2,
            1.0,
            1e-5,
            true,
        )
        .unwrap();
        let input = Tensor::from_vec(4, 1, vec![1.0, 1.0, 3.0, 3.0]).unwrap();
        let book = PartitionBook::from_labels(&[0, 1, 0, 1], 2).unwrap();
        bn.forward_with(&input, &book).unwrap();
        let grad = bn
            .backward(&input, &Tensor::full(4, 1, 1.0).unwrap())
            .unwrap();
        let expected = 1.0 / (1.0f32 + 1e-5).sqrt();
        for value in grad.data() {
            assert_abs_diff_eq!(*value, expected, epsilon = 1e-6);
        }
    }
}
