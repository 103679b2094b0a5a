// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use super::{BraidModule, BraidPair};
use crate::layers::{BatchNorm, ClassConditionalBatchNorm, FeatureLayout, PartitionBook};
use crate::module::{Module, Parameter};
use crate::PureResult;

/// Which normaliser a braid batch norm runs over the stacked branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BraidNormKind {
    Batch,
    ClassConditional { num_classes: usize },
}

#[derive(Debug)]
enum Normaliser {
    Batch(BatchNorm),
    ClassConditional(ClassConditionalBatchNorm),
}

impl Normaliser {
    fn as_module(&self) -> &dyn Module {
        match self {
            Normaliser::Batch(bn) => bn,
            Normaliser::ClassConditional(bn) => bn,
        }
    }

    fn as_module_mut(&mut self) -> &mut dyn Module {
        match self {
            Normaliser::Batch(bn) => bn,
            Normaliser::ClassConditional(bn) => bn,
        }
    }
}

/// Normalises both branches with shared statistics: stack on the batch axis,
/// normalise once, split back in order.
#[derive(Debug)]
pub struct BraidBatchNorm {
    norm: Normaliser,
}

impl BraidBatchNorm {
    pub fn new(name: impl Into<String>, layout: FeatureLayout, kind: BraidNormKind) -> PureResult<Self> {
        let norm = match kind {
            BraidNormKind::Batch => Normaliser::Batch(BatchNorm::new(name, layout, 0.1, 1e-5)?),
            BraidNormKind::ClassConditional { num_classes } => Normaliser::ClassConditional(
                ClassConditionalBatchNorm::new(name, layout, num_classes, 0.1, 1e-5, true)?,
            ),
        };
        Ok(Self { norm })
    }

    pub fn flat(name: impl Into<String>, features: usize) -> PureResult<Self> {
        Self::new(name, FeatureLayout::Flat { features }, BraidNormKind::Batch)
    }

    pub fn kind(&self) -> BraidNormKind {
        match &self.norm {
            Normaliser::Batch(_) => BraidNormKind::Batch,
            Normaliser::ClassConditional(bn) => BraidNormKind::ClassConditional {
                num_classes: bn.num_classes(),
            },
        }
    }
}

impl BraidModule for BraidBatchNorm {
    fn forward(&self, input: &BraidPair) -> PureResult<BraidPair> {
        let stacked = input.to_bi()?;
        let normed = self.norm.as_module().forward(&stacked)?;
        BraidPair::from_bi(&normed)
    }

    fn backward(&mut self, input: &BraidPair, grad_output: &BraidPair) -> PureResult<BraidPair> {
        let stacked = input.to_bi()?;
        let grad = grad_output.to_bi()?;
        let grad_in = self.norm.as_module_mut().backward(&stacked, &grad)?;
        BraidPair::from_bi(&grad_in)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.norm.as_module().visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.norm.as_module_mut().visit_parameters_mut(visitor)
    }

    fn set_training(&self, training: bool) {
        self.norm.as_module().set_training(training);
    }

    fn bind_partitions(&self, partitions: &PartitionBook) {
        self.norm.as_module().bind_partitions(partitions);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Tensor;
    use approx::assert_abs_diff_eq;

    #[test]
    fn branches_share_statistics() {
        let bn = BraidBatchNorm::flat("wbn", 1).unwrap();
        let input = BraidPair::new(
            Tensor::from_vec(2, 1, vec![0.0, 2.0]).unwrap(),
            Tensor::from_vec(2, 1, vec![4.0, 6.0]).unwrap(),
        )
        .unwrap();
        let out = bn.forward(&input).unwrap();
        // stacked mean 3, variance 5
        let scale = 1.0 / (5.0f32 + 1e-5).sqrt();
        assert_abs_diff_eq!(out.a.data()[0], -3.0 * scale, epsilon = 1e-5);
        assert_abs_diff_eq!(out.b.data()[1], 3.0 * scale, epsilon = 1e-5);

        let swapped = bn.forward(&input.clone().swap()).unwrap();
        assert_eq!(swapped.a, out.b);
        assert_eq!(swapped.b, out.a);
    }

    #[test]
    fn class_conditional_kind_uses_braided_partition() {
        let layout = FeatureLayout::Flat { features: 1 };
        let bn = BraidBatchNorm::new(
            "wbn",
            layout,
            BraidNormKind::ClassConditional { num_classes: 2 },
        )
        .unwrap();
        let input = BraidPair::new(
            Tensor::from_vec(2, 1, vec![0.0, 2.0]).unwrap(),
            Tensor::from_vec(2, 1, vec![4.0, 6.0]).unwrap(),
        )
        .unwrap();
        assert!(bn.forward(&input).is_err());

        // rows {0, 2} are class 0 and rows {1, 3} are class 1 once stacked
        let book = PartitionBook::from_labels(&[0, 1], 2).unwrap();
        bn.bind_partitions(&book);
        let out = bn.forward(&input).unwrap();
        assert_abs_diff_eq!(out.a.data()[0] + out.b.data()[1], 0.0, epsilon = 1e-4);
        assert_eq!(bn.kind(), BraidNormKind::ClassConditional { num_classes: 2 });
    }
}
