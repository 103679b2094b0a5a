// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Paired-input ("braid") layers. Every layer here maps `(A, B)` to
//! `(outA, outB)` such that feeding `(B, A)` yields `(outB, outA)`.

pub mod blocks;
pub mod conv;
pub mod linear;
pub mod net;
pub mod norm;

pub use blocks::{
    BraidConvBlock, DenseLinearBraidBlock, FcBlock, Fusion, FusionHead, LinearBraidBlock,
    ResLinearBraidBlock,
};
pub use conv::BraidConv2d;
pub use linear::{symmetrize_gradient, symmetrize_weight, BraidLinear, WideBraidLinear};
pub use net::BraidNet;
pub use norm::{BraidBatchNorm, BraidNormKind};

use crate::layers::PartitionBook;
use crate::module::Parameter;
use crate::{PureResult, Tensor, TensorError};
use std::collections::HashMap;

/// Two branch tensors of identical shape.
#[derive(Debug, Clone, PartialEq)]
pub struct BraidPair {
    pub a: Tensor,
    pub b: Tensor,
}

impl BraidPair {
    pub fn new(a: Tensor, b: Tensor) -> PureResult<Self> {
        if a.shape() != b.shape() {
            return Err(TensorError::ShapeMismatch {
                left: a.shape(),
                right: b.shape(),
            });
        }
        Ok(Self { a, b })
    }

    pub fn shape(&self) -> (usize, usize) {
        self.a.shape()
    }

    pub fn batch(&self) -> usize {
        self.a.shape().0
    }

    /// `(A, B) -> (B, A)`.
    pub fn swap(self) -> Self {
        Self {
            a: self.b,
            b: self.a,
        }
    }

    /// Stacks both branches on the batch axis (`Pair2Bi`).
    pub fn to_bi(&self) -> PureResult<Tensor> {
        Tensor::cat_rows(&[self.a.clone(), self.b.clone()])
    }

    /// Splits a stacked tensor back into its branches (`Bi2Braid`).
    pub fn from_bi(stacked: &Tensor) -> PureResult<Self> {
        let rows = stacked.shape().0;
        if rows % 2 != 0 {
            return Err(TensorError::InvalidDimensions {
                rows,
                cols: stacked.shape().1,
            });
        }
        let (a, b) = stacked.split_rows(rows / 2)?;
        Ok(Self { a, b })
    }

    /// Concatenates several pairs branch-wise along the feature axis.
    pub fn cat_features(pairs: &[BraidPair]) -> PureResult<Self> {
        let a: Vec<Tensor> = pairs.iter().map(|pair| pair.a.clone()).collect();
        let b: Vec<Tensor> = pairs.iter().map(|pair| pair.b.clone()).collect();
        Self::new(Tensor::cat_cols(&a)?, Tensor::cat_cols(&b)?)
    }

    /// Branch-wise sum.
    pub fn add(&self, other: &BraidPair) -> PureResult<Self> {
        Self::new(self.a.add(&other.a)?, self.b.add(&other.b)?)
    }

    /// Applies `f` to each branch independently.
    pub fn map_branches(
        &self,
        mut f: impl FnMut(&Tensor) -> PureResult<Tensor>,
    ) -> PureResult<Self> {
        Self::new(f(&self.a)?, f(&self.b)?)
    }
}

/// Module over braid pairs, mirroring [`crate::module::Module`].
pub trait BraidModule {
    fn forward(&self, input: &BraidPair) -> PureResult<BraidPair>;

    /// Accumulates parameter gradients and returns the gradient wrt both
    /// input branches.
    fn backward(&mut self, input: &BraidPair, grad_output: &BraidPair) -> PureResult<BraidPair>;

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()>;

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()>;

    fn set_training(&self, _training: bool) {}

    fn bind_partitions(&self, _partitions: &PartitionBook) {}

    /// Restores tied-weight structure in the accumulated gradients. Called
    /// after backward and before the optimiser step.
    fn correct_gradients(&mut self) -> PureResult<()> {
        Ok(())
    }

    /// Restores tied-weight structure in the parameter values.
    fn correct_parameters(&mut self) -> PureResult<()> {
        Ok(())
    }

    fn apply_step(&mut self, learning_rate: f32) -> PureResult<()> {
        self.visit_parameters_mut(&mut |param| param.apply_step(learning_rate))
    }

    fn zero_accumulators(&mut self) -> PureResult<()> {
        self.visit_parameters_mut(&mut |param| {
            param.zero_gradient();
            Ok(())
        })
    }

    fn state_dict(&self) -> PureResult<HashMap<String, Tensor>> {
        let mut state = HashMap::new();
        self.visit_parameters(&mut |param| {
            state.insert(param.name().to_string(), param.value().clone());
            Ok(())
        })?;
        Ok(state)
    }

    fn load_state_dict(&mut self, state: &HashMap<String, Tensor>) -> PureResult<()> {
        self.visit_parameters_mut(&mut |param| {
            let Some(value) = state.get(param.name()) else {
                return Err(TensorError::MissingParameter {
                    name: param.name().to_string(),
                });
            };
            param.load_value(value)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bi_round_trip_keeps_branch_order() {
        let a = Tensor::from_vec(2, 1, vec![1.0, 2.0]).unwrap();
        let b = Tensor::from_vec(2, 1, vec![3.0, 4.0]).unwrap();
        let pair = BraidPair::new(a, b).unwrap();
        let stacked = pair.to_bi().unwrap();
        assert_eq!(stacked.data(), &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(BraidPair::from_bi(&stacked).unwrap(), pair);
        let swapped = pair.clone().swap();
        assert_eq!(swapped.a, pair.b);
    }

    #[test]
    fn mismatched_branches_are_rejected() {
        let a = Tensor::zeros(2, 1).unwrap();
        let b = Tensor::zeros(1, 2).unwrap();
        assert!(BraidPair::new(a, b).is_err());
        assert!(BraidPair::from_bi(&Tensor::zeros(3, 1).unwrap()).is_err());
    }
}
