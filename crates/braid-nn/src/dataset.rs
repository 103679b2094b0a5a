// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::braid::BraidPair;
use crate::{PureResult, Tensor, TensorError};

/// Feature rows tagged with identity labels.
#[derive(Debug, Clone)]
pub struct PairDataset {
    features: Tensor,
    identities: Vec<usize>,
}

/// One gathered batch of pairs.
#[derive(Debug, Clone)]
pub struct PairBatch {
    pub pair: BraidPair,
    /// `(batch, 1)` column, `1.0` where both sides share an identity.
    pub targets: Tensor,
    /// The same targets as class ids for partitioning.
    pub labels: Vec<usize>,
}

impl PairDataset {
    pub fn new(features: Tensor, identities: Vec<usize>) -> PureResult<Self> {
        if features.rows() != identities.len() {
            return Err(TensorError::DataLength {
                expected: features.rows(),
                got: identities.len(),
            });
        }
        Ok(Self {
            features,
            identities,
        })
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    pub fn feature_dim(&self) -> usize {
        self.features.cols()
    }

    pub fn identities(&self) -> &[usize] {
        &self.identities
    }

    pub fn gather(&self, pairs: &[(usize, usize)]) -> PureResult<PairBatch> {
        let (left, right): (Vec<usize>, Vec<usize>) = pairs.iter().copied().unzip();
        let pair = BraidPair::new(
            self.features.select_rows(&left)?,
            self.features.select_rows(&right)?,
        )?;
        let labels: Vec<usize> = pairs
            .iter()
            .map(|&(a, b)| usize::from(self.identities[a] == self.identities[b]))
            .collect();
        let targets = Tensor::from_vec(
            labels.len(),
            1,
            labels.iter().map(|&label| label as f32).collect(),
        )?;
        Ok(PairBatch {
            pair,
            targets,
            labels,
        })
    }
}
