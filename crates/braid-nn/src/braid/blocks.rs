// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Composite braid blocks. Each block caches the activations of its last
//! forward pass so that backward does not rerun the normalisers (which would
//! advance their running statistics twice).

use super::{BraidBatchNorm, BraidConv2d, BraidLinear, BraidModule, BraidNormKind, BraidPair};
use crate::layers::{
    BatchNorm, FeatureLayout, GlobalAvgPool2d, Linear, MaxPool2d, PartitionBook, Relu,
};
use crate::module::{Module, Parameter};
use crate::{PureResult, Tensor, TensorError};
use std::cell::RefCell;

fn relu_pair(input: &BraidPair) -> PureResult<BraidPair> {
    let relu = Relu::new();
    input.map_branches(|t| relu.forward(t))
}

fn relu_pair_backward(input: &BraidPair, grad: &BraidPair) -> PureResult<BraidPair> {
    let mut relu = Relu::new();
    BraidPair::new(
        relu.backward(&input.a, &grad.a)?,
        relu.backward(&input.b, &grad.b)?,
    )
}

fn missing_cache(label: &'static str) -> TensorError {
    TensorError::InvalidValue { label }
}

#[derive(Debug, Clone)]
struct ActivationCache {
    pre_norm: BraidPair,
    normed: BraidPair,
}

/// `BraidLinear (no bias) -> BraidBatchNorm -> ReLU`.
#[derive(Debug)]
pub struct LinearBraidBlock {
    linear: BraidLinear,
    norm: BraidBatchNorm,
    cache: RefCell<Option<ActivationCache>>,
}

impl LinearBraidBlock {
    pub fn new(
        name: impl Into<String>,
        input_dim: usize,
        output_dim: usize,
        kind: BraidNormKind,
        seed: Option<u64>,
    ) -> PureResult<Self> {
        let name = name.into();
        Ok(Self {
            linear: BraidLinear::new(format!("{name}::wlinear"), input_dim, output_dim, false, seed)?,
            norm: BraidBatchNorm::new(
                format!("{name}::wbn"),
                FeatureLayout::Flat {
                    features: output_dim,
                },
                kind,
            )?,
            cache: RefCell::new(None),
        })
    }

    pub fn output_dim(&self) -> usize {
        self.linear.output_dim()
    }
}

impl BraidModule for LinearBraidBlock {
    fn forward(&self, input: &BraidPair) -> PureResult<BraidPair> {
        let pre_norm = self.linear.forward(input)?;
        let normed = self.norm.forward(&pre_norm)?;
        let out = relu_pair(&normed)?;
        *self.cache.borrow_mut() = Some(ActivationCache { pre_norm, normed });
        Ok(out)
    }

    fn backward(&mut self, input: &BraidPair, grad_output: &BraidPair) -> PureResult<BraidPair> {
        let cache = self
            .cache
            .borrow()
            .clone()
            .ok_or_else(|| missing_cache("linear_braid_block_cache"))?;
        let grad_normed = relu_pair_backward(&cache.normed, grad_output)?;
        let grad_pre = self.norm.backward(&cache.pre_norm, &grad_normed)?;
        self.linear.backward(input, &grad_pre)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.linear.visit_parameters(visitor)?;
        self.norm.visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.linear.visit_parameters_mut(visitor)?;
        self.norm.visit_parameters_mut(visitor)
    }

    fn set_training(&self, training: bool) {
        self.norm.set_training(training);
    }

    fn bind_partitions(&self, partitions: &PartitionBook) {
        self.norm.bind_partitions(partitions);
    }
}

/// Residual variant: `bn2(x + relu(bn(linear(x))))`. Input and output widths
/// must agree.
#[derive(Debug)]
pub struct ResLinearBraidBlock {
    inner: LinearBraidBlock,
    norm2: BraidBatchNorm,
    summed: RefCell<Option<BraidPair>>,
}

impl ResLinearBraidBlock {
    pub fn new(
        name: impl Into<String>,
        input_dim: usize,
        output_dim: usize,
        kind: BraidNormKind,
        seed: Option<u64>,
    ) -> PureResult<Self> {
        if input_dim != output_dim {
            return Err(TensorError::ShapeMismatch {
                left: (1, input_dim),
                right: (1, output_dim),
            });
        }
        let name = name.into();
        Ok(Self {
            inner: LinearBraidBlock::new(name.as_str(), input_dim, output_dim, kind, seed)?,
            norm2: BraidBatchNorm::new(
                format!("{name}::wbn2"),
                FeatureLayout::Flat {
                    features: output_dim,
                },
                kind,
            )?,
            summed: RefCell::new(None),
        })
    }
}

impl BraidModule for ResLinearBraidBlock {
    fn forward(&self, input: &BraidPair) -> PureResult<BraidPair> {
        let branch = self.inner.forward(input)?;
        let summed = input.add(&branch)?;
        let out = self.norm2.forward(&summed)?;
        *self.summed.borrow_mut() = Some(summed);
        Ok(out)
    }

    fn backward(&mut self, input: &BraidPair, grad_output: &BraidPair) -> PureResult<BraidPair> {
        let summed = self
            .summed
            .borrow()
            .clone()
            .ok_or_else(|| missing_cache("res_linear_braid_block_cache"))?;
        let grad_summed = self.norm2.backward(&summed, grad_output)?;
        let grad_branch = self.inner.backward(input, &grad_summed)?;
        grad_branch.add(&grad_summed)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.inner.visit_parameters(visitor)?;
        self.norm2.visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.inner.visit_parameters_mut(visitor)?;
        self.norm2.visit_parameters_mut(visitor)
    }

    fn set_training(&self, training: bool) {
        self.inner.set_training(training);
        self.norm2.set_training(training);
    }

    fn bind_partitions(&self, partitions: &PartitionBook) {
        self.inner.bind_partitions(partitions);
        self.norm2.bind_partitions(partitions);
    }
}

/// Dense variant: each branch becomes `[x | relu(bn(linear(x)))]`.
#[derive(Debug)]
pub struct DenseLinearBraidBlock {
    inner: LinearBraidBlock,
}

impl DenseLinearBraidBlock {
    pub fn new(
        name: impl Into<String>,
        input_dim: usize,
        growth: usize,
        kind: BraidNormKind,
        seed: Option<u64>,
    ) -> PureResult<Self> {
        Ok(Self {
            inner: LinearBraidBlock::new(name, input_dim, growth, kind, seed)?,
        })
    }
}

impl BraidModule for DenseLinearBraidBlock {
    fn forward(&self, input: &BraidPair) -> PureResult<BraidPair> {
        let grown = self.inner.forward(input)?;
        BraidPair::cat_features(&[input.clone(), grown])
    }

    fn backward(&mut self, input: &BraidPair, grad_output: &BraidPair) -> PureResult<BraidPair> {
        let in_dim = input.shape().1;
        let total = grad_output.shape().1;
        let passthrough = grad_output.map_branches(|g| g.slice_cols(0, in_dim))?;
        let grown = grad_output.map_branches(|g| g.slice_cols(in_dim, total))?;
        let grad_inner = self.inner.backward(input, &grown)?;
        grad_inner.add(&passthrough)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.inner.visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.inner.visit_parameters_mut(visitor)
    }

    fn set_training(&self, training: bool) {
        self.inner.set_training(training);
    }

    fn bind_partitions(&self, partitions: &PartitionBook) {
        self.inner.bind_partitions(partitions);
    }
}

#[derive(Debug)]
enum Pool {
    Max(MaxPool2d),
    Global(GlobalAvgPool2d),
}

impl Pool {
    fn as_module_mut(&mut self) -> &mut dyn Module {
        match self {
            Pool::Max(pool) => pool,
            Pool::Global(pool) => pool,
        }
    }

    fn as_module(&self) -> &dyn Module {
        match self {
            Pool::Max(pool) => pool,
            Pool::Global(pool) => pool,
        }
    }
}

#[derive(Debug, Clone)]
struct ConvCache {
    pre_norm: BraidPair,
    normed: BraidPair,
    activated: BraidPair,
}

/// `BraidConv2d (no bias) -> BraidBatchNorm -> ReLU -> pool`, where the pool
/// is a 2x2/2 max pool or a global average pool.
#[derive(Debug)]
pub struct BraidConvBlock {
    conv: BraidConv2d,
    norm: BraidBatchNorm,
    pool: Pool,
    output_hw: (usize, usize),
    cache: RefCell<Option<ConvCache>>,
}

impl BraidConvBlock {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        in_channels: usize,
        out_channels: usize,
        kernel: (usize, usize),
        stride: (usize, usize),
        input_hw: (usize, usize),
        gap: bool,
        kind: BraidNormKind,
        seed: Option<u64>,
    ) -> PureResult<Self> {
        let name = name.into();
        let conv = BraidConv2d::new(
            format!("{name}::wconv"),
            in_channels,
            out_channels,
            kernel,
            stride,
            input_hw,
            false,
            seed,
        )?;
        let (height, width) = conv.output_hw()?;
        let norm = BraidBatchNorm::new(
            format!("{name}::wbn"),
            FeatureLayout::Spatial {
                channels: out_channels,
                height,
                width,
            },
            kind,
        )?;
        let (pool, output_hw) = if gap {
            (
                Pool::Global(GlobalAvgPool2d::new(out_channels, (height, width))?),
                (1, 1),
            )
        } else {
            let pool = MaxPool2d::new(out_channels, (2, 2), (2, 2), (height, width))?;
            let output_hw = pool.output_hw();
            (Pool::Max(pool), output_hw)
        };
        Ok(Self {
            conv,
            norm,
            pool,
            output_hw,
            cache: RefCell::new(None),
        })
    }

    /// Spatial extent after pooling.
    pub fn output_hw(&self) -> (usize, usize) {
        self.output_hw
    }

    pub fn out_channels(&self) -> usize {
        self.conv.out_channels()
    }
}

impl BraidModule for BraidConvBlock {
    fn forward(&self, input: &BraidPair) -> PureResult<BraidPair> {
        let pre_norm = self.conv.forward(input)?;
        let normed = self.norm.forward(&pre_norm)?;
        let activated = relu_pair(&normed)?;
        let pool = self.pool.as_module();
        let out = activated.map_branches(|t| pool.forward(t))?;
        *self.cache.borrow_mut() = Some(ConvCache {
            pre_norm,
            normed,
            activated,
        });
        Ok(out)
    }

    fn backward(&mut self, input: &BraidPair, grad_output: &BraidPair) -> PureResult<BraidPair> {
        let cache = self
            .cache
            .borrow()
            .clone()
            .ok_or_else(|| missing_cache("braid_conv_block_cache"))?;
        let pool = self.pool.as_module_mut();
        let grad_activated = BraidPair::new(
            pool.backward(&cache.activated.a, &grad_output.a)?,
            pool.backward(&cache.activated.b, &grad_output.b)?,
        )?;
        let grad_normed = relu_pair_backward(&cache.normed, &grad_activated)?;
        let grad_pre = self.norm.backward(&cache.pre_norm, &grad_normed)?;
        self.conv.backward(input, &grad_pre)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.conv.visit_parameters(visitor)?;
        self.norm.visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.conv.visit_parameters_mut(visitor)?;
        self.norm.visit_parameters_mut(visitor)
    }

    fn set_training(&self, training: bool) {
        self.norm.set_training(training);
    }

    fn bind_partitions(&self, partitions: &PartitionBook) {
        self.norm.bind_partitions(partitions);
    }
}

/// How a fusion head collapses the two branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fusion {
    /// `A + B` (`SumY`).
    Sum,
    /// Elementwise max (`MaxY`).
    Max,
    /// Elementwise min (`MinY`).
    Min,
    /// `[min | max]` along channels (`MinMaxY`).
    MinMax,
}

/// Merges a braid pair into one tensor with a symmetric operator, then
/// batch-normalises it.
#[derive(Debug)]
pub struct FusionHead {
    fusion: Fusion,
    norm: BatchNorm,
    merged: RefCell<Option<Tensor>>,
}

impl FusionHead {
    /// `layout` describes one branch; `MinMax` doubles its channels.
    pub fn new(name: impl Into<String>, fusion: Fusion, layout: FeatureLayout) -> PureResult<Self> {
        let layout = match (fusion, layout) {
            (Fusion::MinMax, FeatureLayout::Flat { features }) => FeatureLayout::Flat {
                features: 2 * features,
            },
            (
                Fusion::MinMax,
                FeatureLayout::Spatial {
                    channels,
                    height,
                    width,
                },
            ) => FeatureLayout::Spatial {
                channels: 2 * channels,
                height,
                width,
            },
            (_, layout) => layout,
        };
        Ok(Self {
            fusion,
            norm: BatchNorm::new(name, layout, 0.1, 1e-5)?,
            merged: RefCell::new(None),
        })
    }

    pub fn sum_y(name: impl Into<String>, layout: FeatureLayout) -> PureResult<Self> {
        Self::new(name, Fusion::Sum, layout)
    }

    pub fn max_y(name: impl Into<String>, layout: FeatureLayout) -> PureResult<Self> {
        Self::new(name, Fusion::Max, layout)
    }

    pub fn min_y(name: impl Into<String>, layout: FeatureLayout) -> PureResult<Self> {
        Self::new(name, Fusion::Min, layout)
    }

    pub fn min_max_y(name: impl Into<String>, layout: FeatureLayout) -> PureResult<Self> {
        Self::new(name, Fusion::MinMax, layout)
    }

    pub fn fusion(&self) -> Fusion {
        self.fusion
    }

    /// Width of the flattened output row.
    pub fn output_dim(&self) -> usize {
        self.norm.layout().width()
    }

    fn merge(&self, input: &BraidPair) -> PureResult<Tensor> {
        match self.fusion {
            Fusion::Sum => input.a.add(&input.b),
            Fusion::Max => input.a.maximum(&input.b),
            Fusion::Min => input.a.minimum(&input.b),
            Fusion::MinMax => Tensor::cat_cols(&[
                input.a.minimum(&input.b)?,
                input.a.maximum(&input.b)?,
            ]),
        }
    }

    pub fn forward(&self, input: &BraidPair) -> PureResult<Tensor> {
        let merged = self.merge(input)?;
        let out = self.norm.forward(&merged)?;
        *self.merged.borrow_mut() = Some(merged);
        Ok(out)
    }

    /// Routes the head gradient back to the branches. Ties of max/min split
    /// the gradient evenly, which keeps the backward pass swap-symmetric.
    pub fn backward(&mut self, input: &BraidPair, grad_output: &Tensor) -> PureResult<BraidPair> {
        let merged = self
            .merged
            .borrow()
            .clone()
            .ok_or_else(|| missing_cache("fusion_head_cache"))?;
        let grad_merged = self.norm.backward(&merged, grad_output)?;
        match self.fusion {
            Fusion::Sum => BraidPair::new(grad_merged.clone(), grad_merged),
            Fusion::Max => route_extreme(input, &grad_merged, |x, y| x > y),
            Fusion::Min => route_extreme(input, &grad_merged, |x, y| x < y),
            Fusion::MinMax => {
                let width = input.shape().1;
                let grad_min = grad_merged.slice_cols(0, width)?;
                let grad_max = grad_merged.slice_cols(width, 2 * width)?;
                route_extreme(input, &grad_min, |x, y| x < y)?
                    .add(&route_extreme(input, &grad_max, |x, y| x > y)?)
            }
        }
    }

    pub fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.norm.visit_parameters(visitor)
    }

    pub fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.norm.visit_parameters_mut(visitor)
    }

    pub fn set_training(&self, training: bool) {
        self.norm.set_training(training);
    }
}

/// Sends each gradient element to the branch selected by `wins`, halving it
/// on ties.
fn route_extreme(
    input: &BraidPair,
    grad: &Tensor,
    wins: impl Fn(f32, f32) -> bool,
) -> PureResult<BraidPair> {
    let (rows, cols) = grad.shape();
    let mut grad_a = Vec::with_capacity(rows * cols);
    let mut grad_b = Vec::with_capacity(rows * cols);
    for ((a, b), g) in input.a.data().iter().zip(input.b.data()).zip(grad.data()) {
        let (ga, gb) = if wins(*a, *b) {
            (*g, 0.0)
        } else if wins(*b, *a) {
            (0.0, *g)
        } else {
            (0.5 * g, 0.5 * g)
        };
        grad_a.push(ga);
        grad_b.push(gb);
    }
    BraidPair::new(
        Tensor::from_vec(rows, cols, grad_a)?,
        Tensor::from_vec(rows, cols, grad_b)?,
    )
}

/// Fully connected stage after the fusion head. Hidden blocks run
/// `Linear (no bias) -> BatchNorm -> ReLU`; the tail is a biased `Linear`.
#[derive(Debug)]
pub struct FcBlock {
    linear: Linear,
    norm: Option<BatchNorm>,
    cache: RefCell<Option<(Tensor, Tensor)>>,
}

impl FcBlock {
    pub fn new(
        name: impl Into<String>,
        input_dim: usize,
        output_dim: usize,
        is_tail: bool,
        seed: Option<u64>,
    ) -> PureResult<Self> {
        let name = name.into();
        let linear = Linear::with_bias(format!("{name}::fc"), input_dim, output_dim, is_tail, seed)?;
        let norm = if is_tail {
            None
        } else {
            Some(BatchNorm::flat(format!("{name}::bn"), output_dim)?)
        };
        Ok(Self {
            linear,
            norm,
            cache: RefCell::new(None),
        })
    }

    pub fn is_tail(&self) -> bool {
        self.norm.is_none()
    }

    pub fn output_dim(&self) -> usize {
        self.linear.output_dim()
    }
}

impl Module for FcBlock {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let projected = self.linear.forward(input)?;
        let Some(norm) = self.norm.as_ref() else {
            return Ok(projected);
        };
        let normed = norm.forward(&projected)?;
        let out = Relu::new().forward(&normed)?;
        *self.cache.borrow_mut() = Some((projected, normed));
        Ok(out)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let grad_projected = match self.norm.as_mut() {
            None => grad_output.clone(),
            Some(norm) => {
                let (projected, normed) = self
                    .cache
                    .borrow()
                    .clone()
                    .ok_or_else(|| missing_cache("fc_block_cache"))?;
                let grad_normed = Relu::new().backward(&normed, grad_output)?;
                norm.backward(&projected, &grad_normed)?
            }
        };
        self.linear.backward(input, &grad_projected)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.linear.visit_parameters(visitor)?;
        if let Some(norm) = self.norm.as_ref() {
            norm.visit_parameters(visitor)?;
        }
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.linear.visit_parameters_mut(visitor)?;
        if let Some(norm) = self.norm.as_mut() {
            norm.visit_parameters_mut(visitor)?;
        }
        Ok(())
    }

    fn set_training(&self, training: bool) {
        if let Some(norm) = self.norm.as_ref() {
            norm.set_training(training);
        }
    }
}
