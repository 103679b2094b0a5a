// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use super::{BraidModule, BraidPair};
use crate::layers::Conv2d;
use crate::module::{Module, Parameter};
use crate::PureResult;

/// Convolutional braid layer: `outA = conv_p(A) + conv_q(B)` and the mirrored
/// expression for `outB`. Only `conv_p` carries a bias.
#[derive(Debug)]
pub struct BraidConv2d {
    conv_p: Conv2d,
    conv_q: Conv2d,
}

impl BraidConv2d {
    /// Same-padded convolution (`padding = (k - 1) / 2`).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        in_channels: usize,
        out_channels: usize,
        kernel: (usize, usize),
        stride: (usize, usize),
        input_hw: (usize, usize),
        bias: bool,
        seed: Option<u64>,
    ) -> PureResult<Self> {
        let name = name.into();
        let padding = ((kernel.0.saturating_sub(1)) / 2, (kernel.1.saturating_sub(1)) / 2);
        let conv_p = Conv2d::new(
            format!("{name}::p"),
            in_channels,
            out_channels,
            kernel,
            stride,
            padding,
            input_hw,
            bias,
            seed,
        )?;
        let conv_q = Conv2d::new(
            format!("{name}::q"),
            in_channels,
            out_channels,
            kernel,
            stride,
            padding,
            input_hw,
            false,
            seed.map(|s| s.wrapping_add(1)),
        )?;
        Ok(Self { conv_p, conv_q })
    }

    pub fn output_hw(&self) -> PureResult<(usize, usize)> {
        self.conv_p.output_hw()
    }

    pub fn out_channels(&self) -> usize {
        self.conv_p.out_channels()
    }
}

impl BraidModule for BraidConv2d {
    fn forward(&self, input: &BraidPair) -> PureResult<BraidPair> {
        let out_a = self
            .conv_p
            .forward(&input.a)?
            .add(&self.conv_q.forward(&input.b)?)?;
        let out_b = self
            .conv_p
            .forward(&input.b)?
            .add(&self.conv_q.forward(&input.a)?)?;
        BraidPair::new(out_a, out_b)
    }

    fn backward(&mut self, input: &BraidPair, grad_output: &BraidPair) -> PureResult<BraidPair> {
        let a_direct = self.conv_p.backward(&input.a, &grad_output.a)?;
        let b_direct = self.conv_p.backward(&input.b, &grad_output.b)?;
        let b_cross = self.conv_q.backward(&input.b, &grad_output.a)?;
        let a_cross = self.conv_q.backward(&input.a, &grad_output.b)?;
        BraidPair::new(a_direct.add(&a_cross)?, b_direct.add(&b_cross)?)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.conv_p.visit_parameters(visitor)?;
        self.conv_q.visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.conv_p.visit_parameters_mut(visitor)?;
        self.conv_q.visit_parameters_mut(visitor)
    }
}
