// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use super::{BraidModule, BraidPair};
use crate::layers::Linear;
use crate::module::{Module, Parameter};
use crate::{PureResult, Tensor, TensorError};

/// `outA = A·P + B·Q`, `outB = B·P + A·Q`. Only `P` carries a bias.
#[derive(Debug)]
pub struct BraidLinear {
    direct: Linear,
    cross: Linear,
}

impl BraidLinear {
    pub fn new(
        name: impl Into<String>,
        input_dim: usize,
        output_dim: usize,
        bias: bool,
        seed: Option<u64>,
    ) -> PureResult<Self> {
        let name = name.into();
        let cross_seed = seed.map(|s| s.wrapping_add(1));
        Ok(Self {
            direct: Linear::with_bias(format!("{name}::p"), input_dim, output_dim, bias, seed)?,
            cross: Linear::with_bias(format!("{name}::q"), input_dim, output_dim, false, cross_seed)?,
        })
    }

    /// Builds the layer from explicit `P` and `Q` blocks of shape
    /// `(input_dim, output_dim)`.
    pub fn from_blocks(
        name: impl Into<String>,
        p: Tensor,
        q: Tensor,
        bias: Option<Tensor>,
    ) -> PureResult<Self> {
        if p.shape() != q.shape() {
            return Err(TensorError::ShapeMismatch {
                left: p.shape(),
                right: q.shape(),
            });
        }
        let name = name.into();
        Ok(Self {
            direct: Linear::from_weights(format!("{name}::p"), p, bias)?,
            cross: Linear::from_weights(format!("{name}::q"), q, None)?,
        })
    }

    pub fn direct(&self) -> &Linear {
        &self.direct
    }

    pub fn cross(&self) -> &Linear {
        &self.cross
    }

    pub fn output_dim(&self) -> usize {
        self.direct.output_dim()
    }
}

impl BraidModule for BraidLinear {
    fn forward(&self, input: &BraidPair) -> PureResult<BraidPair> {
        let out_a = self
            .direct
            .forward(&input.a)?
            .add(&self.cross.forward(&input.b)?)?;
        let out_b = self
            .direct
            .forward(&input.b)?
            .add(&self.cross.forward(&input.a)?)?;
        BraidPair::new(out_a, out_b)
    }

    fn backward(&mut self, input: &BraidPair, grad_output: &BraidPair) -> PureResult<BraidPair> {
        let from_a_direct = self.direct.backward(&input.a, &grad_output.a)?;
        let from_b_direct = self.direct.backward(&input.b, &grad_output.b)?;
        let from_b_cross = self.cross.backward(&input.b, &grad_output.a)?;
        let from_a_cross = self.cross.backward(&input.a, &grad_output.b)?;
        BraidPair::new(
            from_a_direct.add(&from_a_cross)?,
            from_b_direct.add(&from_b_cross)?,
        )
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.direct.visit_parameters(visitor)?;
        self.cross.visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.direct.visit_parameters_mut(visitor)?;
        self.cross.visit_parameters_mut(visitor)
    }
}

fn fold_blocks(tensor: &Tensor, combine: impl Fn(f32, f32) -> f32) -> PureResult<Tensor> {
    let (rows, cols) = tensor.shape();
    if cols % 2 != 0 || (rows != 1 && rows % 2 != 0) {
        return Err(TensorError::InvalidDimensions { rows, cols });
    }
    let half_cols = cols / 2;
    let data = tensor.data();
    let at = |r: usize, c: usize| data[r * cols + c];
    if rows == 1 {
        // bias row: [a | b] with a == b
        return Tensor::from_fn(1, cols, |_, c| {
            let k = c % half_cols;
            combine(at(0, k), at(0, k + half_cols))
        });
    }
    let half_rows = rows / 2;
    Tensor::from_fn(rows, cols, |r, c| {
        let (i, j) = (r % half_rows, c % half_cols);
        let same_quadrant = (r < half_rows) == (c < half_cols);
        if same_quadrant {
            combine(at(i, j), at(i + half_rows, j + half_cols))
        } else {
            combine(at(i + half_rows, j), at(i, j + half_cols))
        }
    })
}

/// Projects a doubled-width weight onto the `[[P, Q], [Q, P]]` structure by
/// averaging the two copies of each block. Bias rows `[a | b]` become
/// `[m | m]`. Idempotent.
pub fn symmetrize_weight(weight: &Tensor) -> PureResult<Tensor> {
    fold_blocks(weight, |x, y| 0.5 * (x + y))
}

/// Gradient of the tied parameterisation: both copies of a block receive the
/// sum of the gradients of the two copies.
pub fn symmetrize_gradient(gradient: &Tensor) -> PureResult<Tensor> {
    fold_blocks(gradient, |x, y| x + y)
}

/// Braid linear layer stored as one `(2·in, 2·out)` weight acting on
/// `[A | B]`. Plain gradient descent does not keep the block structure, so
/// [`BraidModule::correct_gradients`] must run before every step.
#[derive(Debug)]
pub struct WideBraidLinear {
    inner: Linear,
    output_dim: usize,
}

impl WideBraidLinear {
    pub fn new(
        name: impl Into<String>,
        input_dim: usize,
        output_dim: usize,
        bias: bool,
        seed: Option<u64>,
    ) -> PureResult<Self> {
        let inner = Linear::with_bias(name, 2 * input_dim, 2 * output_dim, bias, seed)?;
        let mut layer = Self { inner, output_dim };
        layer.correct_parameters()?;
        Ok(layer)
    }

    /// Wraps an arbitrary doubled-width weight without correcting it.
    pub fn from_weight(
        name: impl Into<String>,
        weight: Tensor,
        bias: Option<Tensor>,
    ) -> PureResult<Self> {
        let (rows, cols) = weight.shape();
        if rows % 2 != 0 || cols % 2 != 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        Ok(Self {
            inner: Linear::from_weights(name, weight, bias)?,
            output_dim: cols / 2,
        })
    }

    pub fn weight(&self) -> &Parameter {
        self.inner.weight()
    }

    pub fn bias(&self) -> Option<&Parameter> {
        self.inner.bias()
    }
}

impl BraidModule for WideBraidLinear {
    fn forward(&self, input: &BraidPair) -> PureResult<BraidPair> {
        let joined = Tensor::cat_cols(&[input.a.clone(), input.b.clone()])?;
        let out = self.inner.forward(&joined)?;
        BraidPair::new(
            out.slice_cols(0, self.output_dim)?,
            out.slice_cols(self.output_dim, 2 * self.output_dim)?,
        )
    }

    fn backward(&mut self, input: &BraidPair, grad_output: &BraidPair) -> PureResult<BraidPair> {
        let joined = Tensor::cat_cols(&[input.a.clone(), input.b.clone()])?;
        let grad = Tensor::cat_cols(&[grad_output.a.clone(), grad_output.b.clone()])?;
        let grad_in = self.inner.backward(&joined, &grad)?;
        let in_dim = input.a.shape().1;
        BraidPair::new(
            grad_in.slice_cols(0, in_dim)?,
            grad_in.slice_cols(in_dim, 2 * in_dim)?,
        )
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

    fn correct_gradients(&mut self) -> PureResult<()> {
        self.inner.visit_parameters_mut(&mut |param| {
            if let Some(grad) = param.gradient() {
                let tied = symmetrize_gradient(grad)?;
                param.set_gradient(tied)?;
            }
            Ok(())
        })
    }

    fn correct_parameters(&mut self) -> PureResult<()> {
        self.inner.visit_parameters_mut(&mut |param| {
            let tied = symmetrize_weight(param.value())?;
            param.load_value(&tied)
        })
    }
}
