// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::module::{Module, Parameter};
use crate::{PureResult, Tensor, TensorError};

/// Fully-connected layer storing its weight as `(input_dim, output_dim)`.
#[derive(Debug)]
pub struct Linear {
    weight: Parameter,
    bias: Option<Parameter>,
}

impl Linear {
    /// Creates a layer with uniform `±1/sqrt(input_dim)` weights and a zero bias.
    pub fn new(name: impl Into<String>, input_dim: usize, output_dim: usize) -> PureResult<Self> {
        Self::with_bias(name, input_dim, output_dim, true, None)
    }

    /// Creates a layer with an optional bias. `seed` pins the weight draw.
    pub fn with_bias(
        name: impl Into<String>,
        input_dim: usize,
        output_dim: usize,
        bias: bool,
        seed: Option<u64>,
    ) -> PureResult<Self> {
        if input_dim == 0 || output_dim == 0 {
            return Err(TensorError::InvalidDimensions {
                rows: input_dim,
                cols: output_dim,
            });
        }
        let name = name.into();
        let bound = 1.0 / (input_dim as f32).sqrt();
        let weight = Tensor::random_uniform(input_dim, output_dim, -bound, bound, seed)?;
        let bias = if bias {
            Some(Parameter::new(
                format!("{name}::bias"),
                Tensor::zeros(1, output_dim)?,
            ))
        } else {
            None
        };
        Ok(Self {
            weight: Parameter::new(format!("{name}::weight"), weight),
            bias,
        })
    }

    /// Wraps explicit weights, mainly for tests and weight surgery.
    pub fn from_weights(
        name: impl Into<String>,
        weight: Tensor,
        bias: Option<Tensor>,
    ) -> PureResult<Self> {
        let name = name.into();
        if let Some(bias) = bias.as_ref() {
            if bias.shape() != (1, weight.shape().1) {
                return Err(TensorError::ShapeMismatch {
                    left: bias.shape(),
                    right: (1, weight.shape().1),
                });
            }
        }
        Ok(Self {
            weight: Parameter::new(format!("{name}::weight"), weight),
            bias: bias.map(|b| Parameter::new(format!("{name}::bias"), b)),
        })
    }

    pub fn weight(&self) -> &Parameter {
        &self.weight
    }

    pub fn weight_mut(&mut self) -> &mut Parameter {
        &mut self.weight
    }

    pub fn bias(&self) -> Option<&Parameter> {
        self.bias.as_ref()
    }

    pub fn bias_mut(&mut self) -> Option<&mut Parameter> {
        self.bias.as_mut()
    }

    pub fn input_dim(&self) -> usize {
        self.weight.value().shape().0
    }

    pub fn output_dim(&self) -> usize {
        self.weight.value().shape().1
    }
}

impl Module for Linear {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        if input.shape().1 != self.input_dim() {
            return Err(TensorError::ShapeMismatch {
                left: input.shape(),
                right: self.weight.value().shape(),
            });
        }
        let mut out = input.matmul(self.weight.value())?;
        if let Some(bias) = self.bias.as_ref() {
            out.add_row_inplace(bias.value().data())?;
        }
        Ok(out)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        if input.shape().0 != grad_output.shape().0 {
            return Err(TensorError::ShapeMismatch {
                left: input.shape(),
                right: grad_output.shape(),
            });
        }
        let grad_w = input.transpose().matmul(grad_output)?;
        self.weight.accumulate_euclidean(&grad_w)?;

        if let Some(bias) = self.bias.as_mut() {
            let summed = grad_output.sum_axis0();
            let grad_b = Tensor::from_vec(1, summed.len(), summed)?;
            bias.accumulate_euclidean(&grad_b)?;
        }

        let weight_t = self.weight.value().transpose();
        grad_output.matmul(&weight_t)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&self.weight)?;
        if let Some(bias) = self.bias.as_ref() {
            visitor(bias)?;
        }
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&mut self.weight)?;
        if let Some(bias) = self.bias.as_mut() {
            visitor(bias)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_forward_matches_manual() {
        let layer = Linear::with_bias("fc", 3, 2, true, Some(5)).unwrap();
        let input = Tensor::from_vec(1, 3, vec![1.0, -2.0, 0.5]).unwrap();
        let output = layer.forward(&input).unwrap();
        let mut expected = input.matmul(layer.weight.value()).unwrap();
        expected
            .add_row_inplace(layer.bias().unwrap().value().data())
            .unwrap();
        assert_eq!(output, expected);
    }

    #[test]
    fn linear_backward_matches_analytic_gradient() {
        let weight = Tensor::from_vec(2, 1, vec![0.3, -0.7]).unwrap();
        let mut layer = Linear::from_weights("fc", weight, None).unwrap();
        let input = Tensor::from_vec(2, 2, vec![1.0, 2.0, -1.0, 0.5]).unwrap();
        let grad_output = Tensor::from_vec(2, 1, vec![1.0, 1.0]).unwrap();
        let grad_input = layer.backward(&input, &grad_output).unwrap();
        // d(sum(x @ w)) / dw = column sums of x
        assert_eq!(layer.weight().gradient().unwrap().data(), &[0.0, 2.5]);
        assert_eq!(grad_input.data(), &[0.3, -0.7, 0.3, -0.7]);
        assert!(layer.bias().is_none());
    }

    #[test]
    fn linear_step_moves_weights() {
        let mut layer = Linear::new("fc", 4, 3).unwrap();
        let input = Tensor::from_vec(2, 4, vec![0.1, 0.2, -0.3, 0.4, -0.5, 0.6, 0.7, -0.8]).unwrap();
        let output = layer.forward(&input).unwrap();
        let _ = layer.backward(&input, &output).unwrap();
        let before = layer.weight().value().clone();
        layer.apply_step(0.01).unwrap();
        assert_ne!(before, *layer.weight().value());
    }
}
