// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Spatial layers over flattened `(batch, channels * height * width)` rows.

use crate::module::{Module, Parameter};
use crate::{PureResult, Tensor, TensorError};

fn validate_positive(value: usize) -> PureResult<()> {
    if value == 0 {
        return Err(TensorError::InvalidDimensions {
            rows: 1,
            cols: value,
        });
    }
    Ok(())
}

fn guard_columns(input: &Tensor, expected: usize) -> PureResult<()> {
    let cols = input.shape().1;
    if cols != expected {
        return Err(TensorError::ShapeMismatch {
            left: (1, cols),
            right: (1, expected),
        });
    }
    Ok(())
}

/// Two-dimensional convolution lowered to a matmul through im2col.
#[derive(Debug)]
pub struct Conv2d {
    weight: Parameter,
    bias: Option<Parameter>,
    in_channels: usize,
    out_channels: usize,
    kernel: (usize, usize),
    stride: (usize, usize),
    padding: (usize, usize),
    input_hw: (usize, usize),
}

impl Conv2d {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        in_channels: usize,
        out_channels: usize,
        kernel: (usize, usize),
        stride: (usize, usize),
        padding: (usize, usize),
        input_hw: (usize, usize),
        bias: bool,
        seed: Option<u64>,
    ) -> PureResult<Self> {
        for value in [
            in_channels,
            out_channels,
            kernel.0,
            kernel.1,
            stride.0,
            stride.1,
            input_hw.0,
            input_hw.1,
        ] {
            validate_positive(value)?;
        }
        let name = name.into();
        let span = in_channels * kernel.0 * kernel.1;
        let bound = 1.0 / (span as f32).sqrt();
        let weight = Tensor::random_uniform(out_channels, span, -bound, bound, seed)?;
        let bias = if bias {
            Some(Parameter::new(
                format!("{name}::bias"),
                Tensor::zeros(1, out_channels)?,
            ))
        } else {
            None
        };
        let conv = Self {
            weight: Parameter::new(format!("{name}::weight"), weight),
            bias,
            in_channels,
            out_channels,
            kernel,
            stride,
            padding,
            input_hw,
        };
        conv.output_hw()?;
        Ok(conv)
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

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    fn input_cols(&self) -> usize {
        self.in_channels * self.input_hw.0 * self.input_hw.1
    }

    /// Spatial extent of the output feature map.
    pub fn output_hw(&self) -> PureResult<(usize, usize)> {
        let (h, w) = self.input_hw;
        let (kh, kw) = self.kernel;
        let (ph, pw) = self.padding;
        let (sh, sw) = self.stride;
        if h + 2 * ph < kh || w + 2 * pw < kw {
            return Err(TensorError::InvalidDimensions {
                rows: h + 2 * ph,
                cols: kh.max(kw),
            });
        }
        Ok(((h + 2 * ph - kh) / sh + 1, (w + 2 * pw - kw) / sw + 1))
    }

    /// Maps a patch coordinate to the flat input offset, `None` inside padding.
    fn source_index(
        &self,
        channel: usize,
        oh_idx: usize,
        ow_idx: usize,
        kh: usize,
        kw: usize,
    ) -> Option<usize> {
        let (h, w) = self.input_hw;
        let idx_h = (oh_idx * self.stride.0 + kh) as isize - self.padding.0 as isize;
        let idx_w = (ow_idx * self.stride.1 + kw) as isize - self.padding.1 as isize;
        if idx_h < 0 || idx_w < 0 || idx_h >= h as isize || idx_w >= w as isize {
            return None;
        }
        Some(channel * h * w + idx_h as usize * w + idx_w as usize)
    }

    fn im2col(&self, input: &Tensor, oh: usize, ow: usize) -> PureResult<Tensor> {
        let batch = input.shape().0;
        let span = self.in_channels * self.kernel.0 * self.kernel.1;
        let mut columns = Tensor::zeros(batch * oh * ow, span)?;
        {
            let column_data = columns.data_mut();
            for b in 0..batch {
                let row = input.row(b);
                for oh_idx in 0..oh {
                    for ow_idx in 0..ow {
                        let offset = (b * oh * ow + oh_idx * ow + ow_idx) * span;
                        let mut col_idx = 0;
                        for ic in 0..self.in_channels {
                            for kh in 0..self.kernel.0 {
                                for kw in 0..self.kernel.1 {
                                    if let Some(src) = self.source_index(ic, oh_idx, ow_idx, kh, kw)
                                    {
                                        column_data[offset + col_idx] = row[src];
                                    }
                                    col_idx += 1;
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(columns)
    }

    fn col2im(&self, cols: &Tensor, batch: usize, oh: usize, ow: usize) -> PureResult<Tensor> {
        let span = self.in_channels * self.kernel.0 * self.kernel.1;
        let mut output = Tensor::zeros(batch, self.input_cols())?;
        let output_cols = output.shape().1;
        {
            let output_data = output.data_mut();
            for b in 0..batch {
                let grad_in_row = &mut output_data[b * output_cols..(b + 1) * output_cols];
                for oh_idx in 0..oh {
                    for ow_idx in 0..ow {
                        let column_row = cols.row(b * oh * ow + oh_idx * ow + ow_idx);
                        debug_assert_eq!(column_row.len(), span);
                        let mut col_idx = 0;
                        for ic in 0..self.in_channels {
                            for kh in 0..self.kernel.0 {
                                for kw in 0..self.kernel.1 {
                                    if let Some(dst) = self.source_index(ic, oh_idx, ow_idx, kh, kw)
                                    {
                                        grad_in_row[dst] += column_row[col_idx];
                                    }
                                    col_idx += 1;
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(output)
    }

    /// `(batch * oh * ow, out)` patch responses to channel-major rows.
    fn to_channel_major(&self, matrix: &Tensor, batch: usize, spatial: usize) -> PureResult<Tensor> {
        let mut out = Tensor::zeros(batch, self.out_channels * spatial)?;
        {
            let out_data = out.data_mut();
            for b in 0..batch {
                for pos in 0..spatial {
                    let response = matrix.row(b * spatial + pos);
                    for (oc, value) in response.iter().enumerate() {
                        out_data[b * self.out_channels * spatial + oc * spatial + pos] = *value;
                    }
                }
            }
        }
        Ok(out)
    }

    fn from_channel_major(&self, grad: &Tensor, batch: usize, spatial: usize) -> PureResult<Tensor> {
        let mut matrix = Tensor::zeros(batch * spatial, self.out_channels)?;
        {
            let matrix_data = matrix.data_mut();
            for b in 0..batch {
                let grad_row = grad.row(b);
                for pos in 0..spatial {
                    for oc in 0..self.out_channels {
                        matrix_data[(b * spatial + pos) * self.out_channels + oc] =
                            grad_row[oc * spatial + pos];
                    }
                }
            }
        }
        Ok(matrix)
    }
}

impl Module for Conv2d {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        guard_columns(input, self.input_cols())?;
        let batch = input.shape().0;
        let (oh, ow) = self.output_hw()?;
        let patches = self.im2col(input, oh, ow)?;
        let mut responses = patches.matmul(&self.weight.value().transpose())?;
        if let Some(bias) = self.bias.as_ref() {
            responses.add_row_inplace(bias.value().data())?;
        }
        self.to_channel_major(&responses, batch, oh * ow)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        guard_columns(input, self.input_cols())?;
        let batch = input.shape().0;
        let (oh, ow) = self.output_hw()?;
        if grad_output.shape() != (batch, self.out_channels * oh * ow) {
            return Err(TensorError::ShapeMismatch {
                left: grad_output.shape(),
                right: (batch, self.out_channels * oh * ow),
            });
        }
        let patches = self.im2col(input, oh, ow)?;
        let grad_matrix = self.from_channel_major(grad_output, batch, oh * ow)?;
        let grad_weight = grad_matrix.transpose().matmul(&patches)?;
        self.weight.accumulate_euclidean(&grad_weight)?;
        if let Some(bias) = self.bias.as_mut() {
            let sums = grad_matrix.sum_axis0();
            bias.accumulate_euclidean(&Tensor::from_vec(1, self.out_channels, sums)?)?;
        }
        let grad_patches = grad_matrix.matmul(self.weight.value())?;
        self.col2im(&grad_patches, batch, oh, ow)
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

/// Non-overlapping-friendly max pooling. The backward pass re-derives the
/// argmax from its input so one instance can serve both braid branches.
#[derive(Debug, Clone)]
pub struct MaxPool2d {
    channels: usize,
    kernel: (usize, usize),
    stride: (usize, usize),
    input_hw: (usize, usize),
}

impl MaxPool2d {
    pub fn new(
        channels: usize,
        kernel: (usize, usize),
        stride: (usize, usize),
        input_hw: (usize, usize),
    ) -> PureResult<Self> {
        for value in [channels, kernel.0, kernel.1, stride.0, stride.1] {
            validate_positive(value)?;
        }
        if input_hw.0 < kernel.0 || input_hw.1 < kernel.1 {
            return Err(TensorError::InvalidDimensions {
                rows: input_hw.0,
                cols: input_hw.1,
            });
        }
        Ok(Self {
            channels,
            kernel,
            stride,
            input_hw,
        })
    }

    pub fn output_hw(&self) -> (usize, usize) {
        let (h, w) = self.input_hw;
        (
            (h - self.kernel.0) / self.stride.0 + 1,
            (w - self.kernel.1) / self.stride.1 + 1,
        )
    }

    /// Flat input offset of the maximum for every output cell of one row.
    fn argmax_row(&self, row: &[f32]) -> Vec<usize> {
        let (h, w) = self.input_hw;
        let (oh, ow) = self.output_hw();
        let mut winners = Vec::with_capacity(self.channels * oh * ow);
        for c in 0..self.channels {
            let channel_offset = c * h * w;
            for oh_idx in 0..oh {
                for ow_idx in 0..ow {
                    let mut best = f32::NEG_INFINITY;
                    let mut best_idx = channel_offset + oh_idx * self.stride.0 * w;
                    for kh in 0..self.kernel.0 {
                        for kw in 0..self.kernel.1 {
                            let index = channel_offset
                                + (oh_idx * self.stride.0 + kh) * w
                                + ow_idx * self.stride.1
                                + kw;
                            if row[index] > best {
                                best = row[index];
                                best_idx = index;
                            }
                        }
                    }
                    winners.push(best_idx);
                }
            }
        }
        winners
    }
}

impl Module for MaxPool2d {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        guard_columns(input, self.channels * self.input_hw.0 * self.input_hw.1)?;
        let (batch, _) = input.shape();
        let (oh, ow) = self.output_hw();
        let mut data = Vec::with_capacity(batch * self.channels * oh * ow);
        for b in 0..batch {
            let row = input.row(b);
            data.extend(self.argmax_row(row).into_iter().map(|idx| row[idx]));
        }
        Tensor::from_vec(batch, self.channels * oh * ow, data)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let (batch, cols) = input.shape();
        let (oh, ow) = self.output_hw();
        if grad_output.shape() != (batch, self.channels * oh * ow) {
            return Err(TensorError::ShapeMismatch {
                left: grad_output.shape(),
                right: (batch, self.channels * oh * ow),
            });
        }
        let mut grad_input = Tensor::zeros(batch, cols)?;
        {
            let grad_data = grad_input.data_mut();
            for b in 0..batch {
                let winners = self.argmax_row(input.row(b));
                for (out_idx, input_idx) in winners.into_iter().enumerate() {
                    grad_data[b * cols + input_idx] += grad_output.row(b)[out_idx];
                }
            }
        }
        Ok(grad_input)
    }

    fn visit_parameters(
        &self,
        _visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        _visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        Ok(())
    }
}

/// Averages every channel map down to a single value.
#[derive(Debug, Clone)]
pub struct GlobalAvgPool2d {
    channels: usize,
    spatial: usize,
}

impl GlobalAvgPool2d {
    pub fn new(channels: usize, input_hw: (usize, usize)) -> PureResult<Self> {
        validate_positive(channels)?;
        validate_positive(input_hw.0 * input_hw.1)?;
        Ok(Self {
            channels,
            spatial: input_hw.0 * input_hw.1,
        })
    }
}

impl Module for GlobalAvgPool2d {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        guard_columns(input, self.channels * self.spatial)?;
        let batch = input.shape().0;
        let mut data = Vec::with_capacity(batch * self.channels);
        for b in 0..batch {
            for map in input.row(b).chunks(self.spatial) {
                data.push(map.iter().sum::<f32>() / self.spatial as f32);
            }
        }
        Tensor::from_vec(batch, self.channels, data)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        guard_columns(input, self.channels * self.spatial)?;
        if grad_output.shape() != (input.shape().0, self.channels) {
            return Err(TensorError::ShapeMismatch {
                left: grad_output.shape(),
                right: (input.shape().0, self.channels),
            });
        }
        let scale = 1.0 / self.spatial as f32;
        Tensor::from_fn(input.shape().0, input.shape().1, |r, c| {
            grad_output.row(r)[c / self.spatial] * scale
        })
    }

    fn visit_parameters(
        &self,
        _visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        _visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        Ok(())
    }
}
