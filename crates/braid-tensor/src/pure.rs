// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Row-major `f32` tensors and the error vocabulary shared by the braid
//! layers, the class-conditional normaliser and the sample-rate controller.
//!
//! Every tensor is two dimensional. Spatial activations are flattened to
//! `(batch, channels * height * width)` and layers carry their spatial extent
//! in their own configuration.

use braid_config::determinism;
use core::fmt;
use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand_distr::StandardNormal;
use std::error::Error;
use std::sync::Arc;

/// Result alias used throughout the braid crates.
pub type PureResult<T> = Result<T, TensorError>;

/// Errors emitted by tensors, layers, losses and the rate controller.
#[derive(Clone, Debug, PartialEq)]
pub enum TensorError {
    /// A tensor constructor received an invalid shape.
    InvalidDimensions { rows: usize, cols: usize },
    /// Data provided to a constructor does not match the tensor shape.
    DataLength { expected: usize, got: usize },
    /// An operator was asked to combine tensors of incompatible shapes.
    ShapeMismatch {
        left: (usize, usize),
        right: (usize, usize),
    },
    /// Learning rates must stay positive.
    NonPositiveLearningRate { rate: f32 },
    /// Computation received an empty input which would otherwise trigger a panic.
    EmptyInput(&'static str),
    /// A row index points past the end of the tensor.
    IndexOutOfBounds { index: usize, len: usize },
    /// Attempted to load a parameter that was missing from the state dict.
    MissingParameter { name: String },
    /// Wrapper around I/O failures when persisting or restoring state.
    IoError { message: String },
    /// Wrapper around serde failures when persisting or restoring state.
    SerializationError { message: String },
    /// Numeric guard detected a non-finite value.
    NonFiniteValue { label: &'static str, value: f32 },
    /// Generic configuration violation.
    InvalidValue { label: &'static str },
    /// The rate controller was asked for an optimizer it does not provide.
    UnsupportedOptimizerKind { kind: String },
    /// The sampler bound to a rate controller cannot accept rate updates.
    InvalidSamplerType { sampler: String },
    /// The batch partition does not hold exactly one group per class.
    PartitionSizeMismatch { expected: usize, got: usize },
    /// Batch normalisation only accepts `[N, C]` or `[N, C, H, W]` inputs.
    UnsupportedInputRank { rank: usize },
    /// The elementwise loss variant name is not recognised.
    UnsupportedLossVariant { variant: String },
}

impl fmt::Display for TensorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TensorError::InvalidDimensions { rows, cols } => {
                write!(
                    f,
                    "invalid tensor dimensions ({rows} x {cols}); both axes must be non-zero"
                )
            }
            TensorError::DataLength { expected, got } => {
                write!(f, "data length mismatch: expected {expected}, got {got}")
            }
            TensorError::ShapeMismatch { left, right } => {
                write!(
                    f,
                    "shape mismatch: left={:?}, right={:?} cannot be combined",
                    left, right
                )
            }
            TensorError::NonPositiveLearningRate { rate } => {
                write!(f, "learning rate must be positive, got {rate}")
            }
            TensorError::EmptyInput(label) => write!(f, "empty input: {label}"),
            TensorError::IndexOutOfBounds { index, len } => {
                write!(f, "row index {index} out of bounds for {len} rows")
            }
            TensorError::MissingParameter { name } => {
                write!(f, "missing parameter in state dict: {name}")
            }
            TensorError::IoError { message } => write!(f, "io error: {message}"),
            TensorError::SerializationError { message } => {
                write!(f, "serialization error: {message}")
            }
            TensorError::NonFiniteValue { label, value } => {
                write!(f, "non-finite value for {label}: {value}")
            }
            TensorError::InvalidValue { label } => write!(f, "invalid value: {label}"),
            TensorError::UnsupportedOptimizerKind { kind } => {
                write!(
                    f,
                    "unsupported optimizer '{kind}'; expected one of sgd, adam, amsgrad, adamw"
                )
            }
            TensorError::InvalidSamplerType { sampler } => {
                write!(
                    f,
                    "sampler '{sampler}' cannot receive rate updates; use a sample-rate sampler"
                )
            }
            TensorError::PartitionSizeMismatch { expected, got } => {
                write!(
                    f,
                    "batch partition has {got} groups but the layer tracks {expected} classes"
                )
            }
            TensorError::UnsupportedInputRank { rank } => {
                write!(f, "expected a rank 2 or rank 4 input, got rank {rank}")
            }
            TensorError::UnsupportedLossVariant { variant } => {
                write!(f, "unsupported loss variant '{variant}'; expected bce or ce")
            }
        }
    }
}

impl Error for TensorError {}

/// Dense row-major tensor with copy-on-write storage.
#[derive(Clone, Debug)]
pub struct Tensor {
    data: Arc<Vec<f32>>,
    rows: usize,
    cols: usize,
}

impl PartialEq for Tensor {
    fn eq(&self, other: &Self) -> bool {
        self.rows == other.rows && self.cols == other.cols && self.data == other.data
    }
}

impl Tensor {
    fn from_parts(rows: usize, cols: usize, data: Vec<f32>) -> PureResult<Self> {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        let expected = rows * cols;
        if expected != data.len() {
            return Err(TensorError::DataLength {
                expected,
                got: data.len(),
            });
        }
        Ok(Self {
            data: Arc::new(data),
            rows,
            cols,
        })
    }

    fn seedable_rng(seed: Option<u64>, label: &str) -> StdRng {
        determinism::rng_from_optional(seed, label)
    }

    /// Create a tensor filled with zeros.
    pub fn zeros(rows: usize, cols: usize) -> PureResult<Self> {
        Self::from_parts(rows, cols, vec![0.0; rows * cols])
    }

    /// Create a tensor filled with `value`.
    pub fn full(rows: usize, cols: usize, value: f32) -> PureResult<Self> {
        Self::from_parts(rows, cols, vec![value; rows * cols])
    }

    /// Create a tensor from raw data. The vector must hold `rows * cols` elements.
    pub fn from_vec(rows: usize, cols: usize, data: Vec<f32>) -> PureResult<Self> {
        Self::from_parts(rows, cols, data)
    }

    /// Sample a uniform distribution in `[min, max)`.
    ///
    /// An explicit `seed` makes the draw reproducible; otherwise the process
    /// determinism policy decides between a label-derived seed and entropy.
    pub fn random_uniform(
        rows: usize,
        cols: usize,
        min: f32,
        max: f32,
        seed: Option<u64>,
    ) -> PureResult<Self> {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        if !(min < max) {
            return Err(TensorError::InvalidValue {
                label: "random_uniform_bounds",
            });
        }
        let mut rng = Self::seedable_rng(seed, "braid-tensor/uniform");
        let distribution = Uniform::new(min, max);
        let data = (0..rows * cols)
            .map(|_| distribution.sample(&mut rng))
            .collect();
        Self::from_parts(rows, cols, data)
    }

    /// Sample a normal distribution with the given mean and standard deviation.
    pub fn random_normal(
        rows: usize,
        cols: usize,
        mean: f32,
        std: f32,
        seed: Option<u64>,
    ) -> PureResult<Self> {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        if std <= 0.0 {
            return Err(TensorError::InvalidValue {
                label: "random_normal_std",
            });
        }
        let mut rng = Self::seedable_rng(seed, "braid-tensor/normal");
        let data = (0..rows * cols)
            .map(|_| {
                let sample: f64 = StandardNormal.sample(&mut rng);
                mean + std * sample as f32
            })
            .collect();
        Self::from_parts(rows, cols, data)
    }

    /// Construct a tensor by applying a generator to each coordinate.
    pub fn from_fn<F>(rows: usize, cols: usize, mut f: F) -> PureResult<Self>
    where
        F: FnMut(usize, usize) -> f32,
    {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        let mut data = Vec::with_capacity(rows * cols);
        for r in 0..rows {
            for c in 0..cols {
                data.push(f(r, c));
            }
        }
        Self::from_parts(rows, cols, data)
    }

    /// Returns the `(rows, cols)` pair of the tensor.
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Total number of elements stored in the tensor.
    #[inline]
    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn data(&self) -> &[f32] {
        self.data.as_slice()
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        Arc::make_mut(&mut self.data).as_mut_slice()
    }

    /// Borrow a single row.
    pub fn row(&self, index: usize) -> &[f32] {
        &self.data[index * self.cols..(index + 1) * self.cols]
    }

    /// Matrix multiply (`self @ other`).
    pub fn matmul(&self, other: &Tensor) -> PureResult<Tensor> {
        if self.cols != other.rows {
            return Err(TensorError::ShapeMismatch {
                left: self.shape(),
                right: other.shape(),
            });
        }
        let (rows, inner, cols) = (self.rows, self.cols, other.cols);
        let mut out = vec![0.0f32; rows * cols];
        for (dst_row, lhs_row) in out.chunks_mut(cols).zip(self.data.chunks(inner)) {
            for (k, &scale) in lhs_row.iter().enumerate() {
                if scale == 0.0 {
                    continue;
                }
                let rhs_row = &other.data[k * cols..(k + 1) * cols];
                for (dst, rhs) in dst_row.iter_mut().zip(rhs_row) {
                    *dst += scale * rhs;
                }
            }
        }
        Tensor::from_parts(rows, cols, out)
    }

    fn zip_with(&self, other: &Tensor, op: impl Fn(f32, f32) -> f32) -> PureResult<Tensor> {
        if self.shape() != other.shape() {
            return Err(TensorError::ShapeMismatch {
                left: self.shape(),
                right: other.shape(),
            });
        }
        let data = self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(a, b)| op(*a, *b))
            .collect();
        Tensor::from_parts(self.rows, self.cols, data)
    }

    /// Element-wise addition.
    pub fn add(&self, other: &Tensor) -> PureResult<Tensor> {
        self.zip_with(other, |a, b| a + b)
    }

    /// Element-wise maximum.
    pub fn maximum(&self, other: &Tensor) -> PureResult<Tensor> {
        self.zip_with(other, f32::max)
    }

    /// Element-wise minimum.
    pub fn minimum(&self, other: &Tensor) -> PureResult<Tensor> {
        self.zip_with(other, f32::min)
    }

    /// Returns a new tensor where every element is scaled by `value`.
    pub fn scale(&self, value: f32) -> PureResult<Tensor> {
        self.map(|a| a * value)
    }

    /// Applies `f` to every element.
    pub fn map(&self, f: impl Fn(f32) -> f32) -> PureResult<Tensor> {
        let data = self.data.iter().map(|a| f(*a)).collect();
        Tensor::from_parts(self.rows, self.cols, data)
    }

    /// `self += scale * other`.
    pub fn add_scaled(&mut self, other: &Tensor, scale: f32) -> PureResult<()> {
        if self.shape() != other.shape() {
            return Err(TensorError::ShapeMismatch {
                left: self.shape(),
                right: other.shape(),
            });
        }
        let data = Arc::make_mut(&mut self.data);
        for (a, b) in data.iter_mut().zip(other.data.iter()) {
            *a += scale * b;
        }
        Ok(())
    }

    /// Add the provided row vector to every row (`self[row] += bias`).
    pub fn add_row_inplace(&mut self, bias: &[f32]) -> PureResult<()> {
        if bias.len() != self.cols {
            return Err(TensorError::DataLength {
                expected: self.cols,
                got: bias.len(),
            });
        }
        let cols = self.cols;
        let data = Arc::make_mut(&mut self.data);
        for row in data.chunks_mut(cols) {
            for (value, b) in row.iter_mut().zip(bias) {
                *value += b;
            }
        }
        Ok(())
    }

    /// Returns the transpose of the tensor.
    pub fn transpose(&self) -> Tensor {
        let mut data = vec![0.0f32; self.len()];
        for r in 0..self.rows {
            for c in 0..self.cols {
                data[c * self.rows + r] = self.data[r * self.cols + c];
            }
        }
        Tensor {
            data: Arc::new(data),
            rows: self.cols,
            cols: self.rows,
        }
    }

    /// Returns the sum over rows for each column.
    pub fn sum_axis0(&self) -> Vec<f32> {
        let mut sums = vec![0.0; self.cols];
        for row in self.data.chunks(self.cols) {
            for (sum, value) in sums.iter_mut().zip(row) {
                *sum += value;
            }
        }
        sums
    }

    /// Concatenates tensors along the row (batch) axis.
    pub fn cat_rows(tensors: &[Tensor]) -> PureResult<Tensor> {
        if tensors.is_empty() {
            return Err(TensorError::EmptyInput("Tensor::cat_rows"));
        }
        let cols = tensors[0].cols;
        let mut total_rows = 0usize;
        for tensor in tensors {
            if tensor.cols != cols {
                return Err(TensorError::ShapeMismatch {
                    left: tensor.shape(),
                    right: (tensor.rows, cols),
                });
            }
            total_rows += tensor.rows;
        }
        let mut data = Vec::with_capacity(total_rows * cols);
        for tensor in tensors {
            data.extend_from_slice(tensor.data());
        }
        Tensor::from_parts(total_rows, cols, data)
    }

    /// Concatenates tensors along the column (feature) axis.
    pub fn cat_cols(tensors: &[Tensor]) -> PureResult<Tensor> {
        if tensors.is_empty() {
            return Err(TensorError::EmptyInput("Tensor::cat_cols"));
        }
        let rows = tensors[0].rows;
        let mut total_cols = 0usize;
        for tensor in tensors {
            if tensor.rows != rows {
                return Err(TensorError::ShapeMismatch {
                    left: tensor.shape(),
                    right: (rows, tensor.cols),
                });
            }
            total_cols += tensor.cols;
        }
        let mut data = Vec::with_capacity(rows * total_cols);
        for r in 0..rows {
            for tensor in tensors {
                data.extend_from_slice(tensor.row(r));
            }
        }
        Tensor::from_parts(rows, total_cols, data)
    }

    /// Splits the rows at `at`, returning `(self[..at], self[at..])`.
    pub fn split_rows(&self, at: usize) -> PureResult<(Tensor, Tensor)> {
        if at == 0 || at >= self.rows {
            return Err(TensorError::InvalidDimensions {
                rows: at,
                cols: self.rows,
            });
        }
        let split = at * self.cols;
        let head = Tensor::from_parts(at, self.cols, self.data[..split].to_vec())?;
        let tail = Tensor::from_parts(self.rows - at, self.cols, self.data[split..].to_vec())?;
        Ok((head, tail))
    }

    /// Copies the columns `[start, end)` into a new tensor.
    pub fn slice_cols(&self, start: usize, end: usize) -> PureResult<Tensor> {
        if start >= end || end > self.cols {
            return Err(TensorError::InvalidDimensions {
                rows: start,
                cols: end,
            });
        }
        let mut data = Vec::with_capacity(self.rows * (end - start));
        for r in 0..self.rows {
            data.extend_from_slice(&self.row(r)[start..end]);
        }
        Tensor::from_parts(self.rows, end - start, data)
    }

    /// Gathers the listed rows, in order, into a new tensor.
    pub fn select_rows(&self, indices: &[usize]) -> PureResult<Tensor> {
        if indices.is_empty() {
            return Err(TensorError::EmptyInput("Tensor::select_rows"));
        }
        let mut data = Vec::with_capacity(indices.len() * self.cols);
        for &index in indices {
            if index >= self.rows {
                return Err(TensorError::IndexOutOfBounds {
                    index,
                    len: self.rows,
                });
            }
            data.extend_from_slice(self.row(index));
        }
        Tensor::from_parts(indices.len(), self.cols, data)
    }
}
