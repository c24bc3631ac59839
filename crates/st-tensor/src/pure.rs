// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Pure Rust row-major tensor used by every SpiralTorch crate.
//!
//! The tensor is deliberately two dimensional. Higher-rank quantities such as
//! `[batch, steps, channels]` token streams are flattened into
//! `(batch * steps, channels)` and the caller keeps the batch/step metadata
//! alongside the tensor.

use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use spiral_config::determinism;

/// Result alias used throughout the pure module.
pub type PureResult<T> = Result<T, TensorError>;

/// Errors emitted by tensor utilities and the layers built on them.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum TensorError {
    /// A tensor constructor received an invalid shape.
    #[error("invalid tensor dimensions ({rows} x {cols}); both axes must be non-zero")]
    InvalidDimensions { rows: usize, cols: usize },
    /// Data provided to a constructor or operator does not match the tensor shape.
    #[error("data length mismatch: expected {expected}, got {got}")]
    DataLength { expected: usize, got: usize },
    /// An operator was asked to combine tensors of incompatible shapes.
    #[error("shape mismatch: left={left:?}, right={right:?} cannot be combined")]
    ShapeMismatch {
        left: (usize, usize),
        right: (usize, usize),
    },
    /// Learning rate must be positive for optimisers and schedules.
    #[error("learning rate must be positive; received {rate}")]
    NonPositiveLearningRate { rate: f32 },
    /// Computation received an empty input which would otherwise trigger a panic.
    #[error("empty input provided to {0}")]
    EmptyInput(&'static str),
    /// Attempted to load or update a parameter that was missing from the state dict.
    #[error("missing parameter '{name}' in state dict")]
    MissingParameter { name: String },
    /// Wrapper around I/O failures when persisting or restoring tensors.
    #[error("i/o failure: {message}")]
    IoError { message: String },
    /// Wrapper around serde failures when deserialising tensors.
    #[error("serialization failure: {message}")]
    SerializationError { message: String },
    /// Numeric guard detected a non-finite value that would otherwise propagate NaNs.
    #[error("non-finite value for {label}: {value}")]
    NonFiniteValue { label: &'static str, value: f32 },
    /// An index addressed a row or column outside the tensor.
    #[error("index {index} out of range for {label} of length {len}")]
    IndexOutOfRange {
        label: &'static str,
        index: usize,
        len: usize,
    },
    /// Generic configuration violation.
    #[error("invalid value for {label}")]
    InvalidValue { label: &'static str },
}

/// Dense `f32` tensor stored in row-major order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl Tensor {
    fn guard_dims(rows: usize, cols: usize) -> PureResult<()> {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        Ok(())
    }

    /// Create a tensor filled with zeros.
    pub fn zeros(rows: usize, cols: usize) -> PureResult<Self> {
        Self::filled(rows, cols, 0.0)
    }

    /// Create a tensor where every element equals `value`.
    pub fn filled(rows: usize, cols: usize, value: f32) -> PureResult<Self> {
        Self::guard_dims(rows, cols)?;
        Ok(Self {
            rows,
            cols,
            data: vec![value; rows * cols],
        })
    }

    /// Wraps an owned buffer.
    pub fn from_vec(rows: usize, cols: usize, data: Vec<f32>) -> PureResult<Self> {
        Self::guard_dims(rows, cols)?;
        let expected = rows * cols;
        if expected != data.len() {
            return Err(TensorError::DataLength {
                expected,
                got: data.len(),
            });
        }
        Ok(Self { rows, cols, data })
    }

    /// Builds a tensor by evaluating `f(row, col)` in row-major order.
    pub fn from_fn<F>(rows: usize, cols: usize, mut f: F) -> PureResult<Self>
    where
        F: FnMut(usize, usize) -> f32,
    {
        Self::guard_dims(rows, cols)?;
        let mut data = Vec::with_capacity(rows * cols);
        for r in 0..rows {
            for c in 0..cols {
                data.push(f(r, c));
            }
        }
        Ok(Self { rows, cols, data })
    }

    /// Samples from `N(mean, std^2)` using the provided generator.
    pub fn random_normal_with<R: Rng + ?Sized>(
        rows: usize,
        cols: usize,
        mean: f32,
        std: f32,
        rng: &mut R,
    ) -> PureResult<Self> {
        Self::guard_dims(rows, cols)?;
        if std <= 0.0 || !std.is_finite() {
            return Err(TensorError::InvalidValue {
                label: "random_normal_std",
            });
        }
        let mut data = Vec::with_capacity(rows * cols);
        for _ in 0..rows * cols {
            let sample: f64 = StandardNormal.sample(rng);
            data.push(mean + std * sample as f32);
        }
        Ok(Self { rows, cols, data })
    }

    /// Samples from `U(low, high)` using the provided generator.
    pub fn random_uniform_with<R: Rng + ?Sized>(
        rows: usize,
        cols: usize,
        low: f32,
        high: f32,
        rng: &mut R,
    ) -> PureResult<Self> {
        Self::guard_dims(rows, cols)?;
        if high <= low || !low.is_finite() || !high.is_finite() {
            return Err(TensorError::InvalidValue {
                label: "random_uniform_bounds",
            });
        }
        let dist = Uniform::new(low, high);
        let data = (0..rows * cols).map(|_| dist.sample(rng)).collect();
        Ok(Self { rows, cols, data })
    }

    /// Seeded normal sampling that respects `SPIRAL_DETERMINISTIC`.
    pub fn random_normal(
        rows: usize,
        cols: usize,
        mean: f32,
        std: f32,
        seed: Option<u64>,
    ) -> PureResult<Self> {
        let mut rng = Self::seedable_rng(seed, "st-tensor/tensor/normal");
        Self::random_normal_with(rows, cols, mean, std, &mut rng)
    }

    /// Seeded uniform sampling that respects `SPIRAL_DETERMINISTIC`.
    pub fn random_uniform(
        rows: usize,
        cols: usize,
        low: f32,
        high: f32,
        seed: Option<u64>,
    ) -> PureResult<Self> {
        let mut rng = Self::seedable_rng(seed, "st-tensor/tensor/uniform");
        Self::random_uniform_with(rows, cols, low, high, &mut rng)
    }

    fn seedable_rng(seed: Option<u64>, label: &str) -> StdRng {
        determinism::rng_from_optional(seed, label)
    }

    /// Returns `(rows, cols)`.
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Number of stored elements.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    /// Borrow a single row.
    pub fn row(&self, index: usize) -> PureResult<&[f32]> {
        if index >= self.rows {
            return Err(TensorError::IndexOutOfRange {
                label: "row",
                index,
                len: self.rows,
            });
        }
        let start = index * self.cols;
        Ok(&self.data[start..start + self.cols])
    }

    /// Mutably borrow a single row.
    pub fn row_mut(&mut self, index: usize) -> PureResult<&mut [f32]> {
        if index >= self.rows {
            return Err(TensorError::IndexOutOfRange {
                label: "row",
                index,
                len: self.rows,
            });
        }
        let start = index * self.cols;
        Ok(&mut self.data[start..start + self.cols])
    }

    fn guard_same_shape(&self, other: &Tensor) -> PureResult<()> {
        if self.shape() != other.shape() {
            return Err(TensorError::ShapeMismatch {
                left: self.shape(),
                right: other.shape(),
            });
        }
        Ok(())
    }

    /// `self · other`.
    pub fn matmul(&self, other: &Tensor) -> PureResult<Tensor> {
        if self.cols != other.rows {
            return Err(TensorError::ShapeMismatch {
                left: self.shape(),
                right: other.shape(),
            });
        }
        let mut out = vec![0.0f32; self.rows * other.cols];
        for r in 0..self.rows {
            let out_row = &mut out[r * other.cols..(r + 1) * other.cols];
            for k in 0..self.cols {
                let a = self.data[r * self.cols + k];
                if a == 0.0 {
                    continue;
                }
                let rhs = &other.data[k * other.cols..(k + 1) * other.cols];
                for (o, b) in out_row.iter_mut().zip(rhs) {
                    *o += a * b;
                }
            }
        }
        Tensor::from_vec(self.rows, other.cols, out)
    }

    /// `self · otherᵀ` without materialising the transpose.
    pub fn matmul_transpose(&self, other: &Tensor) -> PureResult<Tensor> {
        if self.cols != other.cols {
            return Err(TensorError::ShapeMismatch {
                left: self.shape(),
                right: other.shape(),
            });
        }
        let mut out = Vec::with_capacity(self.rows * other.rows);
        for r in 0..self.rows {
            let lhs = &self.data[r * self.cols..(r + 1) * self.cols];
            for o in 0..other.rows {
                let rhs = &other.data[o * other.cols..(o + 1) * other.cols];
                out.push(lhs.iter().zip(rhs).map(|(a, b)| a * b).sum());
            }
        }
        Tensor::from_vec(self.rows, other.rows, out)
    }

    /// `selfᵀ · other` without materialising the transpose.
    pub fn transpose_matmul(&self, other: &Tensor) -> PureResult<Tensor> {
        if self.rows != other.rows {
            return Err(TensorError::ShapeMismatch {
                left: self.shape(),
                right: other.shape(),
            });
        }
        let mut out = vec![0.0f32; self.cols * other.cols];
        for k in 0..self.rows {
            let lhs = &self.data[k * self.cols..(k + 1) * self.cols];
            let rhs = &other.data[k * other.cols..(k + 1) * other.cols];
            for (i, a) in lhs.iter().enumerate() {
                if *a == 0.0 {
                    continue;
                }
                let out_row = &mut out[i * other.cols..(i + 1) * other.cols];
                for (o, b) in out_row.iter_mut().zip(rhs) {
                    *o += a * b;
                }
            }
        }
        Tensor::from_vec(self.cols, other.cols, out)
    }

    pub fn transpose(&self) -> Tensor {
        let mut data = vec![0.0f32; self.data.len()];
        for r in 0..self.rows {
            for c in 0..self.cols {
                data[c * self.rows + r] = self.data[r * self.cols + c];
            }
        }
        Tensor {
            rows: self.cols,
            cols: self.rows,
            data,
        }
    }

    /// Reinterprets the buffer with a new shape of identical volume.
    pub fn reshape(&self, rows: usize, cols: usize) -> PureResult<Tensor> {
        Tensor::from_vec(rows, cols, self.data.clone())
    }

    pub fn add(&self, other: &Tensor) -> PureResult<Tensor> {
        self.guard_same_shape(other)?;
        let data = self.data.iter().zip(&other.data).map(|(a, b)| a + b).collect();
        Tensor::from_vec(self.rows, self.cols, data)
    }

    pub fn sub(&self, other: &Tensor) -> PureResult<Tensor> {
        self.guard_same_shape(other)?;
        let data = self.data.iter().zip(&other.data).map(|(a, b)| a - b).collect();
        Tensor::from_vec(self.rows, self.cols, data)
    }

    pub fn hadamard(&self, other: &Tensor) -> PureResult<Tensor> {
        self.guard_same_shape(other)?;
        let data = self.data.iter().zip(&other.data).map(|(a, b)| a * b).collect();
        Tensor::from_vec(self.rows, self.cols, data)
    }

    pub fn scale(&self, value: f32) -> PureResult<Tensor> {
        if !value.is_finite() {
            return Err(TensorError::NonFiniteValue {
                label: "scale",
                value,
            });
        }
        let data = self.data.iter().map(|a| a * value).collect();
        Tensor::from_vec(self.rows, self.cols, data)
    }

    /// Applies `f` element-wise.
    pub fn map<F: Fn(f32) -> f32>(&self, f: F) -> Tensor {
        Tensor {
            rows: self.rows,
            cols: self.cols,
            data: self.data.iter().map(|v| f(*v)).collect(),
        }
    }

    /// `self += scale * other`.
    pub fn add_scaled(&mut self, other: &Tensor, scale: f32) -> PureResult<()> {
        self.guard_same_shape(other)?;
        for (a, b) in self.data.iter_mut().zip(&other.data) {
            *a += scale * b;
        }
        Ok(())
    }

    /// Adds `bias` to every row.
    pub fn add_row_inplace(&mut self, bias: &[f32]) -> PureResult<()> {
        if bias.len() != self.cols {
            return Err(TensorError::DataLength {
                expected: self.cols,
                got: bias.len(),
            });
        }
        for row in self.data.chunks_mut(self.cols) {
            for (v, b) in row.iter_mut().zip(bias) {
                *v += b;
            }
        }
        Ok(())
    }

    /// Column sums.
    pub fn sum_axis0(&self) -> Vec<f32> {
        let mut out = vec![0.0f32; self.cols];
        for row in self.data.chunks(self.cols) {
            for (o, v) in out.iter_mut().zip(row) {
                *o += v;
            }
        }
        out
    }

    pub fn sum(&self) -> f32 {
        self.data.iter().sum()
    }

    pub fn squared_l2_norm(&self) -> f32 {
        self.data.iter().map(|v| v * v).sum()
    }

    /// Copies rows `start..end`.
    pub fn slice_rows(&self, start: usize, end: usize) -> PureResult<Tensor> {
        if start >= end || end > self.rows {
            return Err(TensorError::IndexOutOfRange {
                label: "slice_rows",
                index: end,
                len: self.rows,
            });
        }
        Tensor::from_vec(
            end - start,
            self.cols,
            self.data[start * self.cols..end * self.cols].to_vec(),
        )
    }

    /// Copies columns `start..end` of every row.
    pub fn slice_cols(&self, start: usize, end: usize) -> PureResult<Tensor> {
        if start >= end || end > self.cols {
            return Err(TensorError::IndexOutOfRange {
                label: "slice_cols",
                index: end,
                len: self.cols,
            });
        }
        let width = end - start;
        let mut data = Vec::with_capacity(self.rows * width);
        for row in self.data.chunks(self.cols) {
            data.extend_from_slice(&row[start..end]);
        }
        Tensor::from_vec(self.rows, width, data)
    }

    /// Writes `block` into rows starting at `row_offset`, columns starting at `col_offset`.
    pub fn write_block(
        &mut self,
        row_offset: usize,
        col_offset: usize,
        block: &Tensor,
    ) -> PureResult<()> {
        if row_offset + block.rows > self.rows || col_offset + block.cols > self.cols {
            return Err(TensorError::ShapeMismatch {
                left: self.shape(),
                right: (row_offset + block.rows, col_offset + block.cols),
            });
        }
        for r in 0..block.rows {
            let dst = (row_offset + r) * self.cols + col_offset;
            self.data[dst..dst + block.cols]
                .copy_from_slice(&block.data[r * block.cols..(r + 1) * block.cols]);
        }
        Ok(())
    }

    /// Adds `block` into the region starting at `(row_offset, col_offset)`.
    pub fn accumulate_block(
        &mut self,
        row_offset: usize,
        col_offset: usize,
        block: &Tensor,
    ) -> PureResult<()> {
        if row_offset + block.rows > self.rows || col_offset + block.cols > self.cols {
            return Err(TensorError::ShapeMismatch {
                left: self.shape(),
                right: (row_offset + block.rows, col_offset + block.cols),
            });
        }
        for r in 0..block.rows {
            let dst = (row_offset + r) * self.cols + col_offset;
            let src = &block.data[r * block.cols..(r + 1) * block.cols];
            for (d, s) in self.data[dst..dst + block.cols].iter_mut().zip(src) {
                *d += s;
            }
        }
        Ok(())
    }

    /// Stacks tensors with matching column counts vertically.
    pub fn cat_rows(parts: &[&Tensor]) -> PureResult<Tensor> {
        let first = parts.first().ok_or(TensorError::EmptyInput("cat_rows"))?;
        let cols = first.cols;
        let mut rows = 0;
        let mut data = Vec::new();
        for part in parts {
            if part.cols != cols {
                return Err(TensorError::ShapeMismatch {
                    left: first.shape(),
                    right: part.shape(),
                });
            }
            rows += part.rows;
            data.extend_from_slice(&part.data);
        }
        Tensor::from_vec(rows, cols, data)
    }

    /// Row-wise L2 normalisation. Returns the normalised tensor and the row norms.
    pub fn normalize_rows(&self, epsilon: f32) -> (Tensor, Vec<f32>) {
        let mut norms = Vec::with_capacity(self.rows);
        let mut data = Vec::with_capacity(self.data.len());
        for row in self.data.chunks(self.cols) {
            let norm = row.iter().map(|v| v * v).sum::<f32>().sqrt().max(epsilon);
            norms.push(norm);
            data.extend(row.iter().map(|v| v / norm));
        }
        (
            Tensor {
                rows: self.rows,
                cols: self.cols,
                data,
            },
            norms,
        )
    }

    /// Index of the largest entry in each row.
    pub fn argmax_rows(&self) -> Vec<usize> {
        self.data
            .chunks(self.cols)
            .map(|row| {
                let mut best = 0;
                for (idx, value) in row.iter().enumerate() {
                    if *value > row[best] {
                        best = idx;
                    }
                }
                best
            })
            .collect()
    }

    /// Returns an error if any entry is NaN or infinite.
    pub fn ensure_finite(&self, label: &'static str) -> PureResult<()> {
        match self.data.iter().find(|v| !v.is_finite()) {
            Some(value) => Err(TensorError::NonFiniteValue {
                label,
                value: *value,
            }),
            None => Ok(()),
        }
    }
}

/// Numerically stable softmax over a slice, honouring an optional allow mask.
///
/// Entries with `allow[i] == false` receive probability zero. A row with no
/// admissible entries yields all zeros.
pub fn masked_softmax(logits: &[f32], allow: Option<&[bool]>) -> Vec<f32> {
    let admitted = |i: usize| allow.map_or(true, |mask| mask[i]);
    let mut max = f32::NEG_INFINITY;
    for (i, v) in logits.iter().enumerate() {
        if admitted(i) && *v > max {
            max = *v;
        }
    }
    if !max.is_finite() {
        return vec![0.0; logits.len()];
    }
    let mut out: Vec<f32> = logits
        .iter()
        .enumerate()
        .map(|(i, v)| if admitted(i) { (v - max).exp() } else { 0.0 })
        .collect();
    let total: f32 = out.iter().sum();
    if total > 0.0 {
        for v in &mut out {
            *v /= total;
        }
    }
    out
}

/// `log(sum(exp(x)))` over a slice.
pub fn log_sum_exp(values: &[f32]) -> f32 {
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return max;
    }
    max + values.iter().map(|v| (v - max).exp()).sum::<f32>().ln()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn zero_dimensions_are_rejected() {
        assert!(matches!(
            Tensor::zeros(0, 3),
            Err(TensorError::InvalidDimensions { rows: 0, cols: 3 })
        ));
    }

    #[test]
    fn matmul_variants_agree() {
        let a = Tensor::from_vec(2, 3, vec![1.0, 2.0, 3.0, -1.0, 0.5, 2.0]).unwrap();
        let b = Tensor::from_vec(4, 3, (0..12).map(|v| v as f32 * 0.1).collect()).unwrap();
        let direct = a.matmul(&b.transpose()).unwrap();
        let fused = a.matmul_transpose(&b).unwrap();
        for (x, y) in direct.data().iter().zip(fused.data()) {
            assert!((x - y).abs() < 1e-6);
        }
        let c = Tensor::from_vec(2, 2, vec![0.5, -1.0, 2.0, 1.0]).unwrap();
        let direct = a.transpose().matmul(&c).unwrap();
        let fused = a.transpose_matmul(&c).unwrap();
        assert_eq!(direct.shape(), (3, 2));
        for (x, y) in direct.data().iter().zip(fused.data()) {
            assert!((x - y).abs() < 1e-6);
        }
    }

    #[test]
    fn block_writes_and_slices_line_up() {
        let mut canvas = Tensor::zeros(3, 4).unwrap();
        let block = Tensor::from_vec(2, 2, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        canvas.write_block(1, 2, &block).unwrap();
        assert_eq!(canvas.slice_rows(1, 3).unwrap().slice_cols(2, 4).unwrap(), block);
        canvas.accumulate_block(1, 2, &block).unwrap();
        assert_eq!(canvas.row(2).unwrap(), &[0.0, 0.0, 6.0, 8.0]);
        assert!(canvas.write_block(2, 3, &block).is_err());
    }

    #[test]
    fn masked_softmax_zeroes_disallowed_entries() {
        let probs = masked_softmax(&[1.0, 5.0, 2.0], Some(&[true, false, true]));
        assert_eq!(probs[1], 0.0);
        assert!((probs.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        let empty = masked_softmax(&[1.0, 2.0], Some(&[false, false]));
        assert_eq!(empty, vec![0.0, 0.0]);
    }

    #[test]
    fn normalised_rows_have_unit_norm() {
        let mut rng = StdRng::seed_from_u64(7);
        let t = Tensor::random_normal_with(5, 8, 0.0, 1.0, &mut rng).unwrap();
        let (unit, norms) = t.normalize_rows(1e-12);
        assert_eq!(norms.len(), 5);
        for row in unit.data().chunks(8) {
            let norm: f32 = row.iter().map(|v| v * v).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn argmax_prefers_first_maximum() {
        let t = Tensor::from_vec(2, 3, vec![0.1, 0.9, 0.9, 2.0, -1.0, 0.0]).unwrap();
        assert_eq!(t.argmax_rows(), vec![1, 0]);
    }
}
