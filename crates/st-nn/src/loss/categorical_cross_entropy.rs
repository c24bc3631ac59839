// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use super::Loss;
use crate::{PureResult, Tensor};
use st_tensor::{log_sum_exp, masked_softmax, TensorError};

/// Cross entropy on raw logits against integer labels or one-hot targets.
#[derive(Debug, Default, Clone, Copy)]
pub struct SoftmaxCrossEntropy;

/// One-hot encodes integer labels into `(labels.len(), classes)`.
pub fn one_hot(labels: &[usize], classes: usize) -> PureResult<Tensor> {
    let mut out = Tensor::zeros(labels.len(), classes)?;
    for (row, &label) in labels.iter().enumerate() {
        if label >= classes {
            return Err(TensorError::IndexOutOfRange {
                label: "class label",
                index: label,
                len: classes,
            });
        }
        out.row_mut(row)?[label] = 1.0;
    }
    Ok(out)
}

impl SoftmaxCrossEntropy {
    pub fn new() -> Self {
        Self
    }

    /// `-log softmax(logits)[label]` for every row.
    pub fn per_row(&self, logits: &Tensor, labels: &[usize]) -> PureResult<Vec<f32>> {
        let targets = one_hot(labels, logits.cols())?;
        self.per_row_soft(logits, &targets)
    }

    /// `-sum_c target[c] * log softmax(logits)[c]` for every row.
    pub fn per_row_soft(&self, logits: &Tensor, targets: &Tensor) -> PureResult<Vec<f32>> {
        if logits.shape() != targets.shape() {
            return Err(TensorError::ShapeMismatch {
                left: logits.shape(),
                right: targets.shape(),
            });
        }
        let cols = logits.cols();
        Ok(logits
            .data()
            .chunks(cols)
            .zip(targets.data().chunks(cols))
            .map(|(row, target)| {
                let lse = log_sum_exp(row);
                row.iter()
                    .zip(target)
                    .map(|(z, t)| if *t == 0.0 { 0.0 } else { -t * (z - lse) })
                    .sum()
            })
            .collect())
    }

    /// Row-wise gradient `softmax(logits) * sum(target) - target`, unreduced.
    pub fn grad_rows_soft(&self, logits: &Tensor, targets: &Tensor) -> PureResult<Tensor> {
        if logits.shape() != targets.shape() {
            return Err(TensorError::ShapeMismatch {
                left: logits.shape(),
                right: targets.shape(),
            });
        }
        let (rows, cols) = logits.shape();
        let mut grad = Vec::with_capacity(rows * cols);
        for (row, target) in logits.data().chunks(cols).zip(targets.data().chunks(cols)) {
            let mass: f32 = target.iter().sum();
            let probs = masked_softmax(row, None);
            grad.extend(probs.iter().zip(target).map(|(p, t)| p * mass - t));
        }
        Tensor::from_vec(rows, cols, grad)
    }

    pub fn grad_rows(&self, logits: &Tensor, labels: &[usize]) -> PureResult<Tensor> {
        let targets = one_hot(labels, logits.cols())?;
        self.grad_rows_soft(logits, &targets)
    }
}

impl Loss for SoftmaxCrossEntropy {
    fn forward(&mut self, prediction: &Tensor, target: &Tensor) -> PureResult<Tensor> {
        let rows = self.per_row_soft(prediction, target)?;
        let mean = rows.iter().sum::<f32>() / rows.len() as f32;
        Tensor::from_vec(1, 1, vec![mean])
    }

    fn backward(&mut self, prediction: &Tensor, target: &Tensor) -> PureResult<Tensor> {
        let grad = self.grad_rows_soft(prediction, target)?;
        let inv = 1.0 / prediction.rows() as f32;
        grad.scale(inv)
    }
}
