// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use super::{Loss, SoftmaxCrossEntropy};
use crate::{PureResult, Tensor};
use st_tensor::TensorError;

/// InfoNCE over a similarity matrix: each row is a query scored against a bank
/// of candidates and `target` holds the positive distribution for that row.
#[derive(Debug, Default, Clone, Copy)]
pub struct InfoNce {
    ce: SoftmaxCrossEntropy,
}

/// `(rows, cols)` target with ones on the leading diagonal. Requires `cols >= rows`.
pub fn diagonal_targets(rows: usize, cols: usize) -> PureResult<Tensor> {
    if cols < rows {
        return Err(TensorError::ShapeMismatch {
            left: (rows, rows),
            right: (rows, cols),
        });
    }
    Tensor::from_fn(rows, cols, |r, c| if r == c { 1.0 } else { 0.0 })
}

/// Fraction of rows whose arg-max lands on a positive column.
pub fn top1_accuracy(logits: &Tensor, targets: &Tensor) -> PureResult<f32> {
    if logits.shape() != targets.shape() {
        return Err(TensorError::ShapeMismatch {
            left: logits.shape(),
            right: targets.shape(),
        });
    }
    let cols = logits.cols();
    let hits = logits
        .argmax_rows()
        .iter()
        .enumerate()
        .filter(|(row, col)| targets.data()[row * cols + **col] > 0.0)
        .count();
    Ok(hits as f32 / logits.rows() as f32)
}

impl InfoNce {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mean loss and its gradient with respect to `logits`.
    pub fn loss_and_grad(&self, logits: &Tensor, targets: &Tensor) -> PureResult<(f32, Tensor)> {
        let rows = self.ce.per_row_soft(logits, targets)?;
        let inv = 1.0 / logits.rows() as f32;
        let loss = rows.iter().sum::<f32>() * inv;
        let grad = self.ce.grad_rows_soft(logits, targets)?.scale(inv)?;
        Ok((loss, grad))
    }
}

impl Loss for InfoNce {
    fn forward(&mut self, prediction: &Tensor, target: &Tensor) -> PureResult<Tensor> {
        let (loss, _) = self.loss_and_grad(prediction, target)?;
        Tensor::from_vec(1, 1, vec![loss])
    }

    fn backward(&mut self, prediction: &Tensor, target: &Tensor) -> PureResult<Tensor> {
        Ok(self.loss_and_grad(prediction, target)?.1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confident_diagonal_gives_small_loss_and_full_accuracy() {
        let nce = InfoNce::new();
        let logits = Tensor::from_fn(3, 3, |r, c| if r == c { 10.0 } else { 0.0 }).unwrap();
        let targets = diagonal_targets(3, 3).unwrap();
        let (loss, grad) = nce.loss_and_grad(&logits, &targets).unwrap();
        assert!(loss < 1e-3);
        assert!(grad.data().iter().all(|g| g.abs() < 1e-3));
        assert_eq!(top1_accuracy(&logits, &targets).unwrap(), 1.0);
    }

    #[test]
    fn uniform_logits_cost_log_bank_size() {
        let nce = InfoNce::new();
        let logits = Tensor::zeros(2, 6).unwrap();
        let targets = diagonal_targets(2, 6).unwrap();
        let (loss, grad) = nce.loss_and_grad(&logits, &targets).unwrap();
        assert!((loss - 6.0f32.ln()).abs() < 1e-5);
        assert!((grad.data()[0] - (1.0 / 6.0 - 1.0) / 2.0).abs() < 1e-6);
    }
}
