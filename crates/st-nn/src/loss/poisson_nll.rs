// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use super::Loss;
use crate::{PureResult, Tensor};
use st_tensor::TensorError;

/// Poisson negative log-likelihood for predictions expressed as log-rates:
/// `exp(p) - y * p` per element (the `log(y!)` constant is dropped).
#[derive(Debug, Default, Clone, Copy)]
pub struct PoissonNll;

impl PoissonNll {
    pub fn new() -> Self {
        Self
    }

    fn guard(prediction: &Tensor, target: &Tensor) -> PureResult<()> {
        if prediction.shape() != target.shape() {
            return Err(TensorError::ShapeMismatch {
                left: prediction.shape(),
                right: target.shape(),
            });
        }
        Ok(())
    }

    /// Unreduced loss.
    pub fn elementwise(&self, prediction: &Tensor, target: &Tensor) -> PureResult<Tensor> {
        Self::guard(prediction, target)?;
        let (rows, cols) = prediction.shape();
        let data = prediction
            .data()
            .iter()
            .zip(target.data())
            .map(|(p, y)| p.exp() - y * p)
            .collect();
        Tensor::from_vec(rows, cols, data)
    }

    /// Unreduced derivative with respect to the log-rate.
    pub fn elementwise_grad(&self, prediction: &Tensor, target: &Tensor) -> PureResult<Tensor> {
        Self::guard(prediction, target)?;
        let (rows, cols) = prediction.shape();
        let data = prediction
            .data()
            .iter()
            .zip(target.data())
            .map(|(p, y)| p.exp() - y)
            .collect();
        Tensor::from_vec(rows, cols, data)
    }
}

impl Loss for PoissonNll {
    fn forward(&mut self, prediction: &Tensor, target: &Tensor) -> PureResult<Tensor> {
        let loss = self.elementwise(prediction, target)?;
        Tensor::from_vec(1, 1, vec![loss.sum() / loss.len() as f32])
    }

    fn backward(&mut self, prediction: &Tensor, target: &Tensor) -> PureResult<Tensor> {
        let grad = self.elementwise_grad(prediction, target)?;
        let inv = 1.0 / grad.len() as f32;
        grad.scale(inv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poisson_minimum_sits_at_log_target() {
        let loss = PoissonNll::new();
        let target = Tensor::from_vec(1, 1, vec![3.0]).unwrap();
        let at_opt = Tensor::from_vec(1, 1, vec![3.0f32.ln()]).unwrap();
        let grad = loss.elementwise_grad(&at_opt, &target).unwrap();
        assert!(grad.data()[0].abs() < 1e-5);
        let value = loss.elementwise(&at_opt, &target).unwrap();
        assert!((value.data()[0] - (3.0 - 3.0 * 3.0f32.ln())).abs() < 1e-5);
    }

    #[test]
    fn mean_reduction_scales_gradient() {
        let mut loss = PoissonNll::new();
        let pred = Tensor::from_vec(1, 2, vec![0.0, 0.0]).unwrap();
        let target = Tensor::from_vec(1, 2, vec![0.0, 2.0]).unwrap();
        assert!((loss.forward(&pred, &target).unwrap().data()[0] - 1.0).abs() < 1e-6);
        assert_eq!(loss.backward(&pred, &target).unwrap().data(), &[0.5, -0.5]);
    }
}
