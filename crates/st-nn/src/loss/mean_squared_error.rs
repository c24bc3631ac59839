// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use super::Loss;
use crate::{PureResult, Tensor};
use st_tensor::TensorError;

/// Classic mean squared error loss with mean reduction.
#[derive(Debug, Default, Clone, Copy)]
pub struct MeanSquaredError;

impl MeanSquaredError {
    /// Creates a new mean squared error loss instance.
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

    /// Unreduced squared error.
    pub fn elementwise(&self, prediction: &Tensor, target: &Tensor) -> PureResult<Tensor> {
        Self::guard(prediction, target)?;
        let diff = prediction.sub(target)?;
        Ok(diff.map(|d| d * d))
    }

    /// Unreduced derivative `2 (p - y)`.
    pub fn elementwise_grad(&self, prediction: &Tensor, target: &Tensor) -> PureResult<Tensor> {
        Self::guard(prediction, target)?;
        prediction.sub(target)?.scale(2.0)
    }
}

impl Loss for MeanSquaredError {
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
    fn mse_forward_backward() {
        let mut loss = MeanSquaredError::new();
        let prediction = Tensor::from_vec(1, 3, vec![0.5, -0.5, 1.0]).unwrap();
        let target = Tensor::from_vec(1, 3, vec![0.0, 0.0, 1.5]).unwrap();
        let value = loss.forward(&prediction, &target).unwrap();
        assert!((value.data()[0] - 0.25).abs() < 1e-6);

        let grad = loss.backward(&prediction, &target).unwrap();
        assert_eq!(grad.data().len(), 3);
        assert!(grad.data()[0] > 0.0);
        assert!(grad.data()[1] < 0.0);
    }
}
