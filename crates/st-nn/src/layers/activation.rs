// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::module::{Module, Parameter, Parameterized};
use crate::{PureResult, Tensor, TensorError};

/// Bounded activation `scale * x / (1 + |x|)`. Stateless.
#[derive(Debug, Clone, Copy)]
pub struct Softsign {
    scale: f32,
}

impl Default for Softsign {
    fn default() -> Self {
        Self { scale: 1.0 }
    }
}

impl Softsign {
    pub fn new(scale: f32) -> PureResult<Self> {
        if !scale.is_finite() {
            return Err(TensorError::NonFiniteValue {
                label: "softsign_scale",
                value: scale,
            });
        }
        Ok(Self { scale })
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }
}

impl Parameterized for Softsign {
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

impl Module for Softsign {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let scale = self.scale;
        Ok(input.map(|x| scale * x / (1.0 + x.abs())))
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        if input.shape() != grad_output.shape() {
            return Err(TensorError::ShapeMismatch {
                left: input.shape(),
                right: grad_output.shape(),
            });
        }
        let (rows, cols) = input.shape();
        let data = input
            .data()
            .iter()
            .zip(grad_output.data())
            .map(|(x, g)| {
                let denom = 1.0 + x.abs();
                g * self.scale / (denom * denom)
            })
            .collect();
        Tensor::from_vec(rows, cols, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::gradcheck::assert_input_gradient;

    #[test]
    fn softsign_stays_within_scale() {
        let layer = Softsign::new(2.0).unwrap();
        let input = Tensor::from_vec(1, 3, vec![-100.0, 0.0, 1.0]).unwrap();
        let out = layer.forward(&input).unwrap();
        assert!(out.data()[0] > -2.0 && out.data()[0] < -1.9);
        assert_eq!(out.data()[1], 0.0);
        assert!((out.data()[2] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn softsign_backward_matches_finite_differences() {
        let mut layer = Softsign::new(1.5).unwrap();
        let input = Tensor::from_vec(2, 2, vec![-0.7, 0.3, 1.2, -2.0]).unwrap();
        assert_input_gradient(&mut layer, &input, 1e-2);
    }
}
