// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::module::{Module, Parameter, Parameterized};
use crate::{PureResult, Tensor, TensorError};

const SQRT_2_OVER_PI: f32 = 0.797_884_6;
const KAPPA: f32 = 0.044715;

/// Gaussian Error Linear Unit with the tanh-based approximation.
#[derive(Debug, Clone, Copy, Default)]
pub struct Gelu;

impl Gelu {
    pub fn new() -> Self {
        Self
    }

    fn gelu(value: f32) -> f32 {
        let cubic = value * value * value;
        let inner = SQRT_2_OVER_PI * (value + KAPPA * cubic);
        0.5 * value * (1.0 + inner.tanh())
    }

    fn gelu_derivative(value: f32) -> f32 {
        let cubic = value * value * value;
        let inner = SQRT_2_OVER_PI * (value + KAPPA * cubic);
        let tanh_inner = inner.tanh();
        let sech_sq = 1.0 - tanh_inner * tanh_inner;
        let d_inner = SQRT_2_OVER_PI * (1.0 + 3.0 * KAPPA * value * value);
        0.5 * (1.0 + tanh_inner) + 0.5 * value * sech_sq * d_inner
    }
}

impl Parameterized for Gelu {
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

impl Module for Gelu {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        Ok(input.map(Self::gelu))
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
            .map(|(x, g)| Self::gelu_derivative(*x) * g)
            .collect();
        Tensor::from_vec(rows, cols, data)
    }
}
