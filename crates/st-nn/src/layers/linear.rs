// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::module::{Module, Parameter, Parameterized};
use crate::{PureResult, Tensor, TensorError};
use rand::Rng;
use spiral_config::determinism;

/// Fully-connected layer computing `x · W + b` with `W` shaped `(input, output)`.
#[derive(Debug, Clone)]
pub struct Linear {
    weight: Parameter,
    bias: Parameter,
}

impl Linear {
    /// Creates a linear layer seeded from its name.
    pub fn new(name: impl Into<String>, input_dim: usize, output_dim: usize) -> PureResult<Self> {
        let name = name.into();
        let mut rng = determinism::rng_from_label(&name);
        Self::with_rng(name, input_dim, output_dim, &mut rng)
    }

    /// Creates a linear layer with `U(-1/sqrt(in), 1/sqrt(in))` weights and bias.
    pub fn with_rng<R: Rng + ?Sized>(
        name: impl Into<String>,
        input_dim: usize,
        output_dim: usize,
        rng: &mut R,
    ) -> PureResult<Self> {
        if input_dim == 0 || output_dim == 0 {
            return Err(TensorError::InvalidDimensions {
                rows: input_dim,
                cols: output_dim,
            });
        }
        let name = name.into();
        let bound = 1.0 / (input_dim as f32).sqrt();
        let weight = Tensor::random_uniform_with(input_dim, output_dim, -bound, bound, rng)?;
        let bias = Tensor::random_uniform_with(1, output_dim, -bound, bound, rng)?;
        Ok(Self {
            weight: Parameter::new(format!("{name}::weight"), weight),
            bias: Parameter::new(format!("{name}::bias"), bias),
        })
    }

    /// Returns a reference to the weight parameter.
    pub fn weight(&self) -> &Parameter {
        &self.weight
    }

    /// Returns a reference to the bias parameter.
    pub fn bias(&self) -> &Parameter {
        &self.bias
    }

    pub fn input_dim(&self) -> usize {
        self.weight.value().rows()
    }

    pub fn output_dim(&self) -> usize {
        self.weight.value().cols()
    }
}

impl Parameterized for Linear {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&self.weight)?;
        visitor(&self.bias)?;
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&mut self.weight)?;
        visitor(&mut self.bias)?;
        Ok(())
    }
}

impl Module for Linear {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        if input.shape().1 != self.weight.value().shape().0 {
            return Err(TensorError::ShapeMismatch {
                left: input.shape(),
                right: self.weight.value().shape(),
            });
        }
        let mut out = input.matmul(self.weight.value())?;
        out.add_row_inplace(self.bias.value().data())?;
        Ok(out)
    }

    /// Gradients are summed over rows; callers normalise at the loss.
    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        if input.shape().0 != grad_output.shape().0
            || grad_output.shape().1 != self.output_dim()
        {
            return Err(TensorError::ShapeMismatch {
                left: input.shape(),
                right: grad_output.shape(),
            });
        }
        let grad_w = input.transpose_matmul(grad_output)?;
        self.weight.accumulate_euclidean(&grad_w)?;

        let summed = grad_output.sum_axis0();
        let grad_b = Tensor::from_vec(1, summed.len(), summed)?;
        self.bias.accumulate_euclidean(&grad_b)?;

        grad_output.matmul_transpose(self.weight.value())
    }
}
