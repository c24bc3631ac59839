// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::module::{Module, Parameter, Parameterized};
use crate::{PureResult, Tensor, TensorError};

/// Row-wise layer normalisation with learnable affine parameters.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    features: usize,
    epsilon: f32,
    gamma: Parameter,
    beta: Parameter,
}

impl LayerNorm {
    pub fn new(name: impl Into<String>, features: usize, epsilon: f32) -> PureResult<Self> {
        if features == 0 {
            return Err(TensorError::InvalidDimensions {
                rows: 1,
                cols: features,
            });
        }
        if epsilon <= 0.0 || !epsilon.is_finite() {
            return Err(TensorError::NonFiniteValue {
                label: "layer_norm_epsilon",
                value: epsilon,
            });
        }
        let name = name.into();
        Ok(Self {
            features,
            epsilon,
            gamma: Parameter::new(format!("{name}::gamma"), Tensor::filled(1, features, 1.0)?),
            beta: Parameter::new(format!("{name}::beta"), Tensor::zeros(1, features)?),
        })
    }

    pub fn features(&self) -> usize {
        self.features
    }

    pub fn gamma(&self) -> &Parameter {
        &self.gamma
    }

    pub fn beta(&self) -> &Parameter {
        &self.beta
    }

    fn guard_input(&self, input: &Tensor) -> PureResult<()> {
        if input.shape().1 != self.features {
            return Err(TensorError::ShapeMismatch {
                left: input.shape(),
                right: (input.shape().0, self.features),
            });
        }
        Ok(())
    }

    fn row_stats(&self, slice: &[f32]) -> (f32, f32) {
        let cols = slice.len() as f32;
        let mean = slice.iter().sum::<f32>() / cols;
        let variance = slice
            .iter()
            .map(|x| {
                let centered = x - mean;
                centered * centered
            })
            .sum::<f32>()
            / cols;
        (mean, 1.0 / (variance + self.epsilon).sqrt())
    }
}

impl Parameterized for LayerNorm {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&self.gamma)?;
        visitor(&self.beta)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&mut self.gamma)?;
        visitor(&mut self.beta)
    }
}

impl Module for LayerNorm {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        self.guard_input(input)?;
        let (rows, cols) = input.shape();
        let gamma = self.gamma.value().data();
        let beta = self.beta.value().data();
        let mut out = Vec::with_capacity(rows * cols);
        for slice in input.data().chunks(cols) {
            let (mean, inv_std) = self.row_stats(slice);
            for c in 0..cols {
                out.push((slice[c] - mean) * inv_std * gamma[c] + beta[c]);
            }
        }
        Tensor::from_vec(rows, cols, out)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        self.guard_input(input)?;
        if input.shape() != grad_output.shape() {
            return Err(TensorError::ShapeMismatch {
                left: input.shape(),
                right: grad_output.shape(),
            });
        }
        let (rows, cols) = input.shape();
        let gamma = self.gamma.value().data().to_vec();
        let mut grad_input = vec![0.0f32; rows * cols];
        let mut grad_gamma = vec![0.0f32; cols];
        let mut grad_beta = vec![0.0f32; cols];
        let mut normed = vec![0.0f32; cols];
        let mut scaled = vec![0.0f32; cols];

        for r in 0..rows {
            let offset = r * cols;
            let slice = &input.data()[offset..offset + cols];
            let grad_slice = &grad_output.data()[offset..offset + cols];
            let (mean, inv_std) = self.row_stats(slice);
            for c in 0..cols {
                normed[c] = (slice[c] - mean) * inv_std;
                grad_gamma[c] += grad_slice[c] * normed[c];
                grad_beta[c] += grad_slice[c];
                scaled[c] = grad_slice[c] * gamma[c];
            }
            let sum_scaled: f32 = scaled.iter().sum();
            let dot: f32 = scaled.iter().zip(&normed).map(|(g, n)| g * n).sum();
            for c in 0..cols {
                let term = (cols as f32 * scaled[c] - sum_scaled - normed[c] * dot) / cols as f32;
                grad_input[offset + c] = term * inv_std;
            }
        }

        self.gamma
            .accumulate_euclidean(&Tensor::from_vec(1, cols, grad_gamma)?)?;
        self.beta
            .accumulate_euclidean(&Tensor::from_vec(1, cols, grad_beta)?)?;
        Tensor::from_vec(rows, cols, grad_input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::gradcheck::assert_input_gradient;

    #[test]
    fn layer_norm_zero_mean_unit_variance() {
        let layer = LayerNorm::new("demo", 3, 1e-5).unwrap();
        let input = Tensor::from_vec(2, 3, vec![0.5, -1.0, 1.5, 2.0, -0.5, 0.0]).unwrap();
        let output = layer.forward(&input).unwrap();
        for slice in output.data().chunks(3) {
            let mean: f32 = slice.iter().sum::<f32>() / 3.0;
            let var: f32 = slice.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / 3.0;
            assert!(mean.abs() < 1e-5);
            assert!((var - 1.0).abs() < 1e-3);
        }
    }

    #[test]
    fn layer_norm_backward_matches_finite_differences() {
        let mut layer = LayerNorm::new("demo", 4, 1e-5).unwrap();
        layer
            .gamma
            .load_value(&Tensor::from_vec(1, 4, vec![1.0, 0.5, -0.7, 2.0]).unwrap())
            .unwrap();
        let input =
            Tensor::from_vec(2, 4, vec![0.3, -1.2, 0.8, 0.1, 1.5, 0.2, -0.4, -0.9]).unwrap();
        assert_input_gradient(&mut layer, &input, 2e-2);
        assert!(layer.gamma().gradient().is_some());
    }
}
