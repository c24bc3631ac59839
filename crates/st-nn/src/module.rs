// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use st_tensor::{PureResult, Tensor, TensorError};
use std::collections::HashMap;

/// Trainable parameter with a Euclidean gradient accumulator.
#[derive(Clone)]
pub struct Parameter {
    name: String,
    value: Tensor,
    gradient: Option<Tensor>,
    frozen: bool,
}

impl core::fmt::Debug for Parameter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let (rows, cols) = self.value.shape();
        write!(
            f,
            "Parameter(name={},shape=({},{}),has_grad={},frozen={})",
            self.name,
            rows,
            cols,
            self.gradient.is_some(),
            self.frozen
        )
    }
}

impl Parameter {
    /// Creates a new parameter with the provided tensor value.
    pub fn new(name: impl Into<String>, value: Tensor) -> Self {
        Self {
            name: name.into(),
            value,
            gradient: None,
            frozen: false,
        }
    }

    /// Returns the identifier assigned to the parameter.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Overrides the parameter name.
    pub fn rename(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn value(&self) -> &Tensor {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut Tensor {
        &mut self.value
    }

    /// Returns the accumulated gradient, if any backward pass touched this parameter.
    pub fn gradient(&self) -> Option<&Tensor> {
        self.gradient.as_ref()
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Frozen parameters ignore gradient updates until thawed.
    pub fn set_frozen(&mut self, frozen: bool) {
        self.frozen = frozen;
        if frozen {
            self.gradient = None;
        }
    }

    fn assert_shape(&self, tensor: &Tensor) -> PureResult<()> {
        if self.value.shape() != tensor.shape() {
            return Err(TensorError::ShapeMismatch {
                left: self.value.shape(),
                right: tensor.shape(),
            });
        }
        Ok(())
    }

    /// Accumulates a Euclidean gradient update. Frozen parameters drop it.
    pub fn accumulate_euclidean(&mut self, update: &Tensor) -> PureResult<()> {
        self.assert_shape(update)?;
        if self.frozen {
            return Ok(());
        }
        match self.gradient.as_mut() {
            Some(existing) => existing.add_scaled(update, 1.0)?,
            None => {
                self.gradient = Some(update.clone());
            }
        }
        Ok(())
    }

    /// Clears the cached gradient.
    pub fn zero_gradient(&mut self) {
        if let Some(grad) = self.gradient.as_mut() {
            for value in grad.data_mut() {
                *value = 0.0;
            }
        }
    }

    /// Plain SGD step with the supplied learning rate, then clears the gradient.
    pub fn apply_step(&mut self, learning_rate: f32) -> PureResult<()> {
        if self.frozen {
            return Ok(());
        }
        if let Some(grad) = self.gradient.as_mut() {
            self.value.add_scaled(grad, -learning_rate)?;
            for value in grad.data_mut() {
                *value = 0.0;
            }
        }
        Ok(())
    }

    /// Returns the squared L2 norm of the accumulated gradient.
    pub fn accumulators_norm_sq(&self) -> f64 {
        self.gradient
            .as_ref()
            .map(|grad| grad.data().iter().map(|&v| (v as f64) * (v as f64)).sum())
            .unwrap_or(0.0)
    }

    /// Replaces the parameter value with the provided tensor.
    pub fn load_value(&mut self, value: &Tensor) -> PureResult<()> {
        self.assert_shape(value)?;
        self.value = value.clone();
        Ok(())
    }
}

/// Anything that owns named parameters.
///
/// Optimisers, checkpoint IO and momentum snapshots only need this half of the
/// module surface, so composite models whose forward pass does not fit the
/// single-tensor [`Module`] signature implement it directly.
pub trait Parameterized {
    /// Visits immutable parameters.
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()>;

    /// Visits mutable parameters.
    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()>;

    /// Applies a plain SGD step to every parameter.
    fn apply_step(&mut self, learning_rate: f32) -> PureResult<()> {
        self.visit_parameters_mut(&mut |param| param.apply_step(learning_rate))
    }

    /// Clears accumulators across every parameter.
    fn zero_accumulators(&mut self) -> PureResult<()> {
        self.visit_parameters_mut(&mut |param| {
            param.zero_gradient();
            Ok(())
        })
    }

    /// Total number of scalar weights.
    fn parameter_count(&self) -> PureResult<usize> {
        let mut total = 0;
        self.visit_parameters(&mut |param| {
            total += param.value().len();
            Ok(())
        })?;
        Ok(total)
    }

    /// Captures a copy of every parameter tensor keyed by its canonical name.
    fn state_dict(&self) -> PureResult<HashMap<String, Tensor>> {
        let mut state = HashMap::new();
        self.visit_parameters(&mut |param| {
            state.insert(param.name().to_string(), param.value().clone());
            Ok(())
        })?;
        Ok(state)
    }

    /// Restores parameters from a state dictionary produced by [`Parameterized::state_dict`].
    fn load_state_dict(&mut self, state: &HashMap<String, Tensor>) -> PureResult<()> {
        self.visit_parameters_mut(&mut |param| {
            let Some(value) = state.get(param.name()) else {
                return Err(TensorError::MissingParameter {
                    name: param.name().to_string(),
                });
            };
            param.load_value(value)
        })
    }
}

/// High-level module trait inspired by PyTorch's `nn.Module`.
pub trait Module: Parameterized {
    /// Runs a forward pass.
    fn forward(&self, input: &Tensor) -> PureResult<Tensor>;

    /// Propagates a gradient backwards. Implementations recompute whatever
    /// intermediate state they need from `input`, populate the relevant
    /// parameter accumulators and return the gradient with respect to `input`.
    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frozen_parameters_ignore_updates() {
        let mut param = Parameter::new("gate", Tensor::zeros(1, 3).unwrap());
        param.set_frozen(true);
        param
            .accumulate_euclidean(&Tensor::from_vec(1, 3, vec![1.0, 2.0, 3.0]).unwrap())
            .unwrap();
        assert!(param.gradient().is_none());
        param.apply_step(0.1).unwrap();
        assert_eq!(param.value().data(), &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn gradients_accumulate_until_step() {
        let mut param = Parameter::new("gate", Tensor::zeros(1, 2).unwrap());
        let update = Tensor::from_vec(1, 2, vec![1.0, -1.0]).unwrap();
        param.accumulate_euclidean(&update).unwrap();
        param.accumulate_euclidean(&update).unwrap();
        assert_eq!(param.gradient().unwrap().data(), &[2.0, -2.0]);
        param.apply_step(0.5).unwrap();
        assert_eq!(param.value().data(), &[-1.0, 1.0]);
        assert_eq!(param.accumulators_norm_sq(), 0.0);
    }

    #[test]
    fn shape_mismatch_is_reported() {
        let mut param = Parameter::new("gate", Tensor::zeros(2, 2).unwrap());
        let err = param
            .load_value(&Tensor::zeros(1, 4).unwrap())
            .unwrap_err();
        assert!(matches!(err, TensorError::ShapeMismatch { .. }));
    }
}
