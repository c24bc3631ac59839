// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use super::guard_learning_rate;
use crate::module::Parameterized;
use crate::{PureResult, Tensor, TensorError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::trace;

/// Hyper-parameters for [`AdamW`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdamWConfig {
    pub learning_rate: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    pub weight_decay: f32,
}

impl Default for AdamWConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.01,
        }
    }
}

impl AdamWConfig {
    pub fn with_learning_rate(mut self, rate: f32) -> Self {
        self.learning_rate = rate;
        self
    }

    pub fn with_weight_decay(mut self, decay: f32) -> Self {
        self.weight_decay = decay;
        self
    }

    pub fn validate(&self) -> PureResult<()> {
        guard_learning_rate(self.learning_rate)?;
        for beta in [self.beta1, self.beta2] {
            if !(0.0..1.0).contains(&beta) {
                return Err(TensorError::InvalidValue { label: "adamw_beta" });
            }
        }
        if self.epsilon <= 0.0 || self.weight_decay < 0.0 {
            return Err(TensorError::InvalidValue {
                label: "adamw_epsilon_or_decay",
            });
        }
        Ok(())
    }
}

/// First and second moment buffers for one parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MomentState {
    pub first: Tensor,
    pub second: Tensor,
}

/// Serialisable optimiser state for checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdamWState {
    pub step: u64,
    pub moments: HashMap<String, MomentState>,
}

/// Adam with decoupled weight decay. Moments are keyed by parameter name so
/// parameters registered after construction (new session adapters) pick up
/// fresh state on their first update.
#[derive(Debug, Clone)]
pub struct AdamW {
    config: AdamWConfig,
    step: u64,
    moments: HashMap<String, MomentState>,
}

impl AdamW {
    pub fn new(config: AdamWConfig) -> PureResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            step: 0,
            moments: HashMap::new(),
        })
    }

    pub fn config(&self) -> &AdamWConfig {
        &self.config
    }

    pub fn steps_taken(&self) -> u64 {
        self.step
    }

    pub fn learning_rate(&self) -> f32 {
        self.config.learning_rate
    }

    /// Overrides the learning rate, typically from an [`LrScheduler`](super::LrScheduler).
    pub fn set_learning_rate(&mut self, rate: f32) -> PureResult<()> {
        guard_learning_rate(rate)?;
        self.config.learning_rate = rate;
        Ok(())
    }

    /// Updates every thawed parameter that carries a gradient, then clears
    /// the gradients.
    pub fn step<M: Parameterized + ?Sized>(&mut self, model: &mut M) -> PureResult<()> {
        self.step += 1;
        let cfg = self.config;
        let t = self.step as i32;
        let bias1 = 1.0 - cfg.beta1.powi(t);
        let bias2 = 1.0 - cfg.beta2.powi(t);
        let moments = &mut self.moments;
        trace!(step = self.step, lr = cfg.learning_rate, "adamw step");
        model.visit_parameters_mut(&mut |param| {
            if param.is_frozen() {
                return Ok(());
            }
            let Some(grad) = param.gradient().cloned() else {
                return Ok(());
            };
            let (rows, cols) = grad.shape();
            let stale = moments
                .get(param.name())
                .map_or(true, |state| state.first.shape() != (rows, cols));
            if stale {
                moments.insert(
                    param.name().to_string(),
                    MomentState {
                        first: Tensor::zeros(rows, cols)?,
                        second: Tensor::zeros(rows, cols)?,
                    },
                );
            }
            let state = moments
                .get_mut(param.name())
                .ok_or_else(|| TensorError::MissingParameter {
                    name: param.name().to_string(),
                })?;
            let value = param.value_mut().data_mut();
            let first = state.first.data_mut();
            let second = state.second.data_mut();
            for (idx, &g) in grad.data().iter().enumerate() {
                value[idx] -= cfg.learning_rate * cfg.weight_decay * value[idx];
                first[idx] = cfg.beta1 * first[idx] + (1.0 - cfg.beta1) * g;
                second[idx] = cfg.beta2 * second[idx] + (1.0 - cfg.beta2) * g * g;
                let m_hat = first[idx] / bias1;
                let v_hat = second[idx] / bias2;
                value[idx] -= cfg.learning_rate * m_hat / (v_hat.sqrt() + cfg.epsilon);
            }
            param.zero_gradient();
            Ok(())
        })
    }

    pub fn state(&self) -> AdamWState {
        AdamWState {
            step: self.step,
            moments: self.moments.clone(),
        }
    }

    pub fn load_state(&mut self, state: AdamWState) {
        self.step = state.step;
        self.moments = state.moments;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::Linear;
    use crate::module::Module;

    #[test]
    fn first_step_moves_each_weight_by_learning_rate() {
        let mut layer = Linear::new("adamw", 2, 1).unwrap();
        let before = layer.weight().value().clone();
        let input = Tensor::from_vec(1, 2, vec![1.0, -1.0]).unwrap();
        let grad_out = Tensor::from_vec(1, 1, vec![1.0]).unwrap();
        layer.backward(&input, &grad_out).unwrap();
        let mut opt = AdamW::new(AdamWConfig::default().with_weight_decay(0.0)).unwrap();
        opt.step(&mut layer).unwrap();
        let after = layer.weight().value();
        assert!((before.data()[0] - after.data()[0] - 1e-3).abs() < 1e-6);
        assert!((after.data()[1] - before.data()[1] - 1e-3).abs() < 1e-6);
        assert!(layer.weight().gradient().unwrap().data().iter().all(|g| *g == 0.0));
    }

    #[test]
    fn frozen_parameters_are_left_alone() {
        let mut layer = Linear::new("adamw_frozen", 2, 2).unwrap();
        layer
            .visit_parameters_mut(&mut |p| {
                p.set_frozen(true);
                Ok(())
            })
            .unwrap();
        let before = layer.state_dict().unwrap();
        let mut opt = AdamW::new(AdamWConfig::default()).unwrap();
        opt.step(&mut layer).unwrap();
        assert_eq!(before, layer.state_dict().unwrap());
        assert!(opt.state().moments.is_empty());
    }

    #[test]
    fn rejects_bad_hyper_parameters() {
        assert!(AdamW::new(AdamWConfig::default().with_learning_rate(0.0)).is_err());
        let mut cfg = AdamWConfig::default();
        cfg.beta2 = 1.0;
        assert!(AdamW::new(cfg).is_err());
    }
}
