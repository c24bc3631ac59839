// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Optimisers and learning-rate schedules operating over [`Parameterized`]
//! models.
//!
//! [`Parameterized`]: crate::module::Parameterized

mod adamw;
mod one_cycle;

pub use adamw::{AdamW, AdamWConfig, AdamWState, MomentState};
pub use one_cycle::{OneCycleConfig, OneCycleLr, OneCycleState};

use crate::PureResult;
use st_tensor::TensorError;

/// Schedules that hand out one learning rate per optimisation step.
pub trait LrScheduler {
    /// Learning rate for the step about to run.
    fn current_lr(&self) -> f32;

    /// Advances the schedule by one step and returns the new learning rate.
    fn step(&mut self) -> f32;

    /// Rewinds to the first step.
    fn reset(&mut self);
}

pub(crate) fn guard_learning_rate(rate: f32) -> PureResult<()> {
    if rate <= 0.0 || !rate.is_finite() {
        return Err(TensorError::NonPositiveLearningRate { rate });
    }
    Ok(())
}
