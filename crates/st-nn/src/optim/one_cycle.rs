// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use super::{guard_learning_rate, LrScheduler};
use crate::{PureResult, TensorError};
use serde::{Deserialize, Serialize};
use std::f32::consts::PI;

/// Shape of a one-cycle schedule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OneCycleConfig {
    pub max_lr: f32,
    pub total_steps: u64,
    /// Fraction of the run spent warming up.
    pub pct_start: f32,
    /// `initial_lr = max_lr / div_factor`.
    pub div_factor: f32,
    /// `final_lr = initial_lr / final_div_factor`.
    pub final_div_factor: f32,
}

impl Default for OneCycleConfig {
    fn default() -> Self {
        Self {
            max_lr: 1e-3,
            total_steps: 1000,
            pct_start: 0.3,
            div_factor: 25.0,
            final_div_factor: 1e4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneCycleState {
    pub step: u64,
}

/// Cosine warm-up from `max_lr / div_factor` to `max_lr`, then cosine
/// annealing down to the final rate. Steps past `total_steps` hold the final rate.
#[derive(Debug, Clone)]
pub struct OneCycleLr {
    config: OneCycleConfig,
    step: u64,
}

fn cosine(start: f32, end: f32, pct: f32) -> f32 {
    end + (start - end) * 0.5 * (1.0 + (PI * pct).cos())
}

impl OneCycleLr {
    pub fn new(config: OneCycleConfig) -> PureResult<Self> {
        guard_learning_rate(config.max_lr)?;
        if config.total_steps == 0 {
            return Err(TensorError::InvalidValue {
                label: "one_cycle_total_steps",
            });
        }
        if !(0.0..=1.0).contains(&config.pct_start)
            || config.div_factor <= 0.0
            || config.final_div_factor <= 0.0
        {
            return Err(TensorError::InvalidValue {
                label: "one_cycle_shape",
            });
        }
        Ok(Self { config, step: 0 })
    }

    pub fn config(&self) -> &OneCycleConfig {
        &self.config
    }

    fn lr_at(&self, step: u64) -> f32 {
        let cfg = &self.config;
        let initial = cfg.max_lr / cfg.div_factor;
        let floor = initial / cfg.final_div_factor;
        let last = cfg.total_steps.saturating_sub(1) as f32;
        let peak = (cfg.pct_start * last).floor();
        let step = (step as f32).min(last);
        if step <= peak {
            if peak == 0.0 {
                return cfg.max_lr;
            }
            cosine(initial, cfg.max_lr, step / peak)
        } else {
            let span = (last - peak).max(1.0);
            cosine(cfg.max_lr, floor, (step - peak) / span)
        }
    }

    pub fn state(&self) -> OneCycleState {
        OneCycleState { step: self.step }
    }

    pub fn load_state(&mut self, state: OneCycleState) {
        self.step = state.step;
    }
}

impl LrScheduler for OneCycleLr {
    fn current_lr(&self) -> f32 {
        self.lr_at(self.step)
    }

    fn step(&mut self) -> f32 {
        self.step += 1;
        self.current_lr()
    }

    fn reset(&mut self) {
        self.step = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warms_up_then_anneals() {
        let mut sched = OneCycleLr::new(OneCycleConfig {
            max_lr: 1.0,
            total_steps: 11,
            pct_start: 0.5,
            div_factor: 10.0,
            final_div_factor: 10.0,
        })
        .unwrap();
        assert!((sched.current_lr() - 0.1).abs() < 1e-6);
        let mut lrs = Vec::new();
        for _ in 0..10 {
            lrs.push(sched.step());
        }
        assert!((lrs[4] - 1.0).abs() < 1e-6);
        assert!(lrs[..4].windows(2).all(|w| w[0] < w[1]));
        assert!(lrs[4..].windows(2).all(|w| w[0] > w[1]));
        assert!((lrs[9] - 0.01).abs() < 1e-6);
        assert!((sched.step() - 0.01).abs() < 1e-6);
        sched.reset();
        assert!((sched.current_lr() - 0.1).abs() < 1e-6);
    }

    #[test]
    fn rejects_empty_runs() {
        let cfg = OneCycleConfig {
            total_steps: 0,
            ..OneCycleConfig::default()
        };
        assert!(OneCycleLr::new(cfg).is_err());
    }
}
