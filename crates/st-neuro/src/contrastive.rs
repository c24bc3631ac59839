// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Spike/behaviour alignment on top of the encoder output.
//!
//! Both families are pooled by flattening their time axis into the feature
//! axis, projected to a shared width and L2-normalised. Without momentum the
//! in-batch similarity matrix is scored CLIP-style; with momentum the live
//! embeddings are scored against the momentum embeddings of the same batch
//! followed by the queue contents.

use crate::modality::Modality;
use crate::sequence::Sequence;
use crate::{NeuroError, NeuroResult, Tensor};
use rand::Rng;
use serde::{Deserialize, Serialize};
use st_nn::layers::Linear;
use st_nn::loss::{diagonal_targets, top1_accuracy, InfoNce};
use st_nn::module::{Module, Parameter, Parameterized};
use st_tensor::PureResult;
use std::collections::HashMap;
use tracing::debug;

const NORM_EPS: f32 = 1e-12;

/// Contrastive diagnostics reported next to the loss.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ContrastiveDiagnostics {
    pub loss: f32,
    pub loss_spike: f32,
    pub loss_behavior: f32,
    pub s2b_acc: f32,
    pub b2s_acc: f32,
}

/// Flattens the listed segments of `(B * L, H)` into `(B, n * T * H)`.
pub fn pool_segments(
    sequence: &Sequence,
    full: &Tensor,
    modalities: &[Modality],
) -> NeuroResult<Tensor> {
    let hidden = full.cols();
    let mut widths = Vec::with_capacity(modalities.len());
    for &m in modalities {
        widths.push(sequence.segment(m)?.steps * hidden);
    }
    let mut pooled = Tensor::zeros(sequence.batch, widths.iter().sum())?;
    let mut col = 0;
    for (&m, width) in modalities.iter().zip(&widths) {
        let part = sequence.extract(full, m)?.reshape(sequence.batch, *width)?;
        pooled.write_block(0, col, &part)?;
        col += width;
    }
    Ok(pooled)
}

/// Inverse of [`pool_segments`] for gradients: adds into `full`.
pub fn unpool_segments(
    sequence: &Sequence,
    full: &mut Tensor,
    modalities: &[Modality],
    grad_pooled: &Tensor,
) -> NeuroResult<()> {
    let hidden = full.cols();
    let mut col = 0;
    for &m in modalities {
        let steps = sequence.segment(m)?.steps;
        let width = steps * hidden;
        let part = grad_pooled
            .slice_cols(col, col + width)?
            .reshape(sequence.batch * steps, hidden)?;
        sequence.scatter_add(full, m, &part)?;
        col += width;
    }
    Ok(())
}

/// Projected and normalised embeddings for one pass.
#[derive(Debug, Clone)]
pub struct Embeddings {
    pub spike: Tensor,
    pub spike_norms: Vec<f32>,
    pub behavior: Tensor,
    pub behavior_norms: Vec<f32>,
}

/// Loss, diagnostics and gradients with respect to the normalised embeddings.
#[derive(Debug, Clone)]
pub struct ContrastiveOutcome {
    pub diagnostics: ContrastiveDiagnostics,
    pub grad_spike: Tensor,
    pub grad_behavior: Tensor,
    pub grad_scale: f32,
}

/// How the learned temperature enters the similarity logits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogitScaling {
    /// `sim * exp(logit_scale)`, in-batch objective.
    Multiply,
    /// `sim / exp(logit_scale)`, momentum-bank objective.
    Divide,
}

/// Projection pair plus the learned temperature.
#[derive(Debug, Clone)]
pub struct ContrastiveHead {
    spike_projection: Linear,
    behavior_projection: Linear,
    logit_scale: Parameter,
    loss: InfoNce,
}

impl ContrastiveHead {
    pub fn with_rng<R: Rng + ?Sized>(
        name: &str,
        spike_features: usize,
        behavior_features: usize,
        dim: usize,
        rng: &mut R,
    ) -> NeuroResult<Self> {
        let init = (1.0f32 / 0.07).ln();
        Ok(Self {
            spike_projection: Linear::with_rng(
                format!("{name}.spike_projection"),
                spike_features,
                dim,
                rng,
            )?,
            behavior_projection: Linear::with_rng(
                format!("{name}.behavior_projection"),
                behavior_features,
                dim,
                rng,
            )?,
            logit_scale: Parameter::new(format!("{name}.logit_scale"), Tensor::filled(1, 1, init)?),
            loss: InfoNce::new(),
        })
    }

    pub fn dim(&self) -> usize {
        self.spike_projection.output_dim()
    }

    /// `exp(logit_scale)`.
    pub fn temperature(&self) -> f32 {
        self.logit_scale.value().data()[0].exp()
    }

    fn guard(&self, spike: &Tensor, behavior: &Tensor) -> NeuroResult<()> {
        let (s, b) = (self.spike_projection.input_dim(), self.behavior_projection.input_dim());
        if spike.cols() != s {
            return Err(NeuroError::shape(
                "pooled spike features",
                (spike.rows(), s),
                spike.shape(),
            ));
        }
        if behavior.cols() != b {
            return Err(NeuroError::shape(
                "pooled behavior features",
                (behavior.rows(), b),
                behavior.shape(),
            ));
        }
        Ok(())
    }

    pub fn embed(
        &self,
        spike_pooled: &Tensor,
        behavior_pooled: &Tensor,
    ) -> NeuroResult<Embeddings> {
        self.guard(spike_pooled, behavior_pooled)?;
        let (spike, spike_norms) = self
            .spike_projection
            .forward(spike_pooled)?
            .normalize_rows(NORM_EPS);
        let (behavior, behavior_norms) = self
            .behavior_projection
            .forward(behavior_pooled)?
            .normalize_rows(NORM_EPS);
        Ok(Embeddings {
            spike,
            spike_norms,
            behavior,
            behavior_norms,
        })
    }

    /// Scores `queries` against `keys` (both normalised) and returns the mean
    /// loss, accuracy, logits and `d loss / d logits`.
    fn score(
        &self,
        queries: &Tensor,
        keys: &Tensor,
        factor: f32,
    ) -> NeuroResult<(f32, f32, Tensor, Tensor)> {
        let logits = queries.matmul_transpose(keys)?.scale(factor)?;
        let targets = diagonal_targets(logits.rows(), logits.cols())?;
        let (loss, grad) = self.loss.loss_and_grad(&logits, &targets)?;
        let acc = top1_accuracy(&logits, &targets)?;
        Ok((loss, acc, logits, grad))
    }

    /// In-batch CLIP objective.
    pub fn clip(&self, live: &Embeddings) -> NeuroResult<ContrastiveOutcome> {
        self.aligned(live, &live.behavior, &live.spike, LogitScaling::Multiply)
    }

    /// Live embeddings against `[momentum ; queue]` for each family.
    pub fn moco(
        &self,
        live: &Embeddings,
        momentum: &Embeddings,
        queue: &MomentumQueue,
    ) -> NeuroResult<ContrastiveOutcome> {
        let behavior_bank = Tensor::cat_rows(&[&momentum.behavior, &queue.behavior])?;
        let spike_bank = Tensor::cat_rows(&[&momentum.spike, &queue.spike])?;
        self.aligned(live, &behavior_bank, &spike_bank, LogitScaling::Divide)
    }

    fn aligned(
        &self,
        live: &Embeddings,
        behavior_bank: &Tensor,
        spike_bank: &Tensor,
        scaling: LogitScaling,
    ) -> NeuroResult<ContrastiveOutcome> {
        let (factor, sign) = match scaling {
            LogitScaling::Multiply => (self.temperature(), 1.0),
            LogitScaling::Divide => (self.temperature().recip(), -1.0),
        };
        let (loss_spike, s2b_acc, logits_s, grad_s) =
            self.score(&live.spike, behavior_bank, factor)?;
        let (loss_behavior, b2s_acc, logits_b, grad_b) =
            self.score(&live.behavior, spike_bank, factor)?;
        // total = (loss_spike + loss_behavior) / 2
        let grad_s = grad_s.scale(0.5)?;
        let grad_b = grad_b.scale(0.5)?;
        let dot = |g: &Tensor, l: &Tensor| -> f32 {
            g.data().iter().zip(l.data()).map(|(a, b)| a * b).sum()
        };
        // d factor / d logit_scale = sign * factor
        let grad_scale = sign * (dot(&grad_s, &logits_s) + dot(&grad_b, &logits_b));

        let mut grad_spike = grad_s.matmul(behavior_bank)?.scale(factor)?;
        let mut grad_behavior = grad_b.matmul(spike_bank)?.scale(factor)?;
        // In-batch banks are the live embeddings themselves.
        if scaling == LogitScaling::Multiply {
            grad_behavior.add_scaled(&grad_s.transpose_matmul(&live.spike)?.scale(factor)?, 1.0)?;
            grad_spike.add_scaled(&grad_b.transpose_matmul(&live.behavior)?.scale(factor)?, 1.0)?;
        }
        let diagnostics = ContrastiveDiagnostics {
            loss: 0.5 * (loss_spike + loss_behavior),
            loss_spike,
            loss_behavior,
            s2b_acc,
            b2s_acc,
        };
        debug!(loss = diagnostics.loss, s2b_acc, b2s_acc, "contrastive objective");
        Ok(ContrastiveOutcome {
            diagnostics,
            grad_spike,
            grad_behavior,
            grad_scale,
        })
    }

    /// Pushes `weight * outcome` back through normalisation and the
    /// projections. Returns gradients for the pooled inputs.
    pub fn backward(
        &mut self,
        spike_pooled: &Tensor,
        behavior_pooled: &Tensor,
        live: &Embeddings,
        outcome: &ContrastiveOutcome,
        weight: f32,
    ) -> NeuroResult<(Tensor, Tensor)> {
        let grad_u_spike = normalize_backward(
            &live.spike,
            &live.spike_norms,
            &outcome.grad_spike.scale(weight)?,
        )?;
        let grad_u_behavior = normalize_backward(
            &live.behavior,
            &live.behavior_norms,
            &outcome.grad_behavior.scale(weight)?,
        )?;
        let grad_spike_pooled = self.spike_projection.backward(spike_pooled, &grad_u_spike)?;
        let grad_behavior_pooled = self
            .behavior_projection
            .backward(behavior_pooled, &grad_u_behavior)?;
        let grad_scale = Tensor::filled(1, 1, weight * outcome.grad_scale)?;
        self.logit_scale.accumulate_euclidean(&grad_scale)?;
        Ok((grad_spike_pooled, grad_behavior_pooled))
    }
}

/// `d (u / |u|) / d u` applied row-wise: `(g - z (z . g)) / |u|`.
fn normalize_backward(normalized: &Tensor, norms: &[f32], grad: &Tensor) -> PureResult<Tensor> {
    let cols = normalized.cols();
    let mut out = Vec::with_capacity(normalized.len());
    for ((z, g), norm) in normalized
        .data()
        .chunks(cols)
        .zip(grad.data().chunks(cols))
        .zip(norms)
    {
        let proj: f32 = z.iter().zip(g).map(|(a, b)| a * b).sum();
        out.extend(z.iter().zip(g).map(|(zi, gi)| (gi - zi * proj) / norm));
    }
    Tensor::from_vec(normalized.rows(), cols, out)
}

impl Parameterized for ContrastiveHead {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.spike_projection.visit_parameters(visitor)?;
        self.behavior_projection.visit_parameters(visitor)?;
        visitor(&self.logit_scale)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.spike_projection.visit_parameters_mut(visitor)?;
        self.behavior_projection.visit_parameters_mut(visitor)?;
        visitor(&mut self.logit_scale)
    }
}

/// Circular banks of normalised momentum embeddings with one shared pointer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MomentumQueue {
    capacity: usize,
    spike: Tensor,
    behavior: Tensor,
    ptr: usize,
}

impl MomentumQueue {
    /// Starts from random unit vectors.
    pub fn with_rng<R: Rng + ?Sized>(
        capacity: usize,
        dim: usize,
        rng: &mut R,
    ) -> NeuroResult<Self> {
        if capacity == 0 || dim == 0 {
            return Err(NeuroError::InvalidConfig(format!(
                "momentum queue needs a positive capacity and width, got {capacity}x{dim}"
            )));
        }
        let spike = Tensor::random_normal_with(capacity, dim, 0.0, 1.0, rng)?
            .normalize_rows(NORM_EPS)
            .0;
        let behavior = Tensor::random_normal_with(capacity, dim, 0.0, 1.0, rng)?
            .normalize_rows(NORM_EPS)
            .0;
        Ok(Self {
            capacity,
            spike,
            behavior,
            ptr: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn ptr(&self) -> usize {
        self.ptr
    }

    pub fn spike(&self) -> &Tensor {
        &self.spike
    }

    pub fn behavior(&self) -> &Tensor {
        &self.behavior
    }

    /// Overwrites the oldest `B` rows of both banks and advances the pointer.
    pub fn push(&mut self, spike: &Tensor, behavior: &Tensor) -> NeuroResult<()> {
        let batch = spike.rows();
        if batch == 0 || self.capacity % batch != 0 {
            return Err(NeuroError::QueueCapacity {
                capacity: self.capacity,
                batch,
            });
        }
        if behavior.shape() != spike.shape() || spike.cols() != self.spike.cols() {
            return Err(NeuroError::shape(
                "momentum queue entries",
                (batch, self.spike.cols()),
                behavior.shape(),
            ));
        }
        self.spike.write_block(self.ptr, 0, spike)?;
        self.behavior.write_block(self.ptr, 0, behavior)?;
        self.ptr = (self.ptr + batch) % self.capacity;
        debug!(ptr = self.ptr, batch, "momentum queue advanced");
        Ok(())
    }
}

/// Second parameter snapshot of the encoder side, kept in sync by EMA.
///
/// The snapshot is swapped into the live modules for the momentum forward
/// pass and swapped back afterwards, so both share one module graph.
#[derive(Debug, Clone, PartialEq)]
pub struct MomentumEncoder {
    momentum: f32,
    values: HashMap<String, Tensor>,
}

impl MomentumEncoder {
    pub fn new<M: Parameterized + ?Sized>(live: &M, momentum: f32) -> NeuroResult<Self> {
        if !(0.0..1.0).contains(&momentum) {
            return Err(NeuroError::InvalidConfig(format!(
                "momentum {momentum} outside [0, 1)"
            )));
        }
        Ok(Self {
            momentum,
            values: live.state_dict()?,
        })
    }

    pub fn momentum(&self) -> f32 {
        self.momentum
    }

    pub fn values(&self) -> &HashMap<String, Tensor> {
        &self.values
    }

    pub fn restore(&mut self, values: HashMap<String, Tensor>) {
        self.values = values;
    }

    /// Exchanges snapshot and live values. Calling it twice is a no-op.
    /// Parameters the snapshot does not know stay live.
    pub fn swap<M: Parameterized + ?Sized>(&mut self, live: &mut M) -> NeuroResult<()> {
        let values = &mut self.values;
        live.visit_parameters_mut(&mut |param| {
            if let Some(stored) = values.get_mut(param.name()) {
                if stored.shape() == param.value().shape() {
                    std::mem::swap(param.value_mut(), stored);
                }
            }
            Ok(())
        })?;
        Ok(())
    }

    /// Copies parameters the snapshot has never seen, leaving known ones alone.
    pub fn adopt<M: Parameterized + ?Sized>(&mut self, live: &M) -> NeuroResult<()> {
        let values = &mut self.values;
        live.visit_parameters(&mut |param| {
            values
                .entry(param.name().to_string())
                .or_insert_with(|| param.value().clone());
            Ok(())
        })?;
        Ok(())
    }

    /// `theta_m <- m * theta_m + (1 - m) * theta`. Parameters first seen here
    /// (newly registered sessions) are copied verbatim.
    pub fn update<M: Parameterized + ?Sized>(&mut self, live: &M) -> NeuroResult<()> {
        let momentum = self.momentum;
        let values = &mut self.values;
        live.visit_parameters(&mut |param| {
            match values.get_mut(param.name()) {
                Some(stored) if stored.shape() == param.value().shape() => {
                    for (m, v) in stored.data_mut().iter_mut().zip(param.value().data()) {
                        *m = momentum * *m + (1.0 - momentum) * v;
                    }
                }
                _ => {
                    values.insert(param.name().to_string(), param.value().clone());
                }
            }
            Ok(())
        })?;
        Ok(())
    }
}
