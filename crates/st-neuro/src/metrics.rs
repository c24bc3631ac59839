// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Evaluation diagnostics. None of these feed the optimiser.

use crate::{NeuroError, NeuroResult, Tensor};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::f64::consts::LN_2;

/// Summary emitted by an evaluation pass over one session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub bits_per_spike: Option<f32>,
    pub r2: BTreeMap<String, f32>,
    pub balanced_accuracy: BTreeMap<String, f32>,
}

fn same_shape(label: &str, a: &Tensor, b: &Tensor) -> NeuroResult<()> {
    if a.shape() != b.shape() {
        return Err(NeuroError::shape(label, b.shape(), a.shape()));
    }
    Ok(())
}

/// Poisson log-likelihood gain over a per-neuron mean-rate model, in bits per
/// observed spike. `log_rates` and `spikes` are `(B * T, N)`; `valid` selects
/// rows (all rows when `None`). Returns `0.0` when no spike was observed.
pub fn bits_per_spike(
    log_rates: &Tensor,
    spikes: &Tensor,
    valid: Option<&[bool]>,
) -> NeuroResult<f32> {
    same_shape("bits-per-spike rates", log_rates, spikes)?;
    let (rows, cols) = spikes.shape();
    let keep = |r: usize| valid.map_or(true, |v| v.get(r).copied().unwrap_or(false));

    let mut totals = vec![0.0f64; cols];
    let mut kept = 0usize;
    for r in (0..rows).filter(|&r| keep(r)) {
        kept += 1;
        for (total, y) in totals.iter_mut().zip(spikes.row(r)?) {
            *total += *y as f64;
        }
    }
    let n_spikes: f64 = totals.iter().sum();
    if kept == 0 || n_spikes <= 0.0 {
        return Ok(0.0);
    }
    let null_rates: Vec<f64> = totals.iter().map(|t| t / kept as f64).collect();

    // log(y!) cancels between the two likelihoods.
    let mut nll_model = 0.0f64;
    let mut nll_null = 0.0f64;
    for r in (0..rows).filter(|&r| keep(r)) {
        for ((log_rate, y), null) in log_rates.row(r)?.iter().zip(spikes.row(r)?).zip(&null_rates) {
            let (log_rate, y) = (*log_rate as f64, *y as f64);
            nll_model += log_rate.exp() - y * log_rate;
            if *null > 0.0 {
                nll_null += null - y * null.ln();
            }
        }
    }
    Ok(((nll_null - nll_model) / n_spikes / LN_2) as f32)
}

/// Coefficient of determination averaged uniformly over columns. Constant
/// target columns are skipped.
pub fn r2_score(pred: &Tensor, target: &Tensor) -> NeuroResult<f32> {
    same_shape("r2 predictions", pred, target)?;
    let (rows, cols) = target.shape();
    if rows == 0 {
        return Ok(0.0);
    }
    let means = target.sum_axis0();
    let mut scores = Vec::with_capacity(cols);
    for c in 0..cols {
        let mean = means[c] / rows as f32;
        let (mut ss_res, mut ss_tot) = (0.0f32, 0.0f32);
        for r in 0..rows {
            let y = target.data()[r * cols + c];
            let p = pred.data()[r * cols + c];
            ss_res += (y - p) * (y - p);
            ss_tot += (y - mean) * (y - mean);
        }
        if ss_tot > 0.0 {
            scores.push(1.0 - ss_res / ss_tot);
        }
    }
    if scores.is_empty() {
        return Ok(0.0);
    }
    Ok(scores.iter().sum::<f32>() / scores.len() as f32)
}

/// Mean per-class recall over the classes present in `truth`.
pub fn balanced_accuracy(pred: &[usize], truth: &[usize]) -> NeuroResult<f32> {
    if pred.len() != truth.len() {
        return Err(NeuroError::shape("balanced accuracy", (truth.len(), 1), (pred.len(), 1)));
    }
    let mut per_class: BTreeMap<usize, (usize, usize)> = BTreeMap::new();
    for (p, t) in pred.iter().zip(truth) {
        let slot = per_class.entry(*t).or_default();
        slot.1 += 1;
        if p == t {
            slot.0 += 1;
        }
    }
    if per_class.is_empty() {
        return Ok(0.0);
    }
    let recall: f32 = per_class
        .values()
        .map(|(hit, total)| *hit as f32 / *total as f32)
        .sum();
    Ok(recall / per_class.len() as f32)
}

/// Fraction of rows whose target index is among the `k` largest scores.
pub fn top_k_accuracy(scores: &Tensor, targets: &[usize], k: usize) -> NeuroResult<f32> {
    if scores.rows() != targets.len() {
        return Err(NeuroError::shape("top-k targets", (scores.rows(), 1), (targets.len(), 1)));
    }
    if targets.is_empty() {
        return Ok(0.0);
    }
    let k = k.clamp(1, scores.cols().max(1));
    let mut hits = 0usize;
    for (r, &target) in targets.iter().enumerate() {
        let row = scores.row(r)?;
        let Some(&score) = row.get(target) else { continue };
        let better = row.iter().filter(|v| **v > score).count();
        if better < k {
            hits += 1;
        }
    }
    Ok(hits as f32 / targets.len() as f32)
}
