// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Masked per-modality losses.
//!
//! Only entries that were hidden, valid and inside the example's own channel
//! width count. Gradients are returned unreduced (with respect to the masked
//! sum) so the caller can apply whichever normalisation the loss config asks for.

use crate::batch::ModalityEntry;
use crate::masker::MaskOutcome;
use crate::modality::{LossKind, Modality};
use crate::stitch::StreamLayout;
use crate::{NeuroError, NeuroResult, Tensor};
use serde::{Deserialize, Serialize};
use st_nn::{MeanSquaredError, PoissonNll, SoftmaxCrossEntropy};

/// Raw predictions of one modality: `(B * T, W)` token outputs, or `(B, K)`
/// logits for per-trial labels.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub values: Tensor,
    pub batch: usize,
    pub steps: usize,
}

impl Prediction {
    /// Logical `[B, T, W]` shape; labels report `[B, 1, K]`.
    pub fn dims(&self) -> (usize, usize, usize) {
        let cols = self.values.cols();
        if self.values.rows() == self.batch {
            (self.batch, 1, cols)
        } else {
            (self.batch, self.steps, cols)
        }
    }

    /// Values for example `b`, step `t`.
    pub fn at(&self, b: usize, t: usize) -> NeuroResult<&[f32]> {
        let (_, steps, _) = self.dims();
        Ok(self.values.row(b * steps + t.min(steps - 1))?)
    }
}

/// How per-modality masked sums become the modal loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossReduction {
    /// `sum_m (S_m / n_m)`: every modality normalised by its own count.
    #[default]
    Sum,
    /// `sum_m S_m / sum_m n_m`: one pooled mean across modalities.
    #[serde(alias = "mean")]
    PooledMean,
}

/// Loss of one modality for one batch.
#[derive(Debug, Clone)]
pub struct HeadLoss {
    pub modality: Modality,
    /// Sum of the per-entry losses over eligible entries.
    pub total: f32,
    /// Number of eligible entries.
    pub count: usize,
    /// `d total / d preds`, zero outside eligible entries.
    pub grad: Tensor,
    /// Predicted class per example for label modalities.
    pub argmax: Option<Vec<usize>>,
}

impl HeadLoss {
    /// `total / count`, or exactly `0.0` when nothing was eligible.
    pub fn mean(&self) -> f32 {
        if self.count == 0 {
            0.0
        } else {
            self.total / self.count as f32
        }
    }
}

/// Scores `preds` against `entry.targets` under the hide mask in `outcome`.
pub fn modality_loss(
    entry: &ModalityEntry,
    outcome: &MaskOutcome,
    layout: &StreamLayout,
    preds: &Tensor,
) -> NeuroResult<HeadLoss> {
    let modality = entry.modality();
    match modality.loss_kind() {
        LossKind::CrossEntropy => label_loss(entry, outcome, preds),
        kind => token_loss(entry, outcome, layout, preds, kind),
    }
}

fn token_loss(
    entry: &ModalityEntry,
    outcome: &MaskOutcome,
    layout: &StreamLayout,
    preds: &Tensor,
    kind: LossKind,
) -> NeuroResult<HeadLoss> {
    let modality = entry.modality();
    if preds.shape() != entry.targets.shape() {
        return Err(NeuroError::shape(
            format!("{modality} predictions"),
            entry.targets.shape(),
            preds.shape(),
        ));
    }
    let (values, grads) = match kind {
        LossKind::Poisson => {
            let loss = PoissonNll::new();
            (
                loss.elementwise(preds, &entry.targets)?,
                loss.elementwise_grad(preds, &entry.targets)?,
            )
        }
        _ => {
            let loss = MeanSquaredError::new();
            (
                loss.elementwise(preds, &entry.targets)?,
                loss.elementwise_grad(preds, &entry.targets)?,
            )
        }
    };
    let (steps, width) = (entry.steps(), preds.cols());
    let mut grad = Tensor::zeros(preds.rows(), width)?;
    let mut total = 0.0f32;
    let mut count = 0usize;
    for b in 0..entry.batch() {
        let channels = layout.widths[b].min(width);
        for t in (0..steps).filter(|&t| entry.valid(b, t)) {
            let row = b * steps + t;
            for c in 0..channels {
                let idx = row * width + c;
                if outcome.element_hide[idx] {
                    total += values.data()[idx];
                    grad.data_mut()[idx] = grads.data()[idx];
                    count += 1;
                }
            }
        }
    }
    Ok(HeadLoss {
        modality,
        total,
        count,
        grad,
        argmax: None,
    })
}

fn label_loss(
    entry: &ModalityEntry,
    outcome: &MaskOutcome,
    logits: &Tensor,
) -> NeuroResult<HeadLoss> {
    let modality = entry.modality();
    let classes = modality.fixed_width().unwrap_or(logits.cols());
    let expected = (entry.batch(), classes);
    if logits.shape() != expected {
        return Err(NeuroError::shape(format!("{modality} logits"), expected, logits.shape()));
    }
    let labels: Vec<usize> = (0..entry.batch()).map(|b| entry.label(b)).collect();
    let ce = SoftmaxCrossEntropy::new();
    let per_row = ce.per_row(logits, &labels)?;
    let rows_grad = ce.grad_rows(logits, &labels)?;
    let mut grad = Tensor::zeros(logits.rows(), classes)?;
    let mut total = 0.0f32;
    let mut count = 0usize;
    for (b, loss) in per_row.iter().enumerate() {
        if outcome.element_hide[b] {
            total += loss;
            count += 1;
            grad.row_mut(b)?.copy_from_slice(rows_grad.row(b)?);
        }
    }
    Ok(HeadLoss {
        modality,
        total,
        count,
        grad,
        argmax: Some(logits.argmax_rows()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::masker::Masker;
    use crate::mode::HidePolicy;
    use crate::masker::MaskingScheme;

    fn spike_entry(batch: usize, steps: usize, width: usize) -> ModalityEntry {
        let inputs = Tensor::from_fn(batch * steps, width, |r, c| ((r + c) % 3) as f32).unwrap();
        ModalityEntry::new(
            Modality::Spike,
            inputs,
            (0..batch).flat_map(|_| 0..steps).collect(),
            vec![true; batch * steps],
            vec!["s".into(); batch],
            steps,
        )
        .unwrap()
    }

    fn layout(widths: Vec<usize>, steps: usize, labels: bool) -> StreamLayout {
        StreamLayout {
            batch: widths.len(),
            steps,
            sessions: vec![0; widths.len()],
            eids: vec!["s".into(); widths.len()],
            widths,
            labels,
        }
    }

    #[test]
    fn nothing_hidden_means_exact_zero() {
        let entry = spike_entry(2, 4, 3);
        let outcome = Masker::new(Some(1))
            .mask(&entry, &MaskingScheme::None, HidePolicy::Sampled)
            .unwrap();
        let preds = Tensor::filled(8, 3, 0.3).unwrap();
        let head = modality_loss(&entry, &outcome, &layout(vec![3, 3], 4, false), &preds).unwrap();
        assert_eq!(head.count, 0);
        assert_eq!(head.mean(), 0.0);
        assert!(head.grad.data().iter().all(|g| *g == 0.0));
    }

    #[test]
    fn padded_channels_are_not_scored() {
        let entry = spike_entry(2, 2, 3);
        let outcome = Masker::new(Some(1))
            .mask(&entry, &MaskingScheme::None, HidePolicy::All)
            .unwrap();
        let preds = Tensor::zeros(4, 3).unwrap();
        let head = modality_loss(&entry, &outcome, &layout(vec![3, 1], 2, false), &preds).unwrap();
        assert_eq!(head.count, 2 * 3 + 2);
        for t in 0..2 {
            let row = head.grad.row(2 + t).unwrap();
            assert_eq!(&row[1..], &[0.0, 0.0]);
        }
        // exp(0) - y * 0 = 1 for every scored entry
        assert!((head.mean() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn mismatched_predictions_fail_loudly() {
        let entry = spike_entry(1, 2, 3);
        let outcome = Masker::new(None)
            .mask(&entry, &MaskingScheme::None, HidePolicy::All)
            .unwrap();
        let logits = Tensor::zeros(2, 2).unwrap();
        let err = modality_loss(&entry, &outcome, &layout(vec![3], 2, false), &logits).unwrap_err();
        assert!(matches!(err, NeuroError::ShapeMismatch { .. }));
    }

    #[test]
    fn choice_cross_entropy_matches_negative_log_probability() {
        let entry = ModalityEntry::new(
            Modality::Choice,
            Tensor::zeros(3, 1).unwrap(),
            vec![0; 3],
            vec![true; 3],
            vec!["s".into(); 3],
            1,
        )
        .unwrap();
        let outcome = Masker::new(None)
            .mask(&entry, &MaskingScheme::None, HidePolicy::All)
            .unwrap();
        let logits = Tensor::from_vec(3, 2, vec![2.0, 0.0, 1.0, 0.5, 3.0, -1.0]).unwrap();
        let head = modality_loss(&entry, &outcome, &layout(vec![2; 3], 1, true), &logits).unwrap();
        let expected: f32 = logits
            .data()
            .chunks(2)
            .map(|row| {
                let p0 = row[0].exp() / (row[0].exp() + row[1].exp());
                -p0.ln()
            })
            .sum::<f32>()
            / 3.0;
        assert!((head.mean() - expected).abs() < 1e-5);
        assert_eq!(head.argmax.unwrap(), vec![0, 0, 0]);
    }
}
