// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Raw batches and the per-modality dictionary threaded through the model.
//!
//! Token streams `[B, T, C]` are stored as `(B * T, C)` tensors with the row
//! for example `b`, step `t` at `b * T + t`. Static modalities carry one label
//! per example as a `(B, 1)` tensor and borrow the time axis of the batch.

use crate::modality::Modality;
use crate::{NeuroError, NeuroResult, Tensor};
use std::collections::{BTreeMap, BTreeSet};

/// One modality's slice of a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct ModalityEntry {
    pub inputs: Tensor,
    pub targets: Tensor,
    /// Positional index per token, `B * T` long.
    pub timestamps: Vec<usize>,
    /// Input validity per token, `B * T` long. `false` marks padding.
    pub attn_mask: Vec<bool>,
    /// Session id per example.
    pub eids: Vec<String>,
    /// Region label per channel, per example. Needed by region masking.
    pub regions: Option<Vec<Vec<String>>>,
    modality: Modality,
    batch: usize,
    steps: usize,
}

pub type ModalityDict = BTreeMap<Modality, ModalityEntry>;

impl ModalityEntry {
    pub fn new(
        modality: Modality,
        inputs: Tensor,
        timestamps: Vec<usize>,
        attn_mask: Vec<bool>,
        eids: Vec<String>,
        steps: usize,
    ) -> NeuroResult<Self> {
        let batch = eids.len();
        if batch == 0 || steps == 0 {
            return Err(NeuroError::shape(
                format!("{modality} batch layout"),
                (1, 1),
                (batch, steps),
            ));
        }
        let expected_rows = if modality.is_static() { batch } else { batch * steps };
        if inputs.rows() != expected_rows {
            return Err(NeuroError::shape(
                format!("{modality} inputs"),
                (expected_rows, inputs.cols()),
                inputs.shape(),
            ));
        }
        if modality.is_static() && inputs.cols() != 1 {
            return Err(NeuroError::shape(
                format!("{modality} labels"),
                (batch, 1),
                inputs.shape(),
            ));
        }
        if timestamps.len() != batch * steps || attn_mask.len() != batch * steps {
            return Err(NeuroError::shape(
                format!("{modality} timestamps/attn_mask"),
                (batch * steps, batch * steps),
                (timestamps.len(), attn_mask.len()),
            ));
        }
        if let Some(classes) = modality.fixed_width().filter(|_| modality.is_static()) {
            if let Some(bad) = inputs
                .data()
                .iter()
                .find(|v| !v.is_finite() || **v < 0.0 || v.round() as usize >= classes)
            {
                return Err(NeuroError::InvalidConfig(format!(
                    "{modality} label {bad} outside 0..{classes}"
                )));
            }
        }
        Ok(Self {
            targets: inputs.clone(),
            inputs,
            timestamps,
            attn_mask,
            eids,
            regions: None,
            modality,
            batch,
            steps,
        })
    }

    pub fn with_regions(mut self, regions: Vec<Vec<String>>) -> NeuroResult<Self> {
        if regions.len() != self.batch {
            return Err(NeuroError::shape("regions", (self.batch, 0), (regions.len(), 0)));
        }
        self.regions = Some(regions);
        Ok(self)
    }

    pub fn modality(&self) -> Modality {
        self.modality
    }

    pub fn batch(&self) -> usize {
        self.batch
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Channel width of the padded stream.
    pub fn width(&self) -> usize {
        self.inputs.cols()
    }

    /// Class label of example `b` for static modalities.
    pub fn label(&self, b: usize) -> usize {
        self.targets.data()[b].round() as usize
    }

    pub fn valid(&self, b: usize, t: usize) -> bool {
        self.attn_mask[b * self.steps + t]
    }
}

/// Raw batch as produced by the data-loading collaborator.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub batch: usize,
    pub steps: usize,
    /// `(B * T, N)` spike counts, zero-padded beyond each session's width.
    pub spikes_data: Tensor,
    pub lfp: Option<Tensor>,
    pub wheel: Option<Tensor>,
    pub whisker: Option<Tensor>,
    pub choice: Option<Vec<usize>>,
    pub block: Option<Vec<usize>>,
    pub time_attn_mask: Vec<bool>,
    pub spikes_timestamps: Vec<usize>,
    pub eid: Vec<String>,
    pub regions: Option<Vec<Vec<String>>>,
}

impl Batch {
    /// Batch with all steps valid and timestamps `0..T`.
    pub fn new(spikes_data: Tensor, steps: usize, eid: Vec<String>) -> NeuroResult<Self> {
        let batch = eid.len();
        if steps == 0 || batch == 0 || spikes_data.rows() != batch * steps {
            return Err(NeuroError::shape(
                "spikes_data",
                (batch * steps, spikes_data.cols()),
                spikes_data.shape(),
            ));
        }
        Ok(Self {
            batch,
            steps,
            spikes_data,
            lfp: None,
            wheel: None,
            whisker: None,
            choice: None,
            block: None,
            time_attn_mask: vec![true; batch * steps],
            spikes_timestamps: (0..batch).flat_map(|_| 0..steps).collect(),
            eid,
            regions: None,
        })
    }

    /// Same session id for every example.
    pub fn single_session(
        spikes_data: Tensor,
        steps: usize,
        eid: impl Into<String>,
    ) -> NeuroResult<Self> {
        let eid = eid.into();
        let batch = spikes_data.rows() / steps.max(1);
        Self::new(spikes_data, steps, vec![eid; batch])
    }

    pub fn with_lfp(mut self, lfp: Tensor) -> Self {
        self.lfp = Some(lfp);
        self
    }

    pub fn with_wheel(mut self, wheel: Tensor) -> Self {
        self.wheel = Some(wheel);
        self
    }

    pub fn with_whisker(mut self, whisker: Tensor) -> Self {
        self.whisker = Some(whisker);
        self
    }

    pub fn with_choice(mut self, choice: Vec<usize>) -> Self {
        self.choice = Some(choice);
        self
    }

    pub fn with_block(mut self, block: Vec<usize>) -> Self {
        self.block = Some(block);
        self
    }

    pub fn with_time_attn_mask(mut self, mask: Vec<bool>) -> Self {
        self.time_attn_mask = mask;
        self
    }

    pub fn with_timestamps(mut self, timestamps: Vec<usize>) -> Self {
        self.spikes_timestamps = timestamps;
        self
    }

    pub fn with_regions(mut self, regions: Vec<Vec<String>>) -> Self {
        self.regions = Some(regions);
        self
    }

    fn labels(&self, labels: &[usize], modality: Modality) -> NeuroResult<Tensor> {
        if labels.len() != self.batch {
            return Err(NeuroError::shape(
                format!("{modality} labels"),
                (self.batch, 1),
                (labels.len(), 1),
            ));
        }
        Ok(Tensor::from_vec(
            self.batch,
            1,
            labels.iter().map(|&l| l as f32).collect(),
        )?)
    }

    /// Splits the batch into a modality dictionary holding `modalities`.
    pub fn into_modality_dict(self, modalities: &BTreeSet<Modality>) -> NeuroResult<ModalityDict> {
        let mut dict = ModalityDict::new();
        for &modality in modalities {
            let missing = || NeuroError::MissingModality(modality.to_string());
            let inputs = match modality {
                Modality::Spike => self.spikes_data.clone(),
                Modality::Lfp => self.lfp.clone().ok_or_else(missing)?,
                Modality::Wheel => self.wheel.clone().ok_or_else(missing)?,
                Modality::Whisker => self.whisker.clone().ok_or_else(missing)?,
                Modality::Choice => {
                    self.labels(self.choice.as_deref().ok_or_else(missing)?, modality)?
                }
                Modality::Block => {
                    self.labels(self.block.as_deref().ok_or_else(missing)?, modality)?
                }
            };
            let mut entry = ModalityEntry::new(
                modality,
                inputs,
                self.spikes_timestamps.clone(),
                self.time_attn_mask.clone(),
                self.eid.clone(),
                self.steps,
            )?;
            if modality == Modality::Spike {
                if let Some(regions) = self.regions.clone() {
                    entry = entry.with_regions(regions)?;
                }
            }
            dict.insert(modality, entry);
        }
        Ok(dict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spikes(b: usize, t: usize, n: usize) -> Tensor {
        Tensor::from_fn(b * t, n, |r, c| ((r + c) % 3) as f32).unwrap()
    }

    #[test]
    fn dictionary_carries_requested_modalities() {
        let batch = Batch::single_session(spikes(2, 5, 4), 5, "eid-a")
            .unwrap()
            .with_choice(vec![0, 1])
            .with_wheel(Tensor::zeros(10, 1).unwrap());
        let wanted = BTreeSet::from([Modality::Spike, Modality::Choice, Modality::Wheel]);
        let dict = batch.into_modality_dict(&wanted).unwrap();
        assert_eq!(dict.len(), 3);
        assert_eq!(dict[&Modality::Choice].inputs.shape(), (2, 1));
        assert_eq!(dict[&Modality::Choice].label(1), 1);
        assert_eq!(dict[&Modality::Spike].width(), 4);
        assert_eq!(dict[&Modality::Wheel].timestamps[7], 2);
    }

    #[test]
    fn missing_modalities_and_bad_labels_fail() {
        let batch = Batch::single_session(spikes(2, 3, 2), 3, "e").unwrap();
        let err = batch
            .clone()
            .into_modality_dict(&BTreeSet::from([Modality::Whisker]))
            .unwrap_err();
        assert!(matches!(err, NeuroError::MissingModality(_)));
        let err = batch
            .with_block(vec![0, 5])
            .into_modality_dict(&BTreeSet::from([Modality::Block]))
            .unwrap_err();
        assert!(matches!(err, NeuroError::InvalidConfig(_)));
    }

    #[test]
    fn mismatched_spike_rows_are_rejected() {
        let err = Batch::new(spikes(2, 3, 2), 4, vec!["a".into(), "b".into()]).unwrap_err();
        assert!(matches!(err, NeuroError::ShapeMismatch { .. }));
    }
}
