// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Token hiding for self-supervised targets.
//!
//! The masker never mutates the caller's tensors: every call returns a fresh
//! copy with hidden elements zeroed plus the two boolean masks the model needs.
//! `token_hide` marks whole tokens zeroed before the encoder; `element_hide`
//! marks the entries that count towards the loss. Both are subsets of the
//! input-validity mask.

use crate::batch::ModalityEntry;
use crate::mode::HidePolicy;
use crate::{NeuroError, NeuroResult, Tensor};
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::Rng;
use serde::{Deserialize, Serialize};
use spiral_config::determinism;
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "SchemeRecord", into = "SchemeRecord")]
pub enum MaskingScheme {
    /// Hide `ratio` of each example's valid steps, all channels at once.
    Temporal { ratio: f32 },
    /// Hide whole brain regions with probability `ratio`.
    Region { ratio: f32 },
    /// Hide the trailing `ratio` of valid steps and force causal attention.
    Causal { ratio: f32 },
    None,
}

/// Flat on-disk form: `scheme = "temporal"`, `ratio = 0.3`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SchemeRecord {
    scheme: String,
    #[serde(default)]
    ratio: f32,
}

impl TryFrom<SchemeRecord> for MaskingScheme {
    type Error = NeuroError;

    fn try_from(record: SchemeRecord) -> NeuroResult<Self> {
        MaskingScheme::parse(&record.scheme, record.ratio)
    }
}

impl From<MaskingScheme> for SchemeRecord {
    fn from(scheme: MaskingScheme) -> Self {
        Self {
            scheme: scheme.name().to_string(),
            ratio: scheme.ratio(),
        }
    }
}

impl MaskingScheme {
    pub fn parse(name: &str, ratio: f32) -> NeuroResult<Self> {
        let scheme = match name.trim().to_ascii_lowercase().as_str() {
            "temporal" => MaskingScheme::Temporal { ratio },
            "region" | "neuron" => MaskingScheme::Region { ratio },
            "causal" => MaskingScheme::Causal { ratio },
            "none" | "identity" => MaskingScheme::None,
            other => return Err(NeuroError::UnsupportedMaskingScheme(other.to_string())),
        };
        scheme.validate()?;
        Ok(scheme)
    }

    pub fn name(&self) -> &'static str {
        match self {
            MaskingScheme::Temporal { .. } => "temporal",
            MaskingScheme::Region { .. } => "region",
            MaskingScheme::Causal { .. } => "causal",
            MaskingScheme::None => "none",
        }
    }

    pub fn ratio(&self) -> f32 {
        match *self {
            MaskingScheme::Temporal { ratio }
            | MaskingScheme::Region { ratio }
            | MaskingScheme::Causal { ratio } => ratio,
            MaskingScheme::None => 0.0,
        }
    }

    pub fn is_causal(&self) -> bool {
        matches!(self, MaskingScheme::Causal { .. })
    }

    pub fn validate(&self) -> NeuroResult<()> {
        let ratio = self.ratio();
        if !(0.0..=1.0).contains(&ratio) {
            return Err(NeuroError::InvalidConfig(format!(
                "mask ratio {ratio} outside [0, 1]"
            )));
        }
        Ok(())
    }
}

/// Masked copy of one modality's inputs.
#[derive(Debug, Clone, PartialEq)]
pub struct MaskOutcome {
    pub masked: Tensor,
    /// `B * T` flags for tokens zeroed before the encoder.
    pub token_hide: Vec<bool>,
    /// One flag per element of `masked`.
    pub element_hide: Vec<bool>,
}

impl MaskOutcome {
    fn visible(entry: &ModalityEntry) -> Self {
        Self {
            masked: entry.inputs.clone(),
            token_hide: vec![false; entry.attn_mask.len()],
            element_hide: vec![false; entry.inputs.len()],
        }
    }

    pub fn hidden_tokens(&self) -> usize {
        self.token_hide.iter().filter(|h| **h).count()
    }

    /// Hides every valid token of the modality.
    pub fn withhold(&mut self, entry: &ModalityEntry) {
        let all = Masker::tokens_to_outcome(entry, entry.attn_mask.clone());
        *self = all;
    }
}

/// Stateless apart from its random stream; the scheme is chosen per call.
#[derive(Debug)]
pub struct Masker {
    rng: StdRng,
}

impl Masker {
    pub fn new(seed: Option<u64>) -> Self {
        Self::with_rng(determinism::rng_from_optional(seed, "st-neuro/masker"))
    }

    pub fn with_rng(rng: StdRng) -> Self {
        Self { rng }
    }

    /// Resolves a training-mode policy into a mask for one modality.
    pub fn mask(
        &mut self,
        entry: &ModalityEntry,
        scheme: &MaskingScheme,
        policy: HidePolicy,
    ) -> NeuroResult<MaskOutcome> {
        let outcome = match policy {
            HidePolicy::Nothing => MaskOutcome::visible(entry),
            HidePolicy::All => Self::tokens_to_outcome(entry, entry.attn_mask.clone()),
            HidePolicy::Sampled => self.apply(entry, scheme)?,
        };
        debug!(
            modality = %entry.modality(),
            ?policy,
            hidden = outcome.hidden_tokens(),
            "masked modality"
        );
        Ok(outcome)
    }

    /// Applies `scheme` to a modality.
    pub fn apply(
        &mut self,
        entry: &ModalityEntry,
        scheme: &MaskingScheme,
    ) -> NeuroResult<MaskOutcome> {
        scheme.validate()?;
        let modality = entry.modality();
        let (batch, steps) = (entry.batch(), entry.steps());
        match *scheme {
            MaskingScheme::None => Ok(MaskOutcome::visible(entry)),
            _ if modality.is_static() => {
                let ratio = scheme.ratio();
                let mut hide = vec![false; batch * steps];
                for b in 0..batch {
                    if self.rng.gen::<f32>() < ratio {
                        for t in 0..steps {
                            hide[b * steps + t] = entry.valid(b, t);
                        }
                    }
                }
                Ok(Self::tokens_to_outcome(entry, hide))
            }
            MaskingScheme::Temporal { ratio } => {
                let hide = self.temporal(entry, ratio);
                Ok(Self::tokens_to_outcome(entry, hide))
            }
            MaskingScheme::Causal { ratio } => {
                let mut hide = vec![false; batch * steps];
                for b in 0..batch {
                    let valid: Vec<usize> = (0..steps).filter(|&t| entry.valid(b, t)).collect();
                    let count = (ratio * valid.len() as f32).round() as usize;
                    for &t in &valid[valid.len() - count..] {
                        hide[b * steps + t] = true;
                    }
                }
                Ok(Self::tokens_to_outcome(entry, hide))
            }
            MaskingScheme::Region { ratio } => {
                if modality.is_behavior() {
                    let hide = self.temporal(entry, ratio);
                    return Ok(Self::tokens_to_outcome(entry, hide));
                }
                let regions = entry
                    .regions
                    .as_ref()
                    .ok_or_else(|| NeuroError::MissingRegions(modality.to_string()))?;
                self.region(entry, regions, ratio)
            }
        }
    }

    fn temporal(&mut self, entry: &ModalityEntry, ratio: f32) -> Vec<bool> {
        let (batch, steps) = (entry.batch(), entry.steps());
        let mut hide = vec![false; batch * steps];
        for b in 0..batch {
            let valid: Vec<usize> = (0..steps).filter(|&t| entry.valid(b, t)).collect();
            let count = (ratio * valid.len() as f32).round() as usize;
            for pick in sample(&mut self.rng, valid.len(), count.min(valid.len())) {
                hide[b * steps + valid[pick]] = true;
            }
        }
        hide
    }

    fn region(
        &mut self,
        entry: &ModalityEntry,
        regions: &[Vec<String>],
        ratio: f32,
    ) -> NeuroResult<MaskOutcome> {
        let (batch, steps, width) = (entry.batch(), entry.steps(), entry.width());
        let mut masked = entry.inputs.clone();
        let mut element_hide = vec![false; masked.len()];
        for (b, labels) in regions.iter().enumerate().take(batch) {
            if labels.len() > width {
                return Err(NeuroError::shape(
                    "region labels",
                    (batch, width),
                    (batch, labels.len()),
                ));
            }
            let mut verdicts: BTreeMap<&str, bool> = BTreeMap::new();
            for label in labels {
                verdicts.entry(label.as_str()).or_insert(false);
            }
            for verdict in verdicts.values_mut() {
                *verdict = self.rng.gen::<f32>() < ratio;
            }
            for t in (0..steps).filter(|&t| entry.valid(b, t)) {
                let row = b * steps + t;
                for (c, label) in labels.iter().enumerate() {
                    if verdicts.get(label.as_str()).copied().unwrap_or(false) {
                        element_hide[row * width + c] = true;
                        masked.data_mut()[row * width + c] = 0.0;
                    }
                }
            }
        }
        Ok(MaskOutcome {
            masked,
            token_hide: vec![false; batch * steps],
            element_hide,
        })
    }

    /// Zeroes hidden tokens and derives the element mask.
    fn tokens_to_outcome(entry: &ModalityEntry, token_hide: Vec<bool>) -> MaskOutcome {
        let mut masked = entry.inputs.clone();
        let width = masked.cols();
        let mut element_hide = vec![false; masked.len()];
        if entry.modality().is_static() {
            // One label row per example; hidden when any of its tokens is.
            let steps = entry.steps();
            for b in 0..entry.batch() {
                if token_hide[b * steps..(b + 1) * steps].iter().any(|h| *h) {
                    element_hide[b] = true;
                    masked.data_mut()[b] = 0.0;
                }
            }
        } else {
            for (row, hidden) in token_hide.iter().enumerate() {
                if *hidden {
                    element_hide[row * width..(row + 1) * width].fill(true);
                    masked.data_mut()[row * width..(row + 1) * width].fill(0.0);
                }
            }
        }
        MaskOutcome {
            masked,
            token_hide,
            element_hide,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modality::Modality;

    fn entry(batch: usize, steps: usize, width: usize) -> ModalityEntry {
        let inputs =
            Tensor::from_fn(batch * steps, width, |r, c| (r * width + c + 1) as f32).unwrap();
        let mut valid = vec![true; batch * steps];
        valid[steps - 1] = false;
        ModalityEntry::new(
            Modality::Spike,
            inputs,
            (0..batch).flat_map(|_| 0..steps).collect(),
            valid,
            vec!["e".to_string(); batch],
            steps,
        )
        .unwrap()
    }

    #[test]
    fn none_scheme_copies_without_hiding() {
        let e = entry(2, 4, 3);
        let mut masker = Masker::new(Some(1));
        let first = masker.apply(&e, &MaskingScheme::None).unwrap();
        let second = masker.apply(&e, &MaskingScheme::None).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.masked, e.inputs);
        assert_eq!(first.hidden_tokens(), 0);
    }

    #[test]
    fn temporal_hides_whole_steps_inside_valid_region() {
        let e = entry(3, 10, 2);
        let mut masker = Masker::new(Some(2));
        let out = masker
            .apply(&e, &MaskingScheme::Temporal { ratio: 0.5 })
            .unwrap();
        for (row, hidden) in out.token_hide.iter().enumerate() {
            if *hidden {
                assert!(e.attn_mask[row]);
                assert_eq!(out.masked.row(row).unwrap(), &[0.0, 0.0]);
            }
        }
        assert_eq!(out.token_hide[..10].iter().filter(|h| **h).count(), 5);
        assert_eq!(out.token_hide[10..20].iter().filter(|h| **h).count(), 5);
    }

    #[test]
    fn causal_hides_the_tail() {
        let e = entry(1, 6, 1);
        let mut masker = Masker::new(None);
        let out = masker
            .apply(&e, &MaskingScheme::Causal { ratio: 0.4 })
            .unwrap();
        assert_eq!(out.token_hide, vec![false, false, false, true, true, false]);
    }

    #[test]
    fn region_requires_labels_and_hides_channels() {
        let e = entry(1, 3, 4);
        let mut masker = Masker::new(Some(3));
        let err = masker
            .apply(&e, &MaskingScheme::Region { ratio: 1.0 })
            .unwrap_err();
        assert!(matches!(err, NeuroError::MissingRegions(_)));

        let labelled = e
            .with_regions(vec![vec!["ca1".into(), "ca1".into(), "po".into(), "po".into()]])
            .unwrap();
        let out = masker
            .apply(&labelled, &MaskingScheme::Region { ratio: 1.0 })
            .unwrap();
        assert_eq!(out.hidden_tokens(), 0);
        assert!(out.element_hide[..8].iter().all(|h| *h));
        assert!(out.element_hide[8..].iter().all(|h| !*h));
    }

    #[test]
    fn forced_policies_respect_validity() {
        let e = entry(1, 4, 2);
        let mut masker = Masker::new(Some(4));
        let scheme = MaskingScheme::Temporal { ratio: 0.0 };
        let all = masker.mask(&e, &scheme, HidePolicy::All).unwrap();
        assert_eq!(all.token_hide, vec![true, true, true, false]);
        let none = masker.mask(&e, &scheme, HidePolicy::Nothing).unwrap();
        assert_eq!(none.hidden_tokens(), 0);
    }

    #[test]
    fn unknown_schemes_and_ratios_fail() {
        assert!(matches!(
            MaskingScheme::parse("spiral", 0.1),
            Err(NeuroError::UnsupportedMaskingScheme(_))
        ));
        assert!(MaskingScheme::parse("temporal", 1.5).is_err());
    }

    #[test]
    fn schemes_survive_bincode_and_toml() {
        for scheme in [
            MaskingScheme::Temporal { ratio: 0.3 },
            MaskingScheme::Region { ratio: 0.25 },
            MaskingScheme::Causal { ratio: 0.2 },
            MaskingScheme::None,
        ] {
            let bytes = bincode::serialize(&scheme).unwrap();
            assert_eq!(bincode::deserialize::<MaskingScheme>(&bytes).unwrap(), scheme);
            let text = toml::to_string(&scheme).unwrap();
            assert_eq!(toml::from_str::<MaskingScheme>(&text).unwrap(), scheme);
        }
        let flat: MaskingScheme = toml::from_str("scheme = \"neuron\"\nratio = 0.5").unwrap();
        assert_eq!(flat, MaskingScheme::Region { ratio: 0.5 });
        assert!(toml::from_str::<MaskingScheme>("scheme = \"temporal\"\nratio = 2.0").is_err());
    }
}
