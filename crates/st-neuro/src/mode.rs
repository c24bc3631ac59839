// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Run-level selectors: which modalities flow in and out, and which tokens a
//! training objective hides.

use crate::modality::Modality;
use crate::{NeuroError, NeuroResult};
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use spiral_config::determinism;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Architecture-level role of the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelMode {
    /// Everything in, everything out.
    Mm,
    /// Everything in, neural activity out.
    Encoding,
    /// Everything in, behaviour out.
    Decoding,
}

impl FromStr for ModelMode {
    type Err = NeuroError;

    fn from_str(s: &str) -> NeuroResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mm" | "multimodal" => Ok(ModelMode::Mm),
            "encoding" => Ok(ModelMode::Encoding),
            "decoding" => Ok(ModelMode::Decoding),
            other => Err(NeuroError::UnsupportedModelMode(other.to_string())),
        }
    }
}

/// Input and output modality sets for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModalFilter {
    pub inputs: BTreeSet<Modality>,
    pub outputs: BTreeSet<Modality>,
}

impl ModalFilter {
    pub fn new(
        inputs: impl IntoIterator<Item = Modality>,
        outputs: impl IntoIterator<Item = Modality>,
    ) -> Self {
        Self {
            inputs: inputs.into_iter().collect(),
            outputs: outputs.into_iter().collect(),
        }
    }

    /// Resolves a model mode over the modalities a run has available.
    pub fn for_mode(mode: ModelMode, available: &[Modality]) -> NeuroResult<Self> {
        let inputs: BTreeSet<Modality> = available.iter().copied().collect();
        let outputs: BTreeSet<Modality> = match mode {
            ModelMode::Mm => inputs.clone(),
            ModelMode::Encoding => inputs.iter().copied().filter(|m| m.is_neural()).collect(),
            ModelMode::Decoding => inputs.iter().copied().filter(|m| m.is_behavior()).collect(),
        };
        if inputs.is_empty() || outputs.is_empty() {
            return Err(NeuroError::InvalidConfig(format!(
                "model mode {mode:?} leaves no input or output modality among {available:?}"
            )));
        }
        Ok(Self { inputs, outputs })
    }

    pub fn modalities(&self) -> BTreeSet<Modality> {
        self.inputs.union(&self.outputs).copied().collect()
    }
}

/// Objective selected by the trainer for one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrainingMode {
    #[serde(rename = "encoding")]
    Encoding,
    #[serde(rename = "decoding")]
    Decoding,
    #[serde(rename = "self-spike")]
    SelfSpike,
    #[serde(rename = "self-behavior")]
    SelfBehavior,
    #[serde(rename = "random_token")]
    RandomToken,
    #[serde(rename = "mixed")]
    Mixed,
}

/// Where a modality's hide mask comes from under a training mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HidePolicy {
    /// Sampled by the masker.
    Sampled,
    /// Every valid token hidden.
    All,
    /// Nothing hidden.
    Nothing,
}

impl TrainingMode {
    pub const ALL: [TrainingMode; 6] = [
        TrainingMode::Encoding,
        TrainingMode::Decoding,
        TrainingMode::SelfSpike,
        TrainingMode::SelfBehavior,
        TrainingMode::RandomToken,
        TrainingMode::Mixed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TrainingMode::Encoding => "encoding",
            TrainingMode::Decoding => "decoding",
            TrainingMode::SelfSpike => "self-spike",
            TrainingMode::SelfBehavior => "self-behavior",
            TrainingMode::RandomToken => "random_token",
            TrainingMode::Mixed => "mixed",
        }
    }

    pub fn hide_policy(self, modality: Modality) -> HidePolicy {
        let neural = modality.is_neural();
        match self {
            TrainingMode::Encoding if neural => HidePolicy::All,
            TrainingMode::Encoding => HidePolicy::Nothing,
            TrainingMode::Decoding if neural => HidePolicy::Nothing,
            TrainingMode::Decoding => HidePolicy::All,
            TrainingMode::SelfSpike if neural => HidePolicy::Sampled,
            TrainingMode::SelfSpike => HidePolicy::Nothing,
            TrainingMode::SelfBehavior if neural => HidePolicy::Nothing,
            TrainingMode::SelfBehavior => HidePolicy::Sampled,
            TrainingMode::RandomToken | TrainingMode::Mixed => HidePolicy::Sampled,
        }
    }
}

impl fmt::Display for TrainingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrainingMode {
    type Err = NeuroError;

    fn from_str(s: &str) -> NeuroResult<Self> {
        let needle = s.trim().to_ascii_lowercase().replace('_', "-");
        TrainingMode::ALL
            .into_iter()
            .find(|mode| mode.as_str().replace('_', "-") == needle)
            .ok_or_else(|| NeuroError::UnsupportedTrainingMode(s.to_string()))
    }
}

/// Input modality hidden from the encoder on encoding-mode steps.
///
/// Written as a single string: `"none"`, `"random"` or a modality name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Withheld {
    #[default]
    Nothing,
    Fixed(Modality),
    /// A fresh draw each step over the behavioural inputs and nothing.
    Random,
}

impl Withheld {
    pub fn fixed(&self) -> Option<Modality> {
        match *self {
            Withheld::Fixed(m) => Some(m),
            _ => None,
        }
    }
}

impl FromStr for Withheld {
    type Err = NeuroError;

    fn from_str(s: &str) -> NeuroResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "all" => Ok(Withheld::Nothing),
            "random" => Ok(Withheld::Random),
            other => other.parse().map(Withheld::Fixed),
        }
    }
}

impl TryFrom<String> for Withheld {
    type Error = NeuroError;

    fn try_from(value: String) -> NeuroResult<Self> {
        value.parse()
    }
}

impl From<Withheld> for String {
    fn from(value: Withheld) -> Self {
        match value {
            Withheld::Nothing => "none".to_string(),
            Withheld::Random => "random".to_string(),
            Withheld::Fixed(m) => m.to_string(),
        }
    }
}

/// Resolves a [`Withheld`] policy step by step.
#[derive(Debug)]
pub struct WithheldSampler {
    policy: Withheld,
    candidates: Vec<Modality>,
    rng: StdRng,
}

impl WithheldSampler {
    pub fn new(policy: Withheld, inputs: &BTreeSet<Modality>, seed: Option<u64>) -> Self {
        Self {
            policy,
            candidates: inputs.iter().copied().filter(|m| m.is_behavior()).collect(),
            rng: determinism::rng_from_optional(seed, "st-neuro/withheld"),
        }
    }

    pub fn policy(&self) -> Withheld {
        self.policy
    }

    /// Other training modes never withhold.
    pub fn sample(&mut self, mode: TrainingMode) -> Option<Modality> {
        if mode != TrainingMode::Encoding {
            return None;
        }
        match self.policy {
            Withheld::Nothing => None,
            Withheld::Fixed(m) => Some(m),
            Withheld::Random => {
                let idx = self.rng.gen_range(0..=self.candidates.len());
                self.candidates.get(idx).copied()
            }
        }
    }
}

/// Uniform draw over a fixed set of training modes, one per step.
#[derive(Debug)]
pub struct TrainingModeSampler {
    schemes: Vec<TrainingMode>,
    rng: StdRng,
}

impl TrainingModeSampler {
    pub fn new(schemes: Vec<TrainingMode>, seed: Option<u64>) -> NeuroResult<Self> {
        if schemes.is_empty() {
            return Err(NeuroError::InvalidConfig(
                "training mode sampler needs at least one scheme".into(),
            ));
        }
        Ok(Self {
            schemes,
            rng: determinism::rng_from_optional(seed, "st-neuro/training-modes"),
        })
    }

    pub fn schemes(&self) -> &[TrainingMode] {
        &self.schemes
    }

    pub fn sample(&mut self) -> TrainingMode {
        let idx = self.rng.gen_range(0..self.schemes.len());
        self.schemes[idx]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_modes_resolve_filters() {
        let available = [Modality::Spike, Modality::Wheel, Modality::Choice];
        let enc = ModalFilter::for_mode(ModelMode::Encoding, &available).unwrap();
        assert_eq!(enc.inputs.len(), 3);
        assert_eq!(enc.outputs, BTreeSet::from([Modality::Spike]));
        let dec = ModalFilter::for_mode(ModelMode::Decoding, &available).unwrap();
        assert_eq!(dec.outputs, BTreeSet::from([Modality::Wheel, Modality::Choice]));
        assert!(ModalFilter::for_mode(ModelMode::Decoding, &[Modality::Spike]).is_err());
        assert!(matches!(
            "seq2seq".parse::<ModelMode>(),
            Err(NeuroError::UnsupportedModelMode(_))
        ));
    }

    #[test]
    fn training_modes_force_masks_per_family() {
        assert_eq!(TrainingMode::Encoding.hide_policy(Modality::Spike), HidePolicy::All);
        assert_eq!(TrainingMode::Encoding.hide_policy(Modality::Wheel), HidePolicy::Nothing);
        assert_eq!(TrainingMode::Decoding.hide_policy(Modality::Block), HidePolicy::All);
        assert_eq!(TrainingMode::SelfBehavior.hide_policy(Modality::Choice), HidePolicy::Sampled);
        assert_eq!(TrainingMode::Mixed.hide_policy(Modality::Lfp), HidePolicy::Sampled);
    }

    #[test]
    fn training_modes_parse_both_spellings() {
        assert_eq!("self_spike".parse::<TrainingMode>().unwrap(), TrainingMode::SelfSpike);
        assert_eq!("random-token".parse::<TrainingMode>().unwrap(), TrainingMode::RandomToken);
        assert!("autoregressive".parse::<TrainingMode>().is_err());
    }

    #[test]
    fn seeded_sampler_is_reproducible() {
        let schemes = vec![TrainingMode::Encoding, TrainingMode::Decoding, TrainingMode::Mixed];
        let mut a = TrainingModeSampler::new(schemes.clone(), Some(9)).unwrap();
        let mut b = TrainingModeSampler::new(schemes, Some(9)).unwrap();
        let draws_a: Vec<_> = (0..16).map(|_| a.sample()).collect();
        let draws_b: Vec<_> = (0..16).map(|_| b.sample()).collect();
        assert_eq!(draws_a, draws_b);
    }

    #[test]
    fn withheld_policies_parse_from_one_string() {
        assert_eq!("random".parse::<Withheld>().unwrap(), Withheld::Random);
        assert_eq!("all".parse::<Withheld>().unwrap(), Withheld::Nothing);
        assert_eq!(
            "wheel-speed".parse::<Withheld>().unwrap(),
            Withheld::Fixed(Modality::Wheel)
        );
        assert!(matches!(
            "pupil".parse::<Withheld>(),
            Err(NeuroError::UnsupportedModality(_))
        ));
        assert_eq!(String::from(Withheld::Fixed(Modality::Choice)), "choice");
    }

    #[test]
    fn random_withholding_draws_behaviours_on_encoding_steps_only() {
        let inputs = BTreeSet::from([Modality::Spike, Modality::Wheel, Modality::Choice]);
        let mut sampler = WithheldSampler::new(Withheld::Random, &inputs, Some(5));
        let mut seen = BTreeSet::new();
        let mut nothing = 0;
        for _ in 0..200 {
            match sampler.sample(TrainingMode::Encoding) {
                Some(m) => {
                    seen.insert(m);
                }
                None => nothing += 1,
            }
            assert_eq!(sampler.sample(TrainingMode::SelfSpike), None);
        }
        assert_eq!(seen, BTreeSet::from([Modality::Wheel, Modality::Choice]));
        assert!(nothing > 0);

        let mut fixed = WithheldSampler::new(Withheld::Fixed(Modality::Wheel), &inputs, None);
        assert_eq!(fixed.sample(TrainingMode::Encoding), Some(Modality::Wheel));
        assert_eq!(fixed.sample(TrainingMode::Mixed), None);
    }
}
