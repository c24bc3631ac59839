// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::{NeuroError, NeuroResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Closed vocabulary of recorded signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Spike,
    Lfp,
    Wheel,
    Whisker,
    Choice,
    Block,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModalityFamily {
    /// Population recordings whose width varies by session.
    Neural,
    /// Per-time-step behaviour traces.
    Dynamic,
    /// One label per trial.
    Static,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossKind {
    /// Poisson NLL on log-rates.
    Poisson,
    MeanSquared,
    CrossEntropy,
}

impl Modality {
    pub const ALL: [Modality; 6] = [
        Modality::Spike,
        Modality::Lfp,
        Modality::Wheel,
        Modality::Whisker,
        Modality::Choice,
        Modality::Block,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Modality::Spike => "spike",
            Modality::Lfp => "lfp",
            Modality::Wheel => "wheel",
            Modality::Whisker => "whisker",
            Modality::Choice => "choice",
            Modality::Block => "block",
        }
    }

    pub fn family(self) -> ModalityFamily {
        match self {
            Modality::Spike | Modality::Lfp => ModalityFamily::Neural,
            Modality::Wheel | Modality::Whisker => ModalityFamily::Dynamic,
            Modality::Choice | Modality::Block => ModalityFamily::Static,
        }
    }

    pub fn is_neural(self) -> bool {
        self.family() == ModalityFamily::Neural
    }

    pub fn is_behavior(self) -> bool {
        !self.is_neural()
    }

    pub fn is_static(self) -> bool {
        self.family() == ModalityFamily::Static
    }

    /// Output width shared by every session, `None` when it is session specific.
    pub fn fixed_width(self) -> Option<usize> {
        match self {
            Modality::Spike | Modality::Lfp => None,
            Modality::Wheel | Modality::Whisker => Some(1),
            Modality::Choice => Some(2),
            Modality::Block => Some(3),
        }
    }

    pub fn loss_kind(self) -> LossKind {
        match self {
            Modality::Spike => LossKind::Poisson,
            Modality::Lfp | Modality::Wheel | Modality::Whisker => LossKind::MeanSquared,
            Modality::Choice | Modality::Block => LossKind::CrossEntropy,
        }
    }

    /// Row in the shared modality embedding table.
    pub fn index(self) -> usize {
        match self {
            Modality::Spike => 0,
            Modality::Lfp => 1,
            Modality::Wheel => 2,
            Modality::Whisker => 3,
            Modality::Choice => 4,
            Modality::Block => 5,
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Modality {
    type Err = NeuroError;

    fn from_str(s: &str) -> NeuroResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "spike" | "ap" => Ok(Modality::Spike),
            "lfp" => Ok(Modality::Lfp),
            "wheel" | "wheel-speed" => Ok(Modality::Wheel),
            "whisker" | "whisker-motion-energy" => Ok(Modality::Whisker),
            "choice" => Ok(Modality::Choice),
            "block" => Ok(Modality::Block),
            other => Err(NeuroError::UnsupportedModality(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_parse_and_unknown_names_fail() {
        assert_eq!("ap".parse::<Modality>().unwrap(), Modality::Spike);
        assert_eq!("Wheel-Speed".parse::<Modality>().unwrap(), Modality::Wheel);
        assert!(matches!(
            "pupil".parse::<Modality>(),
            Err(NeuroError::UnsupportedModality(_))
        ));
    }

    #[test]
    fn families_drive_loss_selection() {
        assert_eq!(Modality::Spike.loss_kind(), LossKind::Poisson);
        assert_eq!(Modality::Whisker.loss_kind(), LossKind::MeanSquared);
        assert_eq!(Modality::Block.fixed_width(), Some(3));
        assert!(Modality::Choice.is_static());
        assert!(Modality::Lfp.is_neural());
    }
}
