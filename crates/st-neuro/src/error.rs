// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use st_tensor::TensorError;
use thiserror::Error;

/// Errors surfaced by the multimodal model, its configuration and its checkpoints.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum NeuroError {
    #[error("unsupported model mode '{0}' (expected mm, encoding or decoding)")]
    UnsupportedModelMode(String),
    #[error("unsupported masking scheme '{0}' (expected temporal, region, causal or none)")]
    UnsupportedMaskingScheme(String),
    #[error("unsupported training mode '{0}'")]
    UnsupportedTrainingMode(String),
    #[error("unsupported modality '{0}'")]
    UnsupportedModality(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Prediction/target or input/registry disagreement. Never broadcast silently.
    #[error("shape mismatch for {label}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        label: String,
        expected: (usize, usize),
        got: (usize, usize),
    },
    #[error("modality '{0}' is required but missing from the batch or registry")]
    MissingModality(String),
    #[error("region masking requested for '{0}' without per-channel region labels")]
    MissingRegions(String),
    #[error("unknown session '{eid}'")]
    UnknownSession { eid: String },
    #[error("session registry is full ({capacity} sessions)")]
    SessionCapacityExceeded { capacity: usize },
    #[error("session '{eid}' is already registered")]
    DuplicateSession { eid: String },
    #[error("queue capacity {capacity} is not a multiple of batch size {batch}")]
    QueueCapacity { capacity: usize, batch: usize },
    #[error("timestamp {timestamp} exceeds positional table of {max}")]
    TimestampOutOfRange { timestamp: usize, max: usize },
    #[error(transparent)]
    Tensor(#[from] TensorError),
    #[error("i/o failure: {0}")]
    Io(String),
    #[error("serialization failure: {0}")]
    Serialization(String),
    #[error("checkpoint error: {0}")]
    Checkpoint(String),
}

pub type NeuroResult<T> = std::result::Result<T, NeuroError>;

impl From<std::io::Error> for NeuroError {
    fn from(err: std::io::Error) -> Self {
        NeuroError::Io(err.to_string())
    }
}

impl NeuroError {
    pub(crate) fn shape(
        label: impl Into<String>,
        expected: (usize, usize),
        got: (usize, usize),
    ) -> Self {
        NeuroError::ShapeMismatch {
            label: label.into(),
            expected,
            got,
        }
    }
}
