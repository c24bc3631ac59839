// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Session-adaptive multimodal transformer for neural spiking and behaviour.
//!
//! Recording sessions differ in neuron count and in which behaviours were
//! captured. Per-session stitching adapters map every session onto one shared
//! hidden width, so a single encoder/decoder backbone learns across sessions
//! while the adapters absorb the channel differences. Training hides parts of
//! the input (see [`masker`]) and scores the model on reconstructing them;
//! optionally a CLIP or momentum-contrast objective aligns pooled spike and
//! behaviour embeddings.
//!
//! ```no_run
//! use st_neuro::{
//!     Batch, ForwardOptions, MaskingScheme, MultiModal, NeuroConfig, SessionSpec, TrainingMode,
//! };
//! use std::collections::BTreeSet;
//!
//! # fn main() -> st_neuro::NeuroResult<()> {
//! let config = NeuroConfig::default().with_seed(7);
//! let mut model = MultiModal::with_sessions(config, [SessionSpec::new("session-a", 50)])?;
//! let spikes = st_neuro::Tensor::zeros(4 * 100, 50)?;
//! let dict = Batch::single_session(spikes, 100, "session-a")?
//!     .into_modality_dict(&BTreeSet::from([st_neuro::Modality::Spike]))?;
//! let scheme = MaskingScheme::Temporal { ratio: 0.3 };
//! let options = ForwardOptions::new(scheme, TrainingMode::RandomToken);
//! let output = model.forward(&dict, &options)?;
//! model.backward(&output)?;
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod checkpoint;
pub mod config;
pub mod contrastive;
pub mod embed;
pub mod error;
pub mod heads;
pub mod masker;
pub mod metrics;
pub mod modality;
pub mod mode;
pub mod model;
pub mod sequence;
pub mod session;
pub mod stitch;
pub mod telemetry;
pub mod trainer;
pub mod transformer;

pub use batch::{Batch, ModalityDict, ModalityEntry};
pub use checkpoint::{Checkpoint, CheckpointFormat};
pub use config::{
    ContrastiveConfig, DecoderConfig, EmbedderConfig, EncoderConfig, FineTunePolicy, LossConfig,
    NeuroConfig, OptimizerConfig, TrainingConfig,
};
pub use contrastive::{ContrastiveDiagnostics, ContrastiveHead, MomentumEncoder, MomentumQueue};
pub use error::{NeuroError, NeuroResult};
pub use heads::{LossReduction, Prediction};
pub use masker::{MaskOutcome, Masker, MaskingScheme};
pub use metrics::EvaluationReport;
pub use modality::{LossKind, Modality, ModalityFamily};
pub use mode::{
    HidePolicy, ModalFilter, ModelMode, TrainingMode, TrainingModeSampler, Withheld,
    WithheldSampler,
};
pub use model::{ForwardOptions, ForwardTape, MultiModal, MultiModalOutput};
pub use sequence::ContextWindow;
pub use session::{SessionRegistry, SessionSpec};
pub use stitch::{Adapter, StitchDecoder, StitchEncoder};
pub use trainer::{MultiModalTrainer, StepReport};

pub use st_tensor::Tensor;
