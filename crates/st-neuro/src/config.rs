// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Serde-backed configuration for the multimodal model and its trainer.

use crate::heads::LossReduction;
use crate::masker::MaskingScheme;
use crate::modality::Modality;
use crate::mode::{ModalFilter, ModelMode, TrainingMode, Withheld};
use crate::sequence::ContextWindow;
use crate::{NeuroError, NeuroResult};
use serde::{Deserialize, Serialize};
use st_nn::{AdamWConfig, OneCycleConfig};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    pub hidden_size: usize,
    pub heads: usize,
    pub layers: usize,
    /// Width of the feed-forward block.
    pub intermediate_size: usize,
    pub layer_norm_eps: f32,
    /// Per-session adapters when true, one shared adapter otherwise.
    pub stitching: bool,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            hidden_size: 128,
            heads: 4,
            layers: 2,
            intermediate_size: 512,
            layer_norm_eps: 1e-5,
            stitching: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    /// `0` routes the heads straight off the encoder.
    pub layers: usize,
    pub causal: bool,
    /// Forbid decoder self-attention across modalities.
    pub separate_modalities: bool,
    pub stitching: bool,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            layers: 1,
            causal: false,
            separate_modalities: false,
            stitching: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbedderConfig {
    /// Rows of the positional table and the trial length pooled by heads.
    pub max_time_steps: usize,
    /// Arena size for per-session adapters and session embeddings.
    pub max_sessions: usize,
    /// Scale of the softsign inside the stitch encoders.
    pub activation_scale: f32,
}

impl Default for EmbedderConfig {
    fn default() -> Self {
        Self {
            max_time_steps: 100,
            max_sessions: 64,
            activation_scale: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContrastiveConfig {
    pub enabled: bool,
    pub moco: bool,
    pub projection_dim: usize,
    pub queue_size: usize,
    pub momentum: f32,
}

impl Default for ContrastiveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            moco: false,
            projection_dim: 64,
            queue_size: 256,
            momentum: 0.999,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LossConfig {
    pub reduction: LossReduction,
    /// Share of the contrastive term when it is active.
    pub contrastive_weight: f32,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            reduction: LossReduction::Sum,
            contrastive_weight: 0.5,
        }
    }
}

impl LossConfig {
    /// `(1 - w) * modal + w * contrastive`.
    pub fn combine(&self, modal: f32, contrastive: Option<f32>) -> f32 {
        match contrastive {
            Some(c) => (1.0 - self.contrastive_weight) * modal + self.contrastive_weight * c,
            None => modal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub learning_rate: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    pub weight_decay: f32,
    /// Enables the one-cycle schedule peaking at `learning_rate`.
    pub one_cycle: bool,
    pub total_steps: u64,
    pub pct_start: f32,
    pub div_factor: f32,
    pub final_div_factor: f32,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        let adamw = AdamWConfig::default();
        let cycle = OneCycleConfig::default();
        Self {
            learning_rate: adamw.learning_rate,
            beta1: adamw.beta1,
            beta2: adamw.beta2,
            epsilon: adamw.epsilon,
            weight_decay: adamw.weight_decay,
            one_cycle: true,
            total_steps: cycle.total_steps,
            pct_start: cycle.pct_start,
            div_factor: cycle.div_factor,
            final_div_factor: cycle.final_div_factor,
        }
    }
}

impl OptimizerConfig {
    pub fn adamw(&self) -> AdamWConfig {
        AdamWConfig {
            learning_rate: self.learning_rate,
            beta1: self.beta1,
            beta2: self.beta2,
            epsilon: self.epsilon,
            weight_decay: self.weight_decay,
        }
    }

    pub fn schedule(&self) -> Option<OneCycleConfig> {
        self.one_cycle.then_some(OneCycleConfig {
            max_lr: self.learning_rate,
            total_steps: self.total_steps,
            pct_start: self.pct_start,
            div_factor: self.div_factor,
            final_div_factor: self.final_div_factor,
        })
    }
}

/// Parameters left trainable after a session is registered for fine-tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FineTunePolicy {
    /// Only the new session's adapters learn.
    #[default]
    AdaptersOnly,
    Full,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Objectives the trainer samples from each step.
    pub schemes: Vec<TrainingMode>,
    /// Input modality hidden from the encoder on encoding-mode steps.
    pub withheld: Withheld,
    pub fine_tune: FineTunePolicy,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            schemes: vec![TrainingMode::RandomToken],
            withheld: Withheld::Nothing,
            fine_tune: FineTunePolicy::AdaptersOnly,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NeuroConfig {
    pub seed: Option<u64>,
    pub model_mode: ModelMode,
    /// Modalities the model carries adapters for.
    pub modalities: Vec<Modality>,
    pub encoder: EncoderConfig,
    pub decoder: DecoderConfig,
    pub embedder: EmbedderConfig,
    pub context: ContextWindow,
    pub masker: MaskingScheme,
    pub contrastive: ContrastiveConfig,
    pub loss: LossConfig,
    pub optimizer: OptimizerConfig,
    pub training: TrainingConfig,
}

impl Default for NeuroConfig {
    fn default() -> Self {
        Self {
            seed: None,
            model_mode: ModelMode::Mm,
            modalities: vec![Modality::Spike],
            encoder: EncoderConfig::default(),
            decoder: DecoderConfig::default(),
            embedder: EmbedderConfig::default(),
            context: ContextWindow::default(),
            masker: MaskingScheme::Temporal { ratio: 0.3 },
            contrastive: ContrastiveConfig::default(),
            loss: LossConfig::default(),
            optimizer: OptimizerConfig::default(),
            training: TrainingConfig::default(),
        }
    }
}

impl NeuroConfig {
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_model_mode(mut self, mode: ModelMode) -> Self {
        self.model_mode = mode;
        self
    }

    pub fn with_modalities(mut self, modalities: impl IntoIterator<Item = Modality>) -> Self {
        self.modalities = modalities.into_iter().collect();
        self
    }

    pub fn with_hidden(mut self, hidden_size: usize, heads: usize) -> Self {
        self.encoder.hidden_size = hidden_size;
        self.encoder.heads = heads;
        self
    }

    pub fn with_layers(mut self, encoder: usize, decoder: usize) -> Self {
        self.encoder.layers = encoder;
        self.decoder.layers = decoder;
        self
    }

    pub fn with_intermediate_size(mut self, size: usize) -> Self {
        self.encoder.intermediate_size = size;
        self
    }

    pub fn with_max_time_steps(mut self, steps: usize) -> Self {
        self.embedder.max_time_steps = steps;
        self
    }

    pub fn with_max_sessions(mut self, sessions: usize) -> Self {
        self.embedder.max_sessions = sessions;
        self
    }

    pub fn with_context(mut self, context: ContextWindow) -> Self {
        self.context = context;
        self
    }

    pub fn with_masker(mut self, scheme: MaskingScheme) -> Self {
        self.masker = scheme;
        self
    }

    pub fn with_contrastive(mut self, contrastive: ContrastiveConfig) -> Self {
        self.contrastive = contrastive;
        self
    }

    pub fn with_loss(mut self, loss: LossConfig) -> Self {
        self.loss = loss;
        self
    }

    pub fn with_optimizer(mut self, optimizer: OptimizerConfig) -> Self {
        self.optimizer = optimizer;
        self
    }

    pub fn with_training(mut self, training: TrainingConfig) -> Self {
        self.training = training;
        self
    }

    /// Input/output sets implied by `model_mode`.
    pub fn modal_filter(&self) -> NeuroResult<ModalFilter> {
        ModalFilter::for_mode(self.model_mode, &self.modalities)
    }

    pub fn validate(&self) -> NeuroResult<()> {
        let invalid = |msg: String| Err(NeuroError::InvalidConfig(msg));
        let enc = &self.encoder;
        if enc.hidden_size == 0 || enc.heads == 0 || enc.intermediate_size == 0 {
            return invalid(format!(
                "encoder widths must be positive (hidden {}, heads {}, intermediate {})",
                enc.hidden_size, enc.heads, enc.intermediate_size
            ));
        }
        if enc.hidden_size % enc.heads != 0 {
            return invalid(format!(
                "hidden size {} is not divisible by {} heads",
                enc.hidden_size, enc.heads
            ));
        }
        if !(enc.layer_norm_eps > 0.0) {
            return invalid(format!("layer_norm_eps must be positive, got {}", enc.layer_norm_eps));
        }
        let emb = &self.embedder;
        if emb.max_time_steps == 0 || emb.max_sessions == 0 {
            return invalid("embedder tables need at least one row".into());
        }
        if !(emb.activation_scale.is_finite() && emb.activation_scale > 0.0) {
            return invalid(format!(
                "activation_scale must be positive, got {}",
                emb.activation_scale
            ));
        }
        if self.modalities.is_empty() {
            return invalid("at least one modality is required".into());
        }
        self.masker.validate()?;
        self.modal_filter()?;
        let contrastive = &self.contrastive;
        if contrastive.enabled {
            if !self.modalities.contains(&Modality::Spike)
                || !self.modalities.iter().any(|m| m.is_behavior())
            {
                return invalid(
                    "contrastive learning needs spike and at least one behaviour modality".into(),
                );
            }
            if contrastive.projection_dim == 0 {
                return invalid("projection_dim must be positive".into());
            }
            if contrastive.moco && contrastive.queue_size == 0 {
                return invalid("queue_size must be positive".into());
            }
            if !(0.0..1.0).contains(&contrastive.momentum) {
                return invalid(format!("momentum {} outside [0, 1)", contrastive.momentum));
            }
        }
        if !(0.0..=1.0).contains(&self.loss.contrastive_weight) {
            return invalid(format!(
                "contrastive_weight {} outside [0, 1]",
                self.loss.contrastive_weight
            ));
        }
        self.optimizer.adamw().validate()?;
        if self.training.schemes.is_empty() {
            return invalid("training.schemes must name at least one mode".into());
        }
        if let Some(withheld) = self.training.withheld.fixed() {
            if !self.modalities.contains(&withheld) {
                return invalid(format!("withheld modality {withheld} is not configured"));
            }
        }
        Ok(())
    }

    pub fn from_toml_str(text: &str) -> NeuroResult<Self> {
        let config: NeuroConfig = toml::from_str(text)
            .map_err(|err| NeuroError::Serialization(format!("failed to parse config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_path<P: AsRef<Path>>(path: P) -> NeuroResult<Self> {
        let text = fs::read_to_string(&path).map_err(|err| {
            NeuroError::Io(format!(
                "failed to read config {}: {err}",
                path.as_ref().display()
            ))
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_json_str(text: &str) -> NeuroResult<Self> {
        let config: NeuroConfig = serde_json::from_str(text)
            .map_err(|err| NeuroError::Serialization(format!("failed to parse config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> NeuroResult<String> {
        toml::to_string_pretty(self).map_err(|err| NeuroError::Serialization(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        NeuroConfig::default().validate().unwrap();
    }

    #[test]
    fn toml_sections_override_defaults() {
        let text = r#"
            seed = 7
            model_mode = "encoding"
            modalities = ["spike", "wheel", "choice"]

            [encoder]
            hidden_size = 32
            heads = 4

            [masker]
            scheme = "causal"
            ratio = 0.2

            [contrastive]
            enabled = true
            moco = true
            queue_size = 16

            [training]
            schemes = ["self-spike", "random_token"]
            withheld = "wheel"
        "#;
        let config = NeuroConfig::from_toml_str(text).unwrap();
        assert_eq!(config.seed, Some(7));
        assert_eq!(config.model_mode, ModelMode::Encoding);
        assert_eq!(config.encoder.hidden_size, 32);
        assert_eq!(config.encoder.layers, 2);
        assert_eq!(config.masker, MaskingScheme::Causal { ratio: 0.2 });
        assert!(config.contrastive.moco);
        assert_eq!(config.training.schemes[0], TrainingMode::SelfSpike);
        assert_eq!(config.training.withheld, Withheld::Fixed(Modality::Wheel));
        let filter = config.modal_filter().unwrap();
        assert_eq!(filter.outputs.len(), 1);
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let bad_heads = NeuroConfig::default().with_hidden(30, 4);
        assert!(matches!(bad_heads.validate(), Err(NeuroError::InvalidConfig(_))));

        let bad_mode = NeuroConfig::from_toml_str("model_mode = \"sideways\"");
        assert!(bad_mode.is_err());

        let bad_ratio = NeuroConfig::default().with_masker(MaskingScheme::Temporal { ratio: 1.5 });
        assert!(bad_ratio.validate().is_err());

        let lonely = NeuroConfig::default().with_contrastive(ContrastiveConfig {
            enabled: true,
            ..ContrastiveConfig::default()
        });
        assert!(lonely.validate().is_err());
    }

    #[test]
    fn toml_round_trip_preserves_config() {
        let config = NeuroConfig::default().with_seed(3).with_layers(1, 0);
        let text = config.to_toml_string().unwrap();
        assert_eq!(NeuroConfig::from_toml_str(&text).unwrap(), config);
    }
}
