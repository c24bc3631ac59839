// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::batch::ModalityDict;
use crate::checkpoint::Checkpoint;
use crate::contrastive::ContrastiveDiagnostics;
use crate::metrics::{balanced_accuracy, bits_per_spike, r2_score, EvaluationReport};
use crate::modality::{LossKind, Modality};
use crate::mode::{TrainingMode, TrainingModeSampler, WithheldSampler};
use crate::model::{ForwardOptions, MultiModal, MultiModalOutput};
use crate::NeuroResult;
use serde::{Deserialize, Serialize};
use st_nn::module::Parameterized;
use st_nn::{AdamW, LrScheduler, OneCycleLr};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// What one optimisation step observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepReport {
    pub step: u64,
    pub training_mode: TrainingMode,
    /// Input hidden from the encoder for this step, if any.
    pub withheld: Option<Modality>,
    pub loss: f32,
    pub mod_loss: BTreeMap<Modality, f32>,
    pub learning_rate: f32,
    pub contrastive: Option<ContrastiveDiagnostics>,
}

/// Drives one model through zero, forward, backward, AdamW, the schedule and
/// the momentum EMA. Epoch iteration stays with the caller.
#[derive(Debug)]
pub struct MultiModalTrainer {
    model: MultiModal,
    optimizer: AdamW,
    scheduler: Option<OneCycleLr>,
    sampler: TrainingModeSampler,
    withheld: WithheldSampler,
}

impl MultiModalTrainer {
    pub fn new(model: MultiModal) -> NeuroResult<Self> {
        let config = model.config();
        let optimizer = AdamW::new(config.optimizer.adamw())?;
        let scheduler = config.optimizer.schedule().map(OneCycleLr::new).transpose()?;
        let sampler = TrainingModeSampler::new(config.training.schemes.clone(), config.seed)?;
        let inputs = config.modal_filter()?.inputs;
        let withheld = WithheldSampler::new(config.training.withheld, &inputs, config.seed);
        Ok(Self {
            model,
            optimizer,
            scheduler,
            sampler,
            withheld,
        })
    }

    /// Rebuilds the model and restores optimiser and schedule progress.
    pub fn resume(checkpoint: Checkpoint) -> NeuroResult<Self> {
        let optimizer = checkpoint.optimizer.clone();
        let scheduler = checkpoint.scheduler;
        let mut trainer = Self::new(checkpoint.into_model()?)?;
        if let Some(state) = optimizer {
            trainer.optimizer.load_state(state);
        }
        if let (Some(schedule), Some(state)) = (&mut trainer.scheduler, scheduler) {
            schedule.load_state(state);
        }
        Ok(trainer)
    }

    pub fn model(&self) -> &MultiModal {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut MultiModal {
        &mut self.model
    }

    pub fn into_model(self) -> MultiModal {
        self.model
    }

    pub fn optimizer(&self) -> &AdamW {
        &self.optimizer
    }

    pub fn steps_taken(&self) -> u64 {
        self.optimizer.steps_taken()
    }

    /// One optimisation step on `dict` under a sampled training mode.
    pub fn step(&mut self, dict: &ModalityDict) -> NeuroResult<StepReport> {
        let mode = self.sampler.sample();
        self.step_with(dict, mode)
    }

    /// One optimisation step under an explicit training mode.
    pub fn step_with(
        &mut self,
        dict: &ModalityDict,
        mode: TrainingMode,
    ) -> NeuroResult<StepReport> {
        self.model.zero_accumulators()?;
        let mut options = ForwardOptions::new(self.model.config().masker, mode);
        let withheld = self.withheld.sample(mode);
        if let Some(modality) = withheld {
            options = options.with_withheld(modality);
        }
        let output = self.model.forward(dict, &options)?;
        self.model.backward(&output)?;

        if let Some(schedule) = &self.scheduler {
            self.optimizer.set_learning_rate(schedule.current_lr())?;
        }
        let learning_rate = self.optimizer.learning_rate();
        self.optimizer.step(&mut self.model)?;
        if let Some(schedule) = &mut self.scheduler {
            schedule.step();
        }
        self.model.update_momentum()?;

        let report = StepReport {
            step: self.optimizer.steps_taken(),
            training_mode: mode,
            withheld,
            loss: output.loss,
            mod_loss: output.mod_loss,
            learning_rate,
            contrastive: output.contrastive,
        };
        debug!(
            step = report.step,
            mode = %mode,
            withheld = ?withheld,
            loss = report.loss,
            lr = learning_rate,
            "training step"
        );
        Ok(report)
    }

    /// Full-context forward without touching parameters or the queue.
    pub fn evaluate(
        &mut self,
        dict: &ModalityDict,
        mode: TrainingMode,
    ) -> NeuroResult<MultiModalOutput> {
        self.model.forward(dict, &ForwardOptions::evaluation(mode))
    }

    /// Scores a forward output with the evaluation metrics of each modality.
    pub fn report(dict: &ModalityDict, output: &MultiModalOutput) -> NeuroResult<EvaluationReport> {
        let mut report = EvaluationReport::default();
        for (modality, preds) in &output.mod_preds {
            let Some(entry) = dict.get(modality) else { continue };
            match modality.loss_kind() {
                LossKind::Poisson => {
                    let bps =
                        bits_per_spike(&preds.values, &entry.targets, Some(&entry.attn_mask))?;
                    report.bits_per_spike = Some(bps);
                }
                LossKind::MeanSquared => {
                    report
                        .r2
                        .insert(modality.to_string(), r2_score(&preds.values, &entry.targets)?);
                }
                LossKind::CrossEntropy => {
                    let truth: Vec<usize> = (0..entry.batch()).map(|b| entry.label(b)).collect();
                    let pred = output.mod_argmax.get(modality).cloned().unwrap_or_default();
                    report
                        .balanced_accuracy
                        .insert(modality.to_string(), balanced_accuracy(&pred, &truth)?);
                }
            }
        }
        info!(?report, "evaluation");
        Ok(report)
    }

    /// Model plus optimiser and schedule progress, tagged with `epoch`.
    pub fn checkpoint(&self, epoch: u64) -> NeuroResult<Checkpoint> {
        let mut checkpoint =
            Checkpoint::capture(&self.model, epoch)?.with_optimizer(self.optimizer.state());
        if let Some(schedule) = &self.scheduler {
            checkpoint = checkpoint.with_scheduler(schedule.state());
        }
        Ok(checkpoint)
    }
}
