// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Epoch-tagged bundles of model, optimiser and schedule state.

use crate::config::{FineTunePolicy, NeuroConfig};
use crate::contrastive::MomentumQueue;
use crate::model::MultiModal;
use crate::session::SessionSpec;
use crate::{NeuroError, NeuroResult};
use serde::{Deserialize, Serialize};
use st_nn::io::{read_bincode, read_json, write_bincode, write_json};
use st_nn::module::Parameterized;
use st_nn::optim::{AdamWState, OneCycleState};
use st_nn::ModuleSnapshot;
use std::collections::BTreeSet;
use std::path::Path;
use tracing::info;

/// On-disk encoding, picked from the file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointFormat {
    Json,
    Bincode,
}

impl CheckpointFormat {
    /// `.bin` and `.bincode` select bincode; everything else is JSON.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("bin") | Some("bincode") => CheckpointFormat::Bincode,
            _ => CheckpointFormat::Json,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub epoch: u64,
    pub config: NeuroConfig,
    /// Registration order matters: it fixes every session's dense index.
    pub sessions: Vec<SessionSpec>,
    pub model: ModuleSnapshot,
    pub momentum: Option<ModuleSnapshot>,
    pub queue: Option<MomentumQueue>,
    pub optimizer: Option<AdamWState>,
    pub scheduler: Option<OneCycleState>,
}

impl Checkpoint {
    pub fn capture(model: &MultiModal, epoch: u64) -> NeuroResult<Self> {
        Ok(Self {
            epoch,
            config: model.config().clone(),
            sessions: model.registry().iter().map(|(_, spec)| spec.clone()).collect(),
            model: ModuleSnapshot::capture(model)?,
            momentum: model
                .momentum()
                .map(|momentum| ModuleSnapshot::from_state(momentum.values())),
            queue: model.queue().cloned(),
            optimizer: None,
            scheduler: None,
        })
    }

    pub fn with_optimizer(mut self, state: AdamWState) -> Self {
        self.optimizer = Some(state);
        self
    }

    pub fn with_scheduler(mut self, state: OneCycleState) -> Self {
        self.scheduler = Some(state);
        self
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> NeuroResult<()> {
        let path = path.as_ref();
        match CheckpointFormat::from_path(path) {
            CheckpointFormat::Json => write_json(self, path)?,
            CheckpointFormat::Bincode => write_bincode(self, path)?,
        }
        info!(epoch = self.epoch, path = %path.display(), "saved checkpoint");
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> NeuroResult<Self> {
        let path = path.as_ref();
        let checkpoint: Self = match CheckpointFormat::from_path(path) {
            CheckpointFormat::Json => read_json(path)?,
            CheckpointFormat::Bincode => read_bincode(path)?,
        };
        checkpoint.config.validate()?;
        Ok(checkpoint)
    }

    /// Fails with `UnknownSession` when `eid` was never registered in this checkpoint.
    pub fn ensure_session(&self, eid: &str) -> NeuroResult<()> {
        if self.sessions.iter().any(|spec| spec.eid == eid) {
            Ok(())
        } else {
            Err(NeuroError::UnknownSession { eid: eid.to_string() })
        }
    }

    /// Loads every parameter of `model`. A parameter the checkpoint does not
    /// hold, such as the adapters of a session registered after it was
    /// written, aborts with `MissingParameter`.
    pub fn restore(&self, model: &mut MultiModal) -> NeuroResult<()> {
        model.load_state_dict(&self.model.clone().into_state()?)?;
        self.restore_auxiliary(model)
    }

    /// Rebuilds the model from the stored config and sessions.
    pub fn into_model(self) -> NeuroResult<MultiModal> {
        let mut model =
            MultiModal::with_sessions(self.config.clone(), self.sessions.iter().cloned())?;
        self.restore(&mut model)?;
        Ok(model)
    }

    /// Loads a pretrained backbone into a model that may carry additional
    /// sessions. Parameters owned by sessions unknown to the checkpoint keep
    /// their fresh initialisation; any other missing key is still fatal.
    pub fn restore_pretrained(&self, model: &mut MultiModal) -> NeuroResult<Vec<String>> {
        let known: BTreeSet<&str> = self.sessions.iter().map(|spec| spec.eid.as_str()).collect();
        let fresh: Vec<String> = model
            .registry()
            .iter()
            .filter(|(_, spec)| !known.contains(spec.eid.as_str()))
            .map(|(_, spec)| format!(".{}.", spec.eid))
            .collect();
        let state = self.model.clone().into_state()?;
        let mut skipped = Vec::new();
        model.visit_parameters_mut(&mut |param| match state.get(param.name()) {
            Some(value) => param.load_value(value),
            None if fresh.iter().any(|tag| param.name().contains(tag.as_str())) => {
                skipped.push(param.name().to_string());
                Ok(())
            }
            None => Err(st_tensor::TensorError::MissingParameter {
                name: param.name().to_string(),
            }),
        })?;
        self.restore_auxiliary(model)?;
        info!(
            epoch = self.epoch,
            fresh = skipped.len(),
            "restored pretrained backbone"
        );
        Ok(skipped)
    }

    /// Pretrained backbone plus freshly registered sessions under `policy`.
    pub fn fine_tune(
        &self,
        sessions: impl IntoIterator<Item = SessionSpec>,
        policy: FineTunePolicy,
    ) -> NeuroResult<MultiModal> {
        let mut model =
            MultiModal::with_sessions(self.config.clone(), self.sessions.iter().cloned())?;
        self.restore(&mut model)?;
        for spec in sessions {
            model.register_session(spec, policy)?;
        }
        Ok(model)
    }

    fn restore_auxiliary(&self, model: &mut MultiModal) -> NeuroResult<()> {
        if let Some(snapshot) = &self.momentum {
            model.restore_momentum(snapshot.clone().into_state()?)?;
        }
        if let Some(queue) = &self.queue {
            if model.queue().is_some() {
                model.set_queue(queue.clone());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn small() -> NeuroConfig {
        NeuroConfig::default()
            .with_seed(3)
            .with_hidden(4, 1)
            .with_intermediate_size(8)
            .with_layers(1, 0)
            .with_max_time_steps(4)
            .with_max_sessions(3)
    }

    #[test]
    fn format_follows_extension() {
        assert_eq!(CheckpointFormat::from_path(Path::new("a/b.bin")), CheckpointFormat::Bincode);
        assert_eq!(CheckpointFormat::from_path(Path::new("a/b.json")), CheckpointFormat::Json);
        assert_eq!(CheckpointFormat::from_path(Path::new("a/b")), CheckpointFormat::Json);
    }

    #[test]
    fn bincode_round_trip_rebuilds_identical_parameters() {
        let model = MultiModal::with_sessions(small(), [SessionSpec::new("s0", 3)]).unwrap();
        let dir = tempdir().unwrap();
        let path = dir.path().join("epoch.bin");
        Checkpoint::capture(&model, 7).unwrap().save(&path).unwrap();

        let loaded = Checkpoint::load(&path).unwrap();
        assert_eq!(loaded.epoch, 7);
        let rebuilt = loaded.into_model().unwrap();
        let before = model.state_dict().unwrap();
        let after = rebuilt.state_dict().unwrap();
        assert_eq!(before.len(), after.len());
        for (name, value) in before {
            assert_eq!(after[&name], value, "{name}");
        }
    }

    #[test]
    fn unknown_session_fails_fast() {
        let model = MultiModal::with_sessions(small(), [SessionSpec::new("s0", 3)]).unwrap();
        let checkpoint = Checkpoint::capture(&model, 0).unwrap();
        assert!(checkpoint.ensure_session("s0").is_ok());
        assert_eq!(
            checkpoint.ensure_session("s9"),
            Err(NeuroError::UnknownSession { eid: "s9".into() })
        );
    }
}
