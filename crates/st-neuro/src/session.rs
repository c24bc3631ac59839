// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Session identities and the dense index used by the adapter arenas.

use crate::modality::Modality;
use crate::{NeuroError, NeuroResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Cardinalities of one recording session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSpec {
    pub eid: String,
    pub neurons: usize,
    #[serde(default)]
    pub lfp_channels: Option<usize>,
    /// Behaviour channels recorded in this session.
    #[serde(default)]
    pub behaviors: Vec<Modality>,
}

impl SessionSpec {
    pub fn new(eid: impl Into<String>, neurons: usize) -> Self {
        Self {
            eid: eid.into(),
            neurons,
            lfp_channels: None,
            behaviors: Vec::new(),
        }
    }

    pub fn with_lfp(mut self, channels: usize) -> Self {
        self.lfp_channels = Some(channels);
        self
    }

    pub fn with_behaviors(mut self, behaviors: impl IntoIterator<Item = Modality>) -> Self {
        for modality in behaviors {
            if modality.is_behavior() && !self.behaviors.contains(&modality) {
                self.behaviors.push(modality);
            }
        }
        self
    }

    /// Raw channel width of `modality` in this session, `None` when not recorded.
    pub fn width(&self, modality: Modality) -> Option<usize> {
        match modality {
            Modality::Spike => Some(self.neurons),
            Modality::Lfp => self.lfp_channels,
            other if self.behaviors.contains(&other) => other.fixed_width(),
            _ => None,
        }
    }

    pub fn validate(&self) -> NeuroResult<()> {
        if self.eid.is_empty() {
            return Err(NeuroError::InvalidConfig("session id must be non-empty".into()));
        }
        if self.neurons == 0 || self.lfp_channels == Some(0) {
            return Err(NeuroError::InvalidConfig(format!(
                "session '{}' declares a zero channel width",
                self.eid
            )));
        }
        Ok(())
    }
}

/// Fixed-capacity arena of sessions. Indices are dense and never reused.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRegistry {
    capacity: usize,
    sessions: Vec<SessionSpec>,
    #[serde(skip)]
    index: HashMap<String, usize>,
}

impl SessionRegistry {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            sessions: Vec::with_capacity(capacity),
            index: HashMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Registers a session and returns its dense index.
    pub fn register(&mut self, spec: SessionSpec) -> NeuroResult<usize> {
        spec.validate()?;
        if self.index.contains_key(&spec.eid) {
            return Err(NeuroError::DuplicateSession { eid: spec.eid });
        }
        if self.sessions.len() >= self.capacity {
            return Err(NeuroError::SessionCapacityExceeded {
                capacity: self.capacity,
            });
        }
        let idx = self.sessions.len();
        self.index.insert(spec.eid.clone(), idx);
        self.sessions.push(spec);
        Ok(idx)
    }

    pub fn index_of(&self, eid: &str) -> NeuroResult<usize> {
        self.index
            .get(eid)
            .copied()
            .ok_or_else(|| NeuroError::UnknownSession { eid: eid.to_string() })
    }

    pub fn spec(&self, index: usize) -> Option<&SessionSpec> {
        self.sessions.get(index)
    }

    pub fn lookup(&self, eid: &str) -> NeuroResult<&SessionSpec> {
        let idx = self.index_of(eid)?;
        self.sessions
            .get(idx)
            .ok_or_else(|| NeuroError::UnknownSession { eid: eid.to_string() })
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &SessionSpec)> {
        self.sessions.iter().enumerate()
    }

    pub fn contains(&self, eid: &str) -> bool {
        self.index.contains_key(eid)
    }

    /// Rebuilds the id map after deserialisation.
    pub(crate) fn reindex(&mut self) {
        self.index = self
            .sessions
            .iter()
            .enumerate()
            .map(|(idx, spec)| (spec.eid.clone(), idx))
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_assigns_dense_indices() {
        let mut registry = SessionRegistry::with_capacity(2);
        assert_eq!(registry.register(SessionSpec::new("a", 40)).unwrap(), 0);
        assert_eq!(registry.register(SessionSpec::new("b", 70)).unwrap(), 1);
        assert_eq!(registry.index_of("b").unwrap(), 1);
        assert_eq!(registry.lookup("a").unwrap().neurons, 40);
        assert!(matches!(
            registry.register(SessionSpec::new("c", 10)),
            Err(NeuroError::SessionCapacityExceeded { capacity: 2 })
        ));
    }

    #[test]
    fn duplicate_and_unknown_sessions_fail() {
        let mut registry = SessionRegistry::with_capacity(4);
        registry.register(SessionSpec::new("a", 5)).unwrap();
        assert!(matches!(
            registry.register(SessionSpec::new("a", 5)),
            Err(NeuroError::DuplicateSession { .. })
        ));
        assert!(matches!(
            registry.index_of("zz"),
            Err(NeuroError::UnknownSession { .. })
        ));
    }

    #[test]
    fn widths_follow_recorded_channels() {
        let spec = SessionSpec::new("a", 12)
            .with_lfp(3)
            .with_behaviors([Modality::Choice, Modality::Wheel, Modality::Spike]);
        assert_eq!(spec.width(Modality::Spike), Some(12));
        assert_eq!(spec.width(Modality::Lfp), Some(3));
        assert_eq!(spec.width(Modality::Choice), Some(2));
        assert_eq!(spec.width(Modality::Whisker), None);
        assert_eq!(spec.behaviors.len(), 2);
    }

    #[test]
    fn reindex_restores_lookup_after_serde() {
        let mut registry = SessionRegistry::with_capacity(3);
        registry.register(SessionSpec::new("x", 3)).unwrap();
        let json = serde_json::to_string(&registry).unwrap();
        let mut restored: SessionRegistry = serde_json::from_str(&json).unwrap();
        restored.reindex();
        assert_eq!(restored.index_of("x").unwrap(), 0);
    }
}
