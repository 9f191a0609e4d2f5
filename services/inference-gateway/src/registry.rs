//! Model registry: logical model name -> active artifact version plus history.
//!
//! All mutations go through one mutex and are persisted to a sled tree before
//! the lock is released, so commit order is the order callers observe.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::artifact::{ArtifactStore, StoreError, VersionId};
use crate::error::ErrorKind;

const REGISTRY_TREE: &str = "registry";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub version_id: VersionId,
    pub activated_at: DateTime<Utc>,
    pub deactivated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub model_name: String,
    pub active_version: VersionId,
    pub activated_at: DateTime<Utc>,
    /// Oldest first.
    pub history: Vec<HistoryEntry>,
}

impl RegistryEntry {
    fn versions(&self) -> impl Iterator<Item = &VersionId> {
        std::iter::once(&self.active_version).chain(self.history.iter().map(|h| &h.version_id))
    }
}

/// Result of a committed registry change, carrying what is needed to undo it.
#[derive(Debug, Clone)]
pub struct Activation {
    pub model_name: String,
    pub version_id: VersionId,
    pub previous: Option<VersionId>,
    pub changed: bool,
    prior: Option<RegistryEntry>,
}

impl Activation {
    pub fn prior_entry(&self) -> Option<&RegistryEntry> { self.prior.as_ref() }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("artifact {0} was never published")]
    UnknownArtifact(VersionId),
    #[error("model {0} has no active version")]
    UnknownModel(String),
    #[error("model {0} has no previous version to roll back to")]
    NoHistory(String),
    #[error("registry storage: {0}")]
    Storage(String),
}

impl From<sled::Error> for RegistryError {
    fn from(e: sled::Error) -> Self { RegistryError::Storage(e.to_string()) }
}

impl RegistryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RegistryError::UnknownArtifact(_) => ErrorKind::UnknownArtifact,
            RegistryError::UnknownModel(_) => ErrorKind::UnknownModel,
            RegistryError::NoHistory(_) => ErrorKind::NoHistory,
            RegistryError::Storage(_) => ErrorKind::Internal,
        }
    }
}

pub struct ModelRegistry {
    store: ArtifactStore,
    tree: sled::Tree,
    entries: Mutex<HashMap<String, RegistryEntry>>,
    history_limit: usize,
}

impl ModelRegistry {
    /// Opens the registry tree in the store's database and re-pins every referenced version.
    pub fn open(store: ArtifactStore, history_limit: usize) -> Result<Self, RegistryError> {
        let tree = store.db().open_tree(REGISTRY_TREE)?;
        let mut entries = HashMap::new();
        for item in tree.iter() {
            let (_, raw) = item?;
            let entry: RegistryEntry = serde_json::from_slice(&raw).map_err(|e| RegistryError::Storage(e.to_string()))?;
            for v in entry.versions() { store.pin(v); }
            entries.insert(entry.model_name.clone(), entry);
        }
        if !entries.is_empty() { info!(models = entries.len(), "registry restored"); }
        Ok(Self { store, tree, entries: Mutex::new(entries), history_limit: history_limit.max(1) })
    }

    pub fn activate(&self, model: &str, version_id: &VersionId) -> Result<Activation, RegistryError> {
        let mut entries = self.entries.lock();
        let prior = entries.get(model).cloned();
        if let Some(entry) = &prior {
            if &entry.active_version == version_id {
                debug!(model, version=%version_id.short(), "version already active");
                return Ok(Activation { model_name: model.into(), version_id: version_id.clone(), previous: Some(version_id.clone()), changed: false, prior });
            }
        }
        self.store.pin_existing(version_id).map_err(|e| match e {
            StoreError::NotFound(v) => RegistryError::UnknownArtifact(v),
            other => RegistryError::Storage(other.to_string()),
        })?;
        let now = Utc::now();
        let next = match &prior {
            Some(entry) => {
                let mut next = entry.clone();
                next.history.push(HistoryEntry { version_id: entry.active_version.clone(), activated_at: entry.activated_at, deactivated_at: now });
                next.active_version = version_id.clone();
                next.activated_at = now;
                while next.history.len() > self.history_limit {
                    let dropped = next.history.remove(0);
                    self.store.unpin(&dropped.version_id);
                }
                next
            }
            None => RegistryEntry { model_name: model.into(), active_version: version_id.clone(), activated_at: now, history: Vec::new() },
        };
        if let Err(e) = self.persist(&next) {
            self.release(&next);
            self.retain(prior.as_ref());
            return Err(e);
        }
        entries.insert(model.into(), next);
        info!(model, version=%version_id.short(), previous=?prior.as_ref().map(|p| p.active_version.short().to_string()), "registry activation committed");
        Ok(Activation { model_name: model.into(), version_id: version_id.clone(), previous: prior.as_ref().map(|p| p.active_version.clone()), changed: true, prior })
    }

    pub fn current(&self, model: &str) -> Result<VersionId, RegistryError> {
        self.entries.lock().get(model).map(|e| e.active_version.clone()).ok_or_else(|| RegistryError::UnknownModel(model.into()))
    }

    pub fn entry(&self, model: &str) -> Result<RegistryEntry, RegistryError> {
        self.entries.lock().get(model).cloned().ok_or_else(|| RegistryError::UnknownModel(model.into()))
    }

    pub fn models(&self) -> Vec<(String, VersionId)> {
        let mut out: Vec<_> = self.entries.lock().values().map(|e| (e.model_name.clone(), e.active_version.clone())).collect();
        out.sort();
        out
    }

    /// Reactivates the most recent history entry; the version rolled back from is dropped.
    pub fn rollback(&self, model: &str) -> Result<Activation, RegistryError> {
        let mut entries = self.entries.lock();
        let prior = entries.get(model).cloned().ok_or_else(|| RegistryError::UnknownModel(model.into()))?;
        let mut next = prior.clone();
        let restored = next.history.pop().ok_or_else(|| RegistryError::NoHistory(model.into()))?;
        next.active_version = restored.version_id.clone();
        next.activated_at = Utc::now();
        self.persist(&next)?;
        self.store.unpin(&prior.active_version);
        entries.insert(model.into(), next);
        info!(model, version=%restored.version_id.short(), from=%prior.active_version.short(), "registry rollback committed");
        Ok(Activation { model_name: model.into(), version_id: restored.version_id, previous: Some(prior.active_version.clone()), changed: true, prior: Some(prior) })
    }

    /// Undoes a committed activation or rollback, used when the new version fails to load.
    pub fn revert(&self, activation: &Activation) -> Result<(), RegistryError> {
        if !activation.changed { return Ok(()); }
        let mut entries = self.entries.lock();
        let current = entries.get(&activation.model_name).cloned();
        self.retain(activation.prior.as_ref());
        match &activation.prior {
            Some(prior) => {
                self.persist(prior)?;
                entries.insert(activation.model_name.clone(), prior.clone());
            }
            None => {
                self.tree.remove(activation.model_name.as_bytes())?;
                self.tree.flush()?;
                entries.remove(&activation.model_name);
            }
        }
        self.release_opt(current.as_ref());
        info!(model=%activation.model_name, version=%activation.version_id.short(), "registry change reverted");
        Ok(())
    }

    fn persist(&self, entry: &RegistryEntry) -> Result<(), RegistryError> {
        let raw = serde_json::to_vec(entry).map_err(|e| RegistryError::Storage(e.to_string()))?;
        self.tree.insert(entry.model_name.as_bytes(), raw)?;
        self.tree.flush()?;
        Ok(())
    }

    fn retain(&self, entry: Option<&RegistryEntry>) {
        if let Some(e) = entry { for v in e.versions() { self.store.pin(v); } }
    }

    fn release(&self, entry: &RegistryEntry) {
        for v in entry.versions() { self.store.unpin(v); }
    }

    fn release_opt(&self, entry: Option<&RegistryEntry>) {
        if let Some(e) = entry { self.release(e); }
    }
}
