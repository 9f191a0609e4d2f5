//! Content-addressed artifact store.
//!
//! Bundles are keyed by the SHA-256 of their content and written to a sled tree
//! that is flushed before `publish` returns. Versions referenced by the registry
//! or by a live endpoint are pinned and cannot be deleted.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

use crate::error::ErrorKind;

pub const BUNDLE_FORMAT: u32 = 1;
const ARTIFACT_TREE: &str = "artifacts";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionId(String);

impl VersionId {
    pub fn new(id: impl Into<String>) -> Self { Self(id.into()) }
    pub fn as_str(&self) -> &str { &self.0 }
    pub fn short(&self) -> &str { &self.0[..self.0.len().min(12)] }
}

impl std::fmt::Display for VersionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(&self.0) }
}

/// Immutable published model version.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub model_name: String,
    pub version_id: VersionId,
    pub content_hash: String,
    pub code_ref: String,
    pub created_at: DateTime<Utc>,
    pub bytes: Arc<[u8]>,
}

/// Artifact metadata without the model payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArtifactInfo {
    pub model_name: String,
    pub version_id: VersionId,
    pub content_hash: String,
    pub code_ref: String,
    pub created_at: DateTime<Utc>,
    pub size_bytes: usize,
}

impl Artifact {
    pub fn info(&self) -> ArtifactInfo {
        ArtifactInfo {
            model_name: self.model_name.clone(),
            version_id: self.version_id.clone(),
            content_hash: self.content_hash.clone(),
            code_ref: self.code_ref.clone(),
            created_at: self.created_at,
            size_bytes: self.bytes.len(),
        }
    }
}

/// On-disk packaging: serialized model state plus the adapter code that loads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactBundle {
    pub format: u32,
    pub model_name: String,
    pub code_ref: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    /// base64 of the serialized model bytes
    pub model: String,
}

impl ArtifactBundle {
    pub fn new(model_name: &str, code_ref: &str, bytes: &[u8]) -> Self {
        Self { format: BUNDLE_FORMAT, model_name: model_name.into(), code_ref: code_ref.into(), created_at: None, model: B64.encode(bytes) }
    }

    pub fn model_bytes(&self) -> Result<Vec<u8>, StoreError> {
        B64.decode(self.model.as_bytes()).map_err(|e| StoreError::InvalidArtifact(format!("model payload is not base64: {e}")))
    }
}

/// Identity of a bundle: length-prefixed SHA-256 over model name, code reference and model bytes.
pub fn content_hash(model_name: &str, code_ref: &str, bytes: &[u8]) -> String {
    let mut h = Sha256::new();
    for part in [model_name.as_bytes(), code_ref.as_bytes(), bytes] {
        h.update((part.len() as u64).to_le_bytes());
        h.update(part);
    }
    hex::encode(h.finalize())
}

/// Deserialization self-check run before anything is written.
pub trait ArtifactCheck: Send + Sync {
    fn check(&self, model_name: &str, code_ref: &str, bytes: &[u8]) -> Result<(), String>;
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid artifact: {0}")]
    InvalidArtifact(String),
    #[error("artifact {0} not found")]
    NotFound(VersionId),
    #[error("artifact {0} is referenced by the registry or a live endpoint")]
    InUse(VersionId),
    #[error("artifact storage: {0}")]
    Storage(String),
}

impl From<sled::Error> for StoreError {
    fn from(e: sled::Error) -> Self { StoreError::Storage(e.to_string()) }
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::InvalidArtifact(_) => ErrorKind::InvalidArtifact,
            StoreError::NotFound(_) => ErrorKind::NotFound,
            StoreError::InUse(_) => ErrorKind::InUse,
            StoreError::Storage(_) => ErrorKind::Internal,
        }
    }
}

#[derive(Clone)]
pub struct ArtifactStore {
    db: sled::Db,
    tree: sled::Tree,
    checker: Arc<dyn ArtifactCheck>,
    pins: Arc<Mutex<HashMap<VersionId, usize>>>,
}

impl ArtifactStore {
    pub fn open(path: &Path, checker: Arc<dyn ArtifactCheck>) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Self::with_db(db, checker)
    }

    pub fn with_db(db: sled::Db, checker: Arc<dyn ArtifactCheck>) -> Result<Self, StoreError> {
        let tree = db.open_tree(ARTIFACT_TREE)?;
        Ok(Self { db, tree, checker, pins: Arc::new(Mutex::new(HashMap::new())) })
    }

    pub fn db(&self) -> &sled::Db { &self.db }

    pub fn publish(&self, model_name: &str, bytes: &[u8], code_ref: &str) -> Result<Artifact, StoreError> {
        if model_name.is_empty() { return Err(StoreError::InvalidArtifact("empty model name".into())); }
        self.checker.check(model_name, code_ref, bytes).map_err(StoreError::InvalidArtifact)?;
        let hash = content_hash(model_name, code_ref, bytes);
        let version_id = VersionId::new(hash.clone());
        let mut bundle = ArtifactBundle::new(model_name, code_ref, bytes);
        let created_at = Utc::now();
        bundle.created_at = Some(created_at);
        let encoded = serde_json::to_vec(&bundle).map_err(|e| StoreError::Storage(e.to_string()))?;
        let swapped = self.tree.compare_and_swap(version_id.as_str(), None::<&[u8]>, Some(encoded))?;
        // a concurrent publisher of the same content may not have flushed yet
        self.tree.flush()?;
        match swapped {
            Ok(()) => {
                info!(model=%model_name, version=%version_id.short(), code_ref, size=bytes.len(), "artifact published");
                Ok(Artifact { model_name: model_name.into(), version_id, content_hash: hash, code_ref: code_ref.into(), created_at, bytes: Arc::from(bytes) })
            }
            Err(_) => {
                debug!(model=%model_name, version=%version_id.short(), "artifact already stored");
                self.fetch(&version_id)
            }
        }
    }

    pub fn publish_bundle(&self, bundle: &ArtifactBundle) -> Result<Artifact, StoreError> {
        if bundle.format != BUNDLE_FORMAT {
            return Err(StoreError::InvalidArtifact(format!("unsupported bundle format {}", bundle.format)));
        }
        let bytes = bundle.model_bytes()?;
        self.publish(&bundle.model_name, &bytes, &bundle.code_ref)
    }

    pub fn fetch(&self, version_id: &VersionId) -> Result<Artifact, StoreError> {
        let raw = self.tree.get(version_id.as_str())?.ok_or_else(|| StoreError::NotFound(version_id.clone()))?;
        decode(version_id, &raw)
    }

    pub fn contains(&self, version_id: &VersionId) -> Result<bool, StoreError> {
        Ok(self.tree.contains_key(version_id.as_str())?)
    }

    pub fn list(&self, model_name: &str) -> Result<Vec<ArtifactInfo>, StoreError> {
        let mut out = Vec::new();
        for item in self.tree.iter() {
            let (key, raw) = item?;
            let version_id = VersionId::new(String::from_utf8_lossy(&key).into_owned());
            let artifact = decode(&version_id, &raw)?;
            if artifact.model_name == model_name { out.push(artifact.info()); }
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    pub fn delete(&self, version_id: &VersionId) -> Result<(), StoreError> {
        let pins = self.pins.lock();
        if pins.get(version_id).copied().unwrap_or(0) > 0 {
            return Err(StoreError::InUse(version_id.clone()));
        }
        if self.tree.remove(version_id.as_str())?.is_none() {
            return Err(StoreError::NotFound(version_id.clone()));
        }
        self.tree.flush()?;
        info!(version=%version_id.short(), "artifact deleted");
        Ok(())
    }

    /// Pins a version only if it exists; shares the lock with `delete` so the two never interleave.
    pub fn pin_existing(&self, version_id: &VersionId) -> Result<(), StoreError> {
        let mut pins = self.pins.lock();
        if !self.tree.contains_key(version_id.as_str())? {
            return Err(StoreError::NotFound(version_id.clone()));
        }
        *pins.entry(version_id.clone()).or_insert(0) += 1;
        Ok(())
    }

    pub fn pin(&self, version_id: &VersionId) {
        *self.pins.lock().entry(version_id.clone()).or_insert(0) += 1;
    }

    pub fn unpin(&self, version_id: &VersionId) {
        let mut pins = self.pins.lock();
        if let Some(count) = pins.get_mut(version_id) {
            *count = count.saturating_sub(1);
            if *count == 0 { pins.remove(version_id); }
        }
    }

    pub fn pin_count(&self, version_id: &VersionId) -> usize {
        self.pins.lock().get(version_id).copied().unwrap_or(0)
    }
}

fn decode(version_id: &VersionId, raw: &[u8]) -> Result<Artifact, StoreError> {
    let bundle: ArtifactBundle = serde_json::from_slice(raw).map_err(|e| StoreError::Storage(format!("corrupt bundle {version_id}: {e}")))?;
    let bytes = bundle.model_bytes().map_err(|e| StoreError::Storage(e.to_string()))?;
    let hash = content_hash(&bundle.model_name, &bundle.code_ref, &bytes);
    if hash != version_id.as_str() {
        return Err(StoreError::Storage(format!("content hash mismatch for {version_id}")));
    }
    Ok(Artifact {
        model_name: bundle.model_name,
        version_id: version_id.clone(),
        content_hash: hash,
        code_ref: bundle.code_ref,
        created_at: bundle.created_at.unwrap_or_else(Utc::now),
        bytes: Arc::from(bytes),
    })
}
