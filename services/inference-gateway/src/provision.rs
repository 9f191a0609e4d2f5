//! Provisioning collaborator: supplies a running adapter for an artifact.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::adapter::{AdapterError, Predict};
use crate::artifact::Artifact;
use crate::config::ModelSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProvisionHandle(pub u64);

pub struct Provisioned {
    pub handle: ProvisionHandle,
    pub adapter: Arc<dyn Predict>,
}

#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn start(&self, artifact: &Artifact, settings: &ModelSettings) -> Result<Provisioned, AdapterError>;
    async fn stop(&self, handle: ProvisionHandle);
    async fn health(&self, handle: ProvisionHandle) -> bool;
}

/// Runs adapters in-process; deserialization happens on the blocking pool.
#[derive(Default)]
pub struct LocalProvisioner {
    next: AtomicU64,
    live: Mutex<HashSet<ProvisionHandle>>,
}

impl LocalProvisioner {
    pub fn new() -> Self { Self::default() }
    pub fn live_count(&self) -> usize { self.live.lock().len() }
}

#[async_trait]
impl Provisioner for LocalProvisioner {
    async fn start(&self, artifact: &Artifact, settings: &ModelSettings) -> Result<Provisioned, AdapterError> {
        let kind = settings.adapter_for(&artifact.model_name)
            .ok_or_else(|| AdapterError::Load(format!("no adapter configured for {}", artifact.model_name)))?;
        let artifact = artifact.clone();
        let adapter = tokio::task::spawn_blocking(move || kind.load(&artifact))
            .await
            .map_err(|e| AdapterError::Load(format!("loader task failed: {e}")))??;
        let handle = ProvisionHandle(self.next.fetch_add(1, Ordering::Relaxed));
        self.live.lock().insert(handle);
        debug!(?handle, ?kind, "adapter provisioned");
        Ok(Provisioned { handle, adapter: Arc::new(adapter) })
    }

    async fn stop(&self, handle: ProvisionHandle) {
        self.live.lock().remove(&handle);
        debug!(?handle, "adapter released");
    }

    async fn health(&self, handle: ProvisionHandle) -> bool { self.live.lock().contains(&handle) }
}
