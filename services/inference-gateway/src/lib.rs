//! Inference gateway: routes prediction requests for the `event` and `custom`
//! anomaly models to their active endpoints and manages artifact versions.
//!
//! Data flow: artifact published -> registry activation -> endpoint loaded ->
//! route swapped -> old endpoint drained.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tracing::{info, warn};

pub mod adapter;
pub mod api;
pub mod artifact;
pub mod config;
pub mod dispatcher;
pub mod endpoint;
pub mod error;
pub mod provision;
pub mod registry;

pub use adapter::{Adapter, AdapterCatalog, AdapterError, AdapterKind, Predict};
pub use artifact::{Artifact, ArtifactBundle, ArtifactInfo, ArtifactStore, StoreError, VersionId};
pub use config::{GatewayConfig, ModelSettings};
pub use dispatcher::{DispatchError, Dispatcher, PredictionRequest, PredictionResult};
pub use endpoint::{ActivationReport, EndpointError, EndpointId, EndpointManager, EndpointState};
pub use error::ErrorKind;
pub use provision::{LocalProvisioner, ProvisionHandle, Provisioned, Provisioner};
pub use registry::{ModelRegistry, RegistryEntry, RegistryError};

/// All components wired together around one artifact database.
pub struct Gateway {
    pub config: Arc<GatewayConfig>,
    pub store: ArtifactStore,
    pub registry: Arc<ModelRegistry>,
    pub manager: Arc<EndpointManager>,
    pub dispatcher: Dispatcher,
}

impl Gateway {
    pub fn open(config: Arc<GatewayConfig>, provisioner: Arc<dyn Provisioner>) -> Result<Self> {
        let store = ArtifactStore::open(&config.store_path, Arc::new(AdapterCatalog::from_config(&config)))
            .with_context(|| format!("opening artifact store at {}", config.store_path.display()))?;
        Self::assemble(config, store, provisioner)
    }

    /// Backed by a temporary sled database that is removed on drop.
    pub fn in_memory(config: Arc<GatewayConfig>, provisioner: Arc<dyn Provisioner>) -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        let store = ArtifactStore::with_db(db, Arc::new(AdapterCatalog::from_config(&config)))?;
        Self::assemble(config, store, provisioner)
    }

    fn assemble(config: Arc<GatewayConfig>, store: ArtifactStore, provisioner: Arc<dyn Provisioner>) -> Result<Self> {
        let registry = Arc::new(ModelRegistry::open(store.clone(), config.registry_history_limit)?);
        let manager = Arc::new(EndpointManager::new(config.clone(), store.clone(), registry.clone(), provisioner));
        let dispatcher = Dispatcher::new(config.clone(), manager.table());
        Ok(Self { config, store, registry, manager, dispatcher })
    }

    /// Restores endpoints for versions the registry already knows about, then
    /// publishes and activates the configured bootstrap bundles.
    pub async fn bootstrap(&self) {
        let resumed = self.manager.resume().await;
        if resumed > 0 { info!(resumed, "endpoints restored from registry"); }
        for (model, path) in &self.config.bootstrap {
            match self.bootstrap_model(model, path).await {
                Ok(report) => info!(%model, version=%report.version_id.short(), changed=report.changed, "bootstrap artifact active"),
                Err(e) => warn!(%model, path=%path.display(), error=%format!("{e:#}"), "bootstrap failed"),
            }
        }
    }

    async fn bootstrap_model(&self, model: &str, path: &std::path::Path) -> Result<ActivationReport> {
        let raw = tokio::fs::read(path).await.with_context(|| format!("reading {}", path.display()))?;
        let bundle: ArtifactBundle = serde_json::from_slice(&raw).context("decoding artifact bundle")?;
        if bundle.model_name != model {
            return Err(anyhow!("bundle is for model {}, not {model}", bundle.model_name));
        }
        let store = self.store.clone();
        let artifact = tokio::task::spawn_blocking(move || store.publish_bundle(&bundle)).await??;
        Ok(self.manager.activate(model, &artifact.version_id).await?)
    }
}
