//! Process-wide gateway configuration.
//!
//! Loaded once at startup through [`anomaly_core::load_config`] and shared as an
//! `Arc<GatewayConfig>`; components never re-read the environment mid-request.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::adapter::AdapterKind;

pub const DEFAULT_MODELS: [&str; 2] = ["event", "custom"];

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayConfig {
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_health_port")]
    pub health_port: u16,
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,
    #[serde(default = "default_history_limit")]
    pub registry_history_limit: usize,
    #[serde(default = "default_endpoint_prefix")]
    pub endpoint_name_prefix: String,
    #[serde(default)]
    pub models: BTreeMap<String, ModelSettings>,
    /// Model name -> artifact bundle file published and activated at startup.
    #[serde(default)]
    pub bootstrap: BTreeMap<String, PathBuf>,
}

/// Per-model serving knobs. The two logical models share one lifecycle; any
/// behavioural difference between them lives here rather than in code.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ModelSettings {
    #[serde(default)]
    pub adapter: Option<AdapterKind>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

fn default_service_name() -> String { "inference-gateway".into() }
fn default_http_port() -> u16 { 8080 }
fn default_health_port() -> u16 { 9091 }
fn default_store_path() -> PathBuf { PathBuf::from("./data/artifacts") }
fn default_history_limit() -> usize { 16 }
fn default_endpoint_prefix() -> String { "anamoly-detection".into() }
fn default_timeout_ms() -> u64 { 2_000 }
fn default_drain_timeout_ms() -> u64 { 30_000 }
// matches the serverless endpoint concurrency the models were deployed with
fn default_max_concurrency() -> usize { 10 }

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            adapter: None,
            timeout_ms: default_timeout_ms(),
            drain_timeout_ms: default_drain_timeout_ms(),
            max_concurrency: default_max_concurrency(),
        }
    }
}

impl ModelSettings {
    pub fn timeout(&self) -> Duration { Duration::from_millis(self.timeout_ms) }
    pub fn drain_timeout(&self) -> Duration { Duration::from_millis(self.drain_timeout_ms) }

    /// Explicit adapter, or the variant named after the model.
    pub fn adapter_for(&self, model: &str) -> Option<AdapterKind> {
        self.adapter.or_else(|| AdapterKind::from_model_name(model))
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let mut cfg = Self {
            service_name: default_service_name(),
            http_port: default_http_port(),
            health_port: default_health_port(),
            store_path: default_store_path(),
            registry_history_limit: default_history_limit(),
            endpoint_name_prefix: default_endpoint_prefix(),
            models: BTreeMap::new(),
            bootstrap: BTreeMap::new(),
        };
        cfg.fill_default_models();
        cfg
    }
}

impl GatewayConfig {
    pub fn load() -> Result<Self> {
        let cfg: GatewayConfig = anomaly_core::load_config("inference-gateway")?;
        cfg.normalized()
    }

    /// Adds the built-in models that the sources left out and validates the result.
    pub fn normalized(mut self) -> Result<Self> {
        self.fill_default_models();
        self.validate()?;
        Ok(self)
    }

    fn fill_default_models(&mut self) {
        for name in DEFAULT_MODELS {
            self.models.entry(name.to_string()).or_default();
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.registry_history_limit == 0 { return Err(anyhow!("registry_history_limit must be positive")); }
        for (name, settings) in &self.models {
            if settings.adapter_for(name).is_none() { return Err(anyhow!("model {name}: no adapter configured")); }
            if settings.max_concurrency == 0 { return Err(anyhow!("model {name}: max_concurrency must be positive")); }
            if settings.timeout_ms == 0 { return Err(anyhow!("model {name}: timeout_ms must be positive")); }
        }
        for name in self.bootstrap.keys() {
            if !self.models.contains_key(name) { return Err(anyhow!("bootstrap references unknown model {name}")); }
        }
        Ok(())
    }

    pub fn model(&self, name: &str) -> Option<&ModelSettings> { self.models.get(name) }

    pub fn endpoint_name(&self, model: &str) -> String {
        format!("{}-{}-prediction-endpoint", self.endpoint_name_prefix, model)
    }
}
