//! Stateless request router: model name -> current ready endpoint -> adapter.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use anomaly_core::GATEWAY_METRICS;

use crate::adapter::{AdapterError, Predict};
use crate::artifact::VersionId;
use crate::config::GatewayConfig;
use crate::endpoint::{Endpoint, EndpointId, EndpointTable, InFlightGuard};
use crate::error::ErrorKind;

/// A route can move between reading it and admitting the call; re-resolving a few times
/// always lands on the replacement because routes switch before draining starts.
const RESOLVE_ATTEMPTS: usize = 4;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionRequest {
    pub model: String,
    pub data: Value,
    /// Caller budget; capped by the model's configured timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Adds `model_impact_score_<feature>` columns next to the prediction.
    #[serde(default)]
    pub explain: bool,
}

impl PredictionRequest {
    pub fn new(model: impl Into<String>, data: Value) -> Self { Self { model: model.into(), data, timeout_ms: None, explain: false } }
}

#[derive(Debug, Clone, Serialize)]
pub struct PredictionResult {
    pub prediction: Value,
    pub version: VersionId,
    #[serde(skip)]
    pub endpoint: EndpointId,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("model {0} has never been activated")]
    UnknownModel(String),
    #[error("model {0} has no ready endpoint")]
    ModelUnavailable(String),
    #[error("model {model} did not answer within {after_ms}ms")]
    Timeout { model: String, after_ms: u64 },
    #[error(transparent)]
    Adapter(#[from] AdapterError),
}

impl DispatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DispatchError::UnknownModel(_) => ErrorKind::UnknownModel,
            DispatchError::ModelUnavailable(_) => ErrorKind::ModelUnavailable,
            DispatchError::Timeout { .. } => ErrorKind::Timeout,
            DispatchError::Adapter(AdapterError::Load(_)) => ErrorKind::InferenceError,
            DispatchError::Adapter(e) => e.kind(),
        }
    }
}

/// Cheap to clone; any number of dispatchers may share one endpoint table.
#[derive(Clone)]
pub struct Dispatcher {
    config: Arc<GatewayConfig>,
    table: Arc<EndpointTable>,
}

impl Dispatcher {
    pub fn new(config: Arc<GatewayConfig>, table: Arc<EndpointTable>) -> Self { Self { config, table } }

    pub async fn handle(&self, request: PredictionRequest) -> Result<PredictionResult, DispatchError> {
        let started = Instant::now();
        let model = request.model.clone();
        let result = self.dispatch(request).await;
        let outcome = match &result { Ok(_) => "ok", Err(e) => e.kind().as_str() };
        // unconfigured names would otherwise create unbounded label sets
        let label = if self.config.model(&model).is_some() { model.as_str() } else { "unknown" };
        GATEWAY_METRICS.requests_total.with_label_values(&[label, outcome]).inc();
        GATEWAY_METRICS.request_latency_seconds.with_label_values(&[label]).observe(started.elapsed().as_secs_f64());
        if let Err(e) = &result { debug!(%model, kind=%e.kind(), error=%e, "dispatch failed"); }
        result
    }

    async fn dispatch(&self, request: PredictionRequest) -> Result<PredictionResult, DispatchError> {
        let PredictionRequest { model, data, timeout_ms, explain } = request;
        let settings = self.config.model(&model).ok_or_else(|| DispatchError::UnknownModel(model.clone()))?;
        let (endpoint, guard) = self.resolve(&model)?;
        let adapter = endpoint.adapter().ok_or_else(|| DispatchError::ModelUnavailable(model.clone()))?;
        let budget = timeout_ms.map(Duration::from_millis).map_or(settings.timeout(), |t| t.min(settings.timeout()));
        let permits = endpoint.permits();

        let call = async move {
            let permit = permits.acquire_owned().await.map_err(|_| AdapterError::Inference("endpoint closed".into()))?;
            // the guard travels with the blocking task so an abandoned call still counts until it finishes
            let prediction = tokio::task::spawn_blocking(move || {
                let _guard = guard;
                let _permit = permit;
                adapter.predict_explained(&data, explain)
            })
            .await
            .map_err(|e| AdapterError::Inference(format!("adapter task failed: {e}")))??;
            Ok::<Value, AdapterError>(prediction)
        };

        match tokio::time::timeout(budget, call).await {
            Ok(Ok(prediction)) => Ok(PredictionResult { prediction, version: endpoint.version_id().clone(), endpoint: endpoint.id() }),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(DispatchError::Timeout { model, after_ms: budget.as_millis() as u64 }),
        }
    }

    fn resolve(&self, model: &str) -> Result<(Arc<Endpoint>, InFlightGuard), DispatchError> {
        for _ in 0..RESOLVE_ATTEMPTS {
            let id = self.table.route(model).ok_or_else(|| DispatchError::UnknownModel(model.into()))?;
            if let Some(admitted) = self.admit(model, id) { return Ok(admitted); }
            if self.table.route(model) == Some(id) { break; }
        }
        Err(DispatchError::ModelUnavailable(model.into()))
    }

    /// Admits a call on `id` only if the route still points there once the call is counted;
    /// if the route moved in between, the admission is released again.
    fn admit(&self, model: &str, id: EndpointId) -> Option<(Arc<Endpoint>, InFlightGuard)> {
        let endpoint = self.table.get(id)?;
        let guard = endpoint.try_acquire()?;
        if self.table.route(model) != Some(id) {
            drop(guard);
            return None;
        }
        Some((endpoint, guard))
    }
}
