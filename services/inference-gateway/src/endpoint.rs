//! Endpoint lifecycle and the activation protocol.
//!
//! Endpoints live in an arena owned by the [`EndpointManager`]; the routing table
//! maps a model name to an [`EndpointId`] and is the only state the dispatcher
//! reads. Activation is strictly ordered:
//!
//! 1. load the new endpoint until it is `Ready` (on failure the registry change is reverted)
//! 2. swap the route to the new endpoint
//! 3. drain the previous endpoint, then terminate it
//!
//! New traffic therefore never reaches an endpoint that is not ready, and calls
//! already admitted by the old endpoint run to completion.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{watch, Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use anomaly_core::GATEWAY_METRICS;

use crate::adapter::Predict;
use crate::artifact::{ArtifactStore, VersionId};
use crate::config::{GatewayConfig, ModelSettings};
use crate::error::ErrorKind;
use crate::provision::{ProvisionHandle, Provisioner};
use crate::registry::{Activation, ModelRegistry, RegistryError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct EndpointId(pub u64);

impl std::fmt::Display for EndpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "ep-{}", self.0) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointState { Loading, Ready, Draining, Terminated }

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("model {0} is not configured")]
    UnknownModel(String),
    #[error("loading {model}@{version} failed: {reason}")]
    Load { model: String, version: VersionId, reason: String },
    #[error("endpoint {id} for {model} still had {in_flight} calls after {timeout_ms}ms of draining")]
    DrainTimeout { id: EndpointId, model: String, in_flight: usize, timeout_ms: u64 },
}

impl EndpointError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EndpointError::Registry(e) => e.kind(),
            EndpointError::UnknownModel(_) => ErrorKind::UnknownModel,
            EndpointError::Load { .. } => ErrorKind::LoadError,
            EndpointError::DrainTimeout { .. } => ErrorKind::DrainTimeout,
        }
    }
}

pub struct Endpoint {
    id: EndpointId,
    name: String,
    model_name: String,
    version_id: VersionId,
    state: Mutex<EndpointState>,
    state_tx: watch::Sender<EndpointState>,
    in_flight: AtomicUsize,
    idle: Notify,
    adapter: OnceCell<Arc<dyn Predict>>,
    handle: Mutex<Option<ProvisionHandle>>,
    permits: Arc<Semaphore>,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.id)
            .field("model", &self.model_name)
            .field("version", &self.version_id.short())
            .field("state", &self.state())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl Endpoint {
    pub(crate) fn new(id: EndpointId, name: String, model_name: &str, version_id: VersionId, max_concurrency: usize) -> Self {
        let (state_tx, _) = watch::channel(EndpointState::Loading);
        Self {
            id,
            name,
            model_name: model_name.into(),
            version_id,
            state: Mutex::new(EndpointState::Loading),
            state_tx,
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
            adapter: OnceCell::new(),
            handle: Mutex::new(None),
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
        }
    }

    pub fn id(&self) -> EndpointId { self.id }
    pub fn name(&self) -> &str { &self.name }
    pub fn model_name(&self) -> &str { &self.model_name }
    pub fn version_id(&self) -> &VersionId { &self.version_id }
    pub fn state(&self) -> EndpointState { *self.state.lock() }
    pub fn in_flight(&self) -> usize { self.in_flight.load(Ordering::SeqCst) }
    pub fn watch(&self) -> watch::Receiver<EndpointState> { self.state_tx.subscribe() }
    pub fn adapter(&self) -> Option<Arc<dyn Predict>> { self.adapter.get().cloned() }
    pub fn permits(&self) -> Arc<Semaphore> { self.permits.clone() }

    /// Admits a call only while `Ready`; the check and the increment happen under the state lock
    /// so a call is never admitted after draining has begun.
    pub fn try_acquire(self: &Arc<Self>) -> Option<InFlightGuard> {
        let state = self.state.lock();
        if *state != EndpointState::Ready { return None; }
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        GATEWAY_METRICS.endpoint_in_flight.with_label_values(&[self.model_name.as_str()]).inc();
        Some(InFlightGuard { endpoint: self.clone() })
    }

    /// `Terminated` is final; moves out of it are ignored.
    pub(crate) fn transition(&self, next: EndpointState) -> bool {
        let mut state = self.state.lock();
        if *state == EndpointState::Terminated && next != EndpointState::Terminated {
            warn!(endpoint=%self.id, model=%self.model_name, to=?next, "transition out of terminated ignored");
            return false;
        }
        debug!(endpoint=%self.id, model=%self.model_name, from=?*state, to=?next, "endpoint transition");
        *state = next;
        self.state_tx.send_replace(next);
        true
    }

    /// Moves `Ready -> Draining`; false when the endpoint is in any other state,
    /// so a single endpoint is only ever drained once.
    fn start_draining(&self) -> bool {
        let mut state = self.state.lock();
        if *state != EndpointState::Ready { return false; }
        debug!(endpoint=%self.id, model=%self.model_name, "endpoint transition to draining");
        *state = EndpointState::Draining;
        self.state_tx.send_replace(EndpointState::Draining);
        true
    }

    pub(crate) fn mark_ready(&self, adapter: Arc<dyn Predict>, handle: ProvisionHandle) {
        let _ = self.adapter.set(adapter);
        *self.handle.lock() = Some(handle);
        self.transition(EndpointState::Ready);
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.in_flight() == 0 { return; }
            notified.await;
        }
    }
}

/// Keeps an endpoint's in-flight count raised until the call finishes.
pub struct InFlightGuard { endpoint: Arc<Endpoint> }

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        GATEWAY_METRICS.endpoint_in_flight.with_label_values(&[self.endpoint.model_name.as_str()]).dec();
        if self.endpoint.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.endpoint.idle.notify_waiters();
        }
    }
}

/// Arena of endpoints plus the model -> endpoint routing table.
///
/// Readers get lock-free route lookups; only the manager mutates either map.
#[derive(Default)]
pub struct EndpointTable {
    routes: ArcSwap<HashMap<String, EndpointId>>,
    arena: RwLock<HashMap<EndpointId, Arc<Endpoint>>>,
}

impl EndpointTable {
    pub fn route(&self, model: &str) -> Option<EndpointId> { self.routes.load().get(model).copied() }
    pub fn get(&self, id: EndpointId) -> Option<Arc<Endpoint>> { self.arena.read().get(&id).cloned() }

    pub fn live(&self) -> Vec<Arc<Endpoint>> {
        let mut out: Vec<_> = self.arena.read().values().cloned().collect();
        out.sort_by_key(|e| e.id());
        out
    }

    pub(crate) fn insert(&self, endpoint: Arc<Endpoint>) { self.arena.write().insert(endpoint.id(), endpoint); }
    pub(crate) fn remove(&self, id: EndpointId) { self.arena.write().remove(&id); }

    pub(crate) fn swap_route(&self, model: &str, id: EndpointId) {
        self.routes.rcu(|routes| {
            let mut next = HashMap::clone(routes);
            next.insert(model.to_string(), id);
            next
        });
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ActivationReport {
    pub model: String,
    pub version_id: VersionId,
    pub previous_version: Option<VersionId>,
    pub endpoint: EndpointId,
    pub endpoint_name: String,
    /// Endpoint that was put into draining by this activation.
    pub replaced: Option<EndpointId>,
    pub changed: bool,
}

pub struct EndpointManager {
    config: Arc<GatewayConfig>,
    store: ArtifactStore,
    registry: Arc<ModelRegistry>,
    provisioner: Arc<dyn Provisioner>,
    table: Arc<EndpointTable>,
    next_id: AtomicU64,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    drains: Mutex<Vec<JoinHandle<()>>>,
}

impl EndpointManager {
    pub fn new(config: Arc<GatewayConfig>, store: ArtifactStore, registry: Arc<ModelRegistry>, provisioner: Arc<dyn Provisioner>) -> Self {
        Self {
            config,
            store,
            registry,
            provisioner,
            table: Arc::new(EndpointTable::default()),
            next_id: AtomicU64::new(1),
            locks: Mutex::new(HashMap::new()),
            drains: Mutex::new(Vec::new()),
        }
    }

    pub fn table(&self) -> Arc<EndpointTable> { self.table.clone() }

    pub fn endpoint_state(&self, id: EndpointId) -> EndpointState {
        self.table.get(id).map(|e| e.state()).unwrap_or(EndpointState::Terminated)
    }

    pub fn watch_state(&self, id: EndpointId) -> Option<watch::Receiver<EndpointState>> {
        self.table.get(id).map(|e| e.watch())
    }

    /// The ready endpoint currently receiving traffic for `model`.
    pub fn serving(&self, model: &str) -> Option<Arc<Endpoint>> {
        self.table.route(model)
            .and_then(|id| self.table.get(id))
            .filter(|e| e.state() == EndpointState::Ready)
    }

    fn settings(&self, model: &str) -> Result<ModelSettings, EndpointError> {
        self.config.model(model).cloned().ok_or_else(|| EndpointError::UnknownModel(model.into()))
    }

    fn lock_for(&self, model: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks.lock().entry(model.to_string()).or_default().clone()
    }

    pub async fn activate(&self, model: &str, version_id: &VersionId) -> Result<ActivationReport, EndpointError> {
        let settings = self.settings(model)?;
        let lock = self.lock_for(model);
        let _serial = lock.lock().await;
        let activation = self.registry.activate(model, version_id)?;
        if !activation.changed {
            if let Some(ep) = self.serving(model).filter(|ep| ep.version_id() == version_id) {
                return Ok(ActivationReport {
                    model: model.into(),
                    version_id: version_id.clone(),
                    previous_version: activation.previous,
                    endpoint: ep.id(),
                    endpoint_name: ep.name().into(),
                    replaced: None,
                    changed: false,
                });
            }
        }
        self.commit(model, &settings, activation).await
    }

    pub async fn rollback(&self, model: &str) -> Result<ActivationReport, EndpointError> {
        let settings = self.settings(model)?;
        let lock = self.lock_for(model);
        let _serial = lock.lock().await;
        let activation = self.registry.rollback(model)?;
        self.commit(model, &settings, activation).await
    }

    /// Brings up endpoints for every registry entry that has no serving endpoint, e.g. after a restart.
    /// Failures leave the model unavailable; the registry is not modified.
    pub async fn resume(&self) -> usize {
        let mut loaded = 0;
        for (model, version_id) in self.registry.models() {
            let Ok(settings) = self.settings(&model) else {
                warn!(%model, "registry entry for unconfigured model ignored");
                continue;
            };
            let lock = self.lock_for(&model);
            let _serial = lock.lock().await;
            if self.serving(&model).is_some() { continue; }
            match self.load_and_swap(&model, &settings, &version_id).await {
                Ok(_) => loaded += 1,
                Err(e) => error!(%model, version=%version_id.short(), error=%e, "resume failed; model unavailable"),
            }
        }
        loaded
    }

    async fn commit(&self, model: &str, settings: &ModelSettings, activation: Activation) -> Result<ActivationReport, EndpointError> {
        match self.load_and_swap(model, settings, &activation.version_id).await {
            Ok(mut report) => {
                report.previous_version = activation.previous.clone();
                report.changed = activation.changed;
                GATEWAY_METRICS.activations_total.with_label_values(&[model, "ok"]).inc();
                Ok(report)
            }
            Err(e) => {
                if let Err(revert) = self.registry.revert(&activation) {
                    error!(%model, error=%revert, "failed to revert registry after aborted activation");
                }
                GATEWAY_METRICS.activations_total.with_label_values(&[model, "aborted"]).inc();
                warn!(%model, version=%activation.version_id.short(), error=%e, "activation aborted; previous version kept");
                Err(e)
            }
        }
    }

    async fn load_and_swap(&self, model: &str, settings: &ModelSettings, version_id: &VersionId) -> Result<ActivationReport, EndpointError> {
        let id = EndpointId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let endpoint = Arc::new(Endpoint::new(id, self.config.endpoint_name(model), model, version_id.clone(), settings.max_concurrency));
        self.table.insert(endpoint.clone());
        let previous = self.table.route(model)
            .and_then(|pid| self.table.get(pid))
            .filter(|p| p.state() == EndpointState::Ready);
        if previous.is_none() {
            // nothing is serving: expose the loading endpoint so callers see ModelUnavailable
            self.table.swap_route(model, id);
        }
        info!(%model, version=%version_id.short(), endpoint=%id, "endpoint loading");

        if let Err(reason) = self.load(&endpoint, settings).await {
            endpoint.transition(EndpointState::Terminated);
            self.table.remove(id);
            error!(%model, version=%version_id.short(), endpoint=%id, %reason, "endpoint load failed");
            return Err(EndpointError::Load { model: model.into(), version: version_id.clone(), reason });
        }

        self.table.swap_route(model, id);
        info!(%model, version=%version_id.short(), endpoint=%id, "route switched");

        let replaced = previous.map(|old| {
            let old_id = old.id();
            self.begin_drain(old, settings.drain_timeout());
            old_id
        });
        Ok(ActivationReport {
            model: model.into(),
            version_id: version_id.clone(),
            previous_version: None,
            endpoint: id,
            endpoint_name: endpoint.name().into(),
            replaced,
            changed: true,
        })
    }

    async fn load(&self, endpoint: &Arc<Endpoint>, settings: &ModelSettings) -> Result<(), String> {
        let version_id = endpoint.version_id().clone();
        self.store.pin_existing(&version_id).map_err(|e| e.to_string())?;
        let store = self.store.clone();
        let fetch_id = version_id.clone();
        let fetched = tokio::task::spawn_blocking(move || store.fetch(&fetch_id)).await;
        let artifact = match fetched {
            Ok(Ok(a)) => a,
            Ok(Err(e)) => { self.store.unpin(&version_id); return Err(e.to_string()); }
            Err(e) => { self.store.unpin(&version_id); return Err(format!("fetch task failed: {e}")); }
        };
        if artifact.model_name != endpoint.model_name() {
            self.store.unpin(&version_id);
            return Err(format!("artifact belongs to model {}", artifact.model_name));
        }
        let provisioned = match self.provisioner.start(&artifact, settings).await {
            Ok(p) => p,
            Err(e) => { self.store.unpin(&version_id); return Err(e.to_string()); }
        };
        if !self.provisioner.health(provisioned.handle).await {
            self.provisioner.stop(provisioned.handle).await;
            self.store.unpin(&version_id);
            return Err("health check failed after start".into());
        }
        endpoint.mark_ready(provisioned.adapter, provisioned.handle);
        Ok(())
    }

    fn begin_drain(&self, endpoint: Arc<Endpoint>, timeout: Duration) {
        if !endpoint.start_draining() {
            debug!(endpoint=%endpoint.id(), state=?endpoint.state(), "drain already handled");
            return;
        }
        info!(endpoint=%endpoint.id(), model=%endpoint.model_name(), in_flight=endpoint.in_flight(), "endpoint draining");
        let task = tokio::spawn(drain(endpoint, self.provisioner.clone(), self.store.clone(), self.table.clone(), timeout));
        let mut drains = self.drains.lock();
        drains.retain(|h| !h.is_finished());
        drains.push(task);
    }

    /// Drains every endpoint still receiving traffic and waits for all drains to finish.
    ///
    /// Holds every model's activation lock while draining starts, so an activation
    /// that is mid-load completes first and its endpoint is drained with the rest.
    pub async fn shutdown(&self) {
        let mut held = Vec::new();
        for model in self.config.models.keys() {
            let lock = self.lock_for(model);
            held.push(lock.lock_owned().await);
        }
        for endpoint in self.table.live() {
            if endpoint.state() == EndpointState::Ready {
                let timeout = self.config.model(endpoint.model_name()).map(|s| s.drain_timeout()).unwrap_or(Duration::from_secs(30));
                self.begin_drain(endpoint, timeout);
            }
        }
        drop(held);
        let pending: Vec<_> = std::mem::take(&mut *self.drains.lock());
        for task in pending {
            if let Err(e) = task.await { error!(error=%e, "drain task failed"); }
        }
        info!("all endpoints terminated");
    }
}

async fn drain(endpoint: Arc<Endpoint>, provisioner: Arc<dyn Provisioner>, store: ArtifactStore, table: Arc<EndpointTable>, timeout: Duration) {
    if tokio::time::timeout(timeout, endpoint.wait_idle()).await.is_err() {
        let err = EndpointError::DrainTimeout {
            id: endpoint.id(),
            model: endpoint.model_name().into(),
            in_flight: endpoint.in_flight(),
            timeout_ms: timeout.as_millis() as u64,
        };
        GATEWAY_METRICS.drain_timeouts_total.with_label_values(&[endpoint.model_name()]).inc();
        warn!(kind=%err.kind(), error=%err, "forcing termination");
    }
    let handle = endpoint.handle.lock().take();
    if let Some(handle) = handle { provisioner.stop(handle).await; }
    store.unpin(endpoint.version_id());
    table.remove(endpoint.id());
    endpoint.transition(EndpointState::Terminated);
    info!(endpoint=%endpoint.id(), model=%endpoint.model_name(), version=%endpoint.version_id().short(), "endpoint terminated");
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::adapter::tests::{artifact, sample_state};
    use crate::adapter::AdapterKind;

    pub(crate) fn ready_endpoint(id: u64, model: &str) -> Arc<Endpoint> {
        let art = artifact(model, AdapterKind::Event, &sample_state("x", 5.0));
        let ep = Arc::new(Endpoint::new(EndpointId(id), format!("{model}-ep"), model, art.version_id.clone(), 2));
        ep.mark_ready(Arc::new(AdapterKind::Event.load(&art).unwrap()), ProvisionHandle(id));
        ep
    }

    #[test]
    fn admission_follows_state() {
        let art = artifact("event", AdapterKind::Event, &sample_state("x", 5.0));
        let ep = Arc::new(Endpoint::new(EndpointId(1), "e".into(), "event", art.version_id.clone(), 1));
        assert!(ep.try_acquire().is_none());
        ep.mark_ready(Arc::new(AdapterKind::Event.load(&art).unwrap()), ProvisionHandle(1));
        let guard = ep.try_acquire().unwrap();
        assert_eq!(ep.in_flight(), 1);
        ep.transition(EndpointState::Draining);
        assert!(ep.try_acquire().is_none());
        drop(guard);
        assert_eq!(ep.in_flight(), 0);
    }

    #[tokio::test]
    async fn wait_idle_wakes_when_last_call_finishes() {
        let ep = ready_endpoint(7, "event");
        let g1 = ep.try_acquire().unwrap();
        let g2 = ep.try_acquire().unwrap();
        let waiter = {
            let ep = ep.clone();
            tokio::spawn(async move { ep.wait_idle().await })
        };
        tokio::task::yield_now().await;
        drop(g1);
        assert!(!waiter.is_finished());
        drop(g2);
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
    }

    #[test]
    fn routes_swap_atomically() {
        let table = EndpointTable::default();
        assert!(table.route("event").is_none());
        let a = ready_endpoint(1, "event");
        let b = ready_endpoint(2, "event");
        table.insert(a.clone());
        table.insert(b.clone());
        table.swap_route("event", a.id());
        table.swap_route("custom", b.id());
        assert_eq!(table.route("event"), Some(a.id()));
        table.swap_route("event", b.id());
        assert_eq!(table.route("event"), Some(b.id()));
        assert_eq!(table.route("custom"), Some(b.id()));
        table.remove(a.id());
        assert!(table.get(a.id()).is_none());
        assert_eq!(table.live().len(), 1);
    }

    #[test]
    fn watch_reports_transitions() {
        let ep = ready_endpoint(3, "custom");
        let rx = ep.watch();
        assert_eq!(*rx.borrow(), EndpointState::Ready);
        ep.transition(EndpointState::Terminated);
        assert_eq!(*rx.borrow(), EndpointState::Terminated);
    }

    #[test]
    fn terminated_is_final_and_draining_starts_once() {
        let ep = ready_endpoint(4, "event");
        let rx = ep.watch();
        assert!(ep.start_draining());
        assert!(!ep.start_draining());
        assert!(ep.transition(EndpointState::Terminated));
        assert!(!ep.transition(EndpointState::Draining));
        assert!(!ep.transition(EndpointState::Ready));
        assert!(!ep.start_draining());
        assert_eq!(ep.state(), EndpointState::Terminated);
        assert_eq!(*rx.borrow(), EndpointState::Terminated);
    }

    #[test]
    fn drain_timeout_kind() {
        let err = EndpointError::DrainTimeout { id: EndpointId(1), model: "event".into(), in_flight: 2, timeout_ms: 10 };
        assert_eq!(err.kind(), ErrorKind::DrainTimeout);
        assert!(err.to_string().contains("ep-1"));
    }
}
