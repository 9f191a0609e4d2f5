#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Semaphore;

use inference_gateway::adapter::{ForestState, Node};
use inference_gateway::{
    AdapterError, AdapterKind, Artifact, Gateway, GatewayConfig, LocalProvisioner, ModelSettings,
    Predict, ProvisionHandle, Provisioned, Provisioner, VersionId,
};

/// Blocks adapter calls on the blocking pool until opened.
#[derive(Default)]
pub struct Latch {
    open: Mutex<bool>,
    cv: Condvar,
    pub entered: AtomicUsize,
}

impl Latch {
    pub fn open(&self) {
        *self.open.lock().unwrap() = true;
        self.cv.notify_all();
    }

    fn wait(&self) {
        self.entered.fetch_add(1, Ordering::SeqCst);
        let mut open = self.open.lock().unwrap();
        while !*open { open = self.cv.wait(open).unwrap(); }
    }
}

struct LatchedAdapter {
    inner: Arc<dyn Predict>,
    latch: Arc<Latch>,
}

impl Predict for LatchedAdapter {
    fn predict(&self, input: &Value) -> Result<Value, AdapterError> {
        self.latch.wait();
        self.inner.predict(input)
    }

    fn explain(&self, input: &Value) -> Result<Value, AdapterError> { self.inner.explain(input) }
}

/// Wraps the local provisioner with a load gate, an injectable failure and an optional
/// latch in front of every prediction.
pub struct TestProvisioner {
    inner: LocalProvisioner,
    gate: Option<Arc<Semaphore>>,
    latch: Option<Arc<Latch>>,
    fail_next: AtomicBool,
    pub starts: AtomicUsize,
}

impl TestProvisioner {
    fn build(gate: Option<Arc<Semaphore>>, latch: Option<Arc<Latch>>) -> Arc<Self> {
        Arc::new(Self { inner: LocalProvisioner::new(), gate, latch, fail_next: AtomicBool::new(false), starts: AtomicUsize::new(0) })
    }

    pub fn open() -> Arc<Self> { Self::build(None, None) }

    /// Every load waits for one permit on the returned semaphore.
    pub fn gated() -> (Arc<Self>, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        (Self::build(Some(gate.clone()), None), gate)
    }

    /// Every prediction blocks until the returned latch is opened.
    pub fn latched() -> (Arc<Self>, Arc<Latch>) {
        let latch = Arc::new(Latch::default());
        (Self::build(None, Some(latch.clone())), latch)
    }

    pub fn fail_next(&self) { self.fail_next.store(true, Ordering::SeqCst); }
    pub fn live(&self) -> usize { self.inner.live_count() }
}

#[async_trait]
impl Provisioner for TestProvisioner {
    async fn start(&self, artifact: &Artifact, settings: &ModelSettings) -> Result<Provisioned, AdapterError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.acquire().await.map_err(|e| AdapterError::Load(e.to_string()))?.forget();
        }
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(AdapterError::Load("injected provisioning failure".into()));
        }
        let mut provisioned = self.inner.start(artifact, settings).await?;
        if let Some(latch) = &self.latch {
            let latched: Arc<dyn Predict> = Arc::new(LatchedAdapter { inner: provisioned.adapter, latch: latch.clone() });
            provisioned.adapter = latched;
        }
        Ok(provisioned)
    }

    async fn stop(&self, handle: ProvisionHandle) { self.inner.stop(handle).await }
    async fn health(&self, handle: ProvisionHandle) -> bool { self.inner.health(handle).await }
}

/// One-feature forest over `x`; inputs below `threshold` are isolated after a single split.
pub fn forest(threshold: f64) -> ForestState {
    ForestState {
        features: vec!["x".into()],
        sample_size: 16,
        trees: vec![
            vec![
                Node::Split { feature: 0, threshold, left: 1, right: 2 },
                Node::Leaf { size: 1 },
                Node::Leaf { size: 15 },
            ],
            vec![
                Node::Split { feature: 0, threshold: threshold * 2.0, left: 1, right: 2 },
                Node::Leaf { size: 3 },
                Node::Leaf { size: 13 },
            ],
        ],
        fitted_scores: vec![-0.15, -0.1, -0.05, 0.0, 0.05, 0.1],
    }
}

pub fn config() -> GatewayConfig {
    let mut cfg = GatewayConfig::default();
    for settings in cfg.models.values_mut() {
        settings.timeout_ms = 1_000;
        settings.drain_timeout_ms = 2_000;
    }
    cfg
}

pub fn gateway_with(cfg: GatewayConfig, provisioner: Arc<TestProvisioner>) -> Gateway {
    Gateway::in_memory(Arc::new(cfg), provisioner).expect("gateway")
}

pub fn publish(gw: &Gateway, model: &str, threshold: f64) -> VersionId {
    let kind = AdapterKind::from_model_name(model).expect("known model");
    let bytes = serde_json::to_vec(&forest(threshold)).expect("encode");
    gw.store.publish(model, &bytes, kind.code_ref()).expect("publish").version_id
}
