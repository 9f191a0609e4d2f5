mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use inference_gateway::{EndpointState, ErrorKind, PredictionRequest};
use serde_json::json;

async fn wait_terminated(rx: Option<tokio::sync::watch::Receiver<EndpointState>>) {
    let Some(mut rx) = rx else { return };
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == EndpointState::Terminated))
        .await
        .expect("endpoint terminated in time")
        .expect("state channel open");
}

#[tokio::test]
async fn last_successful_activation_wins() {
    let provisioner = TestProvisioner::open();
    let gw = gateway_with(config(), provisioner.clone());
    let v1 = publish(&gw, "event", 1.0);
    let v2 = publish(&gw, "event", 2.0);
    let v3 = publish(&gw, "event", 3.0);

    gw.manager.activate("event", &v1).await.unwrap();
    gw.manager.activate("event", &v2).await.unwrap();
    provisioner.fail_next();
    let err = gw.manager.activate("event", &v3).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LoadError);
    provisioner.fail_next();
    let err = gw.manager.activate("event", &v1).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LoadError);

    assert_eq!(gw.registry.current("event").unwrap(), v2);
    let entry = gw.registry.entry("event").unwrap();
    assert_eq!(entry.history.len(), 1);
    assert_eq!(gw.manager.serving("event").unwrap().version_id(), &v2);
}

#[tokio::test]
async fn failed_first_load_leaves_model_unavailable() {
    let provisioner = TestProvisioner::open();
    let gw = gateway_with(config(), provisioner.clone());
    let bad = publish(&gw, "custom", 3.0);
    provisioner.fail_next();
    let err = gw.manager.activate("custom", &bad).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LoadError);
    assert_eq!(gw.registry.current("custom").unwrap_err().kind(), ErrorKind::UnknownModel);
    let err = gw.dispatcher.handle(PredictionRequest::new("custom", json!({"x": 1}))).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ModelUnavailable);
    // the registry no longer references the failed version
    gw.store.delete(&bad).unwrap();
}

#[tokio::test]
async fn unknown_artifact_and_model_rejected() {
    let gw = gateway_with(config(), TestProvisioner::open());
    let v1 = publish(&gw, "event", 1.0);
    let err = gw.manager.activate("fraud", &v1).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnknownModel);
    let err = gw.manager.activate("event", &inference_gateway::VersionId::new("feed")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnknownArtifact);
}

#[tokio::test]
async fn replaced_endpoint_drains_then_terminates() {
    let provisioner = TestProvisioner::open();
    let gw = gateway_with(config(), provisioner.clone());
    let v1 = publish(&gw, "event", 1.0);
    let v2 = publish(&gw, "event", 2.0);
    let first = gw.manager.activate("event", &v1).await.unwrap();
    let old = gw.manager.serving("event").unwrap();
    let in_flight = old.try_acquire().unwrap();

    let second = gw.manager.activate("event", &v2).await.unwrap();
    assert_eq!(second.replaced, Some(first.endpoint));
    assert_eq!(second.previous_version, Some(v1.clone()));
    assert_eq!(gw.manager.endpoint_state(first.endpoint), EndpointState::Draining);
    assert!(old.try_acquire().is_none());
    // v1 is still pinned by the draining endpoint and the registry history
    assert_eq!(gw.store.delete(&v1).unwrap_err().kind(), ErrorKind::InUse);

    let rx = gw.manager.watch_state(first.endpoint);
    drop(in_flight);
    wait_terminated(rx).await;
    assert_eq!(gw.manager.endpoint_state(first.endpoint), EndpointState::Terminated);
    assert_eq!(provisioner.live(), 1);
    assert_eq!(gw.store.pin_count(&v1), 1);
}

#[tokio::test]
async fn drain_timeout_forces_termination() {
    let mut cfg = config();
    cfg.models.get_mut("event").unwrap().drain_timeout_ms = 50;
    let provisioner = TestProvisioner::open();
    let gw = gateway_with(cfg, provisioner.clone());
    let v1 = publish(&gw, "event", 1.0);
    let v2 = publish(&gw, "event", 2.0);
    let first = gw.manager.activate("event", &v1).await.unwrap();
    let stuck = gw.manager.serving("event").unwrap().try_acquire().unwrap();
    let rx = gw.manager.watch_state(first.endpoint);
    gw.manager.activate("event", &v2).await.unwrap();
    wait_terminated(rx).await;
    assert_eq!(provisioner.live(), 1);
    drop(stuck);
}

#[tokio::test]
async fn rollback_reloads_previous_version() {
    let gw = gateway_with(config(), TestProvisioner::open());
    let versions: Vec<_> = [1.0, 2.0, 3.0].iter().map(|t| publish(&gw, "custom", *t)).collect();
    for v in &versions { gw.manager.activate("custom", v).await.unwrap(); }
    let report = gw.manager.rollback("custom").await.unwrap();
    assert_eq!(report.version_id, versions[1]);
    assert_eq!(gw.manager.serving("custom").unwrap().version_id(), &versions[1]);
    let res = gw.dispatcher.handle(PredictionRequest::new("custom", json!({"x": 0.5}))).await.unwrap();
    assert_eq!(res.version, versions[1]);

    gw.manager.rollback("custom").await.unwrap();
    let err = gw.manager.rollback("custom").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoHistory);
    assert_eq!(gw.registry.current("custom").unwrap(), versions[0]);
}

#[tokio::test]
async fn failed_rollback_keeps_current_version() {
    let provisioner = TestProvisioner::open();
    let gw = gateway_with(config(), provisioner.clone());
    let v1 = publish(&gw, "event", 1.0);
    let v2 = publish(&gw, "event", 2.0);
    gw.manager.activate("event", &v1).await.unwrap();
    gw.manager.activate("event", &v2).await.unwrap();
    provisioner.fail_next();
    assert_eq!(gw.manager.rollback("event").await.unwrap_err().kind(), ErrorKind::LoadError);
    assert_eq!(gw.registry.current("event").unwrap(), v2);
    assert_eq!(gw.registry.entry("event").unwrap().history.len(), 1);
    assert_eq!(gw.manager.rollback("event").await.unwrap().version_id, v1);
}

#[tokio::test]
async fn reactivating_serving_version_skips_reload() {
    let provisioner = TestProvisioner::open();
    let gw = gateway_with(config(), provisioner.clone());
    let v1 = publish(&gw, "event", 1.0);
    let first = gw.manager.activate("event", &v1).await.unwrap();
    let again = gw.manager.activate("event", &v1).await.unwrap();
    assert!(!again.changed);
    assert_eq!(again.endpoint, first.endpoint);
    assert_eq!(provisioner.starts.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_activations_settle_on_a_committed_version() {
    let gw = std::sync::Arc::new(gateway_with(config(), TestProvisioner::open()));
    let versions: Vec<_> = (1..=6).map(|t| publish(&gw, "event", t as f64)).collect();
    let tasks: Vec<_> = versions.iter().cloned().map(|v| {
        let gw = gw.clone();
        tokio::spawn(async move { gw.manager.activate("event", &v).await })
    }).collect();
    for t in tasks { t.await.unwrap().unwrap(); }
    let current = gw.registry.current("event").unwrap();
    assert_eq!(gw.manager.serving("event").unwrap().version_id(), &current);
    assert_eq!(gw.registry.entry("event").unwrap().history.len(), 5);
}

#[tokio::test]
async fn resume_restores_endpoints_from_registry() {
    let gw = gateway_with(config(), TestProvisioner::open());
    let v1 = publish(&gw, "event", 1.0);
    gw.registry.activate("event", &v1).unwrap();
    assert!(gw.manager.serving("event").is_none());
    assert_eq!(gw.manager.resume().await, 1);
    assert_eq!(gw.manager.serving("event").unwrap().version_id(), &v1);
    assert_eq!(gw.manager.resume().await, 0);
}

#[tokio::test]
async fn shutdown_terminates_everything() {
    let provisioner = TestProvisioner::open();
    let gw = gateway_with(config(), provisioner.clone());
    let e = publish(&gw, "event", 1.0);
    let c = publish(&gw, "custom", 1.0);
    gw.manager.activate("event", &e).await.unwrap();
    gw.manager.activate("custom", &c).await.unwrap();
    gw.manager.shutdown().await;
    assert_eq!(provisioner.live(), 0);
    assert!(gw.manager.serving("event").is_none());
    let err = gw.dispatcher.handle(PredictionRequest::new("event", json!({"x": 1}))).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ModelUnavailable);
}

#[tokio::test]
async fn bootstrap_publishes_and_activates_bundles() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("event.json");
    let bytes = serde_json::to_vec(&forest(3.0)).unwrap();
    let bundle = inference_gateway::ArtifactBundle::new("event", "event_inference.py", &bytes);
    std::fs::write(&path, serde_json::to_vec(&bundle).unwrap()).unwrap();
    let mut cfg = config();
    cfg.bootstrap.insert("event".into(), path);
    cfg.bootstrap.insert("custom".into(), dir.path().join("missing.json"));

    let gw = gateway_with(cfg, TestProvisioner::open());
    gw.bootstrap().await;
    let serving = gw.manager.serving("event").expect("event bootstrapped");
    assert_eq!(gw.registry.current("event").unwrap(), *serving.version_id());
    assert!(gw.manager.serving("custom").is_none());

    // a second bootstrap is idempotent
    gw.bootstrap().await;
    assert_eq!(gw.manager.serving("event").unwrap().id(), serving.id());
}

#[tokio::test]
async fn shutdown_waits_for_activation_in_progress() {
    let (provisioner, gate) = TestProvisioner::gated();
    let gw = Arc::new(gateway_with(config(), provisioner.clone()));
    let v1 = publish(&gw, "event", 1.0);
    let v2 = publish(&gw, "event", 2.0);
    gate.add_permits(1);
    gw.manager.activate("event", &v1).await.unwrap();

    let activation = {
        let gw = gw.clone();
        let v2 = v2.clone();
        tokio::spawn(async move { gw.manager.activate("event", &v2).await })
    };
    tokio::time::timeout(Duration::from_secs(5), async {
        while provisioner.starts.load(Ordering::SeqCst) < 2 { tokio::time::sleep(Duration::from_millis(2)).await; }
    })
    .await
    .expect("second load started");

    let shutdown = {
        let gw = gw.clone();
        tokio::spawn(async move { gw.manager.shutdown().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!shutdown.is_finished());

    gate.add_permits(1);
    activation.await.unwrap().unwrap();
    tokio::time::timeout(Duration::from_secs(5), shutdown).await.expect("shutdown finished").unwrap();

    assert_eq!(provisioner.live(), 0);
    assert!(gw.manager.serving("event").is_none());
    // v1 is still in history and v2 still active, each pinned exactly once by the registry
    assert_eq!(gw.registry.entry("event").unwrap().history.len(), 1);
    assert_eq!(gw.store.pin_count(&v1), 1);
    assert_eq!(gw.store.pin_count(&v2), 1);
    assert_eq!(gw.store.delete(&v1).unwrap_err().kind(), ErrorKind::InUse);
}
