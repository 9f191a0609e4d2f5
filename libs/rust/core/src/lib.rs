//! Core shared utilities for the anomaly-detection serving services.

use anyhow::Result;
use tracing::info;
use once_cell::sync::OnceCell;
use axum::{routing::get, Router};
use prometheus::{Encoder, TextEncoder};
use serde::de::DeserializeOwned;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod metrics;
pub use metrics::{GatewayMetrics, GATEWAY_METRICS};

static TRACING_INIT: OnceCell<()> = OnceCell::new();
static PROM_INIT: OnceCell<()> = OnceCell::new();
static NODE_LIVENESS: AtomicBool = AtomicBool::new(true);
static NODE_READINESS: AtomicBool = AtomicBool::new(false);

/// Env var naming an optional config file layered under the `ANOMALY__*` environment.
pub const CONFIG_FILE_ENV: &str = "ANOMALY_CONFIG_FILE";
pub const ENV_PREFIX: &str = "ANOMALY";

pub fn mark_ready() { NODE_READINESS.store(true, Ordering::SeqCst); }
pub fn clear_ready() { NODE_READINESS.store(false, Ordering::SeqCst); }
pub fn mark_not_live() { NODE_LIVENESS.store(false, Ordering::SeqCst); }
pub fn is_ready() -> bool { NODE_READINESS.load(Ordering::SeqCst) }
pub fn is_live() -> bool { NODE_LIVENESS.load(Ordering::SeqCst) }

pub fn init_tracing(service: &str) -> Result<()> {
    TRACING_INIT.get_or_try_init(|| -> Result<()> {
        let json = std::env::var("ANOMALY_JSON_LOG").ok().map(|v| v=="1" || v.eq_ignore_ascii_case("true")).unwrap_or(false);
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let registry = tracing_subscriber::registry().with(env_filter);
        if json {
            registry.with(tracing_subscriber::fmt::layer()
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_span_list(false))
                .try_init()?;
        } else {
            registry.with(tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_line_number(true))
                .try_init()?;
        }
        Ok(())
    })?;
    info!(target: "anomaly-core", service, "tracing initialized");
    Ok(())
}

/// Registers the gateway metric families in the default prometheus registry.
pub fn init_metrics() -> Result<()> {
    PROM_INIT.get_or_init(|| { once_cell::sync::Lazy::force(&GATEWAY_METRICS); });
    Ok(())
}

/// Layered config: `service_name` default, then the optional file from
/// `ANOMALY_CONFIG_FILE`, then `ANOMALY__SECTION__KEY` env vars.
/// Read once at startup; callers pass the result down explicitly.
pub fn load_config<T: DeserializeOwned>(service: &str) -> Result<T> {
    let file = std::env::var(CONFIG_FILE_ENV).ok();
    load_config_from(service, file.as_deref())
}

pub fn load_config_from<T: DeserializeOwned>(service: &str, file: Option<&str>) -> Result<T> {
    let mut builder = config::Config::builder()
        .set_default("service_name", service)?;
    if let Some(file) = file {
        builder = builder.add_source(config::File::with_name(file).required(false));
    }
    builder = builder.add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__").try_parsing(true));
    let cfg = builder.build()?;
    Ok(cfg.try_deserialize()?)
}

pub fn health_router() -> Router {
    Router::new()
        .route("/live", get(|| async { axum::Json(serde_json::json!({"live": is_live()})) }))
        .route("/ready", get(|| async { axum::Json(serde_json::json!({"ready": is_ready()})) }))
        .route("/status", get(|| async {
            axum::Json(serde_json::json!({
                "live": is_live(),
                "ready": is_ready(),
                "version": env!("CARGO_PKG_VERSION"),
            }))
        }))
        .route("/metrics", get(metrics_handler))
}

pub async fn start_health_server(port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0,0,0,0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(?addr, "Health server listening");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, health_router()).await {
            tracing::error!(error=?e, "Health server failed");
        }
    });
    Ok(())
}

type MetricsResponse = (axum::http::StatusCode, [(axum::http::header::HeaderName, &'static str); 1], Vec<u8>);

async fn metrics_handler() -> MetricsResponse {
    let content_type = axum::http::header::CONTENT_TYPE;
    if PROM_INIT.get().is_none() {
        return (axum::http::StatusCode::SERVICE_UNAVAILABLE, [(content_type, "text/plain")], b"metrics not initialized".to_vec());
    }
    let metric_families = prometheus::gather();
    let mut buf = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&metric_families, &mut buf) {
        return (axum::http::StatusCode::INTERNAL_SERVER_ERROR, [(content_type, "text/plain")], format!("encode error: {e}").into_bytes());
    }
    (axum::http::StatusCode::OK, [(content_type, "text/plain; version=0.0.4")], buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::io::Write;

    #[derive(Debug, Deserialize)]
    struct Sample { service_name: String, #[serde(default)] port: u16 }

    #[test]
    fn config_defaults_and_file() {
        let cfg: Sample = load_config_from("svc", None).unwrap();
        assert_eq!(cfg.service_name, "svc");

        let mut f = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(f, "port: 8181").unwrap();
        let path = f.path().to_str().unwrap().to_string();
        let cfg: Sample = load_config_from("svc", Some(&path)).unwrap();
        assert_eq!(cfg.port, 8181);
    }

    #[test]
    fn readiness_flags() {
        mark_ready();
        assert!(is_ready());
        clear_ready();
        assert!(!is_ready());
    }

    #[tokio::test]
    async fn metrics_exposed_after_init() {
        init_metrics().unwrap();
        GATEWAY_METRICS.requests_total.with_label_values(&["event", "ok"]).inc();
        let (status, _, body) = metrics_handler().await;
        assert_eq!(status, axum::http::StatusCode::OK);
        assert!(String::from_utf8(body).unwrap().contains("gateway_requests_total"));
    }
}
