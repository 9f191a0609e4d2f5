use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use anomaly_core::{clear_ready, init_metrics, init_tracing, mark_ready, start_health_server};
use inference_gateway::{api, GatewayConfig, Gateway, LocalProvisioner};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("inference-gateway")?;
    init_metrics()?;

    let cfg = Arc::new(GatewayConfig::load()?);
    info!(target: "inference-gateway", models=?cfg.models.keys().collect::<Vec<_>>(), store=%cfg.store_path.display(), "config loaded");

    start_health_server(cfg.health_port).await?;

    let gateway = Arc::new(Gateway::open(cfg.clone(), Arc::new(LocalProvisioner::new()))?);
    gateway.bootstrap().await;
    mark_ready();

    let addr = SocketAddr::from(([0,0,0,0], cfg.http_port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(target: "inference-gateway", ?addr, "service ready");
    axum::serve(listener, api::router(gateway.clone()))
        .with_graceful_shutdown(async { let _ = tokio::signal::ctrl_c().await; })
        .await?;

    clear_ready();
    gateway.manager.shutdown().await;
    info!(target: "inference-gateway", "shutdown");
    Ok(())
}
