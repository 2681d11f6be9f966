//! Liveness probe: `GET /healthz`

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use twincdc_shared::{HealthAggregator, HealthReport, ShutdownCoordinator};

pub fn router(aggregator: Arc<HealthAggregator>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .with_state(aggregator)
}

/// 200 while healthy or degraded, 503 once any check is unhealthy.
async fn healthz(State(aggregator): State<Arc<HealthAggregator>>) -> (StatusCode, Json<HealthReport>) {
    let report = aggregator.report();
    let code = if report.status == "unhealthy" {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (code, Json(report))
}

pub async fn serve(bind_address: &str, aggregator: Arc<HealthAggregator>, shutdown: ShutdownCoordinator) -> anyhow::Result<()> {
    let addr: SocketAddr = bind_address.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "Health endpoint listening");

    axum::serve(listener, router(aggregator))
        .with_graceful_shutdown(async move { shutdown.wait_for_shutdown().await })
        .await?;
    Ok(())
}
