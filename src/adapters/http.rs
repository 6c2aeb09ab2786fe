use anyhow::bail;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tracing::{info, warn};
use crate::domain::{HealthReport, PersistenceError, RecordQuery, RecordedDevice, SensorRecord, StoreStats};
use crate::service::{DeviceStatus, StatusSurface};

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

pub fn router(status: StatusSurface) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/devices", get(devices))
        .route("/api/devices", get(recorded_devices))
        .route("/api/devices/:device_id/data", get(device_data))
        .route("/api/stats", get(stats))
        .with_state(status)
}

/// Persistence failures as JSON `{"error": ...}`. A database that is down or
/// latched off answers 503; anything else is a 500.
struct ApiError(PersistenceError);

impl From<PersistenceError> for ApiError {
    fn from(error: PersistenceError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            PersistenceError::Unavailable
            | PersistenceError::Initialization(_)
            | PersistenceError::Timeout(_) => StatusCode::SERVICE_UNAVAILABLE,
            PersistenceError::Write(_) | PersistenceError::Query(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    limit: Option<i64>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    from: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    to: Option<OffsetDateTime>,
}

async fn health(State(status): State<StatusSurface>) -> Json<HealthReport> {
    Json(status.health())
}

async fn metrics(State(status): State<StatusSurface>) -> impl IntoResponse {
    ([(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)], status.metrics())
}

async fn devices(State(status): State<StatusSurface>) -> Json<Vec<DeviceStatus>> {
    Json(status.devices())
}

async fn recorded_devices(State(status): State<StatusSurface>) -> Result<Json<Vec<RecordedDevice>>, ApiError> {
    Ok(Json(status.recorded_devices().await?))
}

async fn device_data(
    State(status): State<StatusSurface>,
    Path(device_id): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Vec<SensorRecord>>, ApiError> {
    let query = RecordQuery::new(params.limit, params.from, params.to);
    Ok(Json(status.device_history(&device_id, &query).await?))
}

async fn stats(State(status): State<StatusSurface>) -> Result<Json<StoreStats>, ApiError> {
    Ok(Json(status.stored_stats().await?))
}

/// Bind `first_port`, falling back to the following ports when taken.
pub async fn bind_with_fallback(first_port: u16, attempts: u16) -> anyhow::Result<TcpListener> {
    for offset in 0..attempts {
        let Some(port) = first_port.checked_add(offset) else {
            break;
        };
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        match TcpListener::bind(addr).await {
            Ok(listener) => return Ok(listener),
            Err(e) => warn!(port, error = %e, "port unavailable, trying next"),
        }
    }
    bail!(
        "no free port for the HTTP server in {}..{}",
        first_port,
        first_port.saturating_add(attempts)
    )
}

pub async fn serve(
    listener: TcpListener,
    status: StatusSurface,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    info!(addr = %listener.local_addr()?, "health and metrics server listening");
    axum::serve(listener, router(status))
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("HTTP server stopped");
    Ok(())
}
