use crate::config::HealthConfig;
use crate::log_aggregator::LogAggregatorService;
use crate::request_context::RequestContext;
use anyhow::{Context, Result};
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Bound on the storage round trip behind `/ready`
const READINESS_TIMEOUT: Duration = Duration::from_secs(2);

/// State shared by the probe handlers
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<LogAggregatorService>,
    pub service_name: String,
}

/// Create the probe router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Liveness: the process is up and serving HTTP
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": state.service_name,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Readiness: the storage backend answers a round trip
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let ctx = RequestContext::with_timeout(READINESS_TIMEOUT);

    match state.service.health_check(&ctx).await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "storage": state.service.backend_name(),
            })),
        ),
        Err(e) => {
            warn!(error = %e, "Readiness check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({
                    "status": "not_ready",
                    "storage": state.service.backend_name(),
                    "error": e.to_string(),
                })),
            )
        }
    }
}

/// Serve the probe endpoints until `shutdown` fires
pub async fn start_health_server(
    state: AppState,
    config: &HealthConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let router = create_router(state);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting health probe server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind health probe address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("Health probe server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::MemoryLogStore;

    async fn state() -> AppState {
        let service = LogAggregatorService::new(Box::new(MemoryLogStore::new()), Duration::from_secs(5))
            .await
            .unwrap();
        AppState {
            service: Arc::new(service),
            service_name: "loghaven-aggregator".to_string(),
        }
    }

    #[tokio::test]
    async fn test_ready_when_storage_healthy() {
        let response = readiness_check(State(state().await)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_not_ready_after_close() {
        let state = state().await;
        state.service.close().await.unwrap();

        let response = readiness_check(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_health_always_ok() {
        let state = state().await;
        state.service.close().await.unwrap();

        let response = health_check(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
