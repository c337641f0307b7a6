//! HTTP API server for the parking saga orchestrator.
//!
//! Provides REST endpoints to submit and inspect sagas, with structured
//! logging (tracing) and Prometheus metrics.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use saga::{SagaOrchestrator, ServiceTransport};
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use config::Config;
use routes::sagas::AppState;

/// Creates the Axum application router with all routes and shared state.
pub fn create_app(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .route("/sagas", get(routes::sagas::list))
        .route("/sagas/entry", post(routes::sagas::entry))
        .route("/sagas/exit", post(routes::sagas::exit))
        .route("/sagas/payment", post(routes::sagas::payment))
        .route("/sagas/cleanup", post(routes::sagas::cleanup))
        .route("/sagas/{id}", get(routes::sagas::get))
        .route("/sagas/{id}/events", get(routes::sagas::events))
        .route("/circuit-breakers", get(routes::circuits::list))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Creates the application state around a new orchestrator.
pub fn create_state(config: &Config, transport: Arc<dyn ServiceTransport>) -> Arc<AppState> {
    let orchestrator =
        SagaOrchestrator::new(config.orchestrator_config(), config.directory(), transport);
    Arc::new(AppState { orchestrator })
}

/// Periodically removes finished sagas older than the configured age.
pub fn spawn_cleanup(orchestrator: SagaOrchestrator, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let removed = orchestrator.cleanup_default().await;
            tracing::debug!(removed, "periodic saga cleanup");
        }
    })
}
