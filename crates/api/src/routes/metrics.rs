//! Prometheus metrics endpoint.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use metrics::{Unit, describe_counter, describe_histogram};
use metrics_exporter_prometheus::PrometheusHandle;

/// Registers help text for the saga and resilience metrics.
pub fn describe() {
    describe_counter!("saga_executions_total", "Sagas started, by template");
    describe_counter!("saga_completed", "Sagas that finished with every step successful");
    describe_counter!("saga_failed", "Sagas that failed and were fully compensated");
    describe_counter!(
        "saga_partially_completed",
        "Sagas whose compensation did not fully succeed"
    );
    describe_counter!("saga_compensations_total", "Compensation calls, by outcome");
    describe_counter!(
        "resilience_fallbacks_total",
        "Steps recovered by a fallback, by mechanism"
    );
    describe_counter!("circuit_breaker_transitions_total", "Circuit state changes");
    describe_counter!("circuit_breaker_rejections_total", "Calls refused by a circuit");
    describe_histogram!("saga_duration_seconds", Unit::Seconds, "Wall time per saga");
    describe_histogram!(
        "saga_step_duration_seconds",
        Unit::Seconds,
        "Wall time per step, by service"
    );
}

/// GET /metrics: returns Prometheus-formatted metrics.
pub async fn get(State(handle): State<PrometheusHandle>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        handle.render(),
    )
}
