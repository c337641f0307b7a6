//! Circuit breaker inspection endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use resilience::CircuitSnapshot;

use super::sagas::AppState;

/// GET /circuit-breakers: state of every service circuit seen so far.
pub async fn list(State(state): State<Arc<AppState>>) -> Json<Vec<CircuitSnapshot>> {
    Json(state.orchestrator.circuit_states())
}
