//! Saga submission and inspection endpoints.

use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use common::SagaId;
use saga::{
    SagaEventRecord, SagaInput, SagaOrchestrator, SagaSnapshot, SagaStatus, SagaSummary,
    SagaTemplate,
};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub orchestrator: SagaOrchestrator,
}

// -- Request types --

#[derive(Deserialize)]
pub struct EntryRequest {
    #[serde(default)]
    pub license_plate: String,
    pub user_id: Option<String>,
    pub entry_timestamp: Option<DateTime<Utc>>,
    pub is_favorite: Option<bool>,
}

#[derive(Deserialize)]
pub struct ExitRequest {
    #[serde(default)]
    pub license_plate: String,
    pub user_id: Option<String>,
}

#[derive(Deserialize)]
pub struct PaymentRequest {
    #[serde(default)]
    pub license_plate: String,
    pub user_id: Option<String>,
    pub payment_method: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CleanupParams {
    pub max_age_hours: Option<u64>,
}

// -- Response types --

#[derive(Serialize)]
pub struct SubmitResponse {
    pub saga_id: String,
    pub status: SagaStatus,
    pub message: String,
}

#[derive(Serialize)]
pub struct SagaListResponse {
    pub sagas: Vec<SagaSummary>,
    pub total: usize,
}

#[derive(Serialize)]
pub struct CleanupResponse {
    pub removed_count: usize,
}

// -- Handlers --

/// POST /sagas/entry: start a vehicle entry saga.
#[tracing::instrument(skip(state, req))]
pub async fn entry(
    State(state): State<Arc<AppState>>,
    Json(req): Json<EntryRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let input = SagaInput {
        license_plate: req.license_plate,
        user_id: req.user_id,
        entry_timestamp: req.entry_timestamp,
        is_favorite: req.is_favorite,
        ..SagaInput::default()
    };
    submit(&state, SagaTemplate::VehicleEntry, input).await
}

/// POST /sagas/exit: start a vehicle exit saga.
#[tracing::instrument(skip(state, req))]
pub async fn exit(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ExitRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let input = SagaInput {
        license_plate: req.license_plate,
        user_id: req.user_id,
        ..SagaInput::default()
    };
    submit(&state, SagaTemplate::VehicleExit, input).await
}

/// POST /sagas/payment: start a parking payment saga.
#[tracing::instrument(skip(state, req))]
pub async fn payment(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PaymentRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let input = SagaInput {
        license_plate: req.license_plate,
        user_id: req.user_id,
        payment_method: req.payment_method,
        ..SagaInput::default()
    };
    submit(&state, SagaTemplate::Payment, input).await
}

async fn submit(
    state: &AppState,
    template: SagaTemplate,
    input: SagaInput,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let saga_id = state.orchestrator.submit(template, input).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            saga_id: saga_id.to_string(),
            status: SagaStatus::InProgress,
            message: format!("{} saga started", template.label()),
        }),
    ))
}

/// GET /sagas: list every retained saga.
#[tracing::instrument(skip(state))]
pub async fn list(State(state): State<Arc<AppState>>) -> Json<SagaListResponse> {
    let sagas = state.orchestrator.list().await;
    Json(SagaListResponse {
        total: sagas.len(),
        sagas,
    })
}

/// GET /sagas/{id}: current snapshot of a saga.
#[tracing::instrument(skip(state))]
pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SagaSnapshot>, ApiError> {
    let saga_id = parse_saga_id(&id)?;
    Ok(Json(state.orchestrator.status(saga_id).await?))
}

/// GET /sagas/{id}/events: event history of a saga.
#[tracing::instrument(skip(state))]
pub async fn events(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<SagaEventRecord>>, ApiError> {
    let saga_id = parse_saga_id(&id)?;
    Ok(Json(state.orchestrator.history(saga_id).await?))
}

/// POST /sagas/cleanup: drop finished sagas older than `max_age_hours`.
#[tracing::instrument(skip(state))]
pub async fn cleanup(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CleanupParams>,
) -> Json<CleanupResponse> {
    let removed_count = match params.max_age_hours {
        Some(hours) => {
            state
                .orchestrator
                .cleanup(Duration::from_secs(hours.saturating_mul(3600)))
                .await
        }
        None => state.orchestrator.cleanup_default().await,
    };
    Json(CleanupResponse { removed_count })
}

fn parse_saga_id(id: &str) -> Result<SagaId, ApiError> {
    id.parse()
        .map_err(|e| ApiError::BadRequest(format!("Invalid ID format: {e}")))
}
