//! Saga lifecycle events.
//!
//! Every change to a saga record is expressed as one of these events and
//! applied through [`Saga::apply`](crate::saga::Saga::apply). The applied
//! events are kept on the record as its history.

use chrono::{DateTime, Utc};
use common::{Payload, SagaId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::state::SagaStatus;
use crate::step::FallbackMechanism;
use crate::templates::SagaTemplate;

/// Events that can occur during saga execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SagaEvent {
    /// The saga was materialized from a template.
    SagaStarted(SagaStartedData),

    /// A step began executing.
    StepStarted(StepRef),

    /// A step succeeded, possibly through a fallback strategy.
    StepSucceeded(StepSucceededData),

    /// A step's required input was absent; it counts as a success.
    StepSkipped(StepSkippedData),

    /// A field of a step's response was copied into a later step's request.
    DataPropagated(DataPropagatedData),

    /// A step failed after every configured strategy.
    StepFailed(StepFailedData),

    /// Reverse compensation began.
    CompensationStarted(CompensationStartedData),

    /// A compensating call succeeded.
    CompensationStepCompleted(CompensationStepData),

    /// A compensating call failed (recorded, compensation continues).
    CompensationStepFailed(CompensationStepFailedData),

    /// Every step succeeded.
    SagaCompleted(SagaCompletedData),

    /// The saga ended after a step failure and compensation.
    SagaFailed(SagaFailedData),
}

impl SagaEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            SagaEvent::SagaStarted(_) => "SagaStarted",
            SagaEvent::StepStarted(_) => "StepStarted",
            SagaEvent::StepSucceeded(_) => "StepSucceeded",
            SagaEvent::StepSkipped(_) => "StepSkipped",
            SagaEvent::DataPropagated(_) => "DataPropagated",
            SagaEvent::StepFailed(_) => "StepFailed",
            SagaEvent::CompensationStarted(_) => "CompensationStarted",
            SagaEvent::CompensationStepCompleted(_) => "CompensationStepCompleted",
            SagaEvent::CompensationStepFailed(_) => "CompensationStepFailed",
            SagaEvent::SagaCompleted(_) => "SagaCompleted",
            SagaEvent::SagaFailed(_) => "SagaFailed",
        }
    }
}

/// Data for SagaStarted event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaStartedData {
    pub saga_id: SagaId,
    pub template: SagaTemplate,
    pub description: String,
    pub step_count: usize,
    pub started_at: DateTime<Utc>,
}

/// Identifies a step by position and id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRef {
    pub step_index: usize,
    pub step_id: String,
}

/// Data for StepSucceeded event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSucceededData {
    pub step_index: usize,
    pub step_id: String,
    pub response: Payload,
    pub fallback_mechanism: Option<FallbackMechanism>,
    pub retry_attempts: u32,
    pub execution_time_ms: u64,
}

/// Data for StepSkipped event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSkippedData {
    pub step_index: usize,
    pub step_id: String,
    /// The request field whose absence caused the skip.
    pub missing_input: String,
}

/// Data for DataPropagated event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPropagatedData {
    pub from_step: usize,
    pub to_step: usize,
    pub field: String,
    pub value: Value,
}

/// Data for StepFailed event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFailedData {
    pub step_index: usize,
    pub step_id: String,
    pub error: String,
    pub retry_attempts: u32,
    pub execution_time_ms: u64,
}

/// Data for CompensationStarted event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationStartedData {
    /// Index of the step whose failure triggered compensation.
    pub failed_step: usize,
    /// Number of steps that will receive a compensating call.
    pub pending: usize,
}

/// Data for CompensationStepCompleted event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationStepData {
    pub step_index: usize,
    pub step_id: String,
    pub operation: String,
}

/// Data for CompensationStepFailed event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationStepFailedData {
    pub step_index: usize,
    pub step_id: String,
    pub operation: String,
    pub error: String,
}

/// Data for SagaCompleted event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaCompletedData {
    pub completed_at: DateTime<Utc>,
    pub total_execution_time_ms: u64,
}

/// Data for SagaFailed event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaFailedData {
    /// `failed` or `partially_completed`.
    pub status: SagaStatus,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
    pub total_execution_time_ms: u64,
}

/// An applied event with its position in the saga's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaEventRecord {
    pub sequence: u64,
    pub recorded_at: DateTime<Utc>,
    pub event_type: String,
    pub event: SagaEvent,
}

// Convenience constructors
impl SagaEvent {
    pub fn step_started(step_index: usize, step_id: impl Into<String>) -> Self {
        SagaEvent::StepStarted(StepRef {
            step_index,
            step_id: step_id.into(),
        })
    }

    pub fn step_skipped(
        step_index: usize,
        step_id: impl Into<String>,
        missing_input: impl Into<String>,
    ) -> Self {
        SagaEvent::StepSkipped(StepSkippedData {
            step_index,
            step_id: step_id.into(),
            missing_input: missing_input.into(),
        })
    }

    pub fn step_failed(
        step_index: usize,
        step_id: impl Into<String>,
        error: impl Into<String>,
        retry_attempts: u32,
        execution_time_ms: u64,
    ) -> Self {
        SagaEvent::StepFailed(StepFailedData {
            step_index,
            step_id: step_id.into(),
            error: error.into(),
            retry_attempts,
            execution_time_ms,
        })
    }

    pub fn compensation_started(failed_step: usize, pending: usize) -> Self {
        SagaEvent::CompensationStarted(CompensationStartedData {
            failed_step,
            pending,
        })
    }

    pub fn compensation_step_completed(
        step_index: usize,
        step_id: impl Into<String>,
        operation: impl Into<String>,
    ) -> Self {
        SagaEvent::CompensationStepCompleted(CompensationStepData {
            step_index,
            step_id: step_id.into(),
            operation: operation.into(),
        })
    }

    pub fn compensation_step_failed(
        step_index: usize,
        step_id: impl Into<String>,
        operation: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        SagaEvent::CompensationStepFailed(CompensationStepFailedData {
            step_index,
            step_id: step_id.into(),
            operation: operation.into(),
            error: error.into(),
        })
    }

    pub fn saga_completed(total_execution_time_ms: u64) -> Self {
        SagaEvent::SagaCompleted(SagaCompletedData {
            completed_at: Utc::now(),
            total_execution_time_ms,
        })
    }

    pub fn saga_failed(
        status: SagaStatus,
        reason: impl Into<String>,
        total_execution_time_ms: u64,
    ) -> Self {
        SagaEvent::SagaFailed(SagaFailedData {
            status,
            reason: reason.into(),
            failed_at: Utc::now(),
            total_execution_time_ms,
        })
    }
}
