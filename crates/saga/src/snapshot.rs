//! Read-only copies of saga records handed to callers.

use chrono::{DateTime, Utc};
use common::{Payload, PayloadExt, SagaId};
use serde::Serialize;

use crate::saga::{Saga, SagaTelemetry};
use crate::state::{SagaStatus, StepStatus};
use crate::step::{FallbackMechanism, SagaStep};
use crate::templates::SagaTemplate;

/// A full, independent copy of a saga with secrets redacted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SagaSnapshot {
    pub saga_id: SagaId,
    pub template: SagaTemplate,
    pub description: String,
    pub license_plate: String,
    pub status: SagaStatus,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub current_step_index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub steps: Vec<StepSnapshot>,
    pub telemetry: SagaTelemetry,
}

impl SagaSnapshot {
    pub fn step(&self, step_id: &str) -> Option<&StepSnapshot> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepSnapshot {
    pub step_id: String,
    pub service_name: String,
    pub operation: String,
    pub status: StepStatus,
    pub request_data: Payload,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_data: Option<Payload>,
    pub execution_time_ms: u64,
    pub retry_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_mechanism_used: Option<FallbackMechanism>,
    pub compensation_required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compensation_operation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compensation_error: Option<String>,
    pub skipped: bool,
}

impl From<&SagaStep> for StepSnapshot {
    fn from(step: &SagaStep) -> Self {
        Self {
            step_id: step.step_id.clone(),
            service_name: step.service_name.clone(),
            operation: step.operation.clone(),
            status: step.status,
            request_data: step.request_data.redacted(),
            error: step.error.clone(),
            response_data: step.response_data.as_ref().map(PayloadExt::redacted),
            execution_time_ms: step.execution_time_ms,
            retry_attempts: step.retry_attempts,
            fallback_mechanism_used: step.fallback_mechanism_used,
            compensation_required: step.compensation_required,
            compensation_operation: step.compensation_operation.clone(),
            compensation_error: step.compensation_error.clone(),
            skipped: step.skipped,
        }
    }
}

/// One line of the saga listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SagaSummary {
    pub saga_id: SagaId,
    pub description: String,
    pub status: SagaStatus,
    pub start_time: DateTime<Utc>,
}

impl Saga {
    pub fn snapshot(&self) -> SagaSnapshot {
        SagaSnapshot {
            saga_id: self.id(),
            template: self.template(),
            description: self.description().to_string(),
            license_plate: self.license_plate().to_string(),
            status: self.status(),
            start_time: self.start_time(),
            end_time: self.end_time(),
            current_step_index: self.current_step_index(),
            failure_reason: self.failure_reason().map(str::to_string),
            steps: self.steps().iter().map(StepSnapshot::from).collect(),
            telemetry: self.telemetry().clone(),
        }
    }

    pub fn summary(&self) -> SagaSummary {
        SagaSummary {
            saga_id: self.id(),
            description: self.description().to_string(),
            status: self.status(),
            start_time: self.start_time(),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::events::{SagaEvent, StepSucceededData};
    use crate::templates::SagaPlan;

    #[test]
    fn test_snapshot_redacts_secrets() {
        let request = json!({ "license_plate": "34ABC123", "api_key": "k-123" })
            .as_object()
            .cloned()
            .unwrap();
        let plan = SagaPlan {
            description: "redaction".into(),
            license_plate: "34ABC123".into(),
            steps: vec![SagaStep::new("verify", "vehicle_service", "verify_license_plate", request)],
            propagation: Vec::new(),
        };
        let mut saga = Saga::new(SagaId::new(), SagaTemplate::VehicleEntry, plan).unwrap();
        saga.apply(SagaEvent::step_started(0, "verify")).unwrap();
        saga.apply(SagaEvent::StepSucceeded(StepSucceededData {
            step_index: 0,
            step_id: "verify".into(),
            response: json!({ "owner": { "name": "A", "access_token": "t" } })
                .as_object()
                .cloned()
                .unwrap(),
            fallback_mechanism: None,
            retry_attempts: 0,
            execution_time_ms: 1,
        }))
        .unwrap();

        let snapshot = saga.snapshot();
        let step = snapshot.step("verify").unwrap();
        assert_eq!(step.request_data["api_key"], "***");
        assert_eq!(step.request_data["license_plate"], "34ABC123");
        let response = step.response_data.as_ref().unwrap();
        assert_eq!(response["owner"]["access_token"], "***");
        assert_eq!(response["owner"]["name"], "A");

        // The record itself keeps the real values.
        assert_eq!(saga.steps()[0].request_data["api_key"], "k-123");
    }

    #[test]
    fn test_snapshot_json_layout() {
        let plan = SagaPlan {
            description: "layout".into(),
            license_plate: "34ABC123".into(),
            steps: vec![SagaStep::new("verify", "vehicle_service", "verify_license_plate", Payload::new())],
            propagation: Vec::new(),
        };
        let saga = Saga::new(SagaId::new(), SagaTemplate::VehicleExit, plan).unwrap();
        let json = serde_json::to_value(saga.snapshot()).unwrap();

        assert_eq!(json["status"], "in_progress");
        assert_eq!(json["template"], "vehicle_exit");
        assert_eq!(json["current_step_index"], 0);
        assert!(json.get("end_time").is_none());
        assert_eq!(json["steps"][0]["status"], "pending");
        assert_eq!(json["telemetry"]["compensation_steps_executed"], 0);
        assert_eq!(json["telemetry"]["fallback_mechanisms_used"], json!([]));
    }
}
