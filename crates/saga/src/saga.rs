//! The saga record.

use chrono::{DateTime, Utc};
use common::{Payload, SagaId};
use serde::Serialize;
use serde_json::Value;

use crate::error::SagaError;
use crate::events::{SagaEvent, SagaEventRecord, SagaFailedData, SagaStartedData};
use crate::state::{SagaStatus, StepStatus};
use crate::step::{FallbackMechanism, SagaStep};
use crate::templates::{PropagationRule, SagaPlan, SagaTemplate};

/// Aggregate telemetry over all steps of a saga.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SagaTelemetry {
    pub total_execution_time_ms: u64,
    pub total_retry_attempts: u32,
    pub fallback_mechanisms_used: Vec<FallbackMechanism>,
    pub compensation_steps_executed: u32,
}

/// An ordered, non-empty sequence of steps plus execution bookkeeping.
///
/// Every mutation goes through [`Saga::apply`], which rejects events that
/// would break the step or saga state machines. Once the status is
/// terminal the record is frozen.
#[derive(Debug, Clone)]
pub struct Saga {
    id: SagaId,
    template: SagaTemplate,
    description: String,
    license_plate: String,
    status: SagaStatus,
    current_step_index: usize,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    steps: Vec<SagaStep>,
    propagation: Vec<PropagationRule>,
    failure_reason: Option<String>,
    telemetry: SagaTelemetry,
    history: Vec<SagaEventRecord>,
}

impl Saga {
    /// Materializes a saga from a template plan and records its start.
    pub fn new(id: SagaId, template: SagaTemplate, plan: SagaPlan) -> Result<Self, SagaError> {
        if plan.steps.is_empty() {
            return Err(SagaError::EmptySaga);
        }

        let started_at = Utc::now();
        let mut saga = Self {
            id,
            template,
            description: plan.description,
            license_plate: plan.license_plate,
            status: SagaStatus::InProgress,
            current_step_index: 0,
            start_time: started_at,
            end_time: None,
            steps: plan.steps,
            propagation: plan.propagation,
            failure_reason: None,
            telemetry: SagaTelemetry::default(),
            history: Vec::new(),
        };

        let started = SagaEvent::SagaStarted(SagaStartedData {
            saga_id: id,
            template,
            description: saga.description.clone(),
            step_count: saga.steps.len(),
            started_at,
        });
        saga.apply(started)?;
        Ok(saga)
    }

    /// Applies one event, enforcing the transition rules.
    pub fn apply(&mut self, event: SagaEvent) -> Result<(), SagaError> {
        if self.status.is_terminal() {
            return Err(self.invalid(format!(
                "saga is {} and cannot accept {}",
                self.status,
                event.event_type()
            )));
        }

        match &event {
            SagaEvent::SagaStarted(data) => {
                if !self.history.is_empty() {
                    return Err(self.invalid("saga already started"));
                }
                self.start_time = data.started_at;
            }
            SagaEvent::StepStarted(data) => {
                self.expect_current(data.step_index)?;
                self.expect_step_status(data.step_index, StepStatus::Pending)?;
            }
            SagaEvent::StepSucceeded(data) => {
                self.expect_current(data.step_index)?;
                self.transition_step(data.step_index, StepStatus::Success)?;
                let step = &mut self.steps[data.step_index];
                step.response_data = Some(data.response.clone());
                step.fallback_mechanism_used = data.fallback_mechanism;
                step.retry_attempts = data.retry_attempts;
                step.execution_time_ms = data.execution_time_ms;

                self.telemetry.total_retry_attempts += data.retry_attempts;
                if let Some(mechanism) = data.fallback_mechanism {
                    self.telemetry.fallback_mechanisms_used.push(mechanism);
                }
                self.current_step_index += 1;
            }
            SagaEvent::StepSkipped(data) => {
                self.expect_current(data.step_index)?;
                self.transition_step(data.step_index, StepStatus::Success)?;
                let step = &mut self.steps[data.step_index];
                step.skipped = true;
                step.response_data = Some(Payload::new());
                self.current_step_index += 1;
            }
            SagaEvent::DataPropagated(data) => {
                if data.from_step >= self.current_step_index || data.to_step <= data.from_step {
                    return Err(self.invalid(format!(
                        "cannot propagate from step {} to step {}",
                        data.from_step, data.to_step
                    )));
                }
                self.expect_step_status(data.to_step, StepStatus::Pending)?;
                self.steps[data.to_step]
                    .request_data
                    .insert(data.field.clone(), data.value.clone());
            }
            SagaEvent::StepFailed(data) => {
                self.expect_current(data.step_index)?;
                self.transition_step(data.step_index, StepStatus::Failed)?;
                let step = &mut self.steps[data.step_index];
                step.error = Some(data.error.clone());
                step.retry_attempts = data.retry_attempts;
                step.execution_time_ms = data.execution_time_ms;
                self.telemetry.total_retry_attempts += data.retry_attempts;
            }
            SagaEvent::CompensationStarted(data) => {
                self.expect_current(data.failed_step)?;
                self.expect_failed_cursor()?;
            }
            SagaEvent::CompensationStepCompleted(data) => {
                self.expect_failed_cursor()?;
                self.expect_compensable(data.step_index)?;
                self.transition_step(data.step_index, StepStatus::Compensated)?;
                self.telemetry.compensation_steps_executed += 1;
            }
            SagaEvent::CompensationStepFailed(data) => {
                self.expect_failed_cursor()?;
                self.expect_compensable(data.step_index)?;
                self.steps[data.step_index].compensation_error = Some(data.error.clone());
            }
            SagaEvent::SagaCompleted(data) => {
                if self.current_step_index != self.steps.len()
                    || self.steps.iter().any(|s| s.status != StepStatus::Success)
                {
                    return Err(self.invalid("not every step succeeded"));
                }
                self.status = SagaStatus::Completed;
                self.end_time = Some(data.completed_at);
                self.telemetry.total_execution_time_ms = data.total_execution_time_ms;
            }
            SagaEvent::SagaFailed(data) => {
                self.expect_failed_cursor()?;
                if !matches!(data.status, SagaStatus::Failed | SagaStatus::PartiallyCompleted) {
                    return Err(self.invalid(format!("{} is not a failure status", data.status)));
                }
                self.status = data.status;
                self.failure_reason = Some(data.reason.clone());
                self.end_time = Some(data.failed_at);
                self.telemetry.total_execution_time_ms = data.total_execution_time_ms;
            }
        }

        self.push(event);
        Ok(())
    }

    /// Forces a non-terminal saga into `Failed` when execution cannot go on.
    ///
    /// Skips the cursor checks of [`apply`](Self::apply), so it works from
    /// any in-progress state. Returns `false` if the saga was already terminal.
    pub fn abort(&mut self, reason: impl Into<String>, total_execution_time_ms: u64) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        let data = SagaFailedData {
            status: SagaStatus::Failed,
            reason: reason.into(),
            failed_at: Utc::now(),
            total_execution_time_ms,
        };
        self.status = data.status;
        self.failure_reason = Some(data.reason.clone());
        self.end_time = Some(data.failed_at);
        self.telemetry.total_execution_time_ms = total_execution_time_ms;
        self.push(SagaEvent::SagaFailed(data));
        true
    }

    fn push(&mut self, event: SagaEvent) {
        self.history.push(SagaEventRecord {
            sequence: self.history.len() as u64 + 1,
            recorded_at: Utc::now(),
            event_type: event.event_type().to_string(),
            event,
        });
    }

    fn invalid(&self, reason: impl Into<String>) -> SagaError {
        SagaError::InvalidTransition {
            saga_id: self.id,
            reason: reason.into(),
        }
    }

    fn expect_current(&self, index: usize) -> Result<(), SagaError> {
        if index != self.current_step_index || index >= self.steps.len() {
            return Err(self.invalid(format!(
                "step {index} is not the current step ({})",
                self.current_step_index
            )));
        }
        Ok(())
    }

    fn expect_step_status(&self, index: usize, expected: StepStatus) -> Result<(), SagaError> {
        match self.steps.get(index) {
            Some(step) if step.status == expected => Ok(()),
            Some(step) => Err(self.invalid(format!(
                "step {index} is {}, expected {expected}",
                step.status
            ))),
            None => Err(self.invalid(format!("no step at index {index}"))),
        }
    }

    fn expect_failed_cursor(&self) -> Result<(), SagaError> {
        self.expect_step_status(self.current_step_index, StepStatus::Failed)
    }

    fn expect_compensable(&self, index: usize) -> Result<(), SagaError> {
        if index >= self.current_step_index || !self.steps[index].needs_compensation() {
            return Err(self.invalid(format!("step {index} has nothing to compensate")));
        }
        Ok(())
    }

    fn transition_step(&mut self, index: usize, next: StepStatus) -> Result<(), SagaError> {
        let current = self.steps[index].status;
        if !current.can_transition_to(next) {
            return Err(self.invalid(format!("step {index} cannot move from {current} to {next}")));
        }
        self.steps[index].status = next;
        Ok(())
    }
}

// Query methods
impl Saga {
    pub fn id(&self) -> SagaId {
        self.id
    }

    pub fn template(&self) -> SagaTemplate {
        self.template
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn license_plate(&self) -> &str {
        &self.license_plate
    }

    pub fn status(&self) -> SagaStatus {
        self.status
    }

    pub fn current_step_index(&self) -> usize {
        self.current_step_index
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end_time
    }

    pub fn steps(&self) -> &[SagaStep] {
        &self.steps
    }

    pub fn step(&self, step_id: &str) -> Option<&SagaStep> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    pub fn telemetry(&self) -> &SagaTelemetry {
        &self.telemetry
    }

    pub fn history(&self) -> &[SagaEventRecord] {
        &self.history
    }

    /// True once every step has been executed successfully.
    pub fn is_exhausted(&self) -> bool {
        self.current_step_index >= self.steps.len()
    }

    /// Indices of steps to compensate, most recently completed first.
    pub fn compensation_order(&self) -> Vec<usize> {
        let end = self.current_step_index.min(self.steps.len());
        (0..end)
            .rev()
            .filter(|&i| self.steps[i].needs_compensation())
            .collect()
    }

    /// Values a step's response contributes to later steps' requests.
    ///
    /// Returns `(target_step_index, request_field, value)` for every rule
    /// whose source field is present in `response`.
    pub fn propagation_targets(
        &self,
        from_index: usize,
        response: &Payload,
    ) -> Vec<(usize, String, Value)> {
        let Some(from) = self.steps.get(from_index) else {
            return Vec::new();
        };

        self.propagation
            .iter()
            .filter(|rule| rule.from_step == from.step_id)
            .filter_map(|rule| {
                let value = response.get(&rule.response_field)?;
                let to = self
                    .steps
                    .iter()
                    .enumerate()
                    .skip(from_index + 1)
                    .find(|(_, s)| s.step_id == rule.to_step)
                    .map(|(i, _)| i)?;
                Some((to, rule.request_field.clone(), value.clone()))
            })
            .collect()
    }

    /// Terminal status after compensation has run.
    ///
    /// `failed` when every compensable step was compensated (or there were
    /// none); `partially_completed` when some but not all were; `failed`
    /// when none were.
    pub fn failure_status(&self) -> SagaStatus {
        let end = self.current_step_index.min(self.steps.len());
        let completed = &self.steps[..end];
        let required = completed
            .iter()
            .filter(|s| s.compensation_required && !s.skipped)
            .filter(|s| matches!(s.status, StepStatus::Success | StepStatus::Compensated))
            .count();
        let compensated = completed
            .iter()
            .filter(|s| s.status == StepStatus::Compensated)
            .count();

        if compensated > 0 && compensated < required {
            SagaStatus::PartiallyCompleted
        } else {
            SagaStatus::Failed
        }
    }
}
