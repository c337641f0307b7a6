//! Saga orchestrator: drives sagas forward and compensates on failure.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::{Payload, SagaId};
use futures_util::FutureExt;
use resilience::CircuitSnapshot;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::config::OrchestratorConfig;
use crate::error::{Result, SagaError};
use crate::events::{DataPropagatedData, SagaEvent, SagaEventRecord, StepSucceededData};
use crate::saga::Saga;
use crate::services::{ServiceClient, ServiceDirectory, ServiceTransport};
use crate::snapshot::{SagaSnapshot, SagaSummary};
use crate::stack::{StepOutcome, StrategyRegistry};
use crate::state::SagaStatus;
use crate::step::SagaStep;
use crate::templates::{SagaInput, SagaTemplate};

/// Runs sagas and owns every saga record and all strategy state.
///
/// Each submitted saga is driven by exactly one task, which works on its
/// own copy of the record and publishes a fresh copy to the store after
/// every event. Readers only ever see those published copies.
#[derive(Clone)]
pub struct SagaOrchestrator {
    inner: Arc<OrchestratorInner>,
}

struct OrchestratorInner {
    config: OrchestratorConfig,
    client: ServiceClient,
    strategies: StrategyRegistry,
    sagas: RwLock<HashMap<SagaId, Saga>>,
}

impl SagaOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        directory: ServiceDirectory,
        transport: Arc<dyn ServiceTransport>,
    ) -> Self {
        let client = ServiceClient::new(directory, transport, config.default_call_deadline);
        let strategies = StrategyRegistry::new(
            config.circuit_breaker.clone(),
            config.circuit_breaker_overrides.clone(),
        );
        Self {
            inner: Arc::new(OrchestratorInner {
                config,
                client,
                strategies,
                sagas: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    /// Starts a saga in the background and returns its id immediately.
    #[tracing::instrument(skip(self, input), fields(template = %template, license_plate = %input.license_plate))]
    pub async fn submit(&self, template: SagaTemplate, input: SagaInput) -> Result<SagaId> {
        let saga = self.materialize(template, &input)?;
        let saga_id = saga.id();
        self.inner.publish(&saga).await;

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.run(saga).await;
        });

        tracing::info!(%saga_id, "saga submitted");
        Ok(saga_id)
    }

    /// Runs a saga to completion on the calling task.
    #[tracing::instrument(skip(self, input), fields(template = %template, license_plate = %input.license_plate))]
    pub async fn execute(&self, template: SagaTemplate, input: SagaInput) -> Result<SagaSnapshot> {
        let saga = self.materialize(template, &input)?;
        self.inner.publish(&saga).await;
        let saga = self.inner.run(saga).await;
        Ok(saga.snapshot())
    }

    /// Returns a snapshot of the saga.
    pub async fn status(&self, saga_id: SagaId) -> Result<SagaSnapshot> {
        self.inner
            .sagas
            .read()
            .await
            .get(&saga_id)
            .map(Saga::snapshot)
            .ok_or(SagaError::NotFound(saga_id))
    }

    /// Returns the events applied to the saga so far.
    pub async fn history(&self, saga_id: SagaId) -> Result<Vec<SagaEventRecord>> {
        self.inner
            .sagas
            .read()
            .await
            .get(&saga_id)
            .map(|saga| saga.history().to_vec())
            .ok_or(SagaError::NotFound(saga_id))
    }

    /// Briefs of every retained saga, oldest first.
    pub async fn list(&self) -> Vec<SagaSummary> {
        let mut sagas: Vec<SagaSummary> = self
            .inner
            .sagas
            .read()
            .await
            .values()
            .map(Saga::summary)
            .collect();
        sagas.sort_by(|a, b| {
            a.start_time
                .cmp(&b.start_time)
                .then_with(|| a.saga_id.cmp(&b.saga_id))
        });
        sagas
    }

    /// Removes terminal sagas that ended at least `max_age` ago.
    ///
    /// In-progress sagas are never removed.
    #[tracing::instrument(skip(self))]
    pub async fn cleanup(&self, max_age: Duration) -> usize {
        let Ok(max_age) = chrono::Duration::from_std(max_age) else {
            return 0;
        };
        let now = Utc::now();

        let mut sagas = self.inner.sagas.write().await;
        let before = sagas.len();
        sagas.retain(|_, saga| {
            let expired = saga.status().is_terminal()
                && saga.end_time().is_some_and(|ended| now - ended >= max_age);
            !expired
        });
        let removed = before - sagas.len();

        if removed > 0 {
            tracing::info!(removed, retained = sagas.len(), "cleaned up sagas");
        }
        removed
    }

    /// [`cleanup`](Self::cleanup) with the configured default age.
    pub async fn cleanup_default(&self) -> usize {
        self.cleanup(self.inner.config.cleanup_default_max_age).await
    }

    /// State of every circuit breaker created so far.
    pub fn circuit_states(&self) -> Vec<CircuitSnapshot> {
        self.inner.strategies.circuit_states()
    }

    /// Polls until the saga is terminal or `timeout` elapses.
    pub async fn await_terminal(&self, saga_id: SagaId, timeout: Duration) -> Result<SagaSnapshot> {
        let deadline = Instant::now() + timeout;
        loop {
            let snapshot = self.status(saga_id).await?;
            if snapshot.status.is_terminal() {
                return Ok(snapshot);
            }
            if Instant::now() >= deadline {
                return Err(SagaError::StillRunning {
                    saga_id,
                    waited: timeout,
                });
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn materialize(&self, template: SagaTemplate, input: &SagaInput) -> Result<Saga> {
        let config = &self.inner.config;
        let mut plan = template.plan(input)?;

        for step in &mut plan.steps {
            if let Some(strategies) = config.step_overrides.get(&step.step_id) {
                step.strategies = strategies.clone();
            }
            if step.compensation_required {
                step.compensation_operation = Some(
                    config.compensation_for(&step.operation, step.compensation_operation.as_deref()),
                );
            }
        }

        Saga::new(SagaId::new(), template, plan)
    }
}

impl std::fmt::Debug for SagaOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaOrchestrator")
            .field("config", &self.inner.config)
            .field("client", &self.inner.client)
            .finish_non_exhaustive()
    }
}

impl OrchestratorInner {
    async fn publish(&self, saga: &Saga) {
        self.sagas.write().await.insert(saga.id(), saga.clone());
    }

    async fn record(&self, saga: &mut Saga, event: SagaEvent) -> Result<()> {
        saga.apply(event)?;
        self.publish(saga).await;
        Ok(())
    }

    #[tracing::instrument(skip(self, saga), fields(saga_id = %saga.id(), template = %saga.template()))]
    async fn run(&self, mut saga: Saga) -> Saga {
        metrics::counter!("saga_executions_total", "template" => saga.template().as_str()).increment(1);
        let started = Instant::now();
        tracing::info!(steps = saga.steps().len(), "saga started");

        if let Err(e) = self.drive(&mut saga, started).await {
            self.abort(&mut saga, &e, started).await;
        }

        metrics::histogram!("saga_duration_seconds").record(started.elapsed().as_secs_f64());
        match saga.status() {
            SagaStatus::Completed => metrics::counter!("saga_completed").increment(1),
            SagaStatus::Failed => metrics::counter!("saga_failed").increment(1),
            SagaStatus::PartiallyCompleted => {
                metrics::counter!("saga_partially_completed").increment(1)
            }
            SagaStatus::InProgress => {}
        }
        tracing::info!(status = %saga.status(), "saga finished");
        saga
    }

    /// Marks a saga whose execution broke off as failed, so it never stays
    /// in progress.
    async fn abort(&self, saga: &mut Saga, error: &SagaError, started: Instant) {
        tracing::error!(error = %error, "saga execution aborted");
        if saga.abort(format!("saga aborted: {error}"), elapsed_ms(started)) {
            self.publish(saga).await;
        }
    }

    async fn drive(&self, saga: &mut Saga, started: Instant) -> Result<()> {
        while !saga.is_exhausted() {
            let index = saga.current_step_index();
            let step = saga.steps()[index].clone();

            if let Some(missing) = step.missing_input() {
                tracing::info!(step = %step.step_id, missing, "step skipped");
                self.record(saga, SagaEvent::step_skipped(index, &step.step_id, missing))
                    .await?;
                continue;
            }

            tracing::info!(step = %step.step_id, service = %step.service_name, "saga step started");
            self.record(saga, SagaEvent::step_started(index, &step.step_id))
                .await?;

            let step_started = Instant::now();
            let outcome = self.execute_step(&step).await;
            let execution_time_ms = step_started.elapsed().as_millis() as u64;
            metrics::histogram!("saga_step_duration_seconds", "service" => step.service_name.clone())
                .record(step_started.elapsed().as_secs_f64());

            match outcome.result {
                Ok(response) => {
                    tracing::info!(
                        step = %step.step_id,
                        retry_attempts = outcome.retry_attempts,
                        fallback = ?outcome.fallback_mechanism,
                        "saga step succeeded"
                    );
                    let targets = saga.propagation_targets(index, &response);
                    self.record(
                        saga,
                        SagaEvent::StepSucceeded(StepSucceededData {
                            step_index: index,
                            step_id: step.step_id.clone(),
                            response,
                            fallback_mechanism: outcome.fallback_mechanism,
                            retry_attempts: outcome.retry_attempts,
                            execution_time_ms,
                        }),
                    )
                    .await?;

                    for (to_step, field, value) in targets {
                        tracing::debug!(from = %step.step_id, to_step, field = %field, "propagating response field");
                        self.record(
                            saga,
                            SagaEvent::DataPropagated(DataPropagatedData {
                                from_step: index,
                                to_step,
                                field,
                                value,
                            }),
                        )
                        .await?;
                    }
                }
                Err(error) => {
                    tracing::warn!(
                        step = %step.step_id,
                        retry_attempts = outcome.retry_attempts,
                        error = %error,
                        "saga step failed"
                    );
                    self.record(
                        saga,
                        SagaEvent::step_failed(
                            index,
                            &step.step_id,
                            &error,
                            outcome.retry_attempts,
                            execution_time_ms,
                        ),
                    )
                    .await?;

                    self.compensate(saga).await?;

                    let status = saga.failure_status();
                    let reason = format!("step {} failed: {error}", step.step_id);
                    self.record(
                        saga,
                        SagaEvent::saga_failed(status, reason, elapsed_ms(started)),
                    )
                    .await?;
                    return Ok(());
                }
            }
        }

        self.record(saga, SagaEvent::saga_completed(elapsed_ms(started)))
            .await
    }

    /// Runs a step through its strategies, turning a panic into a failure.
    async fn execute_step(&self, step: &SagaStep) -> StepOutcome {
        AssertUnwindSafe(self.strategies.execute(&self.client, step))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                StepOutcome::failed(format!("step panicked: {}", panic_message(panic.as_ref())), 0)
            })
    }

    /// Undoes completed steps in reverse order; failures are recorded and skipped.
    async fn compensate(&self, saga: &mut Saga) -> Result<()> {
        let failed_step = saga.current_step_index();
        let order = saga.compensation_order();
        tracing::info!(failed_step, pending = order.len(), "compensation started");
        self.record(saga, SagaEvent::compensation_started(failed_step, order.len()))
            .await?;

        for index in order {
            let step = saga.steps()[index].clone();
            let operation = step
                .compensation_operation
                .clone()
                .unwrap_or_else(|| format!("cancel_{}", step.operation));
            let payload = compensation_payload(&step);

            let result = match AssertUnwindSafe(self.client.call(&step.service_name, &operation, &payload))
                .catch_unwind()
                .await
            {
                Ok(result) => result.map_err(|e| e.to_string()),
                Err(panic) => Err(format!("compensation panicked: {}", panic_message(panic.as_ref()))),
            };

            match result {
                Ok(_) => {
                    metrics::counter!("saga_compensations_total", "outcome" => "succeeded").increment(1);
                    tracing::info!(step = %step.step_id, operation = %operation, "compensation step completed");
                    self.record(
                        saga,
                        SagaEvent::compensation_step_completed(index, &step.step_id, &operation),
                    )
                    .await?;
                }
                Err(error) => {
                    metrics::counter!("saga_compensations_total", "outcome" => "failed").increment(1);
                    tracing::error!(
                        step = %step.step_id,
                        operation = %operation,
                        error = %error,
                        "compensation step failed, continuing"
                    );
                    self.record(
                        saga,
                        SagaEvent::compensation_step_failed(index, &step.step_id, &operation, error),
                    )
                    .await?;
                }
            }
        }
        Ok(())
    }
}

/// `{ original_operation, original_request, original_response }`.
fn compensation_payload(step: &SagaStep) -> Payload {
    let mut payload = Payload::new();
    payload.insert("original_operation".into(), Value::from(step.operation.clone()));
    payload.insert(
        "original_request".into(),
        Value::Object(step.request_data.clone()),
    );
    payload.insert(
        "original_response".into(),
        Value::Object(step.response_data.clone().unwrap_or_default()),
    );
    payload
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::services::InMemoryTransport;

    fn orchestrator(transport: &InMemoryTransport) -> SagaOrchestrator {
        SagaOrchestrator::new(
            OrchestratorConfig::default(),
            ServiceDirectory::parking_defaults(),
            Arc::new(transport.clone()),
        )
    }

    #[test]
    fn test_compensation_payload_shape() {
        let mut step = SagaStep::new(
            "allocate_parking_space",
            "parking_service",
            "allocate_parking_space",
            json!({ "license_plate": "34ABC123" }).as_object().cloned().unwrap(),
        );
        step.response_data = json!({ "space_id": "A-1" }).as_object().cloned();

        let payload = compensation_payload(&step);
        assert_eq!(payload["original_operation"], "allocate_parking_space");
        assert_eq!(payload["original_request"]["license_plate"], "34ABC123");
        assert_eq!(payload["original_response"]["space_id"], "A-1");
    }

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
        let boxed: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }

    #[tokio::test]
    async fn test_aborted_saga_is_published_as_failed() {
        let transport = InMemoryTransport::new();
        let orchestrator = orchestrator(&transport);
        let mut saga = orchestrator
            .materialize(SagaTemplate::VehicleEntry, &SagaInput::new("34ABC123"))
            .unwrap();
        let saga_id = saga.id();
        orchestrator.inner.publish(&saga).await;

        let error = SagaError::InvalidTransition {
            saga_id,
            reason: "step 0 is not the current step (1)".into(),
        };
        orchestrator.inner.abort(&mut saga, &error, Instant::now()).await;

        let snapshot = orchestrator.status(saga_id).await.unwrap();
        assert_eq!(snapshot.status, SagaStatus::Failed);
        let history = orchestrator.history(saga_id).await.unwrap();
        assert_eq!(history.last().unwrap().event_type, "SagaFailed");
        assert_eq!(orchestrator.cleanup(Duration::ZERO).await, 1);
    }

    #[tokio::test]
    async fn test_materialize_resolves_compensations() {
        let transport = InMemoryTransport::new();
        let orchestrator = SagaOrchestrator::new(
            OrchestratorConfig::default().with_compensation("create_entry_record", "delete_entry_record"),
            ServiceDirectory::parking_defaults(),
            Arc::new(transport),
        );

        let saga = orchestrator
            .materialize(SagaTemplate::VehicleEntry, &SagaInput::new("34ABC123"))
            .unwrap();
        let ops: Vec<Option<&str>> = saga
            .steps()
            .iter()
            .map(|s| s.compensation_operation.as_deref())
            .collect();
        assert_eq!(
            ops,
            vec![
                None,
                None,
                Some("cancel_allocate_parking_space"),
                Some("delete_entry_record"),
                None,
                Some("cancel_update_favorite_parking"),
            ]
        );
    }

    #[tokio::test]
    async fn test_status_of_unknown_saga() {
        let orchestrator = orchestrator(&InMemoryTransport::new());
        let id = SagaId::new();
        assert!(matches!(orchestrator.status(id).await, Err(SagaError::NotFound(missing)) if missing == id));
        assert!(matches!(orchestrator.history(id).await, Err(SagaError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_invalid_input_is_rejected_before_storing() {
        let orchestrator = orchestrator(&InMemoryTransport::new());
        let result = orchestrator
            .submit(SagaTemplate::VehicleEntry, SagaInput::new(""))
            .await;
        assert!(matches!(result, Err(SagaError::InvalidInput(_))));
        assert!(orchestrator.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_history_records_every_transition() {
        let transport = InMemoryTransport::new();
        let orchestrator = orchestrator(&transport);

        let snapshot = orchestrator
            .execute(SagaTemplate::Payment, SagaInput::new("34ABC123").with_user("u-1"))
            .await
            .unwrap();
        let history = orchestrator.history(snapshot.saga_id).await.unwrap();

        let types: Vec<&str> = history.iter().map(|r| r.event_type.as_str()).collect();
        assert_eq!(types.first(), Some(&"SagaStarted"));
        assert_eq!(types.last(), Some(&"SagaCompleted"));
        assert_eq!(types.iter().filter(|t| **t == "StepSucceeded").count(), 4);
        assert!(history.windows(2).all(|w| w[0].sequence < w[1].sequence));
    }
}
