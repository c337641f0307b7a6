//! Saga error types.

use std::time::Duration;

use common::SagaId;
use resilience::ResilienceError;
use thiserror::Error;

/// Errors returned by the orchestrator's public operations.
///
/// Step and compensation failures are never surfaced here; they are
/// recorded on the saga itself.
#[derive(Debug, Error)]
pub enum SagaError {
    /// No saga is retained under the given ID.
    #[error("Saga not found: {0}")]
    NotFound(SagaId),

    /// The submitted input cannot produce a saga.
    #[error("Invalid saga input: {0}")]
    InvalidInput(String),

    /// A template produced no steps.
    #[error("Saga has no steps")]
    EmptySaga,

    /// An event does not fit the saga's current state.
    #[error("Invalid transition for saga {saga_id}: {reason}")]
    InvalidTransition { saga_id: SagaId, reason: String },

    /// The saga did not reach a terminal status in time.
    #[error("Saga {saga_id} still running after {}ms", .waited.as_millis())]
    StillRunning { saga_id: SagaId, waited: Duration },
}

/// Failures of a single `(service, operation, payload)` call.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CallError {
    /// No base URL is registered for the service.
    #[error("service not found: {0}")]
    ServiceNotFound(String),

    /// No endpoint is registered for the operation.
    #[error("operation not found: {service}.{operation}")]
    OperationNotFound { service: String, operation: String },

    /// A `{placeholder}` in the endpoint path has no value in the payload.
    #[error("missing path parameter '{parameter}' for operation {operation}")]
    MissingPathParameter { operation: String, parameter: String },

    /// The service could not be reached.
    #[error("transport failure calling {service}: {message}")]
    Transport { service: String, message: String },

    /// The service answered outside the 2xx range.
    #[error("{service} responded with status {status}: {body}")]
    Status {
        service: String,
        status: u16,
        body: String,
    },

    /// The service answered with an explicit `{ "error": ... }` body.
    #[error("{service} rejected the request: {message}")]
    Rejected { service: String, message: String },

    /// The response body could not be interpreted.
    #[error("invalid response from {service}: {message}")]
    InvalidResponse { service: String, message: String },

    /// The call outlived its deadline.
    #[error("call to {service} exceeded deadline of {}ms", .deadline.as_millis())]
    DeadlineExceeded { service: String, deadline: Duration },

    /// A resilience strategy rejected or gave up on the call.
    #[error(transparent)]
    Strategy(#[from] ResilienceError),
}

impl CallError {
    /// True for configuration errors that no strategy can recover from.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            CallError::ServiceNotFound(_)
                | CallError::OperationNotFound { .. }
                | CallError::MissingPathParameter { .. }
        )
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
