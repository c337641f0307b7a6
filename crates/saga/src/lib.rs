//! Saga orchestration for parking workflows.
//!
//! This crate drives multi-service workflows with best-effort atomicity:
//! steps run one at a time through a per-step resilience stack, and on the
//! first unrecoverable failure every completed, compensable step is undone
//! in reverse order.
//!
//! Built-in workflows:
//! 1. Vehicle entry
//! 2. Vehicle exit
//! 3. Parking payment
//!
//! Sagas live in memory only and stay queryable until cleanup removes them.

pub mod config;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod saga;
pub mod services;
pub mod snapshot;
pub mod stack;
pub mod state;
pub mod step;
pub mod templates;

pub use config::OrchestratorConfig;
pub use error::{CallError, SagaError};
pub use events::{SagaEvent, SagaEventRecord};
pub use orchestrator::SagaOrchestrator;
pub use saga::{Saga, SagaTelemetry};
pub use services::{
    CallTarget, Endpoint, HttpMethod, HttpTransport, InMemoryTransport, RecordedCall, Scripted,
    ServiceClient, ServiceDirectory, ServiceTransport, TransportResponse,
};
pub use snapshot::{SagaSnapshot, SagaSummary, StepSnapshot};
pub use stack::{StepOutcome, StrategyRegistry};
pub use state::{SagaStatus, StepStatus};
pub use step::{FallbackMechanism, SagaStep, StrategyConfig};
pub use templates::{PropagationRule, SagaInput, SagaPlan, SagaTemplate};
