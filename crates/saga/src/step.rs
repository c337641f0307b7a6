//! The step model: one intended effect on one downstream service.

use common::{Payload, PayloadExt};
use resilience::{AlternativeConfig, CacheConfig, LoadBalancerConfig, RetryConfig};
use serde::{Deserialize, Serialize};

use crate::state::StepStatus;

/// The strategy that produced a step's success when the first call did not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackMechanism {
    Retry,
    CircuitBreaker,
    AlternativeService,
    Cache,
    LoadBalancer,
}

impl FallbackMechanism {
    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackMechanism::Retry => "retry",
            FallbackMechanism::CircuitBreaker => "circuit_breaker",
            FallbackMechanism::AlternativeService => "alternative_service",
            FallbackMechanism::Cache => "cache",
            FallbackMechanism::LoadBalancer => "load_balancer",
        }
    }
}

impl std::fmt::Display for FallbackMechanism {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Which resilience strategies apply to a step.
///
/// Every strategy is off by default, so an empty config issues exactly
/// one call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StrategyConfig {
    pub retry: Option<RetryConfig>,
    /// Route calls through the service's shared circuit breaker.
    pub circuit_breaker: bool,
    pub alternative: Option<AlternativeConfig>,
    pub cache: Option<CacheConfig>,
    pub load_balancer: Option<LoadBalancerConfig>,
}

impl StrategyConfig {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_circuit_breaker(mut self) -> Self {
        self.circuit_breaker = true;
        self
    }

    pub fn with_alternative(mut self, alternative: AlternativeConfig) -> Self {
        self.alternative = Some(alternative);
        self
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_load_balancer(mut self, load_balancer: LoadBalancerConfig) -> Self {
        self.load_balancer = Some(load_balancer);
        self
    }

    /// True when no strategy is configured.
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// One step of a saga.
#[derive(Debug, Clone)]
pub struct SagaStep {
    pub step_id: String,
    pub service_name: String,
    pub operation: String,
    pub request_data: Payload,
    pub compensation_required: bool,
    /// Resolved when the saga is materialized; `None` on non-compensable steps.
    pub compensation_operation: Option<String>,
    pub strategies: StrategyConfig,
    /// Request fields that must be present, otherwise the step is skipped.
    pub required_inputs: Vec<String>,

    pub status: StepStatus,
    pub response_data: Option<Payload>,
    pub error: Option<String>,
    pub fallback_mechanism_used: Option<FallbackMechanism>,
    pub execution_time_ms: u64,
    pub retry_attempts: u32,
    pub skipped: bool,
    pub compensation_error: Option<String>,
}

impl SagaStep {
    pub fn new(
        step_id: impl Into<String>,
        service_name: impl Into<String>,
        operation: impl Into<String>,
        request_data: Payload,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            service_name: service_name.into(),
            operation: operation.into(),
            request_data,
            compensation_required: false,
            compensation_operation: None,
            strategies: StrategyConfig::default(),
            required_inputs: Vec::new(),
            status: StepStatus::Pending,
            response_data: None,
            error: None,
            fallback_mechanism_used: None,
            execution_time_ms: 0,
            retry_attempts: 0,
            skipped: false,
            compensation_error: None,
        }
    }

    /// Marks the step compensable, optionally naming the compensating operation.
    pub fn compensated_by(mut self, operation: Option<&str>) -> Self {
        self.compensation_required = true;
        self.compensation_operation = operation.map(str::to_string);
        self
    }

    pub fn with_strategies(mut self, strategies: StrategyConfig) -> Self {
        self.strategies = strategies;
        self
    }

    pub fn requires(mut self, field: impl Into<String>) -> Self {
        self.required_inputs.push(field.into());
        self
    }

    /// Returns the first required input absent from the request.
    pub fn missing_input(&self) -> Option<&str> {
        self.required_inputs
            .iter()
            .find(|field| !self.request_data.is_present(field))
            .map(String::as_str)
    }

    /// True for a successful step whose effect still has to be undone.
    pub fn needs_compensation(&self) -> bool {
        self.status == StepStatus::Success && self.compensation_required && !self.skipped
    }
}
