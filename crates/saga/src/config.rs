//! Orchestrator configuration.

use std::collections::HashMap;
use std::time::Duration;

use resilience::CircuitBreakerConfig;

use crate::step::StrategyConfig;

/// Settings fixed at orchestrator construction.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Upper bound on a single downstream call.
    pub default_call_deadline: Duration,
    /// Age after which `cleanup_default` removes terminal sagas.
    pub cleanup_default_max_age: Duration,
    /// Breaker settings for services without an override.
    pub circuit_breaker: CircuitBreakerConfig,
    /// Breaker settings per service name.
    pub circuit_breaker_overrides: HashMap<String, CircuitBreakerConfig>,
    /// Replaces a template's strategies for the step with this id.
    pub step_overrides: HashMap<String, StrategyConfig>,
    /// `operation → compensation_operation`; wins over template declarations.
    pub compensation_map: HashMap<String, String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_call_deadline: Duration::from_secs(10),
            cleanup_default_max_age: Duration::from_secs(24 * 60 * 60),
            circuit_breaker: CircuitBreakerConfig::default(),
            circuit_breaker_overrides: HashMap::new(),
            step_overrides: HashMap::new(),
            compensation_map: HashMap::new(),
        }
    }
}

impl OrchestratorConfig {
    pub fn with_call_deadline(mut self, deadline: Duration) -> Self {
        self.default_call_deadline = deadline;
        self
    }

    pub fn with_cleanup_max_age(mut self, max_age: Duration) -> Self {
        self.cleanup_default_max_age = max_age;
        self
    }

    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = config;
        self
    }

    pub fn with_service_circuit_breaker(
        mut self,
        service: impl Into<String>,
        config: CircuitBreakerConfig,
    ) -> Self {
        self.circuit_breaker_overrides.insert(service.into(), config);
        self
    }

    pub fn with_step_override(mut self, step_id: impl Into<String>, strategies: StrategyConfig) -> Self {
        self.step_overrides.insert(step_id.into(), strategies);
        self
    }

    pub fn with_compensation(
        mut self,
        operation: impl Into<String>,
        compensation: impl Into<String>,
    ) -> Self {
        self.compensation_map.insert(operation.into(), compensation.into());
        self
    }

    pub fn circuit_breaker_for(&self, service: &str) -> CircuitBreakerConfig {
        self.circuit_breaker_overrides
            .get(service)
            .cloned()
            .unwrap_or_else(|| self.circuit_breaker.clone())
    }

    /// Resolves the compensating operation: configured map, then the
    /// template's declaration, then `cancel_<operation>`.
    pub fn compensation_for(&self, operation: &str, declared: Option<&str>) -> String {
        self.compensation_map
            .get(operation)
            .cloned()
            .or_else(|| declared.map(str::to_string))
            .unwrap_or_else(|| format!("cancel_{operation}"))
    }
}
