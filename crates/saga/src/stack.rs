//! The per-step resilience stack.
//!
//! Strategies are applied in a fixed order, each only when the step
//! configures it:
//!
//! ```text
//! circuit breaker ( retry ( call primary ) )
//!   └─ on failure: alternatives in declared order
//!        └─ on failure: unexpired cache entry
//!             └─ on failure: load-balanced peers
//! ```
//!
//! The breaker wraps the whole retry loop, so an exhausted retry sequence
//! counts as one breaker failure.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use common::{Payload, PayloadExt};
use futures_util::FutureExt;
use parking_lot::Mutex;
use resilience::{
    Admission, AlternativeConfig, AlternativeService, CacheConfig, CacheFallback, Candidate,
    CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, LoadBalancer, LoadBalancerConfig,
    Retry, RetryConfig,
};
use serde_json::Value;

use crate::error::CallError;
use crate::services::ServiceClient;
use crate::step::{FallbackMechanism, SagaStep};

/// A successful response and the strategy that produced it.
#[derive(Debug, Clone, PartialEq)]
struct Resolved {
    payload: Payload,
    mechanism: Option<FallbackMechanism>,
}

/// What running a step through its stack produced.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub result: Result<Payload, String>,
    pub retry_attempts: u32,
    pub fallback_mechanism: Option<FallbackMechanism>,
}

impl StepOutcome {
    pub fn failed(error: impl Into<String>, retry_attempts: u32) -> Self {
        Self {
            result: Err(error.into()),
            retry_attempts,
            fallback_mechanism: None,
        }
    }
}

/// Strategy instances shared by every saga of one orchestrator.
///
/// Breakers are keyed by service, caches by `service.operation` and TTL,
/// load balancers by their full config. Instances are created on first use.
#[derive(Debug)]
pub struct StrategyRegistry {
    breaker_default: CircuitBreakerConfig,
    breaker_overrides: HashMap<String, CircuitBreakerConfig>,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    caches: Mutex<HashMap<String, Arc<CacheFallback<Resolved>>>>,
    balancers: Mutex<HashMap<String, Arc<LoadBalancer>>>,
}

impl StrategyRegistry {
    pub fn new(
        breaker_default: CircuitBreakerConfig,
        breaker_overrides: HashMap<String, CircuitBreakerConfig>,
    ) -> Self {
        Self {
            breaker_default,
            breaker_overrides,
            breakers: Mutex::new(HashMap::new()),
            caches: Mutex::new(HashMap::new()),
            balancers: Mutex::new(HashMap::new()),
        }
    }

    /// The breaker shared by every caller of `service`.
    pub fn breaker(&self, service: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock();
        breakers
            .entry(service.to_string())
            .or_insert_with(|| {
                let config = self
                    .breaker_overrides
                    .get(service)
                    .cloned()
                    .unwrap_or_else(|| self.breaker_default.clone());
                Arc::new(CircuitBreaker::new(service, config))
            })
            .clone()
    }

    /// Snapshots of every breaker created so far, ordered by service.
    pub fn circuit_states(&self) -> Vec<CircuitSnapshot> {
        let breakers: Vec<Arc<CircuitBreaker>> = self.breakers.lock().values().cloned().collect();
        let mut states: Vec<CircuitSnapshot> = breakers.iter().map(|b| b.snapshot()).collect();
        states.sort_by(|a, b| a.service.cmp(&b.service));
        states
    }

    fn cache(&self, service: &str, operation: &str, config: &CacheConfig) -> Arc<CacheFallback<Resolved>> {
        let name = format!("{service}.{operation}");
        let key = format!("{name}@{}ms", config.ttl.as_millis());
        let mut caches = self.caches.lock();
        caches
            .entry(key)
            .or_insert_with(|| Arc::new(CacheFallback::new(name, config.clone())))
            .clone()
    }

    fn balancer(&self, config: &LoadBalancerConfig) -> Arc<LoadBalancer> {
        let name = config.peers.join(",");
        let key = format!(
            "{name}|{:?}|{}ms",
            config.algorithm,
            config.unhealthy_recovery.as_millis()
        );
        let mut balancers = self.balancers.lock();
        balancers
            .entry(key)
            .or_insert_with(|| Arc::new(LoadBalancer::new(name, config.clone())))
            .clone()
    }

    /// Runs one step's call through its configured strategies.
    pub async fn execute(&self, client: &ServiceClient, step: &SagaStep) -> StepOutcome {
        let service = step.service_name.as_str();
        let operation = step.operation.as_str();
        let request = &step.request_data;

        // Routing errors are fatal and never reach a strategy.
        if let Err(e) = client.resolve(service, operation, request) {
            tracing::warn!(service, operation, error = %e, "step cannot be routed");
            return StepOutcome::failed(e.to_string(), 0);
        }

        let attempts = AtomicU32::new(1);
        let chain = self.primary_then_alternatives(client, step, &attempts);

        let resolved = match &step.strategies.cache {
            Some(cache_config) => {
                let cache = self.cache(service, operation, cache_config);
                let key = CacheFallback::<Resolved>::key_for(
                    &format!("{service}.{operation}"),
                    &[&request.canonical()],
                );
                cache.execute(&key, chain).await.map(|cached| {
                    if cached.from_cache {
                        Resolved {
                            payload: cached.value.payload,
                            mechanism: Some(FallbackMechanism::Cache),
                        }
                    } else {
                        cached.value
                    }
                })
            }
            None => chain.await,
        };
        let retry_attempts = attempts.load(Ordering::Relaxed).saturating_sub(1);

        let result = match resolved {
            Ok(resolved) => Ok(resolved),
            Err(e) => match &step.strategies.load_balancer {
                Some(lb_config) => self
                    .load_balanced(client, step, lb_config)
                    .await
                    .map_err(|lb_err| format!("{e}; load balancer: {lb_err}")),
                None => Err(e.to_string()),
            },
        };

        match result {
            Ok(resolved) => {
                if let Some(mechanism) = resolved.mechanism {
                    metrics::counter!("resilience_fallbacks_total", "mechanism" => mechanism.as_str())
                        .increment(1);
                    tracing::info!(service, operation, %mechanism, "step recovered by fallback");
                }
                StepOutcome {
                    result: Ok(resolved.payload),
                    retry_attempts,
                    fallback_mechanism: resolved.mechanism,
                }
            }
            Err(error) => StepOutcome::failed(error, retry_attempts),
        }
    }

    /// Circuit breaker around retry around the primary call.
    async fn primary(
        &self,
        client: &ServiceClient,
        step: &SagaStep,
        attempts: &AtomicU32,
    ) -> Result<Resolved, CallError> {
        let service = step.service_name.as_str();
        let operation = step.operation.as_str();
        let request = &step.request_data;

        let retry_config = step
            .strategies
            .retry
            .clone()
            .unwrap_or_else(|| RetryConfig::new(1, Duration::ZERO));
        let run = |config: RetryConfig| async move {
            let outcome = Retry::new(config)
                .execute(service, || client.call(service, operation, request))
                .await;
            attempts.store(outcome.attempts, Ordering::Relaxed);
            outcome.result
        };

        // A half-open trial gets exactly one downstream call.
        let (payload, trial) = if step.strategies.circuit_breaker {
            let (payload, admission) = self
                .breaker(service)
                .call_with_admission(|admission| match admission {
                    Admission::Probe => run(RetryConfig::new(1, Duration::ZERO)),
                    Admission::Normal => run(retry_config),
                })
                .await?;
            (payload, admission == Admission::Probe)
        } else {
            (run(retry_config).await?, false)
        };

        let mechanism = if attempts.load(Ordering::Relaxed) > 1 {
            Some(FallbackMechanism::Retry)
        } else if trial {
            Some(FallbackMechanism::CircuitBreaker)
        } else {
            None
        };
        Ok(Resolved { payload, mechanism })
    }

    async fn primary_then_alternatives(
        &self,
        client: &ServiceClient,
        step: &SagaStep,
        attempts: &AtomicU32,
    ) -> Result<Resolved, CallError> {
        let primary_error = match self.primary(client, step, attempts).await {
            Ok(resolved) => return Ok(resolved),
            Err(e) => e,
        };

        match &step.strategies.alternative {
            Some(alternative) if !alternative.alternatives.is_empty() => {
                self.alternatives(client, step, alternative, primary_error).await
            }
            _ => Err(primary_error),
        }
    }

    async fn alternatives(
        &self,
        client: &ServiceClient,
        step: &SagaStep,
        config: &AlternativeConfig,
        primary_error: CallError,
    ) -> Result<Resolved, CallError> {
        let operation = step.operation.as_str();
        let request = &step.request_data;

        // The primary already ran; its candidate just reports the failure.
        let primary = Candidate::new(
            step.service_name.clone(),
            async move { Err::<Payload, CallError>(primary_error) }.boxed(),
        );
        let alternatives = config
            .alternatives
            .iter()
            .map(|name| Candidate::new(name.clone(), client.call(name, operation, request).boxed()))
            .collect();

        let served = AlternativeService::new(config.per_attempt_timeout)
            .execute(primary, alternatives)
            .await?;

        let mut payload = served.value;
        payload.insert("source".into(), Value::from("alternative_service"));
        payload.insert("served_by".into(), Value::from(served.served_by));
        Ok(Resolved {
            payload,
            mechanism: Some(FallbackMechanism::AlternativeService),
        })
    }

    async fn load_balanced(
        &self,
        client: &ServiceClient,
        step: &SagaStep,
        config: &LoadBalancerConfig,
    ) -> Result<Resolved, CallError> {
        let operation = step.operation.as_str();
        let request = &step.request_data;

        let balanced = self
            .balancer(config)
            .execute(|peer| async move { client.call(&peer, operation, request).await })
            .await?;

        let mut payload = balanced.value;
        payload.insert("served_by".into(), Value::from(balanced.peer));
        Ok(Resolved {
            payload,
            mechanism: Some(FallbackMechanism::LoadBalancer),
        })
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default(), HashMap::new())
    }
}
