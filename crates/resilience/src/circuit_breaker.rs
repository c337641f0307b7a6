//! Per-service circuit breaker.
//!
//! ```text
//!            failures ≥ threshold
//!   Closed ─────────────────────────► Open
//!     ▲                                │  reset_timeout elapsed
//!     │ trial call succeeds            ▼  (checked on access)
//!     └──────────────────────────── HalfOpen
//!                                      │ trial call fails
//!                                      └──────────► Open
//! ```
//!
//! Every state change bumps a generation counter. Outcomes of calls admitted
//! under an older generation are ignored, so a slow call that started while
//! the circuit was closed cannot close or re-open it later.

use std::fmt::Display;
use std::future::Future;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::CircuitBreakerConfig;
use crate::error::ResilienceError;

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow through; failures are counted.
    #[default]
    Closed,
    /// Calls are rejected without reaching the service.
    Open,
    /// A bounded number of trial calls probe the service.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How a call was let through the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Admitted by a closed circuit.
    Normal,
    /// Admitted as a half-open trial call.
    Probe,
}

/// Point-in-time view of a breaker, for inspection endpoints.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitSnapshot {
    pub service: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub half_open_calls: u32,
}

#[derive(Debug, Default)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure_time: Option<Instant>,
    half_open_calls: u32,
    generation: u64,
}

#[derive(Debug, Clone, Copy)]
struct Ticket {
    admission: Admission,
    generation: u64,
}

/// A circuit breaker guarding one downstream service.
///
/// Shared by every caller of that service; all bookkeeping happens under a
/// short, synchronous lock.
#[derive(Debug)]
pub struct CircuitBreaker {
    service: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(service: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let service = service.into();
        tracing::debug!(
            service = %service,
            failure_threshold = config.failure_threshold,
            reset_timeout_ms = config.reset_timeout.as_millis() as u64,
            half_open_max_calls = config.half_open_max_calls,
            "circuit breaker initialized"
        );
        Self {
            service,
            config,
            inner: Mutex::new(BreakerState::default()),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Returns the current state, applying the open → half-open decay.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        inner.state
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        CircuitSnapshot {
            service: self.service.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            half_open_calls: inner.half_open_calls,
        }
    }

    /// Runs `operation` if the circuit admits it and records the outcome.
    ///
    /// Rejections surface as `E::from(ResilienceError::CircuitOpen)` or
    /// `E::from(ResilienceError::HalfOpenLimitExceeded)` and never reach
    /// the service. If the returned future is dropped before the operation
    /// completes, the call is recorded as a failure.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<(T, Admission), E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<ResilienceError> + Display,
    {
        self.call_with_admission(|_| operation()).await
    }

    /// Like [`call`](Self::call), but tells `operation` how it was admitted
    /// so a half-open trial can limit itself to a single downstream call.
    pub async fn call_with_admission<F, Fut, T, E>(&self, operation: F) -> Result<(T, Admission), E>
    where
        F: FnOnce(Admission) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<ResilienceError> + Display,
    {
        let ticket = self.try_acquire().map_err(E::from)?;
        let mut guard = CallGuard {
            breaker: self,
            ticket,
            settled: false,
        };

        let result = operation(ticket.admission).await;
        guard.settled = true;
        match &result {
            Ok(_) => self.on_success(ticket),
            Err(e) => {
                tracing::debug!(service = %self.service, error = %e, "guarded call failed");
                self.on_failure(ticket);
            }
        }
        result.map(|value| (value, ticket.admission))
    }

    fn try_acquire(&self) -> Result<Ticket, ResilienceError> {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);

        match inner.state {
            CircuitState::Closed => Ok(Ticket {
                admission: Admission::Normal,
                generation: inner.generation,
            }),
            CircuitState::Open => {
                metrics::counter!("circuit_breaker_rejections_total", "service" => self.service.clone())
                    .increment(1);
                Err(ResilienceError::CircuitOpen {
                    service: self.service.clone(),
                })
            }
            CircuitState::HalfOpen => {
                if inner.half_open_calls >= self.config.half_open_max_calls {
                    metrics::counter!("circuit_breaker_rejections_total", "service" => self.service.clone())
                        .increment(1);
                    return Err(ResilienceError::HalfOpenLimitExceeded {
                        service: self.service.clone(),
                    });
                }
                inner.half_open_calls += 1;
                Ok(Ticket {
                    admission: Admission::Probe,
                    generation: inner.generation,
                })
            }
        }
    }

    fn on_success(&self, ticket: Ticket) {
        let mut inner = self.inner.lock();
        if ticket.generation != inner.generation {
            return;
        }
        match inner.state {
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::HalfOpen => self.transition(&mut inner, CircuitState::Closed),
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self, ticket: Ticket) {
        let mut inner = self.inner.lock();
        if ticket.generation != inner.generation {
            return;
        }
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                inner.last_failure_time = Some(Instant::now());
                if inner.failure_count >= self.config.failure_threshold {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                inner.last_failure_time = Some(Instant::now());
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    /// Moves an open circuit to half-open once `reset_timeout` has passed.
    fn refresh(&self, inner: &mut BreakerState) {
        if inner.state != CircuitState::Open {
            return;
        }
        let expired = inner
            .last_failure_time
            .is_none_or(|at| at.elapsed() > self.config.reset_timeout);
        if expired {
            self.transition(inner, CircuitState::HalfOpen);
        }
    }

    fn transition(&self, inner: &mut BreakerState, to: CircuitState) {
        let from = inner.state;
        inner.state = to;
        inner.generation += 1;
        inner.half_open_calls = 0;
        if to == CircuitState::Closed {
            inner.failure_count = 0;
        }

        metrics::counter!(
            "circuit_breaker_transitions_total",
            "service" => self.service.clone(),
            "to" => to.as_str()
        )
        .increment(1);

        match to {
            CircuitState::Open => tracing::warn!(
                service = %self.service,
                %from,
                failure_count = inner.failure_count,
                "circuit opened"
            ),
            _ => tracing::info!(service = %self.service, %from, %to, "circuit state changed"),
        }
    }
}

/// Records a failure if a guarded call is abandoned mid-flight.
struct CallGuard<'a> {
    breaker: &'a CircuitBreaker,
    ticket: Ticket,
    settled: bool,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            tracing::debug!(service = %self.breaker.service, "guarded call abandoned");
            self.breaker.on_failure(self.ticket);
        }
    }
}
