//! Resilience error types.

use std::time::Duration;

use thiserror::Error;

/// Rejections produced by the strategies themselves, as opposed to
/// failures reported by the wrapped call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResilienceError {
    /// The circuit for a service is open and the call was not issued.
    #[error("circuit open for service '{service}'")]
    CircuitOpen { service: String },

    /// The circuit is half-open and all trial slots are taken.
    #[error("half-open call limit exceeded for service '{service}'")]
    HalfOpenLimitExceeded { service: String },

    /// The primary and every alternative failed.
    #[error("all services failed (tried: {}): {last_error}", .tried.join(", "))]
    AlternativesExhausted {
        tried: Vec<String>,
        last_error: String,
    },

    /// Every peer of a load-balanced pool is marked unhealthy.
    #[error("all services unavailable in pool '{pool}'")]
    AllPeersUnavailable { pool: String },

    /// The call failed and no unexpired cache entry exists for the key.
    #[error("no valid cache entry for '{key}' after failure: {cause}")]
    CacheMiss { key: String, cause: String },

    /// A call did not complete within its time budget.
    #[error("call to '{target}' timed out after {}ms", .timeout.as_millis())]
    TimedOut { target: String, timeout: Duration },
}

impl ResilienceError {
    /// Returns a short machine-readable label for the rejection kind.
    pub fn kind(&self) -> &'static str {
        match self {
            ResilienceError::CircuitOpen { .. } => "circuit_open",
            ResilienceError::HalfOpenLimitExceeded { .. } => "half_open_limit",
            ResilienceError::AlternativesExhausted { .. } => "alternatives_exhausted",
            ResilienceError::AllPeersUnavailable { .. } => "all_peers_unavailable",
            ResilienceError::CacheMiss { .. } => "cache_miss",
            ResilienceError::TimedOut { .. } => "timed_out",
        }
    }
}
