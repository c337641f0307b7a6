//! Resilience strategies for calls to unreliable downstream services.
//!
//! Five independent building blocks, each wrapping an async call and
//! reporting either a value or an error:
//!
//! - [`Retry`]: bounded retries with exponential backoff
//! - [`CircuitBreaker`]: closed / open / half-open failure isolation
//! - [`AlternativeService`]: ordered primary → alternatives fallback
//! - [`CacheFallback`]: serve a fresh-enough cached value when the call fails
//! - [`LoadBalancer`]: peer selection with health eviction and timed recovery
//!
//! Strategies hold only their own bookkeeping and are safe to share between
//! concurrently running tasks. Internal locks are never held across an `.await`.

pub mod alternative;
pub mod cache;
pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod load_balancer;
pub mod retry;

pub use alternative::{AlternativeService, Candidate, Served};
pub use cache::{CacheFallback, Cached};
pub use circuit_breaker::{Admission, CircuitBreaker, CircuitSnapshot, CircuitState};
pub use config::{
    AlternativeConfig, CacheConfig, CircuitBreakerConfig, LoadBalancerConfig, RetryConfig,
    SelectionAlgorithm,
};
pub use error::ResilienceError;
pub use load_balancer::{Balanced, LoadBalancer};
pub use retry::{Retry, RetryOutcome};
