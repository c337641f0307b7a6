//! Strategy configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Bounded retry with exponential backoff.
///
/// `max_attempts` counts the first call, so `max_attempts = 3` means
/// one call plus two retries.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryConfig {
    /// Creates a retry configuration with the given attempt budget and initial delay.
    pub fn new(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            ..Self::default()
        }
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    /// Sets the delay cap.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Returns the sleep that follows failed attempt number `attempt` (1-based).
    ///
    /// `min(initial_delay · factor^(attempt−1), max_delay)`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64());
        if !capped.is_finite() || capped < 0.0 {
            return self.max_delay;
        }
        Duration::from_nanos((capped * 1e9).round() as u64)
    }
}

/// Circuit breaker thresholds, applied per service.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open a closed circuit.
    pub failure_threshold: u32,
    /// How long an open circuit rejects calls before probing.
    pub reset_timeout: Duration,
    /// Concurrent trial calls admitted while half-open.
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            half_open_max_calls: 1,
        }
    }
}

/// Ordered fallback services tried after the primary.
#[derive(Debug, Clone, PartialEq)]
pub struct AlternativeConfig {
    pub alternatives: Vec<String>,
    pub per_attempt_timeout: Duration,
}

impl AlternativeConfig {
    pub fn new<I, S>(alternatives: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            alternatives: alternatives.into_iter().map(Into::into).collect(),
            per_attempt_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.per_attempt_timeout = timeout;
        self
    }
}

/// Cache-served stale reads.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
        }
    }
}

impl CacheConfig {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self { ttl }
    }
}

/// How a load balancer picks the next peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionAlgorithm {
    #[default]
    RoundRobin,
    Random,
    LeastConnections,
}

/// A load-balanced peer set.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadBalancerConfig {
    pub peers: Vec<String>,
    pub algorithm: SelectionAlgorithm,
    /// How long a failed peer stays out of rotation.
    pub unhealthy_recovery: Duration,
}

impl LoadBalancerConfig {
    pub fn new<I, S>(peers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            peers: peers.into_iter().map(Into::into).collect(),
            algorithm: SelectionAlgorithm::default(),
            unhealthy_recovery: Duration::from_secs(5),
        }
    }

    pub fn with_algorithm(mut self, algorithm: SelectionAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn with_recovery(mut self, recovery: Duration) -> Self {
        self.unhealthy_recovery = recovery;
        self
    }
}
