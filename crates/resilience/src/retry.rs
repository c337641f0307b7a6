//! Bounded retry with exponential backoff.

use std::fmt::Display;
use std::future::Future;

use crate::config::RetryConfig;

/// The result of a retried call together with the attempts it consumed.
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    pub result: Result<T, E>,
    /// Calls issued, including the first one.
    pub attempts: u32,
}

impl<T, E> RetryOutcome<T, E> {
    /// Number of calls issued after the first one.
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }

    /// True when the call succeeded, but not on the first attempt.
    pub fn recovered(&self) -> bool {
        self.result.is_ok() && self.attempts > 1
    }
}

/// Retries any failure until the attempt budget is spent.
///
/// Sleeps are cooperative (`tokio::time::sleep`) so a retrying call never
/// blocks the worker thread it runs on.
#[derive(Debug, Clone, Default)]
pub struct Retry {
    config: RetryConfig,
}

impl Retry {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Issues `call` until it succeeds or `max_attempts` calls have failed.
    ///
    /// No call is issued after a successful one. On exhaustion the error of
    /// the last attempt is returned.
    pub async fn execute<F, Fut, T, E>(&self, target: &str, mut call: F) -> RetryOutcome<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match call().await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!(target_service = target, attempt, "call succeeded after retry");
                    }
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: attempt,
                    };
                }
                Err(e) => {
                    tracing::warn!(
                        target_service = target,
                        attempt,
                        max_attempts,
                        error = %e,
                        "call attempt failed"
                    );

                    if attempt >= max_attempts {
                        return RetryOutcome {
                            result: Err(e),
                            attempts: attempt,
                        };
                    }

                    let delay = self.config.delay_for_attempt(attempt);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
