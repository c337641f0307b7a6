//! Primary / alternative service fallback.

use std::fmt::Display;
use std::time::Duration;

use futures_util::future::BoxFuture;

use crate::error::ResilienceError;

/// A named, not-yet-started call.
///
/// Futures are inert until polled, so building a candidate issues nothing.
pub struct Candidate<'a, T, E> {
    pub name: String,
    pub call: BoxFuture<'a, Result<T, E>>,
}

impl<'a, T, E> Candidate<'a, T, E> {
    pub fn new(name: impl Into<String>, call: BoxFuture<'a, Result<T, E>>) -> Self {
        Self {
            name: name.into(),
            call,
        }
    }
}

/// A value together with the candidate that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Served<T> {
    pub value: T,
    pub served_by: String,
    /// Position in the attempt order; `0` is the primary.
    pub index: usize,
}

impl<T> Served<T> {
    pub fn from_alternative(&self) -> bool {
        self.index > 0
    }
}

/// Tries the primary, then each alternative in declared order.
///
/// Candidates run one at a time, each raced against the per-attempt timeout.
#[derive(Debug, Clone)]
pub struct AlternativeService {
    per_attempt_timeout: Duration,
}

impl AlternativeService {
    pub fn new(per_attempt_timeout: Duration) -> Self {
        Self {
            per_attempt_timeout,
        }
    }

    pub async fn execute<'a, T, E>(
        &self,
        primary: Candidate<'a, T, E>,
        alternatives: Vec<Candidate<'a, T, E>>,
    ) -> Result<Served<T>, E>
    where
        E: From<ResilienceError> + Display,
    {
        let mut tried = Vec::with_capacity(alternatives.len() + 1);
        let mut last_error = String::new();

        for (index, candidate) in std::iter::once(primary).chain(alternatives).enumerate() {
            tried.push(candidate.name.clone());

            match tokio::time::timeout(self.per_attempt_timeout, candidate.call).await {
                Ok(Ok(value)) => {
                    if index > 0 {
                        tracing::info!(
                            service = %candidate.name,
                            position = index,
                            "alternative service succeeded"
                        );
                    }
                    return Ok(Served {
                        value,
                        served_by: candidate.name,
                        index,
                    });
                }
                Ok(Err(e)) => {
                    tracing::warn!(service = %candidate.name, error = %e, "service attempt failed");
                    last_error = e.to_string();
                }
                Err(_) => {
                    let timeout = ResilienceError::TimedOut {
                        target: candidate.name.clone(),
                        timeout: self.per_attempt_timeout,
                    };
                    tracing::warn!(service = %candidate.name, error = %timeout, "service attempt timed out");
                    last_error = timeout.to_string();
                }
            }
        }

        Err(E::from(ResilienceError::AlternativesExhausted { tried, last_error }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures_util::FutureExt;
    use parking_lot::Mutex;

    use super::*;

    #[derive(Debug, PartialEq)]
    enum TestError {
        Down(&'static str),
        Rejected(ResilienceError),
    }

    impl From<ResilienceError> for TestError {
        fn from(e: ResilienceError) -> Self {
            TestError::Rejected(e)
        }
    }

    impl Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                TestError::Down(s) => write!(f, "{s} is down"),
                TestError::Rejected(e) => write!(f, "{e}"),
            }
        }
    }

    fn candidate(
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        outcome: Result<u32, TestError>,
    ) -> Candidate<'static, u32, TestError> {
        Candidate::new(
            name,
            async move {
                log.lock().push(name);
                outcome
            }
            .boxed(),
        )
    }

    #[tokio::test]
    async fn test_primary_success_skips_alternatives() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let strategy = AlternativeService::new(Duration::from_secs(1));

        let served = strategy
            .execute(
                candidate("primary", log.clone(), Ok(1)),
                vec![candidate("backup", log.clone(), Ok(2))],
            )
            .await
            .unwrap();

        assert_eq!(served.value, 1);
        assert_eq!(served.served_by, "primary");
        assert!(!served.from_alternative());
        assert_eq!(*log.lock(), vec!["primary"]);
    }

    #[tokio::test]
    async fn test_alternatives_tried_in_declared_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let strategy = AlternativeService::new(Duration::from_secs(1));

        let served = strategy
            .execute(
                candidate("primary", log.clone(), Err(TestError::Down("primary"))),
                vec![
                    candidate("backup-a", log.clone(), Err(TestError::Down("backup-a"))),
                    candidate("backup-b", log.clone(), Ok(7)),
                    candidate("backup-c", log.clone(), Ok(9)),
                ],
            )
            .await
            .unwrap();

        assert_eq!(served.value, 7);
        assert_eq!(served.served_by, "backup-b");
        assert_eq!(served.index, 2);
        assert_eq!(*log.lock(), vec!["primary", "backup-a", "backup-b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_moves_to_next_candidate() {
        let strategy = AlternativeService::new(Duration::from_millis(100));
        let slow: Candidate<'static, u32, TestError> = Candidate::new(
            "slow",
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(1)
            }
            .boxed(),
        );
        let fast = Candidate::new("fast", async { Ok(2) }.boxed());

        let served = strategy.execute(slow, vec![fast]).await.unwrap();
        assert_eq!(served.value, 2);
        assert_eq!(served.served_by, "fast");
    }

    #[tokio::test]
    async fn test_exhaustion_names_every_service() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let strategy = AlternativeService::new(Duration::from_secs(1));

        let err = strategy
            .execute(
                candidate("primary", log.clone(), Err(TestError::Down("primary"))),
                vec![candidate("backup", log.clone(), Err(TestError::Down("backup")))],
            )
            .await
            .unwrap_err();

        assert_eq!(
            err,
            TestError::Rejected(ResilienceError::AlternativesExhausted {
                tried: vec!["primary".into(), "backup".into()],
                last_error: "backup is down".into(),
            })
        );
    }
}
