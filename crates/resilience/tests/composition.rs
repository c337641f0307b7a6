//! Strategies stacked the way the saga orchestrator stacks them.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use futures_util::FutureExt;
use resilience::{
    AlternativeService, CacheConfig, CacheFallback, Candidate, CircuitBreaker,
    CircuitBreakerConfig, CircuitState, ResilienceError, Retry, RetryConfig,
};

#[derive(Debug, Clone, PartialEq)]
enum CallError {
    Downstream(String),
    Strategy(ResilienceError),
}

impl From<ResilienceError> for CallError {
    fn from(e: ResilienceError) -> Self {
        CallError::Strategy(e)
    }
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallError::Downstream(msg) => write!(f, "{msg}"),
            CallError::Strategy(e) => write!(f, "{e}"),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_breaker_counts_one_failure_per_exhausted_retry_sequence() {
    let retry = Retry::new(RetryConfig::new(3, Duration::from_millis(100)));
    let breaker = CircuitBreaker::new(
        "parking_service",
        CircuitBreakerConfig {
            failure_threshold: 2,
            reset_timeout: Duration::from_secs(30),
            half_open_max_calls: 1,
        },
    );
    let calls = AtomicU32::new(0);

    for _ in 0..2 {
        let result: Result<(u32, _), CallError> = breaker
            .call(|| async {
                retry
                    .execute("parking_service", || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        async { Err::<u32, _>(CallError::Downstream("503".into())) }
                    })
                    .await
                    .result
            })
            .await;
        assert_eq!(result.unwrap_err(), CallError::Downstream("503".into()));
    }

    assert_eq!(calls.load(Ordering::SeqCst), 6);
    assert_eq!(breaker.state(), CircuitState::Open);

    let rejected: Result<(u32, _), CallError> = breaker
        .call(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(1)
        })
        .await;
    assert!(matches!(
        rejected,
        Err(CallError::Strategy(ResilienceError::CircuitOpen { .. }))
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 6);
}

#[tokio::test(start_paused = true)]
async fn test_cache_backs_up_exhausted_alternatives() {
    let alternatives = AlternativeService::new(Duration::from_secs(1));
    let cache: CacheFallback<String> =
        CacheFallback::new("vehicle_service", CacheConfig::with_ttl(Duration::from_secs(60)));
    let primary_up = Arc::new(std::sync::atomic::AtomicBool::new(true));
    let key = CacheFallback::<String>::key_for("get_vehicle_info", &["34ABC123"]);

    let attempt = |up: bool| {
        let alternatives = alternatives.clone();
        async move {
            let primary = Candidate::new(
                "vehicle_service",
                async move {
                    if up {
                        Ok("sedan".to_string())
                    } else {
                        Err(CallError::Downstream("primary down".into()))
                    }
                }
                .boxed(),
            );
            let backup = Candidate::new(
                "vehicle_service_backup",
                async { Err::<String, _>(CallError::Downstream("backup down".into())) }.boxed(),
            );
            alternatives
                .execute(primary, vec![backup])
                .await
                .map(|served| served.value)
        }
    };

    let first = cache
        .execute(&key, attempt(primary_up.load(Ordering::SeqCst)))
        .await
        .unwrap();
    assert!(!first.from_cache);

    primary_up.store(false, Ordering::SeqCst);
    let second = cache
        .execute(&key, attempt(primary_up.load(Ordering::SeqCst)))
        .await
        .unwrap();
    assert!(second.from_cache);
    assert_eq!(second.value, "sedan");

    tokio::time::advance(Duration::from_secs(61)).await;
    let third = cache
        .execute(&key, attempt(primary_up.load(Ordering::SeqCst)))
        .await
        .unwrap_err();
    match third {
        CallError::Strategy(ResilienceError::CacheMiss { cause, .. }) => {
            assert!(cause.contains("vehicle_service, vehicle_service_backup"));
        }
        other => panic!("expected cache miss, got {other:?}"),
    }
}
