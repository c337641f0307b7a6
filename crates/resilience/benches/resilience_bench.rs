use std::time::Duration;

use criterion::{Criterion, criterion_group, criterion_main};
use resilience::{
    CacheConfig, CacheFallback, CircuitBreaker, CircuitBreakerConfig, LoadBalancer,
    LoadBalancerConfig, ResilienceError, Retry, RetryConfig, SelectionAlgorithm,
};

#[derive(Debug)]
struct BenchError;

impl From<ResilienceError> for BenchError {
    fn from(_: ResilienceError) -> Self {
        BenchError
    }
}

impl std::fmt::Display for BenchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bench error")
    }
}

fn bench_circuit_breaker_closed(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let breaker = CircuitBreaker::new("bench", CircuitBreakerConfig::default());

    c.bench_function("resilience/circuit_breaker_closed_call", |b| {
        b.iter(|| {
            rt.block_on(async {
                breaker
                    .call(|| async { Ok::<_, BenchError>(1u32) })
                    .await
                    .unwrap();
            });
        });
    });
}

fn bench_retry_first_try(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let retry = Retry::new(RetryConfig::new(3, Duration::from_millis(1)));

    c.bench_function("resilience/retry_first_try", |b| {
        b.iter(|| {
            rt.block_on(async {
                let outcome = retry
                    .execute("bench", || async { Ok::<_, BenchError>(1u32) })
                    .await;
                assert!(outcome.result.is_ok());
            });
        });
    });
}

fn bench_cache_hit_on_failure(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let cache: CacheFallback<String> =
        CacheFallback::new("bench", CacheConfig::with_ttl(Duration::from_secs(3600)));
    rt.block_on(async { cache.put("key", "value".to_string()) });

    c.bench_function("resilience/cache_hit_on_failure", |b| {
        b.iter(|| {
            rt.block_on(async {
                let cached = cache
                    .execute("key", async { Err::<String, _>(BenchError) })
                    .await
                    .unwrap();
                assert!(cached.from_cache);
            });
        });
    });
}

fn bench_load_balancer_round_robin(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let lb = LoadBalancer::new(
        "bench",
        LoadBalancerConfig::new(["a", "b", "c", "d"])
            .with_algorithm(SelectionAlgorithm::RoundRobin),
    );

    c.bench_function("resilience/load_balancer_round_robin", |b| {
        b.iter(|| {
            rt.block_on(async {
                lb.execute(|peer| async move { Ok::<_, BenchError>(peer) })
                    .await
                    .unwrap();
            });
        });
    });
}

criterion_group!(
    benches,
    bench_circuit_breaker_closed,
    bench_retry_first_try,
    bench_cache_hit_on_failure,
    bench_load_balancer_round_robin
);
criterion_main!(benches);
