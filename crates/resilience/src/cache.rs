//! Cache-served stale reads.

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::config::CacheConfig;
use crate::error::ResilienceError;

/// A value and whether it came from the cache rather than a live call.
#[derive(Debug, Clone, PartialEq)]
pub struct Cached<V> {
    pub value: V,
    pub from_cache: bool,
}

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

/// Remembers successful results and serves them when a later call fails.
///
/// In-memory and best-effort; nothing keeps entries coherent with the
/// downstream after a write. An entry is only ever returned while
/// `now < expires_at`; expired entries are evicted when touched.
#[derive(Debug)]
pub struct CacheFallback<V> {
    name: String,
    ttl: Duration,
    entries: Mutex<HashMap<String, CacheEntry<V>>>,
}

impl<V: Clone> CacheFallback<V> {
    pub fn new(name: impl Into<String>, config: CacheConfig) -> Self {
        Self {
            name: name.into(),
            ttl: config.ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Derives a deterministic key from a call identity and its arguments.
    pub fn key_for(identity: &str, args: &[&str]) -> String {
        let mut key = identity.to_string();
        for arg in args {
            key.push('|');
            key.push_str(arg);
        }
        key
    }

    /// Returns the unexpired value stored under `key`.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if Instant::now() < entry.expires_at => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                tracing::debug!(cache = %self.name, key, "evicted expired cache entry");
                None
            }
            None => None,
        }
    }

    pub fn put(&self, key: impl Into<String>, value: V) {
        let entry = CacheEntry {
            value,
            expires_at: Instant::now() + self.ttl,
        };
        self.entries.lock().insert(key.into(), entry);
    }

    /// Runs `call`; caches a success, or serves the cached value on failure.
    pub async fn execute<Fut, E>(&self, key: &str, call: Fut) -> Result<Cached<V>, E>
    where
        Fut: Future<Output = Result<V, E>>,
        E: From<ResilienceError> + Display,
    {
        match call.await {
            Ok(value) => {
                self.put(key, value.clone());
                Ok(Cached {
                    value,
                    from_cache: false,
                })
            }
            Err(e) => match self.get(key) {
                Some(value) => {
                    tracing::info!(cache = %self.name, key, error = %e, "serving cached value after failure");
                    Ok(Cached {
                        value,
                        from_cache: true,
                    })
                }
                None => Err(E::from(ResilienceError::CacheMiss {
                    key: key.to_string(),
                    cause: e.to_string(),
                })),
            },
        }
    }

    /// Drops every expired entry and returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| now < entry.expires_at);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    enum TestError {
        Down,
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
                TestError::Down => write!(f, "service down"),
                TestError::Rejected(e) => write!(f, "{e}"),
            }
        }
    }

    fn cache(ttl_secs: u64) -> CacheFallback<String> {
        CacheFallback::new("vehicle_service", CacheConfig::with_ttl(Duration::from_secs(ttl_secs)))
    }

    #[test]
    fn test_key_derivation_is_deterministic() {
        let a = CacheFallback::<String>::key_for("get_vehicle_info", &["34ABC123"]);
        let b = CacheFallback::<String>::key_for("get_vehicle_info", &["34ABC123"]);
        let c = CacheFallback::<String>::key_for("get_vehicle_info", &["06XYZ999"]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, "get_vehicle_info|34ABC123");
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_populates_cache() {
        let cache = cache(60);
        let result = cache
            .execute("k", async { Ok::<_, TestError>("fresh".to_string()) })
            .await
            .unwrap();

        assert!(!result.from_cache);
        assert_eq!(cache.get("k"), Some("fresh".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_served_from_unexpired_entry() {
        let cache = cache(60);
        cache.put("k", "stale-but-valid".to_string());

        tokio::time::advance(Duration::from_secs(59)).await;
        let result = cache
            .execute("k", async { Err::<String, _>(TestError::Down) })
            .await
            .unwrap();

        assert!(result.from_cache);
        assert_eq!(result.value, "stale-but-valid");
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_is_a_miss() {
        let cache = cache(60);
        cache.put("k", "old".to_string());

        tokio::time::advance(Duration::from_secs(61)).await;
        let err = cache
            .execute("k", async { Err::<String, _>(TestError::Down) })
            .await
            .unwrap_err();

        assert_eq!(
            err,
            TestError::Rejected(ResilienceError::CacheMiss {
                key: "k".into(),
                cause: "service down".into()
            })
        );
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_at_exact_expiry_is_not_served() {
        let cache = cache(10);
        cache.put("k", "v".to_string());

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(cache.get("k"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let cache = cache(10);
        cache.put("a", "1".to_string());
        tokio::time::advance(Duration::from_secs(5)).await;
        cache.put("b", "2".to_string());
        tokio::time::advance(Duration::from_secs(6)).await;

        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("b"), Some("2".to_string()));
    }
}
