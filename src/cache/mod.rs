//! Caching utilities.
//!
//! - [`TtlCache`]: in-process TTL cache used for tenant rule lists.
//! - [`SharedCache`]: the key/value store shared across engine instances
//!   (behavior windows, challenges, fingerprint sets).

pub mod shared;

#[cfg(feature = "redis-cache")]
pub mod redis;

pub use shared::{InMemorySharedCache, ResilientCache, SharedCache};

use moka::future::Cache;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// String-keyed cache whose entries expire a fixed time after insertion.
pub struct TtlCache<V: Clone + Send + Sync + 'static> {
    inner: Cache<String, V>,
}

impl<V: Clone + Send + Sync + 'static> TtlCache<V> {
    pub fn new(max_capacity: u64, ttl: Duration) -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(max_capacity)
                .time_to_live(ttl)
                .build(),
        }
    }

    pub async fn get(&self, key: &str) -> Option<V> {
        self.inner.get(key).await
    }

    /// Return the cached value or populate it from `init`.
    ///
    /// Concurrent misses on one key await the same `init`. Failures are
    /// handed to every waiter and leave the key empty.
    pub async fn try_get_with<F, E>(&self, key: &str, init: F) -> Result<V, Arc<E>>
    where
        F: Future<Output = Result<V, E>>,
        E: Send + Sync + 'static,
    {
        self.inner.try_get_with_by_ref(key, init).await
    }

    pub async fn invalidate(&self, key: &str) {
        self.inner.invalidate(key).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn fill(cache: &TtlCache<i32>, key: &str, value: i32) {
        let loaded = cache
            .try_get_with(key, async move { Ok::<_, std::io::Error>(value) })
            .await
            .unwrap();
        assert_eq!(loaded, value);
    }

    #[tokio::test]
    async fn test_entries_expire() {
        let cache = TtlCache::new(100, Duration::from_millis(50));
        fill(&cache, "tenant", 42).await;
        assert_eq!(cache.get("tenant").await, Some(42));
        assert_eq!(cache.get("other").await, None);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(cache.get("tenant").await, None);
    }

    #[tokio::test]
    async fn test_invalidate_one_key() {
        let cache = TtlCache::new(100, Duration::from_secs(60));
        fill(&cache, "a", 1).await;
        fill(&cache, "b", 2).await;

        cache.invalidate("a").await;

        assert_eq!(cache.get("a").await, None);
        assert_eq!(cache.get("b").await, Some(2));
    }

    #[tokio::test]
    async fn test_failed_load_is_not_cached() {
        let cache: TtlCache<i32> = TtlCache::new(100, Duration::from_secs(60));
        let failed = cache
            .try_get_with("t", async { Err::<i32, _>(std::io::Error::other("down")) })
            .await;
        assert!(failed.is_err());
        assert!(cache.get("t").await.is_none());
    }

    #[tokio::test]
    async fn test_try_get_with_coalesces_loads() {
        let cache: Arc<TtlCache<i32>> = Arc::new(TtlCache::new(100, Duration::from_secs(60)));
        let loads = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = Arc::clone(&cache);
            let loads = Arc::clone(&loads);
            handles.push(tokio::spawn(async move {
                cache
                    .try_get_with("tenant", async {
                        loads.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok::<_, std::io::Error>(7)
                    })
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), 7);
        }

        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }
}
