use super::cached_data::CacheEntry;
use crate::error::{Error, Result};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

type FlightResult<V> = core::result::Result<V, Arc<Error>>;
type SharedFlight<V> = Shared<BoxFuture<'static, FlightResult<V>>>;

/// TTL cache for results too expensive to watch (aggregated listings).
///
/// Reads never block on a refresh once a value exists: stale values are
/// served while a detached task refreshes them. Fetches for one key are
/// single-flight, so concurrent misses share one upstream call.
pub struct ResultCache<V> {
    entries: RwLock<HashMap<String, CacheEntry<V>>>,
    // lock order: inflight before entries
    inflight: Mutex<HashMap<String, SharedFlight<V>>>,
    hits: AtomicU64,
    stale_hits: AtomicU64,
    misses: AtomicU64,
    fetch_failures: AtomicU64,
}

impl<V> Default for ResultCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<V> ResultCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            stale_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            fetch_failures: AtomicU64::new(0),
        }
    }

    /// Returns the cached value and whether it is still fresh
    pub async fn get(&self, key: &str) -> Option<(V, bool)> {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .map(|entry| (entry.data.clone(), entry.is_fresh()))
    }

    pub async fn set(&self, key: &str, value: V, ttl: Duration) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(key) {
            entry.update(value, ttl);
        } else {
            entries.insert(key.to_string(), CacheEntry::new(value, ttl));
        }
    }

    pub async fn remove(&self, key: &str) -> bool {
        self.entries.write().await.remove(key).is_some()
    }

    /// Serve from cache when possible, fetch synchronously on a miss.
    ///
    /// A stale hit is returned immediately and kicks a background refresh.
    /// A miss joins any fetch already in flight for `key`.
    ///
    /// # Errors
    ///
    /// Returns the fetch error on a cold miss. Errors of background
    /// refreshes are only logged.
    pub async fn get_or_refresh<F, Fut>(self: &Arc<Self>, key: &str, fetch: F, ttl: Duration) -> Result<V>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        if let Some((data, fresh)) = self.get(key).await {
            if fresh {
                debug!("🎯 Cache HIT: {}", key);
                self.hits.fetch_add(1, Ordering::Relaxed);
            } else {
                debug!("🔄 Cache STALE: {}", key);
                self.stale_hits.fetch_add(1, Ordering::Relaxed);
                self.refresh_in_background(key, fetch, ttl).await;
            }
            return Ok(data);
        }

        let flight = {
            let mut inflight = self.inflight.lock().await;
            // a flight may have landed between the read above and this lock
            if let Some((data, _)) = self.get(key).await {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(data);
            }
            self.misses.fetch_add(1, Ordering::Relaxed);
            if let Some(existing) = inflight.get(key) {
                debug!("🔗 Cache MISS joins in-flight fetch: {}", key);
                existing.clone()
            } else {
                debug!("❌ Cache MISS: {}", key);
                let flight = self.start_flight(key.to_string(), fetch, ttl);
                inflight.insert(key.to_string(), flight.clone());
                flight
            }
        };

        flight.await.map_err(Error::Shared)
    }

    /// Start a detached refresh unless one is already running for `key`
    pub async fn refresh_in_background<F, Fut>(self: &Arc<Self>, key: &str, fetch: F, ttl: Duration)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let mut inflight = self.inflight.lock().await;
        if inflight.contains_key(key) {
            debug!("⚠️  Skipping duplicate refresh for: {}", key);
            return;
        }
        let flight = self.start_flight(key.to_string(), fetch, ttl);
        inflight.insert(key.to_string(), flight);
    }

    // Caller must hold the in-flight lock and insert the returned future;
    // the spawned task removes it again once the entry is written.
    fn start_flight<F, Fut>(self: &Arc<Self>, key: String, fetch: F, ttl: Duration) -> SharedFlight<V>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let cache = Arc::clone(self);
        let task_key = key.clone();

        let handle = tokio::spawn(async move {
            let start = Instant::now();
            debug!("🔄 FETCH START: {}", task_key);

            let outcome = match AssertUnwindSafe(async move { fetch().await })
                .catch_unwind()
                .await
            {
                Ok(Ok(value)) => {
                    cache.set(&task_key, value.clone(), ttl).await;
                    info!(
                        "✅ FETCH SUCCESS: {} ({:.2}s)",
                        task_key,
                        start.elapsed().as_secs_f64()
                    );
                    Ok(value)
                }
                Ok(Err(e)) => {
                    cache.fetch_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "❌ FETCH FAILED: {} ({:.2}s) - {}",
                        task_key,
                        start.elapsed().as_secs_f64(),
                        e
                    );
                    Err(Arc::new(e))
                }
                Err(payload) => {
                    cache.fetch_failures.fetch_add(1, Ordering::Relaxed);
                    let message = panic_message(payload.as_ref());
                    error!("💀 FETCH PANICKED: {} - {}", task_key, message);
                    Err(Arc::new(Error::RefreshPanic(message)))
                }
            };

            cache.inflight.lock().await.remove(&task_key);
            outcome
        });

        async move {
            match handle.await {
                Ok(outcome) => outcome,
                Err(join_error) => Err(Arc::new(Error::RefreshPanic(format!(
                    "fetch task for {key} aborted: {join_error}"
                )))),
            }
        }
        .boxed()
        .shared()
    }

    /// Drops entries that have been stale for at least `grace` and are not
    /// being refreshed. Returns the number of removed entries.
    pub async fn sweep(&self, grace: Duration) -> usize {
        let now = Instant::now();
        let refreshing: HashSet<String> = self.inflight.lock().await.keys().cloned().collect();

        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|key, entry| refreshing.contains(key) || !entry.is_abandoned_at(now, grace));
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn stats(&self) -> CacheStats {
        let inflight = self.inflight.lock().await.len();
        let entries = self.entries.read().await;
        let now = Instant::now();
        let fresh_entries = entries.values().filter(|e| e.is_fresh_at(now)).count();

        CacheStats {
            total_entries: entries.len(),
            fresh_entries,
            stale_entries: entries.len() - fresh_entries,
            inflight,
            hits: self.hits.load(Ordering::Relaxed),
            stale_hits: self.stale_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct CacheStats {
    pub total_entries: usize,
    pub fresh_entries: usize,
    pub stale_entries: usize,
    pub inflight: usize,
    pub hits: u64,
    pub stale_hits: u64,
    pub misses: u64,
    pub fetch_failures: u64,
}

impl CacheStats {
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        let served = self.hits + self.stale_hits;
        let total = served + self.misses;
        if total == 0 {
            0.0
        } else {
            served as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::sleep;

    async fn wait_for_fresh(cache: &ResultCache<u32>, key: &str, expected: u32) -> bool {
        for _ in 0..100 {
            if cache.get(key).await == Some((expected, true)) {
                return true;
            }
            sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_ttl_law() {
        let cache = ResultCache::new();
        cache.set("k", 7_u32, Duration::from_millis(100)).await;
        assert_eq!(cache.get("k").await, Some((7, true)));

        sleep(Duration::from_millis(150)).await;
        assert_eq!(cache.get("k").await, Some((7, false)));
        assert_eq!(cache.get("missing").await, None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_single_flight_on_cold_key() {
        let cache = Arc::new(ResultCache::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_refresh(
                        "helm:cfg-a:prod:all",
                        move || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            sleep(Duration::from_millis(50)).await;
                            Ok(42_u32)
                        },
                        Duration::from_secs(60),
                    )
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().await.inflight, 0);
    }

    #[tokio::test]
    async fn test_stale_value_served_while_refreshing() {
        let cache = Arc::new(ResultCache::new());
        cache.set("k", 1_u32, Duration::from_millis(30)).await;
        sleep(Duration::from_millis(60)).await;

        let value = cache
            .get_or_refresh(
                "k",
                || async {
                    sleep(Duration::from_millis(20)).await;
                    Ok(2_u32)
                },
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        assert_eq!(value, 1, "stale value must be returned immediately");
        assert!(wait_for_fresh(&cache, "k", 2).await);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_stale_entry() {
        let cache = Arc::new(ResultCache::new());
        cache.set("k", 1_u32, Duration::from_millis(10)).await;
        sleep(Duration::from_millis(30)).await;

        let value = cache
            .get_or_refresh(
                "k",
                || async { Err(Error::FetchFailed("upstream unavailable".into())) },
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        assert_eq!(value, 1);

        sleep(Duration::from_millis(50)).await;
        assert_eq!(cache.get("k").await, Some((1, false)));
        assert_eq!(cache.stats().await.fetch_failures, 1);
    }

    #[tokio::test]
    async fn test_cold_miss_error_is_not_cached() {
        let cache = Arc::new(ResultCache::<u32>::new());
        let result = cache
            .get_or_refresh(
                "k",
                || async { Err(Error::FetchFailed("boom".into())) },
                Duration::from_secs(60),
            )
            .await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::FetchFailed);
        assert!(cache.get("k").await.is_none());

        let value = cache
            .get_or_refresh("k", || async { Ok(5_u32) }, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(value, 5);
    }

    #[tokio::test]
    async fn test_panicking_fetch_is_recovered() {
        let cache = Arc::new(ResultCache::<u32>::new());
        let result = cache
            .get_or_refresh(
                "k",
                || async {
                    let explode = true;
                    if explode {
                        panic!("chart index exploded");
                    }
                    Ok(0_u32)
                },
                Duration::from_secs(60),
            )
            .await;
        let err = result.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RefreshPanic);
        assert!(err.to_string().contains("chart index exploded"));
        assert_eq!(cache.stats().await.inflight, 0);

        let value = cache
            .get_or_refresh("k", || async { Ok(9_u32) }, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(value, 9);
    }

    #[tokio::test]
    async fn test_sweep_removes_only_abandoned_entries() {
        let cache = ResultCache::new();
        cache.set("old", 1_u32, Duration::from_millis(5)).await;
        cache.set("new", 2_u32, Duration::from_secs(60)).await;
        sleep(Duration::from_millis(30)).await;

        assert_eq!(cache.sweep(Duration::from_secs(60)).await, 0);
        assert_eq!(cache.sweep(Duration::from_millis(10)).await, 1);
        assert!(cache.get("old").await.is_none());
        assert_eq!(cache.get("new").await, Some((2, true)));
    }

    #[tokio::test]
    async fn test_fresh_stale_refresh_timeline() {
        let cache = Arc::new(ResultCache::new());
        let ttl = Duration::from_millis(200);
        cache.set("timeline", 1_u32, ttl).await;

        assert_eq!(cache.get("timeline").await, Some((1, true)));
        sleep(Duration::from_millis(100)).await;
        assert_eq!(cache.get("timeline").await, Some((1, true)));
        sleep(Duration::from_millis(200)).await;

        let served = cache
            .get_or_refresh("timeline", || async { Ok(2_u32) }, ttl)
            .await
            .unwrap();
        assert_eq!(served, 1);
        assert!(wait_for_fresh(&cache, "timeline", 2).await);

        let stats = cache.stats().await;
        assert_eq!(stats.stale_hits, 1);
        assert!(stats.hit_rate() > 0.0);
    }
}
