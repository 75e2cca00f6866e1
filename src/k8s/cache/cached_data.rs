use std::time::{Duration, Instant};

/// A cached value and the instant it stops being fresh.
///
/// Stale entries stay readable until a refresh overwrites them or the sweep
/// drops them.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub data: T,
    pub refreshed_at: Instant,
    pub expires_at: Instant,
    pub version: u64, // bumped on every overwrite
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    Stale,
}

impl<T> CacheEntry<T> {
    pub fn new(data: T, ttl: Duration) -> Self {
        let now = Instant::now();
        Self {
            data,
            refreshed_at: now,
            expires_at: now + ttl,
            version: 0,
        }
    }

    pub fn is_fresh_at(&self, now: Instant) -> bool {
        now < self.expires_at
    }

    pub fn is_fresh(&self) -> bool {
        self.is_fresh_at(Instant::now())
    }

    pub fn freshness(&self) -> Freshness {
        if self.is_fresh() {
            Freshness::Fresh
        } else {
            Freshness::Stale
        }
    }

    pub fn age(&self) -> Duration {
        self.refreshed_at.elapsed()
    }

    pub fn update(&mut self, data: T, ttl: Duration) {
        let now = Instant::now();
        self.data = data;
        self.refreshed_at = now;
        self.expires_at = now + ttl;
        self.version += 1;
    }

    /// True once the entry has been stale for at least `grace`
    pub fn is_abandoned_at(&self, now: Instant, grace: Duration) -> bool {
        now.checked_duration_since(self.expires_at)
            .is_some_and(|overdue| overdue >= grace)
    }

    pub fn time_until_expiry(&self) -> Option<Duration> {
        self.expires_at.checked_duration_since(Instant::now())
            .filter(|d| !d.is_zero())
    }
}
