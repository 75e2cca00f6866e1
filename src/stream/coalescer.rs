/**
 * Change coalescing
 *
 * Turns bursts of raw change signals into one notification per stream key.
 * The first signal for an idle key arms a timer for the quiet window; later
 * signals ride along without re-arming it, so continuous churn still fires
 * once per window.
 */
use crate::k8s::tenant::StreamKey;
use futures::future::BoxFuture;
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, trace};

type FireFn = Arc<dyn Fn(StreamKey) -> BoxFuture<'static, ()> + Send + Sync>;

pub struct ChangeCoalescer {
    window: Duration,
    pending: Mutex<HashSet<StreamKey>>,
    fire: FireFn,
    signals: AtomicU64,
    fires: AtomicU64,
}

impl ChangeCoalescer {
    pub fn new<F, Fut>(window: Duration, fire: F) -> Arc<Self>
    where
        F: Fn(StreamKey) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let fire: FireFn = Arc::new(move |key| Box::pin(fire(key)));
        Arc::new(Self {
            window,
            pending: Mutex::new(HashSet::new()),
            fire,
            signals: AtomicU64::new(0),
            fires: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub const fn window(&self) -> Duration {
        self.window
    }

    /// Record a change for `key`; fires at most one window later
    pub fn signal(self: &Arc<Self>, key: &StreamKey) {
        self.signals.fetch_add(1, Ordering::Relaxed);

        let armed = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone());
        if !armed {
            trace!("⏳ coalesced into pending fire: {}", key);
            return;
        }

        let coalescer = Arc::clone(self);
        let key = key.clone();
        tokio::spawn(async move {
            sleep(coalescer.window).await;
            // clear before firing so signals raised during the fire re-arm
            coalescer
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&key);
            coalescer.fires.fetch_add(1, Ordering::Relaxed);
            debug!("🔔 COALESCED FIRE: {}", key);
            (coalescer.fire)(key).await;
        });
    }

    pub fn pending_count(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn stats(&self) -> CoalescerStats {
        CoalescerStats {
            signals: self.signals.load(Ordering::Relaxed),
            fires: self.fires.load(Ordering::Relaxed),
            pending: self.pending_count(),
        }
    }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct CoalescerStats {
    pub signals: u64,
    pub fires: u64,
    pub pending: usize,
}
