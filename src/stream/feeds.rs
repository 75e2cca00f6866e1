use super::frame::{data_frame, error_frame};
use super::hub::StreamHub;
use crate::error::Result;
use crate::k8s::tenant::StreamKey;
use futures::future::{BoxFuture, FutureExt};
use k8s_openapi::serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tracing::{trace, warn};

type SnapshotFn = Arc<dyn Fn() -> BoxFuture<'static, Result<Value>> + Send + Sync>;

struct Feed {
    snapshot: SnapshotFn,
    refs: usize,
    // serializes snapshot+publish so frames leave in fire order
    order: Arc<tokio::sync::Mutex<()>>,
}

/// Live stream keys and how to rebuild their payload when a coalesced
/// change fires.
pub struct LiveFeeds {
    hub: Arc<StreamHub>,
    feeds: Mutex<HashMap<StreamKey, Feed>>,
}

impl LiveFeeds {
    #[must_use]
    pub fn new(hub: Arc<StreamHub>) -> Arc<Self> {
        Arc::new(Self {
            hub,
            feeds: Mutex::new(HashMap::new()),
        })
    }

    /// Attach a snapshot builder to `key`. Subscribers of the same key share
    /// the first registered builder; the feed lives until the last guard drops.
    pub fn register<F, Fut>(self: &Arc<Self>, key: StreamKey, snapshot: F) -> FeedGuard
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let mut feeds = self.feeds.lock().unwrap_or_else(PoisonError::into_inner);
        feeds
            .entry(key.clone())
            .and_modify(|feed| feed.refs += 1)
            .or_insert_with(|| Feed {
                snapshot: Arc::new(move || snapshot().boxed()),
                refs: 1,
                order: Arc::new(tokio::sync::Mutex::new(())),
            });

        FeedGuard {
            feeds: Arc::downgrade(self),
            key,
        }
    }

    /// Rebuild the payload of `key` and publish it. Skipped when nobody
    /// listens; a failed snapshot is published as an error frame.
    pub async fn fire(&self, key: &StreamKey) {
        if self.hub.subscriber_count(key) == 0 {
            trace!("🔕 No subscribers for {}, skipping snapshot", key);
            return;
        }

        let Some((snapshot, order)) = self
            .feeds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map(|feed| (feed.snapshot.clone(), feed.order.clone()))
        else {
            return;
        };

        let _ordered = order.lock().await;
        let frame = match snapshot().await {
            Ok(payload) => data_frame(&payload).unwrap_or_else(|e| error_frame(&e)),
            Err(e) => {
                warn!("❌ Snapshot for {} failed: {}", key, e);
                error_frame(&e)
            }
        };

        if let Err(e) = self.hub.publish_frame(key, &frame) {
            warn!("Failed to publish {}: {}", key, e);
        }
    }

    pub fn len(&self) -> usize {
        self.feeds.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn release(&self, key: &StreamKey) {
        let mut feeds = self.feeds.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(feed) = feeds.get_mut(key) {
            feed.refs = feed.refs.saturating_sub(1);
            if feed.refs == 0 {
                feeds.remove(key);
            }
        }
    }
}

/// Keeps a feed registered while a subscriber is served
pub struct FeedGuard {
    feeds: Weak<LiveFeeds>,
    key: StreamKey,
}

impl Drop for FeedGuard {
    fn drop(&mut self) {
        if let Some(feeds) = self.feeds.upgrade() {
            feeds.release(&self.key);
        }
    }
}
