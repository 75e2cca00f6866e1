/**
 * Subscriber multiplexer
 *
 * Every connected client owns one serving task: it holds the request's
 * cancellation token and an outbound frame queue registered under a stream
 * key. Publishing serializes a payload once and pushes the frame into every
 * queue registered for the key.
 */
use super::frame::{data_frame, error_frame};
use crate::error::Result;
use crate::k8s::cache::errors::lock_poisoned_error;
use crate::k8s::tenant::StreamKey;
use bytes::Bytes;
use futures::Stream;
use futures::future::{BoxFuture, FutureExt};
use pin_project::pin_project;
use serde::Serialize;
use std::any::Any;
use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at, sleep};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub type SubscriberId = Uuid;

/// Values kept alive for as long as a subscription is served
pub type Retained = Vec<Box<dyn Any + Send>>;

type FrameSource = Box<dyn FnMut() -> BoxFuture<'static, Bytes> + Send>;

/// A registered output sink
pub struct Subscriber {
    id: SubscriberId,
    sender: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
}

impl Subscriber {
    #[must_use]
    pub fn new(cancel: CancellationToken, capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (
            Self {
                id: Uuid::new_v4(),
                sender,
                cancel,
            },
            receiver,
        )
    }

    #[must_use]
    pub const fn id(&self) -> SubscriberId {
        self.id
    }

    fn is_live(&self) -> bool {
        !self.cancel.is_cancelled() && !self.sender.is_closed()
    }
}

pub struct StreamHub {
    subscribers: RwLock<HashMap<StreamKey, Vec<Subscriber>>>,
    shutdown: CancellationToken,
    capacity: usize,
    max_lifetime: Option<Duration>,
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl StreamHub {
    #[must_use]
    pub fn new(capacity: usize, max_lifetime: Option<Duration>, shutdown: CancellationToken) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            shutdown,
            capacity: capacity.max(1),
            max_lifetime,
            published: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// # Errors
    ///
    /// Returns an error if the subscriber map lock is poisoned
    pub fn register(&self, key: &StreamKey, subscriber: Subscriber) -> Result<SubscriberId> {
        let id = subscriber.id;
        let mut subs = self
            .subscribers
            .write()
            .map_err(|_| lock_poisoned_error("stream hub subscribers"))?;
        subs.entry(key.clone()).or_default().push(subscriber);
        debug!("➕ SUBSCRIBE: {} ({})", key, id);
        Ok(id)
    }

    /// Removing an unknown subscriber is a no-op returning `false`
    ///
    /// # Errors
    ///
    /// Returns an error if the subscriber map lock is poisoned
    pub fn unregister(&self, key: &StreamKey, id: SubscriberId) -> Result<bool> {
        let mut subs = self
            .subscribers
            .write()
            .map_err(|_| lock_poisoned_error("stream hub subscribers"))?;
        let Some(list) = subs.get_mut(key) else {
            return Ok(false);
        };
        let before = list.len();
        list.retain(|s| s.id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            subs.remove(key);
        }
        if removed {
            debug!("➖ UNSUBSCRIBE: {} ({})", key, id);
        }
        Ok(removed)
    }

    /// Serialize `payload` once and deliver it to every subscriber of `key`.
    /// Returns the number of deliveries.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized or the
    /// subscriber map lock is poisoned
    pub fn publish<T: Serialize + ?Sized>(&self, key: &StreamKey, payload: &T) -> Result<usize> {
        if self.subscriber_count(key) == 0 {
            return Ok(0);
        }
        let frame = data_frame(payload)?;
        self.publish_frame(key, &frame)
    }

    /// # Errors
    ///
    /// Returns an error if the subscriber map lock is poisoned
    pub fn publish_frame(&self, key: &StreamKey, frame: &Bytes) -> Result<usize> {
        let mut delivered = 0;
        let mut dead = Vec::new();
        {
            let subs = self
                .subscribers
                .read()
                .map_err(|_| lock_poisoned_error("stream hub subscribers"))?;
            let Some(list) = subs.get(key) else {
                return Ok(0);
            };
            self.published.fetch_add(1, Ordering::Relaxed);

            for subscriber in list {
                match subscriber.sender.try_send(frame.clone()) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        warn!("⚠️  Subscriber {} on {} is lagging, frame dropped", subscriber.id, key);
                    }
                    Err(TrySendError::Closed(_)) => dead.push(subscriber.id),
                }
            }
        }

        for id in dead {
            self.unregister(key, id)?;
        }
        self.delivered.fetch_add(delivered as u64, Ordering::Relaxed);
        Ok(delivered)
    }

    pub fn subscriber_count(&self, key: &StreamKey) -> usize {
        self.subscribers
            .read()
            .map(|subs| subs.get(key).map_or(0, |list| list.iter().filter(|s| s.is_live()).count()))
            .unwrap_or(0)
    }

    /// Serve one subscriber until its request is cancelled, the client goes
    /// away, the server shuts down or the optional lifetime cap elapses.
    ///
    /// `initial` is delivered to this subscriber only, before any published
    /// frame. `retained` is dropped when the serving task ends.
    ///
    /// # Errors
    ///
    /// Returns an error if the subscriber cannot be registered
    pub fn serve(
        self: &Arc<Self>,
        key: StreamKey,
        cancel: CancellationToken,
        initial: Option<Bytes>,
        retained: Retained,
    ) -> Result<SubscriberStream> {
        self.spawn_serving_task(key, cancel, initial, None, retained)
    }

    /// Polling fallback for sources without change events: emit `initial`
    /// right away, then call `refresh` every `interval` and send the result
    /// to this subscriber until it goes away. Identical payloads are resent.
    /// A failed refresh becomes an error frame; the stream stays open.
    ///
    /// # Errors
    ///
    /// Returns an error if the subscriber cannot be registered
    pub fn serve_polling<T, F, Fut>(
        self: &Arc<Self>,
        key: StreamKey,
        cancel: CancellationToken,
        initial: &Result<T>,
        refresh: F,
        interval: Duration,
        retained: Retained,
    ) -> Result<SubscriberStream>
    where
        T: Serialize + Send + 'static,
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let source: FrameSource = Box::new(move || {
            let pending = refresh();
            async move { render(&pending.await) }.boxed()
        });
        let mut ticker = interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.spawn_serving_task(key, cancel, Some(render(initial)), Some((ticker, source)), retained)
    }

    fn spawn_serving_task(
        self: &Arc<Self>,
        key: StreamKey,
        cancel: CancellationToken,
        initial: Option<Bytes>,
        poller: Option<(Interval, FrameSource)>,
        retained: Retained,
    ) -> Result<SubscriberStream> {
        let (subscriber, queue) = Subscriber::new(cancel.clone(), self.capacity);
        let id = self.register(&key, subscriber)?;
        let (body_tx, body_rx) = mpsc::channel(self.capacity);

        let hub = Arc::clone(self);
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            let _retained = retained;
            let reason = hub
                .pump(task_cancel, queue, body_tx, initial, poller)
                .await;
            if let Err(e) = hub.unregister(&key, id) {
                warn!("Failed to unregister {} from {}: {}", id, key, e);
            }
            debug!("🔌 STREAM CLOSED: {} ({}) - {}", key, id, reason);
        });

        Ok(SubscriberStream {
            inner: ReceiverStream::new(body_rx),
            _cancel_on_drop: cancel.drop_guard(),
        })
    }

    async fn pump(
        &self,
        cancel: CancellationToken,
        mut queue: mpsc::Receiver<Bytes>,
        body: mpsc::Sender<Bytes>,
        initial: Option<Bytes>,
        poller: Option<(Interval, FrameSource)>,
    ) -> &'static str {
        if let Some(frame) = initial {
            if body.send(frame).await.is_err() {
                return "client gone";
            }
        }

        let (mut ticker, mut source) = match poller {
            Some((ticker, source)) => (Some(ticker), Some(source)),
            None => (None, None),
        };
        let lifetime = self.max_lifetime;
        let deadline = sleep(lifetime.unwrap_or(Duration::MAX));
        tokio::pin!(deadline);

        loop {
            let frame = tokio::select! {
                () = cancel.cancelled() => return "request cancelled",
                () = self.shutdown.cancelled() => return "server shutdown",
                () = &mut deadline, if lifetime.is_some() => return "max lifetime reached",
                queued = queue.recv() => match queued {
                    Some(frame) => frame,
                    None => return "unregistered",
                },
                () = next_tick(&mut ticker) => match source.as_mut() {
                    Some(source) => tokio::select! {
                        () = cancel.cancelled() => return "request cancelled",
                        () = self.shutdown.cancelled() => return "server shutdown",
                        frame = source() => frame,
                    },
                    None => continue,
                },
            };

            if body.send(frame).await.is_err() {
                return "client gone";
            }
        }
    }

    pub fn stats(&self) -> HubStats {
        let (streams, subscribers) = self
            .subscribers
            .read()
            .map(|subs| (subs.len(), subs.values().map(Vec::len).sum()))
            .unwrap_or((0, 0));
        HubStats {
            streams,
            subscribers,
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Close every serving task
    pub fn shutdown(&self) {
        info!("🛑 Stream hub shutting down ({} streams)", self.stats().streams);
        self.shutdown.cancel();
    }
}

fn render<T: Serialize>(payload: &Result<T>) -> Bytes {
    match payload {
        Ok(value) => data_frame(value).unwrap_or_else(|e| error_frame(&e)),
        Err(e) => error_frame(e),
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Response body of one subscriber. Dropping it cancels the subscriber's
/// request token, which ends its serving task.
#[pin_project]
pub struct SubscriberStream {
    #[pin]
    inner: ReceiverStream<Bytes>,
    _cancel_on_drop: DropGuard,
}

impl Stream for SubscriberStream {
    type Item = core::result::Result<Bytes, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.project().inner.poll_next(cx).map(|frame| frame.map(Ok))
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HubStats {
    pub streams: usize,
    pub subscribers: usize,
    pub published: u64,
    pub delivered: u64,
    pub dropped: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::k8s::tenant::{Scope, TenantKey};
    use futures::StreamExt;
    use k8s_openapi::serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::timeout;

    fn hub() -> Arc<StreamHub> {
        Arc::new(StreamHub::new(16, None, CancellationToken::new()))
    }

    fn key(identity: &str) -> StreamKey {
        StreamKey::new(&TenantKey::new("cfg-a", "prod"), "pods", Scope::collection(Some(identity)))
    }

    async fn next_frame(stream: &mut SubscriberStream) -> Option<Bytes> {
        timeout(Duration::from_secs(1), stream.next())
            .await
            .ok()
            .flatten()
            .map(|frame| frame.unwrap_or_else(|never| match never {}))
    }

    async fn wait_for_count(hub: &StreamHub, key: &StreamKey, expected: usize) -> bool {
        for _ in 0..100 {
            if hub.stats().subscribers == expected && hub.subscriber_count(key) == expected {
                return true;
            }
            sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_publish_fans_out_to_every_subscriber() {
        let hub = hub();
        let k = key("default");
        let mut receivers = Vec::new();
        for _ in 0..3 {
            let (subscriber, rx) = Subscriber::new(CancellationToken::new(), 4);
            hub.register(&k, subscriber).unwrap();
            receivers.push(rx);
        }

        let payload = json!({"items": [1, 2, 3]});
        assert_eq!(hub.publish(&k, &payload).unwrap(), 3);

        let expected = data_frame(&payload).unwrap();
        for rx in &mut receivers {
            assert_eq!(rx.recv().await.unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_noop() {
        let hub = hub();
        assert_eq!(hub.publish(&key("nobody"), &json!({"items": []})).unwrap(), 0);
        assert_eq!(hub.stats().published, 0);
    }

    #[tokio::test]
    async fn test_closed_subscriber_is_removed_on_publish() {
        let hub = hub();
        let k = key("default");
        let (alive, mut alive_rx) = Subscriber::new(CancellationToken::new(), 4);
        let (gone, gone_rx) = Subscriber::new(CancellationToken::new(), 4);
        hub.register(&k, alive).unwrap();
        hub.register(&k, gone).unwrap();
        drop(gone_rx);

        assert_eq!(hub.publish(&k, &json!("x")).unwrap(), 1);
        assert!(alive_rx.recv().await.is_some());
        assert_eq!(hub.stats().subscribers, 1);
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent() {
        let hub = hub();
        let k = key("default");
        let (subscriber, _rx) = Subscriber::new(CancellationToken::new(), 4);
        let id = hub.register(&k, subscriber).unwrap();

        assert!(hub.unregister(&k, id).unwrap());
        assert!(!hub.unregister(&k, id).unwrap());
        assert_eq!(hub.stats().streams, 0);
    }

    #[tokio::test]
    async fn test_served_subscriber_gets_initial_then_published_frames() {
        let hub = hub();
        let k = key("default");
        let cancel = CancellationToken::new();
        let initial = data_frame(&json!({"items": []})).unwrap();
        let mut stream = hub
            .serve(k.clone(), cancel.clone(), Some(initial.clone()), Vec::new())
            .unwrap();

        assert_eq!(next_frame(&mut stream).await.unwrap(), initial);
        assert_eq!(hub.publish(&k, &json!({"items": ["web-0"]})).unwrap(), 1);
        assert_eq!(
            next_frame(&mut stream).await.unwrap(),
            data_frame(&json!({"items": ["web-0"]})).unwrap()
        );

        cancel.cancel();
        assert!(wait_for_count(&hub, &k, 0).await);
        assert!(next_frame(&mut stream).await.is_none());
    }

    #[tokio::test]
    async fn test_dropping_the_body_unregisters_and_releases_retained() {
        let hub = hub();
        let k = key("default");
        let held = Arc::new(());
        let retained: Box<dyn Any + Send> = Box::new(held.clone());
        let stream = hub
            .serve(k.clone(), CancellationToken::new(), None, vec![retained])
            .unwrap();
        assert_eq!(hub.subscriber_count(&k), 1);
        assert_eq!(Arc::strong_count(&held), 2);

        drop(stream);
        assert!(wait_for_count(&hub, &k, 0).await);
        for _ in 0..100 {
            if Arc::strong_count(&held) == 1 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(Arc::strong_count(&held), 1);
    }

    #[tokio::test]
    async fn test_polling_republishes_every_interval() {
        let hub = hub();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut stream = hub
            .serve_polling(
                key("helm"),
                CancellationToken::new(),
                &Ok(json!({"round": 0})),
                move || {
                    let round = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    async move { Ok(json!({"round": round})) }
                },
                Duration::from_millis(30),
                Vec::new(),
            )
            .unwrap();

        for round in 0..3 {
            assert_eq!(
                next_frame(&mut stream).await.unwrap(),
                data_frame(&json!({"round": round})).unwrap()
            );
        }
        assert!(calls.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_polling_error_frame_keeps_stream_open() {
        let hub = hub();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut stream = hub
            .serve_polling(
                key("helm"),
                CancellationToken::new(),
                &Err::<u32, _>(Error::PermissionDenied("secrets".into())),
                move || {
                    let round = counter.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if round == 0 {
                            Err(Error::FetchFailed("timeout".into()))
                        } else {
                            Ok(7_u32)
                        }
                    }
                },
                Duration::from_millis(20),
                Vec::new(),
            )
            .unwrap();

        assert_eq!(
            next_frame(&mut stream).await.unwrap(),
            error_frame(&Error::PermissionDenied("secrets".into()))
        );
        assert_eq!(
            next_frame(&mut stream).await.unwrap(),
            error_frame(&Error::FetchFailed("timeout".into()))
        );
        assert_eq!(next_frame(&mut stream).await.unwrap(), data_frame(&7).unwrap());
    }

    #[tokio::test]
    async fn test_lifetime_cap_and_shutdown_close_streams() {
        let shutdown = CancellationToken::new();
        let capped = Arc::new(StreamHub::new(4, Some(Duration::from_millis(50)), shutdown.clone()));
        let mut stream = capped
            .serve(key("capped"), CancellationToken::new(), None, Vec::new())
            .unwrap();
        assert!(next_frame(&mut stream).await.is_none());

        let mut stream = capped
            .serve(key("open"), CancellationToken::new(), None, Vec::new())
            .unwrap();
        capped.shutdown();
        assert!(next_frame(&mut stream).await.is_none());
    }

    #[tokio::test]
    async fn test_stuck_refresh_still_ends_on_cancel_and_shutdown() {
        let shutdown = CancellationToken::new();
        let hub = Arc::new(StreamHub::new(4, None, shutdown.clone()));
        let started = Arc::new(AtomicUsize::new(0));
        let stuck = |started: Arc<AtomicUsize>| {
            move || {
                started.fetch_add(1, Ordering::SeqCst);
                futures::future::pending::<Result<u32>>()
            }
        };

        let cancel = CancellationToken::new();
        let mut cancelled = hub
            .serve_polling(
                key("stuck-a"),
                cancel.clone(),
                &Ok(0_u32),
                stuck(started.clone()),
                Duration::from_millis(10),
                Vec::new(),
            )
            .unwrap();
        let mut stopped = hub
            .serve_polling(
                key("stuck-b"),
                CancellationToken::new(),
                &Ok(0_u32),
                stuck(started.clone()),
                Duration::from_millis(10),
                Vec::new(),
            )
            .unwrap();
        assert!(next_frame(&mut cancelled).await.is_some());
        assert!(next_frame(&mut stopped).await.is_some());

        for _ in 0..100 {
            if started.load(Ordering::SeqCst) == 2 {
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(started.load(Ordering::SeqCst), 2, "both refreshes are in flight");

        cancel.cancel();
        assert!(next_frame(&mut cancelled).await.is_none());
        for _ in 0..100 {
            if hub.subscriber_count(&key("stuck-a")) == 0 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(hub.subscriber_count(&key("stuck-a")), 0);
        assert_eq!(hub.subscriber_count(&key("stuck-b")), 1);

        hub.shutdown();
        assert!(next_frame(&mut stopped).await.is_none());
        assert!(wait_for_count(&hub, &key("stuck-b"), 0).await);
    }
}
