/// End-to-end pipeline without a cluster: a channel-fed watch source drives
/// a mirror, the coalescer batches its changes and the hub pushes snapshots
/// to a served subscriber.
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::serde_json::{self, Value};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::watcher;
use kubepulse::k8s::cache::mirror::{MirrorView, Transform, WatchStream};
use kubepulse::k8s::cache::{MirrorRegistry, WatchSource};
use kubepulse::k8s::tenant::{Scope, StreamKey, TenantKey};
use kubepulse::stream::hub::Retained;
use kubepulse::stream::{ChangeCoalescer, LiveFeeds, StreamHub, SubscriberStream};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep, timeout};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

type EventResult = Result<watcher::Event<Pod>, watcher::Error>;

struct ChannelSource(Mutex<Option<mpsc::UnboundedReceiver<EventResult>>>);

impl WatchSource<Pod> for ChannelSource {
    fn watch(&self) -> WatchStream<Pod> {
        match self.0.lock().unwrap().take() {
            Some(rx) => UnboundedReceiverStream::new(rx).boxed(),
            None => futures::stream::pending().boxed() as BoxStream<'static, EventResult>,
        }
    }
}

fn pod(name: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            ..ObjectMeta::default()
        },
        ..Pod::default()
    }
}

fn items(frame: &Bytes) -> Vec<Value> {
    let text = std::str::from_utf8(frame).unwrap();
    let json = text
        .strip_prefix("data: ")
        .and_then(|rest| rest.strip_suffix("\n\n"))
        .expect("frame must be `data: <json>\\n\\n`");
    let payload: Value = serde_json::from_str(json).unwrap();
    payload["items"].as_array().cloned().unwrap_or_default()
}

async fn next_frame(stream: &mut SubscriberStream, wait: Duration) -> Option<Bytes> {
    timeout(wait, stream.next())
        .await
        .ok()
        .flatten()
        .map(|frame| frame.unwrap_or_else(|never| match never {}))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_burst_of_adds_reaches_subscriber_as_one_snapshot() {
    let window = Duration::from_millis(250);
    let hub = Arc::new(StreamHub::new(16, None, CancellationToken::new()));
    let feeds = LiveFeeds::new(hub.clone());
    let fire_feeds = feeds.clone();
    let coalescer = ChangeCoalescer::new(window, move |key| {
        let feeds = fire_feeds.clone();
        async move { feeds.fire(&key).await }
    });
    let mirrors = MirrorRegistry::new(coalescer.clone());

    let tenant = TenantKey::new("cfg-a", "prod");
    let (events, rx) = mpsc::unbounded_channel();
    let source = ChannelSource(Mutex::new(Some(rx)));
    let identity: Transform<Pod> = Arc::new(|pod| pod);
    let mirror = mirrors.open(&tenant, "pods", || source, identity).unwrap();

    events.send(Ok(watcher::Event::Init)).unwrap();
    events.send(Ok(watcher::Event::InitDone)).unwrap();
    assert!(mirror.wait_ready(Duration::from_secs(1)).await);

    let key = StreamKey::new(&tenant, "pods", Scope::All);
    let view: Arc<dyn MirrorView> = mirror.clone();
    let attachment = view.clone().attach(key.clone());
    let snapshot_view = view.clone();
    let feed = feeds.register(key.clone(), move || {
        let view = snapshot_view.clone();
        async move { view.list_json(None) }
    });
    let initial = kubepulse::stream::data_frame(&view.list_json(None).unwrap()).unwrap();
    let retained: Retained = vec![Box::new(attachment), Box::new(feed)];
    let mut stream = hub
        .serve(key.clone(), CancellationToken::new(), Some(initial), retained)
        .unwrap();

    let first = next_frame(&mut stream, Duration::from_secs(1)).await.unwrap();
    assert!(items(&first).is_empty());

    let started = Instant::now();
    for i in 0..50 {
        events.send(Ok(watcher::Event::Apply(pod(&format!("web-{i:02}"))))).unwrap();
        sleep(Duration::from_millis(2)).await;
    }

    let update = next_frame(&mut stream, Duration::from_secs(1)).await.unwrap();
    let latency = started.elapsed();
    assert_eq!(items(&update).len(), 50, "one snapshot must carry every add");
    assert!(latency >= window, "fired before the window elapsed: {latency:?}");
    assert!(latency < window + Duration::from_millis(200), "fired late: {latency:?}");

    assert!(
        next_frame(&mut stream, Duration::from_millis(400)).await.is_none(),
        "a finite burst fires once"
    );
    assert_eq!(coalescer.stats().fires, 1);
    assert_eq!(hub.subscriber_count(&key), 1);

    drop(stream);
    for _ in 0..100 {
        if hub.subscriber_count(&key) == 0 && feeds.is_empty() && mirror.stats().attached == 0 {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(hub.subscriber_count(&key), 0);
    assert!(feeds.is_empty());
    assert_eq!(mirror.stats().attached, 0);
}
