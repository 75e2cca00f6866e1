/**
 * Resource mirror
 *
 * Local, watch-fed copy of one resource kind in one tenant cluster. The
 * store is ordered by object id (`<namespace>/<name>` or `<name>`) and only
 * the ingest task writes to it. Every applied change signals the coalescer
 * for each stream key attached to the mirror.
 */
use crate::config::{INITIAL_BACKOFF_SECONDS, MAX_BACKOFF_SECONDS, MAX_WATCH_RESTARTS};
use crate::error::{Error, ErrorKind, Result};
use crate::k8s::cache::errors::lock_poisoned_error;
use crate::k8s::tenant::{StreamKey, TenantKey, object_identity};
use crate::stream::coalescer::ChangeCoalescer;
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use k8s_openapi::serde_json::{self, Value, json};
use kube::api::Api;
use kube::runtime::watcher;
use kube::{Client, Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};

/// Objects a mirror can hold
pub trait MirroredObject:
    Resource<DynamicType = ()> + Clone + DeserializeOwned + Serialize + Debug + Send + Sync + 'static
{
}

impl<K> MirroredObject for K where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Serialize + Debug + Send + Sync + 'static
{
}

pub type WatchStream<K> = BoxStream<'static, core::result::Result<watcher::Event<K>, watcher::Error>>;

/// Where a mirror's events come from. Each call starts a fresh watch that
/// begins with a full relist.
pub trait WatchSource<K>: Send + Sync + 'static {
    fn watch(&self) -> WatchStream<K>;
}

/// Cluster-wide `kube::runtime::watcher` over one resource type
pub struct KubeWatchSource<K> {
    api: Api<K>,
    config: watcher::Config,
}

impl<K: MirroredObject> KubeWatchSource<K> {
    #[must_use]
    pub fn all(client: Client) -> Self {
        Self {
            api: Api::all(client),
            config: watcher::Config::default(),
        }
    }
}

impl<K: MirroredObject> WatchSource<K> for KubeWatchSource<K> {
    fn watch(&self) -> WatchStream<K> {
        watcher(self.api.clone(), self.config.clone()).boxed()
    }
}

pub type Transform<K> = Arc<dyn Fn(K) -> K + Send + Sync>;

/// Error budget and backoff of a mirror's watch
#[derive(Debug, Clone, Copy)]
pub struct RestartPolicy {
    /// Consecutive failures after which the mirror stops for good
    pub max_restarts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: MAX_WATCH_RESTARTS,
            initial_backoff: Duration::from_secs(INITIAL_BACKOFF_SECONDS),
            max_backoff: Duration::from_secs(MAX_BACKOFF_SECONDS),
        }
    }
}

/// Store key of an object
pub fn object_id<K: Resource>(obj: &K) -> String {
    object_identity(obj.namespace().as_deref(), &obj.name_any())
}

#[derive(Debug, Clone, Serialize)]
pub struct MirrorStats {
    pub tenant: TenantKey,
    pub kind: &'static str,
    pub objects: usize,
    pub ready: bool,
    pub stopped: bool,
    pub attached: usize,
    pub events: u64,
    pub restarts: u32,
}

/// Type-erased view of a mirror, rendered as JSON
#[async_trait]
pub trait MirrorView: Send + Sync + 'static {
    fn kind(&self) -> &'static str;

    /// `{"kind": .., "items": [..]}`, optionally limited to one namespace
    ///
    /// # Errors
    ///
    /// Returns an error if an object cannot be serialized
    fn list_json(&self, namespace: Option<&str>) -> Result<Value>;

    /// # Errors
    ///
    /// Returns an error if the object cannot be serialized
    fn get_json(&self, namespace: Option<&str>, name: &str) -> Result<Option<Value>>;

    /// Route change signals of this mirror to `key` while the returned
    /// attachment lives
    fn attach(self: Arc<Self>, key: StreamKey) -> Attachment;

    fn detach(&self, key: &StreamKey);

    fn is_ready(&self) -> bool;

    /// The watch gave up; the store no longer follows the cluster
    fn is_stopped(&self) -> bool;

    /// Wait until the initial list has been stored; `false` on timeout or
    /// once the watch has stopped
    async fn wait_ready(&self, limit: Duration) -> bool;

    /// Why the watch is not delivering, if it is currently failing
    fn last_error(&self) -> Option<Error>;

    fn stats(&self) -> MirrorStats;

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Keeps a stream key attached to a mirror, and the mirror alive
pub struct Attachment {
    mirror: Arc<dyn MirrorView>,
    key: StreamKey,
}

impl Drop for Attachment {
    fn drop(&mut self) {
        self.mirror.detach(&self.key);
    }
}

struct MirrorState<K> {
    store: RwLock<BTreeMap<String, Arc<K>>>,
    attached: Mutex<HashMap<StreamKey, usize>>,
    coalescer: Arc<ChangeCoalescer>,
    transform: Transform<K>,
    ready: watch::Sender<bool>,
    stopped: AtomicBool,
    last_error: Mutex<Option<(ErrorKind, String)>>,
    events: AtomicU64,
    restarts: AtomicU32,
}

pub struct Mirror<K> {
    tenant: TenantKey,
    kind: &'static str,
    state: Arc<MirrorState<K>>,
    _watch: DropGuard,
    _object: PhantomData<fn() -> K>,
}

impl<K: MirroredObject> Mirror<K> {
    /// Start mirroring `source`. The ingest task stops when the mirror is
    /// dropped, or after `policy.max_restarts` consecutive watch failures.
    pub fn spawn<S>(
        tenant: TenantKey,
        kind: &'static str,
        source: S,
        transform: Transform<K>,
        coalescer: Arc<ChangeCoalescer>,
        policy: RestartPolicy,
    ) -> Arc<Self>
    where
        S: WatchSource<K>,
    {
        let (ready, _) = watch::channel(false);
        let state = Arc::new(MirrorState {
            store: RwLock::new(BTreeMap::new()),
            attached: Mutex::new(HashMap::new()),
            coalescer,
            transform,
            ready,
            stopped: AtomicBool::new(false),
            last_error: Mutex::new(None),
            events: AtomicU64::new(0),
            restarts: AtomicU32::new(0),
        });

        let cancel = CancellationToken::new();
        let label = format!("{tenant}/{kind}");
        tokio::spawn(run_watch(state.clone(), source, cancel.clone(), label, policy));

        Arc::new(Self {
            tenant,
            kind,
            state,
            _watch: cancel.drop_guard(),
            _object: PhantomData,
        })
    }

    /// All objects, ordered by id
    pub fn list(&self) -> Vec<Arc<K>> {
        self.state
            .store
            .read()
            .map(|store| store.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn list_namespace(&self, namespace: &str) -> Vec<Arc<K>> {
        let prefix = format!("{namespace}/");
        self.state
            .store
            .read()
            .map(|store| {
                store
                    .range(prefix.clone()..)
                    .take_while(|(id, _)| id.starts_with(&prefix))
                    .map(|(_, obj)| obj.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn get(&self, id: &str) -> Option<Arc<K>> {
        self.state.store.read().ok()?.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.store.read().map(|store| store.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub const fn tenant(&self) -> &TenantKey {
        &self.tenant
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_stopped() {
            return Err(self.last_error().unwrap_or_else(|| {
                Error::FetchFailed(format!("mirror {}/{} stopped watching", self.tenant, self.kind))
            }));
        }
        Ok(())
    }
}

#[async_trait]
impl<K: MirroredObject> MirrorView for Mirror<K> {
    fn kind(&self) -> &'static str {
        self.kind
    }

    fn list_json(&self, namespace: Option<&str>) -> Result<Value> {
        self.ensure_running()?;
        let objects = match namespace {
            Some(ns) => self.list_namespace(ns),
            None => self.list(),
        };
        let items = objects
            .iter()
            .map(|obj| serde_json::to_value(obj.as_ref()))
            .collect::<core::result::Result<Vec<_>, _>>()?;
        Ok(json!({ "kind": self.kind, "items": items }))
    }

    fn get_json(&self, namespace: Option<&str>, name: &str) -> Result<Option<Value>> {
        self.ensure_running()?;
        self.get(&object_identity(namespace, name))
            .map(|obj| serde_json::to_value(obj.as_ref()).map_err(Error::from))
            .transpose()
    }

    fn attach(self: Arc<Self>, key: StreamKey) -> Attachment {
        *self
            .state
            .attached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.clone())
            .or_insert(0) += 1;
        debug!("📎 ATTACH: {} -> {}/{}", key, self.tenant, self.kind);
        Attachment { mirror: self, key }
    }

    fn detach(&self, key: &StreamKey) {
        let mut attached = self
            .state
            .attached
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(count) = attached.get_mut(key) {
            *count -= 1;
            if *count == 0 {
                attached.remove(key);
                debug!("📎 DETACH: {} -> {}/{}", key, self.tenant, self.kind);
            }
        }
    }

    fn is_ready(&self) -> bool {
        *self.state.ready.borrow()
    }

    fn is_stopped(&self) -> bool {
        self.state.stopped.load(Ordering::Acquire)
    }

    async fn wait_ready(&self, limit: Duration) -> bool {
        let mut ready = self.state.ready.subscribe();
        let stopped = &self.state.stopped;
        let initial_list = async move {
            loop {
                if *ready.borrow_and_update() {
                    return true;
                }
                if stopped.load(Ordering::Acquire) || ready.changed().await.is_err() {
                    return false;
                }
            }
        };
        timeout(limit, initial_list).await.unwrap_or(false)
    }

    fn last_error(&self) -> Option<Error> {
        let last = self
            .state
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()?;
        Some(match last {
            (ErrorKind::PermissionDenied, message) => Error::PermissionDenied(message),
            (_, message) => Error::FetchFailed(message),
        })
    }

    fn stats(&self) -> MirrorStats {
        MirrorStats {
            tenant: self.tenant.clone(),
            kind: self.kind,
            objects: self.len(),
            ready: self.is_ready(),
            stopped: self.is_stopped(),
            attached: self
                .state
                .attached
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
            events: self.state.events.load(Ordering::Relaxed),
            restarts: self.state.restarts.load(Ordering::Relaxed),
        }
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl<K: MirroredObject> MirrorState<K> {
    fn notify(&self) {
        self.events.fetch_add(1, Ordering::Relaxed);
        let keys: Vec<StreamKey> = self
            .attached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        for key in &keys {
            self.coalescer.signal(key);
        }
    }

    fn apply(&self, obj: K) -> Result<()> {
        let obj = (self.transform)(obj);
        let id = object_id(&obj);
        self.store
            .write()
            .map_err(|_| lock_poisoned_error("mirror store"))?
            .insert(id, Arc::new(obj));
        Ok(())
    }

    fn delete(&self, obj: &K) -> Result<()> {
        self.store
            .write()
            .map_err(|_| lock_poisoned_error("mirror store"))?
            .remove(&object_id(obj));
        Ok(())
    }

    fn replace(&self, fresh: BTreeMap<String, Arc<K>>) -> Result<()> {
        *self
            .store
            .write()
            .map_err(|_| lock_poisoned_error("mirror store"))? = fresh;
        Ok(())
    }

    /// The watch is abandoned: readers get the last error from now on and
    /// attached streams are told once
    fn give_up(&self) {
        self.stopped.store(true, Ordering::Release);
        self.ready.send_replace(false);
        self.notify();
    }

    fn record_error(&self, error: Option<&Error>) {
        *self
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = error.map(|e| (e.kind(), e.to_string()));
    }

    /// Consume one watch until it ends or fails
    async fn ingest(&self, mut events: WatchStream<K>) -> Result<()> {
        // objects of a relist in progress; swapped in on InitDone
        let mut relist: Option<BTreeMap<String, Arc<K>>> = None;

        while let Some(event) = events.next().await {
            let event = event.map_err(watch_error)?;
            match event {
                watcher::Event::Init => relist = Some(BTreeMap::new()),
                watcher::Event::InitApply(obj) => {
                    let obj = (self.transform)(obj);
                    relist
                        .get_or_insert_with(BTreeMap::new)
                        .insert(object_id(&obj), Arc::new(obj));
                }
                watcher::Event::InitDone => {
                    let fresh = relist.take().unwrap_or_default();
                    debug!("📋 RELIST: {} objects", fresh.len());
                    self.replace(fresh)?;
                    self.record_error(None);
                    self.ready.send_replace(true);
                    self.notify();
                }
                watcher::Event::Apply(obj) => {
                    self.apply(obj)?;
                    self.notify();
                }
                watcher::Event::Delete(obj) => {
                    self.delete(&obj)?;
                    self.notify();
                }
            }
        }
        Ok(())
    }
}

fn watch_error(err: watcher::Error) -> Error {
    match err {
        watcher::Error::InitialListFailed(e)
        | watcher::Error::WatchStartFailed(e)
        | watcher::Error::WatchFailed(e) => Error::Kube(e),
        other => Error::FetchFailed(format!("watch failed: {other}")),
    }
}

async fn run_watch<K, S>(
    state: Arc<MirrorState<K>>,
    source: S,
    cancel: CancellationToken,
    label: String,
    policy: RestartPolicy,
) where
    K: MirroredObject,
    S: WatchSource<K>,
{
    info!("🔍 Starting mirror watch: {}", label);

    let mut backoff = policy.initial_backoff;
    let mut restart_count = 0;

    loop {
        if restart_count >= policy.max_restarts {
            error!(
                "❌ Mirror watch {} exceeded maximum restart attempts ({}), stopping",
                label, policy.max_restarts
            );
            state.give_up();
            break;
        }

        let outcome = tokio::select! {
            () = cancel.cancelled() => break,
            outcome = state.ingest(source.watch()) => outcome,
        };

        let delay = match outcome {
            Ok(()) => {
                info!("🔍 Mirror watch {} ended normally, restarting...", label);
                backoff = policy.initial_backoff;
                restart_count = 0;
                policy.initial_backoff
            }
            Err(e) => {
                restart_count += 1;
                state.restarts.fetch_add(1, Ordering::Relaxed);
                state.record_error(Some(&e));
                warn!(
                    "❌ Mirror watch {} failed (attempt {}/{}): {}, restarting in {:?}",
                    label, restart_count, policy.max_restarts, e, backoff
                );
                let delay = backoff;
                backoff = (backoff * 2).min(policy.max_backoff);
                delay
            }
        };

        tokio::select! {
            () = cancel.cancelled() => break,
            () = sleep(delay) => {}
        }
    }

    debug!("🔍 Mirror watch stopped: {}", label);
}
