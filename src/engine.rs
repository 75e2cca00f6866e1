/**
 * Sync engine
 *
 * Owns the tenant client registry, the mirror registry, the coalescer, the
 * stream hub and the result cache, and wires them together: mirrors signal
 * the coalescer, the coalescer fires live feeds, live feeds publish through
 * the hub. Built once at start-up and shared through `Arc`.
 */
use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::k8s::cache::mirror::{MirrorStats, MirrorView};
use crate::k8s::cache::mirror_registry::MirrorRegistry;
use crate::k8s::cache::result_cache::{CacheStats, ResultCache};
use crate::k8s::cache::sweeper::{spawn_mirror_eviction, spawn_sweeper};
use crate::k8s::client_manager::{
    ClientEntry, ClientFactory, TenantClientRegistry, should_refresh_client,
};
use crate::k8s::credentials::ConfigStore;
use crate::k8s::kinds::KindTable;
use crate::k8s::tenant::{Scope, StreamKey, TenantKey, cache_key, object_identity};
use crate::stream::coalescer::{ChangeCoalescer, CoalescerStats};
use crate::stream::feeds::LiveFeeds;
use crate::stream::frame::{data_frame, error_frame};
use crate::stream::hub::{HubStats, Retained, StreamHub, SubscriberStream};
use bytes::Bytes;
use k8s_openapi::serde_json::{Value, json};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const HELM_RELEASES_OPERATION: &str = "helm-releases";

pub struct Engine {
    config: SyncConfig,
    clients: TenantClientRegistry,
    mirrors: Arc<MirrorRegistry>,
    coalescer: Arc<ChangeCoalescer>,
    hub: Arc<StreamHub>,
    feeds: Arc<LiveFeeds>,
    results: Arc<ResultCache<Value>>,
    kinds: KindTable,
    shutdown: CancellationToken,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub clients: usize,
    pub client_constructions: u64,
    pub mirrors: Vec<MirrorStats>,
    pub feeds: usize,
    pub coalescer: CoalescerStats,
    pub hub: HubStats,
    pub cache: CacheStats,
}

impl Engine {
    /// Must be called inside a Tokio runtime: the cache sweeper and the
    /// mirror eviction loop start here.
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn ConfigStore>,
        factory: Arc<dyn ClientFactory>,
        kinds: KindTable,
    ) -> Arc<Self> {
        let shutdown = CancellationToken::new();
        let hub = Arc::new(StreamHub::new(
            config.subscriber_capacity,
            config.max_stream_lifetime,
            shutdown.clone(),
        ));
        let feeds = LiveFeeds::new(hub.clone());

        let fire_feeds = feeds.clone();
        let coalescer = ChangeCoalescer::new(config.coalesce_window, move |key| {
            let feeds = fire_feeds.clone();
            async move { feeds.fire(&key).await }
        });

        let results = Arc::new(ResultCache::new());
        spawn_sweeper(results.clone(), config.sweep_interval, shutdown.clone());

        let mirrors = Arc::new(MirrorRegistry::new(coalescer.clone()));
        spawn_mirror_eviction(
            mirrors.clone(),
            config.sweep_interval.min(config.mirror_idle_grace).max(Duration::from_secs(1)),
            config.mirror_idle_grace,
            shutdown.clone(),
        );

        info!(
            "🚀 Sync engine ready: {} kinds, coalesce window {}ms",
            kinds.names().len(),
            config.coalesce_window.as_millis()
        );

        Arc::new(Self {
            clients: TenantClientRegistry::new(store, factory),
            mirrors,
            coalescer,
            hub,
            feeds,
            results,
            kinds,
            config,
            shutdown,
        })
    }

    #[must_use]
    pub const fn config(&self) -> &SyncConfig {
        &self.config
    }

    #[must_use]
    pub const fn kinds(&self) -> &KindTable {
        &self.kinds
    }

    #[must_use]
    pub const fn hub(&self) -> &Arc<StreamHub> {
        &self.hub
    }

    /// # Errors
    ///
    /// See [`TenantClientRegistry::resolve`]
    pub async fn resolve(&self, tenant: &TenantKey) -> Result<Arc<ClientEntry>> {
        self.clients.resolve(tenant).await
    }

    /// Drop every cached client of a configuration
    pub async fn invalidate_config(&self, config_id: &str) -> usize {
        self.clients.invalidate_config(config_id).await
    }

    /// Namespace filter as it applies to `kind`: cluster-scoped kinds ignore it
    ///
    /// # Errors
    ///
    /// Returns `BadRequest` for an unknown kind
    pub fn scope<'a>(&self, kind: &str, namespace: Option<&'a str>) -> Result<Option<&'a str>> {
        let capability = self.kinds.get(kind)?;
        Ok(namespace.filter(|ns| capability.namespaced() && !ns.is_empty()))
    }

    /// The mirror of `kind` for `tenant`, waiting for its initial list
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown kind, an unresolvable tenant, or a
    /// mirror whose watch cannot complete its initial list in time
    pub async fn mirror(&self, tenant: &TenantKey, kind: &str) -> Result<Arc<dyn MirrorView>> {
        let capability = self.kinds.get(kind)?;
        let entry = self.clients.resolve(tenant).await?;
        let mirror = capability.open(&self.mirrors, tenant, entry.client())?;

        if !mirror.wait_ready(self.config.mirror_ready_timeout).await {
            let err = mirror.last_error().unwrap_or_else(|| {
                Error::FetchFailed(format!("{tenant}/{kind} did not finish its initial list"))
            });
            warn!("⏱️  Mirror {}/{} not ready: {}", tenant, kind, err);
            return Err(err);
        }
        Ok(mirror)
    }

    /// # Errors
    ///
    /// See [`Engine::mirror`]
    pub async fn list(&self, tenant: &TenantKey, kind: &str, namespace: Option<&str>) -> Result<Value> {
        let namespace = self.scope(kind, namespace)?;
        self.mirror(tenant, kind).await?.list_json(namespace)
    }

    /// # Errors
    ///
    /// Returns `NotFound` if the object is not in the mirror, otherwise see
    /// [`Engine::mirror`]
    pub async fn get(&self, tenant: &TenantKey, kind: &str, namespace: Option<&str>, name: &str) -> Result<Value> {
        let namespace = self.scope(kind, namespace)?;
        lookup(self.mirror(tenant, kind).await?.as_ref(), namespace, name)
    }

    /// Stream the list of `kind`: the current snapshot first, then a fresh
    /// snapshot after every coalesced change.
    ///
    /// # Errors
    ///
    /// Returns setup errors; later failures travel as error frames
    pub async fn stream_list(
        &self,
        tenant: &TenantKey,
        kind: &str,
        namespace: Option<&str>,
        cancel: CancellationToken,
    ) -> Result<SubscriberStream> {
        let namespace = self.scope(kind, namespace)?.map(str::to_owned);
        let mirror = self.mirror(tenant, kind).await?;
        let key = StreamKey::new(tenant, kind, Scope::collection(namespace.as_deref()));

        let view = mirror.clone();
        let snapshot = move || {
            let view = view.clone();
            let namespace = namespace.clone();
            async move { view.list_json(namespace.as_deref()) }
        };
        let initial = snapshot().await?;
        self.serve_live(key, mirror, snapshot, &initial, cancel)
    }

    /// Stream a single object. A missing object is reported as an error
    /// frame and the stream stays open until it appears.
    ///
    /// # Errors
    ///
    /// Returns setup errors; later failures travel as error frames
    pub async fn stream_object(
        &self,
        tenant: &TenantKey,
        kind: &str,
        namespace: Option<&str>,
        name: &str,
        cancel: CancellationToken,
    ) -> Result<SubscriberStream> {
        let namespace = self.scope(kind, namespace)?.map(str::to_owned);
        let mirror = self.mirror(tenant, kind).await?;
        let key = StreamKey::new(tenant, kind, Scope::object(namespace.as_deref(), name));

        let view = mirror.clone();
        let name = name.to_string();
        let snapshot = move || {
            let view = view.clone();
            let namespace = namespace.clone();
            let name = name.clone();
            async move { lookup(view.as_ref(), namespace.as_deref(), &name) }
        };
        let initial = snapshot().await;
        let stream = match initial {
            Ok(initial) => self.serve_live(key, mirror, snapshot, &initial, cancel)?,
            Err(e) => {
                let frame = error_frame(&e);
                self.serve_live_frame(key, mirror, snapshot, frame, cancel)?
            }
        };
        Ok(stream)
    }

    fn serve_live<F, Fut>(
        &self,
        key: StreamKey,
        mirror: Arc<dyn MirrorView>,
        snapshot: F,
        initial: &Value,
        cancel: CancellationToken,
    ) -> Result<SubscriberStream>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let frame = data_frame(initial)?;
        self.serve_live_frame(key, mirror, snapshot, frame, cancel)
    }

    fn serve_live_frame<F, Fut>(
        &self,
        key: StreamKey,
        mirror: Arc<dyn MirrorView>,
        snapshot: F,
        initial: Bytes,
        cancel: CancellationToken,
    ) -> Result<SubscriberStream>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let attachment = mirror.attach(key.clone());
        let feed = self.feeds.register(key.clone(), snapshot);
        let retained: Retained = vec![Box::new(attachment), Box::new(feed)];
        debug!("📡 Live stream {}", key);
        self.hub.serve(key, cancel, Some(initial), retained)
    }

    /// Helm releases through the result cache: stale values are served
    /// while a background refresh runs.
    ///
    /// # Errors
    ///
    /// Returns client resolution errors and the fetch error of a cold miss
    pub async fn helm_releases(self: &Arc<Self>, tenant: &TenantKey, namespace: Option<&str>) -> Result<Value> {
        let entry = self.clients.resolve(tenant).await?;
        let key = cache_key(HELM_RELEASES_OPERATION, tenant, namespace);

        let engine = Arc::clone(self);
        let tenant = tenant.clone();
        let namespace = namespace.map(str::to_owned);
        let fetch = move || async move {
            match entry.helm().list_releases(namespace.as_deref()).await {
                Ok(releases) => Ok(json!({ "releases": releases })),
                Err(Error::Kube(e)) if should_refresh_client(&e) => {
                    engine.clients.invalidate(&tenant).await;
                    Err(Error::Kube(e))
                }
                Err(e) => Err(e),
            }
        };

        self.results
            .get_or_refresh(&key, fetch, self.config.helm_cache_ttl)
            .await
    }

    /// Poll Helm releases every `poll_interval` and push each result
    ///
    /// # Errors
    ///
    /// Returns the client resolution error when the tenant is unusable
    pub async fn stream_helm_releases(
        self: &Arc<Self>,
        tenant: &TenantKey,
        namespace: Option<&str>,
        cancel: CancellationToken,
    ) -> Result<SubscriberStream> {
        self.clients.resolve(tenant).await?;
        let key = StreamKey::new(tenant, HELM_RELEASES_OPERATION, Scope::collection(namespace));
        let initial = self.helm_releases(tenant, namespace).await;

        let engine = Arc::clone(self);
        let tenant = tenant.clone();
        let namespace = namespace.map(str::to_owned);
        let refresh = move || {
            let engine = engine.clone();
            let tenant = tenant.clone();
            let namespace = namespace.clone();
            async move { engine.helm_releases(&tenant, namespace.as_deref()).await }
        };

        self.hub.serve_polling(
            key,
            cancel,
            &initial,
            refresh,
            self.config.poll_interval,
            Vec::new(),
        )
    }

    pub async fn stats(&self) -> EngineStats {
        EngineStats {
            clients: self.clients.len().await,
            client_constructions: self.clients.constructions(),
            mirrors: self.mirrors.stats(),
            feeds: self.feeds.len(),
            coalescer: self.coalescer.stats(),
            hub: self.hub.stats(),
            cache: self.results.stats().await,
        }
    }

    /// Close every stream and stop background loops
    pub fn shutdown(&self) {
        info!("🛑 Sync engine shutting down");
        self.hub.shutdown();
        self.shutdown.cancel();
    }
}

fn lookup(mirror: &dyn MirrorView, namespace: Option<&str>, name: &str) -> Result<Value> {
    mirror.get_json(namespace, name)?.ok_or_else(|| {
        Error::NotFound(format!(
            "{} {}",
            mirror.kind(),
            object_identity(namespace, name)
        ))
    })
}
