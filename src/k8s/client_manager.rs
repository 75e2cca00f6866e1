use super::credentials::{ConfigStore, TenantConfig};
use super::helm::HelmClient;
use super::tenant::TenantKey;
use super::{USER_AGENT, client};
use crate::error::{Error, Result};
use async_trait::async_trait;
use kube::Client;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, error, info};

/// Builds the API client of one tenant cluster
#[async_trait]
pub trait ClientFactory: Send + Sync {
    /// # Errors
    ///
    /// Returns an error if the client cannot be built
    async fn build(&self, tenant: &TenantKey, config: &TenantConfig) -> Result<Client>;
}

/// Builds clients from the tenant's kubeconfig, selecting the context named
/// after the cluster
pub struct KubeClientFactory {
    user_agent: String,
}

impl KubeClientFactory {
    pub fn new(user_agent: impl Into<String>) -> Self {
        Self {
            user_agent: user_agent.into(),
        }
    }
}

impl Default for KubeClientFactory {
    fn default() -> Self {
        Self::new(USER_AGENT)
    }
}

#[async_trait]
impl ClientFactory for KubeClientFactory {
    async fn build(&self, tenant: &TenantKey, config: &TenantConfig) -> Result<Client> {
        client::for_context(
            config.kubeconfig.clone(),
            tenant.cluster(),
            Some(&self.user_agent),
        )
        .await
    }
}

/// Clients of one tenant cluster. Never mutated; invalidation replaces it.
pub struct ClientEntry {
    tenant: TenantKey,
    client: Client,
    helm: HelmClient,
    created_at: Instant,
}

impl fmt::Debug for ClientEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientEntry")
            .field("tenant", &self.tenant)
            .field("age", &self.age())
            .finish_non_exhaustive()
    }
}

impl ClientEntry {
    #[must_use]
    pub fn new(tenant: TenantKey, client: Client) -> Self {
        Self {
            helm: HelmClient::new(client.clone()),
            tenant,
            client,
            created_at: Instant::now(),
        }
    }

    #[must_use]
    pub const fn tenant(&self) -> &TenantKey {
        &self.tenant
    }

    #[must_use]
    pub const fn client(&self) -> &Client {
        &self.client
    }

    #[must_use]
    pub const fn helm(&self) -> &HelmClient {
        &self.helm
    }

    #[must_use]
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

/// Lazily built, shared clients per (config id, cluster).
///
/// Concurrent resolves of one tenant wait on a single construction.
/// Failures are returned to every waiter and not remembered, so the next
/// resolve tries again.
pub struct TenantClientRegistry {
    store: Arc<dyn ConfigStore>,
    factory: Arc<dyn ClientFactory>,
    clients: RwLock<HashMap<TenantKey, Arc<OnceCell<Arc<ClientEntry>>>>>,
    constructions: AtomicU64,
}

impl TenantClientRegistry {
    pub fn new(store: Arc<dyn ConfigStore>, factory: Arc<dyn ClientFactory>) -> Self {
        Self {
            store,
            factory,
            clients: RwLock::new(HashMap::new()),
            constructions: AtomicU64::new(0),
        }
    }

    /// # Errors
    ///
    /// Returns `ConfigNotFound` if the configuration or its cluster context
    /// does not exist, and `ClientConstruction` if building the client failed
    pub async fn resolve(&self, tenant: &TenantKey) -> Result<Arc<ClientEntry>> {
        let existing = self.clients.read().await.get(tenant).cloned();
        let cell = match existing {
            Some(cell) => cell,
            None => self
                .clients
                .write()
                .await
                .entry(tenant.clone())
                .or_default()
                .clone(),
        };

        if let Some(entry) = cell.get() {
            debug!("♻️ Reusing client for {}", tenant);
            return Ok(entry.clone());
        }

        match cell.get_or_try_init(|| self.construct(tenant)).await {
            Ok(entry) => Ok(entry.clone()),
            Err(e) => {
                self.forget_failed(tenant, &cell).await;
                Err(e)
            }
        }
    }

    /// Drop the slot of a failed construction unless another resolve has
    /// replaced or filled it meanwhile
    async fn forget_failed(&self, tenant: &TenantKey, cell: &Arc<OnceCell<Arc<ClientEntry>>>) {
        let mut clients = self.clients.write().await;
        let stale = clients
            .get(tenant)
            .is_some_and(|current| Arc::ptr_eq(current, cell) && !current.initialized());
        if stale {
            clients.remove(tenant);
        }
    }

    async fn construct(&self, tenant: &TenantKey) -> Result<Arc<ClientEntry>> {
        debug!("🔧 Creating client for {}", tenant);
        let config = self
            .store
            .lookup(tenant.config_id())
            .await?
            .ok_or_else(|| Error::ConfigNotFound(tenant.config_id().to_string()))?;

        if !config.has_context(tenant.cluster()) {
            return Err(Error::ConfigNotFound(tenant.to_string()));
        }

        let client = self.factory.build(tenant, &config).await.map_err(|e| {
            error!("❌ Failed to create client for {}: {}", tenant, e);
            match e {
                Error::ConfigNotFound(_) | Error::ClientConstruction { .. } => e,
                other => Error::ClientConstruction {
                    tenant: tenant.clone(),
                    reason: other.to_string(),
                },
            }
        })?;

        self.constructions.fetch_add(1, Ordering::Relaxed);
        info!("✅ Created client for {}", tenant);
        Ok(Arc::new(ClientEntry::new(tenant.clone(), client)))
    }

    /// Forget the client of one tenant; the next resolve rebuilds it
    pub async fn invalidate(&self, tenant: &TenantKey) -> bool {
        let removed = self.clients.write().await.remove(tenant).is_some();
        if removed {
            info!("🔄 Invalidated client for {}", tenant);
        }
        removed
    }

    /// Forget every cluster client of a configuration. Returns how many
    /// were dropped.
    pub async fn invalidate_config(&self, config_id: &str) -> usize {
        let mut clients = self.clients.write().await;
        let before = clients.len();
        clients.retain(|tenant, _| tenant.config_id() != config_id);
        let removed = before - clients.len();
        info!("🔄 Invalidated {} clients of config {}", removed, config_id);
        removed
    }

    pub async fn len(&self) -> usize {
        self.clients
            .read()
            .await
            .values()
            .filter(|cell| cell.initialized())
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub fn constructions(&self) -> u64 {
        self.constructions.load(Ordering::Relaxed)
    }
}

/// Helper function for handling Kubernetes API errors that might indicate
/// authentication issues. Returns true if the client should be refreshed.
pub const fn should_refresh_client(error: &kube::Error) -> bool {
    match error {
        kube::Error::Api(api_error) => {
            // Check for authentication/authorization errors
            matches!(api_error.code, 401 | 403)
        }
        kube::Error::Auth(_) => true,
        _ => false,
    }
}
