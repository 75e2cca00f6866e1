/**
 * Tenant configuration lookup
 *
 * A tenant configuration is a kubeconfig document identified by a config id;
 * each of its contexts names one reachable cluster.
 */
use crate::error::Result;
use async_trait::async_trait;
use kube::config::Kubeconfig;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct TenantConfig {
    pub id: String,
    pub kubeconfig: Kubeconfig,
}

impl TenantConfig {
    #[must_use]
    pub fn has_context(&self, name: &str) -> bool {
        self.kubeconfig.contexts.iter().any(|c| c.name == name)
    }

    #[must_use]
    pub fn contexts(&self) -> Vec<&str> {
        self.kubeconfig
            .contexts
            .iter()
            .map(|c| c.name.as_str())
            .collect()
    }
}

#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// `Ok(None)` when no configuration exists for `config_id`
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration exists but cannot be read
    async fn lookup(&self, config_id: &str) -> Result<Option<TenantConfig>>;
}

/// One kubeconfig per tenant in a directory: `<config_id>.yaml` or `.yml`
pub struct FileConfigStore {
    dir: PathBuf,
}

impl FileConfigStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

fn is_plain_id(config_id: &str) -> bool {
    !config_id.is_empty()
        && !config_id.starts_with('.')
        && config_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

#[async_trait]
impl ConfigStore for FileConfigStore {
    async fn lookup(&self, config_id: &str) -> Result<Option<TenantConfig>> {
        if !is_plain_id(config_id) {
            debug!("Rejecting config id {:?}", config_id);
            return Ok(None);
        }

        for extension in ["yaml", "yml"] {
            let path = self.dir.join(format!("{config_id}.{extension}"));
            match tokio::fs::read_to_string(&path).await {
                Ok(text) => {
                    debug!("📄 Loaded tenant config {}", path.display());
                    return Ok(Some(TenantConfig {
                        id: config_id.to_string(),
                        kubeconfig: Kubeconfig::from_yaml(&text)?,
                    }));
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }
}

/// In-memory configurations
#[derive(Default)]
pub struct StaticConfigStore {
    configs: HashMap<String, Kubeconfig>,
}

impl StaticConfigStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, config_id: impl Into<String>, kubeconfig: Kubeconfig) -> Self {
        self.configs.insert(config_id.into(), kubeconfig);
        self
    }
}

#[async_trait]
impl ConfigStore for StaticConfigStore {
    async fn lookup(&self, config_id: &str) -> Result<Option<TenantConfig>> {
        Ok(self.configs.get(config_id).map(|kubeconfig| TenantConfig {
            id: config_id.to_string(),
            kubeconfig: kubeconfig.clone(),
        }))
    }
}
