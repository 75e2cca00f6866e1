use serde::Serialize;
use std::fmt;

/// Identifies one logical target cluster: a tenant configuration plus the
/// cluster (kubeconfig context) inside it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TenantKey {
    config_id: String,
    cluster: String,
}

impl TenantKey {
    #[must_use]
    pub fn new(config_id: impl Into<String>, cluster: impl Into<String>) -> Self {
        Self {
            config_id: config_id.into(),
            cluster: cluster.into(),
        }
    }

    #[must_use]
    pub fn config_id(&self) -> &str {
        &self.config_id
    }

    #[must_use]
    pub fn cluster(&self) -> &str {
        &self.cluster
    }
}

impl fmt::Display for TenantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.config_id, self.cluster)
    }
}

/// Item part of a stream key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scope {
    /// Cluster-wide collection
    All,
    /// Collection of one namespace
    Namespace(String),
    /// A single object
    Object { namespace: Option<String>, name: String },
}

impl Scope {
    /// Collection scope; `None` is cluster-wide
    #[must_use]
    pub fn collection(namespace: Option<&str>) -> Self {
        namespace.map_or(Self::All, |ns| Self::Namespace(ns.to_string()))
    }

    #[must_use]
    pub fn object(namespace: Option<&str>, name: &str) -> Self {
        Self::Object {
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
        }
    }

    fn identity(&self) -> String {
        match self {
            Self::All => "all".to_string(),
            Self::Namespace(ns) => ns.clone(),
            Self::Object { namespace, name } => object_identity(namespace.as_deref(), name),
        }
    }
}

/// Addressable identity of one push channel: tenant, resource kind and
/// scope.
///
/// Equality and hashing use the structured parts. The `Display` form
/// (`<configID>-<cluster>-<kind>-<itemIdentity>`, every `/` replaced by `-`)
/// is only an external label and is not unique.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamKey {
    tenant: TenantKey,
    kind: String,
    scope: Scope,
}

impl StreamKey {
    #[must_use]
    pub fn new(tenant: &TenantKey, kind: &str, scope: Scope) -> Self {
        Self {
            tenant: tenant.clone(),
            kind: kind.to_string(),
            scope,
        }
    }

    #[must_use]
    pub const fn tenant(&self) -> &TenantKey {
        &self.tenant
    }

    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    #[must_use]
    pub const fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Normalized external label
    #[must_use]
    pub fn external_id(&self) -> String {
        format!(
            "{}-{}-{}-{}",
            self.tenant.config_id(),
            self.tenant.cluster(),
            self.kind,
            self.scope.identity()
        )
        .replace('/', "-")
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.external_id())
    }
}

impl Serialize for StreamKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Item identity for a single object
#[must_use]
pub fn object_identity(namespace: Option<&str>, name: &str) -> String {
    namespace.map_or_else(|| name.to_string(), |ns| format!("{ns}/{name}"))
}

/// Result cache key: `<operation>:<configID>:<cluster>:<scopeNamespace>`
#[must_use]
pub fn cache_key(operation: &str, tenant: &TenantKey, namespace: Option<&str>) -> String {
    format!(
        "{operation}:{}:{}:{}",
        tenant.config_id(),
        tenant.cluster(),
        namespace.unwrap_or("all")
    )
}
