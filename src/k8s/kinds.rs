/**
 * Resource kinds served by the engine
 *
 * Each kind is a type implementing `ResourceKind`; `KindTable` maps the
 * kind names used in URLs to an object-safe capability that opens the
 * matching mirror.
 */
use super::cache::mirror::{KubeWatchSource, MirrorView, MirroredObject, Transform};
use super::cache::mirror_registry::MirrorRegistry;
use super::tenant::TenantKey;
use crate::error::{Error, Result};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, Event, Namespace, Node, Pod, Service};
use kube::{Client, Resource};
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;

const LAST_APPLIED_ANNOTATION: &str = "kubectl.kubernetes.io/last-applied-configuration";

/// Drop bookkeeping fields that change on every write and are never shown
pub fn strip_noise<K: Resource>(mut obj: K) -> K {
    let meta = obj.meta_mut();
    meta.managed_fields = None;
    if let Some(annotations) = meta.annotations.as_mut() {
        annotations.remove(LAST_APPLIED_ANNOTATION);
        if annotations.is_empty() {
            meta.annotations = None;
        }
    }
    obj
}

pub trait ResourceKind: Send + Sync + 'static {
    type Object: MirroredObject;

    /// URL and stream key name
    const NAME: &'static str;

    const NAMESPACED: bool = true;

    /// Applied to every object before it is stored
    fn transform(obj: Self::Object) -> Self::Object {
        strip_noise(obj)
    }
}

pub struct Pods;
pub struct Deployments;
pub struct ReplicaSets;
pub struct StatefulSets;
pub struct DaemonSets;
pub struct Services;
pub struct ConfigMaps;
pub struct Events;
pub struct Namespaces;
pub struct Nodes;

impl ResourceKind for Pods {
    type Object = Pod;
    const NAME: &'static str = "pods";
}

impl ResourceKind for Deployments {
    type Object = Deployment;
    const NAME: &'static str = "deployments";
}

impl ResourceKind for ReplicaSets {
    type Object = ReplicaSet;
    const NAME: &'static str = "replicasets";
}

impl ResourceKind for StatefulSets {
    type Object = StatefulSet;
    const NAME: &'static str = "statefulsets";
}

impl ResourceKind for DaemonSets {
    type Object = DaemonSet;
    const NAME: &'static str = "daemonsets";
}

impl ResourceKind for Services {
    type Object = Service;
    const NAME: &'static str = "services";
}

impl ResourceKind for ConfigMaps {
    type Object = ConfigMap;
    const NAME: &'static str = "configmaps";

    /// Keep the keys, drop the values
    fn transform(obj: ConfigMap) -> ConfigMap {
        let mut obj = strip_noise(obj);
        if let Some(data) = obj.data.as_mut() {
            data.values_mut().for_each(String::clear);
        }
        obj.binary_data = obj.binary_data.map(|binary| {
            binary
                .into_keys()
                .map(|key| (key, k8s_openapi::ByteString(Vec::new())))
                .collect::<BTreeMap<_, _>>()
        });
        obj
    }
}

impl ResourceKind for Events {
    type Object = Event;
    const NAME: &'static str = "events";
}

impl ResourceKind for Namespaces {
    type Object = Namespace;
    const NAME: &'static str = "namespaces";
    const NAMESPACED: bool = false;
}

impl ResourceKind for Nodes {
    type Object = Node;
    const NAME: &'static str = "nodes";
    const NAMESPACED: bool = false;

    /// Image lists are large and change on every pull
    fn transform(obj: Node) -> Node {
        let mut obj = strip_noise(obj);
        if let Some(status) = obj.status.as_mut() {
            status.images = None;
        }
        obj
    }
}

/// Object-safe handle on a `ResourceKind`
pub trait KindCapability: Send + Sync {
    fn name(&self) -> &'static str;

    fn namespaced(&self) -> bool;

    /// Open (or reuse) the mirror of this kind for `tenant`
    ///
    /// # Errors
    ///
    /// Returns an error if the mirror registry cannot hand out the mirror
    fn open(&self, mirrors: &MirrorRegistry, tenant: &TenantKey, client: &Client) -> Result<Arc<dyn MirrorView>>;
}

struct Capability<R>(PhantomData<fn() -> R>);

impl<R: ResourceKind> KindCapability for Capability<R> {
    fn name(&self) -> &'static str {
        R::NAME
    }

    fn namespaced(&self) -> bool {
        R::NAMESPACED
    }

    fn open(&self, mirrors: &MirrorRegistry, tenant: &TenantKey, client: &Client) -> Result<Arc<dyn MirrorView>> {
        let transform: Transform<R::Object> = Arc::new(R::transform);
        let mirror = mirrors.open(tenant, R::NAME, || KubeWatchSource::all(client.clone()), transform)?;
        Ok(mirror)
    }
}

#[derive(Default)]
pub struct KindTable {
    kinds: BTreeMap<&'static str, Arc<dyn KindCapability>>,
}

impl KindTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every kind this crate knows how to mirror
    #[must_use]
    pub fn standard() -> Self {
        Self::new()
            .with::<Pods>()
            .with::<Deployments>()
            .with::<ReplicaSets>()
            .with::<StatefulSets>()
            .with::<DaemonSets>()
            .with::<Services>()
            .with::<ConfigMaps>()
            .with::<Events>()
            .with::<Namespaces>()
            .with::<Nodes>()
    }

    #[must_use]
    pub fn with<R: ResourceKind>(mut self) -> Self {
        self.kinds.insert(R::NAME, Arc::new(Capability::<R>(PhantomData)));
        self
    }

    /// Register a hand-written capability under its own name
    #[must_use]
    pub fn with_capability(mut self, capability: Arc<dyn KindCapability>) -> Self {
        self.kinds.insert(capability.name(), capability);
        self
    }

    /// # Errors
    ///
    /// Returns `BadRequest` for an unknown kind name
    pub fn get(&self, name: &str) -> Result<Arc<dyn KindCapability>> {
        self.kinds
            .get(name)
            .cloned()
            .ok_or_else(|| Error::BadRequest(format!("unknown resource kind: {name}")))
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.kinds.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;

    #[test]
    fn test_strip_noise_drops_bookkeeping() {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("web-0".into()),
                managed_fields: Some(Vec::new()),
                annotations: Some(
                    [(LAST_APPLIED_ANNOTATION.to_string(), "{}".to_string())]
                        .into_iter()
                        .collect(),
                ),
                ..ObjectMeta::default()
            },
            ..Pod::default()
        };

        let pod = Pods::transform(pod);
        assert!(pod.metadata.managed_fields.is_none());
        assert!(pod.metadata.annotations.is_none());
        assert_eq!(pod.metadata.name.as_deref(), Some("web-0"));
    }

    #[test]
    fn test_configmap_values_are_hidden() {
        let cm = ConfigMap {
            data: Some([("password".to_string(), "hunter2".to_string())].into_iter().collect()),
            ..ConfigMap::default()
        };
        let cm = ConfigMaps::transform(cm);
        assert_eq!(cm.data.unwrap().get("password").map(String::as_str), Some(""));
    }

    #[test]
    fn test_kind_table_lookup() {
        let table = KindTable::standard();
        assert!(table.get("pods").unwrap().namespaced());
        assert!(!table.get("nodes").unwrap().namespaced());
        assert_eq!(table.get("deployments").unwrap().name(), "deployments");

        let err = table.get("widgets").err().unwrap();
        assert_eq!(err.status_code(), 400);
        assert_eq!(table.names().len(), 10);
    }
}
