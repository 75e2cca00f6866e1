use crate::error::Result;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Api, ListParams, ObjectMeta};
use kube::{Client, ResourceExt};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::debug;

/// Label selector of Helm 3 release records
pub const HELM_RELEASE_SELECTOR: &str = "owner=helm";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HelmRelease {
    pub name: String,
    pub namespace: String,
    pub revision: u32,
    pub status: String,
    pub updated: Option<Time>,
}

/// Reads Helm releases of one cluster from their storage Secrets
#[derive(Clone)]
pub struct HelmClient {
    client: Client,
}

impl HelmClient {
    #[must_use]
    pub const fn new(client: Client) -> Self {
        Self { client }
    }

    /// Latest revision of every release, ordered by namespace and name
    ///
    /// # Errors
    ///
    /// Returns the API error of the Secret listing
    pub async fn list_releases(&self, namespace: Option<&str>) -> Result<Vec<HelmRelease>> {
        let api: Api<Secret> = match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        let secrets = api
            .list(&ListParams::default().labels(HELM_RELEASE_SELECTOR))
            .await?;
        debug!("⎈ {} helm release records", secrets.items.len());

        Ok(latest_revisions(secrets.items.iter().filter_map(|s| {
            release_from_metadata(&s.metadata, s.namespace().as_deref())
        })))
    }
}

fn release_from_metadata(meta: &ObjectMeta, namespace: Option<&str>) -> Option<HelmRelease> {
    let labels = meta.labels.as_ref()?;
    Some(HelmRelease {
        name: labels.get("name")?.clone(),
        namespace: namespace.unwrap_or_default().to_string(),
        revision: labels.get("version")?.parse().ok()?,
        status: labels
            .get("status")
            .cloned()
            .unwrap_or_else(|| "unknown".to_string()),
        updated: meta.creation_timestamp.clone(),
    })
}

fn latest_revisions(records: impl Iterator<Item = HelmRelease>) -> Vec<HelmRelease> {
    let mut latest: BTreeMap<(String, String), HelmRelease> = BTreeMap::new();
    for record in records {
        let key = (record.namespace.clone(), record.name.clone());
        match latest.get(&key) {
            Some(seen) if seen.revision >= record.revision => {}
            _ => {
                latest.insert(key, record);
            }
        }
    }
    latest.into_values().collect()
}
