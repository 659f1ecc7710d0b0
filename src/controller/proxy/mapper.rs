//! # REST Mapper
//!
//! Resolves resource paths and kinds to their REST mapping (plural and scope).
//! The proxy needs the scope of an owner kind to decide whether a child may
//! carry an owner reference, and the kind behind a path to key its cache and
//! watch decisions.

use crate::controller::kind::{ApiMapping, ResourceKind};
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::APIResourceList;
use kube::Client;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

#[async_trait]
pub trait RestMapper: Send + Sync {
    /// Mapping for `/{group}/{version}/{resource}`
    async fn mapping_for_resource(
        &self,
        group: &str,
        version: &str,
        resource: &str,
    ) -> Result<ApiMapping>;

    async fn mapping_for_kind(&self, kind: &ResourceKind) -> Result<ApiMapping>;
}

/// Mapper backed by the API server's discovery endpoints.
///
/// Group versions are fetched lazily and re-fetched once on a miss, so kinds
/// from CRDs installed after start-up resolve.
pub struct DiscoveryMapper {
    client: Client,
    group_versions: RwLock<HashMap<(String, String), Vec<ApiMapping>>>,
}

impl std::fmt::Debug for DiscoveryMapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryMapper").finish_non_exhaustive()
    }
}

impl DiscoveryMapper {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self {
            client,
            group_versions: RwLock::new(HashMap::new()),
        }
    }

    async fn lookup<F>(&self, group: &str, version: &str, matches: F) -> Result<ApiMapping>
    where
        F: Fn(&ApiMapping) -> bool,
    {
        let key = (group.to_string(), version.to_string());
        if let Some(found) = self
            .group_versions
            .read()
            .await
            .get(&key)
            .and_then(|mappings| mappings.iter().find(|m| matches(m)))
        {
            return Ok(found.clone());
        }

        debug!(group, version, "Refreshing API discovery");
        let mappings = self.discover(group, version).await?;
        let found = mappings.iter().find(|m| matches(m)).cloned();
        self.group_versions.write().await.insert(key, mappings);
        found.ok_or_else(|| anyhow!("no resource found in {group}/{version}"))
    }

    async fn discover(&self, group: &str, version: &str) -> Result<Vec<ApiMapping>> {
        let list = if group.is_empty() {
            self.client.list_core_api_resources(version).await
        } else {
            self.client
                .list_api_group_resources(&format!("{group}/{version}"))
                .await
        }
        .with_context(|| format!("Failed to discover resources for {group}/{version}"))?;
        Ok(mappings_from_list(group, version, &list))
    }
}

#[async_trait]
impl RestMapper for DiscoveryMapper {
    async fn mapping_for_resource(
        &self,
        group: &str,
        version: &str,
        resource: &str,
    ) -> Result<ApiMapping> {
        self.lookup(group, version, |m| m.plural == resource)
            .await
            .with_context(|| format!("Unknown resource {resource} in {group}/{version}"))
    }

    async fn mapping_for_kind(&self, kind: &ResourceKind) -> Result<ApiMapping> {
        self.lookup(&kind.group, &kind.version, |m| m.kind.kind == kind.kind)
            .await
            .with_context(|| format!("Unknown kind {kind}"))
    }
}

/// Top-level resources of one group version; subresources are skipped
fn mappings_from_list(group: &str, version: &str, list: &APIResourceList) -> Vec<ApiMapping> {
    list.resources
        .iter()
        .filter(|resource| !resource.name.contains('/'))
        .map(|resource| ApiMapping {
            kind: ResourceKind::new(group, version, &resource.kind),
            plural: resource.name.clone(),
            namespaced: resource.namespaced,
        })
        .collect()
}
