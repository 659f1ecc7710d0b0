//! # Resource Kinds
//!
//! Group/version/kind identity used as the key for watch configuration,
//! controller-map entries and cache partitions.

use kube::api::{ApiResource, GroupVersionKind};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Group/version/kind triple identifying a cluster object type
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKind {
    #[serde(default)]
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl ResourceKind {
    pub fn new(group: &str, version: &str, kind: &str) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
        }
    }

    /// Build a kind from an object's `apiVersion` (`group/version` or `version`) and `kind`
    pub fn from_api_version(api_version: &str, kind: &str) -> Self {
        let (group, version) = split_api_version(api_version);
        Self::new(group, version, kind)
    }

    /// `apiVersion` as written in manifests (`v1` for the core group)
    #[must_use]
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// `{Kind}.{group}` as used by the primary-resource-type annotation
    #[must_use]
    pub fn group_kind(&self) -> String {
        format!("{}.{}", self.kind, self.group)
    }

    /// True when both kinds share group and kind, regardless of version
    #[must_use]
    pub fn same_group_kind(&self, other: &ResourceKind) -> bool {
        self.group == other.group && self.kind == other.kind
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, Kind={}", self.api_version(), self.kind)
    }
}

impl From<&ResourceKind> for GroupVersionKind {
    fn from(kind: &ResourceKind) -> Self {
        GroupVersionKind::gvk(&kind.group, &kind.version, &kind.kind)
    }
}

/// Split `apiVersion` into `(group, version)`
pub fn split_api_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    }
}

/// REST mapping for a kind: its plural resource name and scope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiMapping {
    pub kind: ResourceKind,
    pub plural: String,
    pub namespaced: bool,
}

impl ApiMapping {
    #[must_use]
    pub fn api_resource(&self) -> ApiResource {
        ApiResource::from_gvk_with_plural(&GroupVersionKind::from(&self.kind), &self.plural)
    }
}
