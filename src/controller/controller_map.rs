//! # Controller Map
//!
//! Concurrent registry keyed by the reconciled resource kind. Each entry holds
//! the handle used to start dependent watches, the dependent-watch flags, the
//! ignore-list, and two independent "already watched" sets: one for children
//! found through owner references and one for children found through the
//! primary-resource annotations.
//!
//! The outer map is only write-locked by `store`/`delete`. Each watch set has
//! its own mutex, so proxy requests for unrelated kinds never contend.

use crate::controller::kind::{ApiMapping, ResourceKind};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ControllerMapError {
    #[error("no controller registered for {0}")]
    NotFound(ResourceKind),
    #[error("ignore-list of {0} contains the owner kind itself")]
    IgnoresOwnerKind(ResourceKind),
    #[error("{0} sets an ignore-list but watchDependentResources is false")]
    IgnoreListWithoutDependentWatches(ResourceKind),
    #[error("{0} sets watchClusterScopedResources but watchDependentResources is false")]
    ClusterScopedWithoutDependentWatches(ResourceKind),
}

/// Channel through which a dependent kind was discovered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchChannel {
    /// Child carries an owner reference to the primary resource
    Owner,
    /// Child carries the primary-resource annotations
    Annotation,
}

impl WatchChannel {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            WatchChannel::Owner => "owner",
            WatchChannel::Annotation => "annotation",
        }
    }
}

/// How events on a dependent kind are mapped back to the primary resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueHandler {
    /// Enqueue the controller owner whose group/kind matches `owner`
    Owner { owner: ResourceKind, owner_namespaced: bool },
    /// Enqueue the resource named by the primary-resource annotations when the
    /// type annotation matches `owner`
    Annotation { owner: ResourceKind },
}

impl EnqueueHandler {
    #[must_use]
    pub fn channel(&self) -> WatchChannel {
        match self {
            EnqueueHandler::Owner { .. } => WatchChannel::Owner,
            EnqueueHandler::Annotation { .. } => WatchChannel::Annotation,
        }
    }
}

/// Starts watches on dependent kinds for one reconciled kind.
///
/// Called from proxy request handlers, never from the reconcile task that
/// caused the request, so implementations must not block.
pub trait WatchRegistrar: Send + Sync + std::fmt::Debug {
    fn register_dynamic_watch(&self, dependent: &ApiMapping, handler: EnqueueHandler)
        -> anyhow::Result<()>;
}

/// Per-kind controller state
#[derive(Debug)]
pub struct ControllerMapEntry {
    pub controller: Arc<dyn WatchRegistrar>,
    pub watch_dependent_resources: bool,
    pub watch_cluster_scoped_resources: bool,
    ignore_list: HashSet<(String, String)>,
    owner_watches: Mutex<HashSet<ResourceKind>>,
    annotation_watches: Mutex<HashSet<ResourceKind>>,
}

impl ControllerMapEntry {
    pub fn new(
        controller: Arc<dyn WatchRegistrar>,
        watch_dependent_resources: bool,
        watch_cluster_scoped_resources: bool,
    ) -> Self {
        Self {
            controller,
            watch_dependent_resources,
            watch_cluster_scoped_resources,
            ignore_list: HashSet::new(),
            owner_watches: Mutex::new(HashSet::new()),
            annotation_watches: Mutex::new(HashSet::new()),
        }
    }

    /// Ignore-list entries match on group and kind, for every version
    #[must_use]
    pub fn is_ignored(&self, dependent: &ResourceKind) -> bool {
        self.ignore_list
            .contains(&(dependent.group.clone(), dependent.kind.clone()))
    }

    /// Record `dependent` as watched on `channel`.
    ///
    /// Returns `true` when it was already recorded, in which case the caller
    /// must not request another watch.
    pub fn mark_watched(&self, dependent: &ResourceKind, channel: WatchChannel) -> bool {
        let mut watches = self
            .watches(channel)
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        !watches.insert(dependent.clone())
    }

    /// Drop a mark whose watch could not be started
    pub fn forget_watch(&self, dependent: &ResourceKind, channel: WatchChannel) {
        self.watches(channel)
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(dependent);
    }

    #[must_use]
    pub fn is_watched(&self, dependent: &ResourceKind, channel: WatchChannel) -> bool {
        self.watches(channel)
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(dependent)
    }

    /// Snapshot of the kinds watched on `channel`
    #[must_use]
    pub fn watched(&self, channel: WatchChannel) -> Vec<ResourceKind> {
        let mut kinds: Vec<_> = self
            .watches(channel)
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect();
        kinds.sort();
        kinds
    }

    fn watches(&self, channel: WatchChannel) -> &Mutex<HashSet<ResourceKind>> {
        match channel {
            WatchChannel::Owner => &self.owner_watches,
            WatchChannel::Annotation => &self.annotation_watches,
        }
    }
}

/// Registry of controller state keyed by reconciled kind.
///
/// Cheap to clone; clones share the same registry.
#[derive(Debug, Clone, Default)]
pub struct ControllerMap {
    entries: Arc<RwLock<HashMap<ResourceKind, Arc<ControllerMapEntry>>>>,
}

impl ControllerMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the controller state for `kind` together with its ignore-list.
    ///
    /// Contradictory configurations are rejected here instead of turning into
    /// silent no-ops later.
    pub fn store(
        &self,
        kind: ResourceKind,
        mut entry: ControllerMapEntry,
        ignore_list: Vec<ResourceKind>,
    ) -> Result<(), ControllerMapError> {
        if ignore_list.iter().any(|ignored| ignored.same_group_kind(&kind)) {
            return Err(ControllerMapError::IgnoresOwnerKind(kind));
        }
        if !entry.watch_dependent_resources {
            if !ignore_list.is_empty() {
                return Err(ControllerMapError::IgnoreListWithoutDependentWatches(kind));
            }
            if entry.watch_cluster_scoped_resources {
                return Err(ControllerMapError::ClusterScopedWithoutDependentWatches(kind));
            }
        }
        entry.ignore_list = ignore_list
            .into_iter()
            .map(|ignored| (ignored.group, ignored.kind))
            .collect();

        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind, Arc::new(entry));
        Ok(())
    }

    #[must_use]
    pub fn get(&self, kind: &ResourceKind) -> Option<Arc<ControllerMapEntry>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(kind)
            .cloned()
    }

    /// Look an entry up by group and kind only, as owner references do not
    /// always carry the version the controller was registered with
    #[must_use]
    pub fn get_by_group_kind(&self, kind: &ResourceKind) -> Option<Arc<ControllerMapEntry>> {
        if let Some(entry) = self.get(kind) {
            return Some(entry);
        }
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|(registered, _)| registered.same_group_kind(kind))
            .map(|(_, entry)| Arc::clone(entry))
    }

    pub fn delete(&self, kind: &ResourceKind) -> Option<Arc<ControllerMapEntry>> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(kind)
    }

    /// Mark `dependent` as watched for the controller of `kind`.
    ///
    /// Returns whether it was already watched on that channel.
    pub fn mark_watched(
        &self,
        kind: &ResourceKind,
        dependent: &ResourceKind,
        channel: WatchChannel,
    ) -> Result<bool, ControllerMapError> {
        let entry = self
            .get(kind)
            .ok_or_else(|| ControllerMapError::NotFound(kind.clone()))?;
        Ok(entry.mark_watched(dependent, channel))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
