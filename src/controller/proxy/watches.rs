//! Dependent-kind discovery.
//!
//! Every object the proxy sees pointing at an owner is dispatched over a
//! closed set of cases. Only owned and annotated kinds that pass the owner's
//! configuration reach `mark_watched`, and only the first mark per channel
//! asks the registrar for a watch.

use crate::controller::controller_map::{ControllerMap, EnqueueHandler, WatchChannel};
use crate::controller::identity::OwnerIdentity;
use crate::controller::kind::{ApiMapping, ResourceKind};
use crate::controller::proxy::inject::Ownership;
use crate::observability::metrics;
use tracing::{debug, info, warn};

/// What an observed child kind means for its owner's controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dependent {
    /// Child points at the owner through an owner reference
    Owned(ApiMapping),
    /// Child points at the owner through the primary-resource annotations
    Annotated(ApiMapping),
    /// Kind is on the owner's ignore-list
    Ignored(ResourceKind),
    /// Kind could not be resolved to a REST mapping
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoController,
    DependentWatchesDisabled,
    Ignored,
    ClusterScopedNotWatched,
    UnknownKind,
    RegistrationFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOutcome {
    Registered(WatchChannel),
    AlreadyWatched,
    Skipped(SkipReason),
}

/// Dispatch an observed child of the owner identified by `identity`
pub fn observe_dependent(
    controllers: &ControllerMap,
    identity: &OwnerIdentity,
    owner_namespaced: bool,
    child: Option<ApiMapping>,
    ownership: Ownership,
) -> WatchOutcome {
    let owner = identity.kind();
    let Some(entry) = controllers.get_by_group_kind(&owner) else {
        debug!(owner = %owner, "No controller registered for owner kind");
        return WatchOutcome::Skipped(SkipReason::NoController);
    };
    if !entry.watch_dependent_resources {
        return WatchOutcome::Skipped(SkipReason::DependentWatchesDisabled);
    }

    let dependent = match child {
        Some(mapping) if entry.is_ignored(&mapping.kind) => Dependent::Ignored(mapping.kind),
        Some(mapping) => match ownership {
            Ownership::Reference => Dependent::Owned(mapping),
            Ownership::Annotation => Dependent::Annotated(mapping),
        },
        None => Dependent::Unknown,
    };

    let (mapping, handler) = match dependent {
        Dependent::Owned(mapping) => (
            mapping,
            EnqueueHandler::Owner {
                owner: owner.clone(),
                owner_namespaced,
            },
        ),
        Dependent::Annotated(mapping) if entry.watch_cluster_scoped_resources => (
            mapping,
            EnqueueHandler::Annotation {
                owner: owner.clone(),
            },
        ),
        Dependent::Annotated(mapping) => {
            debug!(
                owner = %owner,
                dependent = %mapping.kind,
                "Annotation watches need watchClusterScopedResources"
            );
            return WatchOutcome::Skipped(SkipReason::ClusterScopedNotWatched);
        }
        Dependent::Ignored(kind) => {
            debug!(owner = %owner, dependent = %kind, "Dependent kind is ignored");
            return WatchOutcome::Skipped(SkipReason::Ignored);
        }
        Dependent::Unknown => return WatchOutcome::Skipped(SkipReason::UnknownKind),
    };

    let channel = handler.channel();
    if entry.mark_watched(&mapping.kind, channel) {
        return WatchOutcome::AlreadyWatched;
    }

    if let Err(e) = entry.controller.register_dynamic_watch(&mapping, handler) {
        entry.forget_watch(&mapping.kind, channel);
        warn!(
            owner = %owner,
            dependent = %mapping.kind,
            error = %e,
            "Failed to start dependent watch"
        );
        return WatchOutcome::Skipped(SkipReason::RegistrationFailed);
    }

    metrics::increment_dynamic_watches(channel.as_str());
    info!(
        owner = %owner,
        dependent = %mapping.kind,
        channel = channel.as_str(),
        "Watching dependent resource"
    );
    WatchOutcome::Registered(channel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::controller_map::{ControllerMapEntry, WatchRegistrar};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Default)]
    struct Recorder {
        calls: Mutex<Vec<(ResourceKind, WatchChannel)>>,
        fail: bool,
    }

    impl WatchRegistrar for Recorder {
        fn register_dynamic_watch(
            &self,
            dependent: &ApiMapping,
            handler: EnqueueHandler,
        ) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("watch refused");
            }
            self.calls
                .lock()
                .unwrap()
                .push((dependent.kind.clone(), handler.channel()));
            Ok(())
        }
    }

    fn owner_kind() -> ResourceKind {
        ResourceKind::new("cache.example.com", "v1alpha1", "Memcached")
    }

    fn identity() -> OwnerIdentity {
        OwnerIdentity {
            owner_reference: OwnerReference {
                api_version: "cache.example.com/v1alpha1".to_string(),
                kind: "Memcached".to_string(),
                name: "example".to_string(),
                uid: "uid-1".to_string(),
                controller: Some(true),
                block_owner_deletion: Some(true),
            },
            namespace: "default".to_string(),
        }
    }

    fn mapping(kind: &str, plural: &str) -> ApiMapping {
        ApiMapping {
            kind: ResourceKind::new("", "v1", kind),
            plural: plural.to_string(),
            namespaced: true,
        }
    }

    fn setup(recorder: Arc<Recorder>, cluster_scoped: bool) -> ControllerMap {
        let map = ControllerMap::new();
        map.store(
            owner_kind(),
            ControllerMapEntry::new(recorder, true, cluster_scoped),
            vec![ResourceKind::new("", "v1", "Secret")],
        )
        .unwrap();
        map
    }

    #[test]
    fn test_registers_once_per_kind() {
        let recorder = Arc::new(Recorder::default());
        let map = setup(recorder.clone(), false);

        for _ in 0..5 {
            observe_dependent(
                &map,
                &identity(),
                true,
                Some(mapping("ConfigMap", "configmaps")),
                Ownership::Reference,
            );
        }

        let calls = recorder.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], (ResourceKind::new("", "v1", "ConfigMap"), WatchChannel::Owner));
    }

    #[test]
    fn test_ignored_kind_never_registers() {
        let recorder = Arc::new(Recorder::default());
        let map = setup(recorder.clone(), false);

        let outcome = observe_dependent(
            &map,
            &identity(),
            true,
            Some(mapping("Secret", "secrets")),
            Ownership::Reference,
        );
        assert_eq!(outcome, WatchOutcome::Skipped(SkipReason::Ignored));
        assert!(recorder.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_annotation_channel_requires_cluster_scoped_watches() {
        let recorder = Arc::new(Recorder::default());
        let map = setup(recorder.clone(), false);
        let outcome = observe_dependent(
            &map,
            &identity(),
            true,
            Some(mapping("ConfigMap", "configmaps")),
            Ownership::Annotation,
        );
        assert_eq!(outcome, WatchOutcome::Skipped(SkipReason::ClusterScopedNotWatched));

        let recorder = Arc::new(Recorder::default());
        let map = setup(recorder.clone(), true);
        let outcome = observe_dependent(
            &map,
            &identity(),
            true,
            Some(mapping("ConfigMap", "configmaps")),
            Ownership::Annotation,
        );
        assert_eq!(outcome, WatchOutcome::Registered(WatchChannel::Annotation));
    }

    #[test]
    fn test_failed_registration_is_retried() {
        let recorder = Arc::new(Recorder {
            fail: true,
            ..Recorder::default()
        });
        let map = setup(recorder, false);
        let child = mapping("ConfigMap", "configmaps");

        let outcome = observe_dependent(
            &map,
            &identity(),
            true,
            Some(child.clone()),
            Ownership::Reference,
        );
        assert_eq!(outcome, WatchOutcome::Skipped(SkipReason::RegistrationFailed));
        let entry = map.get(&owner_kind()).unwrap();
        assert!(!entry.is_watched(&child.kind, WatchChannel::Owner));
    }

    #[test]
    fn test_unknown_owner_and_kind_are_skipped() {
        let map = setup(Arc::new(Recorder::default()), false);
        assert_eq!(
            observe_dependent(&map, &identity(), true, None, Ownership::Reference),
            WatchOutcome::Skipped(SkipReason::UnknownKind)
        );

        let empty = ControllerMap::new();
        assert_eq!(
            observe_dependent(
                &empty,
                &identity(),
                true,
                Some(mapping("ConfigMap", "configmaps")),
                Ownership::Reference,
            ),
            WatchOutcome::Skipped(SkipReason::NoController)
        );
    }
}
