//! # Dependent Watches
//!
//! Watches started on behalf of one reconciled kind when the proxy discovers
//! a new dependent kind. Every event on a dependent object refreshes the
//! proxy's read cache and enqueues the owning object for reconciliation.
//! Each watch covers one namespace scope, and a relist of that scope drops
//! cached objects the list no longer contains.

use crate::constants::{PRIMARY_RESOURCE_ANNOTATION, PRIMARY_RESOURCE_TYPE_ANNOTATION};
use crate::controller::controller_map::{EnqueueHandler, WatchRegistrar};
use crate::controller::kind::{ApiMapping, ResourceKind};
use crate::controller::proxy::ReadCache;
use anyhow::Context;
use axum::body::Bytes;
use futures::channel::mpsc::UnboundedSender;
use futures::{StreamExt, pin_mut};
use kube::Client;
use kube::api::{Api, ApiResource, DynamicObject};
use kube_runtime::reflector::ObjectRef;
use kube_runtime::{WatchStreamExt, watcher};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Reconcile requests for the primary kind
pub type TriggerSender = UnboundedSender<ObjectRef<DynamicObject>>;

/// Starts dependent watches and routes their events to the primary
/// kind's controllers
pub struct DependentWatchRegistrar {
    client: Client,
    owner: ApiResource,
    owner_kind: ResourceKind,
    namespaces: Vec<String>,
    cache: Arc<ReadCache>,
    triggers: Vec<TriggerSender>,
}

impl std::fmt::Debug for DependentWatchRegistrar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependentWatchRegistrar")
            .field("owner", &self.owner_kind)
            .field("namespaces", &self.namespaces)
            .field("triggers", &self.triggers.len())
            .finish_non_exhaustive()
    }
}

impl DependentWatchRegistrar {
    #[must_use]
    pub fn new(
        client: Client,
        owner: &ApiMapping,
        namespaces: Vec<String>,
        cache: Arc<ReadCache>,
        triggers: Vec<TriggerSender>,
    ) -> Self {
        Self {
            client,
            owner: owner.api_resource(),
            owner_kind: owner.kind.clone(),
            namespaces,
            cache,
            triggers,
        }
    }

    fn apis(
        &self,
        dependent: &ApiMapping,
        handler: &EnqueueHandler,
    ) -> Vec<(Option<String>, Api<DynamicObject>)> {
        let resource = dependent.api_resource();
        watch_scopes(dependent, &self.namespaces, handler)
            .into_iter()
            .map(|scope| {
                let api = match scope.as_deref() {
                    Some(ns) => Api::namespaced_with(self.client.clone(), ns, &resource),
                    None => Api::all_with(self.client.clone(), &resource),
                };
                (scope, api)
            })
            .collect()
    }
}

/// Namespaces a dependent watch covers, `None` meaning all of them
fn watch_scopes(
    dependent: &ApiMapping,
    namespaces: &[String],
    handler: &EnqueueHandler,
) -> Vec<Option<String>> {
    // annotated children live outside the owner's namespace by construction
    let cluster_wide = !dependent.namespaced
        || namespaces.is_empty()
        || matches!(handler, EnqueueHandler::Annotation { .. });
    if cluster_wide {
        return vec![None];
    }
    namespaces.iter().cloned().map(Some).collect()
}

impl WatchRegistrar for DependentWatchRegistrar {
    fn register_dynamic_watch(
        &self,
        dependent: &ApiMapping,
        handler: EnqueueHandler,
    ) -> anyhow::Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .context("no async runtime available to run the watch")?;

        for (scope, api) in self.apis(dependent, &handler) {
            self.cache.mark_watched(&dependent.kind, scope.as_deref());
            let task = DependentWatch {
                kind: dependent.kind.clone(),
                scope,
                owner: self.owner.clone(),
                handler: handler.clone(),
                cache: Arc::clone(&self.cache),
                triggers: self.triggers.clone(),
            };
            runtime.spawn(task.run(api));
        }
        debug!(owner = %self.owner_kind, dependent = %dependent.kind, "Dependent watch spawned");
        Ok(())
    }
}

struct DependentWatch {
    kind: ResourceKind,
    scope: Option<String>,
    owner: ApiResource,
    handler: EnqueueHandler,
    cache: Arc<ReadCache>,
    triggers: Vec<TriggerSender>,
}

impl DependentWatch {
    async fn run(self, api: Api<DynamicObject>) {
        let stream = watcher(api, watcher::Config::default()).default_backoff();
        pin_mut!(stream);
        info!(dependent = %self.kind, "Dependent watch started");

        while let Some(event) = stream.next().await {
            match event {
                Ok(event) => self.handle(event),
                Err(e) => {
                    warn!(dependent = %self.kind, "Error watching dependent resource: {}", e);
                }
            }
        }
        warn!(dependent = %self.kind, "Dependent watch stream ended");
    }

    fn handle(&self, event: watcher::Event<DynamicObject>) {
        match event {
            watcher::Event::Apply(obj) | watcher::Event::InitApply(obj) => {
                self.refresh_cache(&obj, true);
                self.enqueue(&obj);
            }
            watcher::Event::Delete(obj) => {
                self.refresh_cache(&obj, false);
                self.enqueue(&obj);
            }
            watcher::Event::Init => {
                self.cache.begin_resync(&self.kind, self.scope.as_deref());
            }
            watcher::Event::InitDone => {
                self.cache.finish_resync(&self.kind, self.scope.as_deref());
            }
        }
    }

    fn refresh_cache(&self, obj: &DynamicObject, present: bool) {
        let Some(name) = obj.metadata.name.as_deref() else {
            return;
        };
        let body = if present {
            match serde_json::to_vec(obj) {
                Ok(body) => Some(Bytes::from(body)),
                Err(e) => {
                    warn!("Cannot encode watched object for the cache: {}", e);
                    return;
                }
            }
        } else {
            None
        };
        self.cache
            .apply_event(&self.kind, obj.metadata.namespace.as_deref(), name, body);
    }

    fn enqueue(&self, obj: &DynamicObject) {
        for owner in owner_refs(&self.handler, &self.owner, obj) {
            for trigger in &self.triggers {
                // a closed channel belongs to a controller that has stopped
                if trigger.unbounded_send(owner.clone()).is_err() {
                    debug!("Reconcile trigger closed");
                }
            }
        }
    }
}

/// Objects of the primary kind that `child` points at through `handler`'s channel
#[must_use]
pub fn owner_refs(
    handler: &EnqueueHandler,
    owner: &ApiResource,
    child: &DynamicObject,
) -> Vec<ObjectRef<DynamicObject>> {
    match handler {
        EnqueueHandler::Owner {
            owner: owner_kind,
            owner_namespaced,
        } => child
            .metadata
            .owner_references
            .iter()
            .flatten()
            .filter(|r| r.controller == Some(true))
            .filter(|r| {
                ResourceKind::from_api_version(&r.api_version, &r.kind).same_group_kind(owner_kind)
            })
            .map(|r| {
                let obj_ref = ObjectRef::new_with(&r.name, owner.clone());
                match child.metadata.namespace.as_deref() {
                    Some(ns) if *owner_namespaced => obj_ref.within(ns),
                    _ => obj_ref,
                }
            })
            .collect(),
        EnqueueHandler::Annotation { owner: owner_kind } => {
            let Some(annotations) = child.metadata.annotations.as_ref() else {
                return Vec::new();
            };
            if annotations.get(PRIMARY_RESOURCE_TYPE_ANNOTATION) != Some(&owner_kind.group_kind()) {
                return Vec::new();
            }
            let Some(primary) = annotations.get(PRIMARY_RESOURCE_ANNOTATION) else {
                return Vec::new();
            };
            let obj_ref = match primary.split_once('/') {
                Some(("", name)) => ObjectRef::new_with(name, owner.clone()),
                Some((ns, name)) => ObjectRef::new_with(name, owner.clone()).within(ns),
                None => ObjectRef::new_with(primary, owner.clone()),
            };
            vec![obj_ref]
        }
    }
}
