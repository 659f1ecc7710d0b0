//! # Watch Loop
//!
//! One `kube_runtime::Controller` per watched kind and scope. The primary
//! stream only passes objects whose generation changed (plus annotations when
//! configured), dependent watches feed reconcile requests in through
//! `reconcile_on`, and requeues come from the reconcile outcome.

use crate::controller::reconciler::{Reconciler, reconcile};
use crate::runtime::error_policy::handle_reconciliation_error;
use crate::runtime::initialization::{InitializationResult, PrimaryController};
use futures::StreamExt;
use futures::channel::mpsc::UnboundedReceiver;
use kube::api::{Api, ApiResource, DynamicObject};
use kube_runtime::reflector::{ObjectRef, store::Writer};
use kube_runtime::{Controller, Predicate, WatchStreamExt, controller, predicates, watcher};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How long an object's last seen hash is kept without a new event
const PREDICATE_TTL: Duration = Duration::from_secs(3600);

/// Run every controller until a shutdown signal arrives
pub async fn run_watch_loop(init: InitializationResult) -> Result<(), anyhow::Error> {
    let InitializationResult {
        client,
        controllers,
        server_state,
        ..
    } = init;

    let shutdown_state = Arc::clone(&server_state);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received shutdown signal, waiting for in-flight reconciliations to complete...");
        shutdown_state.set_ready(false);
    });

    let mut running = Vec::new();
    for PrimaryController {
        reconciler,
        mapping,
        scopes,
    } in controllers
    {
        for (namespace, triggers) in scopes {
            info!(
                gvk = %reconciler.watch.kind,
                namespace = namespace.as_deref().unwrap_or("*"),
                automation = %reconciler.watch.target.describe(),
                "Starting controller"
            );
            let resource = mapping.api_resource();
            let api = match namespace.as_deref() {
                Some(ns) => Api::namespaced_with(client.clone(), ns, &resource),
                None => Api::all_with(client.clone(), &resource),
            };
            running.push(run_controller(api, resource, Arc::clone(&reconciler), triggers));
        }
    }

    server_state.set_ready(true);
    futures::future::join_all(running).await;
    server_state.set_ready(false);

    info!("Controllers stopped gracefully");
    Ok(())
}

fn run_controller(
    api: Api<DynamicObject>,
    dyntype: ApiResource,
    reconciler: Arc<Reconciler>,
    triggers: UnboundedReceiver<ObjectRef<DynamicObject>>,
) -> impl Future<Output = ()> + Send {
    let watch = &reconciler.watch;

    let mut config = watcher::Config::default().any_semantic();
    if let Some(selector) = watch.selector.as_deref() {
        config = config.labels(selector);
    }
    let writer = Writer::new(dyntype.clone());
    let reader = writer.as_reader();
    let mut predicate = ChangePredicate::new(watch.watch_annotations_changes);
    let stream = watcher(api, config)
        .default_backoff()
        .reflect(writer)
        .applied_objects()
        .filter(move |event| {
            let pass = match event {
                Ok(obj) => predicate.changed(obj),
                Err(_) => true,
            };
            futures::future::ready(pass)
        });

    let concurrency = u16::try_from(watch.max_concurrent_reconciles).unwrap_or(u16::MAX);
    let kind = watch.kind.clone();
    Controller::for_stream_with(stream, reader, dyntype)
        .with_config(controller::Config::default().concurrency(concurrency))
        .reconcile_on(triggers)
        .shutdown_on_signal()
        .run(reconcile, handle_reconciliation_error, reconciler)
        .for_each(move |result| {
            match result {
                Ok((object, action)) => {
                    debug!(object = %object, action = ?action, "watch.event.reconciled");
                }
                Err(e) => warn!(gvk = %kind, "Controller stream error: {}", e),
            }
            futures::future::ready(())
        })
}

/// Passes an object only when its generation (and optionally its
/// annotations) differ from the last time it was seen. Hashing uses kube's
/// predicates; objects unseen for longer than the TTL are forgotten.
pub struct ChangePredicate {
    predicate: Box<dyn Predicate<DynamicObject> + Send>,
    ttl: Duration,
    seen: HashMap<SeenKey, (u64, Instant)>,
}

type SeenKey = (String, Option<String>, Option<String>);

impl std::fmt::Debug for ChangePredicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangePredicate")
            .field("ttl", &self.ttl)
            .field("seen", &self.seen.len())
            .finish_non_exhaustive()
    }
}

impl ChangePredicate {
    #[must_use]
    pub fn new(watch_annotations: bool) -> Self {
        Self::with_ttl(watch_annotations, PREDICATE_TTL)
    }

    #[must_use]
    pub fn with_ttl(watch_annotations: bool, ttl: Duration) -> Self {
        let predicate: Box<dyn Predicate<DynamicObject> + Send> = if watch_annotations {
            Box::new(Predicate::<DynamicObject>::combine(
                predicates::generation::<DynamicObject>,
                predicates::annotations::<DynamicObject>,
            ))
        } else {
            Box::new(predicates::generation::<DynamicObject>)
        };
        Self {
            predicate,
            ttl,
            seen: HashMap::new(),
        }
    }

    pub fn changed(&mut self, obj: &DynamicObject) -> bool {
        let now = Instant::now();
        let ttl = self.ttl;
        self.seen
            .retain(|_, (_, last_seen)| now.duration_since(*last_seen) < ttl);

        // objects without a generation cannot be compared
        if obj.metadata.generation.is_none() {
            return true;
        }
        let Some(hash) = self.predicate.hash_property(obj) else {
            return true;
        };
        let key = (
            obj.metadata.name.clone().unwrap_or_default(),
            obj.metadata.namespace.clone(),
            obj.metadata.uid.clone(),
        );
        self.seen
            .insert(key, (hash, now))
            .is_none_or(|(previous, _)| previous != hash)
    }

    #[must_use]
    pub fn tracked(&self) -> usize {
        self.seen.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn memcached(generation: i64, annotations: serde_json::Value) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "cache.example.com/v1alpha1",
            "kind": "Memcached",
            "metadata": {
                "name": "example",
                "namespace": "default",
                "uid": "0a1b",
                "generation": generation,
                "annotations": annotations
            },
            "status": {"conditions": []}
        }))
        .unwrap()
    }

    #[test]
    fn test_status_only_updates_are_filtered() {
        let mut predicate = ChangePredicate::new(false);
        assert!(predicate.changed(&memcached(1, json!({}))));
        assert!(!predicate.changed(&memcached(1, json!({}))));
        assert!(!predicate.changed(&memcached(1, json!({"touched": "yes"}))));
        assert!(predicate.changed(&memcached(2, json!({"touched": "yes"}))));
    }

    #[test]
    fn test_annotation_changes_pass_when_enabled() {
        let mut predicate = ChangePredicate::new(true);
        assert!(predicate.changed(&memcached(1, json!({}))));
        assert!(predicate.changed(&memcached(1, json!({"touched": "yes"}))));
        assert!(!predicate.changed(&memcached(1, json!({"touched": "yes"}))));
    }

    #[test]
    fn test_expired_entries_are_forgotten() {
        let mut predicate = ChangePredicate::with_ttl(false, Duration::ZERO);
        assert!(predicate.changed(&memcached(1, json!({}))));
        std::thread::sleep(Duration::from_millis(5));
        // the earlier hash was evicted, so the same generation passes again
        assert!(predicate.changed(&memcached(1, json!({}))));
        assert_eq!(predicate.tracked(), 1);
    }

    #[test]
    fn test_recreated_object_passes_with_same_generation() {
        let mut predicate = ChangePredicate::new(false);
        assert!(predicate.changed(&memcached(1, json!({}))));
        let mut recreated = memcached(1, json!({}));
        recreated.metadata.uid = Some("9z8y".to_string());
        assert!(predicate.changed(&recreated));
    }
}
