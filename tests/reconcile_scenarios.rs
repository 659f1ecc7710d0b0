//! # Reconcile Scenarios
//!
//! Full reconcile cycles against scripted automation runs: outcome
//! classification, status conditions and the cluster events they produce.

mod common;

use ansible_operator::config::{AutomationTarget, FinalizerConfig};
use ansible_operator::controller::reconciler::{ReconcilerError, reconcile};
use common::{
    ScriptedExit, harness, harness_with_timeout, memcached, memcached_watch, stats, task_failed,
    task_ok,
};
use kube::api::DynamicObject;
use kube_runtime::controller::Action;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::time::Duration;

fn condition<'a>(conditions: &'a Value, condition_type: &str) -> Option<&'a Value> {
    conditions
        .as_array()?
        .iter()
        .find(|c| c["type"] == condition_type)
}

fn already_running(mut obj: DynamicObject) -> DynamicObject {
    obj.data["status"] = json!({
        "conditions": [{
            "type": "Running",
            "status": "True",
            "reason": "Running",
            "message": "Running reconciliation",
            "lastTransitionTime": "2026-01-01T00:00:00Z"
        }]
    });
    obj
}

#[tokio::test]
async fn test_failed_task_fails_the_run_even_when_later_tasks_succeed() {
    let h = harness(memcached_watch(), memcached(1));
    h.runner.push(
        vec![
            task_ok(1, "gather facts", false),
            task_failed(2, "create deployment", "exceeded quota"),
            task_ok(3, "record outcome", false),
            stats(4, 2, 0, 1),
        ],
        ScriptedExit::Code(2),
    );

    let result = reconcile(Arc::new(memcached(1)), Arc::clone(&h.reconciler)).await;
    match result {
        Err(ReconcilerError::TaskFailure(message)) => {
            assert_eq!(message, "create deployment: exceeded quota");
        }
        other => panic!("expected a task failure, got {other:?}"),
    }

    let conditions = h.resources.conditions();
    let failure = condition(&conditions, "Failure").expect("Failure condition");
    assert_eq!(failure["status"], "True");
    assert_eq!(failure["reason"], "Failed");
    assert_eq!(failure["message"], "create deployment: exceeded quota");
    assert_eq!(failure["ansibleResult"]["failures"], 1);
    assert!(condition(&conditions, "Successful").is_none());

    assert_eq!(h.events.reasons(), vec!["TaskFailed", "ReconcileFailed"]);
}

#[tokio::test]
async fn test_killed_run_leaves_status_alone() {
    let object = already_running(memcached(1));
    let h = harness(memcached_watch(), object.clone());
    h.runner
        .push(vec![task_ok(1, "gather facts", false)], ScriptedExit::Killed);

    let result = reconcile(Arc::new(object), Arc::clone(&h.reconciler)).await;
    assert!(matches!(result, Err(ReconcilerError::Fatal(_))), "got {result:?}");

    assert!(h.resources.patches().is_empty());
    assert_eq!(h.events.reasons(), vec!["AutomationError"]);
}

#[tokio::test]
async fn test_run_past_timeout_is_fatal_and_leaves_status_alone() {
    let object = already_running(memcached(1));
    let h = harness_with_timeout(memcached_watch(), object.clone(), Duration::from_millis(50));
    h.runner
        .push(vec![task_ok(1, "gather facts", false)], ScriptedExit::Hang);

    let result = reconcile(Arc::new(object), Arc::clone(&h.reconciler)).await;
    assert!(matches!(result, Err(ReconcilerError::Fatal(_))), "got {result:?}");

    assert_eq!(h.runner.runs(), 1);
    assert!(h.resources.patches().is_empty());
    assert_eq!(h.events.reasons(), vec!["AutomationError"]);
}

#[tokio::test]
async fn test_repeated_identical_runs_do_not_rewrite_status() {
    let h = harness(memcached_watch(), memcached(1));
    for _ in 0..2 {
        h.runner.push(
            vec![task_ok(1, "deploy memcached", true), stats(2, 1, 1, 0)],
            ScriptedExit::Code(0),
        );
    }

    let first = reconcile(Arc::new(memcached(1)), Arc::clone(&h.reconciler))
        .await
        .unwrap();
    assert_eq!(first, Action::requeue(Duration::from_secs(600)));
    let writes = h.resources.patches().len();
    assert!(writes > 0);
    let settled = h.resources.conditions();
    let successful = condition(&settled, "Successful").expect("Successful condition");
    assert_eq!(successful["status"], "True");
    let running = condition(&settled, "Running").unwrap();
    assert_eq!(running["ansibleResult"]["changed"], 1);

    let second = reconcile(Arc::new(memcached(1)), Arc::clone(&h.reconciler))
        .await
        .unwrap();
    assert_eq!(second, Action::requeue(Duration::from_secs(600)));
    assert_eq!(h.resources.patches().len(), writes);
    assert_eq!(h.resources.conditions(), settled);
    assert_eq!(h.runner.runs(), 2);
}

#[tokio::test]
async fn test_missing_object_is_a_no_op() {
    let h = harness(memcached_watch(), memcached(1));
    *h.resources.object.lock().unwrap() = None;

    let result = reconcile(Arc::new(memcached(1)), Arc::clone(&h.reconciler)).await;
    assert!(result.is_ok());
    assert_eq!(h.runner.runs(), 0);
    assert!(h.resources.patches().is_empty());
    assert!(h.events.reasons().is_empty());
}

#[tokio::test]
async fn test_object_deleted_during_run_is_fatal() {
    let h = harness(memcached_watch(), memcached(1));
    h.runner.push(
        vec![task_ok(1, "deploy memcached", false), stats(2, 1, 0, 0)],
        ScriptedExit::Code(0),
    );
    // reconcile reads once up front, the post-run read finds nothing
    *h.resources.vanish_after_reads.lock().unwrap() = Some(1);

    let result = reconcile(Arc::new(memcached(1)), Arc::clone(&h.reconciler)).await;
    assert!(matches!(result, Err(ReconcilerError::Fatal(_))), "got {result:?}");
    assert_eq!(h.events.reasons(), vec!["AutomationError"]);
}

#[tokio::test]
async fn test_finalizer_runs_cleanup_and_is_removed() {
    let mut watch = memcached_watch();
    let cleanup = AutomationTarget::Role {
        name: "memcached-cleanup".to_string(),
        path: "/opt/ansible/roles".into(),
    };
    let mut finalizer_vars = Map::new();
    finalizer_vars.insert("state".to_string(), json!("absent"));
    watch.finalizer = Some(FinalizerConfig {
        name: "cache.example.com/finalizer".to_string(),
        target: cleanup.clone(),
        vars: finalizer_vars,
    });

    let mut object = memcached(1);
    object.metadata.finalizers = Some(vec!["cache.example.com/finalizer".to_string()]);
    object.metadata.deletion_timestamp = Some(
        serde_json::from_value(json!("2026-01-01T00:00:00Z")).unwrap(),
    );
    let h = harness(watch, object.clone());
    h.runner.push(
        vec![task_ok(1, "remove memcached", true), stats(2, 1, 1, 0)],
        ScriptedExit::Code(0),
    );

    let result = reconcile(Arc::new(object), Arc::clone(&h.reconciler)).await;
    assert!(result.is_ok(), "got {result:?}");

    let requests = h.runner.requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].target, cleanup);
    assert_eq!(requests[0].vars["state"], "absent");

    let stored = h.resources.object.lock().unwrap().clone().unwrap();
    assert_eq!(stored.metadata.finalizers, Some(Vec::new()));
    // finalizer runs never touch status
    assert!(h.resources.patches().is_empty());
}

#[tokio::test]
async fn test_finalizer_is_added_before_the_first_run() {
    let mut watch = memcached_watch();
    watch.finalizer = Some(FinalizerConfig {
        name: "cache.example.com/finalizer".to_string(),
        target: watch.target.clone(),
        vars: Map::new(),
    });
    let h = harness(watch, memcached(1));
    h.runner.push(vec![stats(1, 0, 0, 0)], ScriptedExit::Code(0));

    let result = reconcile(Arc::new(memcached(1)), Arc::clone(&h.reconciler)).await;
    assert!(result.is_ok(), "got {result:?}");

    let stored = h.resources.object.lock().unwrap().clone().unwrap();
    assert_eq!(
        stored.metadata.finalizers,
        Some(vec!["cache.example.com/finalizer".to_string()])
    );
    let requests = h.runner.requests.lock().unwrap().clone();
    assert_eq!(
        requests[0].object.metadata.finalizers,
        Some(vec!["cache.example.com/finalizer".to_string()])
    );
}

#[tokio::test]
async fn test_unmanaged_status_is_never_written() {
    let mut watch = memcached_watch();
    watch.manage_status = false;
    let h = harness(watch, memcached(1));
    h.runner.push(
        vec![task_failed(1, "create deployment", "exceeded quota"), stats(2, 0, 0, 1)],
        ScriptedExit::Code(2),
    );

    let result = reconcile(Arc::new(memcached(1)), Arc::clone(&h.reconciler)).await;
    assert!(matches!(result, Err(ReconcilerError::TaskFailure(_))), "got {result:?}");
    assert!(h.resources.patches().is_empty());
    assert_eq!(h.events.reasons(), vec!["TaskFailed", "ReconcileFailed"]);
}
