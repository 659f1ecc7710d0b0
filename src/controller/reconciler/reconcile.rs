//! # Reconciliation Logic
//!
//! One reconcile cycle for one object: finalizer bookkeeping, the automation
//! run through the proxy, and the reduction of its events into an outcome,
//! status conditions and cluster events.

use crate::config::AutomationTarget;
use crate::controller::identity::OwnerIdentity;
use crate::controller::kubeconfig::ProxyKubeconfig;
use crate::controller::reconciler::events::{
    ClusterEvent, REASON_AUTOMATION_ERROR, REASON_RECONCILE_FAILED,
};
use crate::controller::reconciler::status;
use crate::controller::reconciler::types::{ReconcileOutcome, Reconciler, ReconcilerError};
use crate::controller::runner::{JobEvent, RunRequest, RunSummary, RunnerError};
use crate::observability::metrics;
use chrono::SecondsFormat;
use kube::api::DynamicObject;
use kube_runtime::controller::Action;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{Instrument, debug, error, info, warn};

/// What a run is for; finalizer runs skip status writes and the
/// deleted-during-run check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunPurpose {
    Reconcile,
    Finalize,
}

/// Reconcile entry point driven by the controller runtime.
///
/// Errors are classified here and retried by the error policy.
pub async fn reconcile(
    obj: Arc<DynamicObject>,
    ctx: Arc<Reconciler>,
) -> Result<Action, ReconcilerError> {
    let name = obj.metadata.name.clone().unwrap_or_default();
    let namespace = obj.metadata.namespace.clone();
    let span = tracing::span!(
        tracing::Level::INFO,
        "controller.reconcile",
        resource.name = name.as_str(),
        resource.namespace = namespace.as_deref().unwrap_or(""),
        gvk = %ctx.watch.kind,
    );

    async move {
        let start = Instant::now();
        metrics::increment_reconciliations();
        let result = reconcile_object(&ctx, namespace.as_deref(), &name).await;
        metrics::observe_reconciliation_duration(start.elapsed().as_secs_f64());

        let key = backoff_key(namespace.as_deref(), &name);
        match result? {
            ReconcileOutcome::Successful => {
                if ctx.backoff_states.reset(&key) {
                    info!("Backoff reset after successful reconcile");
                }
                info!(
                    "Reconcile successful, next run in {}s",
                    ctx.watch.reconcile_period.as_secs()
                );
                Ok(Action::requeue(ctx.watch.reconcile_period))
            }
            ReconcileOutcome::Requeue(after) => {
                ctx.backoff_states.reset(&key);
                info!("Automation requested requeue after {}s", after.as_secs());
                Ok(Action::requeue(after))
            }
            ReconcileOutcome::Failed(message) => Err(ReconcilerError::TaskFailure(message)),
            ReconcileOutcome::Fatal(message) => Err(ReconcilerError::Fatal(message)),
        }
    }
    .instrument(span)
    .await
}

/// Key used for per-object error backoff
#[must_use]
pub fn backoff_key(namespace: Option<&str>, name: &str) -> String {
    format!("{}/{}", namespace.unwrap_or(""), name)
}

async fn reconcile_object(
    ctx: &Reconciler,
    namespace: Option<&str>,
    name: &str,
) -> Result<ReconcileOutcome, ReconcilerError> {
    // the cached copy may be stale; finalizers and deletion need the live one
    let Some(obj) = ctx.resources.get(namespace, name).await? else {
        debug!("Resource no longer exists, nothing to do");
        return Ok(ReconcileOutcome::Successful);
    };

    if ctx.controllers.get(&ctx.watch.kind).is_none() {
        return Ok(ReconcileOutcome::Fatal(format!(
            "no controller registered for {}",
            ctx.watch.kind
        )));
    }

    let finalizer = ctx.watch.finalizer.as_ref();
    let finalizers = obj.metadata.finalizers.clone().unwrap_or_default();

    if obj.metadata.deletion_timestamp.is_some() {
        let Some(finalizer) = finalizer.filter(|f| finalizers.contains(&f.name)) else {
            debug!("Resource is being deleted and carries no finalizer of ours, skipping");
            return Ok(ReconcileOutcome::Successful);
        };
        info!(finalizer = finalizer.name.as_str(), "Running finalizer");
        let mut vars = ctx.watch.vars.clone();
        vars.extend(finalizer.vars.clone());
        let outcome =
            run_automation(ctx, &obj, &finalizer.target, vars, RunPurpose::Finalize).await?;
        if !matches!(outcome, ReconcileOutcome::Successful | ReconcileOutcome::Requeue(_)) {
            return Ok(outcome);
        }

        let Some(latest) = ctx.resources.get(namespace, name).await? else {
            return Ok(ReconcileOutcome::Successful);
        };
        let remaining: Vec<String> = latest
            .metadata
            .finalizers
            .clone()
            .unwrap_or_default()
            .into_iter()
            .filter(|f| f != &finalizer.name)
            .collect();
        ctx.resources.set_finalizers(&latest, remaining).await?;
        info!(finalizer = finalizer.name.as_str(), "Finalizer removed");
        return Ok(ReconcileOutcome::Successful);
    }

    let obj = match finalizer {
        Some(finalizer) if !finalizers.contains(&finalizer.name) => {
            let mut updated = finalizers;
            updated.push(finalizer.name.clone());
            debug!(finalizer = finalizer.name.as_str(), "Adding finalizer");
            ctx.resources.set_finalizers(&obj, updated).await?
        }
        _ => obj,
    };

    run_automation(
        ctx,
        &obj,
        &ctx.watch.target,
        ctx.watch.vars.clone(),
        RunPurpose::Reconcile,
    )
    .await
}

async fn run_automation(
    ctx: &Reconciler,
    obj: &DynamicObject,
    target: &AutomationTarget,
    vars: Map<String, Value>,
    purpose: RunPurpose,
) -> Result<ReconcileOutcome, ReconcilerError> {
    let namespace = obj.metadata.namespace.as_deref();
    let name = obj.metadata.name.as_deref().unwrap_or_default();

    // the reconciled object owns whatever its automation creates
    let identity = match OwnerIdentity::for_resource(obj) {
        Ok(identity) => identity,
        Err(e) => return Ok(ReconcileOutcome::Fatal(format!("cannot encode owner identity: {e}"))),
    };
    let kubeconfig = match ProxyKubeconfig::create(&identity, ctx.proxy_addr) {
        Ok(kubeconfig) => kubeconfig,
        Err(e) => return Ok(ReconcileOutcome::Fatal(format!("cannot write kubeconfig: {e}"))),
    };

    let manage_status = ctx.watch.manage_status && purpose == RunPurpose::Reconcile;
    if manage_status {
        let now = now();
        let current = status::current_conditions(obj);
        if let Some(conditions) = status::running_conditions(&current, &now) {
            write_conditions(ctx, namespace, name, &conditions).await?;
        }
    }

    let request = RunRequest {
        object: obj.clone(),
        kind: ctx.watch.kind.clone(),
        target: target.clone(),
        vars,
        snake_case_parameters: ctx.watch.snake_case_parameters,
        verbosity: ctx.watch.ansible_verbosity,
        kubeconfig: kubeconfig.path().to_path_buf(),
    };
    let mut handle = match ctx.runner.run(request).await {
        Ok(handle) => handle,
        Err(e) => {
            error!("Failed to start automation: {}", e);
            return Ok(ReconcileOutcome::Fatal(e.to_string()));
        }
    };
    info!(
        runner.ident = handle.ident.as_str(),
        automation = %target.describe(),
        "Automation started"
    );

    let mut summary = RunSummary::new();
    let consumed = tokio::time::timeout(ctx.runner_timeout, async {
        while let Some(event) = handle.events.recv().await {
            observe_event(ctx, obj, &mut summary, &event).await;
        }
        handle.wait().await
    })
    .await;
    let exit = consumed.unwrap_or_else(|_| {
        warn!("Automation exceeded {}s, killing it", ctx.runner_timeout.as_secs());
        Err(RunnerError::Killed)
    });
    // kills the process if it is still running and removes its data directory
    drop(handle);
    drop(kubeconfig);

    let mut outcome = ReconcileOutcome::from_run(&summary, &exit);
    debug!(
        outcome = outcome.as_str(),
        events = summary.events(),
        completed = summary.completed(),
        "Automation finished"
    );

    let latest = ctx.resources.get(namespace, name).await?;
    let deleted = match &latest {
        None => true,
        Some(latest) => {
            purpose == RunPurpose::Reconcile && latest.metadata.deletion_timestamp.is_some()
        }
    };
    if deleted && !matches!(outcome, ReconcileOutcome::Fatal(_)) {
        outcome = ReconcileOutcome::Fatal("resource was deleted during the run".to_string());
    }

    if let ReconcileOutcome::Fatal(message) = &outcome {
        error!("Automation error: {}", message);
        publish(ctx, obj, ClusterEvent::warning(REASON_AUTOMATION_ERROR, message)).await;
        return Ok(outcome);
    }

    if manage_status {
        if let Some(latest) = &latest {
            let failure = match &outcome {
                ReconcileOutcome::Failed(message) => Some(message.as_str()),
                _ => None,
            };
            let existing = status::current_conditions(latest);
            let conditions = status::final_conditions(&existing, summary.result(), failure, &now());
            if conditions == existing {
                debug!("Status conditions unchanged, skipping write");
            } else {
                write_conditions(ctx, namespace, name, &conditions).await?;
            }
        }
    }

    if let ReconcileOutcome::Failed(message) = &outcome {
        warn!("Automation reported failed tasks: {}", message);
        publish(ctx, obj, ClusterEvent::warning(REASON_RECONCILE_FAILED, message)).await;
    }
    Ok(outcome)
}

async fn observe_event(
    ctx: &Reconciler,
    obj: &DynamicObject,
    summary: &mut RunSummary,
    event: &JobEvent,
) {
    if ctx.debug_logs && !event.stdout.is_empty() {
        info!(
            runner.ident = event.runner_ident.as_str(),
            counter = event.counter,
            "{}",
            event.stdout
        );
    }
    let Some(task) = summary.observe(event) else {
        return;
    };
    metrics::increment_task_events(task.outcome.as_str());
    if !ctx.event_level.surfaces(task.outcome) {
        return;
    }
    info!(
        task = task.task.as_str(),
        outcome = task.outcome.as_str(),
        host = task.host.as_deref().unwrap_or(""),
        "Task finished"
    );
    publish(ctx, obj, ClusterEvent::for_task(&task, &event.stdout)).await;
}

async fn publish(ctx: &Reconciler, obj: &DynamicObject, event: ClusterEvent) {
    let reason = event.reason.clone();
    if let Err(e) = ctx.events.publish(obj, event).await {
        warn!(reason = reason.as_str(), "Failed to publish event: {:#}", e);
    }
}

async fn write_conditions(
    ctx: &Reconciler,
    namespace: Option<&str>,
    name: &str,
    conditions: &[status::Condition],
) -> Result<(), ReconcilerError> {
    let value = status::to_value(conditions)
        .map_err(|e| ReconcilerError::Fatal(format!("cannot encode status conditions: {e}")))?;
    ctx.resources.patch_conditions(namespace, name, value).await?;
    Ok(())
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}
