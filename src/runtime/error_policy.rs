//! # Error Policy
//!
//! Requeue policy for failed reconciles: exponential backoff tracked per
//! object, reset by the next successful reconcile of that object.

use crate::controller::reconciler::{Reconciler, ReconcilerError, backoff_key};
use crate::observability;
use kube::api::DynamicObject;
use kube_runtime::controller::Action;
use std::sync::Arc;
use tracing::{error, info, warn};

pub fn handle_reconciliation_error(
    obj: Arc<DynamicObject>,
    error: &ReconcilerError,
    ctx: Arc<Reconciler>,
) -> Action {
    let name = obj.metadata.name.as_deref().unwrap_or("unknown");
    let namespace = obj.metadata.namespace.as_deref();

    let error_span = tracing::span!(
        tracing::Level::ERROR,
        "controller.watch.reconciliation_error",
        resource.name = name,
        resource.namespace = namespace.unwrap_or(""),
        gvk = %ctx.watch.kind,
        error = %error
    );
    let _error_guard = error_span.enter();

    match error {
        ReconcilerError::TaskFailure(_) => warn!("Reconcile failed for {}: {}", name, error),
        ReconcilerError::Fatal(_) | ReconcilerError::Kube(_) => {
            error!("Reconcile error for {}: {}", name, error);
        }
    }
    observability::metrics::increment_reconciliation_errors();

    let (delay, errors) = ctx.backoff_states.next(&backoff_key(namespace, name));
    info!(
        "Retrying in {}s (error count: {})",
        delay.as_secs(),
        errors
    );
    Action::requeue(delay)
}
