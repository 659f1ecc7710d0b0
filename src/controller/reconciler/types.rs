//! # Types
//!
//! Core types for the reconciler.

use crate::config::WatchConfig;
use crate::constants::{ERROR_BACKOFF_MAX_SECS, ERROR_BACKOFF_START_SECS};
use crate::controller::backoff::BackoffStates;
use crate::controller::controller_map::ControllerMap;
use crate::controller::reconciler::client::ResourceClient;
use crate::controller::reconciler::events::EventPublisher;
use crate::controller::runner::{EventLevel, RunExit, RunSummary, Runner, RunnerError};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconcilerError {
    /// Run could not start, was killed, or the resource vanished mid-run
    #[error("fatal reconcile error: {0}")]
    Fatal(String),
    /// One or more tasks failed; status has been recorded
    #[error("automation reported failed tasks: {0}")]
    TaskFailure(String),
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
}

/// Terminal result of one automation run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Successful,
    Failed(String),
    Requeue(Duration),
    Fatal(String),
}

impl ReconcileOutcome {
    /// Reduce a finished run to its outcome.
    ///
    /// A process error wins over everything, then any failed task, then a
    /// non-zero exit with no failed task, then a requested requeue.
    #[must_use]
    pub fn from_run(summary: &RunSummary, exit: &Result<RunExit, RunnerError>) -> Self {
        let exit = match exit {
            Ok(exit) => exit,
            Err(e) => return ReconcileOutcome::Fatal(e.to_string()),
        };
        if summary.failed() {
            return ReconcileOutcome::Failed(summary.failure_message());
        }
        if !exit.success() {
            return ReconcileOutcome::Fatal(format!(
                "runner exited with code {} without reporting a failed task",
                exit.code
            ));
        }
        match summary.requeue_after() {
            Some(after) => ReconcileOutcome::Requeue(after),
            None => ReconcileOutcome::Successful,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileOutcome::Successful => "successful",
            ReconcileOutcome::Failed(_) => "failed",
            ReconcileOutcome::Requeue(_) => "requeue",
            ReconcileOutcome::Fatal(_) => "fatal",
        }
    }
}

/// Reconcile context for one watched kind
pub struct Reconciler {
    pub watch: WatchConfig,
    pub controllers: ControllerMap,
    pub resources: Arc<dyn ResourceClient>,
    pub runner: Arc<dyn Runner>,
    pub events: Arc<dyn EventPublisher>,
    /// Address the per-run kubeconfig points at
    pub proxy_addr: SocketAddr,
    pub event_level: EventLevel,
    pub debug_logs: bool,
    pub runner_timeout: Duration,
    pub backoff_states: BackoffStates,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("kind", &self.watch.kind)
            .field("proxy_addr", &self.proxy_addr)
            .field("event_level", &self.event_level)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    #[allow(clippy::too_many_arguments, reason = "wiring point for every collaborator")]
    pub fn new(
        watch: WatchConfig,
        controllers: ControllerMap,
        resources: Arc<dyn ResourceClient>,
        runner: Arc<dyn Runner>,
        events: Arc<dyn EventPublisher>,
        proxy_addr: SocketAddr,
        event_level: EventLevel,
        debug_logs: bool,
        runner_timeout: Duration,
    ) -> Self {
        Self {
            watch,
            controllers,
            resources,
            runner,
            events,
            proxy_addr,
            event_level,
            debug_logs,
            runner_timeout,
            backoff_states: BackoffStates::new(
                Duration::from_secs(ERROR_BACKOFF_START_SECS),
                Duration::from_secs(ERROR_BACKOFF_MAX_SECS),
            ),
        }
    }
}
