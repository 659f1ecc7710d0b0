//! # Job Events
//!
//! Events posted by the runner's HTTP event plugin, their classification into
//! task outcomes, and the receiver that collects them from the per-run unix
//! socket.

use crate::constants::RUNNER_EVENTS_PATH;
use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use tokio::net::UnixListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub const EVENT_RUNNER_ON_OK: &str = "runner_on_ok";
pub const EVENT_RUNNER_ON_FAILED: &str = "runner_on_failed";
pub const EVENT_RUNNER_ON_SKIPPED: &str = "runner_on_skipped";
pub const EVENT_RUNNER_ON_UNREACHABLE: &str = "runner_on_unreachable";
pub const EVENT_PLAYBOOK_ON_STATS: &str = "playbook_on_stats";
pub const EVENT_PLAYBOOK_ON_TASK_START: &str = "playbook_on_task_start";

/// One job event as posted by the runner
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub counter: i64,
    pub event: String,
    #[serde(default)]
    pub runner_ident: String,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub created: Option<String>,
    #[serde(default)]
    pub event_data: EventData,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventData {
    #[serde(default)]
    pub task: Option<String>,
    #[serde(default)]
    pub task_action: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub res: Option<Value>,
    #[serde(default)]
    pub ignore_errors: Option<bool>,
    /// Per-host counters, only set on `playbook_on_stats`
    #[serde(default)]
    pub ok: Option<HashMap<String, u32>>,
    #[serde(default)]
    pub changed: Option<HashMap<String, u32>>,
    #[serde(default)]
    pub failures: Option<HashMap<String, u32>>,
    #[serde(default)]
    pub skipped: Option<HashMap<String, u32>>,
    #[serde(default)]
    pub dark: Option<HashMap<String, u32>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskOutcome {
    Ok,
    Changed,
    Failed,
    Skipped,
}

impl TaskOutcome {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskOutcome::Ok => "ok",
            TaskOutcome::Changed => "changed",
            TaskOutcome::Failed => "failed",
            TaskOutcome::Skipped => "skipped",
        }
    }
}

/// A task result reduced from a job event
#[derive(Debug, Clone, PartialEq)]
pub struct TaskEvent {
    pub counter: i64,
    pub task: String,
    pub outcome: TaskOutcome,
    pub host: Option<String>,
    pub result: Value,
}

impl TaskEvent {
    /// Failure text from `res.msg`, falling back to the event stdout
    #[must_use]
    pub fn message(&self, stdout: &str) -> String {
        self.result
            .get("msg")
            .and_then(Value::as_str)
            .map_or_else(|| stdout.trim().to_string(), str::to_string)
    }
}

impl JobEvent {
    /// Classify a runner event; anything that is not a task result is `None`
    #[must_use]
    pub fn classify(&self) -> Option<TaskEvent> {
        let data = &self.event_data;
        let result = data.res.clone().unwrap_or(Value::Null);
        let outcome = match self.event.as_str() {
            EVENT_RUNNER_ON_OK => {
                if result.get("changed").and_then(Value::as_bool) == Some(true) {
                    TaskOutcome::Changed
                } else {
                    TaskOutcome::Ok
                }
            }
            EVENT_RUNNER_ON_FAILED if data.ignore_errors == Some(true) => TaskOutcome::Ok,
            EVENT_RUNNER_ON_FAILED | EVENT_RUNNER_ON_UNREACHABLE => TaskOutcome::Failed,
            EVENT_RUNNER_ON_SKIPPED => TaskOutcome::Skipped,
            _ => return None,
        };
        Some(TaskEvent {
            counter: self.counter,
            task: data.task.clone().unwrap_or_default(),
            outcome,
            host: data.host.clone(),
            result,
        })
    }

    #[must_use]
    pub fn is_stats(&self) -> bool {
        self.event == EVENT_PLAYBOOK_ON_STATS
    }
}

/// Collects job events posted to a unix socket into an ordered channel.
///
/// The server stops when the receiver is dropped or `shutdown` is called, which
/// also closes the event channel once every accepted event has been delivered.
#[derive(Debug)]
pub struct EventReceiver {
    shutdown: Option<oneshot::Sender<()>>,
    server: JoinHandle<()>,
}

impl EventReceiver {
    pub fn bind(socket: &Path) -> std::io::Result<(Self, mpsc::UnboundedReceiver<JobEvent>)> {
        let listener = UnixListener::bind(socket)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let app = Router::new()
            .route(RUNNER_EVENTS_PATH, post(receive_event))
            .route(RUNNER_EVENTS_PATH.trim_end_matches('/'), post(receive_event))
            .with_state(tx);
        let server = tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.await;
            };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                warn!("Runner event receiver failed: {}", e);
            }
        });

        Ok((
            Self {
                shutdown: Some(shutdown_tx),
                server,
            },
            rx,
        ))
    }

    /// Stop accepting events and wait for in-flight posts to finish
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let server = std::mem::replace(&mut self.server, tokio::spawn(async {}));
        let _ = server.await;
    }
}

impl Drop for EventReceiver {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn receive_event(
    State(tx): State<mpsc::UnboundedSender<JobEvent>>,
    Json(payload): Json<Value>,
) -> StatusCode {
    // status updates share the endpoint but carry no `event`
    match serde_json::from_value::<JobEvent>(payload) {
        Ok(event) => {
            if tx.send(event).is_err() {
                debug!("Job event dropped, run already finished");
            }
        }
        Err(e) => debug!("Ignoring non-event payload: {}", e),
    }
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(value: Value) -> JobEvent {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_classify_ok_and_changed() {
        let ok = event(json!({"event": "runner_on_ok", "counter": 3, "event_data": {"task": "t", "res": {"changed": false}}}));
        assert_eq!(ok.classify().unwrap().outcome, TaskOutcome::Ok);

        let changed = event(json!({"event": "runner_on_ok", "event_data": {"task": "t", "res": {"changed": true}}}));
        assert_eq!(changed.classify().unwrap().outcome, TaskOutcome::Changed);
    }

    #[test]
    fn test_classify_failures() {
        let failed = event(json!({"event": "runner_on_failed", "event_data": {"task": "t", "res": {"msg": "boom"}}}));
        let task = failed.classify().unwrap();
        assert_eq!(task.outcome, TaskOutcome::Failed);
        assert_eq!(task.message(""), "boom");

        let ignored = event(json!({"event": "runner_on_failed", "event_data": {"task": "t", "ignore_errors": true}}));
        assert_eq!(ignored.classify().unwrap().outcome, TaskOutcome::Ok);

        let unreachable = event(json!({"event": "runner_on_unreachable", "event_data": {"task": "t"}}));
        assert_eq!(unreachable.classify().unwrap().outcome, TaskOutcome::Failed);
    }

    #[test]
    fn test_message_falls_back_to_stdout() {
        let failed = event(json!({"event": "runner_on_failed", "stdout": " fatal: oops \n", "event_data": {"task": "t"}}));
        assert_eq!(failed.classify().unwrap().message(&failed.stdout), "fatal: oops");
    }

    #[test]
    fn test_non_task_events_are_not_classified() {
        let start = event(json!({"event": "playbook_on_task_start", "event_data": {"task": "t"}}));
        assert!(start.classify().is_none());
        let stats = event(json!({"event": "playbook_on_stats", "event_data": {"ok": {"localhost": 2}}}));
        assert!(stats.is_stats());
        assert!(stats.classify().is_none());
    }

    #[test]
    fn test_status_payload_is_not_an_event() {
        let status = json!({"status": "running", "runner_ident": "x"});
        assert!(serde_json::from_value::<JobEvent>(status).is_err());
    }
}
