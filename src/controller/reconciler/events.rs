//! # Cluster Events
//!
//! Publishes surfaced task events and reconcile failures against the
//! reconciled object.

use crate::constants::OPERATOR_NAME;
use crate::controller::runner::{TaskEvent, TaskOutcome};
use async_trait::async_trait;
use kube::api::{ApiResource, DynamicObject};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};

pub const REASON_RECONCILE_FAILED: &str = "ReconcileFailed";
pub const REASON_AUTOMATION_ERROR: &str = "AutomationError";

/// Event severity, mirrored from the cluster's Normal/Warning split
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Normal,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterEvent {
    pub severity: Severity,
    pub reason: String,
    pub action: String,
    pub note: String,
}

impl ClusterEvent {
    /// `Normal` for ok/changed/skipped tasks, `Warning` for failures
    #[must_use]
    pub fn for_task(task: &TaskEvent, stdout: &str) -> Self {
        let (severity, reason) = match task.outcome {
            TaskOutcome::Failed => (Severity::Warning, "TaskFailed"),
            TaskOutcome::Changed => (Severity::Normal, "TaskChanged"),
            TaskOutcome::Ok => (Severity::Normal, "TaskOk"),
            TaskOutcome::Skipped => (Severity::Normal, "TaskSkipped"),
        };
        let note = match task.outcome {
            TaskOutcome::Failed => format!("{}: {}", task.task, task.message(stdout)),
            _ => format!("{}: {}", task.task, task.outcome.as_str()),
        };
        Self {
            severity,
            reason: reason.to_string(),
            action: "Reconcile".to_string(),
            note,
        }
    }

    #[must_use]
    pub fn warning(reason: &str, note: &str) -> Self {
        Self {
            severity: Severity::Warning,
            reason: reason.to_string(),
            action: "Reconcile".to_string(),
            note: note.to_string(),
        }
    }
}

#[async_trait]
pub trait EventPublisher: Send + Sync + std::fmt::Debug {
    async fn publish(&self, obj: &DynamicObject, event: ClusterEvent) -> anyhow::Result<()>;
}

/// Publishes through the `events.k8s.io` API
#[derive(Clone)]
pub struct KubeEventPublisher {
    recorder: Recorder,
    resource: ApiResource,
}

impl std::fmt::Debug for KubeEventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeEventPublisher")
            .field("resource", &self.resource.kind)
            .finish_non_exhaustive()
    }
}

impl KubeEventPublisher {
    #[must_use]
    pub fn new(client: Client, resource: ApiResource) -> Self {
        let reporter = Reporter {
            controller: OPERATOR_NAME.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
            resource,
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(&self, obj: &DynamicObject, event: ClusterEvent) -> anyhow::Result<()> {
        let reference = obj.object_ref(&self.resource);
        // the API caps notes at 1kB
        let mut note = event.note;
        if note.len() > 1024 {
            let mut end = 1024;
            while !note.is_char_boundary(end) {
                end -= 1;
            }
            note.truncate(end);
        }
        self.recorder
            .publish(
                &Event {
                    type_: match event.severity {
                        Severity::Normal => EventType::Normal,
                        Severity::Warning => EventType::Warning,
                    },
                    reason: event.reason,
                    note: Some(note),
                    action: event.action,
                    secondary: None,
                },
                &reference,
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_task_events() {
        let failed = TaskEvent {
            counter: 1,
            task: "create secret".to_string(),
            outcome: TaskOutcome::Failed,
            host: None,
            result: json!({"msg": "forbidden"}),
        };
        let event = ClusterEvent::for_task(&failed, "");
        assert_eq!(event.severity, Severity::Warning);
        assert_eq!(event.note, "create secret: forbidden");

        let changed = TaskEvent {
            outcome: TaskOutcome::Changed,
            result: json!({"changed": true}),
            ..failed
        };
        let event = ClusterEvent::for_task(&changed, "");
        assert_eq!(event.severity, Severity::Normal);
        assert_eq!(event.reason, "TaskChanged");
        assert_eq!(event.note, "create secret: changed");
    }
}
