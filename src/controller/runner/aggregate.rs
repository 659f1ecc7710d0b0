//! # Event Aggregation
//!
//! Folds the ordered job events of one run into a summary, and decides which
//! task events are surfaced as cluster events.

use crate::config::duration::parse_kubernetes_duration;
use crate::controller::runner::events::{JobEvent, TaskEvent, TaskOutcome};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::warn;

/// Which classified task events become cluster events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventLevel {
    Nothing,
    #[default]
    Tasks,
    Everything,
}

impl EventLevel {
    /// Case-insensitive; unknown values fall back to `Tasks`
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "nothing" => EventLevel::Nothing,
            "tasks" => EventLevel::Tasks,
            "everything" => EventLevel::Everything,
            other => {
                warn!("Unknown event level '{}', using 'tasks'", other);
                EventLevel::Tasks
            }
        }
    }

    #[must_use]
    pub fn surfaces(&self, outcome: TaskOutcome) -> bool {
        match self {
            EventLevel::Nothing => false,
            EventLevel::Tasks => matches!(outcome, TaskOutcome::Changed | TaskOutcome::Failed),
            EventLevel::Everything => true,
        }
    }
}

/// Task counters recorded on status conditions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnsibleResult {
    pub ok: u32,
    pub changed: u32,
    pub skipped: u32,
    pub failures: u32,
}

impl AnsibleResult {
    fn record(&mut self, outcome: TaskOutcome) {
        match outcome {
            TaskOutcome::Ok => self.ok += 1,
            TaskOutcome::Changed => self.changed += 1,
            TaskOutcome::Skipped => self.skipped += 1,
            TaskOutcome::Failed => self.failures += 1,
        }
    }
}

/// Running reduction of one run's events, fed in arrival order
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    counts: AnsibleResult,
    stats: Option<AnsibleResult>,
    failures: Vec<String>,
    requeue_after: Option<Duration>,
    events: usize,
}

impl RunSummary {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one event in and return its classification, if it is a task result
    pub fn observe(&mut self, event: &JobEvent) -> Option<TaskEvent> {
        self.events += 1;
        if event.is_stats() {
            self.stats = Some(stats_result(event));
            return None;
        }

        let task = event.classify()?;
        self.counts.record(task.outcome);
        match task.outcome {
            TaskOutcome::Failed => {
                let message = task.message(&event.stdout);
                self.failures.push(if task.task.is_empty() {
                    message
                } else {
                    format!("{}: {}", task.task, message)
                });
            }
            TaskOutcome::Ok | TaskOutcome::Changed => {
                if let Some(after) = requeue_after(event, &task.result) {
                    self.requeue_after = Some(after);
                }
            }
            TaskOutcome::Skipped => {}
        }
        Some(task)
    }

    /// Any failed task fails the run, whatever ran after it
    #[must_use]
    pub fn failed(&self) -> bool {
        self.result().failures > 0 || !self.failures.is_empty()
    }

    /// True once the final stats event arrived
    #[must_use]
    pub fn completed(&self) -> bool {
        self.stats.is_some()
    }

    /// Counters from the final stats when present, else from task events
    #[must_use]
    pub fn result(&self) -> AnsibleResult {
        self.stats.unwrap_or(self.counts)
    }

    #[must_use]
    pub fn failure_message(&self) -> String {
        self.failures.join("; ")
    }

    #[must_use]
    pub fn requeue_after(&self) -> Option<Duration> {
        self.requeue_after
    }

    #[must_use]
    pub fn events(&self) -> usize {
        self.events
    }
}

fn stats_result(event: &JobEvent) -> AnsibleResult {
    fn total(counts: Option<&HashMap<String, u32>>) -> u32 {
        counts.map_or(0, |c| c.values().sum())
    }
    let data = &event.event_data;
    AnsibleResult {
        ok: total(data.ok.as_ref()),
        changed: total(data.changed.as_ref()),
        skipped: total(data.skipped.as_ref()),
        failures: total(data.failures.as_ref()) + total(data.dark.as_ref()),
    }
}

/// Period requested by a `requeue_after` task
fn requeue_after(event: &JobEvent, result: &Value) -> Option<Duration> {
    let action = event.event_data.task_action.as_deref()?;
    if !action.ends_with("requeue_after") {
        return None;
    }
    let period = result
        .get("period")
        .or_else(|| result.get("requeue_after"))
        .and_then(Value::as_str)?;
    match parse_kubernetes_duration(period) {
        Ok(after) => Some(after),
        Err(e) => {
            warn!("Ignoring requeue_after with invalid period '{}': {}", period, e);
            None
        }
    }
}
