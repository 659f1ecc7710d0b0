//! # Status Conditions
//!
//! Computes `status.conditions` for reconciled objects. Three conditions are
//! owned here: `Running`, `Successful` and `Failure`. Conditions written by
//! the automation itself are carried through untouched.
//!
//! `lastTransitionTime` only moves when a condition's status flips, so two
//! runs with the same result produce identical conditions and no write.

use crate::controller::runner::AnsibleResult;
use kube::api::DynamicObject;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

pub const CONDITION_RUNNING: &str = "Running";
pub const CONDITION_SUCCESSFUL: &str = "Successful";
pub const CONDITION_FAILURE: &str = "Failure";

pub const REASON_RUNNING: &str = "Running";
pub const REASON_SUCCESSFUL: &str = "Successful";
pub const REASON_FAILED: &str = "Failed";

const MESSAGE_RUNNING: &str = "Running reconciliation";
const MESSAGE_AWAITING: &str = "Awaiting next reconciliation";
const MESSAGE_SUCCEEDED: &str = "Last reconciliation succeeded";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ansible_result: Option<AnsibleResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
    /// Fields this operator does not know about, preserved on rewrite
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Condition {
    fn new(
        condition_type: &str,
        reason: &str,
        message: &str,
        ansible_result: Option<AnsibleResult>,
    ) -> Self {
        Self {
            condition_type: condition_type.to_string(),
            status: "True".to_string(),
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            ansible_result,
            last_transition_time: None,
            extra: Map::new(),
        }
    }

    fn is_true(&self) -> bool {
        self.status == "True"
    }
}

/// Conditions currently stored on `obj`; malformed ones are dropped with a warning
#[must_use]
pub fn current_conditions(obj: &DynamicObject) -> Vec<Condition> {
    let Some(Value::Array(items)) = obj.data.pointer("/status/conditions") else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| match serde_json::from_value(item.clone()) {
            Ok(condition) => Some(condition),
            Err(e) => {
                warn!("Ignoring malformed status condition: {}", e);
                None
            }
        })
        .collect()
}

/// Insert or update `condition` in place, keeping the old transition time
/// when its status did not change
pub fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition, now: &str) {
    match conditions
        .iter_mut()
        .find(|c| c.condition_type == condition.condition_type)
    {
        Some(existing) => {
            condition.last_transition_time = if existing.status == condition.status {
                existing
                    .last_transition_time
                    .clone()
                    .or_else(|| Some(now.to_string()))
            } else {
                Some(now.to_string())
            };
            condition.extra = std::mem::take(&mut existing.extra);
            *existing = condition;
        }
        None => {
            condition.last_transition_time = Some(now.to_string());
            conditions.push(condition);
        }
    }
}

pub fn remove_condition(conditions: &mut Vec<Condition>, condition_type: &str) {
    conditions.retain(|c| c.condition_type != condition_type);
}

/// Conditions to write when a run starts; `None` when `Running` is already true
#[must_use]
pub fn running_conditions(existing: &[Condition], now: &str) -> Option<Vec<Condition>> {
    if existing
        .iter()
        .any(|c| c.condition_type == CONDITION_RUNNING && c.is_true())
    {
        return None;
    }
    let mut conditions = existing.to_vec();
    set_condition(
        &mut conditions,
        Condition::new(CONDITION_RUNNING, REASON_RUNNING, MESSAGE_RUNNING, None),
        now,
    );
    Some(conditions)
}

/// Conditions after a completed run; `failure` carries the joined failure messages
#[must_use]
pub fn final_conditions(
    existing: &[Condition],
    result: AnsibleResult,
    failure: Option<&str>,
    now: &str,
) -> Vec<Condition> {
    let mut conditions = existing.to_vec();
    set_condition(
        &mut conditions,
        Condition::new(CONDITION_RUNNING, REASON_SUCCESSFUL, MESSAGE_AWAITING, Some(result)),
        now,
    );
    match failure {
        Some(message) => {
            remove_condition(&mut conditions, CONDITION_SUCCESSFUL);
            set_condition(
                &mut conditions,
                Condition::new(CONDITION_FAILURE, REASON_FAILED, message, Some(result)),
                now,
            );
        }
        None => {
            remove_condition(&mut conditions, CONDITION_FAILURE);
            set_condition(
                &mut conditions,
                Condition::new(CONDITION_SUCCESSFUL, REASON_SUCCESSFUL, MESSAGE_SUCCEEDED, None),
                now,
            );
        }
    }
    conditions
}

/// JSON value for the conditions patch
pub fn to_value(conditions: &[Condition]) -> Result<Value, serde_json::Error> {
    serde_json::to_value(conditions)
}
