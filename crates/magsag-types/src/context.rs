use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Execution context threaded explicitly through the runner, hooks, and
/// governance instead of living in task-local storage. Cloning is cheap and
/// every delegation gets its own copy, so contexts never leak across tasks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_slug: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tasks: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handoff_id: Option<String>,
    /// Free-form keys (trace ids, approval metadata, platform hints).
    #[serde(default)]
    pub extra: BTreeMap<String, Value>,
}

impl ExecutionContext {
    pub fn for_run(run_id: impl Into<String>, agent_slug: impl Into<String>) -> Self {
        Self {
            run_id: Some(run_id.into()),
            agent_slug: Some(agent_slug.into()),
            ..Self::default()
        }
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Flatten into a JSON object for policy matching and event payloads.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Outcome classification for a delegation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DelegationStatus {
    Success,
    Failure,
}

/// A MAG-to-SAG handoff request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delegation {
    pub task_id: String,
    pub target_agent: String,
    pub input: Value,
    pub context: ExecutionContext,
}

/// Result returned by a SAG invocation. Failures are values, not errors, so
/// the enclosing MAG can aggregate partial results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegationResult {
    pub task_id: String,
    pub status: DelegationStatus,
    pub output: Value,
    #[serde(default)]
    pub metrics: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DelegationResult {
    pub fn failure(task_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            status: DelegationStatus::Failure,
            output: Value::Object(serde_json::Map::new()),
            metrics: BTreeMap::new(),
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == DelegationStatus::Success
    }
}
