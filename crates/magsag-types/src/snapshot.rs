use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Durable checkpoint of mid-run state, unique per `(run_id, step_id)`.
/// Rewriting an existing pair replaces `state`/`metadata` in place and keeps
/// the `snapshot_id` assigned on first insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub snapshot_id: String,
    pub run_id: String,
    pub step_id: String,
    #[serde(default)]
    pub state: BTreeMap<String, Value>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    pub created_at: DateTime<Utc>,
}
