use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// In-process runtime event carried on the broadcast bus (approval fan-out,
/// handoff notifications, run lifecycle).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeEvent {
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub properties: Value,
}

impl RuntimeEvent {
    pub fn new(event_type: impl Into<String>, properties: Value) -> Self {
        Self {
            event_type: event_type.into(),
            timestamp: Utc::now(),
            properties,
        }
    }
}
