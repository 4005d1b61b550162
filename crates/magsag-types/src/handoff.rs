use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Target platform for a handoff. Foreign platforms are addressed but not
/// implemented by the core; `Other` keeps the identifier space open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Magsag,
    Adk,
    Openai,
    Anthropic,
    Other(String),
}

impl Platform {
    /// Parse a free-form platform identifier, folding known aliases.
    pub fn parse(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "magsag" | "native" => Platform::Magsag,
            "adk" | "anthropic-adk" => Platform::Adk,
            "openai" | "openai-compat" => Platform::Openai,
            "anthropic" | "claude" => Platform::Anthropic,
            other => Platform::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Platform::Magsag => "magsag",
            Platform::Adk => "adk",
            Platform::Openai => "openai",
            Platform::Anthropic => "anthropic",
            Platform::Other(name) => name,
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Rejected,
}

/// Request to delegate work to another agent or platform, tracked for its
/// full lifetime including rejections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffRequest {
    pub handoff_id: String,
    pub source_agent: String,
    pub target_agent: String,
    pub task: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default)]
    pub context: BTreeMap<String, Value>,
    pub created_at: DateTime<Utc>,
    pub status: HandoffStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_aliases_fold_to_variants() {
        assert_eq!(Platform::parse("native"), Platform::Magsag);
        assert_eq!(Platform::parse("Claude"), Platform::Anthropic);
        assert_eq!(Platform::parse("openai-compat"), Platform::Openai);
        assert_eq!(
            Platform::parse("langgraph"),
            Platform::Other("langgraph".to_string())
        );
    }
}
