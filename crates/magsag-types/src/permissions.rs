use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::canonical::hash_args;
use crate::error::ValidationError;

/// Permission level for a tool or handoff. Policy files carry the
/// SCREAMING_SNAKE_CASE literals; anything else is a load-time error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ToolPermission {
    Always,
    RequireApproval,
    Never,
}

impl ToolPermission {
    pub fn as_str(self) -> &'static str {
        match self {
            ToolPermission::Always => "ALWAYS",
            ToolPermission::RequireApproval => "REQUIRE_APPROVAL",
            ToolPermission::Never => "NEVER",
        }
    }
}

impl std::str::FromStr for ToolPermission {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "ALWAYS" => Ok(ToolPermission::Always),
            "REQUIRE_APPROVAL" => Ok(ToolPermission::RequireApproval),
            "NEVER" => Ok(ToolPermission::Never),
            other => Err(ValidationError::new(format!(
                "unknown permission literal: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for ToolPermission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of an approval ticket. Approved, denied, and expired are
/// terminal; no transition leaves them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TicketStatus {
    Pending,
    Approved,
    Denied,
    Expired,
}

impl TicketStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TicketStatus::Pending)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TicketStatus::Pending => "pending",
            TicketStatus::Approved => "approved",
            TicketStatus::Denied => "denied",
            TicketStatus::Expired => "expired",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(TicketStatus::Pending),
            "approved" => Some(TicketStatus::Approved),
            "denied" => Some(TicketStatus::Denied),
            "expired" => Some(TicketStatus::Expired),
            _ => None,
        }
    }
}

impl std::fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Gating record that blocks a tool call until a decision or expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalTicket {
    pub ticket_id: String,
    pub run_id: String,
    pub agent_slug: String,
    pub tool_name: String,
    /// Original arguments. Never exposed on listener-facing payloads.
    pub tool_args: BTreeMap<String, Value>,
    /// Shallow redaction of `tool_args` safe for display.
    pub masked_args: BTreeMap<String, Value>,
    /// SHA-256 hex over the canonical JSON of `tool_args`; stable under key
    /// reordering.
    pub args_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub status: TicketStatus,
    pub requested_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<BTreeMap<String, Value>>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl ApprovalTicket {
    /// Build a fresh pending ticket, computing the masked view and the
    /// canonical argument hash.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ticket_id: impl Into<String>,
        run_id: impl Into<String>,
        agent_slug: impl Into<String>,
        tool_name: impl Into<String>,
        tool_args: BTreeMap<String, Value>,
        step_id: Option<String>,
        requested_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
        metadata: BTreeMap<String, Value>,
    ) -> Self {
        let masked_args = mask_tool_args(&tool_args);
        let args_hash = hash_args(&tool_args);
        Self {
            ticket_id: ticket_id.into(),
            run_id: run_id.into(),
            agent_slug: agent_slug.into(),
            tool_name: tool_name.into(),
            tool_args,
            masked_args,
            args_hash,
            step_id,
            status: TicketStatus::Pending,
            requested_at,
            expires_at,
            resolved_at: None,
            resolved_by: None,
            decision_reason: None,
            response: None,
            metadata,
        }
    }

    /// Listener-facing projection: the ticket with `tool_args` replaced by
    /// the masked view. This is the payload carried on `approval.required`
    /// and `approval.updated` events.
    pub fn public_view(&self) -> Value {
        json!({
            "ticket_id": self.ticket_id,
            "run_id": self.run_id,
            "agent_slug": self.agent_slug,
            "tool_name": self.tool_name,
            "tool_args": self.masked_args,
            "args_hash": self.args_hash,
            "step_id": self.step_id,
            "status": self.status,
            "requested_at": self.requested_at.to_rfc3339(),
            "expires_at": self.expires_at.to_rfc3339(),
            "resolved_at": self.resolved_at.map(|t| t.to_rfc3339()),
            "resolved_by": self.resolved_by,
            "decision_reason": self.decision_reason,
            "metadata": self.metadata,
        })
    }
}

const SENSITIVE_KEY_PARTS: &[&str] = &[
    "password",
    "token",
    "secret",
    "api_key",
    "authorization",
    "credential",
];

const MASK_SENTINEL: &str = "***";

/// Shallow redaction of tool arguments: any top-level key containing a
/// sensitive fragment (case-insensitive) has its value replaced by `***`.
pub fn mask_tool_args(args: &BTreeMap<String, Value>) -> BTreeMap<String, Value> {
    args.iter()
        .map(|(key, value)| {
            let lowered = key.to_lowercase();
            if SENSITIVE_KEY_PARTS.iter().any(|part| lowered.contains(part)) {
                (key.clone(), Value::String(MASK_SENTINEL.to_string()))
            } else {
                (key.clone(), value.clone())
            }
        })
        .collect()
}
