use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One LLM call's cost sample. Timestamps are RFC 3339 strings so the
/// audit-log line and the relational row carry the same representation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostRecord {
    pub timestamp: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub cost_usd: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

/// Per-model or per-agent slice of an aggregation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub cost_usd: f64,
    pub tokens: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub calls: u64,
}

impl CostBreakdown {
    pub fn absorb(&mut self, record: &CostRecord) {
        self.cost_usd += record.cost_usd;
        self.tokens += record.total_tokens;
        self.input_tokens += record.input_tokens;
        self.output_tokens += record.output_tokens;
        self.calls += 1;
    }
}

/// Aggregated cost summary over an optional time window and filters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostSummary {
    pub total_cost_usd: f64,
    pub total_tokens: u64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_calls: u64,
    #[serde(default)]
    pub by_model: BTreeMap<String, CostBreakdown>,
    /// Records with no agent attribution count toward the totals but are
    /// excluded here.
    #[serde(default)]
    pub by_agent: BTreeMap<String, CostBreakdown>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period_start: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period_end: Option<String>,
}
