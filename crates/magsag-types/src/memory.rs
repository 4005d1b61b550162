use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ValidationError;

/// Lifetime and visibility of a memory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryScope {
    /// Scoped to a single run; requires `run_id`.
    Session,
    /// Persisted across runs for the same agent.
    LongTerm,
    /// Shared across all agents in an organization.
    Org,
}

impl MemoryScope {
    pub fn as_str(self) -> &'static str {
        match self {
            MemoryScope::Session => "session",
            MemoryScope::LongTerm => "long_term",
            MemoryScope::Org => "org",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "session" => Some(MemoryScope::Session),
            "long_term" => Some(MemoryScope::LongTerm),
            "org" => Some(MemoryScope::Org),
            _ => None,
        }
    }

    /// Default retention for entries created without an explicit TTL.
    pub fn default_ttl(self) -> Duration {
        match self {
            MemoryScope::Session => Duration::hours(1),
            MemoryScope::LongTerm => Duration::days(30),
            MemoryScope::Org => Duration::days(90),
        }
    }
}

impl std::fmt::Display for MemoryScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed PII vocabulary. Serde rejects anything outside this set, which is
/// the load-time validation the compliance layer relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PiiTag {
    Email,
    Phone,
    Ssn,
    Name,
    Address,
    CreditCard,
    IpAddress,
    Biometric,
    Health,
    Financial,
}

impl PiiTag {
    pub fn as_str(self) -> &'static str {
        match self {
            PiiTag::Email => "email",
            PiiTag::Phone => "phone",
            PiiTag::Ssn => "ssn",
            PiiTag::Name => "name",
            PiiTag::Address => "address",
            PiiTag::CreditCard => "credit_card",
            PiiTag::IpAddress => "ip_address",
            PiiTag::Biometric => "biometric",
            PiiTag::Health => "health",
            PiiTag::Financial => "financial",
        }
    }
}

/// A single piece of stored agent context with governance metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub memory_id: String,
    pub scope: MemoryScope,
    pub agent_slug: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub key: String,
    pub value: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pii_tags: Vec<PiiTag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_policy: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl MemoryEntry {
    pub fn new(
        scope: MemoryScope,
        agent_slug: impl Into<String>,
        key: impl Into<String>,
        value: Value,
        run_id: Option<String>,
    ) -> Result<Self, ValidationError> {
        if scope == MemoryScope::Session && run_id.is_none() {
            return Err(ValidationError::new(
                "run_id is required for session-scoped memories",
            ));
        }
        let now = Utc::now();
        Ok(Self {
            memory_id: Uuid::new_v4().to_string(),
            scope,
            agent_slug: agent_slug.into(),
            run_id,
            key: key.into(),
            value,
            created_at: now,
            updated_at: now,
            expires_at: None,
            pii_tags: Vec::new(),
            retention_policy: None,
            tags: Vec::new(),
            metadata: BTreeMap::new(),
            embedding: None,
        })
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.expires_at = Some(Utc::now() + ttl);
        self.updated_at = Utc::now();
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| now >= at).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn session_scope_requires_run_id() {
        assert!(MemoryEntry::new(MemoryScope::Session, "a", "k", json!({}), None).is_err());
        assert!(
            MemoryEntry::new(MemoryScope::Session, "a", "k", json!({}), Some("r".into())).is_ok()
        );
        assert!(MemoryEntry::new(MemoryScope::Org, "a", "k", json!({}), None).is_ok());
    }

    #[test]
    fn unknown_pii_tag_fails_deserialization() {
        let err = serde_json::from_str::<PiiTag>("\"shoe_size\"");
        assert!(err.is_err());
        let ok: PiiTag = serde_json::from_str("\"credit_card\"").unwrap();
        assert_eq!(ok, PiiTag::CreditCard);
    }

    #[test]
    fn ttl_marks_expiry() {
        let entry = MemoryEntry::new(MemoryScope::Org, "a", "k", json!(1), None)
            .unwrap()
            .with_ttl(Duration::seconds(-1));
        assert!(entry.is_expired(Utc::now()));
    }
}
