//! Agent catalog descriptors, consumed from per-agent YAML documents.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ValidationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    Main,
    Sub,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DependsOn {
    #[serde(default)]
    pub sub_agents: Vec<String>,
    #[serde(default)]
    pub skills: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Contracts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<String>,
}

/// One catalog entry. `entrypoint` names the registered implementation the
/// runner resolves at dispatch time; resolution is explicit, never
/// reflective.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub slug: String,
    pub role: AgentRole,
    pub entrypoint: String,
    #[serde(default)]
    pub depends_on: DependsOn,
    #[serde(default)]
    pub contracts: Contracts,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_class: Option<String>,
    #[serde(default)]
    pub budgets: BTreeMap<String, Value>,
    #[serde(default)]
    pub observability: BTreeMap<String, Value>,
    #[serde(default)]
    pub evaluation: BTreeMap<String, Value>,
    /// Task type used for route selection; defaults to the slug.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_type: Option<String>,
}

impl AgentDescriptor {
    pub fn from_yaml_str(raw: &str) -> Result<Self, ValidationError> {
        serde_yaml::from_str(raw)
            .map_err(|err| ValidationError::new(format!("invalid agent descriptor: {err}")))
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self, ValidationError> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            ValidationError::new(format!("cannot read {}: {err}", path.display()))
        })?;
        Self::from_yaml_str(&raw)
    }

    pub fn route_task_type(&self) -> &str {
        self.task_type.as_deref().unwrap_or(&self.slug)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_parses_minimal_yaml() {
        let descriptor = AgentDescriptor::from_yaml_str(
            "slug: offer-orchestrator\nrole: main\nentrypoint: orchestrator\n",
        )
        .unwrap();
        assert_eq!(descriptor.slug, "offer-orchestrator");
        assert_eq!(descriptor.role, AgentRole::Main);
        assert_eq!(descriptor.route_task_type(), "offer-orchestrator");
    }

    #[test]
    fn descriptor_rejects_unknown_role() {
        let err = AgentDescriptor::from_yaml_str("slug: x\nrole: sidekick\nentrypoint: e\n");
        assert!(err.is_err());
    }
}
