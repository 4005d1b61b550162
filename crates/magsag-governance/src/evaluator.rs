//! Declarative tool-permission policy and its evaluator.
//!
//! Evaluation order, first match wins: exact tool rule, context rules in
//! declaration order, dangerous patterns, categories, environment override,
//! policy default. All matching is case-sensitive.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use magsag_types::{wildcard_matches, ToolPermission, ValidationError};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission: Option<ToolPermission>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryRule {
    #[serde(default)]
    pub tools: Vec<String>,
    pub permission: ToolPermission,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleCondition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args_match: Option<BTreeMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_match: Option<BTreeMap<String, Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub condition: RuleCondition,
    pub permission: ToolPermission,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DangerousPattern {
    pub pattern: String,
    pub permission: ToolPermission,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvironmentRules {
    #[serde(default)]
    pub overrides: BTreeMap<String, ToolPermission>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_permission: Option<ToolPermission>,
}

/// Top-level policy document. Deserializing rejects unknown permission
/// literals, which is the load-time validation the spec requires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionPolicy {
    pub default_permission: ToolPermission,
    #[serde(default)]
    pub tools: BTreeMap<String, ToolRule>,
    #[serde(default)]
    pub categories: BTreeMap<String, CategoryRule>,
    #[serde(default)]
    pub context_rules: Vec<ContextRule>,
    #[serde(default)]
    pub dangerous_patterns: Vec<DangerousPattern>,
    #[serde(default)]
    pub environments: BTreeMap<String, EnvironmentRules>,
}

impl Default for PermissionPolicy {
    fn default() -> Self {
        Self {
            default_permission: ToolPermission::RequireApproval,
            tools: BTreeMap::new(),
            categories: BTreeMap::new(),
            context_rules: Vec::new(),
            dangerous_patterns: Vec::new(),
            environments: BTreeMap::new(),
        }
    }
}

impl PermissionPolicy {
    pub fn from_yaml_str(raw: &str) -> Result<Self, ValidationError> {
        serde_yaml::from_str(raw)
            .map_err(|err| ValidationError::new(format!("invalid permission policy: {err}")))
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self, ValidationError> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            ValidationError::new(format!("cannot read {}: {err}", path.display()))
        })?;
        Self::from_yaml_str(&raw)
    }
}

pub struct PermissionEvaluator {
    policy: PermissionPolicy,
    environment: String,
}

impl PermissionEvaluator {
    /// The ambient environment defaults to `MAGSAG_ENVIRONMENT`, then
    /// `production`.
    pub fn new(policy: PermissionPolicy, environment: Option<String>) -> Self {
        let environment = environment
            .or_else(|| std::env::var("MAGSAG_ENVIRONMENT").ok())
            .unwrap_or_else(|| "production".to_string());
        Self {
            policy,
            environment,
        }
    }

    pub fn from_yaml_file(
        path: &Path,
        environment: Option<String>,
    ) -> Result<Self, ValidationError> {
        Ok(Self::new(PermissionPolicy::from_yaml_file(path)?, environment))
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn evaluate(&self, tool_name: &str, context: &BTreeMap<String, Value>) -> ToolPermission {
        if let Some(permission) = self.check_tool(tool_name) {
            tracing::debug!(tool = tool_name, %permission, "explicit tool rule");
            return permission;
        }
        if let Some(permission) = self.check_context_rules(tool_name, context) {
            tracing::debug!(tool = tool_name, %permission, "context rule matched");
            return permission;
        }
        if let Some(permission) = self.check_dangerous_patterns(tool_name) {
            tracing::warn!(tool = tool_name, %permission, "dangerous pattern matched");
            return permission;
        }
        if let Some(permission) = self.check_categories(tool_name) {
            tracing::debug!(tool = tool_name, %permission, "category rule matched");
            return permission;
        }
        if let Some(permission) = self.check_environment(tool_name) {
            tracing::debug!(tool = tool_name, %permission, "environment override");
            return permission;
        }
        self.policy.default_permission
    }

    /// Tools the policy names explicitly that evaluate to `ALWAYS` in the
    /// given context.
    pub fn list_allowed_tools(&self, context: &BTreeMap<String, Value>) -> Vec<String> {
        self.policy
            .tools
            .keys()
            .filter(|tool| self.evaluate(tool, context) == ToolPermission::Always)
            .cloned()
            .collect()
    }

    fn check_tool(&self, tool_name: &str) -> Option<ToolPermission> {
        self.policy.tools.get(tool_name)?.permission
    }

    fn check_context_rules(
        &self,
        tool_name: &str,
        context: &BTreeMap<String, Value>,
    ) -> Option<ToolPermission> {
        for rule in &self.policy.context_rules {
            if rule_matches(&rule.condition, tool_name, context) {
                if let Some(name) = &rule.name {
                    tracing::info!(tool = tool_name, rule = %name, "context rule matched");
                }
                return Some(rule.permission);
            }
        }
        None
    }

    fn check_dangerous_patterns(&self, tool_name: &str) -> Option<ToolPermission> {
        self.policy
            .dangerous_patterns
            .iter()
            .find(|entry| wildcard_matches(&entry.pattern, tool_name))
            .map(|entry| entry.permission)
    }

    fn check_categories(&self, tool_name: &str) -> Option<ToolPermission> {
        for category in self.policy.categories.values() {
            if category
                .tools
                .iter()
                .any(|pattern| wildcard_matches(pattern, tool_name))
            {
                return Some(category.permission);
            }
        }
        None
    }

    fn check_environment(&self, tool_name: &str) -> Option<ToolPermission> {
        let env = self.policy.environments.get(&self.environment)?;
        if let Some(permission) = env.overrides.get(tool_name) {
            return Some(*permission);
        }
        for (pattern, permission) in &env.overrides {
            if wildcard_matches(pattern, tool_name) {
                return Some(*permission);
            }
        }
        env.default_permission
    }
}

/// A rule matches iff every present sub-condition matches.
fn rule_matches(
    condition: &RuleCondition,
    tool_name: &str,
    context: &BTreeMap<String, Value>,
) -> bool {
    if let Some(tool) = &condition.tool {
        if tool != tool_name {
            return false;
        }
    }
    if let Some(pattern) = &condition.tool_pattern {
        if !wildcard_matches(pattern, tool_name) {
            return false;
        }
    }
    if let Some(args_patterns) = &condition.args_match {
        let empty = BTreeMap::new();
        let args = context
            .get("tool_args")
            .and_then(Value::as_object)
            .map(|map| {
                map.iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect::<BTreeMap<_, _>>()
            })
            .unwrap_or(empty);
        if !values_match(&args, args_patterns) {
            return false;
        }
    }
    if let Some(context_patterns) = &condition.context_match {
        if !values_match(context, context_patterns) {
            return false;
        }
    }
    true
}

/// Literal equality, glob patterns on string values, and the numeric
/// comparators `less_than` / `greater_than` on object values.
fn values_match(data: &BTreeMap<String, Value>, patterns: &BTreeMap<String, Value>) -> bool {
    for (key, pattern) in patterns {
        let Some(value) = data.get(key) else {
            return false;
        };
        match pattern {
            Value::Object(comparators) => {
                let Some(actual) = value.as_f64() else {
                    return false;
                };
                if let Some(bound) = comparators.get("less_than").and_then(Value::as_f64) {
                    if actual >= bound {
                        return false;
                    }
                }
                if let Some(bound) = comparators.get("greater_than").and_then(Value::as_f64) {
                    if actual <= bound {
                        return false;
                    }
                }
            }
            Value::String(glob) => match value.as_str() {
                Some(text) => {
                    if !wildcard_matches(glob, text) {
                        return false;
                    }
                }
                None => return false,
            },
            other => {
                if value != other {
                    return false;
                }
            }
        }
    }
    true
}
