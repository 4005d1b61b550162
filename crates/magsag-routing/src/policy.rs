//! Routing policy: declarative task-type patterns mapped to providers and
//! execution strategies.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use magsag_types::{wildcard_matches, ValidationError};

/// One route. `task_type` may be an exact identifier or a `*` glob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    pub task_type: String,
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub use_batch: bool,
    #[serde(default)]
    pub use_cache: bool,
    #[serde(default)]
    pub structured_output: bool,
    #[serde(default)]
    pub moderation: bool,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

/// Caller overrides applied to a selected route. Absent fields keep the
/// route's values.
#[derive(Debug, Clone, Default)]
pub struct PlanOverrides {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub use_batch: Option<bool>,
    pub use_cache: Option<bool>,
    pub structured_output: Option<bool>,
    pub moderation: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingPolicy {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub routes: Vec<Route>,
}

impl RoutingPolicy {
    pub fn empty(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            routes: Vec::new(),
        }
    }

    /// Load a policy, sorting routes by descending priority. The sort is
    /// stable, so equal priorities keep declaration order.
    pub fn from_yaml_str(raw: &str) -> Result<Self, ValidationError> {
        let mut policy: Self = serde_yaml::from_str(raw)
            .map_err(|err| ValidationError::new(format!("invalid routing policy: {err}")))?;
        policy.routes.sort_by_key(|route| std::cmp::Reverse(route.priority));
        Ok(policy)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self, ValidationError> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            ValidationError::new(format!("cannot read {}: {err}", path.display()))
        })?;
        Self::from_yaml_str(&raw)
    }

    /// Select a route for a task type. An exact match beats any glob match;
    /// within each class the highest-priority (earliest) route wins.
    pub fn get_route(&self, task_type: &str, overrides: Option<&PlanOverrides>) -> Option<Route> {
        let matched = self
            .routes
            .iter()
            .find(|route| route.task_type == task_type)
            .or_else(|| {
                self.routes
                    .iter()
                    .find(|route| wildcard_matches(&route.task_type, task_type))
            })?;

        let mut route = matched.clone();
        if let Some(overrides) = overrides {
            if let Some(provider) = &overrides.provider {
                route.provider = provider.clone();
            }
            if let Some(model) = &overrides.model {
                route.model = model.clone();
            }
            if let Some(use_batch) = overrides.use_batch {
                route.use_batch = use_batch;
            }
            if let Some(use_cache) = overrides.use_cache {
                route.use_cache = use_cache;
            }
            if let Some(structured_output) = overrides.structured_output {
                route.structured_output = structured_output;
            }
            if let Some(moderation) = overrides.moderation {
                route.moderation = moderation;
            }
        }
        Some(route)
    }
}
