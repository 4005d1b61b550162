//! Plan materialization with environment-variable provider overrides.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use magsag_types::ValidationError;

use crate::policy::{PlanOverrides, Route, RoutingPolicy};

/// Materialized execution choice. `metadata` is an owned copy; mutating a
/// plan never mutates the route it came from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub task_type: String,
    pub provider: String,
    pub model: String,
    pub use_batch: bool,
    pub use_cache: bool,
    pub structured_output: bool,
    pub moderation: bool,
    pub metadata: BTreeMap<String, Value>,
}

impl Plan {
    fn from_route(route: Route) -> Self {
        Self {
            task_type: route.task_type,
            provider: route.provider,
            model: route.model,
            use_batch: route.use_batch,
            use_cache: route.use_cache,
            structured_output: route.structured_output,
            moderation: route.moderation,
            metadata: route.metadata,
        }
    }
}

pub struct Router {
    policy: RoutingPolicy,
}

impl Router {
    pub fn new(policy: RoutingPolicy) -> Self {
        Self { policy }
    }

    pub fn with_default_policy() -> Self {
        Self::new(RoutingPolicy::empty("default"))
    }

    pub fn policy(&self) -> &RoutingPolicy {
        &self.policy
    }

    /// Select and materialize a plan. `MAGSAG_PROVIDER` / `MAGSAG_MODEL`
    /// override the route's provider and model; explicit caller overrides
    /// take precedence over the environment.
    pub fn get_plan(&self, task_type: &str, overrides: Option<&PlanOverrides>) -> Option<Plan> {
        let mut merged = PlanOverrides {
            provider: std::env::var("MAGSAG_PROVIDER").ok().filter(|v| !v.is_empty()),
            model: std::env::var("MAGSAG_MODEL").ok().filter(|v| !v.is_empty()),
            ..PlanOverrides::default()
        };
        if let Some(explicit) = overrides {
            if explicit.provider.is_some() {
                merged.provider = explicit.provider.clone();
            }
            if explicit.model.is_some() {
                merged.model = explicit.model.clone();
            }
            merged.use_batch = explicit.use_batch;
            merged.use_cache = explicit.use_cache;
            merged.structured_output = explicit.structured_output;
            merged.moderation = explicit.moderation;
        }

        let route = self.policy.get_route(task_type, Some(&merged))?;
        Some(Plan::from_route(route))
    }
}

/// Convenience wrapper selecting against an explicit policy (or an empty
/// default when `None`).
pub fn get_plan(
    task_type: &str,
    overrides: Option<&PlanOverrides>,
    policy: Option<&RoutingPolicy>,
) -> Option<Plan> {
    match policy {
        Some(policy) => Router::new(policy.clone()).get_plan(task_type, overrides),
        None => Router::with_default_policy().get_plan(task_type, overrides),
    }
}

/// Load a named policy from `<base_dir>/<name>.yaml`.
pub fn load_policy(name: &str, base_dir: &Path) -> Result<RoutingPolicy, ValidationError> {
    RoutingPolicy::from_yaml_file(&base_dir.join(format!("{name}.yaml")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn policy() -> RoutingPolicy {
        RoutingPolicy::from_yaml_str(
            r#"
name: default
routes:
  - task_type: "offer-orchestration"
    provider: anthropic
    model: claude-3-5-sonnet
    metadata:
      team: offers
"#,
        )
        .unwrap()
    }

    #[test]
    fn plan_metadata_is_not_aliased_with_route() {
        let router = Router::new(policy());
        let mut plan = router.get_plan("offer-orchestration", None).unwrap();
        plan.metadata.insert("mutated".to_string(), json!(true));

        let fresh = router.get_plan("offer-orchestration", None).unwrap();
        assert!(!fresh.metadata.contains_key("mutated"));
        assert_eq!(fresh.metadata["team"], json!("offers"));
    }

    #[test]
    fn missing_route_yields_none() {
        let router = Router::new(policy());
        assert!(router.get_plan("unknown-task", None).is_none());
    }

    #[test]
    fn explicit_override_beats_environment() {
        std::env::set_var("MAGSAG_PROVIDER", "google");
        let router = Router::new(policy());

        let env_plan = router.get_plan("offer-orchestration", None).unwrap();
        assert_eq!(env_plan.provider, "google");

        let overrides = PlanOverrides {
            provider: Some("local".to_string()),
            ..PlanOverrides::default()
        };
        let explicit = router
            .get_plan("offer-orchestration", Some(&overrides))
            .unwrap();
        assert_eq!(explicit.provider, "local");
        std::env::remove_var("MAGSAG_PROVIDER");
    }

    #[test]
    fn load_policy_resolves_by_name() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("cost-optimized.yaml"),
            "name: cost-optimized\nroutes: []\n",
        )
        .unwrap();
        let policy = load_policy("cost-optimized", dir.path()).unwrap();
        assert_eq!(policy.name, "cost-optimized");
        assert!(load_policy("missing", dir.path()).is_err());
    }
}
