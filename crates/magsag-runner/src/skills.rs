use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

/// A callable capability an agent can invoke by name. Skill failures are
/// ordinary errors; orchestration decides whether to fall back.
#[async_trait]
pub trait Skill: Send + Sync {
    fn name(&self) -> &str;

    async fn invoke(&self, input: Value) -> anyhow::Result<Value>;
}

/// Explicit skill registry; no reflective lookup.
#[derive(Default)]
pub struct SkillRegistry {
    skills: HashMap<String, Arc<dyn Skill>>,
}

impl SkillRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, skill: Arc<dyn Skill>) {
        self.skills.insert(skill.name().to_string(), skill);
    }

    pub fn exists(&self, name: &str) -> bool {
        self.skills.contains_key(name)
    }

    pub async fn invoke(&self, name: &str, input: Value) -> anyhow::Result<Value> {
        let skill = self
            .skills
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("unknown skill: {name}"))?;
        skill.invoke(input).await
    }
}

/// Built-in decomposition: a payload carrying an `items` array fans out to
/// one task per item against a fixed target agent; anything else becomes a
/// single task wrapping the whole payload.
pub struct FanoutDecomposition {
    target_agent: String,
}

impl FanoutDecomposition {
    pub fn new(target_agent: impl Into<String>) -> Self {
        Self {
            target_agent: target_agent.into(),
        }
    }
}

#[async_trait]
impl Skill for FanoutDecomposition {
    fn name(&self) -> &str {
        "task-decomposition"
    }

    async fn invoke(&self, input: Value) -> anyhow::Result<Value> {
        let payload = input.get("payload").cloned().unwrap_or(Value::Null);
        let tasks = match payload.get("items").and_then(Value::as_array) {
            Some(items) if !items.is_empty() => items
                .iter()
                .enumerate()
                .map(|(index, item)| {
                    serde_json::json!({
                        "target_agent": self.target_agent,
                        "input": {"item": item, "index": index},
                    })
                })
                .collect(),
            _ => vec![serde_json::json!({
                "target_agent": self.target_agent,
                "input": {"payload": payload},
            })],
        };
        Ok(Value::Array(tasks))
    }
}

/// Built-in aggregation: object results merge shallowly (later keys win);
/// mixed results are collected under `outputs`.
pub struct MergeAggregation;

#[async_trait]
impl Skill for MergeAggregation {
    fn name(&self) -> &str {
        "result-aggregation"
    }

    async fn invoke(&self, input: Value) -> anyhow::Result<Value> {
        let results = input
            .get("results")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        if !results.is_empty() && results.iter().all(Value::is_object) {
            let mut merged = serde_json::Map::new();
            for result in &results {
                if let Value::Object(map) = result {
                    for (key, value) in map {
                        merged.insert(key.clone(), value.clone());
                    }
                }
            }
            return Ok(Value::Object(merged));
        }
        Ok(serde_json::json!({"outputs": results}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Upper;

    #[async_trait]
    impl Skill for Upper {
        fn name(&self) -> &str {
            "upper"
        }

        async fn invoke(&self, input: Value) -> anyhow::Result<Value> {
            let text = input["text"].as_str().unwrap_or_default();
            Ok(json!({"text": text.to_uppercase()}))
        }
    }

    #[tokio::test]
    async fn registry_dispatches_by_name() {
        let mut registry = SkillRegistry::new();
        registry.register(Arc::new(Upper));
        assert!(registry.exists("upper"));
        assert!(!registry.exists("lower"));

        let out = registry.invoke("upper", json!({"text": "hi"})).await.unwrap();
        assert_eq!(out["text"], json!("HI"));
        assert!(registry.invoke("lower", json!({})).await.is_err());
    }

    #[tokio::test]
    async fn fanout_splits_items_into_tasks() {
        let skill = FanoutDecomposition::new("advisor");
        let tasks = skill
            .invoke(json!({"payload": {"items": ["a", "b"]}}))
            .await
            .unwrap();
        let tasks = tasks.as_array().unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0]["target_agent"], json!("advisor"));
        assert_eq!(tasks[1]["input"]["item"], json!("b"));
        assert_eq!(tasks[1]["input"]["index"], json!(1));
    }

    #[tokio::test]
    async fn fanout_wraps_plain_payload_as_single_task() {
        let skill = FanoutDecomposition::new("advisor");
        let tasks = skill.invoke(json!({"payload": {"id": 7}})).await.unwrap();
        let tasks = tasks.as_array().unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0]["input"]["payload"]["id"], json!(7));
    }

    #[tokio::test]
    async fn merge_aggregation_combines_objects() {
        let skill = MergeAggregation;
        let merged = skill
            .invoke(json!({"results": [{"a": 1}, {"b": 2}, {"a": 3}]}))
            .await
            .unwrap();
        assert_eq!(merged, json!({"a": 3, "b": 2}));

        let mixed = skill
            .invoke(json!({"results": [{"a": 1}, "plain"]}))
            .await
            .unwrap();
        assert_eq!(mixed["outputs"][1], json!("plain"));
    }
}
