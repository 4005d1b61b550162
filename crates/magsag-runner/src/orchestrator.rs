//! Built-in MAG orchestration: decompose the payload into tasks, delegate
//! each to a sub-agent, aggregate the successful outputs, and wrap the
//! aggregate in a metadata envelope. Skill failures fall back rather than
//! abort; only zero successful delegations is terminal.

use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

use magsag_observability::RunLogger;
use magsag_types::{Delegation, ExecutionContext};

use crate::agents::MainAgent;
use crate::runner::AgentRunner;

const DECOMPOSITION_SKILL: &str = "task-decomposition";
const AGGREGATION_SKILL: &str = "result-aggregation";
const ENVELOPE_VERSION: &str = "0.1.0";

/// Terminal failure: every delegated task failed.
#[derive(Debug, thiserror::Error)]
#[error("no successful tasks for run {0}")]
pub struct NoSuccessfulTasks(pub String);

struct TaskSpec {
    target_agent: String,
    input: Value,
}

pub struct Orchestrator {
    default_target: String,
}

impl Orchestrator {
    /// `default_target` is the sub-agent used when decomposition is
    /// unavailable or unusable.
    pub fn new(default_target: impl Into<String>) -> Self {
        Self {
            default_target: default_target.into(),
        }
    }

    fn fallback_tasks(&self, payload: &Value) -> Vec<TaskSpec> {
        vec![TaskSpec {
            target_agent: self.default_target.clone(),
            input: json!({"payload": payload}),
        }]
    }

    fn parse_tasks(value: &Value) -> Option<Vec<TaskSpec>> {
        let items = value
            .as_array()
            .or_else(|| value.get("tasks").and_then(Value::as_array))?;
        let mut tasks = Vec::with_capacity(items.len());
        for item in items {
            let target_agent = item.get("target_agent").and_then(Value::as_str)?;
            tasks.push(TaskSpec {
                target_agent: target_agent.to_string(),
                input: item.get("input").cloned().unwrap_or(Value::Null),
            });
        }
        Some(tasks)
    }
}

#[async_trait]
impl MainAgent for Orchestrator {
    async fn run(
        &self,
        payload: Value,
        context: &ExecutionContext,
        runner: &AgentRunner,
        obs: &RunLogger,
    ) -> anyhow::Result<Value> {
        let run_id = context.run_id.clone().unwrap_or_default();
        let slug = context
            .agent_slug
            .clone()
            .unwrap_or_else(|| "orchestrator".to_string());
        let started = Instant::now();
        obs.log("start", json!({"agent": slug}));

        let tasks = if runner.skills().exists(DECOMPOSITION_SKILL) {
            match runner
                .skills()
                .invoke(DECOMPOSITION_SKILL, json!({"payload": payload}))
                .await
            {
                Ok(decomposed) => match Self::parse_tasks(&decomposed) {
                    Some(tasks) if !tasks.is_empty() => {
                        obs.log("decomposition", json!({"task_count": tasks.len()}));
                        tasks
                    }
                    _ => {
                        obs.log(
                            "decomposition_error",
                            json!({"error": "unusable decomposition output"}),
                        );
                        self.fallback_tasks(&payload)
                    }
                },
                Err(err) => {
                    obs.log("decomposition_error", json!({"error": err.to_string()}));
                    self.fallback_tasks(&payload)
                }
            }
        } else {
            self.fallback_tasks(&payload)
        };

        let total_tasks = tasks.len();
        let mut results = Vec::with_capacity(total_tasks);
        for (task_index, task) in tasks.into_iter().enumerate() {
            let mut task_id = Uuid::new_v4().simple().to_string();
            task_id.truncate(6);
            let task_id = format!("task-{task_id}");

            let delegation = Delegation {
                task_id: task_id.clone(),
                target_agent: task.target_agent.clone(),
                input: task.input,
                context: ExecutionContext {
                    parent_run_id: Some(run_id.clone()),
                    agent_slug: Some(task.target_agent.clone()),
                    task_index: Some(task_index),
                    total_tasks: Some(total_tasks),
                    ..ExecutionContext::default()
                },
            };

            obs.log(
                "delegation_start",
                json!({
                    "task_id": task_id,
                    "target_agent": delegation.target_agent,
                    "index": task_index,
                }),
            );

            let result = runner.invoke_sag(delegation).await;
            if result.is_success() {
                obs.log(
                    "delegation_complete",
                    json!({
                        "task_id": result.task_id,
                        "status": "success",
                        "metrics": result.metrics,
                    }),
                );
            } else {
                obs.log(
                    "delegation_failure",
                    json!({"task_id": result.task_id, "error": result.error}),
                );
            }
            results.push(result);
        }

        let successful: Vec<Value> = results
            .iter()
            .filter(|r| r.is_success())
            .map(|r| r.output.clone())
            .collect();
        let successful_tasks = successful.len();

        if successful_tasks == 0 {
            obs.log("end", json!({"status": "failure", "tasks": total_tasks}));
            return Err(NoSuccessfulTasks(run_id).into());
        }

        let aggregated = if runner.skills().exists(AGGREGATION_SKILL) {
            match runner
                .skills()
                .invoke(AGGREGATION_SKILL, json!({"results": successful}))
                .await
            {
                Ok(aggregate) => {
                    obs.log("aggregation", json!({"result_count": successful_tasks}));
                    aggregate
                }
                Err(err) => {
                    obs.log("aggregation_error", json!({"error": err.to_string()}));
                    successful.first().cloned().unwrap_or_else(|| json!({}))
                }
            }
        } else {
            successful.first().cloned().unwrap_or_else(|| json!({}))
        };

        let final_output = json!({
            "result": aggregated,
            "metadata": {
                "generated_by": slug,
                "run_id": run_id,
                "timestamp": Utc::now().to_rfc3339(),
                "version": ENVELOPE_VERSION,
                "task_count": total_tasks,
                "successful_tasks": successful_tasks,
            },
        });

        let duration_ms = started.elapsed().as_millis() as u64;
        obs.metric("latency_ms", duration_ms);
        obs.metric("task_count", total_tasks as u64);
        obs.metric("success_count", successful_tasks as u64);
        obs.log(
            "end",
            json!({
                "status": "success",
                "duration_ms": duration_ms,
                "tasks": total_tasks,
                "successful": successful_tasks,
            }),
        );

        Ok(final_output)
    }
}
