//! The agent runner: resolves agents from the catalog registry, mints run
//! ids, obtains routing plans, applies retry policy to sub-agent
//! invocations, and captures costs, memory, and artifacts per run.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

use magsag_memory::MemoryStore;
use magsag_observability::{CostTracker, RunLogger};
use magsag_routing::{MagInvoker, Router};
use magsag_storage::{StorageBackend, UpdateRun};
use magsag_types::{
    CostRecord, Delegation, DelegationResult, DelegationStatus, ExecutionContext, MemoryEntry,
    MemoryScope, RunStatus,
};

use crate::agents::AgentRegistry;
use crate::determinism;
use crate::error::RunnerError;
use crate::hooks::RunnerHooks;
use crate::orchestrator::NoSuccessfulTasks;
use crate::skills::SkillRegistry;

/// Retry policy for sub-agent invocations: up to `max_attempts` tries with
/// exponential backoff, applied to transient failures only.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

pub struct AgentRunner {
    registry: AgentRegistry,
    router: Router,
    skills: Arc<SkillRegistry>,
    storage: Option<Arc<dyn StorageBackend>>,
    cost_tracker: Option<Arc<CostTracker>>,
    memory: Option<Arc<MemoryStore>>,
    hooks: Option<Arc<RunnerHooks>>,
    retry: RetryPolicy,
}

#[derive(Default)]
pub struct AgentRunnerBuilder {
    registry: AgentRegistry,
    router: Option<Router>,
    skills: Option<Arc<SkillRegistry>>,
    storage: Option<Arc<dyn StorageBackend>>,
    cost_tracker: Option<Arc<CostTracker>>,
    memory: Option<Arc<MemoryStore>>,
    hooks: Option<Arc<RunnerHooks>>,
    retry: Option<RetryPolicy>,
}

impl AgentRunnerBuilder {
    pub fn registry(mut self, registry: AgentRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn router(mut self, router: Router) -> Self {
        self.router = Some(router);
        self
    }

    pub fn skills(mut self, skills: Arc<SkillRegistry>) -> Self {
        self.skills = Some(skills);
        self
    }

    pub fn storage(mut self, storage: Arc<dyn StorageBackend>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn cost_tracker(mut self, tracker: Arc<CostTracker>) -> Self {
        self.cost_tracker = Some(tracker);
        self
    }

    pub fn memory(mut self, memory: Arc<MemoryStore>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn hooks(mut self, hooks: Arc<RunnerHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn build(self) -> AgentRunner {
        AgentRunner {
            registry: self.registry,
            router: self.router.unwrap_or_else(Router::with_default_policy),
            skills: self.skills.unwrap_or_else(|| Arc::new(SkillRegistry::new())),
            storage: self.storage,
            cost_tracker: self.cost_tracker,
            memory: self.memory,
            hooks: self.hooks,
            retry: self.retry.unwrap_or_default(),
        }
    }
}

impl AgentRunner {
    pub fn builder() -> AgentRunnerBuilder {
        AgentRunnerBuilder::default()
    }

    pub fn skills(&self) -> &SkillRegistry {
        &self.skills
    }

    pub fn hooks(&self) -> Option<&Arc<RunnerHooks>> {
        self.hooks.as_ref()
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    fn mint_run_id() -> String {
        let mut id = Uuid::new_v4().simple().to_string();
        id.truncate(8);
        format!("mag-{id}")
    }

    /// Invoke a main agent. Mints a run id unless the ambient context
    /// already carries one, obtains a routing plan, persists the run
    /// lifecycle, captures session memory and artifacts, and returns the
    /// agent's output.
    pub async fn invoke_mag(
        &self,
        slug: &str,
        payload: Value,
        context: Option<ExecutionContext>,
    ) -> Result<Value, RunnerError> {
        let (descriptor, agent) = self
            .registry
            .resolve_main(slug)
            .ok_or_else(|| RunnerError::AgentNotFound(slug.to_string()))?;

        let mut context = context.unwrap_or_default();
        let run_id = context.run_id.clone().unwrap_or_else(Self::mint_run_id);
        context.run_id = Some(run_id.clone());
        context.agent_slug = Some(slug.to_string());

        let obs = RunLogger::new(&run_id, slug);

        if let Some(plan) = self.router.get_plan(descriptor.route_task_type(), None) {
            obs.log(
                "plan",
                json!({
                    "task_type": plan.task_type,
                    "provider": plan.provider,
                    "model": plan.model,
                    "use_batch": plan.use_batch,
                    "use_cache": plan.use_cache,
                }),
            );
        }

        if let Some(storage) = &self.storage {
            storage.create_run(&run_id, slug, RunStatus::Running).await?;
        }
        self.emit_run_event(&run_id, slug, "run.started", json!({"agent_slug": slug}))
            .await;
        self.capture_memory(slug, &run_id, "input", json!({"payload": payload.clone()}))
            .await;

        let started = Instant::now();
        match agent.run(payload, &context, self, &obs).await {
            Ok(output) => {
                self.capture_memory(slug, &run_id, "output", json!({"output": output.clone()}))
                    .await;
                let duration_ms = started.elapsed().as_millis() as u64;
                obs.metric("duration_ms", duration_ms);
                self.finish_run(&run_id, RunStatus::Succeeded, &obs).await?;
                self.emit_run_event(
                    &run_id,
                    slug,
                    "run.completed",
                    json!({"duration_ms": duration_ms}),
                )
                .await;
                self.write_summary(&obs, &run_id, slug, "succeeded", duration_ms);
                Ok(output)
            }
            Err(err) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                obs.log(
                    "error",
                    json!({"error": err.to_string(), "duration_ms": duration_ms}),
                );
                obs.metric("duration_ms", duration_ms);
                self.finish_run(&run_id, RunStatus::Failed, &obs).await?;
                self.emit_run_event(
                    &run_id,
                    slug,
                    "run.failed",
                    json!({"error": err.to_string(), "duration_ms": duration_ms}),
                )
                .await;
                self.write_summary(&obs, &run_id, slug, "failed", duration_ms);
                if err.downcast_ref::<NoSuccessfulTasks>().is_some() {
                    return Err(RunnerError::NoSuccessfulTasks(run_id));
                }
                Err(RunnerError::Execution(err.to_string()))
            }
        }
    }

    async fn emit_run_event(&self, run_id: &str, slug: &str, event_type: &str, payload: Value) {
        let Some(storage) = &self.storage else { return };
        let payload = match payload {
            Value::Object(map) => map.into_iter().collect(),
            other => BTreeMap::from([("payload".to_string(), other)]),
        };
        let event = magsag_types::EventRecord {
            run_id: run_id.to_string(),
            agent_slug: slug.to_string(),
            event_type: event_type.to_string(),
            timestamp: Utc::now(),
            level: None,
            message: Some(event_type.to_string()),
            payload,
        };
        if let Err(err) = storage.append_event(event).await {
            tracing::warn!(run = run_id, event_type, "cannot persist run event: {err}");
        }
    }

    /// Invoke a sub-agent with retries. Exhausted retries (and resolution
    /// failures) return a failure result instead of an error, preserving
    /// partial-result aggregation in the enclosing MAG.
    pub async fn invoke_sag(&self, delegation: Delegation) -> DelegationResult {
        let Some((_, agent)) = self.registry.resolve_sub(&delegation.target_agent) else {
            return DelegationResult::failure(
                delegation.task_id,
                format!("agent not found: {}", delegation.target_agent),
            );
        };

        let started = Instant::now();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match agent.execute(&delegation).await {
                Ok(output) => {
                    let mut metrics = BTreeMap::new();
                    metrics.insert("attempts".to_string(), json!(attempt));
                    metrics.insert(
                        "latency_ms".to_string(),
                        json!(started.elapsed().as_millis() as u64),
                    );
                    return DelegationResult {
                        task_id: delegation.task_id,
                        status: DelegationStatus::Success,
                        output,
                        metrics,
                        error: None,
                    };
                }
                Err(err) if err.is_transient() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    tracing::warn!(
                        task = %delegation.task_id,
                        target = %delegation.target_agent,
                        attempt,
                        "transient sub-agent failure, retrying in {delay:?}: {err}"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    let mut result =
                        DelegationResult::failure(delegation.task_id, err.to_string());
                    result.metrics.insert("attempts".to_string(), json!(attempt));
                    result.metrics.insert(
                        "latency_ms".to_string(),
                        json!(started.elapsed().as_millis() as u64),
                    );
                    return result;
                }
            }
        }
    }

    /// Record an LLM cost sample attributed to the run and agent in the
    /// context. No-op when no tracker is attached.
    pub fn record_cost(
        &self,
        context: &ExecutionContext,
        model: &str,
        input_tokens: u64,
        output_tokens: u64,
        cost_usd: f64,
    ) {
        let Some(tracker) = &self.cost_tracker else {
            return;
        };
        let record = CostRecord {
            timestamp: Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
            model: model.to_string(),
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
            cost_usd,
            run_id: context.run_id.clone(),
            step: context.step_id.clone(),
            agent: context.agent_slug.clone(),
            metadata: BTreeMap::new(),
        };
        if let Err(err) = tracker.record_cost(&record) {
            tracing::warn!(model, "cannot record cost sample: {err}");
        }
    }

    async fn capture_memory(&self, slug: &str, run_id: &str, key: &str, value: Value) {
        let Some(memory) = &self.memory else { return };
        let entry = match MemoryEntry::new(
            MemoryScope::Session,
            slug,
            key,
            value,
            Some(run_id.to_string()),
        ) {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!(run = run_id, "invalid memory entry: {err}");
                return;
            }
        };
        if let Err(err) = memory.save(&entry).await {
            tracing::warn!(run = run_id, key, "cannot capture memory: {err}");
        }
    }

    async fn finish_run(
        &self,
        run_id: &str,
        status: RunStatus,
        obs: &RunLogger,
    ) -> Result<(), RunnerError> {
        if let Some(storage) = &self.storage {
            storage
                .update_run(
                    run_id,
                    UpdateRun {
                        status: Some(status),
                        ended_at: Some(Utc::now()),
                        metrics: Some(obs.metrics()),
                    },
                )
                .await?;
        }
        Ok(())
    }

    fn write_summary(
        &self,
        obs: &RunLogger,
        run_id: &str,
        slug: &str,
        status: &str,
        duration_ms: u64,
    ) {
        obs.write_summary(&json!({
            "run_id": run_id,
            "agent_slug": slug,
            "status": status,
            "duration_ms": duration_ms,
            "metrics": obs.metrics(),
            "deterministic": determinism::get_deterministic_mode(),
            "environment_snapshot": determinism::snapshot_environment(),
        }));
    }
}

#[async_trait]
impl MagInvoker for AgentRunner {
    async fn invoke_mag(
        &self,
        slug: &str,
        payload: Value,
        context: ExecutionContext,
    ) -> anyhow::Result<Value> {
        AgentRunner::invoke_mag(self, slug, payload, Some(context))
            .await
            .map_err(Into::into)
    }
}
