//! Governance hooks around tool execution: permission checks, approval
//! waits, and audit events. Storage is acquired lazily and failure to
//! acquire degrades to log-only; a broken audit path never blocks a tool.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use magsag_governance::{ApprovalGate, GateError};
use magsag_storage::StorageBackend;
use magsag_types::{mask_tool_args, EventRecord, ExecutionContext, ToolPermission};

/// Lazy source of the shared storage backend. Lets deployments defer
/// opening the store until the first audited tool call and lets tests
/// inject failing acquisitions.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    async fn acquire(&self) -> anyhow::Result<Arc<dyn StorageBackend>>;
}

/// Provider returning an already-open backend.
pub struct ReadyStorage(pub Arc<dyn StorageBackend>);

#[async_trait]
impl StorageProvider for ReadyStorage {
    async fn acquire(&self) -> anyhow::Result<Arc<dyn StorageBackend>> {
        Ok(Arc::clone(&self.0))
    }
}

struct StorageSlot {
    backend: Option<Arc<dyn StorageBackend>>,
    disabled: bool,
}

pub struct RunnerHooks {
    gate: Option<Arc<ApprovalGate>>,
    enable_approvals: bool,
    provider: Option<Arc<dyn StorageProvider>>,
    slot: Mutex<StorageSlot>,
}

impl RunnerHooks {
    pub fn new(gate: Option<Arc<ApprovalGate>>, enable_approvals: bool) -> Self {
        Self {
            gate,
            enable_approvals,
            provider: None,
            slot: Mutex::new(StorageSlot {
                backend: None,
                disabled: false,
            }),
        }
    }

    pub fn with_storage_provider(mut self, provider: Arc<dyn StorageProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_storage(self, storage: Arc<dyn StorageBackend>) -> Self {
        self.with_storage_provider(Arc::new(ReadyStorage(storage)))
    }

    async fn storage(&self) -> Option<Arc<dyn StorageBackend>> {
        let provider = self.provider.as_ref()?;
        let mut slot = self.slot.lock().await;
        if slot.disabled {
            return None;
        }
        if let Some(backend) = &slot.backend {
            return Some(Arc::clone(backend));
        }
        match provider.acquire().await {
            Ok(backend) => {
                slot.backend = Some(Arc::clone(&backend));
                Some(backend)
            }
            Err(err) => {
                tracing::warn!("runner hooks could not acquire storage backend: {err}");
                slot.disabled = true;
                None
            }
        }
    }

    async fn record_event(
        &self,
        context: &ExecutionContext,
        event_type: &str,
        message: String,
        payload: BTreeMap<String, Value>,
        level: Option<&str>,
    ) {
        let Some(run_id) = context.run_id.clone() else {
            return;
        };
        let Some(storage) = self.storage().await else {
            return;
        };
        let event = EventRecord {
            run_id,
            agent_slug: context
                .agent_slug
                .clone()
                .unwrap_or_else(|| "unknown".to_string()),
            event_type: event_type.to_string(),
            timestamp: Utc::now(),
            level: level.map(str::to_string),
            message: Some(message),
            payload,
        };
        if let Err(err) = storage.append_event(event).await {
            tracing::warn!(event_type, "failed to record runner hook event: {err}");
        }
    }

    fn policy_context(
        context: &ExecutionContext,
        tool_args: &BTreeMap<String, Value>,
    ) -> BTreeMap<String, Value> {
        let mut map = BTreeMap::new();
        if let Value::Object(fields) = context.to_value() {
            for (key, value) in fields {
                map.insert(key, value);
            }
        }
        for (key, value) in &context.extra {
            map.insert(key.clone(), value.clone());
        }
        map.insert(
            "tool_args".to_string(),
            Value::Object(tool_args.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
        );
        map
    }

    /// Permission check and approval gating before a tool runs.
    pub async fn pre_tool_execution(
        &self,
        tool_name: &str,
        tool_args: &BTreeMap<String, Value>,
        context: &ExecutionContext,
    ) -> Result<(), GateError> {
        if !self.enable_approvals {
            tracing::debug!(tool = tool_name, "approvals disabled, skipping check");
            return Ok(());
        }
        let Some(gate) = &self.gate else {
            tracing::warn!(tool = tool_name, "approval gate not configured, skipping check");
            return Ok(());
        };

        let policy_ctx = Self::policy_context(context, tool_args);
        let permission = gate.evaluate(tool_name, &policy_ctx);

        self.record_event(
            context,
            "tool.permission.checked",
            format!("Permission evaluated for {tool_name}"),
            BTreeMap::from([
                ("tool".to_string(), json!(tool_name)),
                ("permission".to_string(), json!(permission.as_str())),
                ("context".to_string(), context.to_value()),
            ]),
            None,
        )
        .await;

        match permission {
            ToolPermission::Always => Ok(()),
            ToolPermission::Never => {
                self.record_event(
                    context,
                    "tool.permission.denied",
                    format!("Tool {tool_name} execution blocked by policy"),
                    BTreeMap::from([
                        ("tool".to_string(), json!(tool_name)),
                        ("permission".to_string(), json!(permission.as_str())),
                    ]),
                    Some("error"),
                )
                .await;
                Err(GateError::Denied(format!(
                    "tool {tool_name} is not allowed by policy"
                )))
            }
            ToolPermission::RequireApproval => {
                let metadata = match context.extra.get("approval_metadata") {
                    Some(Value::Object(map)) => map
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect(),
                    Some(other) => BTreeMap::from([("value".to_string(), other.clone())]),
                    None => BTreeMap::new(),
                };
                let ticket = gate
                    .create_ticket(
                        context.run_id.as_deref().unwrap_or("unknown"),
                        context.agent_slug.as_deref().unwrap_or("unknown"),
                        tool_name,
                        tool_args.clone(),
                        context.step_id.clone(),
                        None,
                        metadata,
                    )
                    .await?;

                self.record_event(
                    context,
                    "tool.approval.requested",
                    format!("Approval requested for {tool_name}"),
                    BTreeMap::from([
                        ("tool".to_string(), json!(tool_name)),
                        ("ticket_id".to_string(), json!(ticket.ticket_id)),
                        ("masked_args".to_string(), json!(mask_tool_args(tool_args))),
                    ]),
                    None,
                )
                .await;

                match gate
                    .wait_for_decision(&ticket, None, &CancellationToken::new())
                    .await
                {
                    Ok(decision) => {
                        self.record_event(
                            context,
                            "tool.approval.granted",
                            format!("Approval granted for {tool_name}"),
                            BTreeMap::from([
                                ("tool".to_string(), json!(tool_name)),
                                ("ticket_id".to_string(), json!(decision.ticket_id)),
                                ("resolved_by".to_string(), json!(decision.resolved_by)),
                                (
                                    "decision_reason".to_string(),
                                    json!(decision.decision_reason),
                                ),
                            ]),
                            None,
                        )
                        .await;
                        Ok(())
                    }
                    Err(err @ GateError::Timeout(_)) => {
                        self.record_event(
                            context,
                            "tool.approval.timeout",
                            format!("Approval timed out for {tool_name}"),
                            BTreeMap::from([
                                ("tool".to_string(), json!(tool_name)),
                                ("ticket_id".to_string(), json!(ticket.ticket_id)),
                                ("reason".to_string(), json!(err.to_string())),
                            ]),
                            Some("error"),
                        )
                        .await;
                        Err(err)
                    }
                    Err(err @ GateError::Denied(_)) => {
                        self.record_event(
                            context,
                            "tool.approval.denied",
                            format!("Approval denied for {tool_name}"),
                            BTreeMap::from([
                                ("tool".to_string(), json!(tool_name)),
                                ("ticket_id".to_string(), json!(ticket.ticket_id)),
                                ("reason".to_string(), json!(err.to_string())),
                            ]),
                            Some("error"),
                        )
                        .await;
                        Err(err)
                    }
                    Err(err) => Err(err),
                }
            }
        }
    }

    /// Audit trail after a successful tool run.
    pub async fn post_tool_execution(
        &self,
        tool_name: &str,
        tool_args: &BTreeMap<String, Value>,
        result: &Value,
        context: &ExecutionContext,
    ) {
        self.record_event(
            context,
            "tool.executed",
            format!("Tool {tool_name} executed successfully"),
            BTreeMap::from([
                ("tool".to_string(), json!(tool_name)),
                ("masked_args".to_string(), json!(mask_tool_args(tool_args))),
                ("result".to_string(), result.clone()),
            ]),
            None,
        )
        .await;
    }

    /// Audit trail for a failed tool run.
    pub async fn on_tool_error(
        &self,
        tool_name: &str,
        tool_args: &BTreeMap<String, Value>,
        error_type: &str,
        error_message: &str,
        context: &ExecutionContext,
    ) {
        tracing::error!(tool = tool_name, error_type, "tool execution error: {error_message}");
        self.record_event(
            context,
            "tool.error",
            format!("Tool {tool_name} raised {error_type}"),
            BTreeMap::from([
                ("tool".to_string(), json!(tool_name)),
                ("masked_args".to_string(), json!(mask_tool_args(tool_args))),
                ("error_type".to_string(), json!(error_type)),
                ("error_message".to_string(), json!(error_message)),
            ]),
            Some("error"),
        )
        .await;
    }
}

/// Wrap a tool invocation with the full hook pipeline.
pub async fn execute_with_hooks<F, Fut>(
    tool_fn: F,
    tool_name: &str,
    tool_args: BTreeMap<String, Value>,
    hooks: &RunnerHooks,
    context: &ExecutionContext,
) -> anyhow::Result<Value>
where
    F: FnOnce(BTreeMap<String, Value>) -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<Value>>,
{
    if let Err(err) = hooks.pre_tool_execution(tool_name, &tool_args, context).await {
        hooks
            .on_tool_error(tool_name, &tool_args, gate_error_type(&err), &err.to_string(), context)
            .await;
        return Err(err.into());
    }

    match tool_fn(tool_args.clone()).await {
        Ok(result) => {
            hooks
                .post_tool_execution(tool_name, &tool_args, &result, context)
                .await;
            Ok(result)
        }
        Err(err) => {
            hooks
                .on_tool_error(tool_name, &tool_args, "ToolExecutionError", &err.to_string(), context)
                .await;
            Err(err)
        }
    }
}

fn gate_error_type(err: &GateError) -> &'static str {
    match err {
        GateError::Denied(_) => "ApprovalDenied",
        GateError::Timeout(_) => "ApprovalTimeout",
        GateError::Cancelled => "ApprovalCancelled",
        GateError::NotFound(_) => "TicketNotFound",
        GateError::AlreadyResolved { .. } => "TicketAlreadyResolved",
        GateError::Storage(_) => "StorageError",
        GateError::Tool(_) => "ToolExecutionError",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingProvider;

    #[async_trait]
    impl StorageProvider for FailingProvider {
        async fn acquire(&self) -> anyhow::Result<Arc<dyn StorageBackend>> {
            anyhow::bail!("backend offline")
        }
    }

    #[tokio::test]
    async fn disabled_approvals_skip_everything() {
        let hooks = RunnerHooks::new(None, false);
        let context = ExecutionContext::for_run("run-1", "agent-a");
        assert!(hooks
            .pre_tool_execution("anything", &BTreeMap::new(), &context)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn storage_acquisition_failure_degrades_silently() {
        let hooks =
            RunnerHooks::new(None, false).with_storage_provider(Arc::new(FailingProvider));
        let context = ExecutionContext::for_run("run-1", "agent-a");

        // Event recording must not propagate the acquisition failure.
        hooks
            .post_tool_execution("tool", &BTreeMap::new(), &Value::Null, &context)
            .await;
        hooks
            .on_tool_error("tool", &BTreeMap::new(), "Boom", "it broke", &context)
            .await;

        // The provider is only tried once.
        assert!(hooks.slot.lock().await.disabled);
    }
}
