//! Handoff-as-a-tool: delegation to another agent or platform under the
//! same governance as any tool call.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use magsag_governance::{ApprovalGate, GateError, PermissionEvaluator};
use magsag_storage::{StorageBackend, StorageError};
use magsag_types::{
    EventRecord, ExecutionContext, HandoffRequest, HandoffStatus, Platform, ToolPermission,
};

#[derive(Debug, Error)]
pub enum HandoffError {
    #[error("handoff rejected: {0}")]
    Rejected(String),

    #[error("unsupported platform: {0}")]
    UnsupportedPlatform(String),

    #[error(transparent)]
    Gate(#[from] GateError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("handoff execution failed: {0}")]
    Adapter(String),
}

/// Platform-specific delegation executor. Registration is explicit; the
/// first adapter claiming a platform wins.
#[async_trait]
pub trait HandoffAdapter: Send + Sync {
    fn supports(&self, platform: &Platform) -> bool;

    async fn execute(&self, request: &HandoffRequest) -> anyhow::Result<Value>;

    fn tool_schema(&self) -> Value;
}

/// Bridge back into the agent runner without a circular crate dependency:
/// the runner implements this and hands itself to the native adapter.
#[async_trait]
pub trait MagInvoker: Send + Sync {
    async fn invoke_mag(
        &self,
        slug: &str,
        payload: Value,
        context: ExecutionContext,
    ) -> anyhow::Result<Value>;
}

/// Native adapter: delegates to another MAGSAG agent through the runner.
pub struct NativeHandoffAdapter {
    invoker: Arc<dyn MagInvoker>,
}

impl NativeHandoffAdapter {
    pub fn new(invoker: Arc<dyn MagInvoker>) -> Self {
        Self { invoker }
    }
}

#[async_trait]
impl HandoffAdapter for NativeHandoffAdapter {
    fn supports(&self, platform: &Platform) -> bool {
        *platform == Platform::Magsag
    }

    async fn execute(&self, request: &HandoffRequest) -> anyhow::Result<Value> {
        let parent_run_id = request
            .metadata
            .get("run_id")
            .and_then(Value::as_str)
            .map(str::to_string);
        let context = ExecutionContext {
            parent_run_id,
            handoff_id: Some(request.handoff_id.clone()),
            extra: request.context.clone(),
            ..ExecutionContext::default()
        };
        let payload = request.payload.clone().unwrap_or_else(|| json!({}));
        let output = self
            .invoker
            .invoke_mag(&request.target_agent, payload, context)
            .await?;
        Ok(json!({
            "status": "completed",
            "target_agent": request.target_agent,
            "handoff_id": request.handoff_id,
            "output": output,
        }))
    }

    fn tool_schema(&self) -> Value {
        json!({
            "name": "handoff",
            "description": "Delegate work to another agent or system",
            "parameters": {
                "type": "object",
                "properties": {
                    "target_agent": {
                        "type": "string",
                        "description": "Agent slug or identifier to delegate to",
                    },
                    "task": {
                        "type": "string",
                        "description": "Task description for the target agent",
                    },
                    "context": {
                        "type": "object",
                        "description": "Additional context to pass to the target agent",
                    },
                },
                "required": ["target_agent", "task"],
            },
        })
    }
}

pub struct HandoffTool {
    evaluator: Option<Arc<PermissionEvaluator>>,
    gate: Option<Arc<ApprovalGate>>,
    storage: Option<Arc<dyn StorageBackend>>,
    adapters: Vec<Arc<dyn HandoffAdapter>>,
    requests: RwLock<HashMap<String, HandoffRequest>>,
}

impl HandoffTool {
    pub fn new() -> Self {
        Self {
            evaluator: None,
            gate: None,
            storage: None,
            adapters: Vec::new(),
            requests: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_evaluator(mut self, evaluator: Arc<PermissionEvaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    pub fn with_gate(mut self, gate: Arc<ApprovalGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn with_storage(mut self, storage: Arc<dyn StorageBackend>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn register_adapter(mut self, adapter: Arc<dyn HandoffAdapter>) -> Self {
        self.adapters.push(adapter);
        self
    }

    pub fn adapter_for(&self, platform: &Platform) -> Option<Arc<dyn HandoffAdapter>> {
        self.adapters
            .iter()
            .find(|adapter| adapter.supports(platform))
            .cloned()
    }

    pub fn tool_schema(&self, platform: &Platform) -> Result<Value, HandoffError> {
        self.adapter_for(platform)
            .map(|adapter| adapter.tool_schema())
            .ok_or_else(|| HandoffError::UnsupportedPlatform(platform.to_string()))
    }

    /// Execute a governed handoff. The request is tracked through every
    /// outcome, including policy rejections.
    #[allow(clippy::too_many_arguments)]
    pub async fn handoff(
        &self,
        source_agent: &str,
        target_agent: &str,
        task: &str,
        payload: Option<Value>,
        context: BTreeMap<String, Value>,
        platform: Platform,
        run_id: Option<&str>,
    ) -> Result<Value, HandoffError> {
        let mut request = HandoffRequest {
            handoff_id: Uuid::new_v4().to_string(),
            source_agent: source_agent.to_string(),
            target_agent: target_agent.to_string(),
            task: task.to_string(),
            payload,
            context,
            created_at: Utc::now(),
            status: HandoffStatus::Pending,
            result: None,
            error: None,
            metadata: BTreeMap::from([
                ("platform".to_string(), json!(platform.as_str())),
                ("run_id".to_string(), json!(run_id)),
            ]),
        };

        if let Err(err) = self.enforce_policy(&request, &platform, run_id).await {
            request.status = HandoffStatus::Rejected;
            request.error = Some(err.to_string());
            self.track(request).await;
            return Err(err);
        }

        let Some(adapter) = self.adapter_for(&platform) else {
            request.status = HandoffStatus::Failed;
            request.error = Some(format!("unsupported platform: {platform}"));
            self.track(request).await;
            return Err(HandoffError::UnsupportedPlatform(platform.to_string()));
        };

        self.emit(run_id, source_agent, "handoff.requested", &request)
            .await;

        request.status = HandoffStatus::InProgress;
        self.track(request.clone()).await;

        match adapter.execute(&request).await {
            Ok(result) => {
                request.status = HandoffStatus::Completed;
                request.result = Some(result.clone());
                self.emit(run_id, source_agent, "handoff.completed", &request)
                    .await;
                self.track(request.clone()).await;
                tracing::info!(
                    handoff = %request.handoff_id,
                    source = source_agent,
                    target = target_agent,
                    "handoff completed"
                );
                Ok(json!({
                    "handoff_id": request.handoff_id,
                    "status": "completed",
                    "result": result,
                }))
            }
            Err(err) => {
                request.status = HandoffStatus::Failed;
                request.error = Some(err.to_string());
                self.emit(run_id, source_agent, "handoff.failed", &request)
                    .await;
                self.track(request).await;
                tracing::error!(source = source_agent, target = target_agent, "handoff failed: {err}");
                Err(HandoffError::Adapter(err.to_string()))
            }
        }
    }

    async fn enforce_policy(
        &self,
        request: &HandoffRequest,
        platform: &Platform,
        run_id: Option<&str>,
    ) -> Result<(), HandoffError> {
        let Some(evaluator) = &self.evaluator else {
            return Ok(());
        };

        let context = BTreeMap::from([
            ("agent_slug".to_string(), json!(request.source_agent)),
            ("run_id".to_string(), json!(run_id)),
            ("target_agent".to_string(), json!(request.target_agent)),
            ("platform".to_string(), json!(platform.as_str())),
        ]);

        match evaluator.evaluate("handoff", &context) {
            ToolPermission::Always => Ok(()),
            ToolPermission::Never => Err(HandoffError::Rejected(format!(
                "handoff to {} not allowed by policy",
                request.target_agent
            ))),
            ToolPermission::RequireApproval => {
                let Some(gate) = &self.gate else {
                    return Err(HandoffError::Rejected(format!(
                        "handoff to {} requires approval but no approval gate is configured",
                        request.target_agent
                    )));
                };
                let ticket = gate
                    .create_ticket(
                        run_id.unwrap_or("unknown"),
                        &request.source_agent,
                        "handoff",
                        BTreeMap::from([
                            ("target_agent".to_string(), json!(request.target_agent)),
                            ("task".to_string(), json!(request.task)),
                            ("platform".to_string(), json!(platform.as_str())),
                        ]),
                        None,
                        None,
                        BTreeMap::new(),
                    )
                    .await?;
                tracing::info!(
                    target = %request.target_agent,
                    ticket = %ticket.ticket_id,
                    "handoff requires approval"
                );
                gate.wait_for_decision(&ticket, None, &CancellationToken::new())
                    .await?;
                Ok(())
            }
        }
    }

    async fn emit(
        &self,
        run_id: Option<&str>,
        agent_slug: &str,
        event_type: &str,
        request: &HandoffRequest,
    ) {
        let Some(storage) = &self.storage else { return };
        let Some(run_id) = run_id else { return };
        let event = EventRecord {
            run_id: run_id.to_string(),
            agent_slug: agent_slug.to_string(),
            event_type: event_type.to_string(),
            timestamp: Utc::now(),
            level: None,
            message: Some(format!(
                "{} {} -> {}",
                event_type, request.source_agent, request.target_agent
            )),
            payload: BTreeMap::from([
                ("handoff_id".to_string(), json!(request.handoff_id)),
                ("target_agent".to_string(), json!(request.target_agent)),
                ("status".to_string(), json!(request.status)),
            ]),
        };
        if let Err(err) = storage.append_event(event).await {
            tracing::warn!("cannot persist handoff event: {err}");
        }
    }

    async fn track(&self, request: HandoffRequest) {
        self.requests
            .write()
            .await
            .insert(request.handoff_id.clone(), request);
    }

    pub async fn get_handoff(&self, handoff_id: &str) -> Option<HandoffRequest> {
        self.requests.read().await.get(handoff_id).cloned()
    }

    /// Tracked requests, newest first.
    pub async fn list_handoffs(
        &self,
        source_agent: Option<&str>,
        status: Option<HandoffStatus>,
    ) -> Vec<HandoffRequest> {
        let mut requests: Vec<HandoffRequest> = self
            .requests
            .read()
            .await
            .values()
            .filter(|r| source_agent.map(|s| r.source_agent == s).unwrap_or(true))
            .filter(|r| status.map(|s| r.status == s).unwrap_or(true))
            .cloned()
            .collect();
        requests.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        requests
    }
}

impl Default for HandoffTool {
    fn default() -> Self {
        Self::new()
    }
}
