//! Approval gate: mints tickets for gated tool calls, waits for decisions,
//! and fans ticket lifecycle events out to listeners.
//!
//! Ticket state machine: `pending` moves to exactly one of `approved`,
//! `denied`, or `expired`; all three are terminal and any further
//! transition fails with "ticket already <status>".

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use magsag_observability::EventBus;
use magsag_storage::StorageBackend;
use magsag_types::{ApprovalTicket, RuntimeEvent, TicketStatus, ToolPermission};

use crate::error::GateError;
use crate::evaluator::PermissionEvaluator;

const DEFAULT_TIMEOUT_MINUTES: i64 = 30;
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

pub struct ApprovalGate {
    evaluator: Arc<PermissionEvaluator>,
    storage: Option<Arc<dyn StorageBackend>>,
    event_bus: EventBus,
    tickets: RwLock<HashMap<String, ApprovalTicket>>,
    default_timeout_minutes: i64,
}

impl ApprovalGate {
    pub fn new(evaluator: Arc<PermissionEvaluator>) -> Self {
        Self {
            evaluator,
            storage: None,
            event_bus: EventBus::new(),
            tickets: RwLock::new(HashMap::new()),
            default_timeout_minutes: DEFAULT_TIMEOUT_MINUTES,
        }
    }

    pub fn with_storage(mut self, storage: Arc<dyn StorageBackend>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_timeout_minutes(mut self, minutes: i64) -> Self {
        self.default_timeout_minutes = minutes;
        self
    }

    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = event_bus;
        self
    }

    /// Listener subscription. Per ticket the stream is one
    /// `approval.required` followed by zero or more `approval.updated`,
    /// ending at a terminal status. Payloads carry the masked-args view.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<RuntimeEvent> {
        self.event_bus.subscribe()
    }

    pub fn evaluate(&self, tool_name: &str, context: &BTreeMap<String, Value>) -> ToolPermission {
        let permission = self.evaluator.evaluate(tool_name, context);
        tracing::info!(
            tool = tool_name,
            permission = %permission,
            agent = context.get("agent_slug").and_then(|v| v.as_str()).unwrap_or(""),
            run = context.get("run_id").and_then(|v| v.as_str()).unwrap_or(""),
            "tool permission evaluated"
        );
        permission
    }

    pub async fn create_ticket(
        &self,
        run_id: &str,
        agent_slug: &str,
        tool_name: &str,
        tool_args: BTreeMap<String, Value>,
        step_id: Option<String>,
        timeout_minutes: Option<i64>,
        metadata: BTreeMap<String, Value>,
    ) -> Result<ApprovalTicket, GateError> {
        let timeout = timeout_minutes.unwrap_or(self.default_timeout_minutes);
        let now = Utc::now();
        let ticket = ApprovalTicket::new(
            Uuid::new_v4().to_string(),
            run_id,
            agent_slug,
            tool_name,
            tool_args,
            step_id,
            now,
            now + chrono::Duration::minutes(timeout),
            metadata,
        );

        self.tickets
            .write()
            .await
            .insert(ticket.ticket_id.clone(), ticket.clone());
        if let Some(storage) = &self.storage {
            storage.create_approval_ticket(&ticket).await?;
        }

        self.event_bus
            .publish(RuntimeEvent::new("approval.required", ticket.public_view()));
        tracing::info!(
            ticket = %ticket.ticket_id,
            tool = tool_name,
            expires_in_minutes = timeout,
            "approval ticket created"
        );
        Ok(ticket)
    }

    pub async fn get_ticket(&self, ticket_id: &str) -> Result<Option<ApprovalTicket>, GateError> {
        if let Some(ticket) = self.tickets.read().await.get(ticket_id) {
            return Ok(Some(ticket.clone()));
        }
        if let Some(storage) = &self.storage {
            return Ok(storage.get_approval_ticket(ticket_id).await?);
        }
        Ok(None)
    }

    pub async fn approve_ticket(
        &self,
        ticket_id: &str,
        approved_by: &str,
        response: Option<BTreeMap<String, Value>>,
    ) -> Result<ApprovalTicket, GateError> {
        self.resolve(ticket_id, TicketStatus::Approved, approved_by, None, response)
            .await
    }

    pub async fn deny_ticket(
        &self,
        ticket_id: &str,
        denied_by: &str,
        reason: Option<&str>,
    ) -> Result<ApprovalTicket, GateError> {
        self.resolve(
            ticket_id,
            TicketStatus::Denied,
            denied_by,
            reason,
            reason.map(|r| {
                let mut map = BTreeMap::new();
                map.insert("reason".to_string(), Value::String(r.to_string()));
                map
            }),
        )
        .await
    }

    async fn resolve(
        &self,
        ticket_id: &str,
        status: TicketStatus,
        resolved_by: &str,
        reason: Option<&str>,
        response: Option<BTreeMap<String, Value>>,
    ) -> Result<ApprovalTicket, GateError> {
        let updated = {
            let mut tickets = self.tickets.write().await;
            let ticket = tickets
                .get_mut(ticket_id)
                .ok_or_else(|| GateError::NotFound(ticket_id.to_string()))?;
            if ticket.status.is_terminal() {
                return Err(GateError::AlreadyResolved {
                    ticket_id: ticket_id.to_string(),
                    status: ticket.status,
                });
            }
            ticket.status = status;
            ticket.resolved_at = Some(Utc::now());
            ticket.resolved_by = Some(resolved_by.to_string());
            ticket.decision_reason = reason.map(str::to_string);
            ticket.response = response;
            ticket.clone()
        };

        if let Some(storage) = &self.storage {
            storage.update_approval_ticket(&updated).await?;
        }
        self.event_bus
            .publish(RuntimeEvent::new("approval.updated", updated.public_view()));
        tracing::info!(ticket = ticket_id, status = %status, by = resolved_by, "ticket resolved");
        Ok(updated)
    }

    /// Transition a pending ticket to `expired`. Used by the waiter and the
    /// batch sweep; terminal tickets are left untouched.
    async fn expire(&self, ticket_id: &str) -> Option<ApprovalTicket> {
        let expired = {
            let mut tickets = self.tickets.write().await;
            let ticket = tickets.get_mut(ticket_id)?;
            if ticket.status.is_terminal() {
                return None;
            }
            ticket.status = TicketStatus::Expired;
            ticket.resolved_at = Some(Utc::now());
            ticket.clone()
        };
        if let Some(storage) = &self.storage {
            if let Err(err) = storage.update_approval_ticket(&expired).await {
                tracing::warn!(ticket = ticket_id, "cannot persist expiry: {err}");
            }
        }
        self.event_bus
            .publish(RuntimeEvent::new("approval.updated", expired.public_view()));
        Some(expired)
    }

    /// Expire every pending ticket whose deadline has passed; returns the
    /// count.
    pub async fn expire_old_tickets(&self) -> usize {
        let now = Utc::now();
        let stale: Vec<String> = self
            .tickets
            .read()
            .await
            .values()
            .filter(|t| t.status == TicketStatus::Pending && now >= t.expires_at)
            .map(|t| t.ticket_id.clone())
            .collect();
        let mut expired = 0;
        for ticket_id in stale {
            if self.expire(&ticket_id).await.is_some() {
                expired += 1;
            }
        }
        if expired > 0 {
            tracing::info!(count = expired, "expired approval tickets");
        }
        expired
    }

    /// Pending tickets, optionally filtered, oldest request first.
    pub async fn list_pending_tickets(
        &self,
        run_id: Option<&str>,
        agent_slug: Option<&str>,
    ) -> Vec<ApprovalTicket> {
        let mut pending: Vec<ApprovalTicket> = self
            .tickets
            .read()
            .await
            .values()
            .filter(|t| t.status == TicketStatus::Pending)
            .filter(|t| run_id.map(|id| t.run_id == id).unwrap_or(true))
            .filter(|t| agent_slug.map(|slug| t.agent_slug == slug).unwrap_or(true))
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.requested_at.cmp(&b.requested_at));
        pending
    }

    /// Suspend until the ticket is approved (returns it), denied
    /// (`GateError::Denied`), or past its deadline (`GateError::Timeout`
    /// after marking it expired). Cancelling through `cancel` returns
    /// `GateError::Cancelled` and leaves the ticket pending; it will expire
    /// on its own schedule.
    pub async fn wait_for_decision(
        &self,
        ticket: &ApprovalTicket,
        poll_interval: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<ApprovalTicket, GateError> {
        let interval = poll_interval.unwrap_or(DEFAULT_POLL_INTERVAL);
        tracing::info!(ticket = %ticket.ticket_id, "waiting for approval decision");

        loop {
            let current = self
                .get_ticket(&ticket.ticket_id)
                .await?
                .ok_or_else(|| GateError::NotFound(ticket.ticket_id.clone()))?;

            match current.status {
                TicketStatus::Approved => return Ok(current),
                TicketStatus::Denied => {
                    return Err(GateError::Denied(format!(
                        "approval denied for {}",
                        current.tool_name
                    )));
                }
                TicketStatus::Expired => {
                    return Err(GateError::Timeout(format!(
                        "approval request timed out for {}",
                        current.tool_name
                    )));
                }
                TicketStatus::Pending => {
                    if Utc::now() >= current.expires_at {
                        self.expire(&current.ticket_id).await;
                        return Err(GateError::Timeout(format!(
                            "approval request timed out for {}",
                            current.tool_name
                        )));
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(GateError::Cancelled),
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// Evaluate, gate, and run a tool in one call: `NEVER` denies, `ALWAYS`
    /// executes immediately, `REQUIRE_APPROVAL` mints a ticket and waits.
    pub async fn execute_with_approval<F, Fut>(
        &self,
        run_id: &str,
        agent_slug: &str,
        tool_name: &str,
        tool_args: BTreeMap<String, Value>,
        tool_fn: F,
        context: Option<BTreeMap<String, Value>>,
    ) -> Result<Value, GateError>
    where
        F: FnOnce(BTreeMap<String, Value>) -> Fut,
        Fut: Future<Output = anyhow::Result<Value>>,
    {
        let mut ctx = context.unwrap_or_default();
        ctx.insert("agent_slug".to_string(), Value::String(agent_slug.to_string()));
        ctx.insert("run_id".to_string(), Value::String(run_id.to_string()));
        ctx.insert("tool_name".to_string(), Value::String(tool_name.to_string()));
        ctx.insert(
            "tool_args".to_string(),
            Value::Object(tool_args.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
        );

        match self.evaluate(tool_name, &ctx) {
            ToolPermission::Never => Err(GateError::Denied(format!(
                "tool {tool_name} is not allowed by policy"
            ))),
            ToolPermission::Always => Ok(tool_fn(tool_args).await?),
            ToolPermission::RequireApproval => {
                let ticket = self
                    .create_ticket(
                        run_id,
                        agent_slug,
                        tool_name,
                        tool_args.clone(),
                        None,
                        None,
                        BTreeMap::new(),
                    )
                    .await?;
                self.wait_for_decision(&ticket, None, &CancellationToken::new())
                    .await?;
                tracing::info!(tool = tool_name, "executing after approval");
                Ok(tool_fn(tool_args).await?)
            }
        }
    }
}
