use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::Serialize;
use serde_json::Value;

use magsag_types::{ApprovalTicket, EventRecord, RunRecord, RunSnapshot, RunStatus, TicketStatus};

use crate::error::StorageError;

/// Partial update for a run row. Absent fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct UpdateRun {
    pub status: Option<RunStatus>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Merged key-by-key into the stored metrics mapping: provided keys
    /// overwrite, absent keys survive. The mapping is never replaced
    /// wholesale.
    pub metrics: Option<BTreeMap<String, Value>>,
}

#[derive(Debug, Clone, Default)]
pub struct RunListFilter {
    pub agent_slug: Option<String>,
    pub status: Option<RunStatus>,
    pub limit: usize,
}

#[derive(Debug, Clone, Default)]
pub struct TicketListFilter {
    pub run_id: Option<String>,
    pub agent_slug: Option<String>,
    pub status: Option<TicketStatus>,
}

/// Outcome of a retention sweep.
#[derive(Debug, Clone, Serialize)]
pub struct VacuumReport {
    pub dry_run: bool,
    /// RFC 3339 cutoff; runs started before it are (or would be) deleted.
    pub cutoff: String,
    pub runs_to_delete: u64,
    pub runs_deleted: u64,
}

/// Async contract every storage implementation satisfies. Safe for
/// concurrent readers and writers; all datetimes are UTC.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Idempotent under a unique `run_id`: re-creating an existing run is a
    /// no-op.
    async fn create_run(
        &self,
        run_id: &str,
        agent_slug: &str,
        status: RunStatus,
    ) -> Result<(), StorageError>;

    /// Partial update. Fails with `NotFound` for unknown runs.
    async fn update_run(&self, run_id: &str, update: UpdateRun) -> Result<(), StorageError>;

    async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>, StorageError>;

    /// Most recent first.
    async fn list_runs(&self, filter: RunListFilter) -> Result<Vec<RunRecord>, StorageError>;

    /// Append-only. Unknown runs are lazily created rather than failing
    /// silently, so snapshot-initiated runs still get an event stream.
    async fn append_event(&self, event: EventRecord) -> Result<(), StorageError>;

    /// Events in insertion order.
    async fn get_events(
        &self,
        run_id: &str,
    ) -> Result<BoxStream<'static, EventRecord>, StorageError>;

    /// Full-text search over event messages. Empty when the FTS index is
    /// unavailable.
    async fn search_text(&self, query: &str, limit: usize)
        -> Result<Vec<EventRecord>, StorageError>;

    async fn create_approval_ticket(&self, ticket: &ApprovalTicket) -> Result<(), StorageError>;

    /// Fails with `NotFound` when the ticket row does not exist.
    async fn update_approval_ticket(&self, ticket: &ApprovalTicket) -> Result<(), StorageError>;

    async fn get_approval_ticket(
        &self,
        ticket_id: &str,
    ) -> Result<Option<ApprovalTicket>, StorageError>;

    /// Oldest request first.
    async fn list_approval_tickets(
        &self,
        filter: TicketListFilter,
    ) -> Result<Vec<ApprovalTicket>, StorageError>;

    /// Idempotent by `(run_id, step_id)`: an existing pair keeps its
    /// original `snapshot_id` and `created_at` while `state`/`metadata` are
    /// replaced. Returns the stored snapshot.
    async fn upsert_run_snapshot(
        &self,
        snapshot: &RunSnapshot,
    ) -> Result<RunSnapshot, StorageError>;

    async fn get_run_snapshot(
        &self,
        run_id: &str,
        step_id: &str,
    ) -> Result<Option<RunSnapshot>, StorageError>;

    async fn get_latest_run_snapshot(
        &self,
        run_id: &str,
    ) -> Result<Option<RunSnapshot>, StorageError>;

    /// Oldest first.
    async fn list_run_snapshots(&self, run_id: &str) -> Result<Vec<RunSnapshot>, StorageError>;

    async fn delete_run_snapshots(&self, run_id: &str) -> Result<u64, StorageError>;

    /// Delete runs older than `hot_days` days, cascading through events,
    /// tickets, and snapshots. The cutoff is computed by calendar
    /// subtraction, so month boundaries never produce a negative day.
    async fn vacuum(&self, hot_days: u32, dry_run: bool) -> Result<VacuumReport, StorageError>;
}
