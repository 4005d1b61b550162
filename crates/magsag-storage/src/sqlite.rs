// SQLite storage backend: WAL mode, busy timeout, autocommit writes, and an
// optional FTS5 index over event messages.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use tokio::sync::Mutex;

use magsag_types::{
    ApprovalTicket, EventRecord, RunRecord, RunSnapshot, RunStatus, TicketStatus,
};

use crate::backend::{
    RunListFilter, StorageBackend, TicketListFilter, UpdateRun, VacuumReport,
};
use crate::error::StorageError;

/// Single-file relational store shared across runs. One connection guarded
/// by an async mutex; writes autocommit so readers in other processes see
/// row-level progress through WAL.
pub struct SqliteStorageBackend {
    conn: Arc<Mutex<Connection>>,
    db_path: PathBuf,
    enable_fts: bool,
}

fn to_ts(dt: DateTime<Utc>) -> String {
    // Fixed-width micros keep timestamps lexically sortable in SQL.
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| StorageError::Corrupt(format!("bad timestamp {raw:?}: {err}")))
}

fn parse_json_map(raw: Option<String>) -> Result<BTreeMap<String, Value>, StorageError> {
    match raw {
        Some(text) if !text.is_empty() => Ok(serde_json::from_str(&text)?),
        _ => Ok(BTreeMap::new()),
    }
}

impl SqliteStorageBackend {
    /// Open (or create) the database and initialize the schema. FTS5 is
    /// probed at startup; when the SQLite build lacks it, search degrades to
    /// empty results instead of failing.
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|err| StorageError::Corrupt(format!("cannot create db dir: {err}")))?;
            }
        }

        let conn = Connection::open(&db_path)?;
        conn.busy_timeout(Duration::from_secs(10))?;
        // PRAGMA journal_mode returns a row, so query_row and ignore it.
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        conn.execute("PRAGMA synchronous = NORMAL", [])?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;

        let backend = Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path,
            enable_fts: false,
        };
        let enable_fts = backend.init_schema().await?;
        Ok(Self {
            enable_fts,
            ..backend
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn fts_enabled(&self) -> bool {
        self.enable_fts
    }

    async fn init_schema(&self) -> Result<bool, StorageError> {
        let conn = self.conn.lock().await;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS runs (
                run_id TEXT PRIMARY KEY,
                agent_slug TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                ended_at TEXT,
                metrics TEXT NOT NULL DEFAULT '{}'
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS run_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
                agent_slug TEXT NOT NULL,
                event_type TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                level TEXT,
                message TEXT,
                payload TEXT NOT NULL DEFAULT '{}'
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_run_events_run ON run_events(run_id, id)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS approval_tickets (
                ticket_id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
                agent_slug TEXT NOT NULL,
                tool_name TEXT NOT NULL,
                tool_args TEXT NOT NULL DEFAULT '{}',
                masked_args TEXT NOT NULL DEFAULT '{}',
                args_hash TEXT NOT NULL,
                step_id TEXT,
                status TEXT NOT NULL,
                requested_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                resolved_at TEXT,
                resolved_by TEXT,
                decision_reason TEXT,
                response TEXT,
                metadata TEXT NOT NULL DEFAULT '{}'
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_tickets_run ON approval_tickets(run_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_tickets_status ON approval_tickets(status)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS run_snapshots (
                snapshot_id TEXT NOT NULL,
                run_id TEXT NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
                step_id TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT '{}',
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                PRIMARY KEY (run_id, step_id)
            )",
            [],
        )?;

        // FTS5 is a compile-time SQLite option; degrade instead of failing.
        let fts = conn.execute(
            "CREATE VIRTUAL TABLE IF NOT EXISTS run_events_fts
             USING fts5(message, content='run_events', content_rowid='id')",
            [],
        );
        match fts {
            Ok(_) => Ok(true),
            Err(err) => {
                tracing::warn!("FTS5 unavailable, text search disabled: {err}");
                Ok(false)
            }
        }
    }

    fn run_from_row(row: &Row<'_>) -> rusqlite::Result<(String, String, String, String, Option<String>, Option<String>)> {
        Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
        ))
    }

    fn decode_run(
        raw: (String, String, String, String, Option<String>, Option<String>),
    ) -> Result<RunRecord, StorageError> {
        let (run_id, agent_slug, status, started_at, ended_at, metrics) = raw;
        let status = RunStatus::parse(&status)
            .ok_or_else(|| StorageError::Corrupt(format!("bad run status {status:?}")))?;
        Ok(RunRecord {
            run_id,
            agent_slug,
            status,
            started_at: parse_ts(&started_at)?,
            ended_at: ended_at.as_deref().map(parse_ts).transpose()?,
            metrics: parse_json_map(metrics)?,
        })
    }

    fn event_from_row(
        row: &Row<'_>,
    ) -> rusqlite::Result<(String, String, String, String, Option<String>, Option<String>, Option<String>)>
    {
        Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
            row.get(6)?,
        ))
    }

    fn decode_event(
        raw: (String, String, String, String, Option<String>, Option<String>, Option<String>),
    ) -> Result<EventRecord, StorageError> {
        let (run_id, agent_slug, event_type, timestamp, level, message, payload) = raw;
        Ok(EventRecord {
            run_id,
            agent_slug,
            event_type,
            timestamp: parse_ts(&timestamp)?,
            level,
            message,
            payload: parse_json_map(payload)?,
        })
    }

    #[allow(clippy::type_complexity)]
    fn ticket_from_row(
        row: &Row<'_>,
    ) -> rusqlite::Result<(
        String,
        String,
        String,
        String,
        Option<String>,
        Option<String>,
        String,
        Option<String>,
        String,
        String,
        String,
        Option<String>,
        Option<String>,
        Option<String>,
        Option<String>,
        Option<String>,
    )> {
        Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
            row.get(6)?,
            row.get(7)?,
            row.get(8)?,
            row.get(9)?,
            row.get(10)?,
            row.get(11)?,
            row.get(12)?,
            row.get(13)?,
            row.get(14)?,
            row.get(15)?,
        ))
    }

    #[allow(clippy::type_complexity)]
    fn decode_ticket(
        raw: (
            String,
            String,
            String,
            String,
            Option<String>,
            Option<String>,
            String,
            Option<String>,
            String,
            String,
            String,
            Option<String>,
            Option<String>,
            Option<String>,
            Option<String>,
            Option<String>,
        ),
    ) -> Result<ApprovalTicket, StorageError> {
        let (
            ticket_id,
            run_id,
            agent_slug,
            tool_name,
            tool_args,
            masked_args,
            args_hash,
            step_id,
            status,
            requested_at,
            expires_at,
            resolved_at,
            resolved_by,
            decision_reason,
            response,
            metadata,
        ) = raw;
        let status = TicketStatus::parse(&status)
            .ok_or_else(|| StorageError::Corrupt(format!("bad ticket status {status:?}")))?;
        Ok(ApprovalTicket {
            ticket_id,
            run_id,
            agent_slug,
            tool_name,
            tool_args: parse_json_map(tool_args)?,
            masked_args: parse_json_map(masked_args)?,
            args_hash,
            step_id,
            status,
            requested_at: parse_ts(&requested_at)?,
            expires_at: parse_ts(&expires_at)?,
            resolved_at: resolved_at.as_deref().map(parse_ts).transpose()?,
            resolved_by,
            decision_reason,
            response: response
                .map(|raw| parse_json_map(Some(raw)))
                .transpose()?,
            metadata: parse_json_map(metadata)?,
        })
    }

    fn snapshot_from_row(
        row: &Row<'_>,
    ) -> rusqlite::Result<(String, String, String, Option<String>, Option<String>, String)> {
        Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
        ))
    }

    fn decode_snapshot(
        raw: (String, String, String, Option<String>, Option<String>, String),
    ) -> Result<RunSnapshot, StorageError> {
        let (snapshot_id, run_id, step_id, state, metadata, created_at) = raw;
        Ok(RunSnapshot {
            snapshot_id,
            run_id,
            step_id,
            state: parse_json_map(state)?,
            metadata: parse_json_map(metadata)?,
            created_at: parse_ts(&created_at)?,
        })
    }

    fn ensure_run_row(
        conn: &Connection,
        run_id: &str,
        agent_slug: &str,
        started_at: DateTime<Utc>,
    ) -> rusqlite::Result<()> {
        conn.execute(
            "INSERT OR IGNORE INTO runs (run_id, agent_slug, status, started_at)
             VALUES (?1, ?2, 'running', ?3)",
            params![run_id, agent_slug, to_ts(started_at)],
        )?;
        Ok(())
    }
}

const EVENT_COLUMNS: &str = "run_id, agent_slug, event_type, timestamp, level, message, payload";
const TICKET_COLUMNS: &str = "ticket_id, run_id, agent_slug, tool_name, tool_args, masked_args, \
     args_hash, step_id, status, requested_at, expires_at, resolved_at, resolved_by, \
     decision_reason, response, metadata";

#[async_trait]
impl StorageBackend for SqliteStorageBackend {
    async fn create_run(
        &self,
        run_id: &str,
        agent_slug: &str,
        status: RunStatus,
    ) -> Result<(), StorageError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR IGNORE INTO runs (run_id, agent_slug, status, started_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![run_id, agent_slug, status.as_str(), to_ts(Utc::now())],
        )?;
        Ok(())
    }

    async fn update_run(&self, run_id: &str, update: UpdateRun) -> Result<(), StorageError> {
        let conn = self.conn.lock().await;
        let existing: Option<Option<String>> = conn
            .query_row(
                "SELECT metrics FROM runs WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(metrics_raw) = existing else {
            return Err(StorageError::not_found("run", run_id));
        };

        if let Some(status) = update.status {
            conn.execute(
                "UPDATE runs SET status = ?1 WHERE run_id = ?2",
                params![status.as_str(), run_id],
            )?;
        }
        if let Some(ended_at) = update.ended_at {
            conn.execute(
                "UPDATE runs SET ended_at = ?1 WHERE run_id = ?2",
                params![to_ts(ended_at), run_id],
            )?;
        }
        if let Some(new_metrics) = update.metrics {
            let mut merged = parse_json_map(metrics_raw)?;
            merged.extend(new_metrics);
            conn.execute(
                "UPDATE runs SET metrics = ?1 WHERE run_id = ?2",
                params![serde_json::to_string(&merged)?, run_id],
            )?;
        }
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>, StorageError> {
        let conn = self.conn.lock().await;
        let raw = conn
            .query_row(
                "SELECT run_id, agent_slug, status, started_at, ended_at, metrics
                 FROM runs WHERE run_id = ?1",
                params![run_id],
                Self::run_from_row,
            )
            .optional()?;
        raw.map(Self::decode_run).transpose()
    }

    async fn list_runs(&self, filter: RunListFilter) -> Result<Vec<RunRecord>, StorageError> {
        let conn = self.conn.lock().await;
        let mut sql = String::from(
            "SELECT run_id, agent_slug, status, started_at, ended_at, metrics FROM runs",
        );
        let mut clauses = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(agent_slug) = &filter.agent_slug {
            clauses.push("agent_slug = ?");
            params.push(Box::new(agent_slug.clone()));
        }
        if let Some(status) = filter.status {
            clauses.push("status = ?");
            params.push(Box::new(status.as_str().to_string()));
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY started_at DESC, rowid DESC LIMIT ?");
        let limit = if filter.limit == 0 { 100 } else { filter.limit };
        params.push(Box::new(limit as i64));

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(params.iter().map(|p| p.as_ref())),
            Self::run_from_row,
        )?;
        let mut runs = Vec::new();
        for raw in rows {
            runs.push(Self::decode_run(raw?)?);
        }
        Ok(runs)
    }

    async fn append_event(&self, event: EventRecord) -> Result<(), StorageError> {
        let conn = self.conn.lock().await;
        Self::ensure_run_row(&conn, &event.run_id, &event.agent_slug, event.timestamp)?;
        conn.execute(
            "INSERT INTO run_events (run_id, agent_slug, event_type, timestamp, level, message, payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                event.run_id,
                event.agent_slug,
                event.event_type,
                to_ts(event.timestamp),
                event.level,
                event.message,
                serde_json::to_string(&event.payload)?,
            ],
        )?;
        if self.enable_fts {
            let rowid = conn.last_insert_rowid();
            conn.execute(
                "INSERT INTO run_events_fts (rowid, message) VALUES (?1, ?2)",
                params![rowid, event.message.unwrap_or_default()],
            )?;
        }
        Ok(())
    }

    async fn get_events(
        &self,
        run_id: &str,
    ) -> Result<BoxStream<'static, EventRecord>, StorageError> {
        let events = {
            let conn = self.conn.lock().await;
            let mut stmt = conn.prepare(&format!(
                "SELECT {EVENT_COLUMNS} FROM run_events WHERE run_id = ?1 ORDER BY id ASC"
            ))?;
            let rows = stmt.query_map(params![run_id], Self::event_from_row)?;
            let mut events = Vec::new();
            for raw in rows {
                events.push(Self::decode_event(raw?)?);
            }
            events
        };
        Ok(futures::stream::iter(events).boxed())
    }

    async fn search_text(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<EventRecord>, StorageError> {
        if !self.enable_fts {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT e.run_id, e.agent_slug, e.event_type, e.timestamp, e.level, e.message, e.payload
             FROM run_events_fts f
             JOIN run_events e ON e.id = f.rowid
             WHERE run_events_fts MATCH ?1
             ORDER BY rank LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![query, limit as i64], Self::event_from_row)?;
        let mut events = Vec::new();
        for raw in rows {
            events.push(Self::decode_event(raw?)?);
        }
        Ok(events)
    }

    async fn create_approval_ticket(&self, ticket: &ApprovalTicket) -> Result<(), StorageError> {
        let conn = self.conn.lock().await;
        Self::ensure_run_row(&conn, &ticket.run_id, &ticket.agent_slug, ticket.requested_at)?;
        conn.execute(
            &format!(
                "INSERT INTO approval_tickets ({TICKET_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
            ),
            params![
                ticket.ticket_id,
                ticket.run_id,
                ticket.agent_slug,
                ticket.tool_name,
                serde_json::to_string(&ticket.tool_args)?,
                serde_json::to_string(&ticket.masked_args)?,
                ticket.args_hash,
                ticket.step_id,
                ticket.status.as_str(),
                to_ts(ticket.requested_at),
                to_ts(ticket.expires_at),
                ticket.resolved_at.map(to_ts),
                ticket.resolved_by,
                ticket.decision_reason,
                ticket
                    .response
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                serde_json::to_string(&ticket.metadata)?,
            ],
        )?;
        Ok(())
    }

    async fn update_approval_ticket(&self, ticket: &ApprovalTicket) -> Result<(), StorageError> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE approval_tickets
             SET status = ?1, resolved_at = ?2, resolved_by = ?3, decision_reason = ?4,
                 response = ?5, metadata = ?6
             WHERE ticket_id = ?7",
            params![
                ticket.status.as_str(),
                ticket.resolved_at.map(to_ts),
                ticket.resolved_by,
                ticket.decision_reason,
                ticket
                    .response
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                serde_json::to_string(&ticket.metadata)?,
                ticket.ticket_id,
            ],
        )?;
        if changed == 0 {
            return Err(StorageError::not_found("approval ticket", &ticket.ticket_id));
        }
        Ok(())
    }

    async fn get_approval_ticket(
        &self,
        ticket_id: &str,
    ) -> Result<Option<ApprovalTicket>, StorageError> {
        let conn = self.conn.lock().await;
        let raw = conn
            .query_row(
                &format!("SELECT {TICKET_COLUMNS} FROM approval_tickets WHERE ticket_id = ?1"),
                params![ticket_id],
                Self::ticket_from_row,
            )
            .optional()?;
        raw.map(Self::decode_ticket).transpose()
    }

    async fn list_approval_tickets(
        &self,
        filter: TicketListFilter,
    ) -> Result<Vec<ApprovalTicket>, StorageError> {
        let conn = self.conn.lock().await;
        let mut sql = format!("SELECT {TICKET_COLUMNS} FROM approval_tickets");
        let mut clauses = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(run_id) = &filter.run_id {
            clauses.push("run_id = ?");
            params.push(Box::new(run_id.clone()));
        }
        if let Some(agent_slug) = &filter.agent_slug {
            clauses.push("agent_slug = ?");
            params.push(Box::new(agent_slug.clone()));
        }
        if let Some(status) = filter.status {
            clauses.push("status = ?");
            params.push(Box::new(status.as_str().to_string()));
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY requested_at ASC");

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(params.iter().map(|p| p.as_ref())),
            Self::ticket_from_row,
        )?;
        let mut tickets = Vec::new();
        for raw in rows {
            tickets.push(Self::decode_ticket(raw?)?);
        }
        Ok(tickets)
    }

    async fn upsert_run_snapshot(
        &self,
        snapshot: &RunSnapshot,
    ) -> Result<RunSnapshot, StorageError> {
        let conn = self.conn.lock().await;
        let agent_slug = snapshot
            .metadata
            .get("agent_slug")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        Self::ensure_run_row(&conn, &snapshot.run_id, agent_slug, snapshot.created_at)?;

        let existing: Option<(String, String)> = conn
            .query_row(
                "SELECT snapshot_id, created_at FROM run_snapshots
                 WHERE run_id = ?1 AND step_id = ?2",
                params![snapshot.run_id, snapshot.step_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match existing {
            Some((snapshot_id, created_at)) => {
                conn.execute(
                    "UPDATE run_snapshots SET state = ?1, metadata = ?2
                     WHERE run_id = ?3 AND step_id = ?4",
                    params![
                        serde_json::to_string(&snapshot.state)?,
                        serde_json::to_string(&snapshot.metadata)?,
                        snapshot.run_id,
                        snapshot.step_id,
                    ],
                )?;
                Ok(RunSnapshot {
                    snapshot_id,
                    created_at: parse_ts(&created_at)?,
                    ..snapshot.clone()
                })
            }
            None => {
                conn.execute(
                    "INSERT INTO run_snapshots (snapshot_id, run_id, step_id, state, metadata, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        snapshot.snapshot_id,
                        snapshot.run_id,
                        snapshot.step_id,
                        serde_json::to_string(&snapshot.state)?,
                        serde_json::to_string(&snapshot.metadata)?,
                        to_ts(snapshot.created_at),
                    ],
                )?;
                Ok(snapshot.clone())
            }
        }
    }

    async fn get_run_snapshot(
        &self,
        run_id: &str,
        step_id: &str,
    ) -> Result<Option<RunSnapshot>, StorageError> {
        let conn = self.conn.lock().await;
        let raw = conn
            .query_row(
                "SELECT snapshot_id, run_id, step_id, state, metadata, created_at
                 FROM run_snapshots WHERE run_id = ?1 AND step_id = ?2",
                params![run_id, step_id],
                Self::snapshot_from_row,
            )
            .optional()?;
        raw.map(Self::decode_snapshot).transpose()
    }

    async fn get_latest_run_snapshot(
        &self,
        run_id: &str,
    ) -> Result<Option<RunSnapshot>, StorageError> {
        let conn = self.conn.lock().await;
        let raw = conn
            .query_row(
                "SELECT snapshot_id, run_id, step_id, state, metadata, created_at
                 FROM run_snapshots WHERE run_id = ?1
                 ORDER BY created_at DESC, rowid DESC LIMIT 1",
                params![run_id],
                Self::snapshot_from_row,
            )
            .optional()?;
        raw.map(Self::decode_snapshot).transpose()
    }

    async fn list_run_snapshots(&self, run_id: &str) -> Result<Vec<RunSnapshot>, StorageError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT snapshot_id, run_id, step_id, state, metadata, created_at
             FROM run_snapshots WHERE run_id = ?1 ORDER BY created_at ASC, rowid ASC",
        )?;
        let rows = stmt.query_map(params![run_id], Self::snapshot_from_row)?;
        let mut snapshots = Vec::new();
        for raw in rows {
            snapshots.push(Self::decode_snapshot(raw?)?);
        }
        Ok(snapshots)
    }

    async fn delete_run_snapshots(&self, run_id: &str) -> Result<u64, StorageError> {
        let conn = self.conn.lock().await;
        let deleted = conn.execute(
            "DELETE FROM run_snapshots WHERE run_id = ?1",
            params![run_id],
        )?;
        Ok(deleted as u64)
    }

    async fn vacuum(&self, hot_days: u32, dry_run: bool) -> Result<VacuumReport, StorageError> {
        // Calendar subtraction; a cutoff near a month boundary stays valid.
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(hot_days));
        let cutoff_ts = to_ts(cutoff);
        let conn = self.conn.lock().await;
        let runs_to_delete: i64 = conn.query_row(
            "SELECT COUNT(*) FROM runs WHERE started_at < ?1",
            params![cutoff_ts],
            |row| row.get(0),
        )?;
        let runs_deleted = if dry_run {
            0
        } else {
            conn.execute("DELETE FROM runs WHERE started_at < ?1", params![cutoff_ts])? as u64
        };
        Ok(VacuumReport {
            dry_run,
            cutoff: cutoff_ts,
            runs_to_delete: runs_to_delete as u64,
            runs_deleted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;
    use uuid::Uuid;

    async fn temp_backend() -> (tempfile::TempDir, SqliteStorageBackend) {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = SqliteStorageBackend::new(dir.path().join("state.db"))
            .await
            .expect("open backend");
        (dir, backend)
    }

    fn event(run_id: &str, message: &str) -> EventRecord {
        EventRecord {
            run_id: run_id.to_string(),
            agent_slug: "test-agent".to_string(),
            event_type: "log".to_string(),
            timestamp: Utc::now(),
            level: Some("info".to_string()),
            message: Some(message.to_string()),
            payload: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn create_run_is_idempotent() {
        let (_dir, storage) = temp_backend().await;
        storage
            .create_run("run-1", "agent-a", RunStatus::Running)
            .await
            .unwrap();
        storage
            .create_run("run-1", "agent-b", RunStatus::Failed)
            .await
            .unwrap();

        let run = storage.get_run("run-1").await.unwrap().unwrap();
        assert_eq!(run.agent_slug, "agent-a");
        assert_eq!(run.status, RunStatus::Running);
    }

    #[tokio::test]
    async fn update_run_merges_metrics() {
        let (_dir, storage) = temp_backend().await;
        storage
            .create_run("run-1", "agent-a", RunStatus::Running)
            .await
            .unwrap();

        let mut first = BTreeMap::new();
        first.insert("latency_ms".to_string(), json!(1500));
        storage
            .update_run(
                "run-1",
                UpdateRun {
                    metrics: Some(first),
                    ..UpdateRun::default()
                },
            )
            .await
            .unwrap();

        let mut second = BTreeMap::new();
        second.insert("task_count".to_string(), json!(3));
        storage
            .update_run(
                "run-1",
                UpdateRun {
                    status: Some(RunStatus::Succeeded),
                    ended_at: Some(Utc::now()),
                    metrics: Some(second),
                },
            )
            .await
            .unwrap();

        let run = storage.get_run("run-1").await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Succeeded);
        assert!(run.ended_at.is_some());
        assert_eq!(run.metrics["latency_ms"], json!(1500));
        assert_eq!(run.metrics["task_count"], json!(3));
    }

    #[tokio::test]
    async fn update_unknown_run_is_not_found() {
        let (_dir, storage) = temp_backend().await;
        let err = storage
            .update_run("ghost", UpdateRun::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound { .. }));
    }

    #[tokio::test]
    async fn events_stream_in_insertion_order() {
        let (_dir, storage) = temp_backend().await;
        storage
            .create_run("run-1", "test-agent", RunStatus::Running)
            .await
            .unwrap();
        storage.append_event(event("run-1", "first")).await.unwrap();
        storage.append_event(event("run-1", "second")).await.unwrap();

        let events: Vec<_> = storage.get_events("run-1").await.unwrap().collect().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].message.as_deref(), Some("first"));
        assert_eq!(events[1].message.as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn append_event_lazily_creates_run() {
        let (_dir, storage) = temp_backend().await;
        storage
            .append_event(event("implicit-run", "hello"))
            .await
            .unwrap();
        let run = storage.get_run("implicit-run").await.unwrap().unwrap();
        assert_eq!(run.agent_slug, "test-agent");
    }

    #[tokio::test]
    async fn list_runs_filters_and_orders() {
        let (_dir, storage) = temp_backend().await;
        for i in 0..5 {
            let slug = if i % 2 == 0 { "agent-a" } else { "agent-b" };
            let status = if i < 3 {
                RunStatus::Succeeded
            } else {
                RunStatus::Failed
            };
            storage
                .create_run(&format!("run-{i:03}"), slug, status)
                .await
                .unwrap();
        }

        let all = storage.list_runs(RunListFilter::default()).await.unwrap();
        assert_eq!(all.len(), 5);

        let agent_a = storage
            .list_runs(RunListFilter {
                agent_slug: Some("agent-a".to_string()),
                ..RunListFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(agent_a.len(), 3);

        let failed = storage
            .list_runs(RunListFilter {
                status: Some(RunStatus::Failed),
                ..RunListFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(failed.len(), 2);
    }

    #[tokio::test]
    async fn search_text_matches_event_messages() {
        let (_dir, storage) = temp_backend().await;
        if !storage.fts_enabled() {
            return;
        }
        storage
            .create_run("run-1", "test-agent", RunStatus::Running)
            .await
            .unwrap();
        storage
            .append_event(event("run-1", "a message about errors"))
            .await
            .unwrap();
        storage
            .append_event(event("run-1", "successful completion"))
            .await
            .unwrap();

        let hits = storage.search_text("errors", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].message.as_deref().unwrap().contains("errors"));
    }

    #[tokio::test]
    async fn ticket_roundtrip_and_update() {
        let (_dir, storage) = temp_backend().await;
        storage
            .create_run("run-1", "agent-a", RunStatus::Running)
            .await
            .unwrap();

        let mut args = BTreeMap::new();
        args.insert("path".to_string(), json!("/etc/passwd"));
        let mut ticket = ApprovalTicket::new(
            Uuid::new_v4().to_string(),
            "run-1",
            "agent-a",
            "filesystem.read",
            args,
            None,
            Utc::now(),
            Utc::now() + Duration::minutes(5),
            BTreeMap::new(),
        );
        storage.create_approval_ticket(&ticket).await.unwrap();

        let fetched = storage
            .get_approval_ticket(&ticket.ticket_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.status, TicketStatus::Pending);
        assert_eq!(fetched.args_hash, ticket.args_hash);

        ticket.status = TicketStatus::Approved;
        ticket.resolved_at = Some(Utc::now());
        ticket.resolved_by = Some("reviewer@example.com".to_string());
        ticket.decision_reason = Some("allowed".to_string());
        storage.update_approval_ticket(&ticket).await.unwrap();

        let updated = storage
            .get_approval_ticket(&ticket.ticket_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, TicketStatus::Approved);
        assert_eq!(updated.resolved_by.as_deref(), Some("reviewer@example.com"));

        let listed = storage
            .list_approval_tickets(TicketListFilter {
                run_id: Some("run-1".to_string()),
                ..TicketListFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn snapshot_upsert_keeps_first_snapshot_id() {
        let (_dir, storage) = temp_backend().await;
        let mut snapshot = RunSnapshot {
            snapshot_id: "snap-001".to_string(),
            run_id: "run-durable".to_string(),
            step_id: "step-1".to_string(),
            state: BTreeMap::from([("counter".to_string(), json!(1))]),
            metadata: BTreeMap::from([("agent_slug".to_string(), json!("agent-durable"))]),
            created_at: Utc::now(),
        };
        let stored = storage.upsert_run_snapshot(&snapshot).await.unwrap();
        assert_eq!(stored.snapshot_id, "snap-001");

        snapshot.snapshot_id = "snap-002".to_string();
        snapshot.state.insert("counter".to_string(), json!(2));
        let stored = storage.upsert_run_snapshot(&snapshot).await.unwrap();
        assert_eq!(stored.snapshot_id, "snap-001");

        let fetched = storage
            .get_run_snapshot("run-durable", "step-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.snapshot_id, "snap-001");
        assert_eq!(fetched.state["counter"], json!(2));

        let all = storage.list_run_snapshots("run-durable").await.unwrap();
        assert_eq!(all.len(), 1);

        // The lazily created run row took its slug from the metadata.
        let run = storage.get_run("run-durable").await.unwrap().unwrap();
        assert_eq!(run.agent_slug, "agent-durable");

        assert_eq!(storage.delete_run_snapshots("run-durable").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn vacuum_cascades_and_reports_cutoff() {
        let (_dir, storage) = temp_backend().await;
        storage
            .create_run("run-old", "agent-a", RunStatus::Succeeded)
            .await
            .unwrap();
        storage.append_event(event("run-old", "old event")).await.unwrap();

        let dry = storage.vacuum(0, true).await.unwrap();
        assert!(dry.dry_run);
        assert!(dry.runs_to_delete >= 1);
        assert!(!dry.cutoff.is_empty());

        let wet = storage.vacuum(0, false).await.unwrap();
        assert!(wet.runs_deleted >= 1);
        assert!(storage.get_run("run-old").await.unwrap().is_none());
        let events: Vec<_> = storage.get_events("run-old").await.unwrap().collect().await;
        assert!(events.is_empty());

        // Month-boundary safety: a cutoff wider than the current day of
        // month still computes.
        let report = storage.vacuum(30, true).await.unwrap();
        assert!(report.dry_run);
    }
}
