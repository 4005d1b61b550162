//! Thread-safe cost tracking with dual persistence: an append-only JSONL
//! audit log and a WAL-mode SQLite table for aggregation. One lock spans
//! both sinks, so concurrent writers never interleave partial records.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use once_cell::sync::OnceCell;
use rusqlite::{params, Connection};
use serde_json::Value;
use thiserror::Error;

use magsag_types::{CostBreakdown, CostRecord, CostSummary};

use crate::runs_dir;

#[derive(Debug, Error)]
pub enum CostError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Filters for [`CostTracker::get_summary`]. Timestamps are RFC 3339 strings
/// compared inclusively on both ends.
#[derive(Debug, Clone, Default)]
pub struct SummaryQuery {
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub agent: Option<String>,
    pub run_id: Option<String>,
}

struct TrackerState {
    initialized: bool,
    conn: Option<Connection>,
}

pub struct CostTracker {
    jsonl_path: PathBuf,
    db_path: PathBuf,
    enable_sqlite: bool,
    state: Mutex<TrackerState>,
}

impl CostTracker {
    pub fn new(
        jsonl_path: impl Into<PathBuf>,
        db_path: impl Into<PathBuf>,
        enable_sqlite: bool,
    ) -> Self {
        Self {
            jsonl_path: jsonl_path.into(),
            db_path: db_path.into(),
            enable_sqlite,
            state: Mutex::new(TrackerState {
                initialized: false,
                conn: None,
            }),
        }
    }

    /// Tracker rooted at the default `.runs/` layout.
    pub fn with_default_paths() -> Self {
        let runs = runs_dir();
        Self::new(runs.join("costs").join("costs.jsonl"), runs.join("costs.db"), true)
    }

    fn init_locked(&self, state: &mut TrackerState) -> Result<(), CostError> {
        if state.initialized {
            return Ok(());
        }
        if let Some(parent) = self.jsonl_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if self.enable_sqlite {
            if let Some(parent) = self.db_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let conn = Connection::open(&self.db_path)?;
            conn.busy_timeout(Duration::from_secs(10))?;
            conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
            conn.execute(
                "CREATE TABLE IF NOT EXISTS cost_records (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    timestamp TEXT NOT NULL,
                    model TEXT NOT NULL,
                    input_tokens INTEGER NOT NULL,
                    output_tokens INTEGER NOT NULL,
                    total_tokens INTEGER NOT NULL,
                    cost_usd REAL NOT NULL,
                    run_id TEXT,
                    step TEXT,
                    agent TEXT,
                    metadata TEXT
                )",
                [],
            )?;
            conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_cost_timestamp ON cost_records(timestamp)",
                [],
            )?;
            conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_cost_model ON cost_records(model)",
                [],
            )?;
            conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_cost_agent ON cost_records(agent)",
                [],
            )?;
            conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_cost_run ON cost_records(run_id)",
                [],
            )?;
            state.conn = Some(conn);
        }
        state.initialized = true;
        Ok(())
    }

    /// Append a record to both sinks. The JSONL line is flushed before the
    /// call returns.
    pub fn record_cost(&self, record: &CostRecord) -> Result<(), CostError> {
        let mut state = self.state.lock().expect("cost tracker lock poisoned");
        self.init_locked(&mut state)?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.jsonl_path)?;
        let line = serde_json::to_string(record)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()?;

        if let Some(conn) = state.conn.as_ref() {
            conn.execute(
                "INSERT INTO cost_records
                 (timestamp, model, input_tokens, output_tokens, total_tokens,
                  cost_usd, run_id, step, agent, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    record.timestamp,
                    record.model,
                    record.input_tokens as i64,
                    record.output_tokens as i64,
                    record.total_tokens as i64,
                    record.cost_usd,
                    record.run_id,
                    record.step,
                    record.agent,
                    if record.metadata.is_empty() {
                        None
                    } else {
                        Some(serde_json::to_string(&record.metadata)?)
                    },
                ],
            )?;
        }
        Ok(())
    }

    /// Aggregate totals with per-model and per-agent breakdowns. Records with
    /// no agent are excluded from `by_agent` but counted in the totals.
    pub fn get_summary(&self, query: &SummaryQuery) -> Result<CostSummary, CostError> {
        let mut state = self.state.lock().expect("cost tracker lock poisoned");
        self.init_locked(&mut state)?;

        match state.conn.as_ref() {
            Some(conn) => self.summary_from_sqlite(conn, query),
            None => self.summary_from_jsonl(query),
        }
    }

    fn summary_from_sqlite(
        &self,
        conn: &Connection,
        query: &SummaryQuery,
    ) -> Result<CostSummary, CostError> {
        let mut clauses = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(start) = &query.start_time {
            clauses.push("timestamp >= ?");
            params.push(Box::new(start.clone()));
        }
        if let Some(end) = &query.end_time {
            clauses.push("timestamp <= ?");
            params.push(Box::new(end.clone()));
        }
        if let Some(agent) = &query.agent {
            clauses.push("agent = ?");
            params.push(Box::new(agent.clone()));
        }
        if let Some(run_id) = &query.run_id {
            clauses.push("run_id = ?");
            params.push(Box::new(run_id.clone()));
        }
        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };

        let mut summary = conn.query_row(
            &format!(
                "SELECT COALESCE(SUM(cost_usd), 0), COALESCE(SUM(total_tokens), 0),
                        COALESCE(SUM(input_tokens), 0), COALESCE(SUM(output_tokens), 0),
                        COUNT(*)
                 FROM cost_records{where_clause}"
            ),
            rusqlite::params_from_iter(params.iter().map(|p| p.as_ref())),
            |row| {
                Ok(CostSummary {
                    total_cost_usd: row.get(0)?,
                    total_tokens: row.get::<_, i64>(1)? as u64,
                    total_input_tokens: row.get::<_, i64>(2)? as u64,
                    total_output_tokens: row.get::<_, i64>(3)? as u64,
                    total_calls: row.get::<_, i64>(4)? as u64,
                    ..CostSummary::default()
                })
            },
        )?;
        summary.period_start = query.start_time.clone();
        summary.period_end = query.end_time.clone();

        for column in ["model", "agent"] {
            let sql = format!(
                "SELECT {column}, SUM(cost_usd), SUM(total_tokens), SUM(input_tokens),
                        SUM(output_tokens), COUNT(*)
                 FROM cost_records{where_clause}
                 GROUP BY {column} ORDER BY SUM(cost_usd) DESC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                rusqlite::params_from_iter(params.iter().map(|p| p.as_ref())),
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        CostBreakdown {
                            cost_usd: row.get(1)?,
                            tokens: row.get::<_, i64>(2)? as u64,
                            input_tokens: row.get::<_, i64>(3)? as u64,
                            output_tokens: row.get::<_, i64>(4)? as u64,
                            calls: row.get::<_, i64>(5)? as u64,
                        },
                    ))
                },
            )?;
            for row in rows {
                let (key, breakdown) = row?;
                // NULL keys (unattributed agents) stay out of the breakdowns.
                if let Some(key) = key {
                    if column == "model" {
                        summary.by_model.insert(key, breakdown);
                    } else {
                        summary.by_agent.insert(key, breakdown);
                    }
                }
            }
        }

        Ok(summary)
    }

    /// Fallback used when SQLite is disabled: stream the audit log under the
    /// same lock discipline as writes.
    fn summary_from_jsonl(&self, query: &SummaryQuery) -> Result<CostSummary, CostError> {
        let mut summary = CostSummary {
            period_start: query.start_time.clone(),
            period_end: query.end_time.clone(),
            ..CostSummary::default()
        };
        let file = match std::fs::File::open(&self.jsonl_path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(summary),
            Err(err) => return Err(err.into()),
        };

        for line in BufReader::new(file).lines() {
            let line = line?;
            let Ok(record) = serde_json::from_str::<CostRecord>(&line) else {
                continue;
            };
            if query
                .start_time
                .as_deref()
                .is_some_and(|start| record.timestamp.as_str() < start)
            {
                continue;
            }
            if query
                .end_time
                .as_deref()
                .is_some_and(|end| record.timestamp.as_str() > end)
            {
                continue;
            }
            if query
                .agent
                .as_deref()
                .is_some_and(|agent| record.agent.as_deref() != Some(agent))
            {
                continue;
            }
            if query
                .run_id
                .as_deref()
                .is_some_and(|run| record.run_id.as_deref() != Some(run))
            {
                continue;
            }

            summary.total_cost_usd += record.cost_usd;
            summary.total_tokens += record.total_tokens;
            summary.total_input_tokens += record.input_tokens;
            summary.total_output_tokens += record.output_tokens;
            summary.total_calls += 1;
            summary
                .by_model
                .entry(record.model.clone())
                .or_default()
                .absorb(&record);
            if let Some(agent) = record.agent.clone() {
                summary.by_agent.entry(agent).or_default().absorb(&record);
            }
        }

        Ok(summary)
    }

    pub fn close(&self) {
        let mut state = self.state.lock().expect("cost tracker lock poisoned");
        state.conn = None;
        state.initialized = false;
    }
}

static GLOBAL_TRACKER: OnceCell<Arc<CostTracker>> = OnceCell::new();

/// Process-wide tracker rooted at the default `.runs/` layout.
pub fn global_tracker() -> Arc<CostTracker> {
    GLOBAL_TRACKER
        .get_or_init(|| Arc::new(CostTracker::with_default_paths()))
        .clone()
}

/// Record one LLM call against the global tracker, stamping the current
/// time and deriving `total_tokens`.
#[allow(clippy::too_many_arguments)]
pub fn record_llm_cost(
    model: &str,
    input_tokens: u64,
    output_tokens: u64,
    cost_usd: f64,
    run_id: Option<&str>,
    step: Option<&str>,
    agent: Option<&str>,
    metadata: Option<BTreeMap<String, Value>>,
) -> Result<(), CostError> {
    let record = CostRecord {
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
        model: model.to_string(),
        input_tokens,
        output_tokens,
        total_tokens: input_tokens + output_tokens,
        cost_usd,
        run_id: run_id.map(str::to_string),
        step: step.map(str::to_string),
        agent: agent.map(str::to_string),
        metadata: metadata.unwrap_or_default(),
    };
    global_tracker().record_cost(&record)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(model: &str, agent: Option<&str>, cost: f64) -> CostRecord {
        CostRecord {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            model: model.to_string(),
            input_tokens: 100,
            output_tokens: 50,
            total_tokens: 150,
            cost_usd: cost,
            run_id: Some("run-1".to_string()),
            step: None,
            agent: agent.map(str::to_string),
            metadata: BTreeMap::new(),
        }
    }

    fn temp_tracker(enable_sqlite: bool) -> (tempfile::TempDir, CostTracker) {
        let dir = tempfile::tempdir().expect("tempdir");
        let tracker = CostTracker::new(
            dir.path().join("costs.jsonl"),
            dir.path().join("costs.db"),
            enable_sqlite,
        );
        (dir, tracker)
    }

    #[test]
    fn summary_aggregates_and_excludes_null_agents() {
        let (_dir, tracker) = temp_tracker(true);
        tracker.record_cost(&record("gpt-4o", Some("agent-a"), 0.01)).unwrap();
        tracker.record_cost(&record("gpt-4o", None, 0.02)).unwrap();
        tracker
            .record_cost(&record("claude-sonnet", Some("agent-b"), 0.03))
            .unwrap();

        let summary = tracker.get_summary(&SummaryQuery::default()).unwrap();
        assert_eq!(summary.total_calls, 3);
        assert_eq!(summary.total_tokens, 450);
        assert!((summary.total_cost_usd - 0.06).abs() < 1e-9);
        assert_eq!(summary.by_model.len(), 2);
        assert_eq!(summary.by_model["gpt-4o"].calls, 2);
        // Null agent contributes to totals but not to by_agent.
        assert_eq!(summary.by_agent.len(), 2);
        assert_eq!(summary.by_agent["agent-a"].calls, 1);
    }

    #[test]
    fn jsonl_fallback_matches_filters() {
        let (_dir, tracker) = temp_tracker(false);
        tracker.record_cost(&record("gpt-4o", Some("agent-a"), 0.01)).unwrap();
        tracker.record_cost(&record("local", Some("agent-b"), 0.0)).unwrap();

        let summary = tracker
            .get_summary(&SummaryQuery {
                agent: Some("agent-a".to_string()),
                ..SummaryQuery::default()
            })
            .unwrap();
        assert_eq!(summary.total_calls, 1);
        assert_eq!(summary.by_model.len(), 1);
    }

    #[test]
    fn concurrent_writers_leave_no_torn_lines() {
        let (_dir, tracker) = temp_tracker(true);
        let tracker = Arc::new(tracker);

        let mut handles = Vec::new();
        for thread_id in 0..10 {
            let tracker = Arc::clone(&tracker);
            handles.push(std::thread::spawn(move || {
                for i in 0..20 {
                    let model = format!("model-{thread_id}-{i}");
                    tracker.record_cost(&record(&model, Some("load"), 0.001)).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let summary = tracker.get_summary(&SummaryQuery::default()).unwrap();
        assert_eq!(summary.total_calls, 200);
        let model_calls: u64 = summary.by_model.values().map(|b| b.calls).sum();
        assert_eq!(model_calls, 200);

        // Every audit-log line parses back into a record.
        let raw = std::fs::read_to_string(tracker.jsonl_path.clone()).unwrap();
        let parsed: Vec<CostRecord> = raw
            .lines()
            .map(|line| serde_json::from_str(line).expect("parseable line"))
            .collect();
        assert_eq!(parsed.len(), 200);
    }
}
