// SQLite-backed memory store. One connection guarded by an async mutex,
// WAL journal, schema created on open.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use thiserror::Error;
use tokio::sync::Mutex;

use magsag_types::{MemoryEntry, MemoryScope, ValidationError};

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

pub struct MemoryStore {
    conn: Arc<Mutex<Connection>>,
}

fn to_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, MemoryError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| MemoryError::Validation(ValidationError::new(format!("bad timestamp: {err}"))))
}

impl MemoryStore {
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self, MemoryError> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|err| {
                    MemoryError::Validation(ValidationError::new(format!(
                        "cannot create memory dir: {err}"
                    )))
                })?;
            }
        }
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(Duration::from_secs(10))?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        conn.execute("PRAGMA synchronous = NORMAL", [])?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS memory_entries (
                memory_id TEXT PRIMARY KEY,
                scope TEXT NOT NULL,
                agent_slug TEXT NOT NULL,
                run_id TEXT,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                expires_at TEXT,
                pii_tags TEXT NOT NULL DEFAULT '[]',
                retention_policy TEXT,
                tags TEXT NOT NULL DEFAULT '[]',
                metadata TEXT NOT NULL DEFAULT '{}',
                embedding TEXT
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_memory_lookup
             ON memory_entries(scope, agent_slug, key)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_memory_run ON memory_entries(run_id)",
            [],
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Insert or replace an entry. Session-scoped entries must carry a
    /// `run_id`; entries without an explicit TTL get their scope's default.
    pub async fn save(&self, entry: &MemoryEntry) -> Result<MemoryEntry, MemoryError> {
        if entry.scope == MemoryScope::Session && entry.run_id.is_none() {
            return Err(ValidationError::new(
                "run_id is required for session-scoped memories",
            )
            .into());
        }

        let mut stored = entry.clone();
        if stored.expires_at.is_none() {
            stored.expires_at = Some(stored.created_at + stored.scope.default_ttl());
        }

        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO memory_entries
             (memory_id, scope, agent_slug, run_id, key, value, created_at, updated_at,
              expires_at, pii_tags, retention_policy, tags, metadata, embedding)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                stored.memory_id,
                stored.scope.as_str(),
                stored.agent_slug,
                stored.run_id,
                stored.key,
                serde_json::to_string(&stored.value)?,
                to_ts(stored.created_at),
                to_ts(stored.updated_at),
                stored.expires_at.map(to_ts),
                serde_json::to_string(&stored.pii_tags)?,
                stored.retention_policy,
                serde_json::to_string(&stored.tags)?,
                serde_json::to_string(&stored.metadata)?,
                stored
                    .embedding
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
            ],
        )?;
        Ok(stored)
    }

    pub async fn get(&self, memory_id: &str) -> Result<Option<MemoryEntry>, MemoryError> {
        let conn = self.conn.lock().await;
        let raw = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM memory_entries WHERE memory_id = ?1"),
                params![memory_id],
                row_tuple,
            )
            .optional()?;
        raw.map(decode).transpose()
    }

    /// Most recently updated entry for a logical key within a scope.
    pub async fn find(
        &self,
        scope: MemoryScope,
        agent_slug: &str,
        run_id: Option<&str>,
        key: &str,
    ) -> Result<Option<MemoryEntry>, MemoryError> {
        let conn = self.conn.lock().await;
        let raw = match run_id {
            Some(run_id) => conn
                .query_row(
                    &format!(
                        "SELECT {COLUMNS} FROM memory_entries
                         WHERE scope = ?1 AND agent_slug = ?2 AND run_id = ?3 AND key = ?4
                         ORDER BY updated_at DESC LIMIT 1"
                    ),
                    params![scope.as_str(), agent_slug, run_id, key],
                    row_tuple,
                )
                .optional()?,
            None => conn
                .query_row(
                    &format!(
                        "SELECT {COLUMNS} FROM memory_entries
                         WHERE scope = ?1 AND agent_slug = ?2 AND key = ?3
                         ORDER BY updated_at DESC LIMIT 1"
                    ),
                    params![scope.as_str(), agent_slug, key],
                    row_tuple,
                )
                .optional()?,
        };
        raw.map(decode).transpose()
    }

    /// Entries for a run, oldest first.
    pub async fn list_for_run(&self, run_id: &str) -> Result<Vec<MemoryEntry>, MemoryError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM memory_entries WHERE run_id = ?1 ORDER BY created_at ASC"
        ))?;
        let rows = stmt.query_map(params![run_id], row_tuple)?;
        let mut entries = Vec::new();
        for raw in rows {
            entries.push(decode(raw?)?);
        }
        Ok(entries)
    }

    pub async fn delete(&self, memory_id: &str) -> Result<bool, MemoryError> {
        let conn = self.conn.lock().await;
        let deleted = conn.execute(
            "DELETE FROM memory_entries WHERE memory_id = ?1",
            params![memory_id],
        )?;
        Ok(deleted > 0)
    }

    /// Delete entries whose TTL has passed; returns the count.
    pub async fn purge_expired(&self) -> Result<u64, MemoryError> {
        let conn = self.conn.lock().await;
        let purged = conn.execute(
            "DELETE FROM memory_entries WHERE expires_at IS NOT NULL AND expires_at <= ?1",
            params![to_ts(Utc::now())],
        )?;
        if purged > 0 {
            tracing::info!(count = purged, "purged expired memory entries");
        }
        Ok(purged as u64)
    }
}

const COLUMNS: &str = "memory_id, scope, agent_slug, run_id, key, value, created_at, \
     updated_at, expires_at, pii_tags, retention_policy, tags, metadata, embedding";

#[allow(clippy::type_complexity)]
fn row_tuple(
    row: &Row<'_>,
) -> rusqlite::Result<(
    String,
    String,
    String,
    Option<String>,
    String,
    String,
    String,
    String,
    Option<String>,
    String,
    Option<String>,
    String,
    String,
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
    ))
}

#[allow(clippy::type_complexity)]
fn decode(
    raw: (
        String,
        String,
        String,
        Option<String>,
        String,
        String,
        String,
        String,
        Option<String>,
        String,
        Option<String>,
        String,
        String,
        Option<String>,
    ),
) -> Result<MemoryEntry, MemoryError> {
    let (
        memory_id,
        scope,
        agent_slug,
        run_id,
        key,
        value,
        created_at,
        updated_at,
        expires_at,
        pii_tags,
        retention_policy,
        tags,
        metadata,
        embedding,
    ) = raw;
    let scope = MemoryScope::parse(&scope)
        .ok_or_else(|| MemoryError::Validation(ValidationError::new(format!("bad scope {scope:?}"))))?;
    Ok(MemoryEntry {
        memory_id,
        scope,
        agent_slug,
        run_id,
        key,
        value: serde_json::from_str(&value)?,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
        expires_at: expires_at.as_deref().map(parse_ts).transpose()?,
        pii_tags: serde_json::from_str(&pii_tags)?,
        retention_policy,
        tags: serde_json::from_str(&tags)?,
        metadata: serde_json::from_str(&metadata)?,
        embedding: embedding
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use magsag_types::PiiTag;
    use serde_json::json;

    async fn temp_store() -> (tempfile::TempDir, MemoryStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = MemoryStore::new(dir.path().join("memory.db"))
            .await
            .expect("open store");
        (dir, store)
    }

    #[tokio::test]
    async fn save_and_find_session_entry() {
        let (_dir, store) = temp_store().await;
        let entry = MemoryEntry::new(
            MemoryScope::Session,
            "agent-a",
            "input",
            json!({"payload": {"id": 1}}),
            Some("run-1".to_string()),
        )
        .unwrap();
        let stored = store.save(&entry).await.unwrap();
        // Default TTL applied (session: one hour).
        assert!(stored.expires_at.is_some());

        let found = store
            .find(MemoryScope::Session, "agent-a", Some("run-1"), "input")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.value["payload"]["id"], json!(1));
        assert_eq!(found.run_id.as_deref(), Some("run-1"));
    }

    #[tokio::test]
    async fn session_without_run_id_is_rejected() {
        let (_dir, store) = temp_store().await;
        let mut entry = MemoryEntry::new(
            MemoryScope::Session,
            "agent-a",
            "k",
            json!(1),
            Some("run-1".to_string()),
        )
        .unwrap();
        entry.run_id = None;
        assert!(matches!(
            store.save(&entry).await.unwrap_err(),
            MemoryError::Validation(_)
        ));
    }

    #[tokio::test]
    async fn pii_tags_roundtrip() {
        let (_dir, store) = temp_store().await;
        let mut entry =
            MemoryEntry::new(MemoryScope::Org, "agent-a", "contact", json!({}), None).unwrap();
        entry.pii_tags = vec![PiiTag::Email, PiiTag::Phone];
        store.save(&entry).await.unwrap();

        let found = store.get(&entry.memory_id).await.unwrap().unwrap();
        assert_eq!(found.pii_tags, vec![PiiTag::Email, PiiTag::Phone]);
    }

    #[tokio::test]
    async fn purge_removes_only_expired() {
        let (_dir, store) = temp_store().await;
        let expired = MemoryEntry::new(MemoryScope::Org, "a", "old", json!(1), None)
            .unwrap()
            .with_ttl(chrono::Duration::seconds(-10));
        let fresh = MemoryEntry::new(MemoryScope::Org, "a", "new", json!(2), None).unwrap();
        store.save(&expired).await.unwrap();
        store.save(&fresh).await.unwrap();

        assert_eq!(store.purge_expired().await.unwrap(), 1);
        assert!(store.get(&expired.memory_id).await.unwrap().is_none());
        assert!(store.get(&fresh.memory_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn list_for_run_is_oldest_first() {
        let (_dir, store) = temp_store().await;
        let mut first = MemoryEntry::new(
            MemoryScope::Session,
            "agent-a",
            "input",
            json!(1),
            Some("run-9".to_string()),
        )
        .unwrap();
        first.created_at = Utc::now() - chrono::Duration::seconds(10);
        let second = MemoryEntry::new(
            MemoryScope::Session,
            "agent-a",
            "output",
            json!(2),
            Some("run-9".to_string()),
        )
        .unwrap();
        store.save(&first).await.unwrap();
        store.save(&second).await.unwrap();

        let entries = store.list_for_run("run-9").await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].key, "input");
        assert_eq!(entries[1].key, "output");
    }
}
