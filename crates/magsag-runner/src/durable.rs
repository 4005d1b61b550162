//! Durable checkpoints: the snapshot store, its storage-backed and
//! file-based backends, and the durable runner wrapper.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use magsag_observability::base_dir;
use magsag_storage::{StorageBackend, StorageError};
use magsag_types::RunSnapshot;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Snapshot CRUD contract. Any backend satisfying the `(run_id, step_id)`
/// idempotency invariant plugs into the store; the file fallback is an
/// implementation of this trait, not a conditional branch inside the store.
#[async_trait]
pub trait SnapshotBackend: Send + Sync {
    async fn upsert(&self, snapshot: &RunSnapshot) -> Result<RunSnapshot, SnapshotError>;

    async fn get(&self, run_id: &str, step_id: &str) -> Result<Option<RunSnapshot>, SnapshotError>;

    async fn latest(&self, run_id: &str) -> Result<Option<RunSnapshot>, SnapshotError>;

    async fn list(&self, run_id: &str) -> Result<Vec<RunSnapshot>, SnapshotError>;

    async fn delete_all(&self, run_id: &str) -> Result<u64, SnapshotError>;
}

/// Backend delegating to the shared storage backend. Run rows are created
/// lazily by the storage layer for snapshot-initiated runs.
pub struct StorageSnapshotBackend {
    storage: Arc<dyn StorageBackend>,
}

impl StorageSnapshotBackend {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl SnapshotBackend for StorageSnapshotBackend {
    async fn upsert(&self, snapshot: &RunSnapshot) -> Result<RunSnapshot, SnapshotError> {
        Ok(self.storage.upsert_run_snapshot(snapshot).await?)
    }

    async fn get(&self, run_id: &str, step_id: &str) -> Result<Option<RunSnapshot>, SnapshotError> {
        Ok(self.storage.get_run_snapshot(run_id, step_id).await?)
    }

    async fn latest(&self, run_id: &str) -> Result<Option<RunSnapshot>, SnapshotError> {
        Ok(self.storage.get_latest_run_snapshot(run_id).await?)
    }

    async fn list(&self, run_id: &str) -> Result<Vec<RunSnapshot>, SnapshotError> {
        Ok(self.storage.list_run_snapshots(run_id).await?)
    }

    async fn delete_all(&self, run_id: &str) -> Result<u64, SnapshotError> {
        Ok(self.storage.delete_run_snapshots(run_id).await?)
    }
}

/// File-based fallback: one JSON document per step under
/// `.magsag/snapshots/<run_id>/<step_id>.json`.
pub struct FileSnapshotBackend {
    root: PathBuf,
}

impl FileSnapshotBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Rooted at `<base_dir>/.magsag/snapshots`.
    pub fn with_default_root() -> Self {
        Self::new(base_dir().join(".magsag").join("snapshots"))
    }

    fn step_path(&self, run_id: &str, step_id: &str) -> PathBuf {
        self.root.join(run_id).join(format!("{step_id}.json"))
    }

    fn read_snapshot(path: &std::path::Path) -> Result<Option<RunSnapshot>, SnapshotError> {
        match std::fs::read_to_string(path) {
            Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl SnapshotBackend for FileSnapshotBackend {
    async fn upsert(&self, snapshot: &RunSnapshot) -> Result<RunSnapshot, SnapshotError> {
        let path = self.step_path(&snapshot.run_id, &snapshot.step_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // An existing step keeps its identity; only state and metadata move.
        let stored = match Self::read_snapshot(&path)? {
            Some(existing) => RunSnapshot {
                snapshot_id: existing.snapshot_id,
                created_at: existing.created_at,
                ..snapshot.clone()
            },
            None => snapshot.clone(),
        };
        std::fs::write(&path, serde_json::to_string_pretty(&stored)?)?;
        Ok(stored)
    }

    async fn get(&self, run_id: &str, step_id: &str) -> Result<Option<RunSnapshot>, SnapshotError> {
        Self::read_snapshot(&self.step_path(run_id, step_id))
    }

    async fn latest(&self, run_id: &str) -> Result<Option<RunSnapshot>, SnapshotError> {
        Ok(self
            .list(run_id)
            .await?
            .into_iter()
            .max_by_key(|snapshot| snapshot.created_at))
    }

    async fn list(&self, run_id: &str) -> Result<Vec<RunSnapshot>, SnapshotError> {
        let dir = self.root.join(run_id);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut snapshots = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(snapshot) = Self::read_snapshot(&path)? {
                snapshots.push(snapshot);
            }
        }
        snapshots.sort_by_key(|snapshot| snapshot.created_at);
        Ok(snapshots)
    }

    async fn delete_all(&self, run_id: &str) -> Result<u64, SnapshotError> {
        let count = self.list(run_id).await?.len() as u64;
        let dir = self.root.join(run_id);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(count),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(err) => Err(err.into()),
        }
    }
}

/// Snapshot store over any backend. Writes are idempotent by
/// `(run_id, step_id)`.
pub struct SnapshotStore {
    backend: Arc<dyn SnapshotBackend>,
}

impl SnapshotStore {
    pub fn new(backend: Arc<dyn SnapshotBackend>) -> Self {
        Self { backend }
    }

    /// Store falling back to per-step JSON files when no storage backend is
    /// configured.
    pub fn with_file_fallback() -> Self {
        Self::new(Arc::new(FileSnapshotBackend::with_default_root()))
    }

    pub async fn save_snapshot(
        &self,
        run_id: &str,
        step_id: &str,
        state: BTreeMap<String, Value>,
        metadata: BTreeMap<String, Value>,
    ) -> Result<RunSnapshot, SnapshotError> {
        let snapshot = RunSnapshot {
            snapshot_id: Uuid::new_v4().to_string(),
            run_id: run_id.to_string(),
            step_id: step_id.to_string(),
            state,
            metadata,
            created_at: Utc::now(),
        };
        let stored = self.backend.upsert(&snapshot).await?;
        tracing::info!(
            snapshot = %stored.snapshot_id,
            run = run_id,
            step = step_id,
            "snapshot saved"
        );
        Ok(stored)
    }

    pub async fn get_latest_snapshot(
        &self,
        run_id: &str,
    ) -> Result<Option<RunSnapshot>, SnapshotError> {
        self.backend.latest(run_id).await
    }

    pub async fn get_snapshot_by_step(
        &self,
        run_id: &str,
        step_id: &str,
    ) -> Result<Option<RunSnapshot>, SnapshotError> {
        self.backend.get(run_id, step_id).await
    }

    pub async fn list_snapshots(&self, run_id: &str) -> Result<Vec<RunSnapshot>, SnapshotError> {
        self.backend.list(run_id).await
    }

    pub async fn delete_snapshots(&self, run_id: &str) -> Result<u64, SnapshotError> {
        self.backend.delete_all(run_id).await
    }
}

/// Step-level checkpoint/resume wrapper used by resumable runs.
pub struct DurableRunner {
    store: SnapshotStore,
}

impl DurableRunner {
    pub fn new(store: SnapshotStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    pub async fn checkpoint(
        &self,
        run_id: &str,
        step_id: &str,
        state: BTreeMap<String, Value>,
        metadata: BTreeMap<String, Value>,
    ) -> Result<RunSnapshot, SnapshotError> {
        self.store
            .save_snapshot(run_id, step_id, state, metadata)
            .await
    }

    /// Restore the state mapping from a specific step, or from the latest
    /// snapshot when `from_step` is absent. `None` means nothing to resume.
    pub async fn resume(
        &self,
        run_id: &str,
        from_step: Option<&str>,
    ) -> Result<Option<BTreeMap<String, Value>>, SnapshotError> {
        let snapshot = match from_step {
            Some(step_id) => self.store.get_snapshot_by_step(run_id, step_id).await?,
            None => self.store.get_latest_snapshot(run_id).await?,
        };
        match snapshot {
            Some(snapshot) => {
                tracing::info!(
                    run = run_id,
                    step = %snapshot.step_id,
                    "restored state from snapshot"
                );
                Ok(Some(snapshot.state))
            }
            None => {
                tracing::warn!(run = run_id, "no snapshot found");
                Ok(None)
            }
        }
    }

    pub async fn list_checkpoints(&self, run_id: &str) -> Result<Vec<RunSnapshot>, SnapshotError> {
        self.store.list_snapshots(run_id).await
    }

    pub async fn cleanup(&self, run_id: &str) -> Result<u64, SnapshotError> {
        self.store.delete_snapshots(run_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn file_backend_is_idempotent_per_step() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(Arc::new(FileSnapshotBackend::new(dir.path())));

        let first = store
            .save_snapshot("run-1", "step-1", state(&[("v", json!(1))]), BTreeMap::new())
            .await
            .unwrap();
        let second = store
            .save_snapshot("run-1", "step-1", state(&[("v", json!(2))]), BTreeMap::new())
            .await
            .unwrap();

        assert_eq!(first.snapshot_id, second.snapshot_id);
        let latest = store.get_latest_snapshot("run-1").await.unwrap().unwrap();
        assert_eq!(latest.state["v"], json!(2));
        assert_eq!(store.list_snapshots("run-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn file_backend_lists_oldest_first_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let runner = DurableRunner::new(SnapshotStore::new(Arc::new(FileSnapshotBackend::new(
            dir.path(),
        ))));

        runner
            .checkpoint("run-1", "init", state(&[("step", json!("init"))]), BTreeMap::new())
            .await
            .unwrap();
        runner
            .checkpoint(
                "run-1",
                "process",
                state(&[("step", json!("process"))]),
                BTreeMap::new(),
            )
            .await
            .unwrap();

        let checkpoints = runner.list_checkpoints("run-1").await.unwrap();
        assert_eq!(checkpoints.len(), 2);
        assert_eq!(checkpoints[0].step_id, "init");

        let resumed = runner.resume("run-1", None).await.unwrap().unwrap();
        assert_eq!(resumed["step"], json!("process"));
        let by_step = runner.resume("run-1", Some("init")).await.unwrap().unwrap();
        assert_eq!(by_step["step"], json!("init"));

        assert_eq!(runner.cleanup("run-1").await.unwrap(), 2);
        assert!(runner.resume("run-1", None).await.unwrap().is_none());
    }
}
