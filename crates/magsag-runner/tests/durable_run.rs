//! Restart resilience: a multi-step run checkpoints after every step,
//! aborts midway, and resumes from the last snapshot.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Value};

use magsag_runner::{DurableRunner, SnapshotStore, StorageSnapshotBackend};
use magsag_storage::{SqliteStorageBackend, StorageBackend};

const STEPS: [&str; 4] = ["init", "process", "validate", "finalize"];

fn state(completed: &[&str]) -> BTreeMap<String, Value> {
    BTreeMap::from([
        ("completed".to_string(), json!(completed)),
        (
            "last_step".to_string(),
            json!(completed.last().copied().unwrap_or_default()),
        ),
    ])
}

async fn durable_runner(dir: &tempfile::TempDir) -> (DurableRunner, Arc<SqliteStorageBackend>) {
    let storage = Arc::new(
        SqliteStorageBackend::new(dir.path().join("state.db"))
            .await
            .unwrap(),
    );
    let backend = StorageSnapshotBackend::new(Arc::clone(&storage) as Arc<dyn StorageBackend>);
    (
        DurableRunner::new(SnapshotStore::new(Arc::new(backend))),
        storage,
    )
}

#[tokio::test]
async fn aborted_run_resumes_from_last_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let (runner, storage) = durable_runner(&dir).await;
    let run_id = "run-durable-1";

    // First attempt executes init and process, checkpointing each, then
    // aborts before validate.
    let mut completed: Vec<&str> = Vec::new();
    for step in &STEPS[..2] {
        completed.push(step);
        runner
            .checkpoint(
                run_id,
                step,
                state(&completed),
                BTreeMap::from([("agent_slug".to_string(), json!("durable-agent"))]),
            )
            .await
            .unwrap();
    }

    // A fresh runner over the same storage resumes where the first left off.
    let (resumed_runner, _) = {
        let storage = Arc::clone(&storage);
        let backend = StorageSnapshotBackend::new(storage as Arc<dyn StorageBackend>);
        (
            DurableRunner::new(SnapshotStore::new(Arc::new(backend))),
            (),
        )
    };
    let restored = resumed_runner.resume(run_id, None).await.unwrap().unwrap();
    assert_eq!(restored["last_step"], json!("process"));
    assert_eq!(restored["completed"], json!(["init", "process"]));

    // Re-run from step 3 onward using the restored state.
    let mut completed: Vec<String> = restored["completed"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect();
    for step in &STEPS[2..] {
        completed.push(step.to_string());
        let refs: Vec<&str> = completed.iter().map(String::as_str).collect();
        resumed_runner
            .checkpoint(run_id, step, state(&refs), BTreeMap::new())
            .await
            .unwrap();
    }

    let final_state = resumed_runner.resume(run_id, None).await.unwrap().unwrap();
    assert_eq!(
        final_state["completed"],
        json!(["init", "process", "validate", "finalize"])
    );

    let checkpoints = resumed_runner.list_checkpoints(run_id).await.unwrap();
    assert_eq!(checkpoints.len(), 4);

    // The snapshot-initiated run row exists with the slug from metadata.
    let run = storage.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.agent_slug, "durable-agent");
}

#[tokio::test]
async fn resume_by_step_and_reexecution_idempotency() {
    let dir = tempfile::tempdir().unwrap();
    let (runner, _storage) = durable_runner(&dir).await;
    let run_id = "run-durable-2";

    runner
        .checkpoint(run_id, "init", state(&["init"]), BTreeMap::new())
        .await
        .unwrap();
    let first = runner
        .checkpoint(
            run_id,
            "process",
            BTreeMap::from([("value".to_string(), json!(1))]),
            BTreeMap::new(),
        )
        .await
        .unwrap();

    // Re-executing the same step overwrites state but keeps identity.
    let second = runner
        .checkpoint(
            run_id,
            "process",
            BTreeMap::from([("value".to_string(), json!(2))]),
            BTreeMap::new(),
        )
        .await
        .unwrap();
    assert_eq!(first.snapshot_id, second.snapshot_id);

    let by_step = runner
        .resume(run_id, Some("process"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(by_step["value"], json!(2));

    let by_init = runner.resume(run_id, Some("init")).await.unwrap().unwrap();
    assert_eq!(by_init["last_step"], json!("init"));

    assert_eq!(runner.cleanup(run_id).await.unwrap(), 2);
    assert!(runner.resume(run_id, None).await.unwrap().is_none());
}
