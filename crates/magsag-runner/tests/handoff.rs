//! Governed handoff into the native adapter: delegation lands in the agent
//! runner with the parent run and handoff id threaded through the context.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};

use magsag_governance::{PermissionEvaluator, PermissionPolicy};
use magsag_observability::RunLogger;
use magsag_routing::{HandoffTool, NativeHandoffAdapter};
use magsag_runner::{AgentRegistry, AgentRunner, MainAgent};
use magsag_storage::{SqliteStorageBackend, StorageBackend};
use magsag_types::{AgentDescriptor, ExecutionContext, Platform};

fn init_base_dir() {
    use once_cell::sync::Lazy;
    static BASE: Lazy<tempfile::TempDir> = Lazy::new(|| {
        let dir = tempfile::tempdir().expect("tempdir");
        std::env::set_var("MAGSAG_BASE_DIR", dir.path());
        dir
    });
    Lazy::force(&BASE);
}

/// Echoes the execution context it received so the test can assert on it.
struct ContextEcho;

#[async_trait]
impl MainAgent for ContextEcho {
    async fn run(
        &self,
        payload: Value,
        context: &ExecutionContext,
        _runner: &AgentRunner,
        _obs: &RunLogger,
    ) -> anyhow::Result<Value> {
        Ok(json!({
            "payload": payload,
            "run_id": context.run_id,
            "parent_run_id": context.parent_run_id,
            "handoff_id": context.handoff_id,
            "trace_id": context.extra.get("trace_id"),
        }))
    }
}

#[tokio::test]
async fn handoff_reaches_native_adapter_with_threaded_context() {
    init_base_dir();
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(
        SqliteStorageBackend::new(dir.path().join("state.db"))
            .await
            .unwrap(),
    );

    let mut registry = AgentRegistry::new();
    registry.register_descriptor(
        AgentDescriptor::from_yaml_str("slug: secondary\nrole: main\nentrypoint: echo\n").unwrap(),
    );
    registry.register_main("echo", Arc::new(ContextEcho));

    let runner = Arc::new(
        AgentRunner::builder()
            .registry(registry)
            .storage(Arc::clone(&storage) as Arc<dyn StorageBackend>)
            .build(),
    );

    let evaluator = Arc::new(PermissionEvaluator::new(
        PermissionPolicy::from_yaml_str("default_permission: ALWAYS\n").unwrap(),
        Some("production".to_string()),
    ));
    let tool = HandoffTool::new()
        .with_evaluator(evaluator)
        .with_storage(Arc::clone(&storage) as Arc<dyn StorageBackend>)
        .register_adapter(Arc::new(NativeHandoffAdapter::new(
            Arc::clone(&runner) as Arc<dyn magsag_routing::MagInvoker>
        )));

    let result = tool
        .handoff(
            "primary",
            "secondary",
            "analyze the record",
            Some(json!({"id": "X"})),
            BTreeMap::from([("trace_id".to_string(), json!("T"))]),
            Platform::Magsag,
            Some("run-parent"),
        )
        .await
        .unwrap();

    assert_eq!(result["status"], json!("completed"));
    let handoff_id = result["handoff_id"].as_str().unwrap();

    let output = &result["result"]["output"];
    assert_eq!(output["payload"]["id"], json!("X"));
    assert_eq!(output["parent_run_id"], json!("run-parent"));
    assert_eq!(output["handoff_id"], json!(handoff_id));
    assert_eq!(output["trace_id"], json!("T"));

    // The delegated MAG got its own run row.
    let child_run_id = output["run_id"].as_str().unwrap();
    assert!(child_run_id.starts_with("mag-"));
    let child_run = storage.get_run(child_run_id).await.unwrap().unwrap();
    assert_eq!(child_run.agent_slug, "secondary");

    // Handoff lifecycle events were persisted on the parent run.
    let events: Vec<_> = storage
        .get_events("run-parent")
        .await
        .unwrap()
        .collect()
        .await;
    let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
    assert!(types.contains(&"handoff.requested"));
    assert!(types.contains(&"handoff.completed"));
    let completed = events
        .iter()
        .find(|e| e.event_type == "handoff.completed")
        .unwrap();
    assert_eq!(completed.payload["handoff_id"], json!(handoff_id));
}
