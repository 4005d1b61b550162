//! Per-run artifact logging under `.runs/agents/<run_id>/`.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{SecondsFormat, Utc};
use serde_json::{json, Value};

use crate::runs_dir;

/// Writes a run's on-disk artifacts: one JSON event per line in
/// `logs.jsonl`, accumulated numeric metrics flushed to `metrics.json`, and
/// a final `summary.json`. Failures degrade to tracing warnings; artifact
/// writes must never abort a run.
pub struct RunLogger {
    run_id: String,
    agent_slug: String,
    dir: PathBuf,
    metrics: Mutex<BTreeMap<String, Value>>,
}

impl RunLogger {
    pub fn new(run_id: impl Into<String>, agent_slug: impl Into<String>) -> Self {
        let run_id = run_id.into();
        let dir = runs_dir().join("agents").join(&run_id);
        if let Err(err) = fs::create_dir_all(&dir) {
            tracing::warn!(run_id = %run_id, "cannot create run directory: {err}");
        }
        Self {
            run_id,
            agent_slug: agent_slug.into(),
            dir,
            metrics: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn agent_slug(&self) -> &str {
        &self.agent_slug
    }

    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    /// Append an event line to `logs.jsonl`.
    pub fn log(&self, event: &str, payload: Value) {
        let line = json!({
            "ts": Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            "run_id": self.run_id,
            "event": event,
            "payload": payload,
        });
        tracing::debug!(run_id = %self.run_id, event, "run event");
        if let Err(err) = self.append_line(&line) {
            tracing::warn!(run_id = %self.run_id, "cannot append run log: {err}");
        }
    }

    /// Record a named metric and flush the metrics file.
    pub fn metric(&self, name: &str, value: impl Into<Value>) {
        let snapshot = {
            let mut metrics = self.metrics.lock().expect("metrics lock poisoned");
            metrics.insert(name.to_string(), value.into());
            metrics.clone()
        };
        if let Err(err) = self.write_json("metrics.json", &json!(snapshot)) {
            tracing::warn!(run_id = %self.run_id, "cannot write metrics: {err}");
        }
    }

    pub fn metrics(&self) -> BTreeMap<String, Value> {
        self.metrics.lock().expect("metrics lock poisoned").clone()
    }

    /// Write the final `summary.json` for the run.
    pub fn write_summary(&self, summary: &Value) {
        if let Err(err) = self.write_json("summary.json", summary) {
            tracing::warn!(run_id = %self.run_id, "cannot write summary: {err}");
        }
    }

    fn append_line(&self, line: &Value) -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join("logs.jsonl"))?;
        file.write_all(line.to_string().as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()
    }

    fn write_json(&self, name: &str, value: &Value) -> std::io::Result<()> {
        let rendered = serde_json::to_string_pretty(value)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
        fs::write(self.dir.join(name), rendered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logger_writes_events_metrics_and_summary() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("MAGSAG_BASE_DIR", dir.path());
        let logger = RunLogger::new("run-log-test", "agent-a");
        std::env::remove_var("MAGSAG_BASE_DIR");

        logger.log("start", json!({"agent": "agent-a"}));
        logger.log("end", json!({"status": "success"}));
        logger.metric("latency_ms", 42);
        logger.write_summary(&json!({"run_id": "run-log-test", "deterministic": false}));

        let logs = fs::read_to_string(logger.dir().join("logs.jsonl")).unwrap();
        assert_eq!(logs.lines().count(), 2);
        let first: Value = serde_json::from_str(logs.lines().next().unwrap()).unwrap();
        assert_eq!(first["event"], json!("start"));

        let metrics: Value =
            serde_json::from_str(&fs::read_to_string(logger.dir().join("metrics.json")).unwrap())
                .unwrap();
        assert_eq!(metrics["latency_ms"], json!(42));

        let summary: Value =
            serde_json::from_str(&fs::read_to_string(logger.dir().join("summary.json")).unwrap())
                .unwrap();
        assert_eq!(summary["run_id"], json!("run-log-test"));
    }
}
