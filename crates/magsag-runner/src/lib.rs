//! The MAGSAG agent runner: invokes main agents and sub-agents with
//! governance hooks, durable checkpoints, retry policies, cost capture, and
//! deterministic replay.

mod agents;
pub mod determinism;
mod durable;
mod error;
mod hooks;
mod orchestrator;
mod runner;
mod skills;

pub use agents::{AgentRegistry, MainAgent, SagError, SubAgent};
pub use durable::{
    DurableRunner, FileSnapshotBackend, SnapshotBackend, SnapshotError, SnapshotStore,
    StorageSnapshotBackend,
};
pub use error::RunnerError;
pub use hooks::{execute_with_hooks, RunnerHooks, StorageProvider};
pub use orchestrator::{NoSuccessfulTasks, Orchestrator};
pub use runner::{AgentRunner, AgentRunnerBuilder, RetryPolicy};
pub use skills::{FanoutDecomposition, MergeAggregation, Skill, SkillRegistry};
