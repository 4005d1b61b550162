//! Agent traits and the explicit registry resolving catalog descriptors to
//! registered implementations.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use magsag_observability::RunLogger;
use magsag_types::{AgentDescriptor, AgentRole, Delegation, ExecutionContext, ValidationError};

use crate::runner::AgentRunner;

/// Sub-agent failure classification. Transient failures are retried by the
/// runner's retry policy; permanent ones are not.
#[derive(Debug, Error)]
pub enum SagError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("{0}")]
    Permanent(String),
}

impl SagError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SagError::Transient(_))
    }
}

/// A main agent: decomposes work, delegates through the runner, aggregates.
#[async_trait]
pub trait MainAgent: Send + Sync {
    async fn run(
        &self,
        payload: Value,
        context: &ExecutionContext,
        runner: &AgentRunner,
        obs: &RunLogger,
    ) -> anyhow::Result<Value>;
}

/// A specialist invoked through a [`Delegation`].
#[async_trait]
pub trait SubAgent: Send + Sync {
    async fn execute(&self, delegation: &Delegation) -> Result<Value, SagError>;
}

/// Catalog descriptors plus the implementations their entrypoints name.
/// Registration is explicit; an unknown entrypoint is a resolution error,
/// never a reflective lookup.
#[derive(Default)]
pub struct AgentRegistry {
    descriptors: HashMap<String, AgentDescriptor>,
    mains: HashMap<String, Arc<dyn MainAgent>>,
    subs: HashMap<String, Arc<dyn SubAgent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_descriptor(&mut self, descriptor: AgentDescriptor) {
        self.descriptors.insert(descriptor.slug.clone(), descriptor);
    }

    /// Load every `*.yaml` descriptor under a catalog directory.
    pub fn load_catalog_dir(&mut self, dir: &Path) -> Result<usize, ValidationError> {
        let entries = std::fs::read_dir(dir)
            .map_err(|err| ValidationError::new(format!("cannot read {}: {err}", dir.display())))?;
        let mut loaded = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
                continue;
            }
            self.register_descriptor(AgentDescriptor::from_yaml_file(&path)?);
            loaded += 1;
        }
        Ok(loaded)
    }

    pub fn register_main(&mut self, entrypoint: impl Into<String>, agent: Arc<dyn MainAgent>) {
        self.mains.insert(entrypoint.into(), agent);
    }

    pub fn register_sub(&mut self, entrypoint: impl Into<String>, agent: Arc<dyn SubAgent>) {
        self.subs.insert(entrypoint.into(), agent);
    }

    pub fn descriptor(&self, slug: &str) -> Option<&AgentDescriptor> {
        self.descriptors.get(slug)
    }

    pub fn resolve_main(&self, slug: &str) -> Option<(&AgentDescriptor, Arc<dyn MainAgent>)> {
        let descriptor = self.descriptors.get(slug)?;
        if descriptor.role != AgentRole::Main {
            return None;
        }
        let agent = self.mains.get(&descriptor.entrypoint)?;
        Some((descriptor, Arc::clone(agent)))
    }

    pub fn resolve_sub(&self, slug: &str) -> Option<(&AgentDescriptor, Arc<dyn SubAgent>)> {
        let descriptor = self.descriptors.get(slug)?;
        if descriptor.role != AgentRole::Sub {
            return None;
        }
        let agent = self.subs.get(&descriptor.entrypoint)?;
        Some((descriptor, Arc::clone(agent)))
    }
}
