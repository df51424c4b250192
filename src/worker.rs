//! Worker and tool contracts, plus the registry the router draws
//! candidates from.
//!
//! Workers execute plan steps by invoking the named tool; their business
//! logic is opaque to the core. The registry remembers registration order
//! (round-robin and tie-breaking depend on it) and tracks in-flight counts
//! for load-balanced routing.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::{json, Value};
use tracing::info;

use crate::context::ExecutionContext;
use crate::error::WorkerError;
use crate::planning::PlanStep;

/// A business tool: structured input in, structured result or classified
/// failure out. Implementations live outside the core.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn domain(&self) -> &str;
    async fn invoke(&self, input: Value, ctx: &ExecutionContext) -> Result<Value, WorkerError>;
}

/// Executes one plan step by running the named tool. Every call is wrapped
/// by the coordinator's retry policy.
#[async_trait]
pub trait Worker: Send + Sync {
    fn name(&self) -> &str;
    fn capabilities(&self) -> Vec<String>;
    async fn execute(&self, step: &PlanStep, ctx: &ExecutionContext) -> Result<Value, WorkerError>;
}

/// Candidate snapshot handed to the routing authority.
#[derive(Debug, Clone)]
pub struct WorkerInfo {
    pub name: String,
    pub capabilities: Vec<String>,
    pub in_flight: usize,
    pub registration_index: usize,
}

/// Worker roster. Registration order is stable and significant.
pub struct WorkerRegistry {
    workers: RwLock<Vec<Arc<dyn Worker>>>,
    in_flight: DashMap<String, usize>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self {
            workers: RwLock::new(Vec::new()),
            in_flight: DashMap::new(),
        }
    }

    /// Register a worker. Re-registering a name replaces the worker in
    /// place, keeping its position in the roster.
    pub fn register(&self, worker: Arc<dyn Worker>) {
        let name = worker.name().to_string();
        let mut workers = self.workers.write();
        if let Some(slot) = workers.iter_mut().find(|w| w.name() == name) {
            *slot = worker;
        } else {
            workers.push(worker);
        }
        self.in_flight.entry(name.clone()).or_insert(0);
        info!("Registered worker '{}'", name);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Worker>> {
        self.workers.read().iter().find(|w| w.name() == name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.workers.read().iter().map(|w| w.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.workers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.read().is_empty()
    }

    /// Snapshot of all candidates in registration order.
    pub fn snapshot(&self) -> Vec<WorkerInfo> {
        self.workers
            .read()
            .iter()
            .enumerate()
            .map(|(index, w)| WorkerInfo {
                name: w.name().to_string(),
                capabilities: w.capabilities(),
                in_flight: self
                    .in_flight
                    .get(w.name())
                    .map(|entry| *entry.value())
                    .unwrap_or(0),
                registration_index: index,
            })
            .collect()
    }

    /// Mark a dispatch in flight for load accounting.
    pub fn checkout(&self, name: &str) {
        *self.in_flight.entry(name.to_string()).or_insert(0) += 1;
    }

    pub fn checkin(&self, name: &str) {
        if let Some(mut entry) = self.in_flight.get_mut(name) {
            *entry = entry.saturating_sub(1);
        }
    }
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Worker backed by a set of tools. Executes a step by looking up the
/// step's named tool; the tool lookup failing is a permanent, non-transient
/// failure.
pub struct ToolkitWorker {
    name: String,
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolkitWorker {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tools: Vec::new(),
        }
    }

    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }
}

#[async_trait]
impl Worker for ToolkitWorker {
    fn name(&self) -> &str {
        &self.name
    }

    /// A toolkit worker is capable of exactly the tools it carries.
    fn capabilities(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name().to_string()).collect()
    }

    async fn execute(&self, step: &PlanStep, ctx: &ExecutionContext) -> Result<Value, WorkerError> {
        let tool = self
            .tools
            .iter()
            .find(|t| t.name() == step.tool)
            .ok_or_else(|| WorkerError::InvalidInput {
                tool: step.tool.clone(),
                message: format!("worker '{}' carries no such tool", self.name),
            })?;
        tool.invoke(step.input.clone(), ctx).await
    }
}

/// Built-in worker that echoes the step input back. Useful for wiring
/// checks and job-file smoke runs.
pub struct EchoWorker;

#[async_trait]
impl Worker for EchoWorker {
    fn name(&self) -> &str {
        "echo"
    }

    fn capabilities(&self) -> Vec<String> {
        vec!["echo".to_string(), "testing".to_string()]
    }

    async fn execute(&self, step: &PlanStep, ctx: &ExecutionContext) -> Result<Value, WorkerError> {
        Ok(json!({
            "tool": step.tool,
            "echoed": step.input,
            "trace_id": ctx.trace_id(),
        }))
    }
}
