//! Planner contract: turns a goal into an ordered step list.
//!
//! The real planner lives outside the core and is treated as opaque. The
//! fixed implementation here covers callers that already know their steps.

use anyhow::Result;
use async_trait::async_trait;

use crate::context::ExecutionContext;
use crate::planning::PlanStep;

#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, goal: &str, ctx: &ExecutionContext) -> Result<Vec<PlanStep>>;
}

/// Returns a pre-built step list for every goal.
pub struct FixedPlanner {
    steps: Vec<PlanStep>,
}

impl FixedPlanner {
    pub fn new(steps: Vec<PlanStep>) -> Self {
        Self { steps }
    }
}

#[async_trait]
impl Planner for FixedPlanner {
    async fn plan(&self, _goal: &str, _ctx: &ExecutionContext) -> Result<Vec<PlanStep>> {
        Ok(self.steps.clone())
    }
}
