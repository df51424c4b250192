//! Error taxonomy for the orchestration core.
//!
//! Every failure that crosses a component boundary is one of the typed
//! variants below; nothing surfaces as an unclassified error. Audit-trail
//! failures never appear here at all; the trail swallows them (see
//! `audit`).

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::coordinator::LifecycleStage;
use crate::planning::PlanStage;

/// Top-level orchestration error, scoped to the lifecycle stage it occurred in.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// An in-stage failure. `recoverable` tells the caller whether retrying
    /// the whole orchestration could help.
    #[error("{stage} stage failed for trace {trace_id}: {message}")]
    Stage {
        stage: LifecycleStage,
        message: String,
        trace_id: String,
        recoverable: bool,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error(transparent)]
    Budget(#[from] BudgetViolation),

    #[error(transparent)]
    Gate(#[from] GateError),

    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error(transparent)]
    Plan(#[from] PlanError),
}

impl OrchestratorError {
    pub fn stage(
        stage: LifecycleStage,
        trace_id: impl Into<String>,
        message: impl Into<String>,
        recoverable: bool,
    ) -> Self {
        Self::Stage {
            stage,
            message: message.into(),
            trace_id: trace_id.into(),
            recoverable,
            source: None,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Stage { recoverable, .. } => *recoverable,
            Self::Budget(_) | Self::Gate(_) | Self::Routing(_) | Self::Plan(_) => false,
        }
    }
}

/// Which ceiling a budget violation tripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BudgetScope {
    Total,
    Domain(String),
    Tool(String),
}

impl std::fmt::Display for BudgetScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Total => write!(f, "total calls"),
            Self::Domain(d) => write!(f, "domain '{d}'"),
            Self::Tool(t) => write!(f, "tool '{t}'"),
        }
    }
}

/// A step would exceed a budget ceiling under a blocking policy.
///
/// Distinct from generic failure so callers can branch on it (skip, fail, or
/// escalate) rather than treating it as a worker crash.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("budget ceiling exceeded for {scope}: {used} of {ceiling} calls already used")]
pub struct BudgetViolation {
    pub scope: BudgetScope,
    pub used: u32,
    pub ceiling: u32,
}

/// Approval-gate control errors. Note that DENIED and TIMEOUT outcomes are
/// *statuses*, not errors; only misuse of the gate surface lands here.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("approval request {0} not found or already resolved")]
    UnknownRequest(Uuid),

    #[error("approval channel closed before request {0} resolved")]
    ChannelClosed(Uuid),
}

#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("no eligible worker for task '{task}' and routing is fail-closed")]
    NoEligibleWorker { task: String },
}

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("invalid plan stage transition from {from} to {to}")]
    InvalidTransition { from: PlanStage, to: PlanStage },

    #[error("plan validation failed: {0}")]
    Validation(String),
}

/// Failure from a worker or the tool it invoked. The transient variants are
/// the only ones a `RetryPolicy` will retry.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("connection to '{endpoint}' failed: {message}")]
    Connection { endpoint: String, message: String },

    #[error("worker call timed out after {0:?}")]
    Timeout(Duration),

    #[error("rate limited by upstream")]
    RateLimited { retry_after: Option<Duration> },

    #[error("invalid input for tool '{tool}': {message}")]
    InvalidInput { tool: String, message: String },

    #[error("tool '{tool}' failed: {message}")]
    Tool { tool: String, message: String },

    #[error("unknown worker '{0}'")]
    UnknownWorker(String),
}

impl WorkerError {
    /// Connection errors, timeouts and rate-limit signals are worth retrying;
    /// everything else passes through immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::Timeout(_) | Self::RateLimited { .. }
        )
    }
}
