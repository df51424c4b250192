//! Composition root: turns a goal plus context into a sequence of executed
//! steps.
//!
//! One pass over the plan: for each step, check the budget, route, gate if
//! required, execute with retry, record, aggregate. Distinct traces run
//! concurrently; within one trace the lifecycle stages follow a fixed
//! order, and a cancellation signal short-circuits the next stage check to
//! a CANCELLED terminal.
//!
//! Collaborators are injected at construction. The builder supplies
//! defaults (in-memory audit, a standard approval gate) but nothing here
//! reaches for a process-wide global.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::approval::{ApprovalGate, ApprovalPolicy, ApprovalRequest, ApprovalStatus};
use crate::audit::AuditTrail;
use crate::context::ExecutionContext;
use crate::error::{BudgetViolation, OrchestratorError, WorkerError};
use crate::planner::Planner;
use crate::planning::{
    BudgetCeilings, BudgetCheck, BudgetUtilization, PlanStage, PlanStep, PlanningAuthority,
};
use crate::retry::RetryPolicy;
use crate::routing::{RoutingAuthority, RoutingConfig, RoutingDecision};
use crate::worker::WorkerRegistry;

/// Lifecycle stages of one orchestration pass. Route and Execute recur per
/// step; exactly one of the terminal stages ends the sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleStage {
    Initialize,
    Plan,
    Route,
    Execute,
    Aggregate,
    Complete,
    Failed,
    Cancelled,
}

impl std::fmt::Display for LifecycleStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Initialize => "initialize",
            Self::Plan => "plan",
            Self::Route => "route",
            Self::Execute => "execute",
            Self::Aggregate => "aggregate",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// One lifecycle record handed to the consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageEvent {
    pub stage: LifecycleStage,
    pub payload: Value,
    pub trace_id: String,
    pub timestamp: DateTime<Utc>,
}

impl StageEvent {
    fn new(stage: LifecycleStage, payload: Value, ctx: &ExecutionContext) -> Self {
        Self {
            stage,
            payload,
            trace_id: ctx.trace_id().to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.stage,
            LifecycleStage::Complete | LifecycleStage::Failed | LifecycleStage::Cancelled
        )
    }
}

enum EventSink {
    Channel(mpsc::Sender<StageEvent>),
    Null,
}

impl EventSink {
    /// Returns false when the consumer has gone away, which the producer
    /// treats exactly like cancellation.
    async fn emit(&self, event: StageEvent) -> bool {
        match self {
            Self::Channel(tx) => tx.send(event).await.is_ok(),
            Self::Null => true,
        }
    }
}

/// What the surrounding transport must supply.
#[derive(Debug, Clone)]
pub struct OrchestrationRequest {
    pub goal: String,
    /// Explicit step list; when absent the configured planner is consulted.
    pub steps: Option<Vec<PlanStep>>,
    pub ceilings: BudgetCeilings,
    pub profile: String,
    /// Caller-supplied trace id; generated when absent.
    pub trace_id: Option<String>,
}

impl OrchestrationRequest {
    pub fn new(goal: impl Into<String>, steps: Vec<PlanStep>) -> Self {
        Self {
            goal: goal.into(),
            steps: Some(steps),
            ceilings: BudgetCeilings::default(),
            profile: "default".into(),
            trace_id: None,
        }
    }

    pub fn with_ceilings(mut self, ceilings: BudgetCeilings) -> Self {
        self.ceilings = ceilings;
        self
    }

    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = profile.into();
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Succeeded,
    Failed,
    /// Rejected by a blocking budget policy before execution.
    Blocked,
    Denied,
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepReport {
    pub step_id: String,
    pub step_name: String,
    pub worker: Option<String>,
    pub status: StepStatus,
    pub attempts: u32,
    pub output: Option<Value>,
    pub error: Option<String>,
}

impl StepReport {
    fn skipped(step: &PlanStep, status: StepStatus, error: Option<String>) -> Self {
        Self {
            step_id: step.id.clone(),
            step_name: step.name.clone(),
            worker: None,
            status,
            attempts: 0,
            output: None,
            error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Completed,
    Failed,
    Cancelled,
}

/// The aggregate result. Always reports which steps succeeded, which failed
/// and why, and final budget utilization, regardless of overall outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationReport {
    pub trace_id: String,
    pub plan_id: Option<Uuid>,
    pub goal: String,
    pub status: RunStatus,
    pub steps: Vec<StepReport>,
    pub succeeded: usize,
    pub failed: usize,
    pub blocked: usize,
    pub budget: Option<BudgetUtilization>,
    pub warnings: Vec<String>,
    pub error: Option<String>,
}

impl OrchestrationReport {
    fn empty(trace_id: &str, goal: &str) -> Self {
        Self {
            trace_id: trace_id.to_string(),
            plan_id: None,
            goal: goal.to_string(),
            status: RunStatus::Failed,
            steps: Vec::new(),
            succeeded: 0,
            failed: 0,
            blocked: 0,
            budget: None,
            warnings: Vec::new(),
            error: None,
        }
    }

    fn tally(&mut self) {
        self.succeeded = self
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Succeeded)
            .count();
        self.blocked = self
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Blocked)
            .count();
        self.failed = self.steps.len() - self.succeeded - self.blocked;
    }
}

enum StepExecution {
    Success {
        worker: String,
        output: Value,
        attempts: u32,
    },
    Permanent {
        worker: Option<String>,
        error: String,
        attempts: u32,
    },
    Cancelled {
        worker: String,
        attempts: u32,
    },
}

pub struct Coordinator {
    registry: Arc<WorkerRegistry>,
    router: RoutingAuthority,
    planning: PlanningAuthority,
    planner: Option<Arc<dyn Planner>>,
    gate: Arc<ApprovalGate>,
    audit: AuditTrail,
    retry: RetryPolicy,
}

pub struct CoordinatorBuilder {
    registry: Option<Arc<WorkerRegistry>>,
    routing: RoutingConfig,
    planner: Option<Arc<dyn Planner>>,
    gate: Option<Arc<ApprovalGate>>,
    audit: Option<AuditTrail>,
    retry: RetryPolicy,
}

impl CoordinatorBuilder {
    pub fn registry(mut self, registry: Arc<WorkerRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn routing(mut self, routing: RoutingConfig) -> Self {
        self.routing = routing;
        self
    }

    pub fn planner(mut self, planner: Arc<dyn Planner>) -> Self {
        self.planner = Some(planner);
        self
    }

    pub fn gate(mut self, gate: Arc<ApprovalGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn audit(mut self, audit: AuditTrail) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn build(self) -> Coordinator {
        Coordinator {
            registry: self.registry.unwrap_or_default(),
            router: RoutingAuthority::new(self.routing),
            planning: PlanningAuthority::new(),
            planner: self.planner,
            gate: self
                .gate
                .unwrap_or_else(|| Arc::new(ApprovalGate::new(ApprovalPolicy::default()))),
            audit: self.audit.unwrap_or_else(AuditTrail::in_memory),
            retry: self.retry,
        }
    }
}

impl Coordinator {
    pub fn builder() -> CoordinatorBuilder {
        CoordinatorBuilder {
            registry: None,
            routing: RoutingConfig::default(),
            planner: None,
            gate: None,
            audit: None,
            retry: RetryPolicy::default(),
        }
    }

    pub fn audit(&self) -> &AuditTrail {
        &self.audit
    }

    pub fn gate(&self) -> &Arc<ApprovalGate> {
        &self.gate
    }

    /// Build the per-request context. Exposed so callers can keep a handle
    /// for cancellation before starting the run.
    pub fn context_for(&self, request: &OrchestrationRequest) -> ExecutionContext {
        match &request.trace_id {
            Some(trace_id) => ExecutionContext::with_trace_id(&request.profile, trace_id),
            None => ExecutionContext::new(&request.profile),
        }
    }

    /// Run to completion and return the aggregate report.
    #[instrument(skip(self, request), fields(goal = request.goal.as_str()))]
    pub async fn run(&self, request: OrchestrationRequest) -> OrchestrationReport {
        let ctx = self.context_for(&request);
        self.run_with_context(request, ctx).await
    }

    pub async fn run_with_context(
        &self,
        request: OrchestrationRequest,
        ctx: ExecutionContext,
    ) -> OrchestrationReport {
        self.drive(request, ctx, EventSink::Null).await
    }

    /// Run in the background, streaming one `StageEvent` per lifecycle
    /// stage. Dropping the receiver stops the producer at its next emit.
    pub fn run_streaming(
        self: Arc<Self>,
        request: OrchestrationRequest,
        ctx: ExecutionContext,
    ) -> mpsc::Receiver<StageEvent> {
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            let _ = self.drive(request, ctx, EventSink::Channel(tx)).await;
        });
        rx
    }

    async fn drive(
        &self,
        request: OrchestrationRequest,
        ctx: ExecutionContext,
        sink: EventSink,
    ) -> OrchestrationReport {
        let mut report = OrchestrationReport::empty(ctx.trace_id(), &request.goal);

        // INITIALIZE
        let initialized = sink
            .emit(StageEvent::new(
                LifecycleStage::Initialize,
                json!({ "goal": &request.goal, "profile": ctx.profile() }),
                &ctx,
            ))
            .await;
        if !initialized || ctx.is_cancelled() {
            report.status = RunStatus::Cancelled;
            let _ = sink
                .emit(StageEvent::new(LifecycleStage::Cancelled, Value::Null, &ctx))
                .await;
            return report;
        }

        // PLAN
        let steps = match self.resolve_steps(&request, &ctx).await {
            Ok(steps) => steps,
            Err(e) => {
                report.error = Some(e.to_string());
                let _ = sink
                    .emit(StageEvent::new(
                        LifecycleStage::Failed,
                        json!({
                            "error": e.to_string(),
                            "stage": "plan",
                            "recoverable": e.is_recoverable(),
                        }),
                        &ctx,
                    ))
                    .await;
                return report;
            }
        };

        let mut plan = self
            .planning
            .create_plan(&request.goal, steps, request.ceilings, &ctx);
        report.plan_id = Some(plan.plan_id);
        self.audit.record_plan(&plan, PlanStage::Created).await;

        if let Err(e) = self.planning.validate(&mut plan) {
            self.audit.record_plan(&plan, PlanStage::Failed).await;
            report.budget = Some(plan.budget.utilization());
            report.error = Some(e.to_string());
            let _ = sink
                .emit(StageEvent::new(
                    LifecycleStage::Failed,
                    json!({ "error": e.to_string(), "stage": "plan", "recoverable": false }),
                    &ctx,
                ))
                .await;
            return report;
        }
        self.audit.record_plan(&plan, PlanStage::Validated).await;

        let planned = sink
            .emit(StageEvent::new(
                LifecycleStage::Plan,
                json!({ "plan_id": plan.plan_id, "steps": plan.steps.len() }),
                &ctx,
            ))
            .await;
        if !planned || ctx.is_cancelled() {
            return self.finish_cancelled(report, plan, &ctx, sink).await;
        }

        if let Err(e) = self.planning.begin_execution(&mut plan) {
            warn!("plan could not enter execution: {e}");
        }
        self.audit.record_plan(&plan, PlanStage::Executing).await;

        // Per step: budget check, route, gate, execute with retry, record.
        let mut cancelled = false;
        let steps = plan.steps.clone();
        for step in &steps {
            if ctx.is_cancelled() {
                cancelled = true;
                break;
            }

            match plan.budget.check(step) {
                BudgetCheck::Exceeded(violation) => {
                    info!(step = step.id.as_str(), %violation, "step blocked by budget");
                    report.warnings.push(violation.to_string());
                    report
                        .steps
                        .push(Self::blocked_report(step, &violation));
                    continue;
                }
                BudgetCheck::Warning { message, .. } => {
                    warn!(step = step.id.as_str(), "{message}");
                    report.warnings.push(message);
                }
                BudgetCheck::Allowed => {}
            }

            // ROUTE
            let candidates = self.registry.snapshot();
            let decision = match self.router.route(step, &ctx, &candidates) {
                Ok(decision) => decision,
                Err(e) => {
                    report.steps.push(StepReport::skipped(
                        step,
                        StepStatus::Failed,
                        Some(e.to_string()),
                    ));
                    continue;
                }
            };
            self.audit
                .record_routing_decision(&decision, ctx.trace_id(), "route")
                .await;
            let routed = sink
                .emit(StageEvent::new(
                    LifecycleStage::Route,
                    json!({ "step": &step.id, "target": &decision.target, "reason": &decision.reason }),
                    &ctx,
                ))
                .await;
            if !routed {
                cancelled = true;
                break;
            }

            // GATE
            if step.requires_approval {
                let approval = ApprovalRequest::new(
                    format!("{}:{}", step.tool, step.id),
                    ctx.trace_id(),
                    step.risk,
                    ctx.profile(),
                );
                match self.gate.await_decision(approval, &ctx).await {
                    Ok(response) => match response.status {
                        ApprovalStatus::Approved => {}
                        ApprovalStatus::Denied => {
                            report.steps.push(StepReport::skipped(
                                step,
                                StepStatus::Denied,
                                response.reason.clone(),
                            ));
                            continue;
                        }
                        ApprovalStatus::Timeout => {
                            report.steps.push(StepReport::skipped(
                                step,
                                StepStatus::TimedOut,
                                Some("approval timed out".into()),
                            ));
                            continue;
                        }
                        ApprovalStatus::Cancelled | ApprovalStatus::Pending => {
                            report.steps.push(StepReport::skipped(
                                step,
                                StepStatus::Cancelled,
                                Some("approval cancelled".into()),
                            ));
                            cancelled = true;
                            break;
                        }
                    },
                    Err(e) => {
                        report.steps.push(StepReport::skipped(
                            step,
                            StepStatus::Failed,
                            Some(e.to_string()),
                        ));
                        continue;
                    }
                }
            }

            // EXECUTE with retry; spend is charged only on confirmed success.
            let execution = self.execute_step(step, &decision, &ctx).await;
            let step_report = match execution {
                StepExecution::Success {
                    worker,
                    output,
                    attempts,
                } => {
                    plan.budget.record_success(step);
                    StepReport {
                        step_id: step.id.clone(),
                        step_name: step.name.clone(),
                        worker: Some(worker),
                        status: StepStatus::Succeeded,
                        attempts,
                        output: Some(output),
                        error: None,
                    }
                }
                StepExecution::Permanent {
                    worker,
                    error,
                    attempts,
                } => StepReport {
                    step_id: step.id.clone(),
                    step_name: step.name.clone(),
                    worker,
                    status: StepStatus::Failed,
                    attempts,
                    output: None,
                    error: Some(error),
                },
                StepExecution::Cancelled { worker, attempts } => {
                    cancelled = true;
                    StepReport {
                        step_id: step.id.clone(),
                        step_name: step.name.clone(),
                        worker: Some(worker),
                        status: StepStatus::Cancelled,
                        attempts,
                        output: None,
                        error: Some("cancelled during retry wait".into()),
                    }
                }
            };

            let executed = sink
                .emit(StageEvent::new(
                    LifecycleStage::Execute,
                    json!({
                        "step": &step.id,
                        "status": step_report.status,
                        "attempts": step_report.attempts,
                    }),
                    &ctx,
                ))
                .await;
            report.steps.push(step_report);
            if !executed || cancelled {
                cancelled = true;
                break;
            }
        }

        // AGGREGATE
        report.tally();
        report.budget = Some(plan.budget.utilization());
        let aggregated = sink
            .emit(StageEvent::new(
                LifecycleStage::Aggregate,
                json!({
                    "succeeded": report.succeeded,
                    "failed": report.failed,
                    "blocked": report.blocked,
                }),
                &ctx,
            ))
            .await;
        if !aggregated {
            cancelled = true;
        }
        if cancelled || ctx.is_cancelled() {
            return self.finish_cancelled(report, plan, &ctx, sink).await;
        }

        // Terminal: the plan completed if anything succeeded, or if it had
        // nothing to do; an all-failed pass is a failed plan. Prior
        // successes are preserved either way.
        if report.succeeded > 0 || report.steps.is_empty() {
            report.status = RunStatus::Completed;
            if self.planning.complete(&mut plan).is_ok() {
                self.audit.record_plan(&plan, PlanStage::Completed).await;
            }
            let payload = serde_json::to_value(&report).unwrap_or(Value::Null);
            let _ = sink
                .emit(StageEvent::new(LifecycleStage::Complete, payload, &ctx))
                .await;
        } else {
            report.status = RunStatus::Failed;
            report.error = Some("no step succeeded".into());
            if self.planning.fail(&mut plan).is_ok() {
                self.audit.record_plan(&plan, PlanStage::Failed).await;
            }
            let payload = serde_json::to_value(&report).unwrap_or(Value::Null);
            let _ = sink
                .emit(StageEvent::new(LifecycleStage::Failed, payload, &ctx))
                .await;
        }
        report
    }

    async fn resolve_steps(
        &self,
        request: &OrchestrationRequest,
        ctx: &ExecutionContext,
    ) -> Result<Vec<PlanStep>, OrchestratorError> {
        if let Some(steps) = &request.steps {
            return Ok(steps.clone());
        }
        match &self.planner {
            Some(planner) => planner.plan(&request.goal, ctx).await.map_err(|e| {
                // The planner is an external collaborator; its failures are
                // worth retrying at the caller's discretion.
                OrchestratorError::stage(
                    LifecycleStage::Plan,
                    ctx.trace_id(),
                    format!("planner failed: {e:#}"),
                    true,
                )
            }),
            None => Err(OrchestratorError::stage(
                LifecycleStage::Plan,
                ctx.trace_id(),
                "no step list supplied and no planner configured",
                false,
            )),
        }
    }

    async fn finish_cancelled(
        &self,
        mut report: OrchestrationReport,
        mut plan: crate::planning::Plan,
        ctx: &ExecutionContext,
        sink: EventSink,
    ) -> OrchestrationReport {
        report.tally();
        report.budget = Some(plan.budget.utilization());
        report.status = RunStatus::Cancelled;
        if self.planning.fail(&mut plan).is_ok() {
            self.audit.record_plan(&plan, PlanStage::Failed).await;
        }
        let payload = serde_json::to_value(&report).unwrap_or(Value::Null);
        let _ = sink
            .emit(StageEvent::new(LifecycleStage::Cancelled, payload, ctx))
            .await;
        report
    }

    fn blocked_report(step: &PlanStep, violation: &BudgetViolation) -> StepReport {
        StepReport::skipped(step, StepStatus::Blocked, Some(violation.to_string()))
    }

    async fn execute_step(
        &self,
        step: &PlanStep,
        decision: &RoutingDecision,
        ctx: &ExecutionContext,
    ) -> StepExecution {
        let worker = self.registry.get(&decision.target).or_else(|| {
            decision
                .fallback
                .as_deref()
                .and_then(|name| self.registry.get(name))
        });
        let Some(worker) = worker else {
            return StepExecution::Permanent {
                worker: None,
                error: WorkerError::UnknownWorker(decision.target.clone()).to_string(),
                attempts: 0,
            };
        };
        let worker_name = worker.name().to_string();

        self.registry.checkout(&worker_name);
        let mut attempts = 0u32;
        let outcome = loop {
            attempts += 1;
            match worker.execute(step, ctx).await {
                Ok(output) => {
                    break StepExecution::Success {
                        worker: worker_name.clone(),
                        output,
                        attempts,
                    };
                }
                Err(e) => {
                    let verdict = self.retry.should_retry(&e, attempts);
                    if !verdict.retry {
                        break StepExecution::Permanent {
                            worker: Some(worker_name.clone()),
                            error: e.to_string(),
                            attempts,
                        };
                    }
                    warn!(
                        step = step.id.as_str(),
                        attempt = attempts,
                        delay_ms = verdict.delay.as_millis() as u64,
                        "transient failure, will retry: {e}"
                    );
                    // The delay must wake on cancellation rather than run
                    // to completion regardless.
                    tokio::select! {
                        _ = tokio::time::sleep(verdict.delay) => {}
                        _ = ctx.cancellation().cancelled() => {
                            break StepExecution::Cancelled {
                                worker: worker_name.clone(),
                                attempts,
                            };
                        }
                    }
                }
            }
        };
        self.registry.checkin(&worker_name);
        outcome
    }
}
