//! End-to-end tests for the orchestration core.
//!
//! These exercise the coordinator against real collaborators: worker
//! registry, routing authority, approval gate, retry policy and an
//! in-memory audit trail.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use overseer::approval::{ApprovalGate, ApprovalPolicy};
use overseer::audit::{AuditTrail, DecisionType, MemoryStore};
use overseer::context::ExecutionContext;
use overseer::coordinator::{
    Coordinator, OrchestrationRequest, RunStatus, StepStatus,
};
use overseer::error::WorkerError;
use overseer::planning::{BudgetCeilings, PlanStep, RiskLevel};
use overseer::retry::RetryPolicy;
use overseer::routing::{RoutingConfig, RoutingStrategy};
use overseer::worker::{EchoWorker, Worker, WorkerRegistry};
use serde_json::{json, Value};
use tracing_test::traced_test;

/// Worker that fails transiently a configured number of times, then
/// succeeds.
struct FlakyWorker {
    name: &'static str,
    failures_before_success: u32,
    calls: AtomicU32,
}

impl FlakyWorker {
    fn new(name: &'static str, failures_before_success: u32) -> Self {
        Self {
            name,
            failures_before_success,
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl Worker for FlakyWorker {
    fn name(&self) -> &str {
        self.name
    }

    fn capabilities(&self) -> Vec<String> {
        vec!["flaky".to_string()]
    }

    async fn execute(&self, step: &PlanStep, _ctx: &ExecutionContext) -> Result<Value, WorkerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures_before_success {
            Err(WorkerError::Connection {
                endpoint: "upstream".into(),
                message: format!("attempt {call} dropped"),
            })
        } else {
            Ok(json!({ "step": step.id, "attempt": call }))
        }
    }
}

/// Worker that always fails permanently.
struct BrokenWorker;

#[async_trait]
impl Worker for BrokenWorker {
    fn name(&self) -> &str {
        "broken"
    }

    fn capabilities(&self) -> Vec<String> {
        vec![]
    }

    async fn execute(
        &self,
        step: &PlanStep,
        _ctx: &ExecutionContext,
    ) -> Result<Value, WorkerError> {
        Err(WorkerError::Tool {
            tool: step.tool.clone(),
            message: "unconditionally broken".into(),
        })
    }
}

fn echo_steps(n: usize) -> Vec<PlanStep> {
    (1..=n)
        .map(|i| PlanStep::new(format!("step_{i}"), "echo", "testing"))
        .collect()
}

fn echo_coordinator(audit: AuditTrail) -> Coordinator {
    let registry = Arc::new(WorkerRegistry::new());
    registry.register(Arc::new(EchoWorker));
    Coordinator::builder()
        .registry(registry)
        .gate(Arc::new(ApprovalGate::new(ApprovalPolicy::disabled())))
        .audit(audit)
        .retry(RetryPolicy::None)
        .build()
}

// Scenario A: 3-step plan, total ceiling of 2 calls, blocking policy. Step 3
// is rejected with a budget violation; steps 1-2 succeed; the aggregate
// reports 2 succeeded, 1 blocked, utilization 100%.
#[tokio::test]
#[traced_test]
async fn blocking_budget_rejects_third_step() {
    let coordinator = echo_coordinator(AuditTrail::in_memory());
    let request = OrchestrationRequest::new("three echoes", echo_steps(3))
        .with_ceilings(BudgetCeilings::total(2));

    let report = coordinator.run(request).await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.succeeded, 2);
    assert_eq!(report.blocked, 1);
    assert_eq!(report.failed, 0);

    let third = &report.steps[2];
    assert_eq!(third.status, StepStatus::Blocked);
    assert!(third.error.as_deref().unwrap().contains("budget ceiling exceeded"));
    assert_eq!(third.attempts, 0, "blocked step must never execute");

    let budget = report.budget.unwrap();
    assert_eq!(budget.total_used, 2);
    assert!((budget.fraction.unwrap() - 1.0).abs() < f64::EPSILON);
    assert!(!report.warnings.is_empty());
}

// Scenario B: approval timeout of 1s with auto-approve on timeout and no
// manual response resolves APPROVED after about a second.
#[tokio::test(start_paused = true)]
async fn approval_timeout_auto_approves() {
    let registry = Arc::new(WorkerRegistry::new());
    registry.register(Arc::new(EchoWorker));
    let coordinator = Coordinator::builder()
        .registry(registry)
        .gate(Arc::new(ApprovalGate::new(ApprovalPolicy {
            enabled: true,
            timeout: Duration::from_secs(1),
            auto_approve_on_timeout: true,
        })))
        .retry(RetryPolicy::None)
        .build();

    let step = PlanStep::new("gated", "echo", "testing").gated(RiskLevel::Medium);
    let request = OrchestrationRequest::new("gated echo", vec![step]);

    let started = tokio::time::Instant::now();
    let report = coordinator.run(request).await;

    assert!(started.elapsed() >= Duration::from_secs(1));
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.steps[0].status, StepStatus::Succeeded);
}

// Under auto_approve_on_timeout = false the same setup is a rejection.
#[tokio::test(start_paused = true)]
async fn approval_timeout_rejects_without_auto_approve() {
    let registry = Arc::new(WorkerRegistry::new());
    registry.register(Arc::new(EchoWorker));
    let coordinator = Coordinator::builder()
        .registry(registry)
        .gate(Arc::new(ApprovalGate::new(ApprovalPolicy {
            enabled: true,
            timeout: Duration::from_secs(1),
            auto_approve_on_timeout: false,
        })))
        .retry(RetryPolicy::None)
        .build();

    let steps = vec![
        PlanStep::new("open", "echo", "testing"),
        PlanStep::new("gated", "echo", "testing").gated(RiskLevel::High),
    ];
    let report = coordinator
        .run(OrchestrationRequest::new("half gated", steps))
        .await;

    assert_eq!(report.succeeded, 1);
    assert_eq!(report.steps[1].status, StepStatus::TimedOut);
    // Prior successful steps survive the gate outcome.
    assert_eq!(report.steps[0].status, StepStatus::Succeeded);
}

// Scenario C: round-robin over candidates [A, B, C] routes three successive
// unrelated calls to A, B, C in order.
#[tokio::test]
#[traced_test]
async fn round_robin_cycles_across_steps() {
    struct Named(&'static str);

    #[async_trait]
    impl Worker for Named {
        fn name(&self) -> &str {
            self.0
        }
        fn capabilities(&self) -> Vec<String> {
            vec![]
        }
        async fn execute(
            &self,
            _step: &PlanStep,
            _ctx: &ExecutionContext,
        ) -> Result<Value, WorkerError> {
            Ok(json!(self.0))
        }
    }

    let registry = Arc::new(WorkerRegistry::new());
    registry.register(Arc::new(Named("worker_a")));
    registry.register(Arc::new(Named("worker_b")));
    registry.register(Arc::new(Named("worker_c")));

    let audit = AuditTrail::new(Arc::new(MemoryStore::new()));
    let coordinator = Coordinator::builder()
        .registry(registry)
        .routing(RoutingConfig {
            strategy: RoutingStrategy::RoundRobin,
            ..Default::default()
        })
        .gate(Arc::new(ApprovalGate::new(ApprovalPolicy::disabled())))
        .audit(audit.clone())
        .retry(RetryPolicy::None)
        .build();

    let report = coordinator
        .run(OrchestrationRequest::new("spread the load", echo_steps(3)))
        .await;

    let workers: Vec<_> = report
        .steps
        .iter()
        .map(|s| s.worker.clone().unwrap())
        .collect();
    assert_eq!(workers, vec!["worker_a", "worker_b", "worker_c"]);

    // The audit trail saw the same three decisions, in order.
    let routes = audit.get_routing_history(10).await.unwrap();
    let targets: Vec<_> = routes.iter().map(|r| r.target.as_str()).collect();
    assert_eq!(targets, vec!["worker_a", "worker_b", "worker_c"]);
}

// Scenario D: a worker fails transiently on attempts 1-2 and succeeds on
// attempt 3 under exponential backoff with max_attempts = 3. The step
// ultimately succeeds and the trace ends in a completed plan, with no
// failed-plan record.
#[tokio::test(start_paused = true)]
async fn transient_failures_recover_within_retry_budget() {
    let registry = Arc::new(WorkerRegistry::new());
    registry.register(Arc::new(FlakyWorker::new("flaky", 2)));

    let audit = AuditTrail::new(Arc::new(MemoryStore::new()));
    let coordinator = Coordinator::builder()
        .registry(registry)
        .gate(Arc::new(ApprovalGate::new(ApprovalPolicy::disabled())))
        .audit(audit.clone())
        .retry(RetryPolicy::Exponential {
            base: Duration::from_millis(100),
            max_attempts: 3,
            max_delay: Duration::from_secs(5),
            jitter: 0.0,
        })
        .build();

    let request = OrchestrationRequest::new(
        "persist through flakiness",
        vec![PlanStep::new("s1", "flaky_call", "integration")],
    )
    .with_trace_id("trace-flaky");
    let report = coordinator.run(request).await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.steps[0].status, StepStatus::Succeeded);
    assert_eq!(report.steps[0].attempts, 3);

    let history = audit.get_trace_history("trace-flaky").await.unwrap();
    let plan_stages: Vec<_> = history
        .iter()
        .filter(|r| r.decision_type == DecisionType::Plan)
        .map(|r| r.metadata["stage"].as_str().unwrap().to_string())
        .collect();
    assert!(plan_stages.contains(&"completed".to_string()));
    assert!(!plan_stages.contains(&"failed".to_string()));
}

// One more attempt than the cap turns the transient failure permanent, but
// prior successful steps still aggregate.
#[tokio::test(start_paused = true)]
async fn retries_exhausted_becomes_permanent_step_failure() {
    let registry = Arc::new(WorkerRegistry::new());
    registry.register(Arc::new(FlakyWorker::new("flaky", 5)));

    let coordinator = Coordinator::builder()
        .registry(registry)
        .gate(Arc::new(ApprovalGate::new(ApprovalPolicy::disabled())))
        .retry(RetryPolicy::Exponential {
            base: Duration::from_millis(10),
            max_attempts: 3,
            max_delay: Duration::from_secs(1),
            jitter: 0.0,
        })
        .build();

    let report = coordinator
        .run(OrchestrationRequest::new(
            "doomed",
            vec![PlanStep::new("s1", "flaky_call", "integration")],
        ))
        .await;

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.steps[0].status, StepStatus::Failed);
    assert_eq!(report.steps[0].attempts, 3);
    assert!(report.steps[0].error.as_deref().unwrap().contains("attempt 3"));
}

#[tokio::test]
#[traced_test]
async fn permanent_failure_degrades_gracefully() {
    let registry = Arc::new(WorkerRegistry::new());
    registry.register(Arc::new(BrokenWorker));
    registry.register(Arc::new(EchoWorker));

    // Capability routing: the echo steps go to the echo worker, the broken
    // step to the broken worker via its tool name falling through to the
    // degraded default.
    let coordinator = Coordinator::builder()
        .registry(registry)
        .routing(RoutingConfig {
            strategy: RoutingStrategy::CapabilityBased,
            default_target: Some("broken".into()),
            fail_closed: false,
        })
        .gate(Arc::new(ApprovalGate::new(ApprovalPolicy::disabled())))
        .retry(RetryPolicy::None)
        .build();

    let steps = vec![
        PlanStep::new("ok_1", "echo", "testing").with_capability("echo"),
        PlanStep::new("bad", "explode", "testing"),
        PlanStep::new("ok_2", "echo", "testing").with_capability("echo"),
    ];
    let report = coordinator
        .run(OrchestrationRequest::new("mixed fortunes", steps))
        .await;

    // The failed step does not discard progress from the others.
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.succeeded, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.steps[1].status, StepStatus::Failed);
    assert!(report.steps[1].error.as_deref().unwrap().contains("unconditionally broken"));

    // Budget reflects completed work only.
    assert_eq!(report.budget.unwrap().total_used, 2);
}

#[tokio::test]
#[traced_test]
async fn trace_history_is_chronological_and_complete() {
    let audit = AuditTrail::new(Arc::new(MemoryStore::new()));
    let coordinator = echo_coordinator(audit.clone());

    let request = OrchestrationRequest::new("audited echoes", echo_steps(2))
        .with_trace_id("trace-history");
    let report = coordinator.run(request).await;
    assert_eq!(report.status, RunStatus::Completed);

    let history = audit.get_trace_history("trace-history").await.unwrap();
    // Plan records: created, validated, executing, completed. Route records:
    // one per step.
    let plans = history
        .iter()
        .filter(|r| r.decision_type == DecisionType::Plan)
        .count();
    let routes = history
        .iter()
        .filter(|r| r.decision_type == DecisionType::Route)
        .count();
    assert_eq!(plans, 4);
    assert_eq!(routes, 2);

    for pair in history.windows(2) {
        assert!(
            pair[0].timestamp <= pair[1].timestamp,
            "history must be in non-decreasing timestamp order"
        );
    }
}

#[tokio::test]
async fn concurrent_traces_do_not_interleave_audit_state() {
    let audit = AuditTrail::new(Arc::new(MemoryStore::new()));
    let coordinator = Arc::new(echo_coordinator(audit.clone()));

    let runs: Vec<_> = (0..8)
        .map(|i| {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                let request = OrchestrationRequest::new("parallel echoes", echo_steps(3))
                    .with_trace_id(format!("concurrent-{i}"));
                coordinator.run(request).await
            })
        })
        .collect();

    let reports = join_all(runs).await;
    for report in reports {
        let report = report.unwrap();
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.succeeded, 3);
    }

    for i in 0..8 {
        let history = audit
            .get_trace_history(&format!("concurrent-{i}"))
            .await
            .unwrap();
        assert_eq!(history.len(), 4 + 3, "each trace owns exactly its records");
        assert!(history
            .iter()
            .all(|r| r.trace_id == format!("concurrent-{i}")));
    }
}

#[tokio::test]
async fn cancellation_wakes_retry_delay() {
    let registry = Arc::new(WorkerRegistry::new());
    registry.register(Arc::new(FlakyWorker::new("flaky", u32::MAX)));

    let coordinator = Arc::new(
        Coordinator::builder()
            .registry(registry)
            .gate(Arc::new(ApprovalGate::new(ApprovalPolicy::disabled())))
            .retry(RetryPolicy::Linear {
                delay: Duration::from_secs(3600),
                max_attempts: 10,
            })
            .build(),
    );

    let request = OrchestrationRequest::new(
        "never finishes",
        vec![PlanStep::new("s1", "flaky_call", "integration")],
    );
    let ctx = coordinator.context_for(&request);
    let handle = {
        let coordinator = coordinator.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move { coordinator.run_with_context(request, ctx).await })
    };

    // Give the run time to enter its first retry delay, then cancel. The
    // hour-long sleep must not run to completion.
    tokio::time::sleep(Duration::from_millis(50)).await;
    ctx.cancel();

    let report = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("cancellation must wake the retry delay promptly")
        .unwrap();
    assert_eq!(report.status, RunStatus::Cancelled);
    assert_eq!(report.steps[0].status, StepStatus::Cancelled);
}

#[tokio::test]
async fn denied_approval_is_a_status_not_an_error() {
    let registry = Arc::new(WorkerRegistry::new());
    registry.register(Arc::new(EchoWorker));

    let gate = Arc::new(ApprovalGate::new(ApprovalPolicy::default()));
    gate.set_callback(|req| overseer::approval::GateDecision {
        approved: !req.operation.contains("risky"),
        approver: "policy-bot".into(),
        reason: Some("operation name screened".into()),
    });

    let coordinator = Coordinator::builder()
        .registry(registry)
        .gate(gate)
        .retry(RetryPolicy::None)
        .build();

    let steps = vec![
        PlanStep::new("fine", "echo", "testing").gated(RiskLevel::Low),
        PlanStep::new("blocked", "risky_echo", "testing").gated(RiskLevel::High),
    ];
    let report = coordinator
        .run(OrchestrationRequest::new("screened", steps))
        .await;

    assert_eq!(report.steps[0].status, StepStatus::Succeeded);
    assert_eq!(report.steps[1].status, StepStatus::Denied);
    assert_eq!(report.status, RunStatus::Completed);
}
