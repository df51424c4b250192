//! Plan lifecycle and tool-budget accounting.
//!
//! A `Plan` moves through a monotonic stage machine; its `ToolBudget` tracks
//! consumption of a finite call allowance against total, per-domain and
//! per-tool ceilings. Spend is recorded strictly after a step's execution is
//! confirmed successful, never pre-charged.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::context::ExecutionContext;
use crate::error::{BudgetScope, BudgetViolation, PlanError};

/// Plan stages. Transitions only move forward; `Completed` and `Failed` are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanStage {
    Created,
    Validated,
    Executing,
    Completed,
    Failed,
}

impl std::fmt::Display for PlanStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Validated => "validated",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
}

/// One executable unit of a plan. The step names a tool and the domain that
/// tool belongs to; the worker that will run it is decided at routing time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: String,
    pub name: String,
    pub tool: String,
    pub domain: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub required_capability: Option<String>,
    #[serde(default)]
    pub requires_approval: bool,
    #[serde(default)]
    pub risk: RiskLevel,
}

impl PlanStep {
    pub fn new(id: impl Into<String>, tool: impl Into<String>, domain: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            tool: tool.into(),
            domain: domain.into(),
            input: Value::Null,
            required_capability: None,
            requires_approval: false,
            risk: RiskLevel::Low,
        }
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.required_capability = Some(capability.into());
        self
    }

    pub fn gated(mut self, risk: RiskLevel) -> Self {
        self.requires_approval = true;
        self.risk = risk;
        self
    }
}

/// How the budget reacts when a prospective step would cross a ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BudgetPolicy {
    #[default]
    Block,
    WarnOnly,
}

/// Declarative ceilings attached to a plan at creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetCeilings {
    #[serde(default)]
    pub max_total_calls: Option<u32>,
    #[serde(default)]
    pub per_domain: HashMap<String, u32>,
    #[serde(default)]
    pub per_tool: HashMap<String, u32>,
    #[serde(default = "default_warn_threshold")]
    pub warn_threshold: f64,
    #[serde(default)]
    pub policy: BudgetPolicy,
}

fn default_warn_threshold() -> f64 {
    0.8
}

impl Default for BudgetCeilings {
    fn default() -> Self {
        Self {
            max_total_calls: None,
            per_domain: HashMap::new(),
            per_tool: HashMap::new(),
            warn_threshold: default_warn_threshold(),
            policy: BudgetPolicy::default(),
        }
    }
}

impl BudgetCeilings {
    pub fn total(max_total_calls: u32) -> Self {
        Self {
            max_total_calls: Some(max_total_calls),
            ..Self::default()
        }
    }

    pub fn warn_only(mut self) -> Self {
        self.policy = BudgetPolicy::WarnOnly;
        self
    }

    pub fn with_domain_ceiling(mut self, domain: impl Into<String>, ceiling: u32) -> Self {
        self.per_domain.insert(domain.into(), ceiling);
        self
    }

    pub fn with_tool_ceiling(mut self, tool: impl Into<String>, ceiling: u32) -> Self {
        self.per_tool.insert(tool.into(), ceiling);
        self
    }
}

/// Result of a prospective budget check, computed before a step runs.
#[derive(Debug, Clone, PartialEq)]
pub enum BudgetCheck {
    Allowed,
    /// The step is allowed but utilization crossed the warning threshold, or
    /// a ceiling was crossed under a warn-only policy.
    Warning { utilization: f64, message: String },
    Exceeded(BudgetViolation),
}

/// Snapshot of budget consumption for reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetUtilization {
    pub total_used: u32,
    pub total_ceiling: Option<u32>,
    /// `used / ceiling` when a total ceiling exists.
    pub fraction: Option<f64>,
    pub per_domain: HashMap<String, u32>,
    pub per_tool: HashMap<String, u32>,
}

/// Consumption tracker. Mutated only by the coordinator, only after a step's
/// execution is confirmed successful. Counters never decrease.
#[derive(Debug, Clone)]
pub struct ToolBudget {
    ceilings: BudgetCeilings,
    used_total: u32,
    used_per_domain: HashMap<String, u32>,
    used_per_tool: HashMap<String, u32>,
}

impl ToolBudget {
    pub fn new(ceilings: BudgetCeilings) -> Self {
        Self {
            ceilings,
            used_total: 0,
            used_per_domain: HashMap::new(),
            used_per_tool: HashMap::new(),
        }
    }

    pub fn ceilings(&self) -> &BudgetCeilings {
        &self.ceilings
    }

    pub fn policy(&self) -> BudgetPolicy {
        self.ceilings.policy
    }

    /// Prospective check: would executing `step` cross a ceiling?
    ///
    /// Under `Block` the step is rejected before any spend happens. Under
    /// `WarnOnly` the check always allows and surfaces a warning signal,
    /// including when the caller computed against a stale snapshot; the
    /// counters themselves stay accurate because only the single
    /// coordinator pass charges them.
    pub fn check(&self, step: &PlanStep) -> BudgetCheck {
        let violation = self.first_violation(step);

        match (violation, self.ceilings.policy) {
            (Some(v), BudgetPolicy::Block) => BudgetCheck::Exceeded(v),
            (Some(v), BudgetPolicy::WarnOnly) => BudgetCheck::Warning {
                utilization: self.prospective_fraction(),
                message: format!("ceiling crossed under warn-only policy: {v}"),
            },
            (None, _) => {
                let fraction = self.prospective_fraction();
                if fraction >= self.ceilings.warn_threshold && fraction.is_finite() {
                    BudgetCheck::Warning {
                        utilization: fraction,
                        message: format!(
                            "budget utilization at {:.0}% after step '{}'",
                            fraction * 100.0,
                            step.id
                        ),
                    }
                } else {
                    BudgetCheck::Allowed
                }
            }
        }
    }

    fn first_violation(&self, step: &PlanStep) -> Option<BudgetViolation> {
        if let Some(ceiling) = self.ceilings.max_total_calls {
            if self.used_total + 1 > ceiling {
                return Some(BudgetViolation {
                    scope: BudgetScope::Total,
                    used: self.used_total,
                    ceiling,
                });
            }
        }
        if let Some(&ceiling) = self.ceilings.per_domain.get(&step.domain) {
            let used = self.used_per_domain.get(&step.domain).copied().unwrap_or(0);
            if used + 1 > ceiling {
                return Some(BudgetViolation {
                    scope: BudgetScope::Domain(step.domain.clone()),
                    used,
                    ceiling,
                });
            }
        }
        if let Some(&ceiling) = self.ceilings.per_tool.get(&step.tool) {
            let used = self.used_per_tool.get(&step.tool).copied().unwrap_or(0);
            if used + 1 > ceiling {
                return Some(BudgetViolation {
                    scope: BudgetScope::Tool(step.tool.clone()),
                    used,
                    ceiling,
                });
            }
        }
        None
    }

    fn prospective_fraction(&self) -> f64 {
        match self.ceilings.max_total_calls {
            Some(ceiling) if ceiling > 0 => (self.used_total as f64 + 1.0) / ceiling as f64,
            _ => 0.0,
        }
    }

    /// Charge one call for a successfully executed step.
    pub fn record_success(&mut self, step: &PlanStep) {
        self.used_total += 1;
        *self.used_per_domain.entry(step.domain.clone()).or_insert(0) += 1;
        *self.used_per_tool.entry(step.tool.clone()).or_insert(0) += 1;
    }

    pub fn utilization(&self) -> BudgetUtilization {
        BudgetUtilization {
            total_used: self.used_total,
            total_ceiling: self.ceilings.max_total_calls,
            fraction: self
                .ceilings
                .max_total_calls
                .filter(|c| *c > 0)
                .map(|c| self.used_total as f64 / c as f64),
            per_domain: self.used_per_domain.clone(),
            per_tool: self.used_per_tool.clone(),
        }
    }
}

/// An ordered step list plus a resource budget, produced for one goal.
#[derive(Debug, Clone)]
pub struct Plan {
    pub plan_id: Uuid,
    pub goal: String,
    pub steps: Vec<PlanStep>,
    stage: PlanStage,
    pub budget: ToolBudget,
    pub trace_id: String,
}

impl Plan {
    pub fn stage(&self) -> PlanStage {
        self.stage
    }

    fn transition(&mut self, to: PlanStage) -> Result<(), PlanError> {
        use PlanStage::*;
        let allowed = matches!(
            (self.stage, to),
            (Created, Validated)
                | (Created, Failed)
                | (Validated, Executing)
                | (Validated, Failed)
                | (Executing, Completed)
                | (Executing, Failed)
        );
        if !allowed {
            return Err(PlanError::InvalidTransition {
                from: self.stage,
                to,
            });
        }
        self.stage = to;
        Ok(())
    }
}

/// Creates plans and drives their stage machine. Stateless; all state lives
/// on the plan itself.
#[derive(Debug, Clone, Default)]
pub struct PlanningAuthority;

impl PlanningAuthority {
    pub fn new() -> Self {
        Self
    }

    /// Build a plan in the `Created` stage with its budget attached. The
    /// budget is attached exactly once, here.
    pub fn create_plan(
        &self,
        goal: impl Into<String>,
        steps: Vec<PlanStep>,
        ceilings: BudgetCeilings,
        ctx: &ExecutionContext,
    ) -> Plan {
        Plan {
            plan_id: Uuid::new_v4(),
            goal: goal.into(),
            steps,
            stage: PlanStage::Created,
            budget: ToolBudget::new(ceilings),
            trace_id: ctx.trace_id().to_string(),
        }
    }

    /// Check well-formedness and budget feasibility. On success the plan
    /// moves to `Validated`; on failure it moves to `Failed` and the cause
    /// is returned.
    ///
    /// A total ceiling smaller than the step count is *not* an error: the
    /// caller may legitimately accept partial execution under a blocking
    /// policy. Infeasible means the budget can never admit a single step.
    pub fn validate(&self, plan: &mut Plan) -> Result<(), PlanError> {
        if let Err(cause) = Self::check_well_formed(plan) {
            plan.transition(PlanStage::Failed)?;
            return Err(cause);
        }
        plan.transition(PlanStage::Validated)
    }

    fn check_well_formed(plan: &Plan) -> Result<(), PlanError> {
        if plan.steps.is_empty() {
            return Err(PlanError::Validation("plan has no steps".into()));
        }

        let mut seen = std::collections::HashSet::new();
        for step in &plan.steps {
            if step.id.trim().is_empty() {
                return Err(PlanError::Validation("step with empty id".into()));
            }
            if !seen.insert(step.id.as_str()) {
                return Err(PlanError::Validation(format!(
                    "duplicate step id '{}'",
                    step.id
                )));
            }
            if step.tool.trim().is_empty() {
                return Err(PlanError::Validation(format!(
                    "step '{}' names no tool",
                    step.id
                )));
            }
        }

        let ceilings = plan.budget.ceilings();
        if !(0.0..=1.0).contains(&ceilings.warn_threshold) {
            return Err(PlanError::Validation(format!(
                "warn threshold {} outside [0, 1]",
                ceilings.warn_threshold
            )));
        }
        if ceilings.policy == BudgetPolicy::Block {
            if ceilings.max_total_calls == Some(0) {
                return Err(PlanError::Validation(
                    "blocking budget with a total ceiling of 0 can never execute a step".into(),
                ));
            }
            for step in &plan.steps {
                if ceilings.per_tool.get(&step.tool) == Some(&0)
                    || ceilings.per_domain.get(&step.domain) == Some(&0)
                {
                    return Err(PlanError::Validation(format!(
                        "step '{}' is barred by a zero ceiling",
                        step.id
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn begin_execution(&self, plan: &mut Plan) -> Result<(), PlanError> {
        plan.transition(PlanStage::Executing)
    }

    pub fn complete(&self, plan: &mut Plan) -> Result<(), PlanError> {
        plan.transition(PlanStage::Completed)
    }

    pub fn fail(&self, plan: &mut Plan) -> Result<(), PlanError> {
        plan.transition(PlanStage::Failed)
    }
}
