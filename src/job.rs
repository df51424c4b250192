//! Job-file execution for the CLI.
//!
//! A job file is the minimal "surrounding application": it supplies a goal,
//! an optional caller trace id, a profile, a step list and budget ceilings.
//! This module loads and validates the file, wires a coordinator from
//! settings, runs it and prints a summary.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, instrument};

use crate::approval::ApprovalGate;
use crate::audit::AuditTrail;
use crate::coordinator::{Coordinator, OrchestrationRequest, OrchestrationReport, RunStatus};
use crate::planning::{BudgetCeilings, PlanStep, RiskLevel};
use crate::settings::Settings;
use crate::worker::{EchoWorker, WorkerRegistry};

/// Job configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub job: JobMetadata,

    /// The goal the step list serves.
    pub goal: String,

    #[serde(default)]
    pub profile: Option<String>,

    #[serde(default)]
    pub trace_id: Option<String>,

    pub steps: Vec<StepConfig>,

    /// Ceilings for this job; settings-level defaults apply when absent.
    #[serde(default)]
    pub budget: Option<BudgetCeilings>,

    /// Output file for the JSON report.
    #[serde(default)]
    pub output_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobMetadata {
    pub name: String,
    pub description: Option<String>,
    pub version: String,

    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepConfig {
    pub id: String,

    #[serde(default)]
    pub name: Option<String>,

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

impl From<StepConfig> for PlanStep {
    fn from(config: StepConfig) -> Self {
        PlanStep {
            name: config.name.unwrap_or_else(|| config.id.clone()),
            id: config.id,
            tool: config.tool,
            domain: config.domain,
            input: config.input,
            required_capability: config.required_capability,
            requires_approval: config.requires_approval,
            risk: config.risk,
        }
    }
}

/// Execute a job from a configuration file.
#[instrument(skip(settings))]
pub async fn run(config_path: PathBuf, settings: Settings) -> Result<()> {
    info!("Starting job execution from config: {:?}", config_path);

    let config = load_job_config(&config_path).context("Failed to load job configuration")?;
    info!("Loaded job: {} (version: {})", config.job.name, config.job.version);

    let output_file = config.output_file.clone();
    let coordinator = build_coordinator(&settings)?;

    let request = OrchestrationRequest {
        goal: config.goal,
        steps: Some(config.steps.into_iter().map(PlanStep::from).collect()),
        ceilings: config
            .budget
            .unwrap_or_else(|| settings.budget.to_ceilings()),
        profile: config.profile.unwrap_or_else(|| "cli".to_string()),
        trace_id: config.trace_id,
    };

    let report = coordinator.run(request).await;
    print_job_summary(&config.job.name, &report);

    if let Some(ref path) = output_file {
        save_report(&report, path).context("Failed to save job report")?;
    }

    match report.status {
        RunStatus::Completed => Ok(()),
        RunStatus::Cancelled => Err(anyhow!("job '{}' was cancelled", config.job.name)),
        RunStatus::Failed => Err(anyhow!(
            "job '{}' failed: {}",
            config.job.name,
            report.error.as_deref().unwrap_or("unknown error")
        )),
    }
}

/// Print the audit history for one trace.
pub async fn history(trace_id: &str, limit: usize, settings: Settings) -> Result<()> {
    let trail = AuditTrail::new(settings.audit.build_store()?);
    let records = trail.get_trace_history(trace_id).await?;

    if records.is_empty() {
        println!("No records for trace '{trace_id}'");
        return Ok(());
    }

    for record in records.iter().rev().take(limit).rev() {
        println!(
            "{}  {:?}  {}  {}",
            record.timestamp.to_rfc3339(),
            record.decision_type,
            record.target,
            record.reason
        );
    }
    Ok(())
}

fn build_coordinator(settings: &Settings) -> Result<Coordinator> {
    let registry = Arc::new(WorkerRegistry::new());
    registry.register(Arc::new(EchoWorker));

    Ok(Coordinator::builder()
        .registry(registry)
        .routing(settings.routing.to_config())
        .gate(Arc::new(ApprovalGate::new(settings.approval.to_policy())))
        .audit(AuditTrail::new(settings.audit.build_store()?))
        .retry(settings.retry.to_policy()?)
        .build())
}

fn load_job_config(config_path: &PathBuf) -> Result<JobConfig> {
    let contents = std::fs::read_to_string(config_path)
        .with_context(|| format!("Failed to read config file: {config_path:?}"))?;

    let config: JobConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse TOML config: {config_path:?}"))?;

    validate_job_config(&config)?;
    Ok(config)
}

fn validate_job_config(config: &JobConfig) -> Result<()> {
    if config.steps.is_empty() {
        return Err(anyhow!("Job configuration must contain at least one step"));
    }

    let mut step_ids = std::collections::HashSet::new();
    for step in &config.steps {
        if !step_ids.insert(&step.id) {
            return Err(anyhow!("Duplicate step id: {}", step.id));
        }
    }
    Ok(())
}

fn print_job_summary(job_name: &str, report: &OrchestrationReport) {
    println!("\n=== Job Summary ===");
    println!("Job: {job_name}");
    println!("Trace: {}", report.trace_id);
    println!("Status: {:?}", report.status);
    println!("Steps: {}", report.steps.len());
    println!("Succeeded: {}", report.succeeded);
    println!("Failed: {}", report.failed);
    println!("Blocked: {}", report.blocked);

    if let Some(budget) = &report.budget {
        match (budget.total_ceiling, budget.fraction) {
            (Some(ceiling), Some(fraction)) => println!(
                "Budget: {}/{} calls ({:.0}%)",
                budget.total_used,
                ceiling,
                fraction * 100.0
            ),
            _ => println!("Budget: {} calls, no total ceiling", budget.total_used),
        }
    }

    if !report.warnings.is_empty() {
        println!("\nWarnings:");
        for warning in &report.warnings {
            println!("  - {warning}");
        }
    }

    let problems: Vec<_> = report
        .steps
        .iter()
        .filter(|s| s.status != crate::coordinator::StepStatus::Succeeded)
        .collect();
    if !problems.is_empty() {
        println!("\nUnsuccessful steps:");
        for step in problems {
            println!(
                "  - {} ({:?}): {}",
                step.step_id,
                step.status,
                step.error.as_deref().unwrap_or("no detail")
            );
        }
    }
    println!("===================\n");
}

fn save_report(report: &OrchestrationReport, output_file: &PathBuf) -> Result<()> {
    let json = serde_json::to_string_pretty(report).context("Failed to serialize job report")?;
    std::fs::write(output_file, json)
        .with_context(|| format!("Failed to write report to: {output_file:?}"))?;
    info!("Job report saved to: {:?}", output_file);
    Ok(())
}
