//! Configuration management with environment variable support and
//! validation.
//!
//! Layered sources: built-in defaults, an optional `overseer.toml` next to
//! the process, then `OVERSEER__`-prefixed environment variables.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::approval::ApprovalPolicy;
use crate::audit::{DecisionStore, LineFileStore, MemoryStore, SledStore};
use crate::planning::{BudgetCeilings, BudgetPolicy};
use crate::retry::RetryPolicy;
use crate::routing::{RoutingConfig, RoutingStrategy};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "text"
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingSettings {
    pub strategy: RoutingStrategy,
    pub default_target: Option<String>,
    pub fail_closed: bool,
}

impl Default for RoutingSettings {
    fn default() -> Self {
        Self {
            strategy: RoutingStrategy::RoundRobin,
            default_target: None,
            fail_closed: false,
        }
    }
}

impl RoutingSettings {
    pub fn to_config(&self) -> RoutingConfig {
        RoutingConfig {
            strategy: self.strategy,
            default_target: self.default_target.clone(),
            fail_closed: self.fail_closed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalSettings {
    pub enabled: bool,
    pub timeout_seconds: u64,
    pub auto_approve_on_timeout: bool,
}

impl Default for ApprovalSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_seconds: 60,
            auto_approve_on_timeout: false,
        }
    }
}

impl ApprovalSettings {
    pub fn to_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy {
            enabled: self.enabled,
            timeout: Duration::from_secs(self.timeout_seconds),
            auto_approve_on_timeout: self.auto_approve_on_timeout,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub policy: String, // "none", "linear", "exponential"
    pub delay_ms: u64,
    pub max_attempts: u32,
    pub max_delay_ms: u64,
    pub jitter: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            policy: "exponential".to_string(),
            delay_ms: 250,
            max_attempts: 3,
            max_delay_ms: 30_000,
            jitter: 0.2,
        }
    }
}

impl RetrySettings {
    pub fn to_policy(&self) -> Result<RetryPolicy> {
        match self.policy.as_str() {
            "none" => Ok(RetryPolicy::None),
            "linear" => Ok(RetryPolicy::Linear {
                delay: Duration::from_millis(self.delay_ms),
                max_attempts: self.max_attempts,
            }),
            "exponential" => Ok(RetryPolicy::Exponential {
                base: Duration::from_millis(self.delay_ms),
                max_attempts: self.max_attempts,
                max_delay: Duration::from_millis(self.max_delay_ms),
                jitter: self.jitter,
            }),
            other => Err(anyhow!("unknown retry policy '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditSettings {
    pub backend: String, // "memory", "file", "sled"
    pub path: PathBuf,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            backend: "file".to_string(),
            path: PathBuf::from("audit/decisions.jsonl"),
        }
    }
}

impl AuditSettings {
    pub fn build_store(&self) -> Result<Arc<dyn DecisionStore>> {
        match self.backend.as_str() {
            "memory" => Ok(Arc::new(MemoryStore::new())),
            "file" => Ok(Arc::new(LineFileStore::open(&self.path)?)),
            "sled" => Ok(Arc::new(SledStore::open(&self.path)?)),
            other => Err(anyhow!("unknown audit backend '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetSettings {
    pub max_total_calls: Option<u32>,
    pub warn_threshold: f64,
    pub policy: BudgetPolicy,
}

impl Default for BudgetSettings {
    fn default() -> Self {
        Self {
            max_total_calls: None,
            warn_threshold: 0.8,
            policy: BudgetPolicy::Block,
        }
    }
}

impl BudgetSettings {
    pub fn to_ceilings(&self) -> BudgetCeilings {
        BudgetCeilings {
            max_total_calls: self.max_total_calls,
            warn_threshold: self.warn_threshold,
            policy: self.policy,
            ..Default::default()
        }
    }
}

/// Main settings structure with all configuration sections.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub logging: LoggingConfig,
    pub routing: RoutingSettings,
    pub approval: ApprovalSettings,
    pub retry: RetrySettings,
    pub audit: AuditSettings,
    pub budget: BudgetSettings,
}

impl Settings {
    /// Load settings from the optional config file and environment
    /// variables.
    pub fn load() -> Result<Self> {
        let config = Config::builder()
            .add_source(File::with_name("overseer").required(false))
            .add_source(
                Environment::with_prefix("OVERSEER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Settings = config.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate settings for consistency.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.budget.warn_threshold) {
            return Err(anyhow!(
                "budget warn threshold {} outside [0, 1]",
                self.budget.warn_threshold
            ));
        }
        if self.retry.jitter < 0.0 || self.retry.jitter >= 1.0 {
            return Err(anyhow!("retry jitter {} outside [0, 1)", self.retry.jitter));
        }
        // Fails early instead of at first use.
        self.retry.to_policy()?;
        if !matches!(self.audit.backend.as_str(), "memory" | "file" | "sled") {
            return Err(anyhow!("unknown audit backend '{}'", self.audit.backend));
        }
        if self.audit.backend == "memory" {
            warn!("audit backend 'memory' keeps no durable trail");
        }
        if self.approval.enabled && self.approval.timeout_seconds == 0 {
            return Err(anyhow!("approval timeout of 0 seconds can never resolve"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(Settings::default().validate().is_ok());
    }

    #[test]
    fn bad_warn_threshold_rejected() {
        let mut settings = Settings::default();
        settings.budget.warn_threshold = 1.5;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn unknown_retry_policy_rejected() {
        let mut settings = Settings::default();
        settings.retry.policy = "fibonacci".into();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn zero_approval_timeout_rejected() {
        let mut settings = Settings::default();
        settings.approval.timeout_seconds = 0;
        assert!(settings.validate().is_err());

        settings.approval.enabled = false;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn retry_settings_build_the_right_policy() {
        let mut settings = RetrySettings::default();
        settings.policy = "linear".into();
        settings.delay_ms = 100;
        settings.max_attempts = 5;

        match settings.to_policy().unwrap() {
            RetryPolicy::Linear {
                delay,
                max_attempts,
            } => {
                assert_eq!(delay, Duration::from_millis(100));
                assert_eq!(max_attempts, 5);
            }
            other => panic!("expected linear policy, got {other:?}"),
        }
    }

    #[test]
    fn audit_settings_build_each_backend() {
        let dir = tempfile::tempdir().unwrap();

        let memory = AuditSettings {
            backend: "memory".into(),
            path: PathBuf::new(),
        };
        assert!(memory.build_store().is_ok());

        let file = AuditSettings {
            backend: "file".into(),
            path: dir.path().join("decisions.jsonl"),
        };
        assert!(file.build_store().is_ok());

        let sled = AuditSettings {
            backend: "sled".into(),
            path: dir.path().join("sled"),
        };
        assert!(sled.build_store().is_ok());

        let unknown = AuditSettings {
            backend: "postgres".into(),
            path: PathBuf::new(),
        };
        assert!(unknown.build_store().is_err());
    }
}
