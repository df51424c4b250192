//! Routing authority: one deterministic, justified routing decision per
//! task.
//!
//! For fixed policy state, identical inputs produce identical targets; the
//! audit trail and the tests both depend on that. Routing never executes
//! anything; it only decides.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::context::ExecutionContext;
use crate::error::RoutingError;
use crate::planning::PlanStep;
use crate::worker::WorkerInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingStrategy {
    /// Cycle candidates in registration order.
    #[default]
    RoundRobin,
    /// First candidate declaring the step's required capability tag.
    CapabilityBased,
    /// Lowest in-flight count, ties broken by registration order.
    LoadBalanced,
}

#[derive(Debug, Clone, Default)]
pub struct RoutingConfig {
    pub strategy: RoutingStrategy,
    /// Target of last resort when no candidate is eligible.
    pub default_target: Option<String>,
    /// When set, no-eligible-candidate is an error instead of a degraded
    /// decision.
    pub fail_closed: bool,
}

/// One routing decision. Fresh per call, immutable, persisted only through
/// the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub target: String,
    pub reason: String,
    pub fallback: Option<String>,
    pub confidence: f64,
    pub metadata: HashMap<String, serde_json::Value>,
}

pub struct RoutingAuthority {
    config: RoutingConfig,
    /// Round-robin position. This is the only mutable policy state.
    cursor: Mutex<usize>,
}

impl RoutingAuthority {
    pub fn new(config: RoutingConfig) -> Self {
        Self {
            config,
            cursor: Mutex::new(0),
        }
    }

    pub fn strategy(&self) -> RoutingStrategy {
        self.config.strategy
    }

    /// Decide which worker should run `task`.
    ///
    /// `candidates` must be in registration order. With more than one viable
    /// candidate the decision names a fallback; with none it degrades to the
    /// configured default (or errors when fail-closed).
    pub fn route(
        &self,
        task: &PlanStep,
        ctx: &ExecutionContext,
        candidates: &[WorkerInfo],
    ) -> Result<RoutingDecision, RoutingError> {
        let decision = match self.config.strategy {
            RoutingStrategy::RoundRobin => self.route_round_robin(task, candidates),
            RoutingStrategy::CapabilityBased => self.route_by_capability(task, candidates),
            RoutingStrategy::LoadBalanced => self.route_by_load(task, candidates),
        };

        match decision {
            Some(decision) => {
                debug!(
                    trace_id = ctx.trace_id(),
                    step = task.id.as_str(),
                    target = decision.target.as_str(),
                    "routing decision made"
                );
                Ok(decision)
            }
            None => self.degraded(task, candidates),
        }
    }

    fn route_round_robin(&self, task: &PlanStep, candidates: &[WorkerInfo]) -> Option<RoutingDecision> {
        if candidates.is_empty() {
            return None;
        }
        let mut cursor = self.cursor.lock();
        let index = *cursor % candidates.len();
        *cursor = cursor.wrapping_add(1);

        let chosen = &candidates[index];
        let fallback = (candidates.len() > 1)
            .then(|| candidates[(index + 1) % candidates.len()].name.clone());

        Some(RoutingDecision {
            target: chosen.name.clone(),
            reason: format!(
                "round-robin position {} of {} for step '{}'",
                index + 1,
                candidates.len(),
                task.id
            ),
            fallback,
            confidence: 1.0,
            metadata: Self::base_metadata(RoutingStrategy::RoundRobin, candidates.len()),
        })
    }

    fn route_by_capability(&self, task: &PlanStep, candidates: &[WorkerInfo]) -> Option<RoutingDecision> {
        let required = task.required_capability.as_deref().unwrap_or(&task.tool);
        let mut viable = candidates
            .iter()
            .filter(|c| c.capabilities.iter().any(|cap| cap == required));

        let chosen = viable.next()?;
        let fallback = viable.next().map(|c| c.name.clone());
        let confidence = if fallback.is_some() { 0.8 } else { 1.0 };

        let mut metadata = Self::base_metadata(RoutingStrategy::CapabilityBased, candidates.len());
        metadata.insert("required_capability".into(), json!(required));

        Some(RoutingDecision {
            target: chosen.name.clone(),
            reason: format!(
                "first of {} candidates declaring capability '{}'",
                candidates.len(),
                required
            ),
            fallback,
            confidence,
            metadata,
        })
    }

    fn route_by_load(&self, task: &PlanStep, candidates: &[WorkerInfo]) -> Option<RoutingDecision> {
        // min_by_key keeps the first minimum, which is registration order.
        let chosen = candidates.iter().min_by_key(|c| (c.in_flight, c.registration_index))?;
        let fallback = candidates
            .iter()
            .filter(|c| c.name != chosen.name)
            .min_by_key(|c| (c.in_flight, c.registration_index))
            .map(|c| c.name.clone());

        let mut metadata = Self::base_metadata(RoutingStrategy::LoadBalanced, candidates.len());
        metadata.insert("in_flight".into(), json!(chosen.in_flight));

        Some(RoutingDecision {
            target: chosen.name.clone(),
            reason: format!(
                "lowest in-flight count ({}) among {} candidates for step '{}'",
                chosen.in_flight,
                candidates.len(),
                task.id
            ),
            fallback,
            confidence: 0.9,
            metadata,
        })
    }

    fn degraded(
        &self,
        task: &PlanStep,
        candidates: &[WorkerInfo],
    ) -> Result<RoutingDecision, RoutingError> {
        if self.config.fail_closed {
            return Err(RoutingError::NoEligibleWorker {
                task: task.id.clone(),
            });
        }

        let target = self
            .config
            .default_target
            .clone()
            .or_else(|| candidates.first().map(|c| c.name.clone()))
            .ok_or_else(|| RoutingError::NoEligibleWorker {
                task: task.id.clone(),
            })?;

        let mut metadata = Self::base_metadata(self.config.strategy, candidates.len());
        metadata.insert("degraded".into(), json!(true));

        Ok(RoutingDecision {
            target: target.clone(),
            reason: format!(
                "degraded routing: no eligible candidate for step '{}', using designated default '{}'",
                task.id, target
            ),
            fallback: None,
            confidence: 0.2,
            metadata,
        })
    }

    fn base_metadata(
        strategy: RoutingStrategy,
        candidate_count: usize,
    ) -> HashMap<String, serde_json::Value> {
        let mut metadata = HashMap::new();
        metadata.insert("strategy".into(), json!(strategy));
        metadata.insert("candidates".into(), json!(candidate_count));
        metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(name: &str, caps: &[&str], in_flight: usize, index: usize) -> WorkerInfo {
        WorkerInfo {
            name: name.to_string(),
            capabilities: caps.iter().map(|c| c.to_string()).collect(),
            in_flight,
            registration_index: index,
        }
    }

    fn roster() -> Vec<WorkerInfo> {
        vec![
            info("alpha", &["echo"], 2, 0),
            info("bravo", &["score"], 0, 1),
            info("charlie", &["echo", "score"], 1, 2),
        ]
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext::with_trace_id("test", "trace-route")
    }

    fn step(id: &str) -> PlanStep {
        PlanStep::new(id, "echo", "testing")
    }

    #[test]
    fn round_robin_cycles_in_registration_order() {
        let authority = RoutingAuthority::new(RoutingConfig::default());
        let roster = roster();

        let targets: Vec<_> = (0..4)
            .map(|i| {
                authority
                    .route(&step(&format!("s{i}")), &ctx(), &roster)
                    .unwrap()
                    .target
            })
            .collect();
        assert_eq!(targets, vec!["alpha", "bravo", "charlie", "alpha"]);
    }

    #[test]
    fn round_robin_names_a_fallback_when_viable() {
        let authority = RoutingAuthority::new(RoutingConfig::default());
        let decision = authority.route(&step("s"), &ctx(), &roster()).unwrap();
        assert_eq!(decision.fallback.as_deref(), Some("bravo"));
        assert!(!decision.reason.is_empty());
    }

    #[test]
    fn capability_routing_picks_first_match() {
        let authority = RoutingAuthority::new(RoutingConfig {
            strategy: RoutingStrategy::CapabilityBased,
            ..Default::default()
        });
        let mut task = step("s");
        task.required_capability = Some("score".into());

        let decision = authority.route(&task, &ctx(), &roster()).unwrap();
        assert_eq!(decision.target, "bravo");
        assert_eq!(decision.fallback.as_deref(), Some("charlie"));
    }

    #[test]
    fn capability_routing_is_deterministic() {
        let task = {
            let mut t = step("s");
            t.required_capability = Some("echo".into());
            t
        };
        let roster = roster();
        // Fresh authority each call: stateless strategy, same inputs, same target.
        for _ in 0..10 {
            let authority = RoutingAuthority::new(RoutingConfig {
                strategy: RoutingStrategy::CapabilityBased,
                ..Default::default()
            });
            let decision = authority.route(&task, &ctx(), &roster).unwrap();
            assert_eq!(decision.target, "alpha");
        }
    }

    #[test]
    fn load_balanced_picks_lowest_in_flight() {
        let authority = RoutingAuthority::new(RoutingConfig {
            strategy: RoutingStrategy::LoadBalanced,
            ..Default::default()
        });
        let decision = authority.route(&step("s"), &ctx(), &roster()).unwrap();
        assert_eq!(decision.target, "bravo");
        assert_eq!(decision.fallback.as_deref(), Some("charlie"));
    }

    #[test]
    fn load_balanced_breaks_ties_by_registration_order() {
        let authority = RoutingAuthority::new(RoutingConfig {
            strategy: RoutingStrategy::LoadBalanced,
            ..Default::default()
        });
        let roster = vec![
            info("alpha", &[], 1, 0),
            info("bravo", &[], 1, 1),
        ];
        let decision = authority.route(&step("s"), &ctx(), &roster).unwrap();
        assert_eq!(decision.target, "alpha");
    }

    #[test]
    fn no_capability_match_degrades_to_default() {
        let authority = RoutingAuthority::new(RoutingConfig {
            strategy: RoutingStrategy::CapabilityBased,
            default_target: Some("fallback_pool".into()),
            fail_closed: false,
        });
        let mut task = step("s");
        task.required_capability = Some("translate".into());

        let decision = authority.route(&task, &ctx(), &roster()).unwrap();
        assert_eq!(decision.target, "fallback_pool");
        assert!(decision.reason.contains("degraded"));
        assert_eq!(decision.metadata.get("degraded"), Some(&json!(true)));
    }

    #[test]
    fn fail_closed_turns_degraded_into_error() {
        let authority = RoutingAuthority::new(RoutingConfig {
            strategy: RoutingStrategy::CapabilityBased,
            default_target: Some("fallback_pool".into()),
            fail_closed: true,
        });
        let mut task = step("s");
        task.required_capability = Some("translate".into());

        let err = authority.route(&task, &ctx(), &roster()).unwrap_err();
        assert!(matches!(err, RoutingError::NoEligibleWorker { .. }));
    }

    #[test]
    fn empty_roster_without_default_errors() {
        let authority = RoutingAuthority::new(RoutingConfig::default());
        let err = authority.route(&step("s"), &ctx(), &[]).unwrap_err();
        assert!(matches!(err, RoutingError::NoEligibleWorker { .. }));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            // Stateless strategies must return the same target for the same
            // inputs, whatever the roster shape.
            #[test]
            fn load_balanced_is_deterministic(loads in proptest::collection::vec(0usize..10, 1..8)) {
                let roster: Vec<WorkerInfo> = loads
                    .iter()
                    .enumerate()
                    .map(|(i, &load)| info(&format!("w{i}"), &[], load, i))
                    .collect();
                let task = step("p");
                let ctx = ctx();

                let first = RoutingAuthority::new(RoutingConfig {
                    strategy: RoutingStrategy::LoadBalanced,
                    ..Default::default()
                })
                .route(&task, &ctx, &roster)
                .unwrap();
                let second = RoutingAuthority::new(RoutingConfig {
                    strategy: RoutingStrategy::LoadBalanced,
                    ..Default::default()
                })
                .route(&task, &ctx, &roster)
                .unwrap();

                prop_assert_eq!(first.target, second.target);
            }
        }
    }
}
