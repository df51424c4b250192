//! Append-only audit trail of planning and routing decisions.
//!
//! Observability is best-effort, never a correctness dependency: the
//! recording surface swallows storage failures with a warning and lets
//! orchestration continue. Queries do return errors; a caller asking for
//! history can handle one.
//!
//! Storage is a capability-set trait (`append`, `query`) with three
//! implementations behind it: an in-memory store for tests and defaults, an
//! append-only JSON-lines file, and an indexed sled store for higher-volume
//! deployments. All three share one contract test suite.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::planning::{Plan, PlanStage};
use crate::routing::RoutingDecision;

pub mod line_store;
pub mod sled_store;

pub use line_store::LineFileStore;
pub use sled_store::SledStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionType {
    Plan,
    Route,
}

/// One immutable decision record. Never mutated or deleted by the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub decision_type: DecisionType,
    pub trace_id: String,
    pub timestamp: DateTime<Utc>,
    pub target: String,
    pub reason: String,
    pub alternatives: Vec<String>,
    pub confidence: f64,
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Query filter. All fields are conjunctive; `limit` keeps the most recent
/// matches.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub trace_id: Option<String>,
    pub decision_type: Option<DecisionType>,
    pub limit: Option<usize>,
}

impl RecordFilter {
    pub fn for_trace(trace_id: impl Into<String>) -> Self {
        Self {
            trace_id: Some(trace_id.into()),
            ..Default::default()
        }
    }

    pub fn recent(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Default::default()
        }
    }

    pub fn of_type(decision_type: DecisionType, limit: usize) -> Self {
        Self {
            decision_type: Some(decision_type),
            limit: Some(limit),
            ..Default::default()
        }
    }

    pub(crate) fn matches(&self, record: &DecisionRecord) -> bool {
        if let Some(trace_id) = &self.trace_id {
            if &record.trace_id != trace_id {
                return false;
            }
        }
        if let Some(decision_type) = self.decision_type {
            if record.decision_type != decision_type {
                return false;
            }
        }
        true
    }
}

/// Keep the most recent `limit` records of an already-chronological list,
/// preserving chronological order.
pub(crate) fn apply_limit(mut records: Vec<DecisionRecord>, limit: Option<usize>) -> Vec<DecisionRecord> {
    if let Some(limit) = limit {
        if records.len() > limit {
            records.drain(..records.len() - limit);
        }
    }
    records
}

/// Storage backend contract. `query` returns records in chronological
/// (append) order.
#[async_trait]
pub trait DecisionStore: Send + Sync {
    async fn append(&self, record: &DecisionRecord) -> Result<()>;
    async fn query(&self, filter: &RecordFilter) -> Result<Vec<DecisionRecord>>;
}

/// In-memory store for tests and default wiring.
pub struct MemoryStore {
    records: RwLock<Vec<DecisionRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(Vec::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DecisionStore for MemoryStore {
    async fn append(&self, record: &DecisionRecord) -> Result<()> {
        self.records.write().push(record.clone());
        Ok(())
    }

    async fn query(&self, filter: &RecordFilter) -> Result<Vec<DecisionRecord>> {
        let records = self.records.read();
        let matched: Vec<_> = records.iter().filter(|r| filter.matches(r)).cloned().collect();
        Ok(apply_limit(matched, filter.limit))
    }
}

/// Recording and query facade over a `DecisionStore`.
#[derive(Clone)]
pub struct AuditTrail {
    store: Arc<dyn DecisionStore>,
}

impl AuditTrail {
    pub fn new(store: Arc<dyn DecisionStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Append one record for a plan stage transition. Storage failures are
    /// logged and swallowed.
    pub async fn record_plan(&self, plan: &Plan, stage: PlanStage) {
        let mut metadata = HashMap::new();
        metadata.insert("plan_id".into(), serde_json::json!(plan.plan_id));
        metadata.insert("stage".into(), serde_json::json!(stage));
        metadata.insert("step_count".into(), serde_json::json!(plan.steps.len()));

        let record = DecisionRecord {
            decision_type: DecisionType::Plan,
            trace_id: plan.trace_id.clone(),
            timestamp: Utc::now(),
            target: plan.goal.clone(),
            reason: format!(
                "plan {} entered stage {} with {} steps",
                plan.plan_id,
                stage,
                plan.steps.len()
            ),
            alternatives: plan.steps.iter().map(|s| s.id.clone()).collect(),
            confidence: 1.0,
            metadata,
        };

        if let Err(e) = self.store.append(&record).await {
            warn!("Failed to record plan decision, continuing: {e:#}");
        }
    }

    /// Append one record for a routing decision. Storage failures are
    /// logged and swallowed.
    pub async fn record_routing_decision(
        &self,
        decision: &RoutingDecision,
        trace_id: &str,
        stage: &str,
    ) {
        let mut metadata = decision.metadata.clone();
        metadata.insert("stage".into(), serde_json::json!(stage));

        let record = DecisionRecord {
            decision_type: DecisionType::Route,
            trace_id: trace_id.to_string(),
            timestamp: Utc::now(),
            target: decision.target.clone(),
            reason: decision.reason.clone(),
            alternatives: decision.fallback.iter().cloned().collect(),
            confidence: decision.confidence,
            metadata,
        };

        if let Err(e) = self.store.append(&record).await {
            warn!("Failed to record routing decision, continuing: {e:#}");
        }
    }

    /// Everything recorded for one trace, chronological, mixed record types.
    pub async fn get_trace_history(&self, trace_id: &str) -> Result<Vec<DecisionRecord>> {
        self.store.query(&RecordFilter::for_trace(trace_id)).await
    }

    pub async fn get_recent(&self, limit: usize) -> Result<Vec<DecisionRecord>> {
        self.store.query(&RecordFilter::recent(limit)).await
    }

    pub async fn get_routing_history(&self, limit: usize) -> Result<Vec<DecisionRecord>> {
        self.store
            .query(&RecordFilter::of_type(DecisionType::Route, limit))
            .await
    }

    pub async fn get_planning_history(&self, limit: usize) -> Result<Vec<DecisionRecord>> {
        self.store
            .query(&RecordFilter::of_type(DecisionType::Plan, limit))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    pub(crate) fn record(trace_id: &str, decision_type: DecisionType, target: &str) -> DecisionRecord {
        DecisionRecord {
            decision_type,
            trace_id: trace_id.to_string(),
            timestamp: Utc::now(),
            target: target.to_string(),
            reason: "test".into(),
            alternatives: vec![],
            confidence: 1.0,
            metadata: HashMap::new(),
        }
    }

    struct FailingStore;

    #[async_trait]
    impl DecisionStore for FailingStore {
        async fn append(&self, _record: &DecisionRecord) -> Result<()> {
            Err(anyhow!("disk on fire"))
        }

        async fn query(&self, _filter: &RecordFilter) -> Result<Vec<DecisionRecord>> {
            Err(anyhow!("disk on fire"))
        }
    }

    #[tokio::test]
    async fn memory_store_round_trip() {
        let store = MemoryStore::new();
        store.append(&record("t1", DecisionType::Route, "alpha")).await.unwrap();
        store.append(&record("t2", DecisionType::Plan, "goal")).await.unwrap();
        store.append(&record("t1", DecisionType::Plan, "goal")).await.unwrap();

        let t1 = store.query(&RecordFilter::for_trace("t1")).await.unwrap();
        assert_eq!(t1.len(), 2);

        let routes = store
            .query(&RecordFilter::of_type(DecisionType::Route, 10))
            .await
            .unwrap();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].target, "alpha");
    }

    #[tokio::test]
    async fn limit_keeps_most_recent() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store
                .append(&record("t", DecisionType::Route, &format!("w{i}")))
                .await
                .unwrap();
        }
        let recent = store.query(&RecordFilter::recent(2)).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].target, "w3");
        assert_eq!(recent[1].target, "w4");
    }

    #[tokio::test]
    async fn recording_swallows_store_failures() {
        let trail = AuditTrail::new(Arc::new(FailingStore));
        let decision = RoutingDecision {
            target: "alpha".into(),
            reason: "test".into(),
            fallback: None,
            confidence: 1.0,
            metadata: HashMap::new(),
        };
        // Must not panic or propagate.
        trail.record_routing_decision(&decision, "t1", "route").await;
    }

    #[tokio::test]
    async fn queries_propagate_store_failures() {
        let trail = AuditTrail::new(Arc::new(FailingStore));
        assert!(trail.get_recent(5).await.is_err());
    }
}
