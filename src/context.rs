//! Immutable per-request execution context.
//!
//! One context is built per top-level orchestration request. Derivations
//! (`child`, `with_metadata`) produce new instances that share the trace id;
//! the original is never mutated. Cancellation is cooperative: the context
//! carries a token that downstream waits select on.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ExecutionContext {
    trace_id: String,
    profile: String,
    metadata: BTreeMap<String, String>,
    parent: Option<Arc<ExecutionContext>>,
    cancellation: CancellationToken,
}

impl ExecutionContext {
    /// Build a root context with a freshly generated trace id.
    pub fn new(profile: impl Into<String>) -> Self {
        Self::with_trace_id(profile, Uuid::new_v4().to_string())
    }

    /// Build a root context carrying a caller-supplied trace id.
    pub fn with_trace_id(profile: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
            profile: profile.into(),
            metadata: BTreeMap::new(),
            parent: None,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn profile(&self) -> &str {
        &self.profile
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    /// Derive a context with one more metadata entry. The receiver is left
    /// untouched; the derivation shares trace id and cancellation token.
    pub fn with_metadata(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut derived = self.clone();
        derived.metadata.insert(key.into(), value.into());
        derived
    }

    /// Derive a child context for a nested call. The child holds a child
    /// cancellation token, so cancelling the parent cancels the child but
    /// not the other way around.
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            profile: self.profile.clone(),
            metadata: self.metadata.clone(),
            parent: Some(Arc::new(self.clone())),
            cancellation: self.cancellation.child_token(),
        }
    }

    pub fn parent(&self) -> Option<&ExecutionContext> {
        self.parent.as_deref()
    }

    /// Number of derivation hops back to the root context.
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut cursor = self.parent.as_deref();
        while let Some(ctx) = cursor {
            depth += 1;
            cursor = ctx.parent.as_deref();
        }
        depth
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Signal cooperative cancellation for this context and its children.
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_shares_trace_id() {
        let root = ExecutionContext::with_trace_id("sales", "trace-42");
        let derived = root.with_metadata("step", "1");
        let child = derived.child();

        assert_eq!(root.trace_id(), "trace-42");
        assert_eq!(derived.trace_id(), "trace-42");
        assert_eq!(child.trace_id(), "trace-42");
        assert_eq!(child.depth(), 1);
        assert_eq!(root.depth(), 0);
    }

    #[test]
    fn with_metadata_does_not_mutate_receiver() {
        let root = ExecutionContext::new("ops");
        let derived = root.with_metadata("key", "value");

        assert!(root.metadata().is_empty());
        assert_eq!(derived.metadata().get("key").map(String::as_str), Some("value"));
    }

    #[test]
    fn metadata_iterates_in_key_order() {
        let ctx = ExecutionContext::new("ops")
            .with_metadata("zeta", "1")
            .with_metadata("alpha", "2");
        let keys: Vec<_> = ctx.metadata().keys().cloned().collect();
        assert_eq!(keys, vec!["alpha".to_string(), "zeta".to_string()]);
    }

    #[test]
    fn parent_cancellation_reaches_children() {
        let root = ExecutionContext::new("ops");
        let child = root.child();
        assert!(!child.is_cancelled());

        root.cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn child_cancellation_stays_local() {
        let root = ExecutionContext::new("ops");
        let child = root.child();

        child.cancel();
        assert!(child.is_cancelled());
        assert!(!root.is_cancelled());
    }
}
