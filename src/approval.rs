//! Human-in-the-loop approval gate.
//!
//! Each request runs a small state machine: PENDING, then exactly one of
//! APPROVED, DENIED, TIMEOUT or CANCELLED. Resolution comes from a manual
//! `respond` call, a registered decision callback, or the timeout handler.
//! Pending requests are independent: concurrent waits never block each
//! other, and each wakes on its own context's cancellation.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::context::ExecutionContext;
use crate::error::GateError;
use crate::planning::RiskLevel;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalPolicy {
    pub enabled: bool,
    pub timeout: Duration,
    pub auto_approve_on_timeout: bool,
}

impl Default for ApprovalPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout: Duration::from_secs(60),
            auto_approve_on_timeout: false,
        }
    }
}

impl ApprovalPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
    Timeout,
    Cancelled,
}

impl ApprovalStatus {
    pub fn is_approved(self) -> bool {
        self == Self::Approved
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub request_id: Uuid,
    pub operation: String,
    pub trace_id: String,
    pub risk: RiskLevel,
    pub requester: String,
}

impl ApprovalRequest {
    pub fn new(
        operation: impl Into<String>,
        trace_id: impl Into<String>,
        risk: RiskLevel,
        requester: impl Into<String>,
    ) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            operation: operation.into(),
            trace_id: trace_id.into(),
            risk,
            requester: requester.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalResponse {
    pub request_id: Uuid,
    pub status: ApprovalStatus,
    pub approver: Option<String>,
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ApprovalResponse {
    fn now(request_id: Uuid, status: ApprovalStatus) -> Self {
        Self {
            request_id,
            status,
            approver: None,
            reason: None,
            timestamp: Utc::now(),
        }
    }
}

/// Verdict produced by a programmatic decision callback.
#[derive(Debug, Clone)]
pub struct GateDecision {
    pub approved: bool,
    pub approver: String,
    pub reason: Option<String>,
}

type DecisionFn = Arc<dyn Fn(&ApprovalRequest) -> GateDecision + Send + Sync>;

struct PendingEntry {
    request: ApprovalRequest,
    resolver: oneshot::Sender<ApprovalResponse>,
}

pub struct ApprovalGate {
    policy: ApprovalPolicy,
    pending: DashMap<Uuid, PendingEntry>,
    callback: RwLock<Option<DecisionFn>>,
}

impl ApprovalGate {
    pub fn new(policy: ApprovalPolicy) -> Self {
        Self {
            policy,
            pending: DashMap::new(),
            callback: RwLock::new(None),
        }
    }

    pub fn policy(&self) -> &ApprovalPolicy {
        &self.policy
    }

    /// Register a decision function; subsequent requests resolve through it
    /// immediately, with no external input.
    pub fn set_callback(&self, callback: impl Fn(&ApprovalRequest) -> GateDecision + Send + Sync + 'static) {
        *self.callback.write() = Some(Arc::new(callback));
    }

    pub fn clear_callback(&self) {
        *self.callback.write() = None;
    }

    /// Wait for the request to resolve.
    ///
    /// Resolution order: disabled policy (immediate approve), registered
    /// callback, then a pending wait racing the manual `respond` path
    /// against the policy timeout and the context's cancellation token.
    #[instrument(skip(self, ctx), fields(request_id = %request.request_id))]
    pub async fn await_decision(
        &self,
        request: ApprovalRequest,
        ctx: &ExecutionContext,
    ) -> Result<ApprovalResponse, GateError> {
        let request_id = request.request_id;

        if !self.policy.enabled {
            debug!("approval policy disabled, auto-approving");
            let mut response = ApprovalResponse::now(request_id, ApprovalStatus::Approved);
            response.approver = Some("policy:disabled".into());
            return Ok(response);
        }

        let callback = self.callback.read().clone();
        if let Some(decide) = callback {
            let verdict = decide(&request);
            let status = if verdict.approved {
                ApprovalStatus::Approved
            } else {
                ApprovalStatus::Denied
            };
            debug!(?status, "resolved by registered callback");
            let mut response = ApprovalResponse::now(request_id, status);
            response.approver = Some(verdict.approver);
            response.reason = verdict.reason;
            return Ok(response);
        }

        let (tx, mut rx) = oneshot::channel();
        self.pending.insert(
            request_id,
            PendingEntry {
                request,
                resolver: tx,
            },
        );
        info!("approval request pending");

        tokio::select! {
            resolved = &mut rx => {
                resolved.map_err(|_| GateError::ChannelClosed(request_id))
            }
            _ = tokio::time::sleep(self.policy.timeout) => {
                if self.pending.remove(&request_id).is_some() {
                    let status = if self.policy.auto_approve_on_timeout {
                        ApprovalStatus::Approved
                    } else {
                        ApprovalStatus::Timeout
                    };
                    info!(?status, "approval request timed out");
                    let mut response = ApprovalResponse::now(request_id, status);
                    response.approver = self
                        .policy
                        .auto_approve_on_timeout
                        .then(|| "policy:timeout".to_string());
                    response.reason = Some(format!(
                        "no decision within {:?}",
                        self.policy.timeout
                    ));
                    Ok(response)
                } else {
                    // A respond/cancel raced the timeout and already claimed
                    // the entry; its response is in flight.
                    rx.await.map_err(|_| GateError::ChannelClosed(request_id))
                }
            }
            _ = ctx.cancellation().cancelled() => {
                if self.pending.remove(&request_id).is_some() {
                    info!("approval request cancelled with its context");
                    let mut response = ApprovalResponse::now(request_id, ApprovalStatus::Cancelled);
                    response.reason = Some("context cancelled".into());
                    Ok(response)
                } else {
                    rx.await.map_err(|_| GateError::ChannelClosed(request_id))
                }
            }
        }
    }

    /// Resolve a pending request from outside. Errors if the id is unknown
    /// or the request already reached a terminal status; a terminal
    /// resolution is never silently overwritten.
    pub fn respond(
        &self,
        request_id: Uuid,
        approved: bool,
        approver: impl Into<String>,
        reason: Option<String>,
    ) -> Result<(), GateError> {
        let (_, entry) = self
            .pending
            .remove(&request_id)
            .ok_or(GateError::UnknownRequest(request_id))?;

        let status = if approved {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Denied
        };
        let mut response = ApprovalResponse::now(request_id, status);
        response.approver = Some(approver.into());
        response.reason = reason;

        // The waiter may have given up (cancelled task); that is not an
        // error for the responder.
        if entry.resolver.send(response).is_err() {
            debug!(%request_id, "approval waiter already gone");
        }
        Ok(())
    }

    /// Cancel a pending request. Errors on an unknown or already-resolved id.
    pub fn cancel_request(&self, request_id: Uuid) -> Result<(), GateError> {
        let (_, entry) = self
            .pending
            .remove(&request_id)
            .ok_or(GateError::UnknownRequest(request_id))?;

        let mut response = ApprovalResponse::now(request_id, ApprovalStatus::Cancelled);
        response.reason = Some("cancelled by operator".into());
        if entry.resolver.send(response).is_err() {
            debug!(%request_id, "approval waiter already gone");
        }
        Ok(())
    }

    pub fn get_pending_requests(&self) -> Vec<ApprovalRequest> {
        self.pending.iter().map(|entry| entry.value().request.clone()).collect()
    }
}
