use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::approval::{ApprovalAction, ApprovalRecord, ApprovalRecordId, ApprovalStatus};
use crate::domain::request::{Provenance, RequestStatus, ResourceRequest, ResourceRequestId};
use crate::domain::resource::PhaseId;
use crate::domain::user::UserId;
use crate::ledger::{LedgerCommit, TypeCapacityGuard};

/// Client input for a new request, after provenance validation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestDraft {
    pub requester_id: UserId,
    pub phase_id: PhaseId,
    pub provenance: Provenance,
    pub requested_config: serde_json::Value,
    pub requested_qty: u32,
    pub justification: Option<String>,
}

/// An approve/reject decision on the next pending level.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionCommand {
    pub action: ApprovalAction,
    pub comments: Option<String>,
    /// Level the caller believes is pending; a mismatch is a stale action.
    pub expected_level: Option<u8>,
}

impl ActionCommand {
    pub fn approve() -> Self {
        Self { action: ApprovalAction::Approve, comments: None, expected_level: None }
    }

    pub fn reject(comments: impl Into<String>) -> Self {
        Self {
            action: ApprovalAction::Reject,
            comments: Some(comments.into()),
            expected_level: None,
        }
    }

    pub fn with_comments(mut self, comments: impl Into<String>) -> Self {
        self.comments = Some(comments.into());
        self
    }

    pub fn expecting_level(mut self, level: u8) -> Self {
        self.expected_level = Some(level);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    Rejected,
    Advanced,
    AssignedToIt,
}

/// How the acted-on approval record is written.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordWrite {
    /// Flip the existing pending record; zero rows touched means another actor won.
    ResolvePending,
    /// First-time creation of the level's record, already resolved; guarded by the
    /// `(request, level)` uniqueness constraint.
    InsertResolved { record_id: ApprovalRecordId },
}

/// Record to open for the level that becomes next required.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingLevel {
    pub record_id: ApprovalRecordId,
    pub level: u8,
    pub approver_id: Option<UserId>,
}

/// Everything a store must apply atomically for one approval action.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionPlan {
    pub request_id: ResourceRequestId,
    pub kind: TransitionKind,
    pub level: u8,
    pub expected_current_level: u8,
    pub decision: ApprovalStatus,
    pub approver_id: UserId,
    pub comments: Option<String>,
    pub decided_at: DateTime<Utc>,
    pub record_write: RecordWrite,
    pub next_status: RequestStatus,
    pub next_current_level: u8,
    pub rejection_reason: Option<String>,
    pub next_level: Option<PendingLevel>,
    pub ledger_commit: Option<LedgerCommit>,
}

/// Everything a store must apply atomically to create a request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreationPlan {
    pub request: ResourceRequest,
    pub first_approval: Option<ApprovalRecord>,
    pub ledger_commit: Option<LedgerCommit>,
    pub type_guard: Option<TypeCapacityGuard>,
}

impl CreationPlan {
    pub fn is_auto_approved(&self) -> bool {
        self.request.status == RequestStatus::Approved
    }
}
