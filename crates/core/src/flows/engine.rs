use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::approvals::{authorize, MAX_APPROVAL_LEVEL};
use crate::domain::approval::{ApprovalAction, ApprovalRecord, ApprovalRecordId, ApprovalStatus};
use crate::domain::request::{
    Provenance, RequestSnapshot, RequestStatus, ResourceRequest, ResourceRequestId,
};
use crate::domain::user::{Caller, UserId};
use crate::errors::AllocationError;
use crate::flows::states::{
    ActionCommand, CreationPlan, PendingLevel, RecordWrite, RequestDraft, TransitionKind,
    TransitionPlan,
};
use crate::ledger::{LedgerCommit, TypeCapacityGuard};

/// Pure transition rules for a resource request. Nothing here touches storage; the returned
/// plans are applied atomically by an [`crate::allocation::AllocationStore`].
#[derive(Clone, Debug, Default)]
pub struct RequestStateMachine;

impl RequestStateMachine {
    pub fn new() -> Self {
        Self
    }

    /// Builds the initial state of a request.
    ///
    /// Resource-bound requests and chains of depth zero are approved on creation. A
    /// resource-bound request carries its ledger commit in the same plan.
    pub fn plan_creation(
        &self,
        draft: RequestDraft,
        required_levels: u8,
        first_approver: Option<UserId>,
        type_guard: Option<TypeCapacityGuard>,
        now: DateTime<Utc>,
    ) -> Result<CreationPlan, AllocationError> {
        if draft.requested_qty == 0 {
            return Err(AllocationError::validation("requested_qty", "must be at least 1"));
        }
        if required_levels > MAX_APPROVAL_LEVEL {
            return Err(AllocationError::validation(
                "approval_levels",
                format!("catalog declares {required_levels} levels; at most {MAX_APPROVAL_LEVEL} are supported"),
            ));
        }

        let bound_to_resource = matches!(draft.provenance, Provenance::Resource(_));
        let auto_approved = bound_to_resource || required_levels == 0;
        let request_id = ResourceRequestId(Uuid::new_v4().to_string());

        let ledger_commit = draft.provenance.resource_id().map(|resource_id| LedgerCommit {
            resource_id: resource_id.clone(),
            quantity: draft.requested_qty,
        });

        let first_approval = (!auto_approved).then(|| ApprovalRecord {
            id: ApprovalRecordId(Uuid::new_v4().to_string()),
            request_id: request_id.clone(),
            approval_level: 1,
            status: ApprovalStatus::Pending,
            approver_id: first_approver,
            comments: None,
            approved_at: None,
            created_at: now,
        });

        let request = ResourceRequest {
            id: request_id,
            requester_id: draft.requester_id,
            phase_id: draft.phase_id,
            provenance: draft.provenance,
            requested_config: draft.requested_config,
            requested_qty: draft.requested_qty,
            justification: draft.justification,
            status: if auto_approved { RequestStatus::Approved } else { RequestStatus::Pending },
            current_level: 0,
            required_levels: if auto_approved { 0 } else { required_levels },
            rejection_reason: None,
            created_at: now,
            updated_at: now,
        };

        Ok(CreationPlan { request, first_approval, ledger_commit, type_guard })
    }

    /// Decides the effect of `command` on the request in `snapshot`.
    ///
    /// Guards run in a fixed order: a closed workflow first, then the caller's authority for
    /// the next level, then staleness of the level the caller saw.
    pub fn plan_action(
        &self,
        snapshot: &RequestSnapshot,
        caller: &Caller,
        command: &ActionCommand,
        now: DateTime<Utc>,
    ) -> Result<TransitionPlan, AllocationError> {
        let request = &snapshot.request;
        if !request.status.is_open() || request.current_level >= request.required_levels {
            return Err(AllocationError::CompletedWorkflow {
                request_id: request.id.0.clone(),
                status: request.status,
                current_level: request.current_level,
                required_levels: request.required_levels,
            });
        }

        let level = request.next_required_level();
        authorize(caller, level)?;

        let stale = || AllocationError::StaleLevel {
            request_id: request.id.0.clone(),
            expected_level: command.expected_level.unwrap_or(level),
            current_level: request.current_level,
        };
        if command.expected_level.is_some_and(|expected| expected != level) {
            return Err(stale());
        }

        let record_write = match snapshot.record_at(level) {
            Some(record) if record.is_pending() => RecordWrite::ResolvePending,
            Some(_) => return Err(stale()),
            None => RecordWrite::InsertResolved {
                record_id: ApprovalRecordId(Uuid::new_v4().to_string()),
            },
        };

        let comments = command.comments.as_ref().map(|text| text.trim().to_string());
        let mut plan = TransitionPlan {
            request_id: request.id.clone(),
            kind: TransitionKind::Advanced,
            level,
            expected_current_level: request.current_level,
            decision: command.action.decision(),
            approver_id: caller.user_id.clone(),
            comments: comments.clone().filter(|text| !text.is_empty()),
            decided_at: now,
            record_write,
            next_status: RequestStatus::InProgress,
            next_current_level: level,
            rejection_reason: None,
            next_level: None,
            ledger_commit: None,
        };

        match command.action {
            ApprovalAction::Reject => {
                plan.kind = TransitionKind::Rejected;
                plan.next_status = RequestStatus::Rejected;
                plan.next_current_level = request.current_level;
                plan.rejection_reason = Some(
                    plan.comments
                        .clone()
                        .unwrap_or_else(|| format!("rejected at approval level {level}")),
                );
            }
            ApprovalAction::Approve if level == request.required_levels => {
                plan.kind = TransitionKind::AssignedToIt;
                plan.next_status = RequestStatus::AssignedToIt;
                plan.ledger_commit =
                    request.provenance.resource_id().map(|resource_id| LedgerCommit {
                        resource_id: resource_id.clone(),
                        quantity: request.requested_qty,
                    });
            }
            ApprovalAction::Approve => {
                plan.next_level = Some(PendingLevel {
                    record_id: ApprovalRecordId(Uuid::new_v4().to_string()),
                    level: level + 1,
                    approver_id: None,
                });
            }
        }

        debug_assert!(request.status.can_transition_to(plan.next_status));
        Ok(plan)
    }
}
