//! Allocation engine: the orchestrator behind `create_request`, `act` and `availability`.
//!
//! Guards are evaluated against a snapshot first so callers get precise errors without a
//! write, then re-validated by the store inside one atomic unit of work. Notifications are
//! sent only after that unit commits and never affect the outcome.

pub mod store;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::approvals::{AuthorityResolver, UserDirectory};
use crate::domain::request::{
    Provenance, ProvenanceFields, RequestSnapshot, RequestStatus, ResourceRequest,
    ResourceRequestId,
};
use crate::domain::resource::{PhaseId, ResourceId, TemplateId};
use crate::domain::user::{Caller, Role, UserId};
use crate::errors::{AllocationError, StoreError};
use crate::flows::engine::RequestStateMachine;
use crate::flows::states::{ActionCommand, RequestDraft, TransitionKind, TransitionPlan};
use crate::ledger::{Availability, AvailabilityReport, TypeCapacityGuard};
use crate::notify::{Notification, NotificationKind, Notifier};

pub use store::AllocationStore;

/// Who is calling and under which correlation id. Passed explicitly to every operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperationContext {
    pub caller: Caller,
    pub correlation_id: String,
}

impl OperationContext {
    pub fn new(caller: Caller) -> Self {
        Self { caller, correlation_id: Uuid::new_v4().to_string() }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateRequest {
    pub phase_id: PhaseId,
    #[serde(flatten)]
    pub provenance: ProvenanceFields,
    pub requested_qty: u32,
    #[serde(default)]
    pub requested_config: serde_json::Value,
    #[serde(default)]
    pub justification: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "by", rename_all = "snake_case")]
pub enum AvailabilityQuery {
    Resource { resource_id: ResourceId },
    ResourceType { phase_id: PhaseId, resource_type: String },
    Template { template_id: TemplateId },
}

pub struct AllocationEngine<S, D, N> {
    store: S,
    resolver: AuthorityResolver<D>,
    notifier: N,
    machine: RequestStateMachine,
}

impl<S, D, N> AllocationEngine<S, D, N>
where
    S: AllocationStore,
    D: UserDirectory,
    N: Notifier,
{
    pub fn new(store: S, directory: D, notifier: N) -> Self {
        Self {
            store,
            resolver: AuthorityResolver::new(directory),
            notifier,
            machine: RequestStateMachine::new(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn resolver(&self) -> &AuthorityResolver<D> {
        &self.resolver
    }

    pub async fn create_request(
        &self,
        context: &OperationContext,
        command: CreateRequest,
    ) -> Result<RequestSnapshot, AllocationError> {
        let result = self.create_request_inner(context, command).await;
        if let Err(error) = &result {
            warn!(
                event_name = "allocation.request.refused",
                correlation_id = %context.correlation_id,
                caller = %context.caller.user_id.0,
                error = %error,
                "request creation refused"
            );
        }
        result
    }

    async fn create_request_inner(
        &self,
        context: &OperationContext,
        command: CreateRequest,
    ) -> Result<RequestSnapshot, AllocationError> {
        let provenance = command.provenance.into_provenance()?;
        if command.requested_qty == 0 {
            return Err(AllocationError::validation("requested_qty", "must be at least 1"));
        }
        let requested_qty = command.requested_qty;

        if self.store.find_phase(&command.phase_id).await.map_err(store_failure)?.is_none() {
            return Err(AllocationError::not_found("project_phase", command.phase_id.0));
        }

        let mut requested_config = command.requested_config;
        let (required_levels, type_guard) = match &provenance {
            Provenance::Resource(resource_id) => {
                let resource = self
                    .store
                    .find_resource(resource_id)
                    .await
                    .map_err(store_failure)?
                    .ok_or_else(|| AllocationError::not_found("resource", resource_id.0.clone()))?;
                if resource.phase_id != command.phase_id {
                    return Err(AllocationError::validation(
                        "resource_id",
                        format!("resource `{}` belongs to another phase", resource_id.0),
                    ));
                }
                Availability::of_resource(&resource).ensure_covers(requested_qty)?;
                (0, None)
            }
            Provenance::Template(template_id) => {
                let template = self
                    .store
                    .find_template(template_id)
                    .await
                    .map_err(store_failure)?
                    .ok_or_else(|| {
                        AllocationError::not_found("resource_template", template_id.0.clone())
                    })?;
                if requested_config.is_null() {
                    requested_config = template.default_config.clone();
                }
                (template.approval_levels, None)
            }
            // Pending type requests reserve nothing; the pool is judged here only.
            Provenance::ResourceType(resource_type) => {
                let resource = self
                    .store
                    .find_resource_by_type(&command.phase_id, resource_type)
                    .await
                    .map_err(store_failure)?
                    .ok_or_else(|| {
                        AllocationError::not_found("resource_type", resource_type.clone())
                    })?;
                let granted = self
                    .store
                    .granted_quantity_for_type(&command.phase_id, resource_type, None)
                    .await
                    .map_err(store_failure)?;
                Availability::derived(resource.quantity, granted).ensure_covers(requested_qty)?;
                let guard = TypeCapacityGuard {
                    phase_id: command.phase_id.clone(),
                    resource_type: resource_type.clone(),
                    total: resource.quantity,
                    requested: requested_qty,
                };
                (resource.approval_levels, Some(guard))
            }
        };
        if requested_config.is_null() {
            requested_config = serde_json::Value::Object(serde_json::Map::new());
        }

        let needs_approval = required_levels > 0 && provenance.resource_id().is_none();
        let first_approver = if needs_approval {
            self.candidate_approver(context, None, 1).await?
        } else {
            None
        };

        let draft = RequestDraft {
            requester_id: context.caller.user_id.clone(),
            phase_id: command.phase_id,
            provenance,
            requested_config,
            requested_qty,
            justification: command
                .justification
                .map(|text| text.trim().to_string())
                .filter(|text| !text.is_empty()),
        };
        let plan = self.machine.plan_creation(
            draft,
            required_levels,
            first_approver,
            type_guard,
            Utc::now(),
        )?;

        let snapshot = self.store.insert_request(&plan).await.map_err(|error| match error {
            StoreError::CapacityExceeded { available, total, consumed, .. } => {
                AllocationError::InsufficientCapacity {
                    requested: requested_qty,
                    available,
                    total,
                    consumed,
                }
            }
            other => store_failure(other),
        })?;

        info!(
            event_name = "allocation.request.created",
            correlation_id = %context.correlation_id,
            request_id = %snapshot.request.id,
            status = snapshot.request.status.as_str(),
            required_levels = snapshot.request.required_levels,
            ledger_committed = plan.ledger_commit.is_some(),
            "resource request created"
        );

        self.notify_created(context, &snapshot).await;
        Ok(snapshot)
    }

    /// Applies one approve/reject decision at the next pending level.
    pub async fn act(
        &self,
        context: &OperationContext,
        request_id: &ResourceRequestId,
        command: ActionCommand,
    ) -> Result<RequestSnapshot, AllocationError> {
        let result = self.act_inner(context, request_id, command).await;
        if let Err(error) = &result {
            warn!(
                event_name = "allocation.transition.rejected",
                correlation_id = %context.correlation_id,
                request_id = %request_id,
                caller = %context.caller.user_id.0,
                error = %error,
                "approval action refused"
            );
        }
        result
    }

    async fn act_inner(
        &self,
        context: &OperationContext,
        request_id: &ResourceRequestId,
        command: ActionCommand,
    ) -> Result<RequestSnapshot, AllocationError> {
        let snapshot = self.get_request(request_id).await?;
        let mut plan = self.machine.plan_action(&snapshot, &context.caller, &command, Utc::now())?;

        if let Some(next) = plan.next_level.as_mut() {
            next.approver_id =
                self.candidate_approver(context, Some(request_id), next.level).await?;
        }

        let updated = match self.store.apply_transition(&plan).await {
            Ok(updated) => updated,
            Err(StoreError::Stale { .. }) => return Err(self.stale_error(&plan).await),
            Err(StoreError::CapacityExceeded { available, total, consumed, .. }) => {
                return Err(AllocationError::InsufficientCapacity {
                    requested: snapshot.request.requested_qty,
                    available,
                    total,
                    consumed,
                });
            }
            Err(other) => return Err(store_failure(other)),
        };

        info!(
            event_name = "allocation.transition.applied",
            correlation_id = %context.correlation_id,
            request_id = %request_id,
            level = plan.level,
            from = snapshot.request.status.as_str(),
            to = updated.request.status.as_str(),
            current_level = updated.request.current_level,
            "approval transition applied"
        );

        self.notify_transition(context, &plan, &updated).await;
        Ok(updated)
    }

    pub async fn get_request(
        &self,
        request_id: &ResourceRequestId,
    ) -> Result<RequestSnapshot, AllocationError> {
        self.store
            .find_request(request_id)
            .await
            .map_err(store_failure)?
            .ok_or_else(|| AllocationError::not_found("resource_request", request_id.0.clone()))
    }

    pub async fn availability(
        &self,
        query: &AvailabilityQuery,
    ) -> Result<AvailabilityReport, AllocationError> {
        match query {
            AvailabilityQuery::Resource { resource_id } => {
                let resource = self
                    .store
                    .find_resource(resource_id)
                    .await
                    .map_err(store_failure)?
                    .ok_or_else(|| AllocationError::not_found("resource", resource_id.0.clone()))?;
                Ok(AvailabilityReport::Ledger {
                    resource_id: resource.id.clone(),
                    availability: Availability::of_resource(&resource),
                })
            }
            AvailabilityQuery::ResourceType { phase_id, resource_type } => {
                if resource_type.trim().is_empty() {
                    return Err(AllocationError::validation("resource_type", "must not be blank"));
                }
                let resource = self
                    .store
                    .find_resource_by_type(phase_id, resource_type)
                    .await
                    .map_err(store_failure)?
                    .ok_or_else(|| {
                        AllocationError::not_found("resource_type", resource_type.clone())
                    })?;
                let granted = self
                    .store
                    .granted_quantity_for_type(phase_id, resource_type, None)
                    .await
                    .map_err(store_failure)?;
                Ok(AvailabilityReport::Derived {
                    phase_id: phase_id.clone(),
                    resource_type: resource.resource_type,
                    availability: Availability::derived(resource.quantity, granted),
                })
            }
            AvailabilityQuery::Template { template_id } => {
                self.store.find_template(template_id).await.map_err(store_failure)?.ok_or_else(
                    || AllocationError::not_found("resource_template", template_id.0.clone()),
                )?;
                Ok(AvailabilityReport::Unbounded)
            }
        }
    }

    async fn candidate_approver(
        &self,
        context: &OperationContext,
        request_id: Option<&ResourceRequestId>,
        level: u8,
    ) -> Result<Option<UserId>, AllocationError> {
        let candidate = self.resolver.candidate_approver(level).await.map_err(store_failure)?;
        if candidate.is_none() {
            warn!(
                event_name = "allocation.approver.unassigned",
                correlation_id = %context.correlation_id,
                request_id = request_id.map(|id| id.0.as_str()).unwrap_or("new"),
                level,
                "no eligible approver; record waits unassigned"
            );
        }
        Ok(candidate)
    }

    /// Re-reads the request so the error reports what the concurrent winner left behind.
    async fn stale_error(&self, plan: &TransitionPlan) -> AllocationError {
        let current_level = match self.store.find_request(&plan.request_id).await {
            Ok(Some(snapshot)) => {
                let request = snapshot.request;
                if !request.status.is_open() || request.current_level >= request.required_levels {
                    return AllocationError::CompletedWorkflow {
                        request_id: request.id.0,
                        status: request.status,
                        current_level: request.current_level,
                        required_levels: request.required_levels,
                    };
                }
                request.current_level
            }
            _ => plan.expected_current_level,
        };
        AllocationError::StaleLevel {
            request_id: plan.request_id.0.clone(),
            expected_level: plan.level,
            current_level,
        }
    }

    async fn notify_created(&self, context: &OperationContext, snapshot: &RequestSnapshot) {
        let request = &snapshot.request;
        let recipients = if request.status == RequestStatus::Approved {
            vec![request.requester_id.clone()]
        } else {
            self.eligible_recipients(context, request, 1).await
        };

        let notification = Notification::new(
            NotificationKind::Created,
            request.id.clone(),
            context.correlation_id.clone(),
            context.caller.user_id.clone(),
        )
        .with_recipients(recipients)
        .with_payload("status", request.status.as_str())
        .with_payload("requested_qty", request.requested_qty.to_string())
        .with_payload("required_levels", request.required_levels.to_string());
        self.deliver(notification);
    }

    async fn notify_transition(
        &self,
        context: &OperationContext,
        plan: &TransitionPlan,
        snapshot: &RequestSnapshot,
    ) {
        let request = &snapshot.request;
        let requester = std::iter::once(request.requester_id.clone());
        let (kind, recipients): (NotificationKind, Vec<UserId>) = match plan.kind {
            TransitionKind::Rejected => (NotificationKind::Rejected, requester.collect()),
            TransitionKind::Advanced => {
                let next = self.eligible_recipients(context, request, plan.level + 1).await;
                (NotificationKind::Advanced, requester.chain(next).collect())
            }
            TransitionKind::AssignedToIt => {
                let it_heads = self.users_with_role(context, request, Role::ItHead).await;
                (NotificationKind::AssignedToIt, requester.chain(it_heads).collect())
            }
        };

        let mut notification = Notification::new(
            kind,
            request.id.clone(),
            context.correlation_id.clone(),
            context.caller.user_id.clone(),
        )
        .with_recipients(recipients)
        .with_payload("status", request.status.as_str())
        .with_payload("level", plan.level.to_string())
        .with_payload("current_level", request.current_level.to_string())
        .with_payload("required_levels", request.required_levels.to_string());
        if let Some(reason) = &request.rejection_reason {
            notification = notification.with_payload("rejection_reason", reason.clone());
        }
        if let Some(comments) = &plan.comments {
            notification = notification.with_payload("comments", comments.clone());
        }
        self.deliver(notification);
    }

    async fn eligible_recipients(
        &self,
        context: &OperationContext,
        request: &ResourceRequest,
        level: u8,
    ) -> Vec<UserId> {
        match self.resolver.approvers_for(level).await {
            Ok(users) => users.into_iter().map(|user| user.id).collect(),
            Err(error) => {
                warn!(
                    event_name = "allocation.notify.recipients_failed",
                    correlation_id = %context.correlation_id,
                    request_id = %request.id,
                    level,
                    error = %error,
                    "could not resolve notification recipients"
                );
                Vec::new()
            }
        }
    }

    async fn users_with_role(
        &self,
        context: &OperationContext,
        request: &ResourceRequest,
        role: Role,
    ) -> Vec<UserId> {
        match self.resolver.directory().users_with_role(role).await {
            Ok(users) => users.into_iter().map(|user| user.id).collect(),
            Err(error) => {
                warn!(
                    event_name = "allocation.notify.recipients_failed",
                    correlation_id = %context.correlation_id,
                    request_id = %request.id,
                    role = role.as_str(),
                    error = %error,
                    "could not resolve notification recipients"
                );
                Vec::new()
            }
        }
    }

    fn deliver(&self, notification: Notification) {
        let event_type = notification.kind.event_type();
        let request_id = notification.request_id.clone();
        let correlation_id = notification.correlation_id.clone();
        if let Err(error) = self.notifier.notify(notification) {
            warn!(
                event_name = "allocation.notify.failed",
                correlation_id = %correlation_id,
                request_id = %request_id,
                notification = event_type,
                error = %error,
                "notification delivery failed"
            );
        }
    }
}

fn store_failure(error: StoreError) -> AllocationError {
    match error {
        StoreError::NotFound { entity, id } => AllocationError::NotFound { entity, id },
        StoreError::Stale { request_id, level } => AllocationError::StaleLevel {
            request_id,
            expected_level: level,
            current_level: level.saturating_sub(1),
        },
        StoreError::CapacityExceeded { available, total, consumed, .. } => {
            AllocationError::InsufficientCapacity { requested: 0, available, total, consumed }
        }
        StoreError::Backend(message) => AllocationError::internal(message),
    }
}

