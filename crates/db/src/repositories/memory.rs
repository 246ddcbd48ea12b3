use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use provisio_core::allocation::AllocationStore;
use provisio_core::approvals::UserDirectory;
use provisio_core::domain::approval::{ApprovalRecord, ApprovalStatus};
use provisio_core::domain::request::{
    Provenance, RequestSnapshot, ResourceRequest, ResourceRequestId,
};
use provisio_core::domain::resource::{
    PhaseId, ProjectPhase, Resource, ResourceId, ResourceTemplate, TemplateId,
};
use provisio_core::domain::user::{DirectoryUser, Role, UserId};
use provisio_core::errors::StoreError;
use provisio_core::flows::states::{CreationPlan, RecordWrite, TransitionPlan};
use provisio_core::ledger::{apply_commit, same_resource_type, LedgerCommit};

use super::{CatalogRepository, RepositoryError};

#[derive(Default)]
struct MemoryState {
    users: BTreeMap<UserId, DirectoryUser>,
    phases: BTreeMap<PhaseId, ProjectPhase>,
    resources: BTreeMap<ResourceId, Resource>,
    templates: BTreeMap<TemplateId, ResourceTemplate>,
    requests: BTreeMap<ResourceRequestId, ResourceRequest>,
    approvals: BTreeMap<(ResourceRequestId, u8), ApprovalRecord>,
}

impl MemoryState {
    fn snapshot(&self, id: &ResourceRequestId) -> Option<RequestSnapshot> {
        let request = self.requests.get(id)?.clone();
        let approvals = self
            .approvals
            .range((id.clone(), 0)..=(id.clone(), u8::MAX))
            .map(|(_, record)| record.clone())
            .collect();
        Some(RequestSnapshot { request, approvals })
    }

    fn granted_for_type(
        &self,
        phase_id: &PhaseId,
        resource_type: &str,
        excluding: Option<&ResourceRequestId>,
    ) -> u64 {
        self.requests
            .values()
            .filter(|request| &request.phase_id == phase_id)
            .filter(|request| request.status.is_granted())
            .filter(|request| Some(&request.id) != excluding)
            .filter(|request| match &request.provenance {
                Provenance::ResourceType(bound) => same_resource_type(bound, resource_type),
                Provenance::Resource(_) | Provenance::Template(_) => false,
            })
            .map(|request| u64::from(request.requested_qty))
            .sum()
    }

    /// Validates a ledger commit against a copy of the row and returns the updated row.
    fn checked_commit(&self, commit: &LedgerCommit) -> Result<Resource, StoreError> {
        let mut resource = self.resources.get(&commit.resource_id).cloned().ok_or_else(|| {
            StoreError::NotFound { entity: "resource", id: commit.resource_id.0.clone() }
        })?;
        apply_commit(&mut resource, commit.quantity)?;
        Ok(resource)
    }
}

/// Process-local store with the same guard semantics as the SQL store. All tables sit
/// behind one lock, so each operation is a single atomic unit of work.
#[derive(Clone, Default)]
pub struct InMemoryAllocationStore {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryAllocationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AllocationStore for InMemoryAllocationStore {
    async fn find_phase(&self, id: &PhaseId) -> Result<Option<ProjectPhase>, StoreError> {
        Ok(self.state.lock().await.phases.get(id).cloned())
    }

    async fn find_resource(&self, id: &ResourceId) -> Result<Option<Resource>, StoreError> {
        Ok(self.state.lock().await.resources.get(id).cloned())
    }

    async fn find_template(&self, id: &TemplateId) -> Result<Option<ResourceTemplate>, StoreError> {
        Ok(self.state.lock().await.templates.get(id).cloned())
    }

    async fn find_resource_by_type(
        &self,
        phase_id: &PhaseId,
        resource_type: &str,
    ) -> Result<Option<Resource>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .resources
            .values()
            .find(|resource| {
                &resource.phase_id == phase_id
                    && same_resource_type(&resource.resource_type, resource_type)
            })
            .cloned())
    }

    async fn granted_quantity_for_type(
        &self,
        phase_id: &PhaseId,
        resource_type: &str,
        excluding: Option<&ResourceRequestId>,
    ) -> Result<u64, StoreError> {
        Ok(self.state.lock().await.granted_for_type(phase_id, resource_type, excluding))
    }

    async fn find_request(
        &self,
        id: &ResourceRequestId,
    ) -> Result<Option<RequestSnapshot>, StoreError> {
        Ok(self.state.lock().await.snapshot(id))
    }

    async fn insert_request(&self, plan: &CreationPlan) -> Result<RequestSnapshot, StoreError> {
        let mut state = self.state.lock().await;
        let request = &plan.request;

        if state.requests.contains_key(&request.id) {
            return Err(StoreError::Backend(format!("duplicate request id `{}`", request.id)));
        }
        let committed =
            plan.ledger_commit.as_ref().map(|commit| state.checked_commit(commit)).transpose()?;
        if let Some(guard) = &plan.type_guard {
            guard.check(state.granted_for_type(&guard.phase_id, &guard.resource_type, None))?;
        }

        if let Some(resource) = committed {
            state.resources.insert(resource.id.clone(), resource);
        }
        state.requests.insert(request.id.clone(), request.clone());
        if let Some(record) = &plan.first_approval {
            state.approvals.insert((request.id.clone(), record.approval_level), record.clone());
        }

        Ok(RequestSnapshot {
            request: request.clone(),
            approvals: plan.first_approval.iter().cloned().collect(),
        })
    }

    async fn apply_transition(&self, plan: &TransitionPlan) -> Result<RequestSnapshot, StoreError> {
        let mut state = self.state.lock().await;
        let stale =
            || StoreError::Stale { request_id: plan.request_id.0.clone(), level: plan.level };

        let current = state.requests.get(&plan.request_id).ok_or_else(|| StoreError::NotFound {
            entity: "resource_request",
            id: plan.request_id.0.clone(),
        })?;
        if !current.status.is_open() || current.current_level != plan.expected_current_level {
            return Err(stale());
        }

        let key = (plan.request_id.clone(), plan.level);
        let resolved = match (&plan.record_write, state.approvals.get(&key)) {
            (RecordWrite::ResolvePending, Some(record)) if record.is_pending() => {
                ApprovalRecord {
                    status: plan.decision,
                    approver_id: Some(plan.approver_id.clone()),
                    comments: plan.comments.clone(),
                    approved_at: Some(plan.decided_at),
                    ..record.clone()
                }
            }
            (RecordWrite::InsertResolved { record_id }, None) => ApprovalRecord {
                id: record_id.clone(),
                request_id: plan.request_id.clone(),
                approval_level: plan.level,
                status: plan.decision,
                approver_id: Some(plan.approver_id.clone()),
                comments: plan.comments.clone(),
                approved_at: Some(plan.decided_at),
                created_at: plan.decided_at,
            },
            _ => return Err(stale()),
        };

        let opened = match &plan.next_level {
            Some(next) if state.approvals.contains_key(&(plan.request_id.clone(), next.level)) => {
                return Err(stale());
            }
            Some(next) => Some(ApprovalRecord {
                id: next.record_id.clone(),
                request_id: plan.request_id.clone(),
                approval_level: next.level,
                status: ApprovalStatus::Pending,
                approver_id: next.approver_id.clone(),
                comments: None,
                approved_at: None,
                created_at: plan.decided_at,
            }),
            None => None,
        };

        let committed =
            plan.ledger_commit.as_ref().map(|commit| state.checked_commit(commit)).transpose()?;

        if let Some(request) = state.requests.get_mut(&plan.request_id) {
            request.status = plan.next_status;
            request.current_level = plan.next_current_level;
            request.rejection_reason = plan.rejection_reason.clone();
            request.updated_at = plan.decided_at;
        }
        state.approvals.insert(key, resolved);
        if let Some(record) = opened {
            state.approvals.insert((plan.request_id.clone(), record.approval_level), record);
        }
        if let Some(resource) = committed {
            state.resources.insert(resource.id.clone(), resource);
        }

        state.snapshot(&plan.request_id).ok_or_else(|| StoreError::NotFound {
            entity: "resource_request",
            id: plan.request_id.0.clone(),
        })
    }
}

#[async_trait]
impl UserDirectory for InMemoryAllocationStore {
    async fn users_with_role(&self, role: Role) -> Result<Vec<DirectoryUser>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.users.values().filter(|user| user.role == role).cloned().collect())
    }

    async fn find_user(&self, id: &UserId) -> Result<Option<DirectoryUser>, StoreError> {
        Ok(self.state.lock().await.users.get(id).cloned())
    }
}

#[async_trait]
impl CatalogRepository for InMemoryAllocationStore {
    async fn save_phase(&self, phase: ProjectPhase) -> Result<(), RepositoryError> {
        self.state.lock().await.phases.insert(phase.id.clone(), phase);
        Ok(())
    }

    async fn save_resource(&self, resource: Resource) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().await;
        if !state.phases.contains_key(&resource.phase_id) {
            return Err(RepositoryError::Store(StoreError::NotFound {
                entity: "project_phase",
                id: resource.phase_id.0.clone(),
            }));
        }
        if resource.consumed_quantity > resource.quantity {
            return Err(RepositoryError::Decode(format!(
                "resource `{}` consumes {} of {} units",
                resource.id.0, resource.consumed_quantity, resource.quantity
            )));
        }
        state.resources.insert(resource.id.clone(), resource);
        Ok(())
    }

    async fn save_template(&self, template: ResourceTemplate) -> Result<(), RepositoryError> {
        self.state.lock().await.templates.insert(template.id.clone(), template);
        Ok(())
    }

    async fn save_user(&self, user: DirectoryUser) -> Result<(), RepositoryError> {
        self.state.lock().await.users.insert(user.id.clone(), user);
        Ok(())
    }
}
