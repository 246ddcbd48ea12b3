use async_trait::async_trait;

use crate::domain::request::{RequestSnapshot, ResourceRequestId};
use crate::domain::resource::{PhaseId, ProjectPhase, Resource, ResourceId, ResourceTemplate, TemplateId};
use crate::errors::StoreError;
use crate::flows::states::{CreationPlan, TransitionPlan};

/// Persistence seam for the allocation engine.
///
/// `insert_request` and `apply_transition` are atomic units of work. Implementations must
/// re-validate every guard the plan carries inside that unit:
/// - the ledger commit succeeds only while `consumed + qty <= quantity`, else `CapacityExceeded`;
/// - a type guard is checked against granted quantity of other requests, else `CapacityExceeded`;
/// - the request row moves only from `expected_current_level` while still open, and the acted
///   record moves only from pending (or is inserted fresh), else `Stale`.
///
/// On any error nothing from the plan is persisted.
#[async_trait]
pub trait AllocationStore: Send + Sync {
    async fn find_phase(&self, id: &PhaseId) -> Result<Option<ProjectPhase>, StoreError>;

    async fn find_resource(&self, id: &ResourceId) -> Result<Option<Resource>, StoreError>;

    async fn find_template(&self, id: &TemplateId) -> Result<Option<ResourceTemplate>, StoreError>;

    /// First resource (by id) in the phase whose type matches case-insensitively.
    async fn find_resource_by_type(
        &self,
        phase_id: &PhaseId,
        resource_type: &str,
    ) -> Result<Option<Resource>, StoreError>;

    /// Sum of `requested_qty` over granted type-bound requests of this type in the phase.
    async fn granted_quantity_for_type(
        &self,
        phase_id: &PhaseId,
        resource_type: &str,
        excluding: Option<&ResourceRequestId>,
    ) -> Result<u64, StoreError>;

    async fn find_request(
        &self,
        id: &ResourceRequestId,
    ) -> Result<Option<RequestSnapshot>, StoreError>;

    async fn insert_request(&self, plan: &CreationPlan) -> Result<RequestSnapshot, StoreError>;

    async fn apply_transition(&self, plan: &TransitionPlan) -> Result<RequestSnapshot, StoreError>;
}
