//! Capacity ledger arithmetic.
//!
//! A resource row stores `consumed_quantity` directly. Free-text type requests have no row
//! reserved, so their consumption is derived from the granted requests of that type in the
//! phase. Template requests are not capacity-checked: they are out-of-pool asks that an
//! approver judges.

use serde::{Deserialize, Serialize};

use crate::domain::request::Provenance;
use crate::domain::resource::{PhaseId, Resource, ResourceId};
use crate::errors::{AllocationError, StoreError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Availability {
    pub available: u32,
    pub total: u32,
    pub consumed: u32,
}

impl Availability {
    pub fn of_resource(resource: &Resource) -> Self {
        Self {
            available: resource.quantity.saturating_sub(resource.consumed_quantity),
            total: resource.quantity,
            consumed: resource.consumed_quantity,
        }
    }

    /// Availability of a declared type pool given the quantity already granted against it.
    pub fn derived(total: u32, granted: u64) -> Self {
        let consumed = u32::try_from(granted).unwrap_or(u32::MAX);
        Self { available: total.saturating_sub(consumed), total, consumed }
    }

    pub fn covers(&self, requested: u32) -> bool {
        requested <= self.available
    }

    pub fn ensure_covers(&self, requested: u32) -> Result<(), AllocationError> {
        if self.covers(requested) {
            return Ok(());
        }
        Err(AllocationError::InsufficientCapacity {
            requested,
            available: self.available,
            total: self.total,
            consumed: self.consumed,
        })
    }
}

/// How a request's provenance is checked against capacity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapacityPolicy {
    /// Stored counter on a specific resource row.
    Ledger,
    /// Derived from granted requests of the same type in the phase.
    Derived,
    /// Not enforced; approver judgment.
    Unbounded,
}

impl CapacityPolicy {
    pub fn for_provenance(provenance: &Provenance) -> Self {
        match provenance {
            Provenance::Resource(_) => Self::Ledger,
            Provenance::ResourceType(_) => Self::Derived,
            Provenance::Template(_) => Self::Unbounded,
        }
    }
}

/// Availability as reported to clients.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum AvailabilityReport {
    Ledger { resource_id: ResourceId, availability: Availability },
    Derived { phase_id: PhaseId, resource_type: String, availability: Availability },
    Unbounded,
}

impl AvailabilityReport {
    pub fn availability(&self) -> Option<Availability> {
        match self {
            Self::Ledger { availability, .. } | Self::Derived { availability, .. } => {
                Some(*availability)
            }
            Self::Unbounded => None,
        }
    }
}

/// Increment of a resource row's consumed counter, applied inside the transition's unit of work.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerCommit {
    pub resource_id: ResourceId,
    pub quantity: u32,
}

/// Guard for type-bound requests: re-validated inside the creating unit of work.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeCapacityGuard {
    pub phase_id: PhaseId,
    pub resource_type: String,
    pub total: u32,
    pub requested: u32,
}

impl TypeCapacityGuard {
    pub fn check(&self, granted_by_others: u64) -> Result<(), StoreError> {
        let availability = Availability::derived(self.total, granted_by_others);
        if availability.covers(self.requested) {
            return Ok(());
        }
        Err(StoreError::CapacityExceeded {
            resource_id: format!("{}:{}", self.phase_id.0, self.resource_type),
            available: availability.available,
            total: availability.total,
            consumed: availability.consumed,
        })
    }
}

/// Applies `commit` to an in-memory resource row, keeping `0 <= consumed <= quantity`.
pub fn apply_commit(resource: &mut Resource, quantity: u32) -> Result<(), StoreError> {
    let availability = Availability::of_resource(resource);
    if !availability.covers(quantity) {
        return Err(StoreError::CapacityExceeded {
            resource_id: resource.id.0.clone(),
            available: availability.available,
            total: availability.total,
            consumed: availability.consumed,
        });
    }
    resource.consumed_quantity += quantity;
    Ok(())
}

/// Case-insensitive free-text type match.
pub fn same_resource_type(left: &str, right: &str) -> bool {
    left.trim().eq_ignore_ascii_case(right.trim())
}

#[cfg(test)]
mod tests {
    use super::{apply_commit, same_resource_type, Availability, CapacityPolicy, TypeCapacityGuard};
    use crate::domain::request::Provenance;
    use crate::domain::resource::{PhaseId, Resource, ResourceId, TemplateId};
    use crate::errors::{AllocationError, StoreError};

    fn resource(quantity: u32, consumed_quantity: u32) -> Resource {
        Resource {
            id: ResourceId("res-vm".to_string()),
            phase_id: PhaseId("phase-1".to_string()),
            name: "Build VMs".to_string(),
            resource_type: "vm".to_string(),
            quantity,
            consumed_quantity,
            approval_levels: 0,
        }
    }

    #[test]
    fn commit_fills_the_pool_and_then_refuses() {
        let mut row = resource(5, 0);
        apply_commit(&mut row, 5).expect("exact fill");
        assert_eq!(row.consumed_quantity, 5);

        let error = apply_commit(&mut row, 1).expect_err("pool is exhausted");
        assert!(matches!(error, StoreError::CapacityExceeded { available: 0, total: 5, .. }));
        assert_eq!(row.consumed_quantity, 5);
    }

    #[test]
    fn insufficient_capacity_reports_the_full_picture() {
        let error = Availability::of_resource(&resource(5, 4))
            .ensure_covers(2)
            .expect_err("only one unit left");
        assert_eq!(
            error,
            AllocationError::InsufficientCapacity { requested: 2, available: 1, total: 5, consumed: 4 }
        );
    }

    #[test]
    fn derived_availability_subtracts_granted_quantity() {
        let availability = Availability::derived(10, 8);
        assert_eq!(availability, Availability { available: 2, total: 10, consumed: 8 });
        assert!(availability.covers(2));
        assert!(!availability.covers(3));

        let overdrawn = Availability::derived(10, 12);
        assert_eq!(overdrawn.available, 0);
    }

    #[test]
    fn type_guard_rejects_requests_beyond_the_declared_pool() {
        let guard = TypeCapacityGuard {
            phase_id: PhaseId("phase-1".to_string()),
            resource_type: "database".to_string(),
            total: 10,
            requested: 3,
        };
        assert!(matches!(guard.check(8), Err(StoreError::CapacityExceeded { available: 2, .. })));
        assert!(guard.check(7).is_ok());
    }

    #[test]
    fn policy_follows_provenance() {
        assert_eq!(
            CapacityPolicy::for_provenance(&Provenance::Resource(ResourceId("r".to_string()))),
            CapacityPolicy::Ledger
        );
        assert_eq!(
            CapacityPolicy::for_provenance(&Provenance::ResourceType("vm".to_string())),
            CapacityPolicy::Derived
        );
        assert_eq!(
            CapacityPolicy::for_provenance(&Provenance::Template(TemplateId("t".to_string()))),
            CapacityPolicy::Unbounded
        );
        assert!(same_resource_type(" VM", "vm "));
    }
}
