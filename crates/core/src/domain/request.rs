use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::approval::ApprovalRecord;
use crate::domain::resource::{PhaseId, ResourceId, TemplateId};
use crate::domain::user::UserId;
use crate::errors::AllocationError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceRequestId(pub String);

impl std::fmt::Display for ResourceRequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    Pending,
    InProgress,
    Approved,
    Rejected,
    AssignedToIt,
    Completed,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::AssignedToIt => "assigned_to_it",
            Self::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "assigned_to_it" => Some(Self::AssignedToIt),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }

    /// Statuses that still accept an approval action.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Pending | Self::InProgress)
    }

    /// Statuses whose quantity counts as granted capacity.
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Approved | Self::AssignedToIt | Self::Completed)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Rejected | Self::Completed)
    }

    pub fn can_transition_to(&self, next: Self) -> bool {
        match self {
            Self::Pending | Self::InProgress => {
                matches!(next, Self::InProgress | Self::Rejected | Self::AssignedToIt)
            }
            Self::Approved | Self::AssignedToIt => next == Self::Completed,
            Self::Rejected | Self::Completed => false,
        }
    }
}

/// What a request was created against. Exactly one binding per request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Provenance {
    /// A specific pre-provisioned resource row in the phase.
    Resource(ResourceId),
    /// A catalog template; capacity is judged by the approver, not the ledger.
    Template(TemplateId),
    /// Free-text match against resources declared in the phase.
    ResourceType(String),
}

impl Provenance {
    pub fn resource_id(&self) -> Option<&ResourceId> {
        match self {
            Self::Resource(id) => Some(id),
            Self::Template(_) | Self::ResourceType(_) => None,
        }
    }
}

/// Flattened provenance as it arrives from a client or a storage row.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenanceFields {
    pub resource_id: Option<String>,
    pub resource_template_id: Option<String>,
    pub resource_type: Option<String>,
}

impl ProvenanceFields {
    pub fn into_provenance(self) -> Result<Provenance, AllocationError> {
        let resource_id = non_blank(self.resource_id);
        let template_id = non_blank(self.resource_template_id);
        let resource_type = non_blank(self.resource_type);

        match (resource_id, template_id, resource_type) {
            (Some(id), None, None) => Ok(Provenance::Resource(ResourceId(id))),
            (None, Some(id), None) => Ok(Provenance::Template(TemplateId(id))),
            (None, None, Some(resource_type)) => Ok(Provenance::ResourceType(resource_type)),
            (None, None, None) => Err(AllocationError::validation(
                "provenance",
                "one of resource_id, resource_template_id or resource_type is required",
            )),
            _ => Err(AllocationError::validation(
                "provenance",
                "only one of resource_id, resource_template_id or resource_type may be set",
            )),
        }
    }

    pub fn from_provenance(provenance: &Provenance) -> Self {
        match provenance {
            Provenance::Resource(id) => Self { resource_id: Some(id.0.clone()), ..Self::default() },
            Provenance::Template(id) => {
                Self { resource_template_id: Some(id.0.clone()), ..Self::default() }
            }
            Provenance::ResourceType(resource_type) => {
                Self { resource_type: Some(resource_type.clone()), ..Self::default() }
            }
        }
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.map(|value| value.trim().to_string()).filter(|value| !value.is_empty())
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub id: ResourceRequestId,
    pub requester_id: UserId,
    pub phase_id: PhaseId,
    pub provenance: Provenance,
    pub requested_config: serde_json::Value,
    pub requested_qty: u32,
    pub justification: Option<String>,
    pub status: RequestStatus,
    pub current_level: u8,
    pub required_levels: u8,
    pub rejection_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ResourceRequest {
    pub fn next_required_level(&self) -> u8 {
        self.current_level.saturating_add(1)
    }
}

/// A request together with its approval records, ordered by level.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestSnapshot {
    pub request: ResourceRequest,
    pub approvals: Vec<ApprovalRecord>,
}

impl RequestSnapshot {
    pub fn record_at(&self, level: u8) -> Option<&ApprovalRecord> {
        self.approvals.iter().find(|record| record.approval_level == level)
    }
}

#[cfg(test)]
mod tests {
    use super::{Provenance, ProvenanceFields, RequestStatus};
    use crate::domain::resource::TemplateId;
    use crate::errors::AllocationError;

    #[test]
    fn exactly_one_provenance_field_is_accepted() {
        let provenance = ProvenanceFields {
            resource_template_id: Some("tpl-vm".to_string()),
            ..ProvenanceFields::default()
        }
        .into_provenance()
        .expect("single field is valid");

        assert_eq!(provenance, Provenance::Template(TemplateId("tpl-vm".to_string())));
    }

    #[test]
    fn ambiguous_provenance_is_a_validation_error() {
        let error = ProvenanceFields {
            resource_id: Some("res-1".to_string()),
            resource_type: Some("vm".to_string()),
            ..ProvenanceFields::default()
        }
        .into_provenance()
        .expect_err("two fields are ambiguous");

        assert!(matches!(error, AllocationError::Validation { ref field, .. } if field == "provenance"));
    }

    #[test]
    fn blank_fields_count_as_unset() {
        let error = ProvenanceFields {
            resource_type: Some("   ".to_string()),
            ..ProvenanceFields::default()
        }
        .into_provenance()
        .expect_err("blank type is not a provenance");

        assert!(matches!(error, AllocationError::Validation { .. }));
    }

    #[test]
    fn flattening_preserves_the_binding() {
        let provenance = Provenance::ResourceType("database".to_string());
        let fields = ProvenanceFields::from_provenance(&provenance);
        assert_eq!(fields.resource_type.as_deref(), Some("database"));
        assert_eq!(fields.into_provenance().expect("valid"), provenance);
    }

    #[test]
    fn granted_statuses_cover_every_success_state() {
        assert!(RequestStatus::Approved.is_granted());
        assert!(RequestStatus::AssignedToIt.is_granted());
        assert!(RequestStatus::Completed.is_granted());
        assert!(!RequestStatus::Pending.is_granted());
        assert!(!RequestStatus::Rejected.is_granted());
        assert!(RequestStatus::InProgress.is_open());
        assert!(!RequestStatus::AssignedToIt.is_open());
    }

    #[test]
    fn terminal_statuses_accept_no_transition() {
        assert!(RequestStatus::Pending.can_transition_to(RequestStatus::AssignedToIt));
        assert!(RequestStatus::InProgress.can_transition_to(RequestStatus::Rejected));
        assert!(RequestStatus::AssignedToIt.can_transition_to(RequestStatus::Completed));
        assert!(!RequestStatus::Pending.can_transition_to(RequestStatus::Approved));
        assert!(!RequestStatus::Rejected.can_transition_to(RequestStatus::InProgress));
        assert!(RequestStatus::Completed.is_terminal());
    }
}
