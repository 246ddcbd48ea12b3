use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TemplateId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PhaseId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectPhase {
    pub id: PhaseId,
    pub project_name: String,
    pub phase_name: String,
}

/// A provisioned unit pool inside a project phase. This row is the ledger entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: ResourceId,
    pub phase_id: PhaseId,
    pub name: String,
    pub resource_type: String,
    pub quantity: u32,
    pub consumed_quantity: u32,
    /// Approval depth for requests that match this resource by type.
    pub approval_levels: u8,
}

/// A catalog entry describing an out-of-pool resource that a human approver judges.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceTemplate {
    pub id: TemplateId,
    pub name: String,
    pub resource_type: String,
    pub approval_levels: u8,
    pub default_config: serde_json::Value,
}
