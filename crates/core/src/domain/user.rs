use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub String);

/// Organisational role as supplied by the identity provider.
///
/// Only the approving roles carry authority; the mapping to an approval level lives in
/// [`crate::approvals::level_for`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Employee,
    ProjectManager,
    ItStaff,
    DepartmentHead,
    ItHead,
    Admin,
    Root,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Employee => "employee",
            Self::ProjectManager => "project_manager",
            Self::ItStaff => "it_staff",
            Self::DepartmentHead => "department_head",
            Self::ItHead => "it_head",
            Self::Admin => "admin",
            Self::Root => "root",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "employee" | "user" => Some(Self::Employee),
            "project_manager" => Some(Self::ProjectManager),
            "it_staff" => Some(Self::ItStaff),
            "department_head" => Some(Self::DepartmentHead),
            "it_head" => Some(Self::ItHead),
            "admin" => Some(Self::Admin),
            "root" => Some(Self::Root),
            _ => None,
        }
    }
}

/// Identity of whoever invokes an engine operation. Threaded explicitly through every call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    pub user_id: UserId,
    pub role: Role,
}

impl Caller {
    pub fn new(user_id: impl Into<String>, role: Role) -> Self {
        Self { user_id: UserId(user_id.into()), role }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryUser {
    pub id: UserId,
    pub display_name: String,
    pub email: Option<String>,
    pub role: Role,
}
