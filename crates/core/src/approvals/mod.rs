//! Approval authority: which level a role may act on, and who is eligible at a level.
//!
//! Authority is role-based. A pre-assigned approver on a pending record is only a hint for
//! notification fan-out; any caller whose role resolves to the pending level may act.

use async_trait::async_trait;

use crate::domain::user::{Caller, DirectoryUser, Role, UserId};
use crate::errors::{AllocationError, StoreError};

/// Deepest approval chain a request can carry.
pub const MAX_APPROVAL_LEVEL: u8 = 3;

/// Approval level a role is permitted to act on. Zero means no approval authority.
pub fn level_for(role: Role) -> u8 {
    match role {
        Role::DepartmentHead => 1,
        Role::ItHead => 2,
        Role::Admin | Role::Root => 3,
        Role::Employee | Role::ProjectManager | Role::ItStaff => 0,
    }
}

/// Role whose members are listed as eligible approvers for `level`.
pub fn role_for_level(level: u8) -> Option<Role> {
    match level {
        1 => Some(Role::DepartmentHead),
        2 => Some(Role::ItHead),
        3 => Some(Role::Admin),
        _ => None,
    }
}

/// Caller may act only at exactly the next pending level.
pub fn authorize(caller: &Caller, required_level: u8) -> Result<u8, AllocationError> {
    let caller_level = level_for(caller.role);
    if caller_level != required_level {
        return Err(AllocationError::InsufficientLevel { caller_level, required_level });
    }
    Ok(caller_level)
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn users_with_role(&self, role: Role) -> Result<Vec<DirectoryUser>, StoreError>;
    async fn find_user(&self, id: &UserId) -> Result<Option<DirectoryUser>, StoreError>;
}

#[derive(Clone, Debug)]
pub struct AuthorityResolver<D> {
    directory: D,
}

impl<D> AuthorityResolver<D>
where
    D: UserDirectory,
{
    pub fn new(directory: D) -> Self {
        Self { directory }
    }

    pub fn directory(&self) -> &D {
        &self.directory
    }

    pub fn level_for(&self, role: Role) -> u8 {
        level_for(role)
    }

    /// Users eligible at `level`, ordered by id so "first match" is deterministic.
    pub async fn approvers_for(&self, level: u8) -> Result<Vec<DirectoryUser>, StoreError> {
        let Some(role) = role_for_level(level) else {
            return Ok(Vec::new());
        };

        let mut users = self.directory.users_with_role(role).await?;
        users.sort_by(|left, right| left.id.cmp(&right.id));
        Ok(users)
    }

    pub async fn candidate_approver(&self, level: u8) -> Result<Option<UserId>, StoreError> {
        Ok(self.approvers_for(level).await?.into_iter().next().map(|user| user.id))
    }
}
