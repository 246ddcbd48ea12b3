use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use provisio_core::approvals::UserDirectory;
use provisio_core::domain::user::{DirectoryUser, Role, UserId};
use provisio_core::errors::StoreError;

use super::{decode, RepositoryError};
use crate::DbPool;

/// User directory backed by the `app_user` table.
#[derive(Clone)]
pub struct SqlUserDirectory {
    pool: DbPool,
}

impl SqlUserDirectory {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn row_to_user(row: &SqliteRow) -> Result<DirectoryUser, RepositoryError> {
    let role: String = row.try_get("role").map_err(decode)?;
    let role = Role::parse(&role)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown role `{role}`")))?;

    Ok(DirectoryUser {
        id: UserId(row.try_get("id").map_err(decode)?),
        display_name: row.try_get("display_name").map_err(decode)?,
        email: row.try_get("email").map_err(decode)?,
        role,
    })
}

pub(crate) async fn save_user(pool: &DbPool, user: &DirectoryUser) -> Result<(), RepositoryError> {
    sqlx::query(
        "INSERT INTO app_user (id, display_name, email, role)
         VALUES (?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
             display_name = excluded.display_name,
             email = excluded.email,
             role = excluded.role",
    )
    .bind(&user.id.0)
    .bind(&user.display_name)
    .bind(&user.email)
    .bind(user.role.as_str())
    .execute(pool)
    .await?;
    Ok(())
}

#[async_trait]
impl UserDirectory for SqlUserDirectory {
    async fn users_with_role(&self, role: Role) -> Result<Vec<DirectoryUser>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, display_name, email, role FROM app_user WHERE role = ? ORDER BY id",
        )
        .bind(role.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(rows.iter().map(row_to_user).collect::<Result<Vec<_>, _>>()?)
    }

    async fn find_user(&self, id: &UserId) -> Result<Option<DirectoryUser>, StoreError> {
        let row = sqlx::query("SELECT id, display_name, email, role FROM app_user WHERE id = ?")
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(RepositoryError::from)?;

        Ok(row.as_ref().map(row_to_user).transpose()?)
    }
}
