use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use provisio_core::domain::resource::{
    PhaseId, ProjectPhase, Resource, ResourceId, ResourceTemplate, TemplateId,
};
use provisio_core::domain::user::DirectoryUser;

use super::directory::save_user;
use super::{decode, narrow, CatalogRepository, RepositoryError};
use crate::DbPool;

pub(crate) const RESOURCE_COLUMNS: &str =
    "id, phase_id, name, resource_type, quantity, consumed_quantity, approval_levels";

pub struct SqlCatalogRepository {
    pool: DbPool,
}

impl SqlCatalogRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

pub(crate) fn row_to_phase(row: &SqliteRow) -> Result<ProjectPhase, RepositoryError> {
    Ok(ProjectPhase {
        id: PhaseId(row.try_get("id").map_err(decode)?),
        project_name: row.try_get("project_name").map_err(decode)?,
        phase_name: row.try_get("phase_name").map_err(decode)?,
    })
}

pub(crate) fn row_to_resource(row: &SqliteRow) -> Result<Resource, RepositoryError> {
    let quantity: i64 = row.try_get("quantity").map_err(decode)?;
    let consumed_quantity: i64 = row.try_get("consumed_quantity").map_err(decode)?;
    let approval_levels: i64 = row.try_get("approval_levels").map_err(decode)?;

    Ok(Resource {
        id: ResourceId(row.try_get("id").map_err(decode)?),
        phase_id: PhaseId(row.try_get("phase_id").map_err(decode)?),
        name: row.try_get("name").map_err(decode)?,
        resource_type: row.try_get("resource_type").map_err(decode)?,
        quantity: narrow("quantity", quantity)?,
        consumed_quantity: narrow("consumed_quantity", consumed_quantity)?,
        approval_levels: narrow("approval_levels", approval_levels)?,
    })
}

pub(crate) fn row_to_template(row: &SqliteRow) -> Result<ResourceTemplate, RepositoryError> {
    let approval_levels: i64 = row.try_get("approval_levels").map_err(decode)?;
    let default_config: String = row.try_get("default_config_json").map_err(decode)?;

    Ok(ResourceTemplate {
        id: TemplateId(row.try_get("id").map_err(decode)?),
        name: row.try_get("name").map_err(decode)?,
        resource_type: row.try_get("resource_type").map_err(decode)?,
        approval_levels: narrow("approval_levels", approval_levels)?,
        default_config: serde_json::from_str(&default_config).map_err(decode)?,
    })
}

#[async_trait::async_trait]
impl CatalogRepository for SqlCatalogRepository {
    async fn save_phase(&self, phase: ProjectPhase) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO project_phase (id, project_name, phase_name)
             VALUES (?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 project_name = excluded.project_name,
                 phase_name = excluded.phase_name",
        )
        .bind(&phase.id.0)
        .bind(&phase.project_name)
        .bind(&phase.phase_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_resource(&self, resource: Resource) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO resource (id, phase_id, name, resource_type, quantity,
                                   consumed_quantity, approval_levels)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 phase_id = excluded.phase_id,
                 name = excluded.name,
                 resource_type = excluded.resource_type,
                 quantity = excluded.quantity,
                 consumed_quantity = excluded.consumed_quantity,
                 approval_levels = excluded.approval_levels",
        )
        .bind(&resource.id.0)
        .bind(&resource.phase_id.0)
        .bind(&resource.name)
        .bind(&resource.resource_type)
        .bind(i64::from(resource.quantity))
        .bind(i64::from(resource.consumed_quantity))
        .bind(i64::from(resource.approval_levels))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_template(&self, template: ResourceTemplate) -> Result<(), RepositoryError> {
        let default_config = serde_json::to_string(&template.default_config).map_err(decode)?;
        sqlx::query(
            "INSERT INTO resource_template (id, name, resource_type, approval_levels,
                                            default_config_json)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 resource_type = excluded.resource_type,
                 approval_levels = excluded.approval_levels,
                 default_config_json = excluded.default_config_json",
        )
        .bind(&template.id.0)
        .bind(&template.name)
        .bind(&template.resource_type)
        .bind(i64::from(template.approval_levels))
        .bind(default_config)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_user(&self, user: DirectoryUser) -> Result<(), RepositoryError> {
        save_user(&self.pool, &user).await
    }
}
