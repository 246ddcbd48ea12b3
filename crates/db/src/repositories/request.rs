use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, Transaction};

use provisio_core::allocation::AllocationStore;
use provisio_core::domain::approval::{ApprovalRecord, ApprovalRecordId, ApprovalStatus};
use provisio_core::domain::request::{
    ProvenanceFields, RequestSnapshot, RequestStatus, ResourceRequest, ResourceRequestId,
};
use provisio_core::domain::resource::{
    PhaseId, ProjectPhase, Resource, ResourceId, ResourceTemplate, TemplateId,
};
use provisio_core::domain::user::UserId;
use provisio_core::errors::StoreError;
use provisio_core::flows::states::{CreationPlan, RecordWrite, TransitionPlan};
use provisio_core::ledger::{Availability, LedgerCommit};

use super::catalog::{row_to_phase, row_to_resource, row_to_template, RESOURCE_COLUMNS};
use super::{decode, narrow, parse_timestamp, RepositoryError};
use crate::DbPool;

const REQUEST_COLUMNS: &str = "id, requester_id, phase_id, resource_id, resource_template_id,
     resource_type, requested_config_json, requested_qty, justification, status, current_level,
     required_levels, rejection_reason, created_at, updated_at";

const RECORD_COLUMNS: &str = "id, resource_request_id, approval_level, status, approver_id,
     comments, approved_at, created_at";

const GRANTED_STATUSES: &str = "('approved', 'assigned_to_it', 'completed')";

/// SQLite-backed allocation store. Every unit of work opens with a write so competing writers
/// are serialised by the database lock before any guard is read.
#[derive(Clone)]
pub struct SqlAllocationStore {
    pool: DbPool,
}

impl SqlAllocationStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    async fn insert_request_tx(
        &self,
        plan: &CreationPlan,
    ) -> Result<RequestSnapshot, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        if let Some(commit) = &plan.ledger_commit {
            commit_ledger(&mut tx, commit).await?;
        }

        insert_request_row(&mut tx, &plan.request).await?;

        if let Some(guard) = &plan.type_guard {
            let granted = granted_for_type(
                &mut *tx,
                &guard.phase_id,
                &guard.resource_type,
                Some(&plan.request.id),
            )
            .await?;
            guard.check(granted)?;
        }

        if let Some(record) = &plan.first_approval {
            insert_record(&mut tx, record).await?;
        }

        tx.commit().await?;

        Ok(RequestSnapshot {
            request: plan.request.clone(),
            approvals: plan.first_approval.iter().cloned().collect(),
        })
    }

    async fn apply_transition_tx(
        &self,
        plan: &TransitionPlan,
    ) -> Result<RequestSnapshot, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        let stale =
            || StoreError::Stale { request_id: plan.request_id.0.clone(), level: plan.level };

        let moved = sqlx::query(
            "UPDATE resource_request
             SET status = ?, current_level = ?, rejection_reason = ?, updated_at = ?
             WHERE id = ? AND current_level = ? AND status IN ('pending', 'in_progress')",
        )
        .bind(plan.next_status.as_str())
        .bind(i64::from(plan.next_current_level))
        .bind(&plan.rejection_reason)
        .bind(plan.decided_at.to_rfc3339())
        .bind(&plan.request_id.0)
        .bind(i64::from(plan.expected_current_level))
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if moved == 0 {
            let exists: i64 =
                sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM resource_request WHERE id = ?)")
                    .bind(&plan.request_id.0)
                    .fetch_one(&mut *tx)
                    .await?;
            if exists == 0 {
                return Err(StoreError::NotFound {
                    entity: "resource_request",
                    id: plan.request_id.0.clone(),
                }
                .into());
            }
            return Err(stale().into());
        }

        match &plan.record_write {
            RecordWrite::ResolvePending => {
                let resolved = sqlx::query(
                    "UPDATE approval_record
                     SET status = ?, approver_id = ?, comments = ?, approved_at = ?
                     WHERE resource_request_id = ? AND approval_level = ? AND status = 'pending'",
                )
                .bind(plan.decision.as_str())
                .bind(&plan.approver_id.0)
                .bind(&plan.comments)
                .bind(plan.decided_at.to_rfc3339())
                .bind(&plan.request_id.0)
                .bind(i64::from(plan.level))
                .execute(&mut *tx)
                .await?
                .rows_affected();
                if resolved == 0 {
                    return Err(stale().into());
                }
            }
            RecordWrite::InsertResolved { record_id } => {
                let record = ApprovalRecord {
                    id: record_id.clone(),
                    request_id: plan.request_id.clone(),
                    approval_level: plan.level,
                    status: plan.decision,
                    approver_id: Some(plan.approver_id.clone()),
                    comments: plan.comments.clone(),
                    approved_at: Some(plan.decided_at),
                    created_at: plan.decided_at,
                };
                insert_record(&mut tx, &record).await?;
            }
        }

        if let Some(next) = &plan.next_level {
            let record = ApprovalRecord {
                id: next.record_id.clone(),
                request_id: plan.request_id.clone(),
                approval_level: next.level,
                status: ApprovalStatus::Pending,
                approver_id: next.approver_id.clone(),
                comments: None,
                approved_at: None,
                created_at: plan.decided_at,
            };
            insert_record(&mut tx, &record).await?;
        }

        if let Some(commit) = &plan.ledger_commit {
            commit_ledger(&mut tx, commit).await?;
        }

        let snapshot = load_snapshot(&mut *tx, &plan.request_id).await?.ok_or_else(|| {
            StoreError::NotFound { entity: "resource_request", id: plan.request_id.0.clone() }
        })?;

        tx.commit().await?;
        Ok(snapshot)
    }
}

/// Conditional increment; zero rows touched means the pool cannot cover the quantity.
async fn commit_ledger(
    tx: &mut Transaction<'_, Sqlite>,
    commit: &LedgerCommit,
) -> Result<(), RepositoryError> {
    let quantity = i64::from(commit.quantity);
    let updated = sqlx::query(
        "UPDATE resource SET consumed_quantity = consumed_quantity + ?
         WHERE id = ? AND consumed_quantity + ? <= quantity",
    )
    .bind(quantity)
    .bind(&commit.resource_id.0)
    .bind(quantity)
    .execute(&mut **tx)
    .await?
    .rows_affected();
    if updated == 1 {
        return Ok(());
    }

    let row = sqlx::query(&format!("SELECT {RESOURCE_COLUMNS} FROM resource WHERE id = ?"))
        .bind(&commit.resource_id.0)
        .fetch_optional(&mut **tx)
        .await?;
    let Some(row) = row else {
        return Err(StoreError::NotFound { entity: "resource", id: commit.resource_id.0.clone() }
            .into());
    };
    let availability = Availability::of_resource(&row_to_resource(&row)?);
    Err(StoreError::CapacityExceeded {
        resource_id: commit.resource_id.0.clone(),
        available: availability.available,
        total: availability.total,
        consumed: availability.consumed,
    }
    .into())
}

async fn insert_request_row(
    tx: &mut Transaction<'_, Sqlite>,
    request: &ResourceRequest,
) -> Result<(), RepositoryError> {
    let provenance = ProvenanceFields::from_provenance(&request.provenance);
    let requested_config = serde_json::to_string(&request.requested_config).map_err(decode)?;

    sqlx::query(
        "INSERT INTO resource_request (id, requester_id, phase_id, resource_id,
             resource_template_id, resource_type, requested_config_json, requested_qty,
             justification, status, current_level, required_levels, rejection_reason,
             created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&request.id.0)
    .bind(&request.requester_id.0)
    .bind(&request.phase_id.0)
    .bind(&provenance.resource_id)
    .bind(&provenance.resource_template_id)
    .bind(&provenance.resource_type)
    .bind(requested_config)
    .bind(i64::from(request.requested_qty))
    .bind(&request.justification)
    .bind(request.status.as_str())
    .bind(i64::from(request.current_level))
    .bind(i64::from(request.required_levels))
    .bind(&request.rejection_reason)
    .bind(request.created_at.to_rfc3339())
    .bind(request.updated_at.to_rfc3339())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// A unique violation on `(resource_request_id, approval_level)` means another actor already
/// created this level's record.
async fn insert_record(
    tx: &mut Transaction<'_, Sqlite>,
    record: &ApprovalRecord,
) -> Result<(), RepositoryError> {
    let result = sqlx::query(
        "INSERT INTO approval_record (id, resource_request_id, approval_level, status,
             approver_id, comments, approved_at, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&record.id.0)
    .bind(&record.request_id.0)
    .bind(i64::from(record.approval_level))
    .bind(record.status.as_str())
    .bind(record.approver_id.as_ref().map(|id| id.0.as_str()))
    .bind(&record.comments)
    .bind(record.approved_at.map(|at| at.to_rfc3339()))
    .bind(record.created_at.to_rfc3339())
    .execute(&mut **tx)
    .await;

    match result {
        Ok(_) => Ok(()),
        Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
            Err(StoreError::Stale {
                request_id: record.request_id.0.clone(),
                level: record.approval_level,
            }
            .into())
        }
        Err(error) => Err(error.into()),
    }
}

async fn granted_for_type<'e, E>(
    executor: E,
    phase_id: &PhaseId,
    resource_type: &str,
    excluding: Option<&ResourceRequestId>,
) -> Result<u64, RepositoryError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let granted: i64 = sqlx::query_scalar(&format!(
        "SELECT COALESCE(SUM(requested_qty), 0) FROM resource_request
         WHERE phase_id = ?
           AND resource_type IS NOT NULL
           AND lower(trim(resource_type)) = lower(trim(?))
           AND status IN {GRANTED_STATUSES}
           AND (? IS NULL OR id <> ?)"
    ))
    .bind(&phase_id.0)
    .bind(resource_type)
    .bind(excluding.map(|id| id.0.as_str()))
    .bind(excluding.map(|id| id.0.as_str()))
    .fetch_one(executor)
    .await?;

    narrow("granted_quantity", granted)
}

async fn load_snapshot(
    conn: &mut sqlx::SqliteConnection,
    id: &ResourceRequestId,
) -> Result<Option<RequestSnapshot>, RepositoryError> {
    let row = sqlx::query(&format!("SELECT {REQUEST_COLUMNS} FROM resource_request WHERE id = ?"))
        .bind(&id.0)
        .fetch_optional(&mut *conn)
        .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    let request = row_to_request(&row)?;

    let records = sqlx::query(&format!(
        "SELECT {RECORD_COLUMNS} FROM approval_record
         WHERE resource_request_id = ? ORDER BY approval_level"
    ))
    .bind(&id.0)
    .fetch_all(&mut *conn)
    .await?;
    let approvals = records.iter().map(row_to_record).collect::<Result<Vec<_>, _>>()?;

    Ok(Some(RequestSnapshot { request, approvals }))
}

fn row_to_request(row: &SqliteRow) -> Result<ResourceRequest, RepositoryError> {
    let provenance = ProvenanceFields {
        resource_id: row.try_get("resource_id").map_err(decode)?,
        resource_template_id: row.try_get("resource_template_id").map_err(decode)?,
        resource_type: row.try_get("resource_type").map_err(decode)?,
    }
    .into_provenance()
    .map_err(decode)?;

    let status: String = row.try_get("status").map_err(decode)?;
    let status = RequestStatus::parse(&status)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown request status `{status}`")))?;
    let requested_config: String = row.try_get("requested_config_json").map_err(decode)?;
    let requested_qty: i64 = row.try_get("requested_qty").map_err(decode)?;
    let current_level: i64 = row.try_get("current_level").map_err(decode)?;
    let required_levels: i64 = row.try_get("required_levels").map_err(decode)?;
    let created_at: String = row.try_get("created_at").map_err(decode)?;
    let updated_at: String = row.try_get("updated_at").map_err(decode)?;

    Ok(ResourceRequest {
        id: ResourceRequestId(row.try_get("id").map_err(decode)?),
        requester_id: UserId(row.try_get("requester_id").map_err(decode)?),
        phase_id: PhaseId(row.try_get("phase_id").map_err(decode)?),
        provenance,
        requested_config: serde_json::from_str(&requested_config).map_err(decode)?,
        requested_qty: narrow("requested_qty", requested_qty)?,
        justification: row.try_get("justification").map_err(decode)?,
        status,
        current_level: narrow("current_level", current_level)?,
        required_levels: narrow("required_levels", required_levels)?,
        rejection_reason: row.try_get("rejection_reason").map_err(decode)?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

fn row_to_record(row: &SqliteRow) -> Result<ApprovalRecord, RepositoryError> {
    let status: String = row.try_get("status").map_err(decode)?;
    let status = ApprovalStatus::parse(&status)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown approval status `{status}`")))?;
    let approval_level: i64 = row.try_get("approval_level").map_err(decode)?;
    let approver_id: Option<String> = row.try_get("approver_id").map_err(decode)?;
    let approved_at: Option<String> = row.try_get("approved_at").map_err(decode)?;
    let created_at: String = row.try_get("created_at").map_err(decode)?;

    Ok(ApprovalRecord {
        id: ApprovalRecordId(row.try_get("id").map_err(decode)?),
        request_id: ResourceRequestId(row.try_get("resource_request_id").map_err(decode)?),
        approval_level: narrow("approval_level", approval_level)?,
        status,
        approver_id: approver_id.map(UserId),
        comments: row.try_get("comments").map_err(decode)?,
        approved_at: approved_at.as_deref().map(parse_timestamp).transpose()?,
        created_at: parse_timestamp(&created_at)?,
    })
}

#[async_trait]
impl AllocationStore for SqlAllocationStore {
    async fn find_phase(&self, id: &PhaseId) -> Result<Option<ProjectPhase>, StoreError> {
        let row = sqlx::query("SELECT id, project_name, phase_name FROM project_phase WHERE id = ?")
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(RepositoryError::from)?;
        Ok(row.as_ref().map(row_to_phase).transpose()?)
    }

    async fn find_resource(&self, id: &ResourceId) -> Result<Option<Resource>, StoreError> {
        let row = sqlx::query(&format!("SELECT {RESOURCE_COLUMNS} FROM resource WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(RepositoryError::from)?;
        Ok(row.as_ref().map(row_to_resource).transpose()?)
    }

    async fn find_template(&self, id: &TemplateId) -> Result<Option<ResourceTemplate>, StoreError> {
        let row = sqlx::query(
            "SELECT id, name, resource_type, approval_levels, default_config_json
             FROM resource_template WHERE id = ?",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(RepositoryError::from)?;
        Ok(row.as_ref().map(row_to_template).transpose()?)
    }

    async fn find_resource_by_type(
        &self,
        phase_id: &PhaseId,
        resource_type: &str,
    ) -> Result<Option<Resource>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {RESOURCE_COLUMNS} FROM resource
             WHERE phase_id = ? AND lower(trim(resource_type)) = lower(trim(?))
             ORDER BY id LIMIT 1"
        ))
        .bind(&phase_id.0)
        .bind(resource_type)
        .fetch_optional(&self.pool)
        .await
        .map_err(RepositoryError::from)?;
        Ok(row.as_ref().map(row_to_resource).transpose()?)
    }

    async fn granted_quantity_for_type(
        &self,
        phase_id: &PhaseId,
        resource_type: &str,
        excluding: Option<&ResourceRequestId>,
    ) -> Result<u64, StoreError> {
        Ok(granted_for_type(&self.pool, phase_id, resource_type, excluding).await?)
    }

    async fn find_request(
        &self,
        id: &ResourceRequestId,
    ) -> Result<Option<RequestSnapshot>, StoreError> {
        let mut conn = self.pool.acquire().await.map_err(RepositoryError::from)?;
        Ok(load_snapshot(&mut conn, id).await?)
    }

    async fn insert_request(&self, plan: &CreationPlan) -> Result<RequestSnapshot, StoreError> {
        Ok(self.insert_request_tx(plan).await?)
    }

    async fn apply_transition(&self, plan: &TransitionPlan) -> Result<RequestSnapshot, StoreError> {
        Ok(self.apply_transition_tx(plan).await?)
    }
}

