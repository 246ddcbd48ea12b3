use sqlx::Executor;

use crate::connection::DbPool;
use crate::repositories::RepositoryError;

pub const DEMO_PHASE_ID: &str = "phase-atlas-build";

const SEED_PHASE_IDS: &[&str] = &[DEMO_PHASE_ID];
const SEED_RESOURCE_IDS: &[&str] = &["res-atlas-vm", "res-atlas-db", "res-atlas-gpu"];
const SEED_TEMPLATE_IDS: &[&str] = &["tpl-laptop", "tpl-saas-seat", "tpl-gpu-cluster"];

/// Every approving level needs at least one eligible user for notification fan-out.
const SEED_USERS: &[(&str, &str)] = &[
    ("u-employee", "employee"),
    ("u-pm", "project_manager"),
    ("u-it-staff", "it_staff"),
    ("u-dept-head", "department_head"),
    ("u-it-head", "it_head"),
    ("u-admin", "admin"),
];

/// Demo catalog used by `provisio seed` and by integration tests.
pub struct DemoCatalog;

impl DemoCatalog {
    pub const SQL: &str = include_str!("../../../config/fixtures/demo_catalog.sql");

    pub async fn load(pool: &DbPool) -> Result<SeedResult, RepositoryError> {
        let mut tx = pool.begin().await?;
        tx.execute(sqlx::query(Self::SQL)).await?;
        tx.commit().await?;

        Ok(SeedResult {
            phases: SEED_PHASE_IDS.len(),
            resources: SEED_RESOURCE_IDS.len(),
            templates: SEED_TEMPLATE_IDS.len(),
            users: SEED_USERS.len(),
        })
    }

    pub async fn verify(pool: &DbPool) -> Result<VerificationResult, RepositoryError> {
        let mut checks = Vec::new();

        for id in SEED_PHASE_IDS {
            checks.push((
                *id,
                exists(pool, "SELECT EXISTS(SELECT 1 FROM project_phase WHERE id = ?1)", id)
                    .await?,
            ));
        }
        for id in SEED_RESOURCE_IDS {
            let in_phase: i64 = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM resource WHERE id = ?1 AND phase_id = ?2)",
            )
            .bind(*id)
            .bind(DEMO_PHASE_ID)
            .fetch_one(pool)
            .await?;
            checks.push((*id, in_phase == 1));
        }
        for id in SEED_TEMPLATE_IDS {
            checks.push((
                *id,
                exists(pool, "SELECT EXISTS(SELECT 1 FROM resource_template WHERE id = ?1)", id)
                    .await?,
            ));
        }
        for (id, role) in SEED_USERS {
            let present: i64 = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM app_user WHERE id = ?1 AND role = ?2)",
            )
            .bind(*id)
            .bind(*role)
            .fetch_one(pool)
            .await?;
            checks.push((*id, present == 1));
        }

        let all_present = checks.iter().all(|(_, present)| *present);
        Ok(VerificationResult { all_present, checks })
    }
}

async fn exists(pool: &DbPool, sql: &str, id: &str) -> Result<bool, RepositoryError> {
    let found: i64 = sqlx::query_scalar(sql).bind(id).fetch_one(pool).await?;
    Ok(found == 1)
}

#[derive(Debug)]
pub struct SeedResult {
    pub phases: usize,
    pub resources: usize,
    pub templates: usize,
    pub users: usize,
}

#[derive(Debug)]
pub struct VerificationResult {
    pub all_present: bool,
    pub checks: Vec<(&'static str, bool)>,
}
