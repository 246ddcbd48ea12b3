use std::sync::Arc;

use provisio_core::allocation::AllocationEngine;
use provisio_core::config::{AppConfig, ConfigError, LoadOptions};
use provisio_core::notify::{Notifier, TracingNotifier};
use provisio_db::{
    connect_with_settings, migrations, DbPool, SqlAllocationStore, SqlUserDirectory,
};
use thiserror::Error;
use tracing::info;

use crate::notify::WebhookNotifier;

pub type ServerEngine = AllocationEngine<SqlAllocationStore, SqlUserDirectory, Arc<dyn Notifier>>;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub engine: Arc<ServerEngine>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("webhook client could not be built: {0}")]
    Notifier(#[source] reqwest::Error),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let notifier: Arc<dyn Notifier> =
        match WebhookNotifier::from_config(&config.notifier).map_err(BootstrapError::Notifier)? {
            Some(webhook) => Arc::new(webhook),
            None => Arc::new(TracingNotifier),
        };
    info!(
        event_name = "system.bootstrap.notifier_ready",
        correlation_id = "bootstrap",
        transport = if config.notifier.webhook_enabled() { "webhook" } else { "log" },
        "notifier initialized"
    );

    let engine = AllocationEngine::new(
        SqlAllocationStore::new(db_pool.clone()),
        SqlUserDirectory::new(db_pool.clone()),
        notifier,
    );

    Ok(Application { config, db_pool, engine: Arc::new(engine) })
}
