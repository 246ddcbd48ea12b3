use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use provisio_core::domain::resource::{ProjectPhase, Resource, ResourceTemplate};
use provisio_core::domain::user::DirectoryUser;
use provisio_core::errors::StoreError;

pub mod catalog;
pub mod directory;
pub mod memory;
pub mod request;

pub use catalog::SqlCatalogRepository;
pub use directory::SqlUserDirectory;
pub use memory::InMemoryAllocationStore;
pub use request::SqlAllocationStore;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<RepositoryError> for StoreError {
    fn from(error: RepositoryError) -> Self {
        match error {
            RepositoryError::Store(error) => error,
            RepositoryError::Database(error) => StoreError::Backend(error.to_string()),
            RepositoryError::Decode(message) => StoreError::Backend(format!("decode: {message}")),
        }
    }
}

/// Minimum write surface for populating the catalog. Phase, template and user CRUD beyond
/// this belongs to other services.
#[async_trait]
pub trait CatalogRepository: Send + Sync {
    async fn save_phase(&self, phase: ProjectPhase) -> Result<(), RepositoryError>;
    async fn save_resource(&self, resource: Resource) -> Result<(), RepositoryError>;
    async fn save_template(&self, template: ResourceTemplate) -> Result<(), RepositoryError>;
    async fn save_user(&self, user: DirectoryUser) -> Result<(), RepositoryError>;
}

pub(crate) fn decode<E: std::fmt::Display>(error: E) -> RepositoryError {
    RepositoryError::Decode(error.to_string())
}

pub(crate) fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(value).map(|dt| dt.with_timezone(&Utc)).map_err(decode)
}

pub(crate) fn narrow<T: TryFrom<i64>>(column: &str, value: i64) -> Result<T, RepositoryError> {
    T::try_from(value)
        .map_err(|_| RepositoryError::Decode(format!("{column} out of range: {value}")))
}
