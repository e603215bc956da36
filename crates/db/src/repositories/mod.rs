use async_trait::async_trait;
use thiserror::Error;

use clinicsync_core::domain::link::EventLink;
use clinicsync_core::domain::sync_log::SyncLogEntry;
use clinicsync_core::identity::EntityMapping;

pub mod link;
pub mod mapping;
pub mod memory;
pub mod sync_log;

pub use link::SqlLinkRepository;
pub use mapping::SqlMappingRepository;
pub use memory::{InMemoryLinkRepository, InMemoryMappingRepository, InMemorySyncLogRepository};
pub use sync_log::SqlSyncLogRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

/// Administrative mapping table storage. Replacement is wholesale: the admin
/// endpoint never merges partial updates.
#[async_trait]
pub trait MappingRepository: Send + Sync {
    async fn load_all(&self) -> Result<Vec<EntityMapping>, RepositoryError>;
    async fn replace_all(&self, mappings: Vec<EntityMapping>) -> Result<(), RepositoryError>;
}

/// Durable booking-id → calendar-event correspondence, the engine's
/// idempotency key.
#[async_trait]
pub trait LinkRepository: Send + Sync {
    async fn find_by_booking(&self, booking_id: &str)
        -> Result<Option<EventLink>, RepositoryError>;
    async fn save(&self, link: EventLink) -> Result<(), RepositoryError>;
    /// Returns whether a link existed.
    async fn delete(&self, booking_id: &str) -> Result<bool, RepositoryError>;
}

#[async_trait]
pub trait SyncLogRepository: Send + Sync {
    async fn append(&self, entry: SyncLogEntry) -> Result<(), RepositoryError>;
    async fn recent(&self, limit: i64) -> Result<Vec<SyncLogEntry>, RepositoryError>;
}
