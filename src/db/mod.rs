use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;

use crate::models::item::{ClothingItem, ClothingMetadata};

pub mod items;
pub mod memory;

pub use items::PgItemRepository;
pub use memory::MemoryItemRepository;

/// Initialize PostgreSQL connection pool
pub async fn init_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .min_connections(5)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await
}

/// Run database migrations
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| sqlx::Error::Migrate(Box::new(e)))
}

/// Persistence for clothing items.
///
/// Every mutating call is a single conditional row update keyed by item
/// id. It returns `false` when the row is missing or its current status
/// does not accept the transition.
#[async_trait]
pub trait ItemRepository: Send + Sync {
    async fn get(&self, item_id: &str) -> Result<Option<ClothingItem>, RepositoryError>;

    /// Insert a pending item (upload confirmation).
    async fn create(&self, item: &ClothingItem) -> Result<(), RepositoryError>;

    /// `pending -> processing`, recording the processed image key. Acts as
    /// the per-item in-flight marker.
    async fn mark_processing(&self, item_id: &str, processed_image_key: &str) -> Result<bool, RepositoryError>;

    /// `processing -> pending` after the queue refused the job.
    async fn release(&self, item_id: &str) -> Result<bool, RepositoryError>;

    /// Persist metadata and set `ready` in one write.
    async fn commit_analysis(&self, item_id: &str, metadata: &ClothingMetadata) -> Result<bool, RepositoryError>;

    /// `processing -> failed` with the last error.
    async fn mark_failed(&self, item_id: &str, reason: &str) -> Result<bool, RepositoryError>;
}

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Stored item is invalid: {0}")]
    Corrupt(String),

    #[error("Item already exists: {0}")]
    Duplicate(String),
}
