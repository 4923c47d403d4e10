use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};

use super::{ItemRepository, RepositoryError};
use crate::models::item::{ClothingItem, ClothingMetadata, ItemStatus, StatusEvent};

/// Postgres-backed item repository.
///
/// Transitions are enforced in the `WHERE` clause using the statuses the
/// state machine accepts for each event, so a concurrent writer can never
/// move an item out of a terminal state.
#[derive(Clone)]
pub struct PgItemRepository {
    pool: PgPool,
}

impl PgItemRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn sources(event: StatusEvent) -> Vec<String> {
    event.allowed_from().iter().map(|s| s.to_string()).collect()
}

fn item_from_row(row: &PgRow) -> Result<ClothingItem, RepositoryError> {
    let status: String = row.try_get("status")?;
    let status = status
        .parse::<ItemStatus>()
        .map_err(|_| RepositoryError::Corrupt(format!("unknown status '{status}'")))?;
    let metadata: Option<Json<ClothingMetadata>> = row.try_get("metadata")?;

    Ok(ClothingItem {
        id: row.try_get("id")?,
        owner_id: row.try_get("owner_id")?,
        image_key: row.try_get("image_key")?,
        processed_image_key: row.try_get("processed_image_key")?,
        status,
        metadata: metadata.map(|m| m.0),
        failure_reason: row.try_get("failure_reason")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl ItemRepository for PgItemRepository {
    async fn get(&self, item_id: &str) -> Result<Option<ClothingItem>, RepositoryError> {
        let row = sqlx::query(
            r#"
            SELECT id, owner_id, image_key, processed_image_key, status, metadata,
                   failure_reason, created_at, updated_at
            FROM clothing_items
            WHERE id = $1
            "#,
        )
        .bind(item_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(item_from_row).transpose()
    }

    async fn create(&self, item: &ClothingItem) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"
            INSERT INTO clothing_items (id, owner_id, image_key, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&item.id)
        .bind(&item.owner_id)
        .bind(&item.image_key)
        .bind(item.status.to_string())
        .bind(item.created_at)
        .bind(item.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::Duplicate(item.id.clone()));
        }
        Ok(())
    }

    async fn mark_processing(&self, item_id: &str, processed_image_key: &str) -> Result<bool, RepositoryError> {
        let event = StatusEvent::Enqueued;
        let result = sqlx::query(
            r#"
            UPDATE clothing_items
            SET status = $1, processed_image_key = $2, failure_reason = NULL
            WHERE id = $3 AND status = ANY($4)
            "#,
        )
        .bind(event.target().to_string())
        .bind(processed_image_key)
        .bind(item_id)
        .bind(sources(event))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release(&self, item_id: &str) -> Result<bool, RepositoryError> {
        let event = StatusEvent::EnqueueRejected;
        let result = sqlx::query(
            r#"
            UPDATE clothing_items
            SET status = $1
            WHERE id = $2 AND status = ANY($3)
            "#,
        )
        .bind(event.target().to_string())
        .bind(item_id)
        .bind(sources(event))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn commit_analysis(&self, item_id: &str, metadata: &ClothingMetadata) -> Result<bool, RepositoryError> {
        let event = StatusEvent::AnalysisSucceeded;
        let result = sqlx::query(
            r#"
            UPDATE clothing_items
            SET status = $1, metadata = $2, failure_reason = NULL
            WHERE id = $3 AND status = ANY($4)
            "#,
        )
        .bind(event.target().to_string())
        .bind(Json(metadata))
        .bind(item_id)
        .bind(sources(event))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_failed(&self, item_id: &str, reason: &str) -> Result<bool, RepositoryError> {
        let event = StatusEvent::RetriesExhausted;
        let result = sqlx::query(
            r#"
            UPDATE clothing_items
            SET status = $1, failure_reason = $2
            WHERE id = $3 AND status = ANY($4)
            "#,
        )
        .bind(event.target().to_string())
        .bind(reason)
        .bind(item_id)
        .bind(sources(event))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
