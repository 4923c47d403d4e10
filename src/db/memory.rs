use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{ItemRepository, RepositoryError};
use crate::models::item::{ClothingItem, ClothingMetadata, StatusEvent};

/// In-memory item repository for tests and local runs.
#[derive(Default)]
pub struct MemoryItemRepository {
    items: RwLock<HashMap<String, ClothingItem>>,
}

impl MemoryItemRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `event` to the item, running `update` on success. Returns
    /// `false` if the item is missing or the transition is illegal.
    async fn transition<F>(&self, item_id: &str, event: StatusEvent, update: F) -> bool
    where
        F: FnOnce(&mut ClothingItem),
    {
        let mut items = self.items.write().await;
        let Some(item) = items.get_mut(item_id) else {
            return false;
        };
        match item.status.apply(event) {
            Ok(next) => {
                item.status = next;
                item.updated_at = Utc::now();
                update(item);
                true
            }
            Err(e) => {
                tracing::debug!(item_id, error = %e, "Rejected item transition");
                false
            }
        }
    }
}

#[async_trait]
impl ItemRepository for MemoryItemRepository {
    async fn get(&self, item_id: &str) -> Result<Option<ClothingItem>, RepositoryError> {
        Ok(self.items.read().await.get(item_id).cloned())
    }

    async fn create(&self, item: &ClothingItem) -> Result<(), RepositoryError> {
        let mut items = self.items.write().await;
        if items.contains_key(&item.id) {
            return Err(RepositoryError::Duplicate(item.id.clone()));
        }
        items.insert(item.id.clone(), item.clone());
        Ok(())
    }

    async fn mark_processing(&self, item_id: &str, processed_image_key: &str) -> Result<bool, RepositoryError> {
        Ok(self
            .transition(item_id, StatusEvent::Enqueued, |item| {
                item.processed_image_key = Some(processed_image_key.to_string());
                item.failure_reason = None;
            })
            .await)
    }

    async fn release(&self, item_id: &str) -> Result<bool, RepositoryError> {
        Ok(self.transition(item_id, StatusEvent::EnqueueRejected, |_| {}).await)
    }

    async fn commit_analysis(&self, item_id: &str, metadata: &ClothingMetadata) -> Result<bool, RepositoryError> {
        Ok(self
            .transition(item_id, StatusEvent::AnalysisSucceeded, |item| {
                item.metadata = Some(metadata.clone());
                item.failure_reason = None;
            })
            .await)
    }

    async fn mark_failed(&self, item_id: &str, reason: &str) -> Result<bool, RepositoryError> {
        Ok(self
            .transition(item_id, StatusEvent::RetriesExhausted, |item| {
                item.failure_reason = Some(reason.to_string());
            })
            .await)
    }
}
