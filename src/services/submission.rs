use garde::Validate;
use uuid::Uuid;

use crate::db::{ItemRepository, RepositoryError};
use crate::models::item::ItemStatus;
use crate::models::job::{AnalyzeImagePayload, JobPayload};
use crate::services::queue::{EnqueueOptions, JobQueue, QueueError};

/// Accept an uploaded item for analysis: claim it (`pending -> processing`)
/// and enqueue exactly one job for it.
///
/// The claim is the per-item in-flight marker, so a duplicate submission
/// is rejected before a second job can race the first.
pub async fn submit_analysis(
    items: &dyn ItemRepository,
    queue: &JobQueue,
    payload: AnalyzeImagePayload,
    options: EnqueueOptions,
) -> Result<Uuid, SubmitError> {
    payload.validate()?;

    if !items
        .mark_processing(&payload.item_id, &payload.processed_image_key)
        .await?
    {
        return Err(match items.get(&payload.item_id).await? {
            Some(item) => SubmitError::NotPending {
                item_id: payload.item_id,
                status: item.status,
            },
            None => SubmitError::ItemNotFound(payload.item_id),
        });
    }

    let item_id = payload.item_id.clone();
    match queue.enqueue(JobPayload::AnalyzeImage(payload), options).await {
        Ok(job_id) => Ok(job_id),
        Err(e) => {
            tracing::error!(item_id = %item_id, error = %e, "Enqueue failed, releasing item");
            if let Err(release_err) = items.release(&item_id).await {
                tracing::error!(item_id = %item_id, error = %release_err, "Failed to release item");
            }
            Err(e.into())
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("Invalid payload: {0}")]
    Invalid(#[from] garde::Report),

    #[error("Item not found: {0}")]
    ItemNotFound(String),

    #[error("Item {item_id} is {status}, only pending items can be submitted")]
    NotPending { item_id: String, status: ItemStatus },

    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryItemRepository;
    use crate::models::item::ClothingItem;
    use crate::models::job::JobKind;
    use crate::services::queue::QueueOptions;

    fn payload(item: &str) -> AnalyzeImagePayload {
        AnalyzeImagePayload {
            item_id: item.to_string(),
            processed_image_key: format!("processed/{item}.jpg"),
            owner_id: "user_1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_submit_marks_processing_and_enqueues() {
        let items = MemoryItemRepository::new();
        items.create(&ClothingItem::new("item_1", "user_1", "raw/1.jpg")).await.unwrap();
        let queue = JobQueue::in_memory(QueueOptions::default());

        let job_id = submit_analysis(&items, &queue, payload("item_1"), EnqueueOptions::default())
            .await
            .unwrap();

        assert_eq!(
            items.get("item_1").await.unwrap().unwrap().status,
            ItemStatus::Processing
        );
        assert!(queue.job_status(JobKind::AnalyzeImage, job_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_duplicate_submission_rejected() {
        let items = MemoryItemRepository::new();
        items.create(&ClothingItem::new("item_1", "user_1", "raw/1.jpg")).await.unwrap();
        let queue = JobQueue::in_memory(QueueOptions::default());

        submit_analysis(&items, &queue, payload("item_1"), EnqueueOptions::default())
            .await
            .unwrap();
        let err = submit_analysis(&items, &queue, payload("item_1"), EnqueueOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            SubmitError::NotPending { status: ItemStatus::Processing, .. }
        ));
        assert_eq!(queue.counts(JobKind::AnalyzeImage).await.unwrap().waiting, 1);
    }

    #[tokio::test]
    async fn test_unknown_item_rejected() {
        let items = MemoryItemRepository::new();
        let queue = JobQueue::in_memory(QueueOptions::default());
        let err = submit_analysis(&items, &queue, payload("ghost"), EnqueueOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::ItemNotFound(_)));
    }

    #[tokio::test]
    async fn test_rejected_enqueue_releases_item() {
        let items = MemoryItemRepository::new();
        items.create(&ClothingItem::new("item_1", "user_1", "raw/1.jpg")).await.unwrap();
        let queue = JobQueue::in_memory(QueueOptions::default());

        let options = EnqueueOptions {
            priority: Some(u32::MAX),
            delay: None,
        };
        let err = submit_analysis(&items, &queue, payload("item_1"), options)
            .await
            .unwrap_err();

        assert!(matches!(err, SubmitError::Queue(QueueError::InvalidOptions(_))));
        assert_eq!(
            items.get("item_1").await.unwrap().unwrap().status,
            ItemStatus::Pending
        );
    }
}
