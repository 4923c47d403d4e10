//! In-memory pipeline harness shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use wardrobe_pipeline::db::{ItemRepository, MemoryItemRepository, RepositoryError};
use wardrobe_pipeline::models::item::{ClothingItem, ClothingMetadata};
use wardrobe_pipeline::models::job::{JobKind, JobState, JobStatusView};
use wardrobe_pipeline::services::ai::MockAiClient;
use wardrobe_pipeline::services::analysis::{AnalysisContext, DEFAULT_MODEL};
use wardrobe_pipeline::services::queue::{Backoff, JobQueue, QueueOptions, WorkerOptions};
use wardrobe_pipeline::services::storage::{MemoryStorage, Storage};

/// Smallest byte prefix `image::guess_format` recognises as PNG.
pub const PNG_BYTES: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";

/// Item repository that counts terminal failure writes and can make the
/// next few of them error.
#[derive(Default)]
pub struct CountingItems {
    inner: MemoryItemRepository,
    mark_failed_calls: AtomicUsize,
    mark_failed_outages: AtomicUsize,
}

impl CountingItems {
    pub fn mark_failed_calls(&self) -> usize {
        self.mark_failed_calls.load(Ordering::SeqCst)
    }

    pub fn fail_next_mark_failed(&self, times: usize) {
        self.mark_failed_outages.store(times, Ordering::SeqCst);
    }
}

#[async_trait]
impl ItemRepository for CountingItems {
    async fn get(&self, item_id: &str) -> Result<Option<ClothingItem>, RepositoryError> {
        self.inner.get(item_id).await
    }

    async fn create(&self, item: &ClothingItem) -> Result<(), RepositoryError> {
        self.inner.create(item).await
    }

    async fn mark_processing(&self, item_id: &str, key: &str) -> Result<bool, RepositoryError> {
        self.inner.mark_processing(item_id, key).await
    }

    async fn release(&self, item_id: &str) -> Result<bool, RepositoryError> {
        self.inner.release(item_id).await
    }

    async fn commit_analysis(&self, item_id: &str, metadata: &ClothingMetadata) -> Result<bool, RepositoryError> {
        self.inner.commit_analysis(item_id, metadata).await
    }

    async fn mark_failed(&self, item_id: &str, reason: &str) -> Result<bool, RepositoryError> {
        self.mark_failed_calls.fetch_add(1, Ordering::SeqCst);
        let outage = self
            .mark_failed_outages
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if outage {
            return Err(RepositoryError::Database(sqlx::Error::PoolTimedOut));
        }
        self.inner.mark_failed(item_id, reason).await
    }
}

pub struct Harness {
    pub items: Arc<CountingItems>,
    pub storage: Arc<MemoryStorage>,
    pub ai: Arc<MockAiClient>,
    pub queue: Arc<JobQueue>,
    pub ctx: AnalysisContext,
}

impl Harness {
    pub fn new(ai: MockAiClient) -> Self {
        Self::with_options(ai, fast_queue_options())
    }

    pub fn with_options(ai: MockAiClient, options: QueueOptions) -> Self {
        let items = Arc::new(CountingItems::default());
        let storage = Arc::new(MemoryStorage::new());
        let ai = Arc::new(ai);
        let ctx = AnalysisContext {
            storage: storage.clone(),
            ai: ai.clone(),
            items: items.clone(),
            model: DEFAULT_MODEL.to_string(),
        };
        Self {
            items,
            storage,
            ai,
            queue: Arc::new(JobQueue::in_memory(options)),
            ctx,
        }
    }

    /// Create a pending item whose processed image is already in storage.
    pub async fn seed_item(&self, item_id: &str, processed_key: &str, owner_id: &str) {
        self.seed_item_with_bytes(item_id, processed_key, owner_id, PNG_BYTES).await;
    }

    pub async fn seed_item_with_bytes(&self, item_id: &str, processed_key: &str, owner_id: &str, bytes: &[u8]) {
        self.items
            .create(&ClothingItem::new(item_id, owner_id, format!("raw/{item_id}.jpg")))
            .await
            .expect("create item");
        self.storage
            .upload(processed_key, bytes, "image/png")
            .await
            .expect("upload processed image");
    }

    pub async fn item(&self, item_id: &str) -> ClothingItem {
        self.items
            .get(item_id)
            .await
            .expect("load item")
            .expect("item exists")
    }
}

/// Millisecond backoff so retry scenarios finish quickly.
pub fn fast_queue_options() -> QueueOptions {
    QueueOptions {
        backoff: Backoff::new(Duration::from_millis(10), 2.0, Duration::from_millis(50)),
        ..QueueOptions::default()
    }
}

pub fn fast_worker_options() -> WorkerOptions {
    WorkerOptions::default()
        .with_poll_interval(Duration::from_millis(5))
        .with_shutdown_timeout(Duration::from_secs(2))
}

pub fn analysis_object() -> serde_json::Value {
    serde_json::json!({
        "category": "t-shirt",
        "colors": ["navy"],
        "tags": ["cotton", "crew-neck"],
        "confidence": 0.95
    })
}

/// Poll until the job reaches `completed` or `failed`.
pub async fn wait_for_terminal(queue: &JobQueue, job_id: Uuid, timeout: Duration) -> JobStatusView {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let status = queue
            .job_status(JobKind::AnalyzeImage, job_id)
            .await
            .expect("job status")
            .expect("job exists");
        if matches!(status.state, JobState::Completed | JobState::Failed) {
            return status;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {job_id} still {:?} after {timeout:?}",
            status.state
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
