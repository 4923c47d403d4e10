//! Image analysis orchestrator: one attempt of turning a processed clothing
//! photo into persisted metadata.
//!
//! The orchestrator never retries or swallows errors. Every failure is
//! classified into a [`JobError`] and handed back to the queue.

use async_trait::async_trait;
use garde::Validate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::instrument;

use crate::db::{ItemRepository, RepositoryError};
use crate::models::analysis::AnalysisResult;
use crate::models::job::{AnalyzeImagePayload, JobPayload};
use crate::services::ai::{AiClient, AiError, ImageInput, ObjectRequest};
use crate::services::queue::{JobError, JobHandler};
use crate::services::storage::{Storage, StorageError};

pub const DEFAULT_MODEL: &str = "@cf/meta/llama-3.2-11b-vision-instruct";

const ANALYSIS_PROMPT: &str = concat!(
    "You are a fashion cataloguing assistant. Look at the clothing item in the photo and ",
    "return its garment category, the dominant colors (most prominent first), ",
    "descriptive style tags (material, pattern, fit, occasion) and your confidence ",
    "between 0 and 1. Return ONLY JSON matching the provided schema."
);

/// Collaborators injected into every analysis attempt.
#[derive(Clone)]
pub struct AnalysisContext {
    pub storage: Arc<dyn Storage>,
    pub ai: Arc<dyn AiClient>,
    pub items: Arc<dyn ItemRepository>,
    pub model: String,
}

/// Job result recorded as the queue's return value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisOutcome {
    pub success: bool,
    pub item_id: String,
}

/// Run one analysis attempt for `payload`.
#[instrument(skip(ctx, payload), fields(item_id = %payload.item_id, owner_id = %payload.owner_id))]
pub async fn analyze_item(
    ctx: &AnalysisContext,
    payload: &AnalyzeImagePayload,
) -> Result<AnalysisOutcome, AnalysisError> {
    tracing::debug!(key = %payload.processed_image_key, "Downloading processed image");
    let image_bytes = ctx.storage.download(&payload.processed_image_key).await?;

    let format = image::guess_format(&image_bytes).map_err(|_| AnalysisError::UnsupportedImage)?;
    let media_type = format.to_mime_type();

    let schema = AnalysisResult::json_schema();
    let start = Instant::now();
    let generated = ctx
        .ai
        .generate_object(ObjectRequest {
            model: &ctx.model,
            prompt: ANALYSIS_PROMPT,
            schema: &schema,
            image: ImageInput {
                bytes: &image_bytes,
                media_type,
            },
        })
        .await?;

    tracing::info!(
        ai_duration_ms = start.elapsed().as_millis() as u64,
        prompt_tokens = generated.usage.prompt_tokens,
        completion_tokens = generated.usage.completion_tokens,
        "AI extraction complete"
    );

    let result: AnalysisResult = serde_json::from_value(generated.object)
        .map_err(|e| AnalysisError::InvalidOutput(e.to_string()))?;
    result
        .validate()
        .map_err(|e| AnalysisError::InvalidOutput(e.to_string()))?;

    let metadata = result.into_metadata();
    metadata
        .validate()
        .map_err(|e| AnalysisError::InvalidOutput(format!("after normalising: {e}")))?;

    if !ctx.items.commit_analysis(&payload.item_id, &metadata).await? {
        return Err(AnalysisError::NotCommittable(payload.item_id.clone()));
    }

    tracing::info!(
        category = %metadata.category,
        colors = ?metadata.colors,
        confidence = metadata.confidence,
        "Item metadata committed"
    );

    Ok(AnalysisOutcome {
        success: true,
        item_id: payload.item_id.clone(),
    })
}

/// Queue handler for [`JobPayload::AnalyzeImage`].
pub struct AnalysisHandler {
    ctx: AnalysisContext,
}

impl AnalysisHandler {
    pub fn new(ctx: AnalysisContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl JobHandler for AnalysisHandler {
    async fn process(&self, payload: &JobPayload) -> Result<serde_json::Value, JobError> {
        let JobPayload::AnalyzeImage(payload) = payload;
        let outcome = analyze_item(&self.ctx, payload).await?;
        serde_json::to_value(outcome).map_err(|e| JobError::Permanent(e.to_string()))
    }

    /// The single place an item becomes `failed`. A repository error is
    /// returned so the queue runs this again rather than leaving the item
    /// in `processing`.
    async fn on_failed(&self, payload: &JobPayload, error: &JobError) -> Result<(), JobError> {
        let JobPayload::AnalyzeImage(payload) = payload;
        match self.ctx.items.mark_failed(&payload.item_id, &error.to_string()).await {
            Ok(true) => tracing::warn!(item_id = %payload.item_id, error = %error, "Item marked failed"),
            Ok(false) => tracing::warn!(
                item_id = %payload.item_id,
                "Item was not processing; failure not recorded"
            ),
            Err(e) => {
                tracing::error!(item_id = %payload.item_id, error = %e, "Failed to mark item failed");
                return Err(JobError::Transient(e.to_string()));
            }
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Processed image is not a supported image format")]
    UnsupportedImage,

    #[error("AI client error: {0}")]
    Ai(#[from] AiError),

    #[error("AI output failed validation: {0}")]
    InvalidOutput(String),

    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("Item {0} is missing or no longer accepts analysis results")]
    NotCommittable(String),
}

impl From<AnalysisError> for JobError {
    fn from(err: AnalysisError) -> Self {
        let message = err.to_string();
        match err {
            AnalysisError::Storage(StorageError::Config(_)) => JobError::Permanent(message),
            AnalysisError::Storage(_) => JobError::Transient(message),
            AnalysisError::UnsupportedImage => JobError::Permanent(message),
            AnalysisError::Ai(AiError::Parse(_)) => JobError::InvalidOutput(message),
            AnalysisError::Ai(_) => JobError::Transient(message),
            AnalysisError::InvalidOutput(_) => JobError::InvalidOutput(message),
            AnalysisError::Repository(RepositoryError::Corrupt(_)) => JobError::Permanent(message),
            AnalysisError::Repository(_) => JobError::Transient(message),
            AnalysisError::NotCommittable(_) => JobError::Permanent(message),
        }
    }
}
