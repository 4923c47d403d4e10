use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Processing status of a clothing item.
///
/// `Ready` and `Failed` are terminal. Every change goes through
/// [`ItemStatus::apply`], which both repositories share.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Processing,
    Ready,
    Failed,
}

/// Events that move an item through its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum StatusEvent {
    /// An analysis job was accepted for the item.
    Enqueued,
    /// The queue refused the job after the item was claimed.
    EnqueueRejected,
    /// The orchestrator committed metadata. Also accepted on `Ready` so
    /// redelivered jobs overwrite the same fields.
    AnalysisSucceeded,
    /// The queue exhausted every attempt for the item's job.
    RetriesExhausted,
}

impl StatusEvent {
    /// Statuses from which this event is accepted.
    pub fn allowed_from(self) -> &'static [ItemStatus] {
        match self {
            StatusEvent::Enqueued => &[ItemStatus::Pending],
            StatusEvent::EnqueueRejected => &[ItemStatus::Processing],
            StatusEvent::AnalysisSucceeded => &[ItemStatus::Processing, ItemStatus::Ready],
            StatusEvent::RetriesExhausted => &[ItemStatus::Processing],
        }
    }

    /// Status the item holds after this event.
    pub fn target(self) -> ItemStatus {
        match self {
            StatusEvent::Enqueued => ItemStatus::Processing,
            StatusEvent::EnqueueRejected => ItemStatus::Pending,
            StatusEvent::AnalysisSucceeded => ItemStatus::Ready,
            StatusEvent::RetriesExhausted => ItemStatus::Failed,
        }
    }
}

impl ItemStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ItemStatus::Ready | ItemStatus::Failed)
    }

    /// Apply `event`, returning the next status or the rejected transition.
    pub fn apply(self, event: StatusEvent) -> Result<ItemStatus, TransitionError> {
        if event.allowed_from().contains(&self) {
            Ok(event.target())
        } else {
            Err(TransitionError { from: self, event })
        }
    }
}

/// AI-extracted fashion metadata persisted on a ready item. Checked after
/// normalisation, since trimming can empty out values the raw output had.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Validate)]
pub struct ClothingMetadata {
    #[garde(length(min = 1, max = 64))]
    pub category: String,

    #[garde(length(min = 1, max = 16), inner(length(min = 1, max = 32)))]
    pub colors: Vec<String>,

    #[garde(length(max = 32), inner(length(min = 1, max = 48)))]
    pub tags: Vec<String>,

    #[garde(range(min = 0.0, max = 1.0))]
    pub confidence: f64,
}

/// A clothing item uploaded by a user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClothingItem {
    pub id: String,
    pub owner_id: String,
    pub image_key: String,
    pub processed_image_key: Option<String>,
    pub status: ItemStatus,
    pub metadata: Option<ClothingMetadata>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ClothingItem {
    /// A freshly uploaded item awaiting analysis.
    pub fn new(id: impl Into<String>, owner_id: impl Into<String>, image_key: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            owner_id: owner_id.into(),
            image_key: image_key.into(),
            processed_image_key: None,
            status: ItemStatus::Pending,
            metadata: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("Illegal status transition: {event} is not accepted from {from}")]
pub struct TransitionError {
    pub from: ItemStatus,
    pub event: StatusEvent,
}
