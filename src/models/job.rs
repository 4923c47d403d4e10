use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};
use uuid::Uuid;

use crate::services::queue::backoff::Backoff;
use crate::services::queue::JobError;

/// Job kinds known to the queue. Each kind maps to exactly one payload
/// variant and one handler, so adding a kind is a compile-checked change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, EnumIter, Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum JobKind {
    AnalyzeImage,
}

/// Payload of an image analysis job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeImagePayload {
    #[garde(length(min = 1, max = 128))]
    pub item_id: String,

    #[garde(length(min = 1, max = 1024))]
    pub processed_image_key: String,

    #[garde(length(min = 1, max = 128))]
    pub owner_id: String,
}

/// Typed job payload, tagged by kind on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "kebab-case")]
pub enum JobPayload {
    AnalyzeImage(AnalyzeImagePayload),
}

impl JobPayload {
    pub fn kind(&self) -> JobKind {
        match self {
            JobPayload::AnalyzeImage(_) => JobKind::AnalyzeImage,
        }
    }

    /// Decode an untyped payload for `kind` and check it against that
    /// kind's schema.
    pub fn from_json(kind: JobKind, data: serde_json::Value) -> Result<Self, PayloadError> {
        let payload = match kind {
            JobKind::AnalyzeImage => JobPayload::AnalyzeImage(serde_json::from_value(data)?),
        };
        payload.validate()?;
        Ok(payload)
    }

    pub fn validate(&self) -> Result<(), PayloadError> {
        match self {
            JobPayload::AnalyzeImage(p) => p.validate()?,
        }
        Ok(())
    }

    /// Item the job operates on, used for log correlation.
    pub fn item_id(&self) -> &str {
        match self {
            JobPayload::AnalyzeImage(p) => &p.item_id,
        }
    }
}

/// Where a job sits in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

/// Queue-owned bookkeeping for one job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobRecord {
    pub id: Uuid,
    pub kind: JobKind,
    pub payload: JobPayload,
    pub state: JobState,
    /// Lower runs first.
    pub priority: u32,
    /// Enqueue order within a priority.
    pub seq: u64,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub created_at: DateTime<Utc>,
    /// Earliest time the job may be claimed.
    pub ready_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub return_value: Option<serde_json::Value>,
    pub failed_reason: Option<String>,
    /// Token of the current claim. Outcomes reported under any other
    /// token are discarded.
    #[serde(default)]
    pub lease: Option<Uuid>,
    /// Terminal error whose failure hook has not yet succeeded. A job
    /// carrying one skips processing and only re-runs the hook.
    #[serde(default)]
    pub pending_failure: Option<JobError>,
}

impl JobRecord {
    /// Ordering key inside the waiting set: priority first, then FIFO.
    /// Priorities are capped below 2^21 so the key fits an f64 score exactly.
    pub fn wait_score(&self) -> u64 {
        ((self.priority as u64) << 32) | (self.seq & 0xFFFF_FFFF)
    }

    pub fn status_view(&self) -> JobStatusView {
        JobStatusView {
            id: self.id,
            state: self.state,
            attempts_made: self.attempts_made,
            data: self.payload.clone(),
            return_value: self.return_value.clone(),
            failed_reason: self.failed_reason.clone(),
        }
    }
}

/// Diagnostic view returned by job status queries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusView {
    pub id: Uuid,
    pub state: JobState,
    pub attempts_made: u32,
    pub data: JobPayload,
    pub return_value: Option<serde_json::Value>,
    pub failed_reason: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("Payload does not match the job schema: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Payload failed validation: {0}")]
    Invalid(#[from] garde::Report),
}
