use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::job::{JobKind, JobStatusView};

/// GET /api/v1/jobs/{kind}/{job_id}: diagnostic view of one job.
pub async fn get_job_status(
    State(state): State<AppState>,
    Path((kind, job_id)): Path<(String, Uuid)>,
) -> Result<Json<JobStatusView>, StatusCode> {
    let kind: JobKind = kind.parse().map_err(|_| StatusCode::NOT_FOUND)?;

    match state.queue.job_status(kind, job_id).await {
        Ok(Some(view)) => Ok(Json(view)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!(job_id = %job_id, job_kind = %kind, error = %e, "Job status lookup failed");
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}
