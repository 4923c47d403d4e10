use axum::extract::State;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use strum::IntoEnumIterator;

use crate::models::job::JobKind;
use crate::services::queue::{JobQueue, QueueCounts};

/// State for the scrape endpoint, kept apart from [`crate::app_state::AppState`]
/// so scrapes never touch the database pool.
#[derive(Clone)]
pub struct MetricsState {
    pub handle: Arc<PrometheusHandle>,
    pub queue: Arc<JobQueue>,
}

/// Sample per-kind counts and publish `queue_depth` (waiting + delayed).
/// Kinds whose counts cannot be read are left out.
pub async fn record_queue_depth(queue: &JobQueue) -> Vec<(JobKind, QueueCounts)> {
    let mut sampled = Vec::new();
    for kind in JobKind::iter() {
        match queue.counts(kind).await {
            Ok(counts) => {
                metrics::gauge!("queue_depth", "kind" => kind.to_string())
                    .set((counts.waiting + counts.delayed) as f64);
                sampled.push((kind, counts));
            }
            Err(e) => tracing::warn!(job_kind = %kind, error = %e, "Failed to read queue counts"),
        }
    }
    sampled
}

/// GET /metrics: Prometheus text exposition, with queue depth sampled at
/// scrape time.
pub async fn prometheus_metrics(State(state): State<MetricsState>) -> impl IntoResponse {
    record_queue_depth(&state.queue).await;
    state.handle.render()
}
