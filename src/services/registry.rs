use std::sync::Arc;

use crate::models::job::JobKind;
use crate::services::analysis::{AnalysisContext, AnalysisHandler};
use crate::services::queue::{JobHandler, JobQueue, QueueError, WorkerHandle, WorkerOptions};

/// Handler responsible for `kind`. Adding a job kind fails to compile until
/// it is wired here.
pub fn handler_for(kind: JobKind, ctx: &AnalysisContext) -> Arc<dyn JobHandler> {
    match kind {
        JobKind::AnalyzeImage => Arc::new(AnalysisHandler::new(ctx.clone())),
    }
}

/// Start one worker pool per job kind.
pub fn start_workers(
    queue: &Arc<JobQueue>,
    ctx: &AnalysisContext,
    options: &WorkerOptions,
) -> Vec<WorkerHandle> {
    use strum::IntoEnumIterator;

    JobKind::iter()
        .map(|kind| queue.create_worker(kind, handler_for(kind, ctx), options.clone()))
        .collect()
}

/// Resolves when any pool stops on its own.
pub async fn any_stopped(handles: &mut [WorkerHandle]) -> Result<(), QueueError> {
    if handles.is_empty() {
        return std::future::pending().await;
    }
    let stopped = handles.iter_mut().map(|handle| Box::pin(handle.stopped()));
    futures::future::select_all(stopped).await.0
}

/// Close every pool, returning the first error.
pub async fn close_workers(handles: Vec<WorkerHandle>) -> Result<(), QueueError> {
    let mut first_error = None;
    for handle in handles {
        if let Err(e) = handle.close().await {
            first_error.get_or_insert(e);
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
