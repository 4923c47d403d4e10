use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use crate::app_state::AppState;
use crate::models::job::JobKind;
use crate::routes::metrics::record_queue_depth;
use crate::services::queue::QueueCounts;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub checks: HealthChecks,
    pub queues: Vec<QueueHealth>,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub database: ComponentHealth,
    pub redis: ComponentHealth,
}

#[derive(Serialize)]
pub struct ComponentHealth {
    pub status: String,
    pub latency_ms: Option<u64>,
}

#[derive(Serialize)]
pub struct QueueHealth {
    pub kind: JobKind,
    #[serde(flatten)]
    pub counts: QueueCounts,
}

fn component(result: Result<(), ()>, start: std::time::Instant) -> ComponentHealth {
    match result {
        Ok(()) => ComponentHealth {
            status: "ok".to_string(),
            latency_ms: Some(start.elapsed().as_millis() as u64),
        },
        Err(()) => ComponentHealth {
            status: "error".to_string(),
            latency_ms: None,
        },
    }
}

/// GET /health: comprehensive health check with dependency status.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let start = std::time::Instant::now();
    let db_result = sqlx::query("SELECT 1")
        .execute(&state.db)
        .await
        .map(|_| ())
        .map_err(|e| tracing::warn!(error = %e, "Database health check failed"));
    let db_check = component(db_result, start);

    let redis_start = std::time::Instant::now();
    let redis_result = state
        .queue
        .health_check()
        .await
        .map_err(|e| tracing::warn!(error = %e, "Redis health check failed"));
    let redis_check = component(redis_result, redis_start);

    let mut queues = Vec::new();
    if redis_check.status == "ok" {
        queues = record_queue_depth(&state.queue)
            .await
            .into_iter()
            .map(|(kind, counts)| QueueHealth { kind, counts })
            .collect();
    }

    let all_healthy = db_check.status == "ok" && redis_check.status == "ok";
    let status_code = if all_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = HealthResponse {
        status: if all_healthy {
            "ok".to_string()
        } else {
            "degraded".to_string()
        },
        version: env!("CARGO_PKG_VERSION").to_string(),
        checks: HealthChecks {
            database: db_check,
            redis: redis_check,
        },
        queues,
    };

    (status_code, Json(response))
}
