mod helpers;

use std::time::Duration;

use helpers::{analysis_object, fast_queue_options, fast_worker_options, wait_for_terminal, Harness};
use wardrobe_pipeline::models::item::ItemStatus;
use wardrobe_pipeline::models::job::{AnalyzeImagePayload, JobKind, JobState};
use wardrobe_pipeline::services::ai::MockAiClient;
use wardrobe_pipeline::services::analysis::analyze_item;
use wardrobe_pipeline::services::queue::{EnqueueOptions, QueueOptions};
use wardrobe_pipeline::services::registry;
use wardrobe_pipeline::services::submission::submit_analysis;

const WAIT: Duration = Duration::from_secs(5);

fn payload(item_id: &str, key: &str) -> AnalyzeImagePayload {
    AnalyzeImagePayload {
        item_id: item_id.to_string(),
        processed_image_key: key.to_string(),
        owner_id: "user_1".to_string(),
    }
}

#[tokio::test]
async fn test_successful_analysis_marks_item_ready() {
    let harness = Harness::new(MockAiClient::succeeding(analysis_object()));
    harness.seed_item("item_1", "k1", "user_1").await;
    let mut workers = registry::start_workers(&harness.queue, &harness.ctx, &fast_worker_options());

    let job_id = submit_analysis(
        harness.items.as_ref(),
        &harness.queue,
        payload("item_1", "k1"),
        EnqueueOptions::default(),
    )
    .await
    .unwrap();

    let status = wait_for_terminal(&harness.queue, job_id, WAIT).await;
    assert_eq!(status.state, JobState::Completed);
    assert_eq!(status.attempts_made, 1);
    assert_eq!(
        status.return_value,
        Some(serde_json::json!({ "success": true, "itemId": "item_1" }))
    );

    let item = harness.item("item_1").await;
    assert_eq!(item.status, ItemStatus::Ready);
    let metadata = item.metadata.unwrap();
    assert_eq!(metadata.category, "t-shirt");
    assert_eq!(metadata.colors, vec!["navy"]);
    assert_eq!(metadata.confidence, 0.95);

    let waited = tokio::time::timeout(Duration::from_millis(20), registry::any_stopped(&mut workers)).await;
    assert!(waited.is_err(), "pool must keep running");
    registry::close_workers(workers).await.unwrap();
}

#[tokio::test]
async fn test_model_output_is_normalised() {
    let raw = serde_json::json!({
        "category": " T-Shirt ",
        "colors": ["Navy", "white", "navy"],
        "tags": ["Cotton", "cotton "],
        "confidence": 0.6
    });
    let harness = Harness::new(MockAiClient::succeeding(raw));
    harness.seed_item("item_1", "k1", "user_1").await;
    submit_analysis(
        harness.items.as_ref(),
        &harness.queue,
        payload("item_1", "k1"),
        EnqueueOptions::default(),
    )
    .await
    .unwrap();

    let outcome = analyze_item(&harness.ctx, &payload("item_1", "k1")).await.unwrap();
    assert!(outcome.success);

    let metadata = harness.item("item_1").await.metadata.unwrap();
    assert_eq!(metadata.category, "t-shirt");
    assert_eq!(metadata.colors, vec!["navy", "white"]);
    assert_eq!(metadata.tags, vec!["cotton"]);
}

#[tokio::test]
async fn test_exhausted_retries_fail_item_once() {
    let harness = Harness::new(MockAiClient::failing("Mock AI client failure"));
    harness.seed_item("item_1", "k1", "user_1").await;
    let workers = registry::start_workers(&harness.queue, &harness.ctx, &fast_worker_options());

    let job_id = submit_analysis(
        harness.items.as_ref(),
        &harness.queue,
        payload("item_1", "k1"),
        EnqueueOptions::default(),
    )
    .await
    .unwrap();

    let status = wait_for_terminal(&harness.queue, job_id, WAIT).await;
    registry::close_workers(workers).await.unwrap();

    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.attempts_made, 3);
    assert!(status
        .failed_reason
        .as_deref()
        .unwrap()
        .contains("Mock AI client failure"));
    assert_eq!(harness.ai.calls(), 3);
    assert_eq!(harness.items.mark_failed_calls(), 1);

    let item = harness.item("item_1").await;
    assert_eq!(item.status, ItemStatus::Failed);
    assert!(item.metadata.is_none());
    assert!(item.failure_reason.unwrap().contains("Mock AI client failure"));
}

#[tokio::test]
async fn test_transient_failures_recover_within_budget() {
    let harness = Harness::new(MockAiClient::failing_then(2, "provider 503", analysis_object()));
    harness.seed_item("item_1", "k1", "user_1").await;
    let workers = registry::start_workers(&harness.queue, &harness.ctx, &fast_worker_options());

    let job_id = submit_analysis(
        harness.items.as_ref(),
        &harness.queue,
        payload("item_1", "k1"),
        EnqueueOptions::default(),
    )
    .await
    .unwrap();

    let status = wait_for_terminal(&harness.queue, job_id, WAIT).await;
    registry::close_workers(workers).await.unwrap();

    assert_eq!(status.state, JobState::Completed);
    assert_eq!(status.attempts_made, 3);
    assert_eq!(harness.items.mark_failed_calls(), 0);
    assert_eq!(harness.item("item_1").await.status, ItemStatus::Ready);
}

#[tokio::test]
async fn test_job_status_while_waiting() {
    let harness = Harness::new(MockAiClient::succeeding(analysis_object()));
    harness.seed_item("item_1", "k1", "user_1").await;

    let job_id = submit_analysis(
        harness.items.as_ref(),
        &harness.queue,
        payload("item_1", "k1"),
        EnqueueOptions::default(),
    )
    .await
    .unwrap();

    let status = harness
        .queue
        .job_status(JobKind::AnalyzeImage, job_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status.state, JobState::Waiting);
    assert_eq!(status.attempts_made, 0);
    assert!(status.return_value.is_none());
}

#[tokio::test]
async fn test_concurrent_jobs_all_finish() {
    let harness = Harness::new(MockAiClient::succeeding(analysis_object()));
    let options = fast_worker_options().with_concurrency(5);
    let workers = registry::start_workers(&harness.queue, &harness.ctx, &options);

    let mut job_ids = Vec::new();
    for n in 0..20 {
        let item_id = format!("item_{n}");
        let key = format!("processed/{n}.png");
        harness.seed_item(&item_id, &key, "user_1").await;
        let job_id = submit_analysis(
            harness.items.as_ref(),
            &harness.queue,
            payload(&item_id, &key),
            EnqueueOptions::default(),
        )
        .await
        .unwrap();
        job_ids.push(job_id);
    }

    for job_id in job_ids {
        let status = wait_for_terminal(&harness.queue, job_id, WAIT).await;
        assert_eq!(status.state, JobState::Completed);
    }
    registry::close_workers(workers).await.unwrap();

    for n in 0..20 {
        assert_eq!(harness.item(&format!("item_{n}")).await.status, ItemStatus::Ready);
    }
    let counts = harness.queue.counts(JobKind::AnalyzeImage).await.unwrap();
    assert_eq!(counts.completed, 20);
    assert_eq!(counts.active, 0);
    assert_eq!(counts.waiting, 0);
}

#[tokio::test]
async fn test_replayed_analysis_is_idempotent() {
    let harness = Harness::new(MockAiClient::succeeding(analysis_object()));
    harness.seed_item("item_1", "k1", "user_1").await;
    submit_analysis(
        harness.items.as_ref(),
        &harness.queue,
        payload("item_1", "k1"),
        EnqueueOptions::default(),
    )
    .await
    .unwrap();

    analyze_item(&harness.ctx, &payload("item_1", "k1")).await.unwrap();
    let first = harness.item("item_1").await;
    analyze_item(&harness.ctx, &payload("item_1", "k1")).await.unwrap();
    let second = harness.item("item_1").await;

    assert_eq!(second.status, ItemStatus::Ready);
    assert_eq!(first.metadata, second.metadata);
}

#[tokio::test]
async fn test_invalid_output_fails_fast_when_not_retried() {
    let options = QueueOptions {
        retry_invalid_output: false,
        ..fast_queue_options()
    };
    let invalid = serde_json::json!({ "category": "coat", "colors": [], "confidence": 3.0 });
    let harness = Harness::with_options(MockAiClient::succeeding(invalid), options);
    harness.seed_item("item_1", "k1", "user_1").await;
    let workers = registry::start_workers(&harness.queue, &harness.ctx, &fast_worker_options());

    let job_id = submit_analysis(
        harness.items.as_ref(),
        &harness.queue,
        payload("item_1", "k1"),
        EnqueueOptions::default(),
    )
    .await
    .unwrap();

    let status = wait_for_terminal(&harness.queue, job_id, WAIT).await;
    registry::close_workers(workers).await.unwrap();

    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.attempts_made, 1);
    assert_eq!(harness.ai.calls(), 1);
    assert_eq!(harness.item("item_1").await.status, ItemStatus::Failed);
}

#[tokio::test]
async fn test_unrecognised_image_fails_without_calling_ai() {
    let harness = Harness::new(MockAiClient::succeeding(analysis_object()));
    harness
        .seed_item_with_bytes("item_1", "k1", "user_1", b"definitely not an image")
        .await;
    let workers = registry::start_workers(&harness.queue, &harness.ctx, &fast_worker_options());

    let job_id = submit_analysis(
        harness.items.as_ref(),
        &harness.queue,
        payload("item_1", "k1"),
        EnqueueOptions::default(),
    )
    .await
    .unwrap();

    let status = wait_for_terminal(&harness.queue, job_id, WAIT).await;
    registry::close_workers(workers).await.unwrap();

    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.attempts_made, 1);
    assert_eq!(harness.ai.calls(), 0);
    assert_eq!(harness.items.mark_failed_calls(), 1);
}

#[tokio::test]
async fn test_missing_processed_image_is_retried_then_failed() {
    let harness = Harness::new(MockAiClient::succeeding(analysis_object()));
    harness.seed_item("item_1", "k1", "user_1").await;
    let workers = registry::start_workers(&harness.queue, &harness.ctx, &fast_worker_options());

    let job_id = submit_analysis(
        harness.items.as_ref(),
        &harness.queue,
        payload("item_1", "missing-key"),
        EnqueueOptions::default(),
    )
    .await
    .unwrap();

    let status = wait_for_terminal(&harness.queue, job_id, WAIT).await;
    registry::close_workers(workers).await.unwrap();

    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.attempts_made, 3);
    assert_eq!(harness.item("item_1").await.status, ItemStatus::Failed);
}

#[tokio::test]
async fn test_blank_model_output_never_marks_item_ready() {
    let blank = serde_json::json!({ "category": "   ", "colors": ["  "], "confidence": 0.9 });
    let harness = Harness::new(MockAiClient::succeeding(blank));
    harness.seed_item("item_1", "k1", "user_1").await;
    let workers = registry::start_workers(&harness.queue, &harness.ctx, &fast_worker_options());

    let job_id = submit_analysis(
        harness.items.as_ref(),
        &harness.queue,
        payload("item_1", "k1"),
        EnqueueOptions::default(),
    )
    .await
    .unwrap();

    let status = wait_for_terminal(&harness.queue, job_id, WAIT).await;
    registry::close_workers(workers).await.unwrap();

    assert_eq!(status.state, JobState::Failed);
    assert!(status.failed_reason.unwrap().contains("after normalising"));
    let item = harness.item("item_1").await;
    assert_eq!(item.status, ItemStatus::Failed);
    assert!(item.metadata.is_none());
}

#[tokio::test]
async fn test_invalid_output_is_retried_by_default() {
    let invalid = serde_json::json!({ "category": "coat", "colors": ["black"], "confidence": 3.0 });
    let harness = Harness::new(MockAiClient::succeeding(invalid));
    assert!(harness.queue.options().retry_invalid_output);
    harness.seed_item("item_1", "k1", "user_1").await;
    let workers = registry::start_workers(&harness.queue, &harness.ctx, &fast_worker_options());

    let job_id = submit_analysis(
        harness.items.as_ref(),
        &harness.queue,
        payload("item_1", "k1"),
        EnqueueOptions::default(),
    )
    .await
    .unwrap();

    let status = wait_for_terminal(&harness.queue, job_id, WAIT).await;
    registry::close_workers(workers).await.unwrap();

    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.attempts_made, 3);
    assert!(status.failed_reason.unwrap().starts_with("Invalid output"));
    assert_eq!(harness.ai.calls(), 3);
    assert_eq!(harness.items.mark_failed_calls(), 1);
    assert_eq!(harness.item("item_1").await.status, ItemStatus::Failed);
}

#[tokio::test]
async fn test_failure_write_outage_still_fails_item() {
    let harness = Harness::new(MockAiClient::succeeding(analysis_object()));
    harness
        .seed_item_with_bytes("item_1", "k1", "user_1", b"definitely not an image")
        .await;
    harness.items.fail_next_mark_failed(2);
    let workers = registry::start_workers(&harness.queue, &harness.ctx, &fast_worker_options());

    let job_id = submit_analysis(
        harness.items.as_ref(),
        &harness.queue,
        payload("item_1", "k1"),
        EnqueueOptions::default(),
    )
    .await
    .unwrap();

    let status = wait_for_terminal(&harness.queue, job_id, WAIT).await;
    let item = harness.item("item_1").await;
    registry::close_workers(workers).await.unwrap();

    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.attempts_made, 1);
    assert_eq!(item.status, ItemStatus::Failed);
    assert_eq!(harness.items.mark_failed_calls(), 3);
    assert_eq!(harness.ai.calls(), 0);
}
