use serde::Deserialize;
use std::time::Duration;

use crate::services::analysis::DEFAULT_MODEL;
use crate::services::queue::{Backoff, KeepPolicy, QueueOptions, Retention, WorkerOptions};

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Optional for worker processes.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Prometheus scrape address for worker processes
    #[serde(default = "default_worker_metrics_addr")]
    pub worker_metrics_addr: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string for job queue
    pub redis_url: String,

    /// Key namespace for queue data in Redis
    #[serde(default = "default_queue_prefix")]
    pub queue_prefix: String,

    /// Cloudflare account ID
    pub cf_account_id: String,

    /// Cloudflare Workers AI API token
    pub cf_api_token: String,

    /// Workers AI vision model used for extraction
    #[serde(default = "default_ai_model")]
    pub ai_model: String,

    /// R2 bucket name
    pub r2_bucket: String,

    /// R2 access key ID (S3-compatible)
    pub r2_access_key: String,

    /// R2 secret access key (S3-compatible)
    pub r2_secret_key: String,

    /// R2 endpoint URL
    pub r2_endpoint: String,

    // Retry, worker and retention tuning. Every field below has a default.
    #[serde(default = "default_max_attempts")]
    pub job_max_attempts: u32,

    #[serde(default = "default_backoff_base_ms")]
    pub job_backoff_base_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub job_backoff_multiplier: f64,

    #[serde(default = "default_backoff_max_ms")]
    pub job_backoff_max_ms: u64,

    /// Retry AI responses that fail schema validation
    #[serde(default = "default_true")]
    pub job_retry_invalid_output: bool,

    #[serde(default = "default_concurrency")]
    pub worker_concurrency: usize,

    #[serde(default = "default_poll_interval_ms")]
    pub worker_poll_interval_ms: u64,

    #[serde(default = "default_shutdown_timeout_secs")]
    pub worker_shutdown_timeout_secs: u64,

    #[serde(default = "default_stalled_after_secs")]
    pub worker_stalled_after_secs: u64,

    #[serde(default = "default_keep_completed")]
    pub queue_keep_completed: usize,

    #[serde(default = "default_keep_completed_secs")]
    pub queue_keep_completed_secs: u64,

    #[serde(default = "default_keep_failed")]
    pub queue_keep_failed: usize,

    #[serde(default = "default_keep_failed_secs")]
    pub queue_keep_failed_secs: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_worker_metrics_addr() -> String {
    "0.0.0.0:9091".to_string()
}

fn default_queue_prefix() -> String {
    "wardrobe".to_string()
}

fn default_ai_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    2_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_backoff_max_ms() -> u64 {
    60_000
}

fn default_true() -> bool {
    true
}

fn default_concurrency() -> usize {
    5
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}

fn default_stalled_after_secs() -> u64 {
    300
}

fn default_keep_completed() -> usize {
    100
}

fn default_keep_completed_secs() -> u64 {
    24 * 3600
}

fn default_keep_failed() -> usize {
    1000
}

fn default_keep_failed_secs() -> u64 {
    7 * 24 * 3600
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn queue_options(&self) -> QueueOptions {
        QueueOptions {
            max_attempts: self.job_max_attempts.max(1),
            backoff: Backoff {
                base_ms: self.job_backoff_base_ms,
                multiplier: self.job_backoff_multiplier,
                max_ms: self.job_backoff_max_ms,
            },
            retention: Retention {
                completed: KeepPolicy {
                    count: self.queue_keep_completed,
                    age: Duration::from_secs(self.queue_keep_completed_secs),
                },
                failed: KeepPolicy {
                    count: self.queue_keep_failed,
                    age: Duration::from_secs(self.queue_keep_failed_secs),
                },
            },
            retry_invalid_output: self.job_retry_invalid_output,
        }
    }

    pub fn worker_options(&self) -> WorkerOptions {
        let stalled_after = Duration::from_secs(self.worker_stalled_after_secs);
        WorkerOptions {
            concurrency: self.worker_concurrency.max(1),
            poll_interval: Duration::from_millis(self.worker_poll_interval_ms),
            shutdown_timeout: Duration::from_secs(self.worker_shutdown_timeout_secs),
            stalled_after,
            stalled_check_interval: (stalled_after / 10).max(Duration::from_secs(1)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn required() -> Vec<(String, String)> {
        [
            ("DATABASE_URL", "postgres://localhost/wardrobe"),
            ("REDIS_URL", "redis://localhost"),
            ("CF_ACCOUNT_ID", "acct"),
            ("CF_API_TOKEN", "token"),
            ("R2_BUCKET", "bucket"),
            ("R2_ACCESS_KEY", "ak"),
            ("R2_SECRET_KEY", "sk"),
            ("R2_ENDPOINT", "https://r2.example.com"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[test]
    fn test_defaults() {
        let config: AppConfig = envy::from_iter(required()).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:3000");
        assert_eq!(config.queue_prefix, "wardrobe");
        assert_eq!(config.worker_metrics_addr, "0.0.0.0:9091");

        let queue = config.queue_options();
        assert_eq!(queue.max_attempts, 3);
        assert_eq!(queue.backoff, Backoff::default());
        assert_eq!(queue.retention, Retention::default());
        assert!(queue.retry_invalid_output);

        let worker = config.worker_options();
        assert_eq!(worker.concurrency, 5);
        assert_eq!(worker.stalled_check_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_overrides() {
        let mut vars = required();
        vars.push(("JOB_MAX_ATTEMPTS".to_string(), "5".to_string()));
        vars.push(("JOB_RETRY_INVALID_OUTPUT".to_string(), "false".to_string()));
        vars.push(("WORKER_CONCURRENCY".to_string(), "0".to_string()));
        vars.push(("WORKER_METRICS_ADDR".to_string(), "127.0.0.1:9200".to_string()));

        let config: AppConfig = envy::from_iter(vars).unwrap();
        assert_eq!(config.queue_options().max_attempts, 5);
        assert!(!config.queue_options().retry_invalid_output);
        assert_eq!(config.worker_options().concurrency, 1);
        assert_eq!(config.worker_metrics_addr, "127.0.0.1:9200");
    }

    #[test]
    fn test_missing_required_var() {
        let vars = required().into_iter().filter(|(k, _)| k != "REDIS_URL");
        assert!(envy::from_iter::<_, AppConfig>(vars).is_err());
    }
}
