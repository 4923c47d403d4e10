use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio::sync::OnceCell;
use uuid::Uuid;

use super::{JobStore, KeepPolicy, QueueCounts, QueueError};
use crate::models::job::{JobKind, JobRecord, JobState};

/// Promotes due delayed jobs, pops the best waiting job and marks it active
/// under a fresh lease in one step, so a job is handed to exactly one
/// consumer.
///
/// KEYS: delayed, waiting, active, scores, leases. ARGV: now in ms, lease.
const CLAIM_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 100)
for _, id in ipairs(due) do
  redis.call('ZREM', KEYS[1], id)
  local score = redis.call('HGET', KEYS[4], id)
  if score then
    redis.call('ZADD', KEYS[2], score, id)
  end
end
local popped = redis.call('ZPOPMIN', KEYS[2], 1)
if #popped == 0 then
  return false
end
redis.call('ZADD', KEYS[3], ARGV[1], popped[1])
redis.call('HSET', KEYS[5], popped[1], ARGV[2])
return popped[1]
"#;

/// Writes the record and moves it to waiting or delayed. A non-empty lease
/// must match the current claim, or nothing changes.
///
/// KEYS: jobs, scores, waiting, delayed, active, leases.
/// ARGV: id, record JSON, wait score, "1" if delayed, ready_at in ms, lease.
const SCHEDULE_SCRIPT: &str = r#"
if ARGV[6] ~= '' and redis.call('HGET', KEYS[6], ARGV[1]) ~= ARGV[6] then
  return 0
end
redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
redis.call('HSET', KEYS[2], ARGV[1], ARGV[3])
redis.call('ZREM', KEYS[5], ARGV[1])
redis.call('HDEL', KEYS[6], ARGV[1])
if ARGV[4] == '1' then
  redis.call('ZREM', KEYS[3], ARGV[1])
  redis.call('ZADD', KEYS[4], ARGV[5], ARGV[1])
else
  redis.call('ZREM', KEYS[4], ARGV[1])
  redis.call('ZADD', KEYS[3], ARGV[3], ARGV[1])
end
return 1
"#;

/// Writes a finished record into the completed or failed set, only while
/// the lease still holds the job.
///
/// KEYS: jobs, scores, waiting, delayed, active, leases, finished set.
/// ARGV: id, record JSON, finished_at in ms, lease.
const FINISH_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[6], ARGV[1]) ~= ARGV[4] then
  return 0
end
redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
redis.call('HDEL', KEYS[2], ARGV[1])
redis.call('ZREM', KEYS[3], ARGV[1])
redis.call('ZREM', KEYS[4], ARGV[1])
redis.call('ZREM', KEYS[5], ARGV[1])
redis.call('HDEL', KEYS[6], ARGV[1])
redis.call('ZADD', KEYS[7], ARGV[3], ARGV[1])
return 1
"#;

/// Heartbeat. KEYS: active, leases. ARGV: id, lease, now in ms.
const RENEW_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[2], ARGV[1]) ~= ARGV[2] then
  return 0
end
redis.call('ZADD', KEYS[1], 'XX', ARGV[3], ARGV[1])
return 1
"#;

/// Redis-backed job store.
///
/// Layout per kind, under `{prefix}:{kind}:`:
/// `jobs` (hash id -> record JSON), `scores` (hash id -> wait score),
/// `leases` (hash id -> current claim token),
/// `waiting` / `delayed` / `active` / `completed` / `failed` (sorted sets,
/// `active` scored by last heartbeat) and `seq` (counter).
pub struct RedisJobStore {
    client: redis::Client,
    prefix: String,
    conn: OnceCell<MultiplexedConnection>,
    claim_script: redis::Script,
    schedule_script: redis::Script,
    finish_script: redis::Script,
    renew_script: redis::Script,
}

struct Keys {
    jobs: String,
    scores: String,
    leases: String,
    waiting: String,
    delayed: String,
    active: String,
    completed: String,
    failed: String,
    seq: String,
}

impl RedisJobStore {
    pub fn new(redis_url: &str, prefix: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::Redis)?;
        Ok(Self {
            client,
            prefix: prefix.to_string(),
            conn: OnceCell::new(),
            claim_script: redis::Script::new(CLAIM_SCRIPT),
            schedule_script: redis::Script::new(SCHEDULE_SCRIPT),
            finish_script: redis::Script::new(FINISH_SCRIPT),
            renew_script: redis::Script::new(RENEW_SCRIPT),
        })
    }

    async fn conn(&self) -> Result<MultiplexedConnection, QueueError> {
        let conn = self
            .conn
            .get_or_try_init(|| self.client.get_multiplexed_async_connection())
            .await
            .map_err(QueueError::Redis)?;
        Ok(conn.clone())
    }

    fn keys(&self, kind: JobKind) -> Keys {
        let base = format!("{}:{}", self.prefix, kind);
        Keys {
            jobs: format!("{base}:jobs"),
            scores: format!("{base}:scores"),
            leases: format!("{base}:leases"),
            waiting: format!("{base}:waiting"),
            delayed: format!("{base}:delayed"),
            active: format!("{base}:active"),
            completed: format!("{base}:completed"),
            failed: format!("{base}:failed"),
            seq: format!("{base}:seq"),
        }
    }

    /// Remove finished ids beyond the count cap or older than the age cap,
    /// along with their records.
    async fn trim(
        &self,
        conn: &mut MultiplexedConnection,
        keys: &Keys,
        set: &str,
        keep: KeepPolicy,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        let cutoff = now.timestamp_millis() - keep.age.as_millis() as i64;
        let mut expired: Vec<String> = conn
            .zrangebyscore(set, "-inf", format!("({cutoff}"))
            .await
            .map_err(QueueError::Redis)?;

        // Oldest entries past the newest `count`.
        let overflow_end = -(keep.count as isize) - 1;
        let overflow: Vec<String> = conn
            .zrange(set, 0, overflow_end)
            .await
            .map_err(QueueError::Redis)?;
        expired.extend(overflow);
        expired.sort();
        expired.dedup();

        if expired.is_empty() {
            return Ok(());
        }

        redis::pipe()
            .atomic()
            .zrem(set, &expired)
            .ignore()
            .hdel(&keys.jobs, &expired)
            .ignore()
            .query_async::<()>(conn)
            .await
            .map_err(QueueError::Redis)?;

        tracing::debug!(set, trimmed = expired.len(), "Trimmed finished jobs");
        Ok(())
    }
}

fn decode(payload: &str) -> Result<JobRecord, QueueError> {
    serde_json::from_str(payload).map_err(QueueError::Serialize)
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn next_seq(&self, kind: JobKind) -> Result<u64, QueueError> {
        let mut conn = self.conn().await?;
        let seq: u64 = conn.incr(self.keys(kind).seq, 1).await.map_err(QueueError::Redis)?;
        Ok(seq)
    }

    async fn schedule(&self, record: &JobRecord, lease: Option<Uuid>) -> Result<bool, QueueError> {
        let mut conn = self.conn().await?;
        let keys = self.keys(record.kind);
        let payload = serde_json::to_string(record).map_err(QueueError::Serialize)?;
        let delayed = if record.state == JobState::Delayed { "1" } else { "0" };

        let written: i64 = self
            .schedule_script
            .key(&keys.jobs)
            .key(&keys.scores)
            .key(&keys.waiting)
            .key(&keys.delayed)
            .key(&keys.active)
            .key(&keys.leases)
            .arg(record.id.to_string())
            .arg(payload)
            .arg(record.wait_score().to_string())
            .arg(delayed)
            .arg(record.ready_at.timestamp_millis())
            .arg(lease.map(|l| l.to_string()).unwrap_or_default())
            .invoke_async(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(written == 1)
    }

    async fn claim(&self, kind: JobKind, now: DateTime<Utc>) -> Result<Option<JobRecord>, QueueError> {
        let mut conn = self.conn().await?;
        let keys = self.keys(kind);
        let lease = Uuid::new_v4();

        let claimed: Option<String> = self
            .claim_script
            .key(&keys.delayed)
            .key(&keys.waiting)
            .key(&keys.active)
            .key(&keys.scores)
            .key(&keys.leases)
            .arg(now.timestamp_millis())
            .arg(lease.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(QueueError::Redis)?;

        let Some(id) = claimed else {
            return Ok(None);
        };

        let payload: Option<String> = conn.hget(&keys.jobs, &id).await.map_err(QueueError::Redis)?;
        let Some(payload) = payload else {
            // Record trimmed underneath us; drop the dangling index entries.
            tracing::warn!(job_id = %id, job_kind = %kind, "Claimed job has no record");
            redis::pipe()
                .atomic()
                .zrem(&keys.active, &id)
                .ignore()
                .hdel(&keys.leases, &id)
                .ignore()
                .query_async::<()>(&mut conn)
                .await
                .map_err(QueueError::Redis)?;
            return Ok(None);
        };

        let mut record = decode(&payload)?;
        record.state = JobState::Active;
        record.processed_at = Some(now);
        record.lease = Some(lease);
        let payload = serde_json::to_string(&record).map_err(QueueError::Serialize)?;
        conn.hset::<_, _, _, ()>(&keys.jobs, &id, payload)
            .await
            .map_err(QueueError::Redis)?;

        Ok(Some(record))
    }

    async fn renew(&self, kind: JobKind, id: Uuid, lease: Uuid, now: DateTime<Utc>) -> Result<bool, QueueError> {
        let mut conn = self.conn().await?;
        let keys = self.keys(kind);
        let held: i64 = self
            .renew_script
            .key(&keys.active)
            .key(&keys.leases)
            .arg(id.to_string())
            .arg(lease.to_string())
            .arg(now.timestamp_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(held == 1)
    }

    async fn finish(&self, record: &JobRecord, lease: Uuid, keep: KeepPolicy) -> Result<bool, QueueError> {
        let mut conn = self.conn().await?;
        let keys = self.keys(record.kind);
        let payload = serde_json::to_string(record).map_err(QueueError::Serialize)?;
        let finished_at = record.finished_at.unwrap_or_else(Utc::now);
        let set = if record.state == JobState::Completed {
            &keys.completed
        } else {
            &keys.failed
        };

        let written: i64 = self
            .finish_script
            .key(&keys.jobs)
            .key(&keys.scores)
            .key(&keys.waiting)
            .key(&keys.delayed)
            .key(&keys.active)
            .key(&keys.leases)
            .key(set)
            .arg(record.id.to_string())
            .arg(payload)
            .arg(finished_at.timestamp_millis())
            .arg(lease.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        if written != 1 {
            return Ok(false);
        }

        self.trim(&mut conn, &keys, set, keep, finished_at).await?;
        Ok(true)
    }

    async fn load(&self, kind: JobKind, id: Uuid) -> Result<Option<JobRecord>, QueueError> {
        let mut conn = self.conn().await?;
        let payload: Option<String> = conn
            .hget(self.keys(kind).jobs, id.to_string())
            .await
            .map_err(QueueError::Redis)?;
        payload.as_deref().map(decode).transpose()
    }

    async fn stalled(&self, kind: JobKind, heartbeat_before: DateTime<Utc>) -> Result<Vec<JobRecord>, QueueError> {
        let mut conn = self.conn().await?;
        let keys = self.keys(kind);
        let ids: Vec<String> = conn
            .zrangebyscore(&keys.active, "-inf", heartbeat_before.timestamp_millis())
            .await
            .map_err(QueueError::Redis)?;

        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            let (payload, lease): (Option<String>, Option<String>) = redis::pipe()
                .hget(&keys.jobs, &id)
                .hget(&keys.leases, &id)
                .query_async(&mut conn)
                .await
                .map_err(QueueError::Redis)?;
            let (Some(payload), Some(lease)) = (payload, lease) else {
                continue;
            };
            let mut record = decode(&payload)?;
            record.lease = Uuid::parse_str(&lease).ok();
            records.push(record);
        }
        Ok(records)
    }

    async fn counts(&self, kind: JobKind) -> Result<QueueCounts, QueueError> {
        let mut conn = self.conn().await?;
        let keys = self.keys(kind);
        let (waiting, delayed, active, completed, failed): (u64, u64, u64, u64, u64) = redis::pipe()
            .zcard(&keys.waiting)
            .zcard(&keys.delayed)
            .zcard(&keys.active)
            .zcard(&keys.completed)
            .zcard(&keys.failed)
            .query_async(&mut conn)
            .await
            .map_err(QueueError::Redis)?;

        Ok(QueueCounts {
            waiting,
            delayed,
            active,
            completed,
            failed,
        })
    }

    async fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }
}

