use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap, VecDeque};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{JobStore, KeepPolicy, QueueCounts, QueueError};
use crate::models::job::{JobKind, JobRecord, JobState};

/// Per-kind indexes, mirroring the Redis layout.
#[derive(Default)]
struct KindState {
    seq: u64,
    jobs: HashMap<Uuid, JobRecord>,
    /// (wait score, id)
    waiting: BTreeSet<(u64, Uuid)>,
    /// (ready_at, id)
    delayed: BTreeSet<(DateTime<Utc>, Uuid)>,
    /// id -> (last heartbeat, lease)
    active: HashMap<Uuid, (DateTime<Utc>, Uuid)>,
    completed: VecDeque<(DateTime<Utc>, Uuid)>,
    failed: VecDeque<(DateTime<Utc>, Uuid)>,
}

impl KindState {
    fn unindex(&mut self, record: &JobRecord) {
        self.waiting.retain(|(_, id)| *id != record.id);
        self.delayed.retain(|(_, id)| *id != record.id);
        self.active.remove(&record.id);
    }

    fn holds(&self, id: Uuid, lease: Uuid) -> bool {
        self.active.get(&id).is_some_and(|(_, held)| *held == lease)
    }

    fn promote_due(&mut self, now: DateTime<Utc>) {
        let due: Vec<(DateTime<Utc>, Uuid)> = self
            .delayed
            .iter()
            .take_while(|(ready_at, _)| *ready_at <= now)
            .copied()
            .collect();

        for entry in due {
            self.delayed.remove(&entry);
            if let Some(record) = self.jobs.get_mut(&entry.1) {
                record.state = JobState::Waiting;
                self.waiting.insert((record.wait_score(), record.id));
            }
        }
    }
}

/// In-process job store for tests and single-process development.
/// Not durable across restarts.
#[derive(Default)]
pub struct MemoryJobStore {
    kinds: Mutex<HashMap<JobKind, KindState>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Drop finished entries beyond `keep`, oldest first.
fn trim(
    finished: &mut VecDeque<(DateTime<Utc>, Uuid)>,
    jobs: &mut HashMap<Uuid, JobRecord>,
    keep: KeepPolicy,
    now: DateTime<Utc>,
) {
    let max_age = chrono::Duration::from_std(keep.age).unwrap_or_else(|_| chrono::Duration::days(36_500));
    while let Some(&(finished_at, id)) = finished.front() {
        let too_many = finished.len() > keep.count;
        let too_old = now.signed_duration_since(finished_at) > max_age;
        if !(too_many || too_old) {
            break;
        }
        finished.pop_front();
        jobs.remove(&id);
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn next_seq(&self, kind: JobKind) -> Result<u64, QueueError> {
        let mut kinds = self.kinds.lock().await;
        let state = kinds.entry(kind).or_default();
        state.seq += 1;
        Ok(state.seq)
    }

    async fn schedule(&self, record: &JobRecord, lease: Option<Uuid>) -> Result<bool, QueueError> {
        let mut kinds = self.kinds.lock().await;
        let state = kinds.entry(record.kind).or_default();
        if let Some(lease) = lease {
            if !state.holds(record.id, lease) {
                return Ok(false);
            }
        }
        state.unindex(record);
        match record.state {
            JobState::Delayed => {
                state.delayed.insert((record.ready_at, record.id));
            }
            _ => {
                state.waiting.insert((record.wait_score(), record.id));
            }
        }
        state.jobs.insert(record.id, record.clone());
        Ok(true)
    }

    async fn claim(&self, kind: JobKind, now: DateTime<Utc>) -> Result<Option<JobRecord>, QueueError> {
        let mut kinds = self.kinds.lock().await;
        let state = kinds.entry(kind).or_default();
        state.promote_due(now);

        while let Some(entry) = state.waiting.pop_first() {
            let Some(record) = state.jobs.get_mut(&entry.1) else {
                continue;
            };
            let lease = Uuid::new_v4();
            record.state = JobState::Active;
            record.processed_at = Some(now);
            record.lease = Some(lease);
            state.active.insert(record.id, (now, lease));
            return Ok(Some(record.clone()));
        }
        Ok(None)
    }

    async fn renew(&self, kind: JobKind, id: Uuid, lease: Uuid, now: DateTime<Utc>) -> Result<bool, QueueError> {
        let mut kinds = self.kinds.lock().await;
        let Some(state) = kinds.get_mut(&kind) else {
            return Ok(false);
        };
        match state.active.get_mut(&id) {
            Some((heartbeat, held)) if *held == lease => {
                *heartbeat = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn finish(&self, record: &JobRecord, lease: Uuid, keep: KeepPolicy) -> Result<bool, QueueError> {
        let mut kinds = self.kinds.lock().await;
        let state = kinds.entry(record.kind).or_default();
        if !state.holds(record.id, lease) {
            return Ok(false);
        }
        state.unindex(record);

        let finished_at = record.finished_at.unwrap_or_else(Utc::now);
        state.jobs.insert(record.id, record.clone());

        let KindState {
            jobs,
            completed,
            failed,
            ..
        } = state;
        let finished = if record.state == JobState::Completed {
            completed
        } else {
            failed
        };
        finished.retain(|(_, id)| *id != record.id);
        finished.push_back((finished_at, record.id));
        trim(finished, jobs, keep, finished_at);
        Ok(true)
    }

    async fn load(&self, kind: JobKind, id: Uuid) -> Result<Option<JobRecord>, QueueError> {
        let kinds = self.kinds.lock().await;
        Ok(kinds.get(&kind).and_then(|s| s.jobs.get(&id)).cloned())
    }

    async fn stalled(&self, kind: JobKind, heartbeat_before: DateTime<Utc>) -> Result<Vec<JobRecord>, QueueError> {
        let kinds = self.kinds.lock().await;
        let Some(state) = kinds.get(&kind) else {
            return Ok(Vec::new());
        };
        Ok(state
            .active
            .iter()
            .filter(|(_, (heartbeat, _))| *heartbeat <= heartbeat_before)
            .filter_map(|(id, (_, lease))| {
                let mut record = state.jobs.get(id)?.clone();
                record.lease = Some(*lease);
                Some(record)
            })
            .collect())
    }

    async fn counts(&self, kind: JobKind) -> Result<QueueCounts, QueueError> {
        let kinds = self.kinds.lock().await;
        Ok(kinds
            .get(&kind)
            .map(|s| QueueCounts {
                waiting: s.waiting.len() as u64,
                delayed: s.delayed.len() as u64,
                active: s.active.len() as u64,
                completed: s.completed.len() as u64,
                failed: s.failed.len() as u64,
            })
            .unwrap_or_default())
    }

    async fn ping(&self) -> Result<(), QueueError> {
        Ok(())
    }
}
