use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::{
    backend::{Insertion, LeaseGrant, QueueBackend, QueueStats},
    Job, JobId, LeaseToken, QueueResult,
};

// (job name, idempotency key) -> job id
type IdempotencyMap = HashMap<(String, String), JobId>;

struct Slot {
    job: Job,
    /// Insertion order, breaks ties between equally-ready jobs
    seq: u64,
}

#[derive(Default)]
struct MemoryState {
    jobs: HashMap<JobId, Slot>,
    idempotency: IdempotencyMap,
    next_seq: u64,
    /// Burial order for the dead-letter listing
    dead_seq: u64,
    dead_order: HashMap<JobId, u64>,
}

impl MemoryState {
    fn forget_idempotency(&mut self, job: &Job) {
        if let Some(key) = &job.idempotency_key {
            let scope = (job.name.clone(), key.clone());
            if self.idempotency.get(&scope) == Some(&job.id) {
                self.idempotency.remove(&scope);
            }
        }
    }

    fn leased_mut(&mut self, job_id: &JobId, token: &LeaseToken) -> Option<&mut Job> {
        self.jobs
            .get_mut(job_id)
            .map(|slot| &mut slot.job)
            .filter(|job| job.holds_lease(token))
    }
}

/// In-memory backend for tests, development and single-process deployments.
///
/// All state sits behind one lock, so each trait method is atomic with
/// respect to every other.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of jobs currently stored, dead letters included
    pub fn len(&self) -> usize {
        self.state.read().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl QueueBackend for MemoryBackend {
    async fn insert(&self, job: Job) -> QueueResult<Insertion> {
        let mut state = self.state.write();

        if let Some(key) = &job.idempotency_key {
            let scope = (job.name.clone(), key.clone());
            if let Some(existing) = state.idempotency.get(&scope) {
                if state.jobs.contains_key(existing) {
                    return Ok(Insertion {
                        job_id: existing.clone(),
                        created: false,
                    });
                }
            }
            state.idempotency.insert(scope, job.id.clone());
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        let job_id = job.id.clone();
        state.jobs.insert(job_id.clone(), Slot { job, seq });

        Ok(Insertion {
            job_id,
            created: true,
        })
    }

    async fn claim_next(&self, now: DateTime<Utc>, grant: LeaseGrant) -> QueueResult<Option<Job>> {
        let mut state = self.state.write();

        let next = state
            .jobs
            .values()
            .filter(|slot| slot.job.is_claimable(now))
            .min_by_key(|slot| (slot.job.ready_at(), slot.seq))
            .map(|slot| slot.job.id.clone());

        let Some(job_id) = next else {
            return Ok(None);
        };

        Ok(state.jobs.get_mut(&job_id).map(|slot| {
            slot.job
                .start_lease(grant.token, grant.leased_until, grant.worker_id);
            slot.job.clone()
        }))
    }

    async fn get(&self, job_id: &JobId) -> QueueResult<Option<Job>> {
        Ok(self.state.read().jobs.get(job_id).map(|slot| slot.job.clone()))
    }

    async fn complete(&self, job_id: &JobId, token: &LeaseToken) -> QueueResult<Option<Job>> {
        let mut state = self.state.write();
        if state.leased_mut(job_id, token).is_none() {
            return Ok(None);
        }

        let removed = state.jobs.remove(job_id).map(|slot| slot.job);
        if let Some(job) = &removed {
            state.forget_idempotency(job);
        }
        Ok(removed)
    }

    async fn release(
        &self,
        job_id: &JobId,
        token: &LeaseToken,
        available_at: DateTime<Utc>,
        error: &str,
    ) -> QueueResult<Option<Job>> {
        let mut state = self.state.write();
        Ok(state.leased_mut(job_id, token).map(|job| {
            job.schedule_retry(available_at, error);
            job.clone()
        }))
    }

    async fn bury(
        &self,
        job_id: &JobId,
        token: &LeaseToken,
        at: DateTime<Utc>,
        error: &str,
    ) -> QueueResult<Option<Job>> {
        let mut state = self.state.write();
        let buried = state.leased_mut(job_id, token).map(|job| {
            job.bury(at, error);
            job.clone()
        });

        if buried.is_some() {
            let seq = state.dead_seq;
            state.dead_seq += 1;
            state.dead_order.insert(job_id.clone(), seq);
        }
        Ok(buried)
    }

    async fn extend_lease(
        &self,
        job_id: &JobId,
        token: &LeaseToken,
        leased_until: DateTime<Utc>,
    ) -> QueueResult<bool> {
        let mut state = self.state.write();
        Ok(state
            .leased_mut(job_id, token)
            .map(|job| job.leased_until = Some(leased_until))
            .is_some())
    }

    async fn dead_letters(&self, limit: usize, offset: usize) -> QueueResult<Vec<Job>> {
        let state = self.state.read();
        let mut buried: Vec<(u64, &Job)> = state
            .dead_order
            .iter()
            .filter_map(|(id, seq)| state.jobs.get(id).map(|slot| (*seq, &slot.job)))
            .collect();
        buried.sort_by_key(|(seq, _)| *seq);

        Ok(buried
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|(_, job)| job.clone())
            .collect())
    }

    async fn revive(&self, job_id: &JobId, available_at: DateTime<Utc>) -> QueueResult<Option<Job>> {
        let mut state = self.state.write();
        if state.dead_order.remove(job_id).is_none() {
            return Ok(None);
        }

        Ok(state.jobs.get_mut(job_id).map(|slot| {
            slot.job.revive(available_at);
            slot.job.clone()
        }))
    }

    async fn stats(&self) -> QueueResult<QueueStats> {
        let state = self.state.read();
        let mut stats = QueueStats::default();
        for slot in state.jobs.values() {
            if slot.job.dead_lettered_at.is_some() {
                stats.dead_lettered += 1;
            } else if slot.job.lease_token.is_some() {
                stats.leased += 1;
            } else {
                stats.pending += 1;
            }
        }
        Ok(stats)
    }
}
