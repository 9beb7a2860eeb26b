//! Redis-backed queue storage.
//!
//! Layout under a configurable prefix `p`:
//!
//! - `p:pending` sorted set of job ids scored by `available_at` (ms)
//! - `p:leased` sorted set scored by `leased_until` (ms)
//! - `p:dlq` sorted set scored by burial time (ms)
//! - `p:job:{id}` hash holding the job fields
//! - `p:idem:{name}:{key}` string pointing at the job owning an idempotency key

mod scripts;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tracing::{debug, instrument};

use crate::{
    backend::{Insertion, LeaseGrant, QueueBackend, QueueStats},
    Job, JobId, LeaseToken, QueueError, QueueResult, WorkerId,
};

struct Scripts {
    insert: Script,
    claim: Script,
    complete: Script,
    release: Script,
    bury: Script,
    extend: Script,
    revive: Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            insert: Script::new(scripts::INSERT),
            claim: Script::new(scripts::CLAIM),
            complete: Script::new(scripts::COMPLETE),
            release: Script::new(scripts::RELEASE),
            bury: Script::new(scripts::BURY),
            extend: Script::new(scripts::EXTEND),
            revive: Script::new(scripts::REVIVE),
        }
    }
}

/// Queue backend storing jobs in Redis sorted sets and hashes
pub struct RedisBackend {
    conn: ConnectionManager,
    prefix: String,
    scripts: Scripts,
}

impl RedisBackend {
    /// Connect to `url` and store keys under `prefix`
    pub async fn connect(url: &str, prefix: impl Into<String>) -> QueueResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::with_connection(conn, prefix))
    }

    /// Reuse an existing connection manager
    pub fn with_connection(conn: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
            scripts: Scripts::load(),
        }
    }

    fn pending_key(&self) -> String {
        format!("{}:pending", self.prefix)
    }

    fn leased_key(&self) -> String {
        format!("{}:leased", self.prefix)
    }

    fn dlq_key(&self) -> String {
        format!("{}:dlq", self.prefix)
    }

    fn job_prefix(&self) -> String {
        format!("{}:job:", self.prefix)
    }

    fn job_key(&self, job_id: &JobId) -> String {
        format!("{}:job:{}", self.prefix, job_id)
    }

    fn idem_prefix(&self) -> String {
        format!("{}:idem:", self.prefix)
    }

    async fn load_many(&self, ids: &[String]) -> QueueResult<Vec<Job>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipe = redis::pipe();
        for id in ids {
            pipe.hgetall(self.job_key(&JobId::from(id.as_str())));
        }
        let mut conn = self.conn.clone();
        let hashes: Vec<HashMap<String, String>> = pipe.query_async(&mut conn).await?;

        hashes
            .into_iter()
            .filter(|fields| !fields.is_empty())
            .map(job_from_fields)
            .collect()
    }
}

#[async_trait]
impl QueueBackend for RedisBackend {
    #[instrument(skip(self, job), fields(job_id = %job.id, job_name = %job.name))]
    async fn insert(&self, job: Job) -> QueueResult<Insertion> {
        let idem = job
            .idempotency_key
            .as_ref()
            .map(|key| format!("{}{}:{}", self.idem_prefix(), job.name, key))
            .unwrap_or_default();

        let mut invocation = self.scripts.insert.prepare_invoke();
        invocation
            .key(self.pending_key())
            .key(self.job_key(&job.id))
            .arg(idem)
            .arg(job.id.as_str())
            .arg(job.available_at.timestamp_millis())
            .arg(self.job_prefix());
        for (field, value) in job_to_fields(&job)? {
            invocation.arg(field).arg(value);
        }

        let mut conn = self.conn.clone();
        let (job_id, created): (String, i64) = invocation.invoke_async(&mut conn).await?;
        debug!(created = created == 1, "Inserted job");

        Ok(Insertion {
            job_id: JobId::from(job_id),
            created: created == 1,
        })
    }

    async fn claim_next(&self, now: DateTime<Utc>, grant: LeaseGrant) -> QueueResult<Option<Job>> {
        let mut conn = self.conn.clone();
        let reply: Option<Vec<String>> = self
            .scripts
            .claim
            .key(self.pending_key())
            .key(self.leased_key())
            .arg(now.timestamp_millis())
            .arg(grant.leased_until.timestamp_millis())
            .arg(grant.token.as_str())
            .arg(grant.worker_id.as_str())
            .arg(self.job_prefix())
            .invoke_async(&mut conn)
            .await?;

        reply.map(job_from_reply).transpose()
    }

    async fn get(&self, job_id: &JobId) -> QueueResult<Option<Job>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(self.job_key(job_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        job_from_fields(fields).map(Some)
    }

    async fn complete(&self, job_id: &JobId, token: &LeaseToken) -> QueueResult<Option<Job>> {
        let mut conn = self.conn.clone();
        let reply: Option<Vec<String>> = self
            .scripts
            .complete
            .key(self.leased_key())
            .key(self.job_key(job_id))
            .arg(token.as_str())
            .arg(job_id.as_str())
            .arg(self.idem_prefix())
            .invoke_async(&mut conn)
            .await?;

        reply.map(job_from_reply).transpose()
    }

    async fn release(
        &self,
        job_id: &JobId,
        token: &LeaseToken,
        available_at: DateTime<Utc>,
        error: &str,
    ) -> QueueResult<Option<Job>> {
        let mut conn = self.conn.clone();
        let reply: Option<Vec<String>> = self
            .scripts
            .release
            .key(self.leased_key())
            .key(self.pending_key())
            .key(self.job_key(job_id))
            .arg(token.as_str())
            .arg(job_id.as_str())
            .arg(available_at.timestamp_millis())
            .arg(error)
            .invoke_async(&mut conn)
            .await?;

        reply.map(job_from_reply).transpose()
    }

    async fn bury(
        &self,
        job_id: &JobId,
        token: &LeaseToken,
        at: DateTime<Utc>,
        error: &str,
    ) -> QueueResult<Option<Job>> {
        let mut conn = self.conn.clone();
        let reply: Option<Vec<String>> = self
            .scripts
            .bury
            .key(self.leased_key())
            .key(self.dlq_key())
            .key(self.job_key(job_id))
            .arg(token.as_str())
            .arg(job_id.as_str())
            .arg(at.timestamp_millis())
            .arg(error)
            .invoke_async(&mut conn)
            .await?;

        reply.map(job_from_reply).transpose()
    }

    async fn extend_lease(
        &self,
        job_id: &JobId,
        token: &LeaseToken,
        leased_until: DateTime<Utc>,
    ) -> QueueResult<bool> {
        let mut conn = self.conn.clone();
        let extended: i64 = self
            .scripts
            .extend
            .key(self.leased_key())
            .key(self.job_key(job_id))
            .arg(token.as_str())
            .arg(job_id.as_str())
            .arg(leased_until.timestamp_millis())
            .invoke_async(&mut conn)
            .await?;
        Ok(extended == 1)
    }

    async fn dead_letters(&self, limit: usize, offset: usize) -> QueueResult<Vec<Job>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let start = isize::try_from(offset).map_err(|_| QueueError::Internal("offset overflow".into()))?;
        let stop = start.saturating_add(isize::try_from(limit).unwrap_or(isize::MAX) - 1);

        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.zrange(self.dlq_key(), start, stop).await?;
        self.load_many(&ids).await
    }

    async fn revive(&self, job_id: &JobId, available_at: DateTime<Utc>) -> QueueResult<Option<Job>> {
        let mut conn = self.conn.clone();
        let reply: Option<Vec<String>> = self
            .scripts
            .revive
            .key(self.dlq_key())
            .key(self.pending_key())
            .key(self.job_key(job_id))
            .arg(job_id.as_str())
            .arg(available_at.timestamp_millis())
            .invoke_async(&mut conn)
            .await?;

        reply.map(job_from_reply).transpose()
    }

    async fn stats(&self) -> QueueResult<QueueStats> {
        let mut conn = self.conn.clone();
        let (pending, leased, dead_lettered): (usize, usize, usize) = redis::pipe()
            .zcard(self.pending_key())
            .zcard(self.leased_key())
            .zcard(self.dlq_key())
            .query_async(&mut conn)
            .await?;

        Ok(QueueStats {
            pending,
            leased,
            dead_lettered,
        })
    }
}

fn millis(at: DateTime<Utc>) -> String {
    at.timestamp_millis().to_string()
}

fn job_to_fields(job: &Job) -> QueueResult<Vec<(&'static str, String)>> {
    let mut fields = vec![
        ("id", job.id.to_string()),
        ("name", job.name.clone()),
        ("payload", serde_json::to_string(&job.payload)?),
        ("available_at", millis(job.available_at)),
        ("attempts", job.attempts.to_string()),
        ("max_attempts", job.max_attempts.to_string()),
        ("attempt_budget", job.attempt_budget.to_string()),
        ("backoff_seconds", job.backoff_seconds.to_string()),
        ("created_at", millis(job.created_at)),
    ];
    if let Some(key) = &job.idempotency_key {
        fields.push(("idempotency_key", key.clone()));
    }
    if let Some(error) = &job.last_error {
        fields.push(("last_error", error.clone()));
    }
    Ok(fields)
}

fn job_from_reply(flat: Vec<String>) -> QueueResult<Job> {
    let mut fields = HashMap::with_capacity(flat.len() / 2);
    let mut iter = flat.into_iter();
    while let (Some(field), Some(value)) = (iter.next(), iter.next()) {
        fields.insert(field, value);
    }
    job_from_fields(fields)
}

fn job_from_fields(mut fields: HashMap<String, String>) -> QueueResult<Job> {
    fn required(fields: &mut HashMap<String, String>, name: &str) -> QueueResult<String> {
        fields
            .remove(name)
            .ok_or_else(|| QueueError::Serialization(format!("job hash missing field `{name}`")))
    }

    fn number<T: std::str::FromStr>(raw: &str, name: &str) -> QueueResult<T> {
        raw.parse()
            .map_err(|_| QueueError::Serialization(format!("job field `{name}` is not a number: {raw}")))
    }

    fn timestamp(raw: &str, name: &str) -> QueueResult<DateTime<Utc>> {
        let ms: i64 = number(raw, name)?;
        Utc.timestamp_millis_opt(ms)
            .single()
            .ok_or_else(|| QueueError::Serialization(format!("job field `{name}` is out of range: {raw}")))
    }

    let optional_time = |fields: &mut HashMap<String, String>, name: &str| -> QueueResult<Option<DateTime<Utc>>> {
        fields.remove(name).map(|raw| timestamp(&raw, name)).transpose()
    };

    let id = required(&mut fields, "id")?;
    let name = required(&mut fields, "name")?;
    let payload = serde_json::from_str(&required(&mut fields, "payload")?)?;
    let available_at = timestamp(&required(&mut fields, "available_at")?, "available_at")?;
    let attempts = number(&required(&mut fields, "attempts")?, "attempts")?;
    let max_attempts = number(&required(&mut fields, "max_attempts")?, "max_attempts")?;
    let attempt_budget = match fields.remove("attempt_budget") {
        Some(raw) => number(&raw, "attempt_budget")?,
        None => max_attempts,
    };
    let backoff_seconds = number(&required(&mut fields, "backoff_seconds")?, "backoff_seconds")?;
    let created_at = timestamp(&required(&mut fields, "created_at")?, "created_at")?;
    let leased_until = optional_time(&mut fields, "leased_until")?;
    let dead_lettered_at = optional_time(&mut fields, "dead_lettered_at")?;

    Ok(Job {
        id: JobId::from(id),
        name,
        payload,
        available_at,
        attempts,
        max_attempts,
        attempt_budget,
        backoff_seconds,
        last_error: fields.remove("last_error"),
        lease_token: fields.remove("lease_token").map(LeaseToken::from),
        leased_until,
        leased_by: fields.remove("leased_by").map(WorkerId::from),
        idempotency_key: fields.remove("idempotency_key"),
        created_at,
        dead_lettered_at,
    })
}
