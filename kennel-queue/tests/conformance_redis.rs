//! Lease, dead-letter and idempotency contracts against a live Redis.
//!
//! Needs the `redis` feature and `REDIS_URL` (e.g. `redis://127.0.0.1:6379`);
//! without the variable every test returns early. Each test writes under its
//! own key prefix and deletes it afterwards.

#![cfg(feature = "redis")]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use kennel_queue::{
    Clock, EnqueueOptions, FailOutcome, JobQueue, LeaseToken, LiveMetrics, ManualClock, QueueError, RedisBackend, WorkerId,
};

const VISIBILITY: Duration = Duration::from_secs(30);

struct TestRedis {
    url: String,
    prefix: String,
}

impl TestRedis {
    fn from_env() -> Option<Self> {
        let url = std::env::var("REDIS_URL").ok().filter(|url| !url.is_empty())?;
        Some(Self {
            url,
            prefix: format!("kennel-test:{}", uuid::Uuid::new_v4()),
        })
    }

    async fn queue(&self) -> (JobQueue, ManualClock) {
        let clock = ManualClock::at_unix(1_700_000_000);
        let backend = RedisBackend::connect(&self.url, self.prefix.clone()).await.unwrap();
        (JobQueue::new(Arc::new(backend)).with_clock(clock.shared()), clock)
    }

    async fn cleanup(self) {
        let client = redis::Client::open(self.url.as_str()).unwrap();
        let mut conn = client.get_multiplexed_async_connection().await.unwrap();
        let keys: Vec<String> = redis::cmd("KEYS")
            .arg(format!("{}:*", self.prefix))
            .query_async(&mut conn)
            .await
            .unwrap();
        if !keys.is_empty() {
            let _: () = redis::cmd("DEL").arg(keys).query_async(&mut conn).await.unwrap();
        }
    }
}

macro_rules! redis_or_skip {
    () => {
        match TestRedis::from_env() {
            Some(redis) => redis,
            None => {
                eprintln!("REDIS_URL not set; skipping");
                return;
            }
        }
    };
}

fn worker(name: &str) -> WorkerId {
    WorkerId::from(name)
}

fn options(max_attempts: u32, backoff_seconds: u64) -> EnqueueOptions {
    EnqueueOptions::new()
        .with_max_attempts(max_attempts)
        .with_backoff_seconds(backoff_seconds)
}

/// A1. Lease Grants Token And Counts Attempt
#[tokio::test]
async fn test_lease_grants_token_and_counts_attempt() {
    let redis = redis_or_skip!();
    let (queue, clock) = redis.queue().await;

    // Arrange
    let job_id = queue.enqueue("email.send", json!({"to": "a"}), options(3, 0)).await.unwrap();

    // Act
    let leased = queue.lease(&worker("w1"), VISIBILITY).await.unwrap().unwrap();

    // Assert
    assert_eq!(leased.id, job_id);
    assert_eq!(leased.attempts, 1);
    assert_eq!(leased.payload, json!({"to": "a"}));
    assert!(leased.lease_token.is_some());
    assert_eq!(leased.leased_until, Some(clock.now() + chrono::Duration::seconds(30)));
    assert_eq!(leased.leased_by, Some(worker("w1")));
    assert!(queue.lease(&worker("w2"), VISIBILITY).await.unwrap().is_none());

    redis.cleanup().await;
}

/// A2. Only Lease Holder Can Ack
#[tokio::test]
async fn test_only_lease_holder_can_ack() {
    let redis = redis_or_skip!();
    let (queue, _) = redis.queue().await;
    let job_id = queue.enqueue("email.send", json!({}), options(3, 0)).await.unwrap();
    queue.lease(&worker("w1"), VISIBILITY).await.unwrap().unwrap();

    let acked = queue.ack(&job_id, &LeaseToken::from("forged")).await.unwrap();

    assert!(!acked);
    assert_eq!(queue.status(&job_id).await.unwrap().unwrap().name(), "leased");

    redis.cleanup().await;
}

/// A3. Expired Lease Is Reclaimed With A New Token
#[tokio::test]
async fn test_expired_lease_is_reclaimed() {
    let redis = redis_or_skip!();
    let (queue, clock) = redis.queue().await;
    let job_id = queue.enqueue("email.send", json!({}), options(5, 0)).await.unwrap();

    let first = queue.lease(&worker("w1"), Duration::from_secs(10)).await.unwrap().unwrap();
    clock.advance(Duration::from_secs(11));
    let second = queue.lease(&worker("w2"), Duration::from_secs(10)).await.unwrap().unwrap();

    assert_eq!(second.id, job_id);
    assert_eq!(second.attempts, 2);
    assert_ne!(first.lease_token, second.lease_token);
    assert_eq!(queue.stats().await.unwrap().leased, 1);

    redis.cleanup().await;
}

/// A4. Stale Token Cannot Ack, Fail Or Extend
#[tokio::test]
async fn test_stale_token_operations_are_noops() {
    let redis = redis_or_skip!();
    let metrics = Arc::new(LiveMetrics::new());
    let (queue, clock) = redis.queue().await;
    let queue = queue.with_observer(metrics.clone());
    let job_id = queue.enqueue("email.send", json!({}), options(5, 0)).await.unwrap();

    let first = queue.lease(&worker("w1"), Duration::from_secs(10)).await.unwrap().unwrap();
    clock.advance(Duration::from_secs(11));
    let second = queue.lease(&worker("w2"), Duration::from_secs(10)).await.unwrap().unwrap();
    let stale = first.lease_token.unwrap();

    // Act
    let acked = queue.ack(&job_id, &stale).await.unwrap();
    let failed = queue.fail(&job_id, &stale, "late").await.unwrap();
    let extended = queue.extend_lease(&job_id, &stale, VISIBILITY).await.unwrap();

    // Assert: second holder unaffected
    assert!(!acked);
    assert_eq!(failed, FailOutcome::Stale);
    assert!(!extended);
    let job = queue.get(&job_id).await.unwrap().unwrap();
    assert_eq!(job.lease_token, second.lease_token);
    assert_eq!(job.last_error, None);
    assert_eq!(metrics.snapshot().stale_leases, 3);
    assert!(queue.ack(&job_id, second.lease_token.as_ref().unwrap()).await.unwrap());

    redis.cleanup().await;
}

/// A5. Ack On A Lapsed But Unclaimed Lease Succeeds
#[tokio::test]
async fn test_ack_after_lapse_without_reclaim_succeeds() {
    let redis = redis_or_skip!();
    let (queue, clock) = redis.queue().await;
    let job_id = queue.enqueue("email.send", json!({}), options(5, 0)).await.unwrap();
    let leased = queue.lease(&worker("w1"), Duration::from_secs(10)).await.unwrap().unwrap();

    clock.advance(Duration::from_secs(60));

    assert!(queue.ack(&job_id, leased.lease_token.as_ref().unwrap()).await.unwrap());
    assert!(queue.get(&job_id).await.unwrap().is_none());
    let stats = queue.stats().await.unwrap();
    assert_eq!((stats.pending, stats.leased), (0, 0));

    redis.cleanup().await;
}

/// A6. Heartbeat Extension Keeps Lease Alive
#[tokio::test]
async fn test_extend_lease_defers_reclaim() {
    let redis = redis_or_skip!();
    let (queue, clock) = redis.queue().await;
    let job_id = queue.enqueue("report.build", json!({}), options(5, 0)).await.unwrap();
    let leased = queue.lease(&worker("w1"), Duration::from_secs(10)).await.unwrap().unwrap();
    let token = leased.lease_token.unwrap();

    clock.advance(Duration::from_secs(8));
    assert!(queue.extend_lease(&job_id, &token, Duration::from_secs(10)).await.unwrap());
    clock.advance(Duration::from_secs(8));

    assert!(queue.lease(&worker("w2"), VISIBILITY).await.unwrap().is_none());
    clock.advance(Duration::from_secs(2));
    assert!(queue.lease(&worker("w2"), VISIBILITY).await.unwrap().is_some());

    redis.cleanup().await;
}

/// B1. Exhausted Attempts Dead-Letter The Job
#[tokio::test]
async fn test_exhausted_attempts_dead_letter() {
    let redis = redis_or_skip!();
    let (queue, clock) = redis.queue().await;
    let job_id = queue.enqueue("email.send", json!({}), options(2, 5)).await.unwrap();

    let first = queue.lease(&worker("w1"), VISIBILITY).await.unwrap().unwrap();
    let outcome = queue.fail(&job_id, first.lease_token.as_ref().unwrap(), "boom 1").await.unwrap();
    assert_eq!(
        outcome,
        FailOutcome::RetryScheduled {
            available_at: clock.now() + chrono::Duration::seconds(5)
        }
    );
    assert!(queue.lease(&worker("w1"), VISIBILITY).await.unwrap().is_none());

    clock.advance(Duration::from_secs(5));
    let second = queue.lease(&worker("w1"), VISIBILITY).await.unwrap().unwrap();
    let outcome = queue.fail(&job_id, second.lease_token.as_ref().unwrap(), "boom 2").await.unwrap();

    assert_eq!(outcome, FailOutcome::DeadLettered);
    let dead = queue.dead_letter_jobs(10, 0).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id, job_id);
    assert_eq!(dead[0].attempts, 2);
    assert_eq!(dead[0].last_error.as_deref(), Some("boom 2"));

    clock.advance(Duration::from_secs(3600));
    assert!(queue.lease(&worker("w1"), VISIBILITY).await.unwrap().is_none());

    redis.cleanup().await;
}

/// B2. Permanent Failure Skips Remaining Attempts
#[tokio::test]
async fn test_fail_permanently_skips_retries() {
    let redis = redis_or_skip!();
    let (queue, _) = redis.queue().await;
    let job_id = queue.enqueue("email.send", json!({}), options(5, 0)).await.unwrap();
    let leased = queue.lease(&worker("w1"), VISIBILITY).await.unwrap().unwrap();

    let outcome = queue
        .fail_permanently(&job_id, leased.lease_token.as_ref().unwrap(), "invalid address")
        .await
        .unwrap();

    assert_eq!(outcome, FailOutcome::DeadLettered);
    let stats = queue.stats().await.unwrap();
    assert_eq!((stats.leased, stats.dead_lettered), (0, 1));

    redis.cleanup().await;
}

/// B3. DLQ Pagination Is Ordered By Burial
#[tokio::test]
async fn test_dead_letter_pagination() {
    let redis = redis_or_skip!();
    let (queue, clock) = redis.queue().await;
    for i in 0..5 {
        queue.enqueue(format!("job.{i}"), json!({}), options(1, 0)).await.unwrap();
    }

    // One burial per second so the order is unambiguous
    let mut buried = Vec::new();
    for _ in 0..5 {
        let leased = queue.lease(&worker("w1"), VISIBILITY).await.unwrap().unwrap();
        queue.fail(&leased.id, leased.lease_token.as_ref().unwrap(), "x").await.unwrap();
        buried.push(leased.id);
        clock.advance(Duration::from_secs(1));
    }

    let page = queue.dead_letter_jobs(2, 1).await.unwrap();
    let page_ids: Vec<_> = page.into_iter().map(|job| job.id).collect();

    assert_eq!(page_ids, vec![buried[1].clone(), buried[2].clone()]);
    assert!(queue.dead_letter_jobs(10, 5).await.unwrap().is_empty());

    redis.cleanup().await;
}

/// B4. Requeue Grants A Fresh Attempt Budget
#[tokio::test]
async fn test_requeue_from_dlq_restores_budget() {
    let redis = redis_or_skip!();
    let (queue, _) = redis.queue().await;
    let job_id = queue.enqueue("email.send", json!({}), options(2, 0)).await.unwrap();
    for _ in 0..2 {
        let leased = queue.lease(&worker("w1"), VISIBILITY).await.unwrap().unwrap();
        queue.fail(&job_id, leased.lease_token.as_ref().unwrap(), "down").await.unwrap();
    }

    let requeued = queue.requeue_from_dlq(&job_id).await.unwrap();

    assert_eq!(requeued.attempts, 2);
    assert_eq!(requeued.max_attempts, 4);
    assert!(requeued.dead_lettered_at.is_none());
    assert!(queue.dead_letter_jobs(10, 0).await.unwrap().is_empty());

    let leased = queue.lease(&worker("w1"), VISIBILITY).await.unwrap().unwrap();
    assert_eq!(leased.attempts, 3);
    let outcome = queue.fail(&job_id, leased.lease_token.as_ref().unwrap(), "down").await.unwrap();
    assert!(matches!(outcome, FailOutcome::RetryScheduled { .. }));

    let err = queue.requeue_from_dlq(&job_id).await.unwrap_err();
    assert!(matches!(err, QueueError::NotDeadLettered(_)));

    redis.cleanup().await;
}

/// C1. Idempotency Key Returns Live Job
#[tokio::test]
async fn test_idempotency_key_deduplicates_live_job() {
    let redis = redis_or_skip!();
    let (queue, _) = redis.queue().await;
    let keyed = || EnqueueOptions::new().with_idempotency_key("order-42");

    let first = queue.enqueue_unique("invoice.render", json!({"v": 1}), keyed()).await.unwrap();
    let second = queue.enqueue_unique("invoice.render", json!({"v": 2}), keyed()).await.unwrap();

    assert!(first.created);
    assert!(!second.created);
    assert_eq!(first.job_id, second.job_id);
    assert_eq!(queue.stats().await.unwrap().pending, 1);
    assert_eq!(queue.get(&first.job_id).await.unwrap().unwrap().payload, json!({"v": 1}));

    redis.cleanup().await;
}

/// C2. Completing A Job Frees Its Idempotency Key
#[tokio::test]
async fn test_completed_job_releases_idempotency_key() {
    let redis = redis_or_skip!();
    let (queue, _) = redis.queue().await;
    let keyed = || EnqueueOptions::new().with_idempotency_key("order-43");
    let first = queue.enqueue("invoice.render", json!({}), keyed()).await.unwrap();
    let leased = queue.lease(&worker("w1"), VISIBILITY).await.unwrap().unwrap();
    assert!(queue.ack(&first, leased.lease_token.as_ref().unwrap()).await.unwrap());

    let again = queue.enqueue_unique("invoice.render", json!({}), keyed()).await.unwrap();

    assert!(again.created);
    assert_ne!(again.job_id, first);

    redis.cleanup().await;
}

/// D1. Concurrent Leases Never Share A Job
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_leases_are_exclusive() {
    let redis = redis_or_skip!();
    let (queue, _) = redis.queue().await;
    for i in 0..8 {
        queue.enqueue("batch.item", json!({"n": i}), options(3, 0)).await.unwrap();
    }

    let mut tasks = Vec::new();
    for n in 0..16 {
        let queue = queue.clone();
        tasks.push(tokio::spawn(async move {
            queue.lease(&WorkerId::from(format!("w{n}")), VISIBILITY).await.unwrap()
        }));
    }
    let mut leased = Vec::new();
    for task in tasks {
        if let Some(job) = task.await.unwrap() {
            leased.push(job.id);
        }
    }

    let distinct: HashSet<_> = leased.iter().cloned().collect();
    assert_eq!(leased.len(), 8);
    assert_eq!(distinct.len(), 8);
    assert_eq!(queue.stats().await.unwrap().leased, 8);

    redis.cleanup().await;
}
