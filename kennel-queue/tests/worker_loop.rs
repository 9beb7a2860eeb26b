use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use kennel_queue::{
    handler_fn, EnqueueOptions, Job, JobError, JobQueue, JobRegistry, LiveMetrics, ManualClock, Worker,
    WorkerConfig,
};

fn create_test_queue() -> (JobQueue, ManualClock) {
    let clock = ManualClock::at_unix(1_700_000_000);
    (JobQueue::in_memory().with_clock(clock.shared()), clock)
}

fn fast_config() -> WorkerConfig {
    WorkerConfig::default()
        .with_worker_id("test-worker")
        .with_poll_interval(Duration::from_millis(5))
        .with_visibility_timeout(Duration::from_secs(30))
}

fn counting_handler(calls: Arc<AtomicUsize>, result: Result<(), JobError>) -> impl kennel_queue::JobHandler {
    handler_fn(move |_job: Job| {
        let calls = calls.clone();
        let result = result.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            result
        }
    })
}

#[tokio::test]
async fn test_process_one_acks_successful_job() {
    let (queue, _) = create_test_queue();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = JobRegistry::new();
    registry.register("email.send", counting_handler(calls.clone(), Ok(()))).unwrap();
    let job_id = queue.enqueue("email.send", json!({}), EnqueueOptions::new()).await.unwrap();

    let worker = Worker::new(queue.clone(), registry, fast_config());

    assert!(worker.process_one().await.unwrap());
    assert!(!worker.process_one().await.unwrap());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(queue.get(&job_id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_retryable_error_reschedules_until_dead_letter() {
    let (queue, clock) = create_test_queue();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = JobRegistry::new();
    registry
        .register("sync", counting_handler(calls.clone(), Err(JobError::retryable("upstream 503"))))
        .unwrap();
    let options = EnqueueOptions::new().with_max_attempts(3).with_backoff_seconds(10);
    let job_id = queue.enqueue("sync", json!({}), options).await.unwrap();
    let worker = Worker::new(queue.clone(), registry, fast_config());

    for _ in 0..3 {
        assert!(worker.process_one().await.unwrap());
        clock.advance(Duration::from_secs(60));
    }

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let dead = queue.dead_letter_jobs(10, 0).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id, job_id);
    assert_eq!(dead[0].last_error.as_deref(), Some("upstream 503"));
}

#[tokio::test]
async fn test_permanent_error_dead_letters_on_first_attempt() {
    let (queue, _) = create_test_queue();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = JobRegistry::new();
    registry
        .register("charge", counting_handler(calls.clone(), Err(JobError::permanent("card declined"))))
        .unwrap();
    queue.enqueue("charge", json!({}), EnqueueOptions::new().with_max_attempts(5)).await.unwrap();

    let worker = Worker::new(queue.clone(), registry, fast_config());
    worker.process_one().await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(queue.dead_letter_jobs(10, 0).await.unwrap()[0].attempts, 1);
}

#[tokio::test]
async fn test_unregistered_job_name_is_dead_lettered() {
    let (queue, _) = create_test_queue();
    queue.enqueue("nobody.handles.this", json!({}), EnqueueOptions::new()).await.unwrap();

    let worker = Worker::new(queue.clone(), JobRegistry::new(), fast_config());
    worker.process_one().await.unwrap();

    let dead = queue.dead_letter_jobs(10, 0).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert!(dead[0].last_error.as_deref().unwrap().contains("nobody.handles.this"));
}

#[tokio::test]
async fn test_panicking_handler_is_contained() {
    let (queue, _) = create_test_queue();
    let mut registry = JobRegistry::new();
    registry
        .register(
            "explode",
            handler_fn(|_job: Job| async move {
                if true {
                    panic!("kaboom");
                }
                Ok(())
            }),
        )
        .unwrap();
    let job_id = queue.enqueue("explode", json!({}), EnqueueOptions::new().with_max_attempts(3)).await.unwrap();

    let worker = Worker::new(queue.clone(), registry, fast_config());
    assert!(worker.process_one().await.unwrap());

    let job = queue.get(&job_id).await.unwrap().unwrap();
    assert!(job.last_error.unwrap().contains("kaboom"));
    assert!(job.lease_token.is_none());
}

#[tokio::test]
async fn test_handler_timeout_counts_as_retryable_failure() {
    let (queue, _) = create_test_queue();
    let mut registry = JobRegistry::new();
    registry
        .register(
            "slow",
            handler_fn(|_job: Job| async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            }),
        )
        .unwrap();
    let job_id = queue.enqueue("slow", json!({}), EnqueueOptions::new().with_max_attempts(2)).await.unwrap();

    let config = fast_config().with_handler_timeout(Duration::from_millis(20));
    let worker = Worker::new(queue.clone(), registry, config);
    worker.process_one().await.unwrap();

    let job = queue.get(&job_id).await.unwrap().unwrap();
    assert_eq!(job.attempts, 1);
    assert!(job.last_error.unwrap().contains("timed out"));
    assert!(job.dead_lettered_at.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_renews_lease_while_handler_runs() {
    let (queue, clock) = create_test_queue();
    let mut registry = JobRegistry::new();
    let observed = queue.clone();
    registry
        .register(
            "long",
            handler_fn(move |job: Job| {
                let queue = observed.clone();
                let clock = clock.clone();
                async move {
                    let before = queue.get(&job.id).await?.and_then(|j| j.leased_until);
                    clock.advance(Duration::from_secs(1));
                    tokio::time::sleep(Duration::from_millis(250)).await;
                    let after = queue.get(&job.id).await?.and_then(|j| j.leased_until);
                    if after > before {
                        Ok(())
                    } else {
                        Err(JobError::permanent("lease was not renewed"))
                    }
                }
            }),
        )
        .unwrap();
    let job_id = queue.enqueue("long", json!({}), EnqueueOptions::new()).await.unwrap();

    let config = fast_config()
        .with_visibility_timeout(Duration::from_secs(2))
        .with_heartbeat_interval(Duration::from_millis(100));
    let worker = Worker::new(queue.clone(), registry, config);

    assert!(worker.process_one().await.unwrap());
    assert!(queue.get(&job_id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_run_with_max_loops_drains_queue() {
    let metrics = Arc::new(LiveMetrics::new());
    let queue = JobQueue::in_memory().with_observer(metrics.clone());
    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = JobRegistry::new();
    registry.register("email.send", counting_handler(calls.clone(), Ok(()))).unwrap();
    for i in 0..4 {
        queue.enqueue("email.send", json!({"n": i}), EnqueueOptions::new()).await.unwrap();
    }

    let worker = Worker::new(queue.clone(), registry, fast_config().with_concurrency(2));
    let report = worker.run(Some(8)).await.unwrap();

    assert_eq!(report.completed, 4);
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(metrics.snapshot().jobs_completed, 4);
    assert_eq!(queue.stats().await.unwrap().pending, 0);
}

#[tokio::test]
async fn test_started_worker_stops_on_shutdown() {
    let queue = JobQueue::in_memory();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = JobRegistry::new();
    registry.register("email.send", counting_handler(calls.clone(), Ok(()))).unwrap();
    queue.enqueue("email.send", json!({}), EnqueueOptions::new()).await.unwrap();

    let handle = Worker::new(queue.clone(), registry, fast_config()).start();
    for _ in 0..100 {
        if calls.load(Ordering::SeqCst) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let report = handle.shutdown(Duration::from_secs(1)).await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(report.completed, 1);
}

#[tokio::test]
async fn test_shutdown_grace_abandons_stuck_handler() {
    let queue = JobQueue::in_memory();
    let mut registry = JobRegistry::new();
    let started = Arc::new(AtomicUsize::new(0));
    let flag = started.clone();
    registry
        .register(
            "stuck",
            handler_fn(move |_job: Job| {
                let flag = flag.clone();
                async move {
                    flag.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(())
                }
            }),
        )
        .unwrap();
    let job_id = queue.enqueue("stuck", json!({}), EnqueueOptions::new()).await.unwrap();

    let handle = Worker::new(queue.clone(), registry, fast_config()).start();
    for _ in 0..100 {
        if started.load(Ordering::SeqCst) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let report = tokio::time::timeout(Duration::from_secs(5), handle.shutdown(Duration::from_millis(20)))
        .await
        .expect("shutdown should respect the grace period")
        .unwrap();

    // Job stays leased until its visibility timeout lapses
    assert_eq!(report.completed, 0);
    assert_eq!(queue.status(&job_id).await.unwrap().unwrap().name(), "leased");
}
