use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use kennel_queue::{Clock, EnqueueOptions, JobQueue, ManualClock, QueueError, Scheduler, WorkerId};

// A multiple of 60s, so 30s and 60s slots start here
const SLOT_START: i64 = 1_700_000_040;

fn create_test_scheduler() -> (Scheduler, JobQueue, ManualClock) {
    let clock = ManualClock::at_unix(SLOT_START);
    let queue = JobQueue::in_memory().with_clock(clock.shared());
    (Scheduler::new(queue.clone()), queue, clock)
}

#[tokio::test]
async fn test_task_fires_once_per_interval() {
    let (scheduler, queue, clock) = create_test_scheduler();
    scheduler
        .add_task("cleanup", Duration::from_secs(60), "maintenance.cleanup", || json!({"scope": "all"}))
        .unwrap();

    assert_eq!(scheduler.tick().await.unwrap(), 1);
    assert_eq!(scheduler.tick().await.unwrap(), 0);

    clock.advance(Duration::from_secs(59));
    assert_eq!(scheduler.tick().await.unwrap(), 0);

    clock.advance(Duration::from_secs(1));
    assert_eq!(scheduler.tick().await.unwrap(), 1);
    assert_eq!(queue.stats().await.unwrap().pending, 2);

    let job = queue.lease(&WorkerId::from("w1"), Duration::from_secs(5)).await.unwrap().unwrap();
    assert_eq!(job.name, "maintenance.cleanup");
    assert_eq!(job.payload, json!({"scope": "all"}));
}

#[tokio::test]
async fn test_missed_slots_fire_once() {
    let (scheduler, queue, clock) = create_test_scheduler();
    scheduler
        .add_task("digest", Duration::from_secs(60), "email.digest", || json!({}))
        .unwrap();
    scheduler.tick().await.unwrap();

    // Asleep for five intervals
    clock.advance(Duration::from_secs(300));
    assert_eq!(scheduler.tick().await.unwrap(), 1);
    assert_eq!(scheduler.tick().await.unwrap(), 0);
    assert_eq!(queue.stats().await.unwrap().pending, 2);

    let next = scheduler.tasks()[0].next_run_at;
    assert_eq!(next, clock.now() + chrono::Duration::seconds(60));
}

#[tokio::test]
async fn test_two_schedulers_share_each_slot() {
    let clock = ManualClock::at_unix(SLOT_START);
    let queue = JobQueue::in_memory().with_clock(clock.shared());
    let first = Scheduler::new(queue.clone());
    let second = Scheduler::new(queue.clone());
    for scheduler in [&first, &second] {
        scheduler
            .add_task("rollup", Duration::from_secs(30), "metrics.rollup", || json!({}))
            .unwrap();
    }

    assert_eq!(first.tick().await.unwrap(), 1);
    assert_eq!(second.tick().await.unwrap(), 0);

    assert_eq!(queue.stats().await.unwrap().pending, 1);
}

#[tokio::test]
async fn test_schedulers_registered_at_different_times_share_slots() {
    let clock = ManualClock::at_unix(SLOT_START + 1);
    let queue = JobQueue::in_memory().with_clock(clock.shared());
    let first = Scheduler::new(queue.clone());
    let second = Scheduler::new(queue.clone());

    // Arrange: the second process comes up a second later
    first
        .add_task("rollup", Duration::from_secs(30), "metrics.rollup", || json!({}))
        .unwrap();
    assert_eq!(first.tick().await.unwrap(), 1);
    clock.advance(Duration::from_secs(1));
    second
        .add_task("rollup", Duration::from_secs(30), "metrics.rollup", || json!({}))
        .unwrap();

    // Act
    assert_eq!(second.tick().await.unwrap(), 0);
    clock.advance(Duration::from_secs(30));
    let fired = first.tick().await.unwrap() + second.tick().await.unwrap();

    // Assert: two slots, two jobs
    assert_eq!(fired, 1);
    assert_eq!(queue.stats().await.unwrap().pending, 2);
    assert_eq!(first.tasks()[0].next_run_at, second.tasks()[0].next_run_at);
}

#[tokio::test]
async fn test_first_run_covers_the_current_grid_slot() {
    let clock = ManualClock::at_unix(SLOT_START + 45);
    let queue = JobQueue::in_memory().with_clock(clock.shared());
    let scheduler = Scheduler::new(queue.clone());
    scheduler
        .add_task("digest", Duration::from_secs(60), "email.digest", || json!({}))
        .unwrap();

    assert_eq!(scheduler.tasks()[0].next_run_at.timestamp(), SLOT_START);
    assert_eq!(scheduler.tick().await.unwrap(), 1);

    // Next slot starts 15s later, not 60s after registration
    clock.advance(Duration::from_secs(15));
    assert_eq!(scheduler.tick().await.unwrap(), 1);
}

#[tokio::test]
async fn test_payload_factory_runs_per_slot() {
    let (scheduler, queue, clock) = create_test_scheduler();
    let counter = Arc::new(AtomicU64::new(0));
    let seq = counter.clone();
    scheduler
        .add_task_with_options(
            "heartbeat",
            Duration::ZERO,
            "ops.heartbeat",
            move || json!({"seq": seq.fetch_add(1, Ordering::SeqCst)}),
            EnqueueOptions::new().with_max_attempts(1),
        )
        .unwrap();

    for _ in 0..3 {
        assert_eq!(scheduler.tick().await.unwrap(), 1);
        clock.advance(Duration::from_millis(10));
    }

    assert_eq!(counter.load(Ordering::SeqCst), 3);
    assert_eq!(queue.stats().await.unwrap().pending, 3);
    let job = queue.lease(&WorkerId::from("w1"), Duration::from_secs(5)).await.unwrap().unwrap();
    assert_eq!(job.max_attempts, 1);
}

#[test]
fn test_duplicate_task_name_rejected() {
    let (scheduler, _, _) = create_test_scheduler();
    scheduler.add_task("a", Duration::from_secs(1), "job.a", || json!({})).unwrap();

    let err = scheduler.add_task("a", Duration::from_secs(2), "job.b", || json!({})).unwrap_err();

    assert!(matches!(err, QueueError::TaskAlreadyRegistered(name) if name == "a"));
}

#[tokio::test(start_paused = true)]
async fn test_run_stops_after_max_loops() {
    let (scheduler, queue, _) = create_test_scheduler();
    scheduler.add_task("a", Duration::ZERO, "job.a", || json!({})).unwrap();

    let loops = scheduler.run(Some(3)).await.unwrap();

    assert_eq!(loops, 3);
    // Clock never moved: every tick shares one slot key
    assert_eq!(queue.stats().await.unwrap().pending, 1);
}
