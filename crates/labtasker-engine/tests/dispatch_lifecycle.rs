//! End-to-end dispatch scenarios against the in-memory store.
//!
//! Time is driven by a manual clock, so heartbeat and wall-clock expiry are
//! exercised without sleeping.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Result;
use chrono::Duration;
use serde_json::json;

use labtasker_core::ManualClock;
use labtasker_engine::prelude::*;

struct Harness {
    engine: DispatchEngine,
    clock: Arc<ManualClock>,
    queue: QueueRecord,
}

async fn harness() -> Result<Harness> {
    let clock = Arc::new(ManualClock::default());
    let engine = DispatchEngine::new(
        Arc::new(MemoryStore::new()),
        EventBus::new(64),
        clock.clone(),
    );
    let queue = engine.create_queue("experiments", "secret", None).await?;
    Ok(Harness {
        engine,
        clock,
        queue,
    })
}

impl Harness {
    async fn submit(&self, spec: TaskSpec) -> Result<TaskRecord> {
        // Distinct creation timestamps keep FIFO ordering observable.
        self.clock.advance(Duration::milliseconds(1));
        Ok(self.engine.submit_task(spec).await?)
    }

    async fn register_worker(&self, max_retries: Option<u32>) -> Result<WorkerRecord> {
        Ok(self
            .engine
            .register_worker(self.queue.id, None, None, max_retries)
            .await?)
    }

    async fn fetch(&self, worker: &WorkerRecord) -> Result<Option<TaskRecord>> {
        Ok(self
            .engine
            .fetch_next(self.queue.id, FetchRequest::new(worker.id))
            .await?)
    }
}

#[tokio::test]
async fn happy_path_submit_fetch_heartbeat_report() -> Result<()> {
    let h = harness().await?;

    let submitted = h
        .submit(TaskSpec::new(h.queue.id, json!({"lr": 0.1})))
        .await?;
    let worker = h.register_worker(None).await?;

    let task = h.fetch(&worker).await?.expect("task should be claimable");
    assert_eq!(task.id, submitted.id);
    assert_eq!(task.status, TaskStatus::Running);
    assert_eq!(task.worker_id, Some(worker.id));
    assert!(task.start_time.is_some());
    assert!(task.last_heartbeat.is_some());

    h.clock.advance(Duration::seconds(5));
    let beaten = h.engine.heartbeat(h.queue.id, task.id, worker.id).await?;
    assert!(beaten.last_heartbeat > task.last_heartbeat);
    assert_eq!(beaten.status, TaskStatus::Running);

    h.engine
        .report(
            h.queue.id,
            task.id,
            worker.id,
            ReportOutcome::Success,
            Some(json!({"acc": 0.9})),
        )
        .await?;

    let done = h.engine.get_task(h.queue.id, task.id).await?;
    assert_eq!(done.status, TaskStatus::Success);
    assert_eq!(done.summary, json!({"acc": 0.9}));
    assert!(done.worker_id.is_none());
    assert!(done.start_time.is_none());
    assert!(done.last_heartbeat.is_none());

    let worker = h.engine.get_worker(h.queue.id, worker.id).await?;
    assert_eq!(worker.retries, 0);
    Ok(())
}

#[tokio::test]
async fn failed_reports_requeue_until_budget_then_success_resets_worker() -> Result<()> {
    let h = harness().await?;

    let mut spec = TaskSpec::new(h.queue.id, json!({"lr": 0.1}));
    spec.max_retries = Some(2);
    let submitted = h.submit(spec).await?;
    let worker = h.register_worker(Some(10)).await?;

    for expected_retries in 1..=2 {
        let task = h.fetch(&worker).await?.expect("task should re-queue");
        assert_eq!(task.id, submitted.id);
        h.engine
            .report(h.queue.id, task.id, worker.id, ReportOutcome::Failed, None)
            .await?;
        let after = h.engine.get_task(h.queue.id, task.id).await?;
        assert_eq!(after.status, TaskStatus::Pending);
        assert_eq!(after.retries, expected_retries);
    }

    let task = h.fetch(&worker).await?.expect("third attempt");
    h.engine
        .report(
            h.queue.id,
            task.id,
            worker.id,
            ReportOutcome::Success,
            None,
        )
        .await?;

    let done = h.engine.get_task(h.queue.id, task.id).await?;
    assert_eq!(done.status, TaskStatus::Success);
    assert_eq!(done.retries, 2);

    let worker = h.engine.get_worker(h.queue.id, worker.id).await?;
    assert_eq!(worker.retries, 0, "success resets the failure streak");
    Ok(())
}

#[tokio::test]
async fn consecutive_failures_suspend_worker_and_block_fetch() -> Result<()> {
    let h = harness().await?;
    let worker = h.register_worker(Some(3)).await?;

    for _ in 0..3 {
        let mut spec = TaskSpec::new(h.queue.id, json!({"lr": 0.1}));
        spec.max_retries = Some(0);
        h.submit(spec).await?;
    }

    for round in 1..=3 {
        let task = h.fetch(&worker).await?.expect("task available");
        h.engine
            .report(h.queue.id, task.id, worker.id, ReportOutcome::Failed, None)
            .await?;

        // max_retries = 0 means terminal on first failure, budget untouched.
        let failed = h.engine.get_task(h.queue.id, task.id).await?;
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.retries, 0);

        let w = h.engine.get_worker(h.queue.id, worker.id).await?;
        assert_eq!(w.retries, round);
    }

    let w = h.engine.get_worker(h.queue.id, worker.id).await?;
    assert_eq!(w.status, WorkerStatus::Suspended);

    let err = h.fetch(&worker).await.unwrap_err();
    assert!(matches!(
        err.downcast::<Error>()?,
        Error::WorkerInactive {
            status: Some(WorkerStatus::Suspended),
            ..
        }
    ));
    Ok(())
}

#[tokio::test]
async fn missed_heartbeat_requeues_task_and_crashes_worker() -> Result<()> {
    let h = harness().await?;

    let mut spec = TaskSpec::new(h.queue.id, json!({"lr": 0.1}));
    spec.heartbeat_timeout = Some(1);
    let submitted = h.submit(spec).await?;
    let worker = h.register_worker(None).await?;

    h.fetch(&worker).await?.expect("claimed");
    h.clock.advance(Duration::seconds(2));

    let stats = h.engine.sweep_expired_leases().await?;
    assert_eq!(stats.expired(), 1);
    assert_eq!(stats.requeued, 1);
    assert_eq!(stats.workers_crashed, 1);

    let task = h.engine.get_task(h.queue.id, submitted.id).await?;
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.retries, 1);
    assert!(task.worker_id.is_none());
    assert_eq!(
        task.summary["labtasker_error"],
        json!("heartbeat timed out")
    );

    let worker = h.engine.get_worker(h.queue.id, worker.id).await?;
    assert_eq!(worker.status, WorkerStatus::Crashed);
    Ok(())
}

#[tokio::test]
async fn reaper_is_idempotent() -> Result<()> {
    let h = harness().await?;

    let mut spec = TaskSpec::new(h.queue.id, json!({"lr": 0.1}));
    spec.heartbeat_timeout = Some(1);
    let submitted = h.submit(spec).await?;
    let worker = h.register_worker(None).await?;
    h.fetch(&worker).await?.expect("claimed");
    h.clock.advance(Duration::seconds(2));

    h.engine.sweep_expired_leases().await?;
    let after_first = h.engine.get_task(h.queue.id, submitted.id).await?;

    let stats = h.engine.sweep_expired_leases().await?;
    assert_eq!(stats.expired(), 0, "second sweep finds nothing");

    let after_second = h.engine.get_task(h.queue.id, submitted.id).await?;
    assert_eq!(after_first.etag, after_second.etag);
    assert_eq!(after_first.status, after_second.status);
    assert_eq!(after_first.retries, after_second.retries);
    Ok(())
}

#[tokio::test]
async fn live_heartbeats_keep_the_lease() -> Result<()> {
    let h = harness().await?;

    let mut spec = TaskSpec::new(h.queue.id, json!({"lr": 0.1}));
    spec.heartbeat_timeout = Some(5);
    let submitted = h.submit(spec).await?;
    let worker = h.register_worker(None).await?;
    let task = h.fetch(&worker).await?.expect("claimed");

    // Heartbeat at intervals strictly below the timeout; the reaper must
    // never re-queue.
    for _ in 0..5 {
        h.clock.advance(Duration::seconds(3));
        h.engine.heartbeat(h.queue.id, task.id, worker.id).await?;
        let stats = h.engine.sweep_expired_leases().await?;
        assert_eq!(stats.expired(), 0);
    }

    let still_running = h.engine.get_task(h.queue.id, submitted.id).await?;
    assert_eq!(still_running.status, TaskStatus::Running);
    Ok(())
}

#[tokio::test]
async fn wall_clock_timeout_expires_despite_heartbeats() -> Result<()> {
    let h = harness().await?;

    let mut spec = TaskSpec::new(h.queue.id, json!({"lr": 0.1}));
    spec.heartbeat_timeout = Some(60);
    spec.task_timeout = Some(10);
    spec.max_retries = Some(0);
    let submitted = h.submit(spec).await?;
    let worker = h.register_worker(Some(10)).await?;
    let task = h.fetch(&worker).await?.expect("claimed");

    for _ in 0..3 {
        h.clock.advance(Duration::seconds(4));
        h.engine.heartbeat(h.queue.id, task.id, worker.id).await?;
    }

    let stats = h.engine.sweep_expired_leases().await?;
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.workers_crashed, 0);

    let done = h.engine.get_task(h.queue.id, submitted.id).await?;
    assert_eq!(done.status, TaskStatus::Failed);
    assert_eq!(
        done.summary["labtasker_error"],
        json!("task execution timed out")
    );

    // The worker is alive; the task was just too slow. No crash marking,
    // ordinary failure accounting only.
    let worker = h.engine.get_worker(h.queue.id, worker.id).await?;
    assert_eq!(worker.status, WorkerStatus::Active);
    assert_eq!(worker.retries, 1);
    Ok(())
}

#[tokio::test]
async fn fetch_respects_priority_then_fifo() -> Result<()> {
    let h = harness().await?;

    let mut low = TaskSpec::new(h.queue.id, json!({"name": "a"}));
    low.priority = Some(5);
    let a = h.submit(low).await?;

    let mut high = TaskSpec::new(h.queue.id, json!({"name": "b"}));
    high.priority = Some(10);
    let b = h.submit(high).await?;

    let mut high_later = TaskSpec::new(h.queue.id, json!({"name": "c"}));
    high_later.priority = Some(10);
    let c = h.submit(high_later).await?;

    let worker = h.register_worker(None).await?;
    let order: Vec<_> = [
        h.fetch(&worker).await?.unwrap().id,
        h.fetch(&worker).await?.unwrap().id,
        h.fetch(&worker).await?.unwrap().id,
    ]
    .to_vec();
    assert_eq!(order, vec![b.id, c.id, a.id]);
    assert!(h.fetch(&worker).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn required_fields_gate_claimable_tasks() -> Result<()> {
    let h = harness().await?;

    h.submit(TaskSpec::new(h.queue.id, json!({"lr": 0.1}))).await?;
    let with_batch = h
        .submit(TaskSpec::new(h.queue.id, json!({"lr": 0.1, "batch": 32})))
        .await?;
    let worker = h.register_worker(None).await?;

    let request = FetchRequest::new(worker.id)
        .with_required_fields(["args.batch".to_string()]);
    let task = h
        .engine
        .fetch_next(h.queue.id, request.clone())
        .await?
        .expect("the task with a batch field");
    assert_eq!(task.id, with_batch.id);

    // The remaining pending task lacks the field: no match, even though
    // the queue is not empty.
    assert!(h.engine.fetch_next(h.queue.id, request).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn extra_filter_narrows_fetch() -> Result<()> {
    let h = harness().await?;

    h.submit(TaskSpec::new(h.queue.id, json!({"lr": 0.5}))).await?;
    let small = h
        .submit(TaskSpec::new(h.queue.id, json!({"lr": 0.001})))
        .await?;
    let worker = h.register_worker(None).await?;

    let request =
        FetchRequest::new(worker.id).with_extra_filter(json!({"args.lr": {"$lt": 0.01}}));
    let task = h
        .engine
        .fetch_next(h.queue.id, request)
        .await?
        .expect("the small-lr task");
    assert_eq!(task.id, small.id);
    Ok(())
}

#[tokio::test]
async fn concurrent_fetches_claim_distinct_tasks() -> Result<()> {
    let h = harness().await?;
    h.submit(TaskSpec::new(h.queue.id, json!({"n": 1}))).await?;

    let w1 = h.register_worker(None).await?;
    let w2 = h.register_worker(None).await?;

    let (r1, r2) = tokio::join!(h.fetch(&w1), h.fetch(&w2));
    let claims = [r1?, r2?];
    let claimed: Vec<_> = claims.iter().flatten().collect();
    assert_eq!(claimed.len(), 1, "exactly one worker wins the single task");
    Ok(())
}

#[tokio::test]
async fn report_by_non_owner_is_rejected_without_changes() -> Result<()> {
    let h = harness().await?;
    let submitted = h.submit(TaskSpec::new(h.queue.id, json!({}))).await?;
    let owner = h.register_worker(None).await?;
    let other = h.register_worker(None).await?;
    h.fetch(&owner).await?.expect("claimed");

    let err = h
        .engine
        .report(
            h.queue.id,
            submitted.id,
            other.id,
            ReportOutcome::Success,
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotOwned { .. }));

    let task = h.engine.get_task(h.queue.id, submitted.id).await?;
    assert_eq!(task.status, TaskStatus::Running);
    assert_eq!(task.worker_id, Some(owner.id));

    // Heartbeats from the non-owner are equally rejected.
    let err = h
        .engine
        .heartbeat(h.queue.id, submitted.id, other.id)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotOwned { .. }));
    Ok(())
}

#[tokio::test]
async fn worker_reported_cancel_is_terminal_and_does_not_penalize() -> Result<()> {
    let h = harness().await?;
    let submitted = h.submit(TaskSpec::new(h.queue.id, json!({}))).await?;
    let worker = h.register_worker(Some(1)).await?;
    h.fetch(&worker).await?.expect("claimed");

    h.engine
        .report(
            h.queue.id,
            submitted.id,
            worker.id,
            ReportOutcome::Cancelled,
            None,
        )
        .await?;

    let task = h.engine.get_task(h.queue.id, submitted.id).await?;
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert!(task.worker_id.is_none());

    // A single failure would suspend this worker; cancellation must not.
    let worker = h.engine.get_worker(h.queue.id, worker.id).await?;
    assert_eq!(worker.status, WorkerStatus::Active);
    assert_eq!(worker.retries, 0);
    Ok(())
}

#[tokio::test]
async fn lowering_max_retries_terminates_on_next_failure() -> Result<()> {
    let h = harness().await?;

    let mut spec = TaskSpec::new(h.queue.id, json!({}));
    spec.max_retries = Some(5);
    let submitted = h.submit(spec).await?;
    let worker = h.register_worker(Some(100)).await?;

    for _ in 0..3 {
        h.fetch(&worker).await?.expect("requeued");
        h.engine
            .report(h.queue.id, submitted.id, worker.id, ReportOutcome::Failed, None)
            .await?;
    }
    assert_eq!(h.engine.get_task(h.queue.id, submitted.id).await?.retries, 3);

    // Lower the budget below the spent count while PENDING.
    let updates = json!({"max_retries": 2});
    h.engine
        .update_task(h.queue.id, submitted.id, updates.as_object().unwrap())
        .await?;

    h.fetch(&worker).await?.expect("claimable");
    h.engine
        .report(h.queue.id, submitted.id, worker.id, ReportOutcome::Failed, None)
        .await?;

    let task = h.engine.get_task(h.queue.id, submitted.id).await?;
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.is_terminal(), "current budget wins: 3 >= 2");
    assert_eq!(task.retries, 3, "no increment on the terminal transition");
    Ok(())
}

#[tokio::test]
async fn every_transition_reaches_a_subscriber() -> Result<()> {
    let h = harness().await?;
    let sub = h.engine.bus().subscribe(h.queue.id, EventFilter::all());

    let submitted = h.submit(TaskSpec::new(h.queue.id, json!({}))).await?;
    let worker = h.register_worker(None).await?;
    h.fetch(&worker).await?.expect("claimed");
    h.engine
        .report(
            h.queue.id,
            submitted.id,
            worker.id,
            ReportOutcome::Success,
            None,
        )
        .await?;

    let mut transitions = Vec::new();
    while let Some(event) = sub.next_event(StdDuration::from_millis(20)).await {
        if let EventPayload::StateTransition {
            entity, new_status, ..
        } = event.payload
        {
            transitions.push((entity, new_status));
        }
    }

    assert_eq!(
        transitions,
        vec![
            (EntityKind::Task, "PENDING".to_string()),
            (EntityKind::Worker, "ACTIVE".to_string()),
            (EntityKind::Task, "RUNNING".to_string()),
            (EntityKind::Task, "SUCCESS".to_string()),
        ]
    );
    Ok(())
}

#[tokio::test]
async fn fetch_by_unknown_worker_is_inactive() -> Result<()> {
    let h = harness().await?;
    h.submit(TaskSpec::new(h.queue.id, json!({}))).await?;

    let err = h
        .engine
        .fetch_next(
            h.queue.id,
            FetchRequest::new(labtasker_core::WorkerId::generate()),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::WorkerInactive { status: None, .. }));
    Ok(())
}

#[tokio::test]
async fn heartbeat_timeout_override_applies_to_the_lease() -> Result<()> {
    let h = harness().await?;

    let mut spec = TaskSpec::new(h.queue.id, json!({}));
    spec.heartbeat_timeout = Some(600);
    let submitted = h.submit(spec).await?;
    let worker = h.register_worker(None).await?;

    let mut request = FetchRequest::new(worker.id);
    request.heartbeat_timeout = Some(1);
    let task = h
        .engine
        .fetch_next(h.queue.id, request)
        .await?
        .expect("claimed");
    assert_eq!(task.heartbeat_timeout, 1);

    h.clock.advance(Duration::seconds(2));
    let stats = h.engine.sweep_expired_leases().await?;
    assert_eq!(stats.expired(), 1, "override, not the stored 600s, governs");

    let task = h.engine.get_task(h.queue.id, submitted.id).await?;
    assert_eq!(task.status, TaskStatus::Pending);
    Ok(())
}
