//! The expired-lease reaper.
//!
//! A periodic sweep over RUNNING tasks. A lease expires when the worker
//! missed its heartbeat window, or when the task has a wall-clock budget
//! and overran it. Either way the task is treated as if its worker had
//! reported `failed`; the heartbeat case additionally marks the worker
//! CRASHED, while a wall-clock overrun leaves the worker's status to the
//! ordinary failure accounting (the worker is alive, the task was just too
//! slow).
//!
//! Every expiry is applied by CAS against the etag observed in the scan,
//! so concurrent sweeps from multiple server replicas are safe: exactly
//! one replica wins each expiry and the others observe a stale etag and
//! move on.

use std::time::Duration;

use serde_json::Value;

use super::DispatchEngine;
use crate::error::Result;
use crate::store::CasOutcome;
use crate::task::TaskStatus;

/// What a single sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// RUNNING tasks examined.
    pub examined: usize,
    /// Expired leases that re-queued their task.
    pub requeued: usize,
    /// Expired leases that landed their task in terminal FAILED.
    pub failed: usize,
    /// Workers marked CRASHED by this sweep.
    pub workers_crashed: usize,
}

impl SweepStats {
    /// Total leases expired by this sweep.
    #[must_use]
    pub const fn expired(&self) -> usize {
        self.requeued + self.failed
    }
}

impl DispatchEngine {
    /// Sweeps RUNNING tasks once, expiring stale leases.
    ///
    /// Idempotent across concurrent invocations: each expiry is a CAS on
    /// the task's etag, and a lost race means another invocation (or the
    /// worker's own report) already settled the task.
    ///
    /// # Errors
    ///
    /// Returns an error only on store failure; individual lost races are
    /// not errors.
    pub async fn sweep_expired_leases(&self) -> Result<SweepStats> {
        let now = self.now();
        let mut stats = SweepStats::default();

        let running = self
            .store()
            .running_tasks(self.config().reaper_batch_limit)
            .await?;

        for task in running {
            stats.examined += 1;
            let heartbeat_lost = task.heartbeat_expired(now);
            let wall_clock_spent = task.wall_clock_expired(now);
            if !heartbeat_lost && !wall_clock_spent {
                continue;
            }

            let worker_id = task.worker_id;
            let note = if heartbeat_lost {
                "heartbeat timed out"
            } else {
                "task execution timed out"
            };

            let mut next = task.clone();
            if let Some(summary) = next.summary.as_object_mut() {
                summary.insert("labtasker_error".to_string(), Value::String(note.to_string()));
            }
            let requeued = next.apply_failure();
            next.touch(now);

            match self.store().replace_task(&next, task.etag).await? {
                CasOutcome::Applied => {
                    tracing::info!(
                        task_id = %task.id,
                        queue_id = %task.queue_id,
                        reason = note,
                        requeued,
                        "lease expired"
                    );
                    self.publish_task_transition(&next, Some(TaskStatus::Running), now);
                    if requeued {
                        stats.requeued += 1;
                    } else {
                        stats.failed += 1;
                    }
                    if let Some(worker_id) = worker_id {
                        if heartbeat_lost {
                            self.mark_worker_crashed(task.queue_id, worker_id).await?;
                            stats.workers_crashed += 1;
                        } else {
                            self.penalize_worker(task.queue_id, worker_id).await?;
                        }
                    }
                }
                // Another replica, or the worker's own report, won.
                CasOutcome::Missing | CasOutcome::Stale { .. } => {}
            }
        }

        Ok(stats)
    }
}

/// Periodic driver for [`DispatchEngine::sweep_expired_leases`].
///
/// Run it as a background task; aborting the task stops the reaper. The
/// period should be at most half the smallest heartbeat timeout in use so
/// an expired lease is observed within one timeout window.
#[derive(Debug)]
pub struct LeaseReaper {
    engine: DispatchEngine,
    period: Duration,
}

impl LeaseReaper {
    /// Creates a reaper sweeping at the given period.
    #[must_use]
    pub fn new(engine: DispatchEngine, period: Duration) -> Self {
        Self { engine, period }
    }

    /// Runs sweeps forever.
    pub async fn run(self) {
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match self.engine.sweep_expired_leases().await {
                Ok(stats) if stats.expired() > 0 => {
                    tracing::info!(
                        examined = stats.examined,
                        requeued = stats.requeued,
                        failed = stats.failed,
                        workers_crashed = stats.workers_crashed,
                        "reaper sweep expired leases"
                    );
                }
                Ok(stats) => {
                    tracing::debug!(examined = stats.examined, "reaper sweep found nothing to do");
                }
                Err(error) => {
                    tracing::warn!(%error, "reaper sweep failed");
                }
            }
        }
    }
}
