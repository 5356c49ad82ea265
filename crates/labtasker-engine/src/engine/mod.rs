//! The dispatch engine.
//!
//! [`DispatchEngine`] owns the task and worker lifecycles. Every operation
//! follows the same shape: load a record, mutate a copy, stamp it with
//! [`touch`](crate::task::TaskRecord::touch), and compare-and-update
//! against the etag that was loaded. A stale etag means another transport
//! worker or engine replica won the race; the operation reloads and retries
//! up to a bounded number of attempts before surfacing
//! [`Error::Conflict`](crate::error::Error::Conflict). No in-process lock
//! is ever held across a store round-trip, so any number of engine replicas
//! can share one store.
//!
//! Sub-modules:
//! - [`dispatch`]: fetch-next, heartbeat, report (the worker-facing path)
//! - [`admin`]: queue/task/worker CRUD, listing, bulk update
//! - [`reaper`]: the periodic expired-lease sweep

mod admin;
mod dispatch;
mod reaper;

pub use admin::{
    BulkUpdateOutcome, QueueUpdate, TaskPage, WorkerPage, WorkerStatusUpdate, WorkerUpdate,
};
pub use dispatch::{FetchRequest, ReportOutcome};
pub use reaper::{LeaseReaper, SweepStats};

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use labtasker_core::{Clock, QueueId, TaskId, WorkerId};

use crate::bus::EventBus;
use crate::error::{Error, Result};
use crate::events::{EntityKind, EventPayload};
use crate::queue::QueueRecord;
use crate::store::Store;
use crate::task::{TaskRecord, TaskStatus};
use crate::worker::{WorkerRecord, WorkerStatus};

/// Tuning knobs for the engine.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Bound on compare-and-update retries per operation.
    pub max_cas_attempts: u32,
    /// Bound on pending candidates examined per fetch call.
    pub fetch_scan_limit: usize,
    /// Bound on running tasks examined per reaper sweep.
    pub reaper_batch_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_cas_attempts: 8,
            fetch_scan_limit: 32,
            reaper_batch_limit: 256,
        }
    }
}

/// The dispatch engine. Cheap to clone; clones share the store, bus, and
/// clock.
#[derive(Clone)]
pub struct DispatchEngine {
    store: Arc<dyn Store>,
    bus: EventBus,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl std::fmt::Debug for DispatchEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl DispatchEngine {
    /// Creates an engine with default tuning.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, bus: EventBus, clock: Arc<dyn Clock>) -> Self {
        Self::with_config(store, bus, clock, EngineConfig::default())
    }

    /// Creates an engine with explicit tuning.
    #[must_use]
    pub fn with_config(
        store: Arc<dyn Store>,
        bus: EventBus,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            bus,
            clock,
            config,
        }
    }

    /// The event bus transitions are published to.
    #[must_use]
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// The backing store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Checks store connectivity.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transient`] when the store is unreachable.
    pub async fn ping(&self) -> Result<()> {
        self.store.ping().await
    }

    pub(crate) fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub(crate) async fn require_queue(&self, queue_id: QueueId) -> Result<QueueRecord> {
        self.store
            .queue_by_id(queue_id)
            .await?
            .ok_or_else(|| Error::not_found("queue", queue_id))
    }

    /// Loads a task, scoped to a queue. A task in another queue is
    /// indistinguishable from a missing one.
    pub(crate) async fn require_task(
        &self,
        queue_id: QueueId,
        task_id: TaskId,
    ) -> Result<TaskRecord> {
        self.store
            .task_by_id(task_id)
            .await?
            .filter(|t| t.queue_id == queue_id)
            .ok_or_else(|| Error::not_found("task", task_id))
    }

    pub(crate) async fn require_worker(
        &self,
        queue_id: QueueId,
        worker_id: WorkerId,
    ) -> Result<WorkerRecord> {
        self.store
            .worker_by_id(worker_id)
            .await?
            .filter(|w| w.queue_id == queue_id)
            .ok_or_else(|| Error::not_found("worker", worker_id))
    }

    pub(crate) fn publish_task_transition(
        &self,
        task: &TaskRecord,
        old_status: Option<TaskStatus>,
        now: DateTime<Utc>,
    ) {
        tracing::info!(
            task_id = %task.id,
            queue_id = %task.queue_id,
            from = old_status.map_or("none", |s| s.as_label()),
            to = task.status.as_label(),
            retries = task.retries,
            "task transition"
        );
        let old = old_status.map(|s| s.to_string());
        self.bus.publish(
            task.queue_id,
            now,
            EventPayload::transition(
                EntityKind::Task,
                task.id.to_string(),
                old.as_deref(),
                task.status.to_string(),
                task.metadata.clone(),
            ),
        );
    }

    pub(crate) fn publish_worker_transition(
        &self,
        worker: &WorkerRecord,
        old_status: Option<WorkerStatus>,
        now: DateTime<Utc>,
    ) {
        tracing::info!(
            worker_id = %worker.id,
            queue_id = %worker.queue_id,
            from = old_status.map_or("none", |s| s.as_label()),
            to = worker.status.as_label(),
            "worker transition"
        );
        let old = old_status.map(|s| s.to_string());
        self.bus.publish(
            worker.queue_id,
            now,
            EventPayload::transition(
                EntityKind::Worker,
                worker.id.to_string(),
                old.as_deref(),
                worker.status.to_string(),
                worker.metadata.clone(),
            ),
        );
    }

    pub(crate) fn publish_queue_event(
        &self,
        queue_id: QueueId,
        metadata: Value,
        old_status: Option<&str>,
        new_status: &str,
        now: DateTime<Utc>,
    ) {
        self.bus.publish(
            queue_id,
            now,
            EventPayload::transition(
                EntityKind::Queue,
                queue_id.to_string(),
                old_status,
                new_status,
                metadata,
            ),
        );
    }

    /// Runs a load-mutate-CAS loop over a task.
    ///
    /// The closure sees a fresh copy each attempt and either produces the
    /// mutated record or short-circuits with a typed error. Returning
    /// `Ok(None)` ends the loop without a write, yielding the freshly
    /// observed record. A status change publishes one transition event.
    pub(crate) async fn update_task_with<F>(
        &self,
        queue_id: QueueId,
        task_id: TaskId,
        mut mutate: F,
    ) -> Result<TaskRecord>
    where
        F: FnMut(&TaskRecord) -> Result<Option<TaskRecord>>,
    {
        for _ in 0..self.config.max_cas_attempts {
            let current = self.require_task(queue_id, task_id).await?;
            let Some(mut updated) = mutate(&current)? else {
                return Ok(current);
            };
            let old_status = current.status;
            let now = self.now();
            updated.touch(now);
            match self.store.replace_task(&updated, current.etag).await? {
                crate::store::CasOutcome::Applied => {
                    if updated.status != old_status {
                        self.publish_task_transition(&updated, Some(old_status), now);
                    }
                    return Ok(updated);
                }
                crate::store::CasOutcome::Missing => {
                    return Err(Error::not_found("task", task_id))
                }
                crate::store::CasOutcome::Stale { .. } => {}
            }
        }
        Err(Error::conflict(format!(
            "task {task_id} kept changing underneath the update"
        )))
    }

    /// Runs a load-mutate-CAS loop over a worker. Same contract as
    /// [`update_task_with`](Self::update_task_with).
    pub(crate) async fn update_worker_with<F>(
        &self,
        queue_id: QueueId,
        worker_id: WorkerId,
        mut mutate: F,
    ) -> Result<WorkerRecord>
    where
        F: FnMut(&WorkerRecord) -> Result<Option<WorkerRecord>>,
    {
        for _ in 0..self.config.max_cas_attempts {
            let current = self.require_worker(queue_id, worker_id).await?;
            let Some(mut updated) = mutate(&current)? else {
                return Ok(current);
            };
            let old_status = current.status;
            let now = self.now();
            updated.touch(now);
            match self.store.replace_worker(&updated, current.etag).await? {
                crate::store::CasOutcome::Applied => {
                    if updated.status != old_status {
                        self.publish_worker_transition(&updated, Some(old_status), now);
                    }
                    return Ok(updated);
                }
                crate::store::CasOutcome::Missing => {
                    return Err(Error::not_found("worker", worker_id))
                }
                crate::store::CasOutcome::Stale { .. } => {}
            }
        }
        Err(Error::conflict(format!(
            "worker {worker_id} kept changing underneath the update"
        )))
    }
}
