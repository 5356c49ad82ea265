//! Worker-facing dispatch operations: fetch-next, heartbeat, report.
//!
//! Fetch is the contended path. The scan is bounded: at most
//! `fetch_scan_limit` pending candidates are examined per call, in dispatch
//! order. Losing a claim race advances to the next candidate; exhausting
//! the bound returns "no task" and the caller polls again. Under heavy
//! contention this means fetch can come back empty while pending tasks
//! exist, which is the documented trade for never blocking on a lock.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use labtasker_core::document::path_exists;
use labtasker_core::{QueueId, TaskId, WorkerId};

use super::DispatchEngine;
use crate::error::{Error, Result};
use crate::matcher::Filter;
use crate::store::CasOutcome;
use crate::task::{TaskRecord, TaskStatus};
use crate::worker::WorkerStatus;

/// Parameters for a fetch-next call.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// The worker claiming a task. Must be ACTIVE in the queue.
    pub worker_id: WorkerId,
    /// Dotted paths that must exist (non-null) in a task for this worker to
    /// claim it. Paths without an `args.` or `metadata.` prefix are
    /// `args`-relative.
    pub required_fields: Vec<String>,
    /// Extra filter over the task document, in the query-matcher grammar.
    pub extra_filter: Option<Value>,
    /// Replaces the task's stored heartbeat timeout for this lease.
    pub heartbeat_timeout: Option<u64>,
    /// Accepted for wire compatibility. The lease heartbeat is stamped on
    /// claim regardless, keeping the RUNNING invariant intact.
    pub start_heartbeat: bool,
}

impl FetchRequest {
    /// A fetch with no filtering and stored timeouts.
    #[must_use]
    pub fn new(worker_id: WorkerId) -> Self {
        Self {
            worker_id,
            required_fields: Vec::new(),
            extra_filter: None,
            heartbeat_timeout: None,
            start_heartbeat: true,
        }
    }

    /// Adds required field paths.
    #[must_use]
    pub fn with_required_fields(mut self, fields: impl IntoIterator<Item = String>) -> Self {
        self.required_fields = fields.into_iter().collect();
        self
    }

    /// Adds an extra filter document.
    #[must_use]
    pub fn with_extra_filter(mut self, filter: Value) -> Self {
        self.extra_filter = Some(filter);
        self
    }
}

/// Worker-reported task outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportOutcome {
    /// The task completed; the summary is its result.
    Success,
    /// The task failed; it may be re-queued per the retry policy.
    Failed,
    /// The worker abandoned the task deliberately. Terminal, and does not
    /// count against the worker's failure streak.
    Cancelled,
}

impl DispatchEngine {
    /// Atomically selects at most one PENDING task, leases it to the
    /// worker, and returns it. `Ok(None)` means no eligible task was
    /// claimable within the scan bound; the caller should back off and
    /// poll.
    ///
    /// # Errors
    ///
    /// - [`Error::WorkerInactive`] when the worker is unknown to the queue
    ///   or not ACTIVE; no task is consumed
    /// - [`Error::InvalidArgument`] on a malformed filter, field path, or
    ///   zero timeout override
    pub async fn fetch_next(
        &self,
        queue_id: QueueId,
        request: FetchRequest,
    ) -> Result<Option<TaskRecord>> {
        self.require_queue(queue_id).await?;

        let worker = match self.store().worker_by_id(request.worker_id).await? {
            Some(w) if w.queue_id == queue_id => w,
            _ => {
                return Err(Error::WorkerInactive {
                    worker_id: request.worker_id,
                    status: None,
                })
            }
        };
        if !worker.status.can_fetch() {
            return Err(Error::WorkerInactive {
                worker_id: request.worker_id,
                status: Some(worker.status),
            });
        }

        if request.heartbeat_timeout == Some(0) {
            return Err(Error::invalid_argument(
                "heartbeat_timeout override must be greater than zero",
            ));
        }
        let filter = Filter::parse_optional(request.extra_filter.as_ref())?;
        let required = normalize_required_fields(&request.required_fields)?;

        let candidates = self
            .store()
            .pending_tasks(queue_id, self.config().fetch_scan_limit)
            .await?;

        let mut cas_attempts = 0;
        for task in candidates {
            let doc = task.document();
            if !required.iter().all(|path| path_exists(&doc, path)) {
                continue;
            }
            if !filter.matches(&doc) {
                continue;
            }

            let now = self.now();
            let mut claimed = task.clone();
            claimed.begin_lease(request.worker_id, now, request.heartbeat_timeout);
            claimed.touch(now);

            match self.store().replace_task(&claimed, task.etag).await? {
                CasOutcome::Applied => {
                    self.publish_task_transition(&claimed, Some(TaskStatus::Pending), now);
                    return Ok(Some(claimed));
                }
                // Another worker won this candidate; move on.
                CasOutcome::Missing | CasOutcome::Stale { .. } => {
                    cas_attempts += 1;
                    if cas_attempts >= self.config().max_cas_attempts {
                        break;
                    }
                }
            }
        }

        Ok(None)
    }

    /// Refreshes the lease heartbeat. Never transitions status; only bounds
    /// the reaper's definition of liveness.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotOwned`] when the task is not RUNNING or is
    /// leased to a different worker.
    pub async fn heartbeat(
        &self,
        queue_id: QueueId,
        task_id: TaskId,
        worker_id: WorkerId,
    ) -> Result<TaskRecord> {
        self.require_queue(queue_id).await?;
        let now = self.now();
        self.update_task_with(queue_id, task_id, |task| {
            ensure_owned(task, worker_id)?;
            let mut next = task.clone();
            next.record_heartbeat(now);
            Ok(Some(next))
        })
        .await
    }

    /// Applies a worker-reported outcome to a RUNNING task.
    ///
    /// - `success`: terminal SUCCESS; stores the summary; resets the
    ///   worker's failure streak
    /// - `failed`: re-queues or lands terminal FAILED per the retry budget;
    ///   extends the worker's failure streak and may suspend it
    /// - `cancelled`: terminal CANCELLED; the worker's streak is untouched
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotOwned`] when the task is not RUNNING or is
    /// leased to a different worker; no state changes in that case.
    pub async fn report(
        &self,
        queue_id: QueueId,
        task_id: TaskId,
        worker_id: WorkerId,
        outcome: ReportOutcome,
        summary: Option<Value>,
    ) -> Result<TaskRecord> {
        self.require_queue(queue_id).await?;
        if let Some(summary) = &summary {
            if !summary.is_object() {
                return Err(Error::invalid_argument("summary must be a JSON object"));
            }
        }

        let updated = self
            .update_task_with(queue_id, task_id, |task| {
                ensure_owned(task, worker_id)?;
                let mut next = task.clone();
                if let Some(summary) = &summary {
                    next.summary = summary.clone();
                }
                match outcome {
                    ReportOutcome::Success => {
                        next.status = TaskStatus::Success;
                        next.clear_lease();
                    }
                    ReportOutcome::Failed => {
                        next.apply_failure();
                    }
                    ReportOutcome::Cancelled => {
                        next.status = TaskStatus::Cancelled;
                        next.clear_lease();
                    }
                }
                Ok(Some(next))
            })
            .await?;

        match outcome {
            ReportOutcome::Success => self.reset_worker_failures(queue_id, worker_id).await?,
            ReportOutcome::Failed => self.penalize_worker(queue_id, worker_id).await?,
            ReportOutcome::Cancelled => {}
        }

        Ok(updated)
    }

    /// Clears a worker's consecutive-failure streak after a success.
    /// A concurrently deleted worker is not an error.
    pub(crate) async fn reset_worker_failures(
        &self,
        queue_id: QueueId,
        worker_id: WorkerId,
    ) -> Result<()> {
        let result = self
            .update_worker_with(queue_id, worker_id, |worker| {
                if worker.retries == 0 {
                    return Ok(None);
                }
                let mut next = worker.clone();
                next.record_success();
                Ok(Some(next))
            })
            .await;
        tolerate_missing_worker(result)
    }

    /// Extends a worker's consecutive-failure streak, suspending it when
    /// the bound is reached. A concurrently deleted worker is not an error.
    pub(crate) async fn penalize_worker(
        &self,
        queue_id: QueueId,
        worker_id: WorkerId,
    ) -> Result<()> {
        let result = self
            .update_worker_with(queue_id, worker_id, |worker| {
                let mut next = worker.clone();
                next.record_failure();
                Ok(Some(next))
            })
            .await;
        tolerate_missing_worker(result)
    }

    /// Marks a worker CRASHED after one of its leases expired without a
    /// heartbeat. Also extends the failure streak so a later resume starts
    /// from an honest count.
    pub(crate) async fn mark_worker_crashed(
        &self,
        queue_id: QueueId,
        worker_id: WorkerId,
    ) -> Result<()> {
        let result = self
            .update_worker_with(queue_id, worker_id, |worker| {
                let mut next = worker.clone();
                next.retries = next.retries.saturating_add(1);
                next.status = WorkerStatus::Crashed;
                Ok(Some(next))
            })
            .await;
        tolerate_missing_worker(result)
    }
}

fn tolerate_missing_worker<T>(result: Result<T>) -> Result<()> {
    match result {
        Ok(_) | Err(Error::NotFound { .. }) => Ok(()),
        Err(e) => Err(e),
    }
}

fn ensure_owned(task: &TaskRecord, worker_id: WorkerId) -> Result<()> {
    if task.status != TaskStatus::Running {
        return Err(Error::not_owned(
            task.id,
            format!("task is {}, not RUNNING", task.status),
        ));
    }
    if task.worker_id != Some(worker_id) {
        return Err(Error::not_owned(task.id, "task is leased to another worker"));
    }
    Ok(())
}

/// Validates required-field paths and anchors bare paths under `args`.
fn normalize_required_fields(fields: &[String]) -> Result<Vec<String>> {
    fields
        .iter()
        .map(|path| {
            labtasker_core::document::validate_path(path)?;
            let anchored = if path == "args"
                || path == "metadata"
                || path.starts_with("args.")
                || path.starts_with("metadata.")
            {
                path.clone()
            } else {
                format!("args.{path}")
            };
            Ok(anchored)
        })
        .collect()
}
