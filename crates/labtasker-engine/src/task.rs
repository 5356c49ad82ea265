//! Task lifecycle state and record type.
//!
//! This module provides:
//! - `TaskStatus`: The state machine for task execution
//! - `TaskRecord`: The persisted task document, including lease bookkeeping
//! - `TaskSpec`: Validated submission parameters
//!
//! A task is an immutable parameter bundle (`args`) with mutable lifecycle
//! state. Ownership of a RUNNING task by a worker is called a lease; the
//! lease fields (`worker_id`, `start_time`, `last_heartbeat`) are set
//! together on claim and cleared together on every exit from RUNNING.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use labtasker_core::{QueueId, TaskId, WorkerId};

use crate::error::{Error, Result};

/// Lowest priority bucket.
pub const PRIORITY_LOW: i64 = 0;
/// Default priority.
pub const PRIORITY_MEDIUM: i64 = 10;
/// Highest predefined priority bucket (any larger integer also works).
pub const PRIORITY_HIGH: i64 = 20;

/// Default lease heartbeat timeout in seconds.
pub const DEFAULT_HEARTBEAT_TIMEOUT_SECS: u64 = 60;
/// Default retry budget for a task.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Task lifecycle states.
///
/// ```text
///             submit                 fetch
///    (none) ─────────► PENDING ─────────────► RUNNING
///                        ▲                      │
///                        │ re-queue             ├── report(success) ──► SUCCESS
///                        │ (retries < max)      │
///                        └──────── FAILED ◄─────┴── report(failed) / lease expired
///                                    │
///                                    └── retries >= max ──► FAILED (terminal)
///
///             admin cancel from any non-terminal state ──► CANCELLED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Waiting to be claimed by a worker.
    Pending,
    /// Leased to a worker.
    Running,
    /// Completed successfully. Terminal.
    Success,
    /// Failed. Terminal once the retry budget is spent, otherwise re-queued.
    Failed,
    /// Cancelled by the worker or an admin. Terminal.
    Cancelled,
}

impl TaskStatus {
    /// Returns true for the unconditionally terminal states.
    ///
    /// FAILED is conditionally terminal; see [`TaskRecord::is_terminal`].
    #[must_use]
    pub const fn is_always_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Cancelled)
    }

    /// Returns true if the transition from self to target is valid.
    #[must_use]
    pub fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Pending => matches!(target, Self::Running | Self::Cancelled),
            Self::Running => matches!(
                target,
                Self::Success | Self::Failed | Self::Pending | Self::Cancelled
            ),
            Self::Failed => matches!(target, Self::Pending | Self::Cancelled),
            Self::Success | Self::Cancelled => false,
        }
    }

    /// Returns a lowercase label suitable for logs and wire payloads.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Success => write!(f, "SUCCESS"),
            Self::Failed => write!(f, "FAILED"),
            Self::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// Validated parameters for submitting a new task.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    /// Queue the task belongs to.
    pub queue_id: QueueId,
    /// Optional human-readable label (non-unique).
    pub task_name: Option<String>,
    /// Experiment parameters. Must be a JSON object.
    pub args: Value,
    /// User-defined tags. Must be a JSON object.
    pub metadata: Value,
    /// Informational command line.
    pub cmd: Option<String>,
    /// Lease heartbeat timeout in seconds; defaults to
    /// [`DEFAULT_HEARTBEAT_TIMEOUT_SECS`].
    pub heartbeat_timeout: Option<u64>,
    /// Absolute wall-clock ceiling in seconds while RUNNING, if any.
    pub task_timeout: Option<u64>,
    /// Retry budget; defaults to [`DEFAULT_MAX_RETRIES`]. Zero disables
    /// retries.
    pub max_retries: Option<u32>,
    /// Dispatch priority; higher dispatches earlier. Defaults to
    /// [`PRIORITY_MEDIUM`].
    pub priority: Option<i64>,
}

impl TaskSpec {
    /// Creates a minimal spec with defaults for everything but `args`.
    #[must_use]
    pub fn new(queue_id: QueueId, args: Value) -> Self {
        Self {
            queue_id,
            task_name: None,
            args,
            metadata: Value::Object(serde_json::Map::new()),
            cmd: None,
            heartbeat_timeout: None,
            task_timeout: None,
            max_retries: None,
            priority: None,
        }
    }
}

/// The persisted task document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Task identifier.
    pub id: TaskId,
    /// Owning queue.
    pub queue_id: QueueId,
    /// Optional human-readable label.
    pub task_name: Option<String>,
    /// Lifecycle state.
    pub status: TaskStatus,
    /// Experiment parameters (JSON object).
    pub args: Value,
    /// User-defined tags (JSON object).
    pub metadata: Value,
    /// Informational command line.
    pub cmd: Option<String>,
    /// Lease heartbeat timeout in seconds.
    pub heartbeat_timeout: u64,
    /// Absolute wall-clock ceiling in seconds while RUNNING.
    pub task_timeout: Option<u64>,
    /// Retry budget.
    pub max_retries: u32,
    /// Re-queues consumed so far. Never exceeds `max_retries`.
    pub retries: u32,
    /// Dispatch priority; higher dispatches earlier.
    pub priority: i64,
    /// Lease holder while RUNNING.
    pub worker_id: Option<WorkerId>,
    /// Set on entry to RUNNING, cleared on exit.
    pub start_time: Option<DateTime<Utc>>,
    /// Refreshed by worker heartbeats while RUNNING.
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Last reported result payload (JSON object).
    pub summary: Value,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp.
    pub last_modified: DateTime<Utc>,
    /// Optimistic-concurrency tag, bumped on every successful update.
    pub etag: u64,
}

fn require_object(value: &Value, what: &str) -> Result<()> {
    if value.is_object() {
        Ok(())
    } else {
        Err(Error::invalid_argument(format!(
            "{what} must be a JSON object"
        )))
    }
}

fn require_positive_secs(value: u64, what: &str) -> Result<()> {
    if value == 0 {
        Err(Error::invalid_argument(format!(
            "{what} must be greater than zero"
        )))
    } else {
        Ok(())
    }
}

impl TaskRecord {
    /// Builds a new PENDING task from a validated spec.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] when `args` or `metadata` is not an
    /// object, or a timeout is zero.
    pub fn new(spec: TaskSpec, now: DateTime<Utc>) -> Result<Self> {
        require_object(&spec.args, "task args")?;
        require_object(&spec.metadata, "task metadata")?;

        let heartbeat_timeout = spec
            .heartbeat_timeout
            .unwrap_or(DEFAULT_HEARTBEAT_TIMEOUT_SECS);
        require_positive_secs(heartbeat_timeout, "heartbeat_timeout")?;
        if let Some(task_timeout) = spec.task_timeout {
            require_positive_secs(task_timeout, "task_timeout")?;
        }

        Ok(Self {
            id: TaskId::generate(),
            queue_id: spec.queue_id,
            task_name: spec.task_name,
            status: TaskStatus::Pending,
            args: spec.args,
            metadata: spec.metadata,
            cmd: spec.cmd,
            heartbeat_timeout,
            task_timeout: spec.task_timeout,
            max_retries: spec.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            retries: 0,
            priority: spec.priority.unwrap_or(PRIORITY_MEDIUM),
            worker_id: None,
            start_time: None,
            last_heartbeat: None,
            summary: Value::Object(serde_json::Map::new()),
            created_at: now,
            last_modified: now,
            etag: 0,
        })
    }

    /// Returns true when no further lifecycle transitions apply.
    ///
    /// SUCCESS and CANCELLED are always terminal; FAILED is terminal only
    /// once the retry budget is spent.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        match self.status {
            TaskStatus::Success | TaskStatus::Cancelled => true,
            TaskStatus::Failed => self.retries >= self.max_retries,
            TaskStatus::Pending | TaskStatus::Running => false,
        }
    }

    /// Returns true when a FAILED task still has re-queues left.
    #[must_use]
    pub const fn has_retries_left(&self) -> bool {
        self.retries < self.max_retries
    }

    /// Claims the task for a worker: PENDING -> RUNNING with all lease
    /// fields stamped. An override replaces the stored heartbeat timeout
    /// for this lease.
    pub fn begin_lease(
        &mut self,
        worker_id: WorkerId,
        now: DateTime<Utc>,
        heartbeat_timeout_override: Option<u64>,
    ) {
        self.status = TaskStatus::Running;
        self.worker_id = Some(worker_id);
        self.start_time = Some(now);
        self.last_heartbeat = Some(now);
        if let Some(timeout) = heartbeat_timeout_override {
            self.heartbeat_timeout = timeout;
        }
    }

    /// Clears all lease fields. Called on every exit from RUNNING.
    pub fn clear_lease(&mut self) {
        self.worker_id = None;
        self.start_time = None;
        self.last_heartbeat = None;
    }

    /// Refreshes the lease heartbeat.
    pub fn record_heartbeat(&mut self, now: DateTime<Utc>) {
        self.last_heartbeat = Some(now);
    }

    /// Returns true when the lease heartbeat has expired at `now`.
    ///
    /// Only meaningful for RUNNING tasks; other states never expire.
    #[must_use]
    pub fn heartbeat_expired(&self, now: DateTime<Utc>) -> bool {
        if self.status != TaskStatus::Running {
            return false;
        }
        let timeout = Duration::seconds(i64::try_from(self.heartbeat_timeout).unwrap_or(i64::MAX));
        self.last_heartbeat
            .is_some_and(|last| now - last > timeout)
    }

    /// Returns true when the wall-clock execution budget has expired at
    /// `now`. Only tasks with a `task_timeout` ever expire this way.
    #[must_use]
    pub fn wall_clock_expired(&self, now: DateTime<Utc>) -> bool {
        if self.status != TaskStatus::Running {
            return false;
        }
        let Some(limit) = self.task_timeout else {
            return false;
        };
        let limit = Duration::seconds(i64::try_from(limit).unwrap_or(i64::MAX));
        self.start_time.is_some_and(|start| now - start > limit)
    }

    /// Applies a failure outcome: re-queues when the retry budget allows,
    /// otherwise lands in terminal FAILED. Clears the lease either way.
    ///
    /// Returns true when the task was re-queued. `retries` only moves on
    /// re-queue, so a terminal FAILED task always shows
    /// `retries == max_retries` (or its value at the moment the budget was
    /// lowered underneath it).
    pub fn apply_failure(&mut self) -> bool {
        let requeued = self.retries < self.max_retries;
        if requeued {
            self.retries += 1;
            self.status = TaskStatus::Pending;
        } else {
            self.status = TaskStatus::Failed;
        }
        self.clear_lease();
        requeued
    }

    /// Stamps a mutation: bumps the etag and refreshes `last_modified`.
    ///
    /// Call exactly once per compare-and-update attempt, after the logical
    /// change and before handing the record to the store.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_modified = now;
        self.etag += 1;
    }

    /// Renders the record as a JSON document for the query matcher.
    ///
    /// # Panics
    ///
    /// Never panics in practice; all record fields serialize.
    #[must_use]
    pub fn document(&self) -> Value {
        serde_json::to_value(self).expect("task record serializes")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec() -> TaskSpec {
        TaskSpec::new(QueueId::generate(), json!({"lr": 0.1}))
    }

    #[test]
    fn status_transitions() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Cancelled));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Success));

        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Success));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Failed));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Pending));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Cancelled));

        assert!(TaskStatus::Failed.can_transition_to(TaskStatus::Pending));
        assert!(!TaskStatus::Success.can_transition_to(TaskStatus::Pending));
        assert!(!TaskStatus::Cancelled.can_transition_to(TaskStatus::Running));
    }

    #[test]
    fn new_task_starts_pending_with_defaults() {
        let task = TaskRecord::new(spec(), Utc::now()).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.priority, PRIORITY_MEDIUM);
        assert_eq!(task.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(task.heartbeat_timeout, DEFAULT_HEARTBEAT_TIMEOUT_SECS);
        assert_eq!(task.retries, 0);
        assert_eq!(task.etag, 0);
        assert!(task.worker_id.is_none());
    }

    #[test]
    fn new_task_rejects_non_object_args() {
        let mut s = spec();
        s.args = json!([1, 2, 3]);
        assert!(TaskRecord::new(s, Utc::now()).is_err());
    }

    #[test]
    fn new_task_rejects_zero_timeouts() {
        let mut s = spec();
        s.heartbeat_timeout = Some(0);
        assert!(TaskRecord::new(s, Utc::now()).is_err());

        let mut s = spec();
        s.task_timeout = Some(0);
        assert!(TaskRecord::new(s, Utc::now()).is_err());
    }

    #[test]
    fn lease_stamps_and_clears_together() {
        let mut task = TaskRecord::new(spec(), Utc::now()).unwrap();
        let worker = WorkerId::generate();
        let now = Utc::now();

        task.begin_lease(worker, now, Some(120));
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.worker_id, Some(worker));
        assert_eq!(task.start_time, Some(now));
        assert_eq!(task.last_heartbeat, Some(now));
        assert_eq!(task.heartbeat_timeout, 120);

        task.clear_lease();
        assert!(task.worker_id.is_none());
        assert!(task.start_time.is_none());
        assert!(task.last_heartbeat.is_none());
    }

    #[test]
    fn heartbeat_expiry_respects_timeout() {
        let mut task = TaskRecord::new(spec(), Utc::now()).unwrap();
        let now = Utc::now();
        task.begin_lease(WorkerId::generate(), now, Some(60));

        assert!(!task.heartbeat_expired(now + Duration::seconds(59)));
        assert!(task.heartbeat_expired(now + Duration::seconds(61)));

        // A refreshed heartbeat resets the window.
        task.record_heartbeat(now + Duration::seconds(59));
        assert!(!task.heartbeat_expired(now + Duration::seconds(110)));
    }

    #[test]
    fn wall_clock_expiry_requires_task_timeout() {
        let mut task = TaskRecord::new(spec(), Utc::now()).unwrap();
        let now = Utc::now();
        task.begin_lease(WorkerId::generate(), now, None);
        assert!(!task.wall_clock_expired(now + Duration::hours(10)));

        task.task_timeout = Some(30);
        assert!(!task.wall_clock_expired(now + Duration::seconds(30)));
        assert!(task.wall_clock_expired(now + Duration::seconds(31)));
    }

    #[test]
    fn failed_is_terminal_only_without_retries_left() {
        let mut task = TaskRecord::new(spec(), Utc::now()).unwrap();
        task.status = TaskStatus::Failed;
        task.max_retries = 2;
        task.retries = 1;
        assert!(!task.is_terminal());

        task.retries = 2;
        assert!(task.is_terminal());
    }

    #[test]
    fn apply_failure_requeues_until_budget_spent() {
        let mut task = TaskRecord::new(spec(), Utc::now()).unwrap();
        task.max_retries = 2;
        task.begin_lease(WorkerId::generate(), Utc::now(), None);

        assert!(task.apply_failure());
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retries, 1);
        assert!(task.worker_id.is_none());

        task.begin_lease(WorkerId::generate(), Utc::now(), None);
        assert!(task.apply_failure());
        assert_eq!(task.retries, 2);

        task.begin_lease(WorkerId::generate(), Utc::now(), None);
        assert!(!task.apply_failure());
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retries, 2);
        assert!(task.is_terminal());
    }

    #[test]
    fn apply_failure_with_zero_budget_is_immediately_terminal() {
        let mut task = TaskRecord::new(spec(), Utc::now()).unwrap();
        task.max_retries = 0;
        task.begin_lease(WorkerId::generate(), Utc::now(), None);

        assert!(!task.apply_failure());
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retries, 0);
        assert!(task.is_terminal());
    }

    #[test]
    fn touch_bumps_etag() {
        let mut task = TaskRecord::new(spec(), Utc::now()).unwrap();
        let before = task.etag;
        task.touch(Utc::now());
        assert_eq!(task.etag, before + 1);
    }

    #[test]
    fn document_exposes_args_and_status() {
        let task = TaskRecord::new(spec(), Utc::now()).unwrap();
        let doc = task.document();
        assert_eq!(doc["args"]["lr"], json!(0.1));
        assert_eq!(doc["status"], json!("PENDING"));
    }
}
