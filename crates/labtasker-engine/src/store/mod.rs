//! Pluggable persistence for queues, tasks, and workers.
//!
//! The [`Store`] trait is the engine's only view of durable state. It models
//! a document store with three collections and three capabilities:
//!
//! - per-collection CRUD with typed records
//! - atomic compare-and-update keyed on each record's `etag`
//! - the indexed scans the dispatch engine needs (pending-by-priority,
//!   running-by-heartbeat, queue scans in `(created_at, id)` order)
//!
//! ## CAS Semantics
//!
//! `replace_*` is the core primitive for multi-replica correctness. The
//! caller loads a record, mutates it, calls `touch` (which bumps the etag),
//! and hands the store the new record together with the etag it loaded. The
//! store applies the replacement only when the stored etag still equals the
//! expected one; otherwise the caller lost a race and must reload. The
//! engine never holds an in-process lock across a store round-trip.
//!
//! Production deployments back this trait with a real document database;
//! [`memory::MemoryStore`] serves tests and single-process development.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use labtasker_core::{QueueId, TaskId, WorkerId};

use crate::error::{Error, Result};
use crate::queue::QueueRecord;
use crate::task::TaskRecord;
use crate::worker::WorkerRecord;

/// Result of a compare-and-update operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// The replacement was applied.
    Applied,
    /// The record no longer exists.
    Missing,
    /// The stored etag did not match the expected one.
    Stale {
        /// The etag actually found.
        actual: u64,
    },
}

impl CasOutcome {
    /// Returns true if the replacement was applied.
    #[must_use]
    pub const fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// Opaque scan position for `(created_at, id)`-ordered pagination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    /// Creation timestamp of the last seen record.
    pub created_at: DateTime<Utc>,
    /// Identifier of the last seen record, as a string.
    pub id: String,
}

impl Cursor {
    /// Renders the cursor as an opaque wire token.
    ///
    /// Nanosecond precision: a coarser encoding would re-include records
    /// created in the same instant as the cursor on the next page.
    #[must_use]
    pub fn encode(&self) -> String {
        let nanos = self.created_at.timestamp_nanos_opt().unwrap_or(i64::MAX);
        format!("{nanos}:{}", self.id)
    }

    /// Parses a wire token produced by [`encode`](Self::encode).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] on a malformed token.
    pub fn decode(token: &str) -> Result<Self> {
        let (nanos, id) = token
            .split_once(':')
            .ok_or_else(|| Error::invalid_argument("malformed pagination cursor"))?;
        let nanos: i64 = nanos
            .parse()
            .map_err(|_| Error::invalid_argument("malformed pagination cursor"))?;
        Ok(Self {
            created_at: DateTime::from_timestamp_nanos(nanos),
            id: id.to_string(),
        })
    }

    /// Returns true when a record key sorts strictly after this cursor.
    #[must_use]
    pub fn precedes(&self, created_at: DateTime<Utc>, id: &str) -> bool {
        (created_at, id) > (self.created_at, self.id.as_str())
    }
}

/// Storage abstraction for the dispatch engine.
///
/// All methods are `Send + Sync` to support concurrent access from multiple
/// transport workers and engine replicas.
#[async_trait]
pub trait Store: Send + Sync {
    /// Checks store connectivity.
    async fn ping(&self) -> Result<()>;

    // --- Queues ---

    /// Inserts a new queue.
    ///
    /// Fails with [`Error::AlreadyExists`] when the name is taken.
    async fn insert_queue(&self, queue: &QueueRecord) -> Result<()>;

    /// Gets a queue by ID. Returns `None` if it does not exist.
    async fn queue_by_id(&self, id: QueueId) -> Result<Option<QueueRecord>>;

    /// Gets a queue by its unique name.
    async fn queue_by_name(&self, name: &str) -> Result<Option<QueueRecord>>;

    /// Atomically replaces a queue if the stored etag matches.
    async fn replace_queue(&self, queue: &QueueRecord, expected_etag: u64) -> Result<CasOutcome>;

    /// Deletes a queue together with all of its tasks and workers, as one
    /// batch. Returns false when the queue did not exist.
    async fn delete_queue(&self, id: QueueId) -> Result<bool>;

    // --- Tasks ---

    /// Inserts a new task.
    async fn insert_task(&self, task: &TaskRecord) -> Result<()>;

    /// Gets a task by ID.
    async fn task_by_id(&self, id: TaskId) -> Result<Option<TaskRecord>>;

    /// Atomically replaces a task if the stored etag matches.
    async fn replace_task(&self, task: &TaskRecord, expected_etag: u64) -> Result<CasOutcome>;

    /// Deletes a task. Returns false when it did not exist.
    async fn delete_task(&self, id: TaskId) -> Result<bool>;

    /// Returns up to `limit` PENDING tasks of a queue in dispatch order:
    /// priority descending, then creation time ascending, then ID ascending
    /// as the deterministic tie-breaker.
    async fn pending_tasks(&self, queue_id: QueueId, limit: usize) -> Result<Vec<TaskRecord>>;

    /// Returns up to `limit` RUNNING tasks across all queues, oldest
    /// heartbeat first. The reaper's scan.
    async fn running_tasks(&self, limit: usize) -> Result<Vec<TaskRecord>>;

    /// Returns up to `limit` tasks of a queue in `(created_at, id)` order,
    /// strictly after the cursor when one is given.
    async fn tasks_in_queue(
        &self,
        queue_id: QueueId,
        after: Option<&Cursor>,
        limit: usize,
    ) -> Result<Vec<TaskRecord>>;

    /// Returns the tasks of a queue currently leased to a worker.
    async fn tasks_by_worker(
        &self,
        queue_id: QueueId,
        worker_id: WorkerId,
    ) -> Result<Vec<TaskRecord>>;

    /// Counts the tasks of a queue.
    async fn count_tasks(&self, queue_id: QueueId) -> Result<usize>;

    // --- Workers ---

    /// Inserts a new worker.
    async fn insert_worker(&self, worker: &WorkerRecord) -> Result<()>;

    /// Gets a worker by ID.
    async fn worker_by_id(&self, id: WorkerId) -> Result<Option<WorkerRecord>>;

    /// Atomically replaces a worker if the stored etag matches.
    async fn replace_worker(&self, worker: &WorkerRecord, expected_etag: u64)
        -> Result<CasOutcome>;

    /// Deletes a worker. Returns false when it did not exist.
    async fn delete_worker(&self, id: WorkerId) -> Result<bool>;

    /// Returns up to `limit` workers of a queue in `(created_at, id)` order,
    /// strictly after the cursor when one is given.
    async fn workers_in_queue(
        &self,
        queue_id: QueueId,
        after: Option<&Cursor>,
        limit: usize,
    ) -> Result<Vec<WorkerRecord>>;

    /// Counts the workers of a queue.
    async fn count_workers(&self, queue_id: QueueId) -> Result<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cas_outcome_is_applied() {
        assert!(CasOutcome::Applied.is_applied());
        assert!(!CasOutcome::Missing.is_applied());
        assert!(!CasOutcome::Stale { actual: 3 }.is_applied());
    }

    #[test]
    fn cursor_roundtrip_preserves_sub_millisecond_precision() {
        let cursor = Cursor {
            created_at: DateTime::from_timestamp_nanos(1_700_000_000_123_456_789),
            id: "01JC0Q4Z3V8N".to_string(),
        };
        let decoded = Cursor::decode(&cursor.encode()).unwrap();
        assert_eq!(cursor, decoded);
    }

    #[test]
    fn cursor_rejects_garbage() {
        assert!(Cursor::decode("no-separator").is_err());
        assert!(Cursor::decode("not-a-number:id").is_err());
    }

    #[test]
    fn cursor_ordering_is_strict() {
        let at = DateTime::from_timestamp_millis(1_000).unwrap();
        let cursor = Cursor {
            created_at: at,
            id: "b".to_string(),
        };
        assert!(!cursor.precedes(at, "a"));
        assert!(!cursor.precedes(at, "b"));
        assert!(cursor.precedes(at, "c"));
        assert!(cursor.precedes(at + chrono::Duration::milliseconds(1), "a"));
    }
}
