//! Worker lifecycle state and record type.
//!
//! Workers register once per process and are tracked server-side for two
//! reasons: blocking fetches from workers that keep failing (SUSPENDED) and
//! recording workers whose leases expired without a heartbeat (CRASHED).
//!
//! ```text
//!    (register) ─► ACTIVE ──(consecutive failures >= max_retries)──► SUSPENDED
//!                    │                                                  │
//!                    │ reaper: lease expired without heartbeat          │ admin resume
//!                    └──────────────────────────────► CRASHED ◄─────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use labtasker_core::{QueueId, WorkerId};

use crate::error::{Error, Result};

/// Default bound on consecutive task failures before suspension.
pub const DEFAULT_WORKER_MAX_RETRIES: u32 = 3;

/// Worker lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerStatus {
    /// Eligible to fetch tasks.
    Active,
    /// Accumulated too many consecutive failures; fetch is blocked until an
    /// admin resumes the worker.
    Suspended,
    /// A lease owned by this worker expired without a heartbeat; fetch is
    /// blocked until an admin resumes the worker.
    Crashed,
}

impl WorkerStatus {
    /// Returns true when the worker may claim new tasks.
    #[must_use]
    pub const fn can_fetch(&self) -> bool {
        matches!(self, Self::Active)
    }

    /// Returns a lowercase label suitable for logs and wire payloads.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Suspended => "suspended",
            Self::Crashed => "crashed",
        }
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "ACTIVE"),
            Self::Suspended => write!(f, "SUSPENDED"),
            Self::Crashed => write!(f, "CRASHED"),
        }
    }
}

/// The persisted worker document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    /// Worker identifier.
    pub id: WorkerId,
    /// Owning queue.
    pub queue_id: QueueId,
    /// Optional human-readable label.
    pub worker_name: Option<String>,
    /// User-defined tags (JSON object).
    pub metadata: Value,
    /// Lifecycle state.
    pub status: WorkerStatus,
    /// Consecutive task failures currently attributed to this worker.
    /// Reset to zero on any success.
    pub retries: u32,
    /// Consecutive-failure bound; reaching it suspends the worker.
    pub max_retries: u32,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp.
    pub last_modified: DateTime<Utc>,
    /// Optimistic-concurrency tag, bumped on every successful update.
    pub etag: u64,
}

impl WorkerRecord {
    /// Builds a new ACTIVE worker.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] when `metadata` is not a JSON
    /// object.
    pub fn new(
        queue_id: QueueId,
        worker_name: Option<String>,
        metadata: Value,
        max_retries: Option<u32>,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        if !metadata.is_object() {
            return Err(Error::invalid_argument("worker metadata must be a JSON object"));
        }

        Ok(Self {
            id: WorkerId::generate(),
            queue_id,
            worker_name,
            metadata,
            status: WorkerStatus::Active,
            retries: 0,
            max_retries: max_retries.unwrap_or(DEFAULT_WORKER_MAX_RETRIES),
            created_at: now,
            last_modified: now,
            etag: 0,
        })
    }

    /// Records a consecutive task failure. Suspends the worker once the
    /// bound is reached and returns true when that transition happened.
    pub fn record_failure(&mut self) -> bool {
        self.retries = self.retries.saturating_add(1);
        if self.status == WorkerStatus::Active && self.retries >= self.max_retries {
            self.status = WorkerStatus::Suspended;
            return true;
        }
        false
    }

    /// Resets the consecutive-failure counter. Called on every success.
    pub fn record_success(&mut self) {
        self.retries = 0;
    }

    /// Returns the worker to ACTIVE and clears the failure counter.
    /// The admin resume path for SUSPENDED and CRASHED workers.
    pub fn resume(&mut self) {
        self.status = WorkerStatus::Active;
        self.retries = 0;
    }

    /// Stamps a mutation: bumps the etag and refreshes `last_modified`.
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
        serde_json::to_value(self).expect("worker record serializes")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn worker(max_retries: u32) -> WorkerRecord {
        WorkerRecord::new(
            QueueId::generate(),
            Some("gpu-box".into()),
            json!({}),
            Some(max_retries),
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn new_worker_is_active() {
        let w = worker(3);
        assert_eq!(w.status, WorkerStatus::Active);
        assert!(w.status.can_fetch());
        assert_eq!(w.retries, 0);
    }

    #[test]
    fn consecutive_failures_suspend_at_bound() {
        let mut w = worker(3);
        assert!(!w.record_failure());
        assert!(!w.record_failure());
        assert!(w.record_failure());
        assert_eq!(w.status, WorkerStatus::Suspended);
        assert!(!w.status.can_fetch());
    }

    #[test]
    fn success_resets_failure_streak() {
        let mut w = worker(3);
        w.record_failure();
        w.record_failure();
        w.record_success();
        assert_eq!(w.retries, 0);

        // The streak starts over afterwards.
        assert!(!w.record_failure());
        assert_eq!(w.status, WorkerStatus::Active);
    }

    #[test]
    fn resume_reactivates_and_clears_counter() {
        let mut w = worker(1);
        w.record_failure();
        assert_eq!(w.status, WorkerStatus::Suspended);

        w.resume();
        assert_eq!(w.status, WorkerStatus::Active);
        assert_eq!(w.retries, 0);
    }

    #[test]
    fn non_object_metadata_rejected() {
        let result = WorkerRecord::new(QueueId::generate(), None, json!("tags"), None, Utc::now());
        assert!(result.is_err());
    }
}
