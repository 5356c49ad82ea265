//! Error types for the dispatch engine.
//!
//! Every failing engine call returns one of these variants; "no task
//! available" from fetch is `Ok(None)`, not an error. CAS misses are retried
//! internally and only surface as [`Error::Conflict`] once the retry budget
//! is exhausted.

use labtasker_core::{TaskId, WorkerId};

use crate::worker::WorkerStatus;

/// The result type used throughout the engine.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced at the engine boundary.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A queue, task, or worker does not exist.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// The entity kind that was looked up.
        entity: &'static str,
        /// The identifier or name that was looked up.
        id: String,
    },

    /// A unique constraint was violated (queue name).
    #[error("{entity} already exists: {name}")]
    AlreadyExists {
        /// The entity kind.
        entity: &'static str,
        /// The conflicting name.
        name: String,
    },

    /// A schema or range violation (negative timeout, malformed filter).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The queue password did not match.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// A fetch was attempted by a suspended, crashed, or unknown worker.
    #[error("worker {worker_id} cannot fetch tasks ({})", status_label(.status))]
    WorkerInactive {
        /// The worker that attempted the fetch.
        worker_id: WorkerId,
        /// The worker's status, if it exists at all.
        status: Option<WorkerStatus>,
    },

    /// A heartbeat or report was issued by a worker that does not hold the
    /// task's lease.
    #[error("task {task_id} is not owned by the reporting worker: {reason}")]
    NotOwned {
        /// The task in question.
        task_id: TaskId,
        /// Why the ownership check failed.
        reason: String,
    },

    /// Optimistic-concurrency retries were exhausted; the caller may retry.
    #[error("conflict: {message}")]
    Conflict {
        /// Description of the contended update.
        message: String,
    },

    /// The store is unavailable; the caller should back off.
    #[error("transient store error: {message}")]
    Transient {
        /// Description of the store failure.
        message: String,
    },
}

fn status_label(status: &Option<WorkerStatus>) -> &'static str {
    match status {
        Some(s) => s.as_label(),
        None => "unknown",
    }
}

impl Error {
    /// Creates a not-found error.
    #[must_use]
    pub fn not_found(entity: &'static str, id: impl std::fmt::Display) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Creates an invalid-argument error.
    #[must_use]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Creates a conflict error.
    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    /// Creates a transient store error.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    /// Creates a not-owned error.
    #[must_use]
    pub fn not_owned(task_id: TaskId, reason: impl Into<String>) -> Self {
        Self::NotOwned {
            task_id,
            reason: reason.into(),
        }
    }
}

impl From<labtasker_core::Error> for Error {
    fn from(value: labtasker_core::Error) -> Self {
        match value {
            labtasker_core::Error::InvalidId { message }
            | labtasker_core::Error::InvalidInput(message) => Self::InvalidArgument(message),
            labtasker_core::Error::Internal { message } => Self::Transient { message },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_display() {
        let err = Error::not_found("task", TaskId::generate());
        assert!(err.to_string().contains("task not found"));
    }

    #[test]
    fn worker_inactive_display_names_status() {
        let err = Error::WorkerInactive {
            worker_id: WorkerId::generate(),
            status: Some(WorkerStatus::Suspended),
        };
        assert!(err.to_string().contains("suspended"));

        let err = Error::WorkerInactive {
            worker_id: WorkerId::generate(),
            status: None,
        };
        assert!(err.to_string().contains("unknown"));
    }

    #[test]
    fn core_errors_map_to_invalid_argument() {
        let core = labtasker_core::Error::invalid_input("bad path");
        let err: Error = core.into();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }
}
