//! Strongly-typed identifiers for Labtasker entities.
//!
//! All identifiers are:
//! - **Strongly typed**: Prevents mixing up different ID types at compile time
//! - **Lexicographically sortable**: ULIDs encode creation time and sort
//!   naturally, so sorting by ID is also sorting by creation order
//! - **Globally unique**: No coordination required for generation
//!
//! # Example
//!
//! ```rust
//! use labtasker_core::id::{QueueId, TaskId};
//!
//! let queue = QueueId::generate();
//! let task = TaskId::generate();
//!
//! // IDs are different types - this won't compile:
//! // let wrong: QueueId = task;
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

use crate::error::{Error, Result};

macro_rules! entity_id {
    ($(#[$doc:meta])* $name:ident, $label:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Ulid);

        impl $name {
            /// Generates a new unique identifier.
            ///
            /// Uses ULID generation which is:
            /// - Lexicographically sortable by creation time
            /// - Globally unique without coordination
            /// - URL-safe and case-insensitive
            #[must_use]
            pub fn generate() -> Self {
                Self(Ulid::new())
            }

            /// Creates an identifier from a raw ULID.
            #[must_use]
            pub const fn from_ulid(ulid: Ulid) -> Self {
                Self(ulid)
            }

            /// Returns the underlying ULID.
            #[must_use]
            pub const fn as_ulid(&self) -> Ulid {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                Ulid::from_string(s)
                    .map(Self)
                    .map_err(|e| Error::InvalidId {
                        message: format!(concat!("invalid ", $label, " ID '{}': {}"), s, e),
                    })
            }
        }
    };
}

entity_id!(
    /// A unique identifier for a queue.
    ///
    /// Queues are the unit of isolation: every task and worker belongs to
    /// exactly one queue, and access is guarded by the queue's shared secret.
    QueueId,
    "queue"
);

entity_id!(
    /// A unique identifier for a task.
    ///
    /// Tasks are immutable parameter bundles with lifecycle state, dispatched
    /// to at most one worker at a time.
    TaskId,
    "task"
);

entity_id!(
    /// A unique identifier for a worker.
    ///
    /// Workers are long-running processes that fetch and execute tasks.
    WorkerId,
    "worker"
);
