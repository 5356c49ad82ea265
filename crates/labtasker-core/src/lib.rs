//! # labtasker-core
//!
//! Shared primitives for the Labtasker task queue server.
//!
//! This crate provides the foundational types used across all Labtasker
//! components:
//!
//! - **Identifiers**: Strongly-typed IDs for queues, tasks, and workers
//! - **Clock**: An injectable time source so lease and timeout logic is
//!   testable without sleeping
//! - **Documents**: Dotted-path traversal over JSON value trees, the
//!   representation used for task `args` and `metadata`
//! - **Error Types**: Shared error definitions and result types
//! - **Observability**: Logging bootstrap and span helpers
//!
//! ## Crate Boundary
//!
//! `labtasker-core` is the only crate allowed to define shared primitives.
//! The dispatch engine and the HTTP transport both build on the types here.
//!
//! ## Example
//!
//! ```rust
//! use labtasker_core::prelude::*;
//!
//! let task_id = TaskId::generate();
//! let clock = SystemClock;
//! let _now = clock.now();
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod clock;
pub mod document;
pub mod error;
pub mod id;
pub mod observability;

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use labtasker_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::document::{get_path, set_path, validate_path};
    pub use crate::error::{Error, Result};
    pub use crate::id::{QueueId, TaskId, WorkerId};
}

// Re-export key types at crate root for ergonomics
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result};
pub use id::{QueueId, TaskId, WorkerId};
pub use observability::{init_logging, LogFormat};
