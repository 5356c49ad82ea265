//! # labtasker-engine
//!
//! The Labtasker dispatch engine: durable task state, priority-ordered
//! dispatch, at-most-one-worker-per-task delivery, heartbeat-based liveness
//! tracking, automatic retries, worker suspension, and event fan-out.
//!
//! ## Core Concepts
//!
//! - **Queue**: A named container scoping tasks and workers, guarded by a
//!   shared secret
//! - **Task**: One experiment parameter bundle with lifecycle state
//! - **Lease**: Ownership of a task by a worker from fetch to report or
//!   expiry, refreshed by heartbeats
//! - **Reaper**: The background sweep that expires stale leases
//!
//! ## Guarantees
//!
//! - **At-most-one owner**: A task is RUNNING under exactly one worker,
//!   enforced by compare-and-update on the task's etag
//! - **Bounded retries**: A task is re-queued at most `max_retries` times;
//!   a terminal FAILED task has spent its whole budget
//! - **Advisory events**: Every state transition publishes exactly one
//!   event to each matching subscriber; losing events never affects the
//!   durable state
//!
//! Delivery is at-least-once: a task may execute more than once if a worker
//! crashes mid-execution.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use labtasker_core::SystemClock;
//! use labtasker_engine::bus::EventBus;
//! use labtasker_engine::engine::{DispatchEngine, FetchRequest, ReportOutcome};
//! use labtasker_engine::store::memory::MemoryStore;
//! use labtasker_engine::task::TaskSpec;
//! use serde_json::json;
//!
//! # async fn demo() -> labtasker_engine::error::Result<()> {
//! let engine = DispatchEngine::new(
//!     Arc::new(MemoryStore::new()),
//!     EventBus::default(),
//!     Arc::new(SystemClock),
//! );
//!
//! let queue = engine.create_queue("experiments", "secret", None).await?;
//! engine
//!     .submit_task(TaskSpec::new(queue.id, json!({"lr": 0.1})))
//!     .await?;
//!
//! let worker = engine.register_worker(queue.id, None, None, None).await?;
//! if let Some(task) = engine.fetch_next(queue.id, FetchRequest::new(worker.id)).await? {
//!     engine
//!         .report(queue.id, task.id, worker.id, ReportOutcome::Success, Some(json!({"acc": 0.9})))
//!         .await?;
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod bus;
pub mod engine;
pub mod error;
pub mod events;
pub mod matcher;
pub mod queue;
pub mod store;
pub mod task;
pub mod worker;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::bus::{EventBus, Subscription, DEFAULT_EVENT_BUFFER_SIZE};
    pub use crate::engine::{
        BulkUpdateOutcome, DispatchEngine, EngineConfig, FetchRequest, LeaseReaper, QueueUpdate,
        ReportOutcome, SweepStats, TaskPage, WorkerPage, WorkerStatusUpdate, WorkerUpdate,
    };
    pub use crate::error::{Error, Result};
    pub use crate::events::{EntityKind, Event, EventFilter, EventPayload};
    pub use crate::matcher::Filter;
    pub use crate::queue::QueueRecord;
    pub use crate::store::memory::MemoryStore;
    pub use crate::store::{CasOutcome, Cursor, Store};
    pub use crate::task::{TaskRecord, TaskSpec, TaskStatus};
    pub use crate::worker::{WorkerRecord, WorkerStatus};
}
