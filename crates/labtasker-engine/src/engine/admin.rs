//! Admin surface: queue, task, and worker mutation operations.
//!
//! A thin layer over the store and the engine's CAS helpers. The only
//! non-obvious parts are the per-status task update rules and the bulk
//! update, which CASes every matching document individually and reports
//! partial success per task.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use labtasker_core::document::set_path;
use labtasker_core::{QueueId, TaskId, WorkerId};

use super::DispatchEngine;
use crate::error::{Error, Result};
use crate::matcher::Filter;
use crate::queue::{validate_queue_name, QueueRecord};
use crate::store::{CasOutcome, Cursor};
use crate::task::{TaskRecord, TaskSpec, TaskStatus};
use crate::worker::{WorkerRecord, WorkerStatus};

/// Scan batch size for listing and bulk updates.
const SCAN_BATCH: usize = 128;
/// Upper bound on a single listing page.
const MAX_PAGE_LIMIT: usize = 500;

/// A page of tasks plus the cursor to continue from, if any.
#[derive(Debug, Clone)]
pub struct TaskPage {
    /// Matching tasks in `(created_at, id)` order.
    pub tasks: Vec<TaskRecord>,
    /// Opaque continuation token; `None` when the scan is exhausted.
    pub next_cursor: Option<String>,
}

/// A page of workers plus the cursor to continue from, if any.
#[derive(Debug, Clone)]
pub struct WorkerPage {
    /// Matching workers in `(created_at, id)` order.
    pub workers: Vec<WorkerRecord>,
    /// Opaque continuation token; `None` when the scan is exhausted.
    pub next_cursor: Option<String>,
}

/// Per-task result of a bulk update.
#[derive(Debug, Clone, Serialize)]
pub struct BulkUpdateOutcome {
    /// The task the update was attempted on.
    pub task_id: TaskId,
    /// `None` on success, otherwise why this task was skipped.
    pub error: Option<String>,
}

/// Partial update of queue settings.
#[derive(Debug, Clone, Default)]
pub struct QueueUpdate {
    /// New unique name.
    pub new_name: Option<String>,
    /// New password (re-hashed on apply).
    pub new_password: Option<String>,
    /// Shallow metadata merge; a null value removes the key.
    pub metadata_update: Option<Value>,
}

/// Admin-settable worker status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatusUpdate {
    /// Resume the worker and clear its failure streak.
    Active,
    /// Block the worker from fetching.
    Suspended,
    /// Mark the worker as crashed.
    Crashed,
}

/// Partial update of a worker.
#[derive(Debug, Clone, Default)]
pub struct WorkerUpdate {
    /// New label.
    pub worker_name: Option<String>,
    /// Admin status change.
    pub status: Option<WorkerStatusUpdate>,
    /// Shallow metadata merge; a null value removes the key.
    pub metadata_update: Option<Value>,
    /// New consecutive-failure bound.
    pub max_retries: Option<u32>,
}

/// Parsed task update document, routed by field.
#[derive(Debug, Clone, Default)]
struct TaskFieldUpdate {
    task_name: Option<Option<String>>,
    cmd: Option<Option<String>>,
    priority: Option<i64>,
    max_retries: Option<u32>,
    heartbeat_timeout: Option<u64>,
    task_timeout: Option<Option<u64>>,
    args_replace: Option<Value>,
    args_paths: Vec<(String, Value)>,
    metadata_replace: Option<Value>,
    metadata_paths: Vec<(String, Value)>,
}

impl TaskFieldUpdate {
    fn parse(updates: &Map<String, Value>) -> Result<Self> {
        if updates.is_empty() {
            return Err(Error::invalid_argument("update document is empty"));
        }

        let mut update = Self::default();
        for (field, value) in updates {
            match field.as_str() {
                "task_name" => update.task_name = Some(optional_string(field, value)?),
                "cmd" => update.cmd = Some(optional_string(field, value)?),
                "priority" => {
                    update.priority = Some(value.as_i64().ok_or_else(|| {
                        Error::invalid_argument("priority must be an integer")
                    })?);
                }
                "max_retries" => {
                    let n = value.as_u64().ok_or_else(|| {
                        Error::invalid_argument("max_retries must be a non-negative integer")
                    })?;
                    update.max_retries = Some(u32::try_from(n).map_err(|_| {
                        Error::invalid_argument("max_retries is out of range")
                    })?);
                }
                "heartbeat_timeout" => {
                    let secs = value.as_u64().filter(|s| *s > 0).ok_or_else(|| {
                        Error::invalid_argument("heartbeat_timeout must be a positive integer")
                    })?;
                    update.heartbeat_timeout = Some(secs);
                }
                "task_timeout" => {
                    update.task_timeout = Some(if value.is_null() {
                        None
                    } else {
                        let secs = value.as_u64().filter(|s| *s > 0).ok_or_else(|| {
                            Error::invalid_argument(
                                "task_timeout must be a positive integer or null",
                            )
                        })?;
                        Some(secs)
                    });
                }
                "args" => {
                    if !value.is_object() {
                        return Err(Error::invalid_argument("args must be a JSON object"));
                    }
                    update.args_replace = Some(value.clone());
                }
                "metadata" => {
                    if !value.is_object() {
                        return Err(Error::invalid_argument("metadata must be a JSON object"));
                    }
                    update.metadata_replace = Some(value.clone());
                }
                _ => {
                    if let Some(path) = field.strip_prefix("args.") {
                        labtasker_core::document::validate_path(path)?;
                        update.args_paths.push((path.to_string(), value.clone()));
                    } else if let Some(path) = field.strip_prefix("metadata.") {
                        labtasker_core::document::validate_path(path)?;
                        update.metadata_paths.push((path.to_string(), value.clone()));
                    } else {
                        return Err(Error::invalid_argument(format!(
                            "field '{field}' is not updatable"
                        )));
                    }
                }
            }
        }
        Ok(update)
    }

    fn touches_args(&self) -> bool {
        self.args_replace.is_some() || !self.args_paths.is_empty()
    }

    fn touches_settings(&self) -> bool {
        self.task_name.is_some()
            || self.cmd.is_some()
            || self.heartbeat_timeout.is_some()
            || self.task_timeout.is_some()
    }

    fn touches_priority_or_retries(&self) -> bool {
        self.priority.is_some() || self.max_retries.is_some()
    }

    fn apply(&self, task: &mut TaskRecord) -> Result<()> {
        if let Some(name) = &self.task_name {
            task.task_name = name.clone();
        }
        if let Some(cmd) = &self.cmd {
            task.cmd = cmd.clone();
        }
        if let Some(priority) = self.priority {
            task.priority = priority;
        }
        if let Some(max_retries) = self.max_retries {
            task.max_retries = max_retries;
        }
        if let Some(heartbeat_timeout) = self.heartbeat_timeout {
            task.heartbeat_timeout = heartbeat_timeout;
        }
        if let Some(task_timeout) = self.task_timeout {
            task.task_timeout = task_timeout;
        }
        if let Some(args) = &self.args_replace {
            task.args = args.clone();
        }
        for (path, value) in &self.args_paths {
            set_path(&mut task.args, path, value.clone())?;
        }
        if let Some(metadata) = &self.metadata_replace {
            task.metadata = metadata.clone();
        }
        for (path, value) in &self.metadata_paths {
            set_path(&mut task.metadata, path, value.clone())?;
        }
        Ok(())
    }
}

/// Enforces the per-status update rules: everything while PENDING;
/// metadata, priority, and retry budget while RUNNING (picked up on the
/// next retry); metadata only on terminal tasks.
fn ensure_update_allowed(task: &TaskRecord, update: &TaskFieldUpdate) -> Result<()> {
    if task.status == TaskStatus::Pending {
        return Ok(());
    }
    if update.touches_args() || update.touches_settings() {
        return Err(Error::invalid_argument(format!(
            "args and task settings can only change while PENDING (task is {})",
            task.status
        )));
    }
    if task.is_terminal() && update.touches_priority_or_retries() {
        return Err(Error::invalid_argument(format!(
            "only metadata can change on a terminal task (task is {})",
            task.status
        )));
    }
    Ok(())
}

fn optional_string(field: &str, value: &Value) -> Result<Option<String>> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s.clone())),
        _ => Err(Error::invalid_argument(format!(
            "{field} must be a string or null"
        ))),
    }
}

/// Shallow-merges an update object into a metadata object. Null values
/// remove keys.
fn merge_metadata(target: &mut Value, update: &Value) -> Result<()> {
    let update = update
        .as_object()
        .ok_or_else(|| Error::invalid_argument("metadata update must be a JSON object"))?;
    let target = target
        .as_object_mut()
        .ok_or_else(|| Error::invalid_argument("stored metadata is not an object"))?;
    for (key, value) in update {
        if value.is_null() {
            target.remove(key);
        } else {
            target.insert(key.clone(), value.clone());
        }
    }
    Ok(())
}

impl DispatchEngine {
    // --- Queues ---

    /// Creates a queue with a hashed shared secret.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyExists`] when the name is taken, or
    /// [`Error::InvalidArgument`] on validation failure.
    pub async fn create_queue(
        &self,
        name: &str,
        password: &str,
        metadata: Option<Value>,
    ) -> Result<QueueRecord> {
        let now = self.now();
        let queue = QueueRecord::new(
            name,
            password,
            metadata.unwrap_or_else(|| Value::Object(Map::new())),
            now,
        )?;
        self.store().insert_queue(&queue).await?;
        self.publish_queue_event(queue.id, queue.metadata.clone(), None, "CREATED", now);
        Ok(queue)
    }

    /// Verifies a queue's shared secret and returns the queue.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown queue and
    /// [`Error::Unauthorized`] on a password mismatch.
    pub async fn authenticate(&self, queue_name: &str, password: &str) -> Result<QueueRecord> {
        let queue = self
            .store()
            .queue_by_name(queue_name)
            .await?
            .ok_or_else(|| Error::not_found("queue", queue_name))?;
        if !queue.verify_password(password) {
            return Err(Error::Unauthorized(format!(
                "wrong password for queue '{queue_name}'"
            )));
        }
        Ok(queue)
    }

    /// Gets a queue by ID.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when it does not exist.
    pub async fn get_queue(&self, queue_id: QueueId) -> Result<QueueRecord> {
        self.require_queue(queue_id).await
    }

    /// Applies a partial queue update (rename, password rotation, metadata
    /// merge) under CAS.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyExists`] when a rename collides, or
    /// [`Error::Conflict`] when the retry budget is exhausted.
    pub async fn update_queue(&self, queue_id: QueueId, update: QueueUpdate) -> Result<QueueRecord> {
        for _ in 0..self.config().max_cas_attempts {
            let current = self.require_queue(queue_id).await?;
            let mut next = current.clone();
            if let Some(name) = &update.new_name {
                validate_queue_name(name)?;
                next.name = name.clone();
            }
            if let Some(password) = &update.new_password {
                next.set_password(password)?;
            }
            if let Some(metadata_update) = &update.metadata_update {
                merge_metadata(&mut next.metadata, metadata_update)?;
            }
            next.touch(self.now());
            match self.store().replace_queue(&next, current.etag).await? {
                CasOutcome::Applied => return Ok(next),
                CasOutcome::Missing => return Err(Error::not_found("queue", queue_id)),
                CasOutcome::Stale { .. } => {}
            }
        }
        Err(Error::conflict(format!(
            "queue {queue_id} kept changing underneath the update"
        )))
    }

    /// Deletes a queue. With `cascade` (the default on the wire) all of its
    /// tasks and workers go with it; without, deletion refuses while any
    /// remain.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] when `cascade` is false and the
    /// queue is not empty.
    pub async fn delete_queue(&self, queue_id: QueueId, cascade: bool) -> Result<()> {
        let queue = self.require_queue(queue_id).await?;
        if !cascade {
            let tasks = self.store().count_tasks(queue_id).await?;
            let workers = self.store().count_workers(queue_id).await?;
            if tasks > 0 || workers > 0 {
                return Err(Error::invalid_argument(format!(
                    "queue '{}' still has {tasks} tasks and {workers} workers; delete with cascade",
                    queue.name
                )));
            }
        }
        let now = self.now();
        if self.store().delete_queue(queue_id).await? {
            self.publish_queue_event(queue_id, queue.metadata, None, "DELETED", now);
        }
        Ok(())
    }

    // --- Tasks ---

    /// Validates and persists a new PENDING task.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] on a malformed spec.
    pub async fn submit_task(&self, spec: TaskSpec) -> Result<TaskRecord> {
        self.require_queue(spec.queue_id).await?;
        let now = self.now();
        let task = TaskRecord::new(spec, now)?;
        self.store().insert_task(&task).await?;
        self.publish_task_transition(&task, None, now);
        Ok(task)
    }

    /// Gets a task scoped to a queue.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when it does not exist in the queue.
    pub async fn get_task(&self, queue_id: QueueId, task_id: TaskId) -> Result<TaskRecord> {
        self.require_task(queue_id, task_id).await
    }

    /// Applies a partial task update under CAS, subject to the per-status
    /// field rules.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] when a field is not updatable in
    /// the task's current status.
    pub async fn update_task(
        &self,
        queue_id: QueueId,
        task_id: TaskId,
        updates: &Map<String, Value>,
    ) -> Result<TaskRecord> {
        self.require_queue(queue_id).await?;
        let update = TaskFieldUpdate::parse(updates)?;
        self.update_task_with(queue_id, task_id, |current| {
            ensure_update_allowed(current, &update)?;
            let mut next = current.clone();
            update.apply(&mut next)?;
            Ok(Some(next))
        })
        .await
    }

    /// Deletes a task outright. Terminal or not; deletion is the one
    /// transition every status allows.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when it does not exist in the queue.
    pub async fn delete_task(&self, queue_id: QueueId, task_id: TaskId) -> Result<()> {
        self.require_task(queue_id, task_id).await?;
        self.store().delete_task(task_id).await?;
        Ok(())
    }

    /// Cancels a task from any non-terminal state. Racing a terminal
    /// transition makes this a no-op that returns the observed final
    /// record.
    pub async fn cancel_task(&self, queue_id: QueueId, task_id: TaskId) -> Result<TaskRecord> {
        self.require_queue(queue_id).await?;
        self.update_task_with(queue_id, task_id, |current| {
            if current.is_terminal() {
                return Ok(None);
            }
            let mut next = current.clone();
            next.status = TaskStatus::Cancelled;
            next.clear_lease();
            Ok(Some(next))
        })
        .await
    }

    /// Resets a terminal FAILED task back to PENDING with a fresh retry
    /// budget, optionally applying a settings update first. The manual
    /// restart path for tasks that exhausted their retries.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] when the task is not FAILED.
    pub async fn requeue_task(
        &self,
        queue_id: QueueId,
        task_id: TaskId,
        updates: Option<&Map<String, Value>>,
    ) -> Result<TaskRecord> {
        self.require_queue(queue_id).await?;
        let update = updates.map(TaskFieldUpdate::parse).transpose()?;
        self.update_task_with(queue_id, task_id, |current| {
            if current.status != TaskStatus::Failed {
                return Err(Error::invalid_argument(format!(
                    "only FAILED tasks can be re-queued (task is {})",
                    current.status
                )));
            }
            let mut next = current.clone();
            if let Some(update) = &update {
                update.apply(&mut next)?;
            }
            next.retries = 0;
            next.status = TaskStatus::Pending;
            next.clear_lease();
            Ok(Some(next))
        })
        .await
    }

    /// Lists a queue's tasks, filtered by a matcher expression and
    /// paginated by `(created_at, id)` cursor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] on a malformed filter or cursor.
    pub async fn ls_tasks(
        &self,
        queue_id: QueueId,
        filter: Option<&Value>,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<TaskPage> {
        self.require_queue(queue_id).await?;
        let filter = Filter::parse_optional(filter)?;
        let limit = limit.clamp(1, MAX_PAGE_LIMIT);
        let mut after = cursor.map(Cursor::decode).transpose()?;

        let mut tasks = Vec::new();
        loop {
            let batch = self
                .store()
                .tasks_in_queue(queue_id, after.as_ref(), SCAN_BATCH)
                .await?;
            let exhausted = batch.len() < SCAN_BATCH;
            for task in batch {
                after = Some(Cursor {
                    created_at: task.created_at,
                    id: task.id.to_string(),
                });
                if filter.matches(&task.document()) {
                    tasks.push(task);
                    if tasks.len() == limit {
                        return Ok(TaskPage {
                            tasks,
                            next_cursor: after.map(|c| c.encode()),
                        });
                    }
                }
            }
            if exhausted {
                return Ok(TaskPage {
                    tasks,
                    next_cursor: None,
                });
            }
        }
    }

    /// Applies an update document to every task matching a filter. Each
    /// document is CAS'd individually; tasks that refuse the update (status
    /// rules, conflicts) are reported per ID instead of failing the batch.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] when the filter or update
    /// document itself is malformed.
    pub async fn bulk_update_tasks(
        &self,
        queue_id: QueueId,
        filter: Option<&Value>,
        updates: &Map<String, Value>,
    ) -> Result<Vec<BulkUpdateOutcome>> {
        self.require_queue(queue_id).await?;
        let filter = Filter::parse_optional(filter)?;
        let update = TaskFieldUpdate::parse(updates)?;

        let mut outcomes = Vec::new();
        let mut after: Option<Cursor> = None;
        loop {
            let batch = self
                .store()
                .tasks_in_queue(queue_id, after.as_ref(), SCAN_BATCH)
                .await?;
            let exhausted = batch.len() < SCAN_BATCH;
            for task in batch {
                after = Some(Cursor {
                    created_at: task.created_at,
                    id: task.id.to_string(),
                });
                if !filter.matches(&task.document()) {
                    continue;
                }
                let result = self
                    .update_task_with(queue_id, task.id, |current| {
                        ensure_update_allowed(current, &update)?;
                        let mut next = current.clone();
                        update.apply(&mut next)?;
                        Ok(Some(next))
                    })
                    .await;
                outcomes.push(BulkUpdateOutcome {
                    task_id: task.id,
                    error: result.err().map(|e| e.to_string()),
                });
            }
            if exhausted {
                return Ok(outcomes);
            }
        }
    }

    // --- Workers ---

    /// Registers a new ACTIVE worker in a queue.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] on malformed metadata.
    pub async fn register_worker(
        &self,
        queue_id: QueueId,
        worker_name: Option<String>,
        metadata: Option<Value>,
        max_retries: Option<u32>,
    ) -> Result<WorkerRecord> {
        self.require_queue(queue_id).await?;
        let now = self.now();
        let worker = WorkerRecord::new(
            queue_id,
            worker_name,
            metadata.unwrap_or_else(|| Value::Object(Map::new())),
            max_retries,
            now,
        )?;
        self.store().insert_worker(&worker).await?;
        self.publish_worker_transition(&worker, None, now);
        Ok(worker)
    }

    /// Gets a worker scoped to a queue.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when it does not exist in the queue.
    pub async fn get_worker(&self, queue_id: QueueId, worker_id: WorkerId) -> Result<WorkerRecord> {
        self.require_worker(queue_id, worker_id).await
    }

    /// Applies a partial worker update under CAS. Setting the status to
    /// `active` is the resume path: it also clears the failure streak.
    pub async fn update_worker(
        &self,
        queue_id: QueueId,
        worker_id: WorkerId,
        update: WorkerUpdate,
    ) -> Result<WorkerRecord> {
        self.update_worker_with(queue_id, worker_id, |current| {
            let mut next = current.clone();
            if let Some(name) = &update.worker_name {
                next.worker_name = Some(name.clone());
            }
            if let Some(max_retries) = update.max_retries {
                next.max_retries = max_retries;
            }
            if let Some(metadata_update) = &update.metadata_update {
                merge_metadata(&mut next.metadata, metadata_update)?;
            }
            match update.status {
                Some(WorkerStatusUpdate::Active) => next.resume(),
                Some(WorkerStatusUpdate::Suspended) => next.status = WorkerStatus::Suspended,
                Some(WorkerStatusUpdate::Crashed) => next.status = WorkerStatus::Crashed,
                None => {}
            }
            Ok(Some(next))
        })
        .await
    }

    /// Deletes a worker and re-queues any tasks it still held, so leases do
    /// not dangle on a worker that no longer exists.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when the worker does not exist in the
    /// queue.
    pub async fn delete_worker(&self, queue_id: QueueId, worker_id: WorkerId) -> Result<()> {
        self.require_worker(queue_id, worker_id).await?;

        let held = self.store().tasks_by_worker(queue_id, worker_id).await?;
        for task in held {
            if task.status != TaskStatus::Running {
                continue;
            }
            let result = self
                .update_task_with(queue_id, task.id, |current| {
                    if current.status != TaskStatus::Running
                        || current.worker_id != Some(worker_id)
                    {
                        return Ok(None);
                    }
                    let mut next = current.clone();
                    next.status = TaskStatus::Pending;
                    next.clear_lease();
                    Ok(Some(next))
                })
                .await;
            if let Err(error) = result {
                tracing::warn!(
                    task_id = %task.id,
                    worker_id = %worker_id,
                    %error,
                    "failed to re-queue task of deleted worker"
                );
            }
        }

        self.store().delete_worker(worker_id).await?;
        Ok(())
    }

    /// Lists a queue's workers, filtered and paginated like
    /// [`ls_tasks`](Self::ls_tasks).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] on a malformed filter or cursor.
    pub async fn ls_workers(
        &self,
        queue_id: QueueId,
        filter: Option<&Value>,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<WorkerPage> {
        self.require_queue(queue_id).await?;
        let filter = Filter::parse_optional(filter)?;
        let limit = limit.clamp(1, MAX_PAGE_LIMIT);
        let mut after = cursor.map(Cursor::decode).transpose()?;

        let mut workers = Vec::new();
        loop {
            let batch = self
                .store()
                .workers_in_queue(queue_id, after.as_ref(), SCAN_BATCH)
                .await?;
            let exhausted = batch.len() < SCAN_BATCH;
            for worker in batch {
                after = Some(Cursor {
                    created_at: worker.created_at,
                    id: worker.id.to_string(),
                });
                if filter.matches(&worker.document()) {
                    workers.push(worker);
                    if workers.len() == limit {
                        return Ok(WorkerPage {
                            workers,
                            next_cursor: after.map(|c| c.encode()),
                        });
                    }
                }
            }
            if exhausted {
                return Ok(WorkerPage {
                    workers,
                    next_cursor: None,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn update_doc(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn parse_routes_fields() {
        let update = TaskFieldUpdate::parse(&update_doc(json!({
            "priority": 20,
            "args.lr": 0.2,
            "metadata.tag": "sweep",
            "task_timeout": null,
            "cmd": "python train.py",
        })))
        .unwrap();
        assert_eq!(update.priority, Some(20));
        assert_eq!(update.task_timeout, Some(None));
        assert_eq!(update.cmd, Some(Some("python train.py".to_string())));
        assert_eq!(update.args_paths.len(), 1);
        assert_eq!(update.metadata_paths.len(), 1);
    }

    #[test]
    fn parse_rejects_unknown_and_protected_fields() {
        for field in ["status", "retries", "worker_id", "etag", "queue_id", "created_at"] {
            let doc = update_doc(json!({field: 1}));
            assert!(TaskFieldUpdate::parse(&doc).is_err(), "{field} accepted");
        }
        assert!(TaskFieldUpdate::parse(&update_doc(json!({}))).is_err());
        assert!(TaskFieldUpdate::parse(&update_doc(json!({"heartbeat_timeout": 0}))).is_err());
    }

    #[test]
    fn update_rules_by_status() {
        let queue_id = labtasker_core::QueueId::generate();
        let mut task = TaskRecord::new(TaskSpec::new(queue_id, json!({"lr": 0.1})), chrono::Utc::now())
            .unwrap();

        let args_update = TaskFieldUpdate::parse(&update_doc(json!({"args.lr": 0.5}))).unwrap();
        let meta_update =
            TaskFieldUpdate::parse(&update_doc(json!({"metadata.tag": "x"}))).unwrap();
        let priority_update = TaskFieldUpdate::parse(&update_doc(json!({"priority": 1}))).unwrap();

        // PENDING: everything allowed.
        assert!(ensure_update_allowed(&task, &args_update).is_ok());

        // RUNNING: metadata and priority only.
        task.begin_lease(labtasker_core::WorkerId::generate(), chrono::Utc::now(), None);
        assert!(ensure_update_allowed(&task, &args_update).is_err());
        assert!(ensure_update_allowed(&task, &meta_update).is_ok());
        assert!(ensure_update_allowed(&task, &priority_update).is_ok());

        // Terminal: metadata only.
        task.status = TaskStatus::Success;
        assert!(ensure_update_allowed(&task, &priority_update).is_err());
        assert!(ensure_update_allowed(&task, &meta_update).is_ok());
    }

    #[test]
    fn merge_metadata_inserts_and_removes() {
        let mut target = json!({"keep": 1, "drop": 2});
        merge_metadata(&mut target, &json!({"drop": null, "add": 3})).unwrap();
        assert_eq!(target, json!({"keep": 1, "add": 3}));
    }
}
