//! In-memory store implementation.
//!
//! This module provides [`MemoryStore`], an implementation of the [`Store`]
//! trait used by tests and single-process development servers.
//!
//! ## Limitations
//!
//! - **Single-process only**: State is not shared across process boundaries
//! - **No persistence**: All state is lost when the process exits
//!
//! All three collections live behind one `RwLock` so the queue-delete
//! cascade is a single atomic batch, matching the transactional batch a
//! real document store would use.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use labtasker_core::{QueueId, TaskId, WorkerId};

use super::{CasOutcome, Cursor, Store};
use crate::error::{Error, Result};
use crate::queue::QueueRecord;
use crate::task::{TaskRecord, TaskStatus};
use crate::worker::WorkerRecord;

/// In-memory store for tests and development.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Collections>,
}

#[derive(Debug, Default)]
struct Collections {
    queues: HashMap<QueueId, QueueRecord>,
    queue_names: HashMap<String, QueueId>,
    tasks: HashMap<TaskId, TaskRecord>,
    workers: HashMap<WorkerId, WorkerRecord>,
}

/// Converts a lock poison error to a transient store error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::transient("store lock poisoned")
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored tasks, for test assertions.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn task_count(&self) -> Result<usize> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner.tasks.len())
    }
}

fn scan_after<'a, T>(
    records: impl Iterator<Item = &'a T>,
    key: impl Fn(&T) -> (chrono::DateTime<chrono::Utc>, String),
    after: Option<&Cursor>,
    limit: usize,
) -> Vec<T>
where
    T: Clone + 'a,
{
    let mut selected: Vec<(chrono::DateTime<chrono::Utc>, String, T)> = records
        .filter(|r| {
            let (created_at, id) = key(r);
            after.is_none_or(|cursor| cursor.precedes(created_at, &id))
        })
        .map(|r| {
            let (created_at, id) = key(r);
            (created_at, id, r.clone())
        })
        .collect();
    selected.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));
    selected.truncate(limit);
    selected.into_iter().map(|(_, _, r)| r).collect()
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> Result<()> {
        let _guard = self.inner.read().map_err(poison_err)?;
        Ok(())
    }

    async fn insert_queue(&self, queue: &QueueRecord) -> Result<()> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        if inner.queue_names.contains_key(&queue.name) {
            return Err(Error::AlreadyExists {
                entity: "queue",
                name: queue.name.clone(),
            });
        }
        inner.queue_names.insert(queue.name.clone(), queue.id);
        inner.queues.insert(queue.id, queue.clone());
        Ok(())
    }

    async fn queue_by_id(&self, id: QueueId) -> Result<Option<QueueRecord>> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner.queues.get(&id).cloned())
    }

    async fn queue_by_name(&self, name: &str) -> Result<Option<QueueRecord>> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner
            .queue_names
            .get(name)
            .and_then(|id| inner.queues.get(id))
            .cloned())
    }

    async fn replace_queue(&self, queue: &QueueRecord, expected_etag: u64) -> Result<CasOutcome> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let Some(stored) = inner.queues.get(&queue.id) else {
            return Ok(CasOutcome::Missing);
        };
        if stored.etag != expected_etag {
            return Ok(CasOutcome::Stale {
                actual: stored.etag,
            });
        }
        // A rename must keep the unique-name index consistent.
        if stored.name != queue.name {
            if inner.queue_names.contains_key(&queue.name) {
                return Err(Error::AlreadyExists {
                    entity: "queue",
                    name: queue.name.clone(),
                });
            }
            let old_name = stored.name.clone();
            inner.queue_names.remove(&old_name);
            inner.queue_names.insert(queue.name.clone(), queue.id);
        }
        inner.queues.insert(queue.id, queue.clone());
        Ok(CasOutcome::Applied)
    }

    async fn delete_queue(&self, id: QueueId) -> Result<bool> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let Some(queue) = inner.queues.remove(&id) else {
            return Ok(false);
        };
        inner.queue_names.remove(&queue.name);
        inner.tasks.retain(|_, t| t.queue_id != id);
        inner.workers.retain(|_, w| w.queue_id != id);
        Ok(true)
    }

    async fn insert_task(&self, task: &TaskRecord) -> Result<()> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        if inner.tasks.contains_key(&task.id) {
            return Err(Error::conflict(format!("task {} already exists", task.id)));
        }
        inner.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn task_by_id(&self, id: TaskId) -> Result<Option<TaskRecord>> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner.tasks.get(&id).cloned())
    }

    async fn replace_task(&self, task: &TaskRecord, expected_etag: u64) -> Result<CasOutcome> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let Some(stored) = inner.tasks.get(&task.id) else {
            return Ok(CasOutcome::Missing);
        };
        if stored.etag != expected_etag {
            return Ok(CasOutcome::Stale {
                actual: stored.etag,
            });
        }
        inner.tasks.insert(task.id, task.clone());
        Ok(CasOutcome::Applied)
    }

    async fn delete_task(&self, id: TaskId) -> Result<bool> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        Ok(inner.tasks.remove(&id).is_some())
    }

    async fn pending_tasks(&self, queue_id: QueueId, limit: usize) -> Result<Vec<TaskRecord>> {
        let inner = self.inner.read().map_err(poison_err)?;
        let mut pending: Vec<TaskRecord> = inner
            .tasks
            .values()
            .filter(|t| t.queue_id == queue_id && t.status == TaskStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        pending.truncate(limit);
        Ok(pending)
    }

    async fn running_tasks(&self, limit: usize) -> Result<Vec<TaskRecord>> {
        let inner = self.inner.read().map_err(poison_err)?;
        let mut running: Vec<TaskRecord> = inner
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Running)
            .cloned()
            .collect();
        running.sort_by_key(|t| t.last_heartbeat);
        running.truncate(limit);
        Ok(running)
    }

    async fn tasks_in_queue(
        &self,
        queue_id: QueueId,
        after: Option<&Cursor>,
        limit: usize,
    ) -> Result<Vec<TaskRecord>> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(scan_after(
            inner.tasks.values().filter(|t| t.queue_id == queue_id),
            |t| (t.created_at, t.id.to_string()),
            after,
            limit,
        ))
    }

    async fn tasks_by_worker(
        &self,
        queue_id: QueueId,
        worker_id: WorkerId,
    ) -> Result<Vec<TaskRecord>> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner
            .tasks
            .values()
            .filter(|t| t.queue_id == queue_id && t.worker_id == Some(worker_id))
            .cloned()
            .collect())
    }

    async fn count_tasks(&self, queue_id: QueueId) -> Result<usize> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner
            .tasks
            .values()
            .filter(|t| t.queue_id == queue_id)
            .count())
    }

    async fn insert_worker(&self, worker: &WorkerRecord) -> Result<()> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        if inner.workers.contains_key(&worker.id) {
            return Err(Error::conflict(format!(
                "worker {} already exists",
                worker.id
            )));
        }
        inner.workers.insert(worker.id, worker.clone());
        Ok(())
    }

    async fn worker_by_id(&self, id: WorkerId) -> Result<Option<WorkerRecord>> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner.workers.get(&id).cloned())
    }

    async fn replace_worker(
        &self,
        worker: &WorkerRecord,
        expected_etag: u64,
    ) -> Result<CasOutcome> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let Some(stored) = inner.workers.get(&worker.id) else {
            return Ok(CasOutcome::Missing);
        };
        if stored.etag != expected_etag {
            return Ok(CasOutcome::Stale {
                actual: stored.etag,
            });
        }
        inner.workers.insert(worker.id, worker.clone());
        Ok(CasOutcome::Applied)
    }

    async fn delete_worker(&self, id: WorkerId) -> Result<bool> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        Ok(inner.workers.remove(&id).is_some())
    }

    async fn workers_in_queue(
        &self,
        queue_id: QueueId,
        after: Option<&Cursor>,
        limit: usize,
    ) -> Result<Vec<WorkerRecord>> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(scan_after(
            inner.workers.values().filter(|w| w.queue_id == queue_id),
            |w| (w.created_at, w.id.to_string()),
            after,
            limit,
        ))
    }

    async fn count_workers(&self, queue_id: QueueId) -> Result<usize> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner
            .workers
            .values()
            .filter(|w| w.queue_id == queue_id)
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskSpec;
    use chrono::{Duration, Utc};
    use serde_json::json;

    fn queue() -> QueueRecord {
        QueueRecord::new("test-queue", "pw", json!({}), Utc::now()).unwrap()
    }

    fn task_at(queue_id: QueueId, priority: i64, at: chrono::DateTime<Utc>) -> TaskRecord {
        let mut spec = TaskSpec::new(queue_id, json!({"lr": 0.1}));
        spec.priority = Some(priority);
        let mut task = TaskRecord::new(spec, at).unwrap();
        task.created_at = at;
        task
    }

    #[tokio::test]
    async fn queue_name_is_unique() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        store.insert_queue(&queue()).await?;

        let dup = QueueRecord::new("test-queue", "other", json!({}), Utc::now())?;
        let err = store.insert_queue(&dup).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn queue_lookup_by_name_and_id() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let q = queue();
        store.insert_queue(&q).await?;

        assert_eq!(store.queue_by_name("test-queue").await?.unwrap().id, q.id);
        assert_eq!(store.queue_by_id(q.id).await?.unwrap().name, q.name);
        assert!(store.queue_by_name("missing").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn cas_replace_detects_stale_etag() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let q = queue();
        store.insert_queue(&q).await?;
        let task = task_at(q.id, 10, Utc::now());
        store.insert_task(&task).await?;

        let mut first = task.clone();
        first.touch(Utc::now());
        assert!(store.replace_task(&first, task.etag).await?.is_applied());

        // A second writer still holding the old etag loses.
        let mut second = task.clone();
        second.touch(Utc::now());
        let outcome = store.replace_task(&second, task.etag).await?;
        assert_eq!(
            outcome,
            CasOutcome::Stale {
                actual: first.etag
            }
        );
        Ok(())
    }

    #[tokio::test]
    async fn cas_replace_missing_record() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let task = task_at(QueueId::generate(), 10, Utc::now());
        assert_eq!(store.replace_task(&task, 0).await?, CasOutcome::Missing);
        Ok(())
    }

    #[tokio::test]
    async fn pending_tasks_are_in_dispatch_order() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let q = queue();
        store.insert_queue(&q).await?;

        let base = Utc::now();
        let low = task_at(q.id, 5, base);
        let high = task_at(q.id, 10, base + Duration::seconds(1));
        let high_later = task_at(q.id, 10, base + Duration::seconds(2));
        for t in [&low, &high, &high_later] {
            store.insert_task(t).await?;
        }

        let pending = store.pending_tasks(q.id, 10).await?;
        let ids: Vec<TaskId> = pending.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![high.id, high_later.id, low.id]);
        Ok(())
    }

    #[tokio::test]
    async fn delete_queue_cascades() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let q = queue();
        store.insert_queue(&q).await?;
        store.insert_task(&task_at(q.id, 10, Utc::now())).await?;
        let worker =
            WorkerRecord::new(q.id, None, json!({}), None, Utc::now()).unwrap();
        store.insert_worker(&worker).await?;

        assert!(store.delete_queue(q.id).await?);
        assert_eq!(store.count_tasks(q.id).await?, 0);
        assert_eq!(store.count_workers(q.id).await?, 0);
        assert!(store.queue_by_name("test-queue").await?.is_none());

        // Second delete is a no-op.
        assert!(!store.delete_queue(q.id).await?);
        Ok(())
    }

    #[tokio::test]
    async fn scan_pagination_resumes_after_cursor() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let q = queue();
        store.insert_queue(&q).await?;

        let base = Utc::now();
        for i in 0..5 {
            store
                .insert_task(&task_at(q.id, 10, base + Duration::seconds(i)))
                .await?;
        }

        let first = store.tasks_in_queue(q.id, None, 2).await?;
        assert_eq!(first.len(), 2);

        let cursor = Cursor {
            created_at: first[1].created_at,
            id: first[1].id.to_string(),
        };
        let second = store.tasks_in_queue(q.id, Some(&cursor), 10).await?;
        assert_eq!(second.len(), 3);
        assert!(second[0].created_at > first[1].created_at);
        Ok(())
    }

    #[tokio::test]
    async fn queue_rename_updates_name_index() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let q = queue();
        store.insert_queue(&q).await?;

        let mut renamed = q.clone();
        renamed.name = "renamed".to_string();
        renamed.touch(Utc::now());
        assert!(store.replace_queue(&renamed, q.etag).await?.is_applied());

        assert!(store.queue_by_name("test-queue").await?.is_none());
        assert_eq!(store.queue_by_name("renamed").await?.unwrap().id, q.id);
        Ok(())
    }
}
