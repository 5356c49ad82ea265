//! Task routes: submit, fetch, heartbeat, report, mutation, listing.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use labtasker_core::{QueueId, TaskId, WorkerId};
use labtasker_engine::engine::{BulkUpdateOutcome, FetchRequest, ReportOutcome};
use labtasker_engine::task::{TaskRecord, TaskSpec, TaskStatus};

use crate::auth::AuthenticatedQueue;
use crate::error::{ApiError, ApiResult};
use crate::server::AppState;

/// Task document as returned on the wire.
#[derive(Debug, Serialize)]
pub struct TaskResponse {
    pub task_id: TaskId,
    pub queue_id: QueueId,
    pub task_name: Option<String>,
    pub status: TaskStatus,
    pub args: Value,
    pub metadata: Value,
    pub cmd: Option<String>,
    pub heartbeat_timeout: u64,
    pub task_timeout: Option<u64>,
    pub max_retries: u32,
    pub retries: u32,
    pub priority: i64,
    pub worker_id: Option<WorkerId>,
    pub start_time: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub summary: Value,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

impl From<TaskRecord> for TaskResponse {
    fn from(task: TaskRecord) -> Self {
        Self {
            task_id: task.id,
            queue_id: task.queue_id,
            task_name: task.task_name,
            status: task.status,
            args: task.args,
            metadata: task.metadata,
            cmd: task.cmd,
            heartbeat_timeout: task.heartbeat_timeout,
            task_timeout: task.task_timeout,
            max_retries: task.max_retries,
            retries: task.retries,
            priority: task.priority,
            worker_id: task.worker_id,
            start_time: task.start_time,
            last_heartbeat: task.last_heartbeat,
            summary: task.summary,
            created_at: task.created_at,
            last_modified: task.last_modified,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SubmitTaskRequest {
    #[serde(default)]
    pub task_name: Option<String>,
    #[serde(default)]
    pub args: Option<Value>,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub cmd: Option<String>,
    #[serde(default)]
    pub heartbeat_timeout: Option<u64>,
    #[serde(default)]
    pub task_timeout: Option<u64>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub priority: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct SubmitTaskResponse {
    pub task_id: TaskId,
}

#[derive(Debug, Deserialize)]
pub struct FetchTaskRequest {
    pub worker_id: String,
    #[serde(default)]
    pub required_fields: Vec<String>,
    #[serde(default)]
    pub extra_filter: Option<Value>,
    #[serde(default)]
    pub heartbeat_timeout: Option<u64>,
    #[serde(default = "default_true")]
    pub start_heartbeat: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Serialize)]
pub struct FetchTaskResponse {
    pub found: bool,
    pub task: Option<TaskResponse>,
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    pub worker_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ReportTaskRequest {
    pub worker_id: String,
    pub status: ReportOutcome,
    #[serde(default)]
    pub summary: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct LsTasksParams {
    #[serde(default)]
    pub filter: Option<String>,
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct TaskPageResponse {
    pub tasks: Vec<TaskResponse>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BulkUpdateRequest {
    #[serde(default)]
    pub filter: Option<Value>,
    pub updates: Map<String, Value>,
}

#[derive(Debug, Serialize)]
pub struct BulkUpdateResponse {
    pub results: Vec<BulkUpdateOutcome>,
}

#[derive(Debug, Deserialize, Default)]
pub struct RequeueTaskRequest {
    #[serde(default)]
    pub updates: Option<Map<String, Value>>,
}

fn parse_task_id(raw: &str) -> ApiResult<TaskId> {
    raw.parse().map_err(ApiError::from)
}

fn parse_worker_id(raw: &str) -> ApiResult<WorkerId> {
    raw.parse().map_err(ApiError::from)
}

/// Parses the `filter` query parameter, which carries a JSON filter
/// document as text.
fn parse_filter_param(filter: Option<&str>) -> ApiResult<Option<Value>> {
    filter
        .map(|raw| {
            serde_json::from_str(raw)
                .map_err(|e| ApiError::bad_request(format!("filter is not valid JSON: {e}")))
        })
        .transpose()
}

pub async fn submit(
    State(state): State<AppState>,
    AuthenticatedQueue(queue): AuthenticatedQueue,
    Json(body): Json<SubmitTaskRequest>,
) -> ApiResult<(StatusCode, Json<SubmitTaskResponse>)> {
    let spec = TaskSpec {
        queue_id: queue.id,
        task_name: body.task_name,
        args: body.args.unwrap_or_else(|| Value::Object(Map::new())),
        metadata: body.metadata.unwrap_or_else(|| Value::Object(Map::new())),
        cmd: body.cmd,
        heartbeat_timeout: body.heartbeat_timeout,
        task_timeout: body.task_timeout,
        max_retries: body.max_retries,
        priority: body.priority,
    };
    let task = state.engine.submit_task(spec).await?;
    Ok((
        StatusCode::CREATED,
        Json(SubmitTaskResponse { task_id: task.id }),
    ))
}

pub async fn fetch(
    State(state): State<AppState>,
    AuthenticatedQueue(queue): AuthenticatedQueue,
    Json(body): Json<FetchTaskRequest>,
) -> ApiResult<Json<FetchTaskResponse>> {
    let request = FetchRequest {
        worker_id: parse_worker_id(&body.worker_id)?,
        required_fields: body.required_fields,
        extra_filter: body.extra_filter,
        heartbeat_timeout: body.heartbeat_timeout,
        start_heartbeat: body.start_heartbeat,
    };
    let task = state.engine.fetch_next(queue.id, request).await?;
    Ok(Json(FetchTaskResponse {
        found: task.is_some(),
        task: task.map(TaskResponse::from),
    }))
}

pub async fn show(
    State(state): State<AppState>,
    AuthenticatedQueue(queue): AuthenticatedQueue,
    Path(task_id): Path<String>,
) -> ApiResult<Json<TaskResponse>> {
    let task = state
        .engine
        .get_task(queue.id, parse_task_id(&task_id)?)
        .await?;
    Ok(Json(task.into()))
}

pub async fn heartbeat(
    State(state): State<AppState>,
    AuthenticatedQueue(queue): AuthenticatedQueue,
    Path(task_id): Path<String>,
    Json(body): Json<HeartbeatRequest>,
) -> ApiResult<StatusCode> {
    state
        .engine
        .heartbeat(
            queue.id,
            parse_task_id(&task_id)?,
            parse_worker_id(&body.worker_id)?,
        )
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn report(
    State(state): State<AppState>,
    AuthenticatedQueue(queue): AuthenticatedQueue,
    Path(task_id): Path<String>,
    Json(body): Json<ReportTaskRequest>,
) -> ApiResult<Json<TaskResponse>> {
    let task = state
        .engine
        .report(
            queue.id,
            parse_task_id(&task_id)?,
            parse_worker_id(&body.worker_id)?,
            body.status,
            body.summary,
        )
        .await?;
    Ok(Json(task.into()))
}

pub async fn update(
    State(state): State<AppState>,
    AuthenticatedQueue(queue): AuthenticatedQueue,
    Path(task_id): Path<String>,
    Json(updates): Json<Map<String, Value>>,
) -> ApiResult<Json<TaskResponse>> {
    let task = state
        .engine
        .update_task(queue.id, parse_task_id(&task_id)?, &updates)
        .await?;
    Ok(Json(task.into()))
}

pub async fn delete(
    State(state): State<AppState>,
    AuthenticatedQueue(queue): AuthenticatedQueue,
    Path(task_id): Path<String>,
) -> ApiResult<StatusCode> {
    state
        .engine
        .delete_task(queue.id, parse_task_id(&task_id)?)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn cancel(
    State(state): State<AppState>,
    AuthenticatedQueue(queue): AuthenticatedQueue,
    Path(task_id): Path<String>,
) -> ApiResult<Json<TaskResponse>> {
    let task = state
        .engine
        .cancel_task(queue.id, parse_task_id(&task_id)?)
        .await?;
    Ok(Json(task.into()))
}

pub async fn requeue(
    State(state): State<AppState>,
    AuthenticatedQueue(queue): AuthenticatedQueue,
    Path(task_id): Path<String>,
    body: Option<Json<RequeueTaskRequest>>,
) -> ApiResult<Json<TaskResponse>> {
    let updates = body.and_then(|Json(b)| b.updates);
    let task = state
        .engine
        .requeue_task(queue.id, parse_task_id(&task_id)?, updates.as_ref())
        .await?;
    Ok(Json(task.into()))
}

pub async fn ls(
    State(state): State<AppState>,
    AuthenticatedQueue(queue): AuthenticatedQueue,
    Query(params): Query<LsTasksParams>,
) -> ApiResult<Json<TaskPageResponse>> {
    let filter = parse_filter_param(params.filter.as_deref())?;
    let page = state
        .engine
        .ls_tasks(
            queue.id,
            filter.as_ref(),
            params.cursor.as_deref(),
            params.limit.unwrap_or(100),
        )
        .await?;
    Ok(Json(TaskPageResponse {
        tasks: page.tasks.into_iter().map(TaskResponse::from).collect(),
        next_cursor: page.next_cursor,
    }))
}

pub async fn bulk_update(
    State(state): State<AppState>,
    AuthenticatedQueue(queue): AuthenticatedQueue,
    Json(body): Json<BulkUpdateRequest>,
) -> ApiResult<Json<BulkUpdateResponse>> {
    let results = state
        .engine
        .bulk_update_tasks(queue.id, body.filter.as_ref(), &body.updates)
        .await?;
    Ok(Json(BulkUpdateResponse { results }))
}
