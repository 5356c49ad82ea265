//! Worker routes: register, show, update, delete, listing.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use labtasker_core::{QueueId, WorkerId};
use labtasker_engine::engine::{WorkerStatusUpdate, WorkerUpdate};
use labtasker_engine::worker::{WorkerRecord, WorkerStatus};

use crate::auth::AuthenticatedQueue;
use crate::error::{ApiError, ApiResult};
use crate::server::AppState;

/// Worker document as returned on the wire.
#[derive(Debug, Serialize)]
pub struct WorkerResponse {
    pub worker_id: WorkerId,
    pub queue_id: QueueId,
    pub worker_name: Option<String>,
    pub status: WorkerStatus,
    pub metadata: Value,
    pub retries: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

impl From<WorkerRecord> for WorkerResponse {
    fn from(worker: WorkerRecord) -> Self {
        Self {
            worker_id: worker.id,
            queue_id: worker.queue_id,
            worker_name: worker.worker_name,
            status: worker.status,
            metadata: worker.metadata,
            retries: worker.retries,
            max_retries: worker.max_retries,
            created_at: worker.created_at,
            last_modified: worker.last_modified,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RegisterWorkerRequest {
    #[serde(default)]
    pub worker_name: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct RegisterWorkerResponse {
    pub worker_id: WorkerId,
}

#[derive(Debug, Deserialize)]
pub struct UpdateWorkerRequest {
    #[serde(default)]
    pub worker_name: Option<String>,
    #[serde(default)]
    pub status: Option<WorkerStatusUpdate>,
    #[serde(default)]
    pub metadata_update: Option<Value>,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct LsWorkersParams {
    #[serde(default)]
    pub filter: Option<String>,
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct WorkerPageResponse {
    pub workers: Vec<WorkerResponse>,
    pub next_cursor: Option<String>,
}

fn parse_worker_id(raw: &str) -> ApiResult<WorkerId> {
    raw.parse().map_err(ApiError::from)
}

pub async fn register(
    State(state): State<AppState>,
    AuthenticatedQueue(queue): AuthenticatedQueue,
    Json(body): Json<RegisterWorkerRequest>,
) -> ApiResult<(StatusCode, Json<RegisterWorkerResponse>)> {
    let worker = state
        .engine
        .register_worker(queue.id, body.worker_name, body.metadata, body.max_retries)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(RegisterWorkerResponse {
            worker_id: worker.id,
        }),
    ))
}

pub async fn show(
    State(state): State<AppState>,
    AuthenticatedQueue(queue): AuthenticatedQueue,
    Path(worker_id): Path<String>,
) -> ApiResult<Json<WorkerResponse>> {
    let worker = state
        .engine
        .get_worker(queue.id, parse_worker_id(&worker_id)?)
        .await?;
    Ok(Json(worker.into()))
}

pub async fn update(
    State(state): State<AppState>,
    AuthenticatedQueue(queue): AuthenticatedQueue,
    Path(worker_id): Path<String>,
    Json(body): Json<UpdateWorkerRequest>,
) -> ApiResult<Json<WorkerResponse>> {
    let worker = state
        .engine
        .update_worker(
            queue.id,
            parse_worker_id(&worker_id)?,
            WorkerUpdate {
                worker_name: body.worker_name,
                status: body.status,
                metadata_update: body.metadata_update,
                max_retries: body.max_retries,
            },
        )
        .await?;
    Ok(Json(worker.into()))
}

pub async fn delete(
    State(state): State<AppState>,
    AuthenticatedQueue(queue): AuthenticatedQueue,
    Path(worker_id): Path<String>,
) -> ApiResult<StatusCode> {
    state
        .engine
        .delete_worker(queue.id, parse_worker_id(&worker_id)?)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn ls(
    State(state): State<AppState>,
    AuthenticatedQueue(queue): AuthenticatedQueue,
    Query(params): Query<LsWorkersParams>,
) -> ApiResult<Json<WorkerPageResponse>> {
    let filter = params
        .filter
        .as_deref()
        .map(|raw| {
            serde_json::from_str::<Value>(raw)
                .map_err(|e| ApiError::bad_request(format!("filter is not valid JSON: {e}")))
        })
        .transpose()?;
    let page = state
        .engine
        .ls_workers(
            queue.id,
            filter.as_ref(),
            params.cursor.as_deref(),
            params.limit.unwrap_or(100),
        )
        .await?;
    Ok(Json(WorkerPageResponse {
        workers: page.workers.into_iter().map(WorkerResponse::from).collect(),
        next_cursor: page.next_cursor,
    }))
}
