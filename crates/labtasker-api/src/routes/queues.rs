//! Queue routes: create, show, update, delete.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use labtasker_core::QueueId;
use labtasker_engine::engine::QueueUpdate;
use labtasker_engine::queue::QueueRecord;

use crate::auth::AuthenticatedQueue;
use crate::error::ApiResult;
use crate::server::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateQueueRequest {
    pub queue_name: String,
    pub password: String,
    #[serde(default)]
    pub metadata: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct CreateQueueResponse {
    pub queue_id: QueueId,
}

/// Queue document as returned on the wire. The password hash never leaves
/// the server.
#[derive(Debug, Serialize)]
pub struct QueueResponse {
    pub queue_id: QueueId,
    pub queue_name: String,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

impl From<QueueRecord> for QueueResponse {
    fn from(queue: QueueRecord) -> Self {
        Self {
            queue_id: queue.id,
            queue_name: queue.name,
            metadata: queue.metadata,
            created_at: queue.created_at,
            last_modified: queue.last_modified,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct UpdateQueueRequest {
    #[serde(default)]
    pub new_queue_name: Option<String>,
    #[serde(default)]
    pub new_password: Option<String>,
    #[serde(default)]
    pub metadata_update: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct DeleteQueueParams {
    #[serde(default)]
    pub cascade: Option<bool>,
}

pub async fn create(
    State(state): State<AppState>,
    Json(body): Json<CreateQueueRequest>,
) -> ApiResult<(StatusCode, Json<CreateQueueResponse>)> {
    let queue = state
        .engine
        .create_queue(&body.queue_name, &body.password, body.metadata)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(CreateQueueResponse { queue_id: queue.id }),
    ))
}

pub async fn show(AuthenticatedQueue(queue): AuthenticatedQueue) -> Json<QueueResponse> {
    Json(queue.into())
}

pub async fn update(
    State(state): State<AppState>,
    AuthenticatedQueue(queue): AuthenticatedQueue,
    Json(body): Json<UpdateQueueRequest>,
) -> ApiResult<Json<QueueResponse>> {
    let updated = state
        .engine
        .update_queue(
            queue.id,
            QueueUpdate {
                new_name: body.new_queue_name,
                new_password: body.new_password,
                metadata_update: body.metadata_update,
            },
        )
        .await?;
    Ok(Json(updated.into()))
}

pub async fn delete(
    State(state): State<AppState>,
    AuthenticatedQueue(queue): AuthenticatedQueue,
    Query(params): Query<DeleteQueueParams>,
) -> ApiResult<StatusCode> {
    state
        .engine
        .delete_queue(queue.id, params.cascade.unwrap_or(true))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
