//! Event routes: subscribe and long-poll.
//!
//! A subscription is server-side state: `subscribe` registers a filtered
//! buffer on the engine's event bus and returns an opaque handle; `next`
//! long-polls that buffer. Handles idle past the configured TTL are pruned
//! (long-poll consumers vanish silently, and an orphaned buffer would
//! otherwise accumulate events forever).

use std::time::Duration;

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};

use labtasker_engine::events::{EntityKind, Event, EventFilter};

use crate::auth::AuthenticatedQueue;
use crate::error::{ApiError, ApiResult};
use crate::server::AppState;

/// Ceiling on a single long-poll wait.
const MAX_POLL_SECS: u64 = 300;
/// Default long-poll wait.
const DEFAULT_POLL_SECS: u64 = 30;

#[derive(Debug, Deserialize)]
pub struct SubscribeRequest {
    /// Restrict to these entity kinds.
    #[serde(default)]
    pub entities: Option<Vec<EntityKind>>,
    /// Restrict to transitions into these states.
    #[serde(default)]
    pub new_statuses: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
pub struct SubscribeResponse {
    /// Opaque long-poll token.
    pub handle: String,
}

#[derive(Debug, Deserialize)]
pub struct NextEventRequest {
    pub handle: String,
    /// Seconds to wait for an event; capped at 300.
    #[serde(default)]
    pub timeout: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct NextEventResponse {
    pub found: bool,
    pub event: Option<Event>,
}

pub async fn subscribe(
    State(state): State<AppState>,
    AuthenticatedQueue(queue): AuthenticatedQueue,
    Json(body): Json<SubscribeRequest>,
) -> ApiResult<Json<SubscribeResponse>> {
    let filter = EventFilter {
        entities: body.entities,
        new_statuses: body.new_statuses,
    };
    let subscription = state.engine.bus().subscribe(queue.id, filter);
    let handle = state.subscriptions.insert(queue.id, subscription);
    Ok(Json(SubscribeResponse { handle }))
}

pub async fn next(
    State(state): State<AppState>,
    AuthenticatedQueue(queue): AuthenticatedQueue,
    Json(body): Json<NextEventRequest>,
) -> ApiResult<Json<NextEventResponse>> {
    let timeout = Duration::from_secs(
        body.timeout
            .unwrap_or(DEFAULT_POLL_SECS)
            .min(MAX_POLL_SECS),
    );
    let subscription = state
        .subscriptions
        .checkout(&body.handle, queue.id)
        .ok_or_else(|| ApiError::not_found("unknown or expired event subscription"))?;

    let event = subscription.next_event(timeout).await;
    Ok(Json(NextEventResponse {
        found: event.is_some(),
        event,
    }))
}
