//! Route handlers and wire DTOs, one module per resource.

pub mod events;
pub mod queues;
pub mod tasks;
pub mod workers;

use axum::routing::{get, post};
use axum::Router;

use crate::server::AppState;

/// Assembles the versioned API router.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/api/v1/queues", post(queues::create))
        .route(
            "/api/v1/queues/me",
            get(queues::show).patch(queues::update).delete(queues::delete),
        )
        .route(
            "/api/v1/queues/me/tasks",
            post(tasks::submit).get(tasks::ls),
        )
        .route("/api/v1/queues/me/tasks/fetch", post(tasks::fetch))
        .route("/api/v1/queues/me/tasks/updates", post(tasks::bulk_update))
        .route(
            "/api/v1/queues/me/tasks/{task_id}",
            get(tasks::show).patch(tasks::update).delete(tasks::delete),
        )
        .route(
            "/api/v1/queues/me/tasks/{task_id}/heartbeat",
            post(tasks::heartbeat),
        )
        .route(
            "/api/v1/queues/me/tasks/{task_id}/report",
            post(tasks::report),
        )
        .route(
            "/api/v1/queues/me/tasks/{task_id}/cancel",
            post(tasks::cancel),
        )
        .route(
            "/api/v1/queues/me/tasks/{task_id}/requeue",
            post(tasks::requeue),
        )
        .route(
            "/api/v1/queues/me/workers",
            post(workers::register).get(workers::ls),
        )
        .route(
            "/api/v1/queues/me/workers/{worker_id}",
            get(workers::show).patch(workers::update).delete(workers::delete),
        )
        .route(
            "/api/v1/queues/me/events/subscribe",
            post(events::subscribe),
        )
        .route("/api/v1/queues/me/events/next", post(events::next))
}
