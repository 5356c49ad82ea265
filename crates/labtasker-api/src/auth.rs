//! Per-queue shared-secret authentication.
//!
//! Every queue-scoped route requires `Authorization: Basic` with the queue
//! name as the username and the queue password as the password. The
//! extractor verifies the pair against the stored hash and hands the
//! handler the authenticated queue record, so handlers never see the
//! credential itself.

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use labtasker_engine::queue::QueueRecord;

use crate::error::ApiError;
use crate::server::AppState;

/// The queue a request authenticated as.
#[derive(Debug, Clone)]
pub struct AuthenticatedQueue(pub QueueRecord);

impl FromRequestParts<AppState> for AuthenticatedQueue {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(ApiError::missing_auth)?;

        let (queue_name, password) = parse_basic(header).ok_or_else(ApiError::missing_auth)?;
        let queue = state.engine.authenticate(&queue_name, &password).await?;
        Ok(Self(queue))
    }
}

/// Parses a `Basic <base64(user:pass)>` header value.
fn parse_basic(header: &str) -> Option<(String, String)> {
    let encoded = header.strip_prefix("Basic ")?;
    let decoded = BASE64.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

/// Builds the header value a client would send for a queue.
#[must_use]
pub fn basic_auth_header(queue_name: &str, password: &str) -> String {
    format!("Basic {}", BASE64.encode(format!("{queue_name}:{password}")))
}
