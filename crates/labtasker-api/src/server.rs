//! Server assembly: application state, router, and the serve loop.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use ulid::Ulid;

use labtasker_core::QueueId;
use labtasker_engine::bus::Subscription;
use labtasker_engine::engine::{DispatchEngine, LeaseReaper};

use crate::config::Config;
use crate::routes;

/// Shared application state for all request handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    /// The dispatch engine.
    pub engine: DispatchEngine,
    /// Live event subscriptions, keyed by opaque handle.
    pub subscriptions: Arc<SubscriptionRegistry>,
}

/// Registry of live long-poll event subscriptions.
///
/// Entries are pruned when they have not been polled within the idle
/// timeout; pruning happens on every insert so the registry cannot grow
/// unbounded on abandoned handles.
#[derive(Debug)]
pub struct SubscriptionRegistry {
    idle_timeout: Duration,
    entries: Mutex<HashMap<String, SubscriptionEntry>>,
}

#[derive(Debug)]
struct SubscriptionEntry {
    queue_id: QueueId,
    subscription: Arc<Subscription>,
    last_polled: Instant,
}

impl SubscriptionRegistry {
    /// Creates a registry with the given idle timeout.
    #[must_use]
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            idle_timeout,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a subscription and returns its opaque handle.
    ///
    /// # Panics
    ///
    /// Panics if the registry lock is poisoned.
    pub fn insert(&self, queue_id: QueueId, subscription: Subscription) -> String {
        let handle = Ulid::new().to_string();
        let mut entries = self.entries.lock().expect("subscription lock poisoned");
        let now = Instant::now();
        entries.retain(|_, entry| now.duration_since(entry.last_polled) < self.idle_timeout);
        entries.insert(
            handle.clone(),
            SubscriptionEntry {
                queue_id,
                subscription: Arc::new(subscription),
                last_polled: now,
            },
        );
        handle
    }

    /// Looks up a handle, scoped to the queue that created it, refreshing
    /// its idle clock.
    ///
    /// # Panics
    ///
    /// Panics if the registry lock is poisoned.
    #[must_use]
    pub fn checkout(&self, handle: &str, queue_id: QueueId) -> Option<Arc<Subscription>> {
        let mut entries = self.entries.lock().expect("subscription lock poisoned");
        let entry = entries.get_mut(handle)?;
        if entry.queue_id != queue_id {
            return None;
        }
        entry.last_polled = Instant::now();
        Some(Arc::clone(&entry.subscription))
    }

    /// Number of live entries, for tests.
    ///
    /// # Panics
    ///
    /// Panics if the registry lock is poisoned.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().expect("subscription lock poisoned").len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Service status.
    pub status: &'static str,
    /// Store reachability.
    pub database: &'static str,
}

async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    match state.engine.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "ok",
                database: "ok",
            }),
        ),
        Err(error) => {
            tracing::warn!(%error, "health check failed to reach the store");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "unhealthy",
                    database: "unreachable",
                }),
            )
        }
    }
}

/// The Labtasker API server.
#[derive(Debug)]
pub struct Server {
    config: Config,
    engine: DispatchEngine,
}

impl Server {
    /// Creates a server over an engine.
    #[must_use]
    pub fn new(config: Config, engine: DispatchEngine) -> Self {
        Self { config, engine }
    }

    /// Builds the full router, suitable for in-process testing via
    /// `tower::ServiceExt::oneshot`.
    #[must_use]
    pub fn router(&self) -> Router {
        let state = AppState {
            engine: self.engine.clone(),
            subscriptions: Arc::new(SubscriptionRegistry::new(Duration::from_secs(
                self.config.subscription_idle_timeout_secs,
            ))),
        };

        Router::new()
            .route("/health", get(health))
            .merge(routes::api_router())
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Binds the listen address and serves until SIGINT/SIGTERM.
    ///
    /// The lease reaper runs as a background task for the lifetime of the
    /// server.
    ///
    /// # Errors
    ///
    /// Returns an error when the listen address cannot be bound or the
    /// accept loop fails.
    pub async fn serve(self) -> labtasker_core::Result<()> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let router = self.router();

        let reaper = LeaseReaper::new(
            self.engine.clone(),
            Duration::from_secs(self.config.reaper_period_secs),
        );
        let reaper_handle = tokio::spawn(reaper.run());

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| labtasker_core::Error::internal(format!("failed to bind {addr}: {e}")))?;

        tracing::info!(
            addr = %addr,
            reaper_period_secs = self.config.reaper_period_secs,
            "starting Labtasker API server"
        );

        let result = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| labtasker_core::Error::internal(format!("server error: {e}")));

        reaper_handle.abort();
        tracing::info!("server stopped");
        result
    }
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                tracing::warn!(%error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
