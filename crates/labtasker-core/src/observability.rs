//! Observability infrastructure.
//!
//! Structured logging with consistent spans. This module provides the
//! initialization helper and span constructors used across the server and
//! the dispatch engine.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `labtasker_engine=debug`)
///
/// # Example
///
/// ```rust
/// use labtasker_core::observability::{init_logging, LogFormat};
///
/// init_logging(LogFormat::Pretty);
/// ```
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates a span for dispatch-engine operations with standard fields.
///
/// # Example
///
/// ```rust
/// use labtasker_core::observability::dispatch_span;
///
/// let span = dispatch_span("fetch_next", "01JC0Q4Z3V8N");
/// let _guard = span.enter();
/// // ... engine operation
/// ```
#[must_use]
pub fn dispatch_span(operation: &str, queue_id: &str) -> Span {
    tracing::info_span!("dispatch", op = operation, queue_id = queue_id)
}
