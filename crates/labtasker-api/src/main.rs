//! `labtasker-server` binary entrypoint.
//!
//! Loads configuration from environment variables, connects the store, and
//! serves the HTTP API with the lease reaper running in the background.
//!
//! Exit codes: 0 on clean shutdown, 1 on configuration error, 2 when the
//! store is unreachable at startup.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

use std::process::ExitCode;
use std::sync::Arc;

use labtasker_core::{init_logging, SystemClock};
use labtasker_engine::bus::EventBus;
use labtasker_engine::engine::DispatchEngine;
use labtasker_engine::store::memory::MemoryStore;
use labtasker_engine::store::Store;

use labtasker_api::config::Config;
use labtasker_api::server::Server;

const EXIT_CONFIG: u8 = 1;
const EXIT_STORE: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(error) => {
            eprintln!("configuration error: {error}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    init_logging(config.log_format);

    let store = match connect_store(&config.db_url).await {
        Ok(store) => store,
        Err(message) => {
            tracing::error!(db_url = %config.db_url, %message, "store unavailable at startup");
            return ExitCode::from(EXIT_STORE);
        }
    };

    let engine = DispatchEngine::new(
        store,
        EventBus::new(config.event_buffer_size),
        Arc::new(SystemClock),
    );

    let server = Server::new(config, engine);
    match server.serve().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(%error, "server exited with an error");
            ExitCode::from(EXIT_CONFIG)
        }
    }
}

/// Resolves the store driver from `DB_URL` and verifies connectivity.
async fn connect_store(db_url: &str) -> Result<Arc<dyn Store>, String> {
    let store: Arc<dyn Store> = if db_url == "memory:" {
        tracing::warn!("using the in-memory store; state is lost on restart");
        Arc::new(MemoryStore::new())
    } else {
        return Err(format!(
            "no store driver for '{db_url}' in this build (only 'memory:' is available)"
        ));
    };

    store.ping().await.map_err(|e| e.to_string())?;
    Ok(store)
}
