//! Server configuration.
//!
//! Loaded from environment variables; every knob has a development-friendly
//! default so `labtasker-server` starts with no configuration at all.

use labtasker_core::{Error, LogFormat, Result};

/// Configuration for the Labtasker API server.
#[derive(Debug, Clone)]
pub struct Config {
    /// Listen address.
    pub host: String,
    /// Listen port.
    pub port: u16,
    /// Store URL. `memory:` selects the in-process store; this build knows
    /// no other driver.
    pub db_url: String,
    /// Reaper sweep period in seconds. Keep at or below half the smallest
    /// heartbeat timeout in use.
    pub reaper_period_secs: u64,
    /// Per-subscriber event buffer capacity.
    pub event_buffer_size: usize,
    /// Idle seconds after which an event subscription is pruned.
    pub subscription_idle_timeout_secs: u64,
    /// Log output format.
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9321,
            db_url: "memory:".to_string(),
            reaper_period_secs: 10,
            event_buffer_size: 1024,
            subscription_idle_timeout_secs: 300,
            log_format: LogFormat::Pretty,
        }
    }
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// Supported env vars:
    /// - `API_HOST`
    /// - `API_PORT`
    /// - `DB_URL`
    /// - `HEARTBEAT_REAPER_PERIOD` (seconds)
    /// - `EVENT_BUFFER_SIZE`
    /// - `SUBSCRIPTION_IDLE_TIMEOUT` (seconds)
    /// - `LOG_FORMAT` (`pretty` | `json`)
    ///
    /// # Errors
    ///
    /// Returns an error if any variable is present but cannot be parsed, or
    /// a value is out of range.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(host) = env_string("API_HOST") {
            config.host = host;
        }
        if let Some(port) = env_u16("API_PORT")? {
            config.port = port;
        }
        if let Some(db_url) = env_string("DB_URL") {
            config.db_url = db_url;
        }
        if let Some(period) = env_u64("HEARTBEAT_REAPER_PERIOD")? {
            if period == 0 {
                return Err(Error::invalid_input(
                    "HEARTBEAT_REAPER_PERIOD must be greater than 0",
                ));
            }
            config.reaper_period_secs = period;
        }
        if let Some(size) = env_usize("EVENT_BUFFER_SIZE")? {
            if size == 0 {
                return Err(Error::invalid_input(
                    "EVENT_BUFFER_SIZE must be greater than 0",
                ));
            }
            config.event_buffer_size = size;
        }
        if let Some(idle) = env_u64("SUBSCRIPTION_IDLE_TIMEOUT")? {
            if idle == 0 {
                return Err(Error::invalid_input(
                    "SUBSCRIPTION_IDLE_TIMEOUT must be greater than 0",
                ));
            }
            config.subscription_idle_timeout_secs = idle;
        }
        if let Some(format) = env_string("LOG_FORMAT") {
            config.log_format = parse_log_format(&format)?;
        }

        Ok(config)
    }
}

fn parse_log_format(value: &str) -> Result<LogFormat> {
    match value.trim().to_ascii_lowercase().as_str() {
        "json" => Ok(LogFormat::Json),
        "pretty" => Ok(LogFormat::Pretty),
        other => Err(Error::invalid_input(format!(
            "LOG_FORMAT must be 'pretty' or 'json' (got {other})"
        ))),
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn env_u16(name: &str) -> Result<Option<u16>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse::<u16>()
        .map(Some)
        .map_err(|e| Error::invalid_input(format!("{name} must be a u16: {e}")))
}

fn env_u64(name: &str) -> Result<Option<u64>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse::<u64>()
        .map(Some)
        .map_err(|e| Error::invalid_input(format!("{name} must be a u64: {e}")))
}

fn env_usize(name: &str) -> Result<Option<usize>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse::<usize>()
        .map(Some)
        .map_err(|e| Error::invalid_input(format!("{name} must be a usize: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_development_friendly() {
        let config = Config::default();
        assert_eq!(config.port, 9321);
        assert_eq!(config.db_url, "memory:");
        assert_eq!(config.event_buffer_size, 1024);
    }

    #[test]
    fn log_format_parsing() {
        assert_eq!(parse_log_format("json").unwrap(), LogFormat::Json);
        assert_eq!(parse_log_format("PRETTY").unwrap(), LogFormat::Pretty);
        assert!(parse_log_format("yaml").is_err());
    }
}
