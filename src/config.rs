//! Environment-driven settings for the `pgtrace` binary.

use std::path::PathBuf;

use chrono::Duration;
use thiserror::Error;

use crate::tracer::ResponseMode;

pub const ENV_CAPTURE: &str = "PGTRACE_CAPTURE";
pub const ENV_SERVER_PORT: &str = "PGTRACE_SERVER_PORT";
pub const ENV_DB: &str = "PGTRACE_DB";
pub const ENV_RESPONSE_MODE: &str = "PGTRACE_RESPONSE_MODE";
pub const ENV_IDLE_TIMEOUT_SECS: &str = "PGTRACE_IDLE_TIMEOUT_SECS";
pub const ENV_MAX_CONNECTIONS: &str = "PGTRACE_MAX_CONNECTIONS";
pub const ENV_CHANNEL_CAPACITY: &str = "PGTRACE_CHANNEL_CAPACITY";

pub const DEFAULT_SERVER_PORT: u16 = 5432;
pub const DEFAULT_DB: &str = "pgtrace.db";
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),
    #[error("Invalid value for {name}: '{value}'")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct TraceConfig {
    pub capture: PathBuf,
    pub server_port: u16,
    pub db_path: String,
    pub response_mode: ResponseMode,
    pub idle_timeout: Option<Duration>,
    pub max_connections: Option<usize>,
    pub channel_capacity: usize,
}

impl TraceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source; `lookup` returns `None` for unset names.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let capture = lookup(ENV_CAPTURE)
            .filter(|v| !v.is_empty())
            .ok_or(ConfigError::Missing(ENV_CAPTURE))?;

        let server_port = parse(&lookup, ENV_SERVER_PORT)?.unwrap_or(DEFAULT_SERVER_PORT);
        let db_path = lookup(ENV_DB).unwrap_or_else(|| DEFAULT_DB.to_string());

        let response_mode = match lookup(ENV_RESPONSE_MODE) {
            Some(value) => value.parse::<ResponseMode>().map_err(|_| ConfigError::Invalid {
                name: ENV_RESPONSE_MODE,
                value,
            })?,
            None => ResponseMode::default(),
        };

        let idle_timeout = parse::<i64, _>(&lookup, ENV_IDLE_TIMEOUT_SECS)?
            .map(|secs| positive(ENV_IDLE_TIMEOUT_SECS, secs).map(Duration::seconds))
            .transpose()?;
        let max_connections = parse::<usize, _>(&lookup, ENV_MAX_CONNECTIONS)?
            .map(|max| positive(ENV_MAX_CONNECTIONS, max))
            .transpose()?;
        let channel_capacity = match parse::<usize, _>(&lookup, ENV_CHANNEL_CAPACITY)? {
            Some(capacity) => positive(ENV_CHANNEL_CAPACITY, capacity)?,
            None => DEFAULT_CHANNEL_CAPACITY,
        };

        Ok(Self {
            capture: PathBuf::from(capture),
            server_port,
            db_path,
            response_mode,
            idle_timeout,
            max_connections,
            channel_capacity,
        })
    }
}

fn parse<T, F>(lookup: &F, name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { name, value }),
    }
}

fn positive<T>(name: &'static str, value: T) -> Result<T, ConfigError>
where
    T: PartialOrd + Default + ToString,
{
    if value > T::default() {
        Ok(value)
    } else {
        Err(ConfigError::Invalid { name, value: value.to_string() })
    }
}
