use std::env;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use gantry_core::manager::DEFAULT_OPERATION_TIMEOUT;

/// Broker process configuration, read from `GANTRY_*` environment
/// variables. Invalid values are startup failures (the process exits
/// non-zero).
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Catalog API port.
    pub port: u16,
    /// Health/metrics port.
    pub status_port: u16,
    /// Run against in-memory stores instead of PostgreSQL.
    pub db_in_memory: bool,
    /// Disable the startup recovery loader (read-only replicas).
    pub disable_process_operations_in_progress: bool,
    /// Wall-clock budget per operation.
    pub operation_timeout: Duration,
    /// Runtime version stamped on provisions that do not pin one.
    pub default_runtime_version: String,
    pub workers_per_queue: usize,
    /// Expose raw failure descriptions on the last-operation endpoint.
    pub development_mode: bool,
    /// Base URL for instance dashboard links.
    pub console_url: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            status_port: 8071,
            db_in_memory: false,
            disable_process_operations_in_progress: false,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            default_runtime_version: "2.4.0".to_string(),
            workers_per_queue: 5,
            development_mode: false,
            console_url: "https://console.gantry.cloud".to_string(),
        }
    }
}

impl BrokerConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            port: env_parse("GANTRY_PORT", defaults.port)?,
            status_port: env_parse("GANTRY_STATUS_PORT", defaults.status_port)?,
            db_in_memory: env_bool("GANTRY_DB_IN_MEMORY", defaults.db_in_memory)?,
            disable_process_operations_in_progress: env_bool(
                "GANTRY_DISABLE_PROCESS_OPERATIONS_IN_PROGRESS",
                defaults.disable_process_operations_in_progress,
            )?,
            operation_timeout: Duration::from_secs(env_parse(
                "GANTRY_OPERATION_TIMEOUT_SECS",
                defaults.operation_timeout.as_secs(),
            )?),
            default_runtime_version: env::var("GANTRY_RUNTIME_VERSION")
                .unwrap_or(defaults.default_runtime_version),
            workers_per_queue: env_parse(
                "GANTRY_WORKERS_PER_QUEUE",
                defaults.workers_per_queue,
            )?,
            development_mode: env_bool("GANTRY_DEVELOPMENT_MODE", defaults.development_mode)?,
            console_url: env::var("GANTRY_CONSOLE_URL").unwrap_or(defaults.console_url),
        })
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("invalid value for {name}: {raw:?}")),
        Err(_) => Ok(default),
    }
}

fn env_bool(name: &str, default: bool) -> Result<bool> {
    match env::var(name) {
        Ok(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => bail!("invalid boolean for {name}: {raw:?}"),
        },
        Err(_) => Ok(default),
    }
}
