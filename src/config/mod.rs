//! Configuration.
//!
//! Process settings come from environment variables, loaded once at startup
//! and failing fast if required vars are missing. Queue tuning (poll cadence,
//! concurrency, per-type retry budgets) comes from an optional TOML file.
//! Sensitive values are wrapped in `secrecy::SecretString` to prevent log
//! leaks.

pub mod queue;

pub use queue::{DispatcherSettings, QueueConfig};

use crate::error::{Error, Result};
use secrecy::SecretString;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    /// Identity recorded as the claim owner of items this process works on.
    /// Startup recovery only resets items claimed under this id, so it must
    /// survive restarts.
    pub worker_id: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            worker_id: std::env::var("WORKQ_WORKER_ID").unwrap_or_else(|_| default_worker_id()),
        })
    }
}

/// `workq-<hostname>`: stable across restarts of the same host, unlike a pid.
pub fn default_worker_id() -> String {
    match hostname::get().ok().and_then(|h| h.into_string().ok()) {
        Some(host) => format!("workq-{host}"),
        None => "workq".to_string(),
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}
