//! Queue tuning loaded from TOML.
//!
//! ```toml
//! [dispatcher]
//! poll_interval_ms = 2500
//! max_concurrent = 4
//!
//! [types.DeleteStudy]
//! max_retries = 5
//! failure_delay_secs = 30
//! ```

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::policy::TypeSettings;

/// Top-level TOML document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub dispatcher: DispatcherSettings,
    /// Settings used for types without their own table.
    pub defaults: TypeSettings,
    /// Per-type overrides, keyed by work type.
    pub types: HashMap<String, TypeSettings>,
}

impl QueueConfig {
    /// Load from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::parse(&content)
            .map_err(|e| Error::Config(format!("bad queue config {}: {e}", path.display())))
    }

    /// Parse a TOML document.
    pub fn parse(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Settings for `work_type`, falling back to `defaults`.
    pub fn settings_for(&self, work_type: &str) -> &TypeSettings {
        self.types.get(work_type).unwrap_or(&self.defaults)
    }
}

/// Dispatcher loop settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DispatcherSettings {
    /// Fallback poll cadence when no wake-up arrives.
    pub poll_interval_ms: u64,
    /// Candidates fetched per type per poll (further bounded by free workers).
    pub batch_size: usize,
    /// Worker pool size: items processed concurrently.
    pub max_concurrent: usize,
    /// Watchdog: raise `StopPending` on a `process()` call running longer
    /// than this. Unset means no watchdog.
    pub processing_timeout_secs: Option<u64>,
    /// After the watchdog fires, how long to wait before abandoning the call.
    pub stop_grace_secs: u64,
    /// On shutdown, how long to wait for running items to postpone.
    pub shutdown_grace_secs: u64,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2500,
            batch_size: 8,
            max_concurrent: 4,
            processing_timeout_secs: None,
            stop_grace_secs: 30,
            shutdown_grace_secs: 30,
        }
    }
}

impl DispatcherSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn processing_timeout(&self) -> Option<Duration> {
        self.processing_timeout_secs.map(Duration::from_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}
