//! Configuration for the store and the manager.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SilenceError};

/// Configuration for the silence manager and its background worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// How often the GC worker runs (in seconds).
    pub gc_interval_secs: u64,
    /// Upper bound on one GC cycle (in seconds).
    pub gc_timeout_secs: u64,
    /// How long expired silences are kept before hard deletion (in seconds).
    pub retention_secs: u64,
    /// How long `stop` waits for the worker (in seconds).
    pub shutdown_timeout_secs: u64,
    /// Silences ending within this window are logged each cycle (in seconds).
    pub expiry_warning_window_secs: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            gc_interval_secs: 3600,
            gc_timeout_secs: 300,
            retention_secs: 86_400,
            shutdown_timeout_secs: 30,
            expiry_warning_window_secs: 900,
        }
    }
}

impl ManagerConfig {
    /// GC tick interval.
    #[must_use]
    pub const fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_secs)
    }

    /// Per-cycle GC deadline.
    #[must_use]
    pub const fn gc_timeout(&self) -> Duration {
        Duration::from_secs(self.gc_timeout_secs)
    }

    /// Retention of expired silences.
    #[must_use]
    pub const fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    /// Bound on `stop`.
    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Window for the expiring-soon report.
    #[must_use]
    pub const fn expiry_warning_window(&self) -> Duration {
        Duration::from_secs(self.expiry_warning_window_secs)
    }

    /// Checks the configuration for values the worker cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.gc_interval_secs == 0 {
            return Err(SilenceError::validation(
                "gc_interval_secs",
                "must be greater than zero",
            ));
        }
        if self.gc_timeout_secs == 0 || self.gc_timeout_secs > self.gc_interval_secs {
            return Err(SilenceError::validation(
                "gc_timeout_secs",
                "must be between 1 and gc_interval_secs",
            ));
        }
        if self.shutdown_timeout_secs == 0 {
            return Err(SilenceError::validation(
                "shutdown_timeout_secs",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Configuration for the SQLite store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Maximum pooled connections.
    pub max_connections: u32,
    /// Deadline applied to every store call (in milliseconds).
    pub statement_timeout_ms: u64,
    /// How long SQLite waits on a locked database (in milliseconds).
    pub busy_timeout_ms: u64,
    /// Maximum rows touched by one expiry call.
    pub expire_batch_size: u32,
    /// Page size when a filter sets no limit.
    pub default_list_limit: u32,
    /// Largest page size a filter may request.
    pub max_list_limit: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_connections: 5,
            statement_timeout_ms: 10_000,
            busy_timeout_ms: 5_000,
            expire_batch_size: 1000,
            default_list_limit: 100,
            max_list_limit: 1000,
        }
    }
}

impl StoreConfig {
    /// Per-call deadline.
    #[must_use]
    pub const fn statement_timeout(&self) -> Duration {
        Duration::from_millis(self.statement_timeout_ms)
    }

    /// SQLite busy timeout.
    #[must_use]
    pub const fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    /// Resolves a requested page size against the default and the cap.
    #[must_use]
    pub fn effective_limit(&self, requested: Option<u32>) -> u32 {
        match requested {
            None | Some(0) => self.default_list_limit,
            Some(limit) => limit.min(self.max_list_limit),
        }
    }

    /// Checks the configuration for values the store cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(SilenceError::validation(
                "max_connections",
                "must be greater than zero",
            ));
        }
        if self.statement_timeout_ms == 0 {
            return Err(SilenceError::validation(
                "statement_timeout_ms",
                "must be greater than zero",
            ));
        }
        if self.expire_batch_size == 0 {
            return Err(SilenceError::validation(
                "expire_batch_size",
                "must be greater than zero",
            ));
        }
        if self.default_list_limit == 0 || self.default_list_limit > self.max_list_limit {
            return Err(SilenceError::validation(
                "default_list_limit",
                "must be between 1 and max_list_limit",
            ));
        }
        Ok(())
    }
}

/// Top-level configuration, as loaded from a JSON file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SilencerConfig {
    /// Manager and worker settings.
    pub manager: ManagerConfig,
    /// Store settings.
    pub store: StoreConfig,
}

impl SilencerConfig {
    /// Parses a JSON document; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a JSON file.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            SilenceError::Serialization(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_json_str(&json)
    }

    /// Validates both sections.
    pub fn validate(&self) -> Result<()> {
        self.manager.validate()?;
        self.store.validate()
    }
}
