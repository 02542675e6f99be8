//! Runtime configuration.
//!
//! Settings are persisted as a JSON document. A missing file yields defaults;
//! a malformed one is rejected so a typo never silently resets limits.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::db::pool::DEFAULT_MAX_CONNECTIONS;
use crate::error::SyncError;
use crate::models::{ConnectorInfo, RootMapping};
use crate::services::retry::RetryPolicy;

/// Default poll interval in milliseconds.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;

/// Default sweep interval in milliseconds.
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 60_000;

/// Default cap on running requests per account.
pub const DEFAULT_MAX_RUNNING_PER_ACCOUNT: i64 = 5;

/// Default worker pool size.
pub const DEFAULT_MAX_WORKERS: usize = 8;

/// Default retry budget per request.
pub const DEFAULT_MAX_RETRY_COUNT: i64 = 3;

/// Default age after which a running request is presumed abandoned.
pub const DEFAULT_STALE_RUNNING_MS: u64 = 30 * 60 * 1_000;

/// Dispatcher tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub poll_interval_ms: u64,
    pub sweep_interval_ms: u64,
    pub max_running_per_account: i64,
    pub max_workers: usize,
    pub max_retry_count: i64,
    /// Running requests older than this are requeued by the sweep. Zero
    /// disables reclaiming.
    pub stale_running_ms: u64,
    /// Retry policy for terminal status writes.
    pub status_write_retry: RetryPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
            max_running_per_account: DEFAULT_MAX_RUNNING_PER_ACCOUNT,
            max_workers: DEFAULT_MAX_WORKERS,
            max_retry_count: DEFAULT_MAX_RETRY_COUNT,
            stale_running_ms: DEFAULT_STALE_RUNNING_MS,
            status_write_retry: RetryPolicy::default(),
        }
    }
}

impl DispatcherConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    /// Reject values that would stall or disable the dispatcher.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.max_running_per_account < 1 {
            return Err(SyncError::invalid_input_field(
                "must be at least 1",
                "max_running_per_account",
            ));
        }
        if self.max_workers == 0 {
            return Err(SyncError::invalid_input_field("must be at least 1", "max_workers"));
        }
        if self.max_retry_count < 0 {
            return Err(SyncError::invalid_input_field(
                "cannot be negative",
                "max_retry_count",
            ));
        }
        Ok(())
    }
}

/// Top-level settings document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub database_path: PathBuf,
    pub max_connections: u32,
    pub dispatcher: DispatcherConfig,
    /// Static root mappings for deployments without a mapping service.
    pub root_mappings: Vec<RootMapping>,
    /// Static connectors for deployments without a connector service.
    pub connectors: Vec<ConnectorInfo>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("gitsync.db"),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            dispatcher: DispatcherConfig::default(),
            root_mappings: Vec::new(),
            connectors: Vec::new(),
        }
    }
}

impl SyncSettings {
    /// Load settings from a JSON file, using defaults if the file is absent.
    pub fn load(path: &Path) -> Result<Self, SyncError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("[config] {} not found, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(SyncError::internal(format!(
                    "Failed to read settings {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        let settings: Self = serde_json::from_str(&raw).map_err(|e| {
            SyncError::invalid_input_field(format!("Malformed settings: {}", e), "settings")
        })?;
        settings.dispatcher.validate()?;
        Ok(settings)
    }

    /// Save settings as pretty-printed JSON.
    pub fn save(&self, path: &Path) -> Result<(), SyncError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    SyncError::internal(format!("Failed to create settings directory: {}", e))
                })?;
            }
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .map_err(|e| SyncError::internal(format!("Failed to save settings: {}", e)))
    }
}
