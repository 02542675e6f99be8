//! Activity log entries and per-file sync errors.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Outcome recorded for a file in the activity log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityStatus {
    Queued,
    Completed,
    Skipped,
    Failed,
}

impl ActivityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Completed => "completed",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }
}

impl From<&str> for ActivityStatus {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "completed" => Self::Completed,
            "skipped" => Self::Skipped,
            "failed" => Self::Failed,
            _ => Self::Queued,
        }
    }
}

impl std::fmt::Display for ActivityStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One audit row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ActivityEntry {
    pub id: i64,
    pub account_id: String,
    pub request_id: Option<String>,
    pub file_path: String,
    pub commit_id: Option<String>,
    pub status: String,
    pub reason: Option<String>,
    pub recorded_at: i64,
}

impl ActivityEntry {
    pub fn status(&self) -> ActivityStatus {
        ActivityStatus::from(self.status.as_str())
    }
}

/// A file that failed to sync and has not been fixed or discarded.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SyncErrorRecord {
    pub id: i64,
    pub account_id: String,
    pub file_path: String,
    pub direction: String,
    pub commit_id: Option<String>,
    pub message: String,
    pub created_at: i64,
    pub updated_at: i64,
}
