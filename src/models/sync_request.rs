//! Sync request model: one queued unit of synchronization work.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::str::FromStr;

use super::file_delta::FileDelta;
use crate::error::SyncError;

/// Reason recorded when the sweep retires a request that ran out of retries.
pub const REASON_MAX_RETRY_EXCEEDED: &str = "MaxRetryExceeded";

/// Direction of a sync request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    GitToInternal,
    InternalToGit,
    FullSync,
}

impl Direction {
    /// Column value for this direction.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GitToInternal => "git_to_internal",
            Self::InternalToGit => "internal_to_git",
            Self::FullSync => "full_sync",
        }
    }
}

impl FromStr for Direction {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "git_to_internal" => Ok(Self::GitToInternal),
            "internal_to_git" => Ok(Self::InternalToGit),
            "full_sync" => Ok(Self::FullSync),
            other => Err(SyncError::invalid_input_field(
                format!("unknown direction '{}'", other),
                "direction",
            )),
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a sync request.
///
/// `Completed` and `Skipped` are terminal. `Queued` and `FailedWithRetry`
/// are the only states a request may be requeued from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Queued,
    Running,
    Completed,
    Skipped,
    FailedWithRetry,
}

impl RequestStatus {
    /// Column value for this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Skipped => "skipped",
            Self::FailedWithRetry => "failed_with_retry",
        }
    }

    /// Check if no further transition is allowed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }

    /// Check if the request is still waiting for (another) attempt.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Queued | Self::FailedWithRetry)
    }
}

impl FromStr for RequestStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "skipped" => Ok(Self::Skipped),
            "failed_with_retry" => Ok(Self::FailedWithRetry),
            other => Err(SyncError::invalid_input_field(
                format!("unknown request status '{}'", other),
                "status",
            )),
        }
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Account/org/project scope. Empty org or project means account level.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountScope {
    pub account_id: String,
    #[serde(default)]
    pub org_id: String,
    #[serde(default)]
    pub project_id: String,
}

impl AccountScope {
    pub fn new(
        account_id: impl Into<String>,
        org_id: impl Into<String>,
        project_id: impl Into<String>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            org_id: org_id.into(),
            project_id: project_id.into(),
        }
    }

    /// Account-level scope with no org or project.
    pub fn account(account_id: impl Into<String>) -> Self {
        Self::new(account_id, "", "")
    }
}

/// Git coordinates a request was raised for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookCoordinates {
    pub repo: String,
    pub branch: String,
    pub connector_id: String,
    /// Head commit announced by the webhook, or the commit being applied.
    pub head_commit_id: Option<String>,
}

impl WebhookCoordinates {
    /// Queue key shared by every request for these coordinates.
    pub fn queue_key(&self, account_id: &str) -> String {
        queue_key(account_id, &self.connector_id, &self.branch)
    }
}

/// Build the serialization key for an account, connector and branch.
pub fn queue_key(account_id: &str, connector_id: &str, branch: &str) -> String {
    format!("{}:{}:{}", account_id, connector_id, branch)
}

/// A queued unit of synchronization work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub id: String,
    pub scope: AccountScope,
    pub direction: Direction,
    pub status: RequestStatus,
    pub retry_count: i64,
    /// Requests sharing a key are executed one at a time, in order.
    pub queue_key: String,
    pub file_deltas: Vec<FileDelta>,
    pub webhook: Option<WebhookCoordinates>,
    pub status_reason: Option<String>,
    pub created_at: i64,
    pub last_updated_at: i64,
}

impl SyncRequest {
    /// Create a new queued request. The queue key is resolved on save.
    pub fn new(scope: AccountScope, direction: Direction, file_deltas: Vec<FileDelta>) -> Self {
        let now = super::now_ms();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            scope,
            direction,
            status: RequestStatus::Queued,
            retry_count: 0,
            queue_key: String::new(),
            file_deltas,
            webhook: None,
            status_reason: None,
            created_at: now,
            last_updated_at: now,
        }
    }

    /// Attach git coordinates.
    pub fn with_webhook(mut self, coordinates: WebhookCoordinates) -> Self {
        self.webhook = Some(coordinates);
        self
    }

    /// Pin the queue key instead of resolving it from configuration.
    pub fn with_queue_key(mut self, queue_key: impl Into<String>) -> Self {
        self.queue_key = queue_key.into();
        self
    }

    pub fn account_id(&self) -> &str {
        &self.scope.account_id
    }

    /// Check if this is a webhook request still waiting for its diff.
    pub fn is_placeholder(&self) -> bool {
        self.direction == Direction::GitToInternal && self.file_deltas.is_empty()
    }
}

/// Status totals for one account.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub queued: i64,
    pub running: i64,
    pub completed: i64,
    pub skipped: i64,
    pub failed_with_retry: i64,
}

impl StatusCounts {
    /// Add `count` requests of `status`.
    pub fn add(&mut self, status: RequestStatus, count: i64) {
        match status {
            RequestStatus::Queued => self.queued += count,
            RequestStatus::Running => self.running += count,
            RequestStatus::Completed => self.completed += count,
            RequestStatus::Skipped => self.skipped += count,
            RequestStatus::FailedWithRetry => self.failed_with_retry += count,
        }
    }

    pub fn total(&self) -> i64 {
        self.queued + self.running + self.completed + self.skipped + self.failed_with_retry
    }
}

/// Row shape of the `sync_requests` table.
#[derive(Debug, Clone, FromRow)]
pub struct SyncRequestRow {
    pub seq: i64,
    pub id: String,
    pub account_id: String,
    pub org_id: String,
    pub project_id: String,
    pub direction: String,
    pub status: String,
    pub retry_count: i64,
    pub queue_key: String,
    pub file_deltas: String,
    pub repo: Option<String>,
    pub branch: Option<String>,
    pub connector_id: Option<String>,
    pub head_commit_id: Option<String>,
    pub status_reason: Option<String>,
    pub created_at: i64,
    pub last_updated_at: i64,
}

impl TryFrom<SyncRequestRow> for SyncRequest {
    type Error = SyncError;

    fn try_from(row: SyncRequestRow) -> Result<Self, Self::Error> {
        let webhook = match (row.repo, row.branch, row.connector_id) {
            (Some(repo), Some(branch), Some(connector_id)) => Some(WebhookCoordinates {
                repo,
                branch,
                connector_id,
                head_commit_id: row.head_commit_id,
            }),
            _ => None,
        };

        Ok(Self {
            id: row.id,
            scope: AccountScope::new(row.account_id, row.org_id, row.project_id),
            direction: row.direction.parse()?,
            status: row.status.parse()?,
            retry_count: row.retry_count,
            queue_key: row.queue_key,
            file_deltas: serde_json::from_str(&row.file_deltas)?,
            webhook,
            status_reason: row.status_reason,
            created_at: row.created_at,
            last_updated_at: row.last_updated_at,
        })
    }
}
