//! Branch resync state.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::str::FromStr;

use crate::error::SyncError;

/// Whether a branch has been fully ingested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BranchSyncStatus {
    Unsynced,
    Syncing,
    Synced,
}

impl BranchSyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unsynced => "unsynced",
            Self::Syncing => "syncing",
            Self::Synced => "synced",
        }
    }
}

impl FromStr for BranchSyncStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unsynced" => Ok(Self::Unsynced),
            "syncing" => Ok(Self::Syncing),
            "synced" => Ok(Self::Synced),
            other => Err(SyncError::invalid_input_field(
                format!("unknown branch sync status '{}'", other),
                "status",
            )),
        }
    }
}

impl std::fmt::Display for BranchSyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resync state of one branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchSyncState {
    pub account_id: String,
    pub repo: String,
    pub branch: String,
    pub status: BranchSyncStatus,
    /// Request that last began a resync of the branch.
    pub owner_request_id: Option<String>,
    pub last_updated_at: i64,
}

/// Row shape of the `branch_sync_states` table.
#[derive(Debug, Clone, FromRow)]
pub struct BranchSyncStateRow {
    pub account_id: String,
    pub repo: String,
    pub branch: String,
    pub status: String,
    pub owner_request_id: Option<String>,
    pub last_updated_at: i64,
}

impl TryFrom<BranchSyncStateRow> for BranchSyncState {
    type Error = SyncError;

    fn try_from(row: BranchSyncStateRow) -> Result<Self, Self::Error> {
        Ok(Self {
            account_id: row.account_id,
            repo: row.repo,
            branch: row.branch,
            status: row.status.parse()?,
            owner_request_id: row.owner_request_id,
            last_updated_at: row.last_updated_at,
        })
    }
}
