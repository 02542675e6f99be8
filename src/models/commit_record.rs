//! Commit ledger record.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::str::FromStr;

use crate::error::SyncError;

/// Processing state of a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitStatus {
    Queued,
    Completed,
    Errored,
}

impl CommitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Completed => "completed",
            Self::Errored => "errored",
        }
    }
}

impl FromStr for CommitStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "completed" => Ok(Self::Completed),
            "errored" => Ok(Self::Errored),
            other => Err(SyncError::invalid_input_field(
                format!("unknown commit status '{}'", other),
                "status",
            )),
        }
    }
}

impl std::fmt::Display for CommitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Processing state of one commit on one branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub account_id: String,
    pub commit_id: String,
    pub repo: String,
    pub branch_name: String,
    pub status: CommitStatus,
    pub root_mapping_ids: Vec<String>,
    pub last_updated_at: i64,
}

impl CommitRecord {
    pub fn new(
        account_id: impl Into<String>,
        commit_id: impl Into<String>,
        repo: impl Into<String>,
        branch_name: impl Into<String>,
        status: CommitStatus,
        root_mapping_ids: Vec<String>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            commit_id: commit_id.into(),
            repo: repo.into(),
            branch_name: branch_name.into(),
            status,
            root_mapping_ids,
            last_updated_at: super::now_ms(),
        }
    }
}

/// Row shape of the `commit_records` table.
#[derive(Debug, Clone, FromRow)]
pub struct CommitRecordRow {
    pub account_id: String,
    pub commit_id: String,
    pub repo: String,
    pub branch_name: String,
    pub status: String,
    pub root_mapping_ids: String,
    pub last_updated_at: i64,
}

impl TryFrom<CommitRecordRow> for CommitRecord {
    type Error = SyncError;

    fn try_from(row: CommitRecordRow) -> Result<Self, Self::Error> {
        Ok(Self {
            account_id: row.account_id,
            commit_id: row.commit_id,
            repo: row.repo,
            branch_name: row.branch_name,
            status: row.status.parse()?,
            root_mapping_ids: serde_json::from_str(&row.root_mapping_ids)?,
            last_updated_at: row.last_updated_at,
        })
    }
}
