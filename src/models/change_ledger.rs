//! Change ledger entry: the latest known change to a file path.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::sync_request::AccountScope;
use crate::error::SyncError;

/// Side that produced a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeSource {
    Internal,
    Git,
}

impl ChangeSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Internal => "internal",
            Self::Git => "git",
        }
    }
}

/// Source-specific detail of a change. The variant is the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum ChangeDetail {
    /// Write made through the internal API, tracked by its outbound request.
    Internal { internal_request_id: String },
    /// Change applied from a git commit.
    Git {
        commit_id: String,
        processing_commit_id: String,
    },
}

impl ChangeDetail {
    pub fn source(&self) -> ChangeSource {
        match self {
            Self::Internal { .. } => ChangeSource::Internal,
            Self::Git { .. } => ChangeSource::Git,
        }
    }

    /// Outbound request id for internal changes.
    pub fn internal_request_id(&self) -> Option<&str> {
        match self {
            Self::Internal {
                internal_request_id,
            } => Some(internal_request_id),
            Self::Git { .. } => None,
        }
    }
}

/// Primary key of a ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LedgerKey {
    pub scope: AccountScope,
    pub file_path: String,
}

impl LedgerKey {
    pub fn new(scope: AccountScope, file_path: impl Into<String>) -> Self {
        Self {
            scope,
            file_path: file_path.into(),
        }
    }
}

/// Latest known change for one file path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeLedgerEntry {
    pub scope: AccountScope,
    pub file_path: String,
    /// When the change was requested (commit time for git changes).
    pub change_request_ts: i64,
    /// When the change was applied; `None` while in flight.
    pub change_processed_ts: Option<i64>,
    pub change_detail: ChangeDetail,
}

impl ChangeLedgerEntry {
    pub fn key(&self) -> LedgerKey {
        LedgerKey::new(self.scope.clone(), self.file_path.clone())
    }

    pub fn change_source(&self) -> ChangeSource {
        self.change_detail.source()
    }
}

/// Row shape of the `change_ledger` table.
#[derive(Debug, Clone, FromRow)]
pub struct ChangeLedgerRow {
    pub account_id: String,
    pub org_id: String,
    pub project_id: String,
    pub file_path: String,
    pub change_request_ts: i64,
    pub change_processed_ts: Option<i64>,
    pub change_source: String,
    pub internal_request_id: Option<String>,
    pub commit_id: Option<String>,
    pub processing_commit_id: Option<String>,
}

impl TryFrom<ChangeLedgerRow> for ChangeLedgerEntry {
    type Error = SyncError;

    fn try_from(row: ChangeLedgerRow) -> Result<Self, Self::Error> {
        let change_detail = match (row.change_source.as_str(), row.internal_request_id) {
            ("internal", Some(internal_request_id)) => ChangeDetail::Internal {
                internal_request_id,
            },
            ("git", _) => ChangeDetail::Git {
                commit_id: row.commit_id.unwrap_or_default(),
                processing_commit_id: row.processing_commit_id.unwrap_or_default(),
            },
            (source, _) => {
                return Err(SyncError::internal(format!(
                    "inconsistent change ledger row for {} (source '{}')",
                    row.file_path, source
                )))
            }
        };

        Ok(Self {
            scope: AccountScope::new(row.account_id, row.org_id, row.project_id),
            file_path: row.file_path,
            change_request_ts: row.change_request_ts,
            change_processed_ts: row.change_processed_ts,
            change_detail,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(source: &str, internal_request_id: Option<&str>) -> ChangeLedgerRow {
        ChangeLedgerRow {
            account_id: "acc".into(),
            org_id: "org".into(),
            project_id: "proj".into(),
            file_path: ".harness/pipelines/a.yaml".into(),
            change_request_ts: 10,
            change_processed_ts: None,
            change_source: source.into(),
            internal_request_id: internal_request_id.map(String::from),
            commit_id: Some("c1".into()),
            processing_commit_id: Some("c2".into()),
        }
    }

    #[test]
    fn test_detail_serializes_with_source_tag() {
        let detail = ChangeDetail::Internal {
            internal_request_id: "r1".into(),
        };
        let json = serde_json::to_string(&detail).unwrap();
        assert!(json.contains("\"source\":\"internal\""));
        assert_eq!(detail.source(), ChangeSource::Internal);
    }

    #[test]
    fn test_internal_row_without_request_id_is_rejected() {
        assert!(ChangeLedgerEntry::try_from(row("internal", None)).is_err());
        assert!(ChangeLedgerEntry::try_from(row("other", Some("r"))).is_err());
    }

    #[test]
    fn test_git_row_conversion() {
        let entry = ChangeLedgerEntry::try_from(row("git", None)).unwrap();
        assert_eq!(entry.change_source(), ChangeSource::Git);
        assert_eq!(
            entry.change_detail,
            ChangeDetail::Git {
                commit_id: "c1".into(),
                processing_commit_id: "c2".into()
            }
        );
        assert!(entry.change_detail.internal_request_id().is_none());
    }
}
