//! Time-ordering filter for inbound git changes.
//!
//! A git delta is dropped when the change ledger already holds a change to
//! the same path that is at least as recent, or when an internal write to
//! that path is still on its way out to git.

use serde::Serialize;

use crate::db::pool::DbPool;
use crate::error::SyncError;
use crate::models::{ChangeDetail, FileDelta, LedgerKey, RootMapping};
use crate::services::{change_ledger, sync_queue};

/// Why a delta was kept out of a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExclusionReason {
    /// Incoming change is not newer than the recorded one.
    StaleChange { incoming_ms: i64, recorded_ms: i64 },
    /// An internal write to the path has not reached git yet.
    InternalWriteInFlight { internal_request_id: String },
    /// Path is outside every root mapping or is not an entity file.
    UnrecognizedPath,
}

impl std::fmt::Display for ExclusionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StaleChange {
                incoming_ms,
                recorded_ms,
            } => write!(
                f,
                "change at {} is not newer than recorded change at {}",
                incoming_ms, recorded_ms
            ),
            Self::InternalWriteInFlight {
                internal_request_id,
            } => write!(f, "internal write {} still in flight", internal_request_id),
            Self::UnrecognizedPath => write!(f, "unrecognized path"),
        }
    }
}

/// A delta kept out of a request, with the reason.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExcludedDelta {
    pub delta: FileDelta,
    pub reason: ExclusionReason,
}

/// Deltas split by the filter.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FilterOutcome {
    pub accepted: Vec<FileDelta>,
    pub excluded: Vec<ExcludedDelta>,
}

/// Applies ordering rules against the change ledger and the queue.
#[derive(Clone)]
pub struct TimeOrderingFilter {
    pool: DbPool,
}

impl TimeOrderingFilter {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Split git deltas for one mapping into accepted and excluded.
    pub async fn partition(
        &self,
        mapping: &RootMapping,
        deltas: Vec<FileDelta>,
    ) -> Result<FilterOutcome, SyncError> {
        let mut outcome = FilterOutcome::default();

        for delta in deltas {
            match self.check(mapping, &delta).await? {
                None => outcome.accepted.push(delta),
                Some(reason) => {
                    log::warn!(
                        "[ordering] excluding {} (commit {}): {}",
                        delta.path,
                        delta.commit_id.as_deref().unwrap_or("-"),
                        reason
                    );
                    outcome.excluded.push(ExcludedDelta { delta, reason });
                }
            }
        }

        Ok(outcome)
    }

    /// Reason to exclude one delta, or `None` to keep it.
    pub async fn check(
        &self,
        mapping: &RootMapping,
        delta: &FileDelta,
    ) -> Result<Option<ExclusionReason>, SyncError> {
        // Deltas without a commit time carry no ordering information
        let Some(incoming_ms) = delta.commit_time_ms else {
            return Ok(None);
        };

        let key = LedgerKey::new(mapping.scope(), delta.path.clone());
        let Some(entry) = change_ledger::get(&self.pool, &key).await? else {
            return Ok(None);
        };

        if incoming_ms <= entry.change_request_ts {
            return Ok(Some(ExclusionReason::StaleChange {
                incoming_ms,
                recorded_ms: entry.change_request_ts,
            }));
        }

        if let ChangeDetail::Internal {
            internal_request_id,
        } = &entry.change_detail
        {
            let status =
                sync_queue::get_status(&self.pool, &mapping.account_id, internal_request_id)
                    .await?;
            if status.is_some_and(|s| !s.is_terminal()) {
                return Ok(Some(ExclusionReason::InternalWriteInFlight {
                    internal_request_id: internal_request_id.clone(),
                }));
            }
        }

        Ok(None)
    }
}
