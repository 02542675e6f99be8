//! Data models for the sync store.
//!
//! Persisted models come in pairs: a domain type used by the services and a
//! `*Row` type deriving `FromRow` that mirrors the table columns. Rows convert
//! into domain types with `TryFrom`, failing on unknown enum values.

pub mod activity;
pub mod branch_sync;
pub mod change_ledger;
pub mod commit_record;
pub mod entity;
pub mod file_delta;
pub mod root_mapping;
pub mod sync_request;

pub use activity::{ActivityEntry, ActivityStatus, SyncErrorRecord};
pub use branch_sync::{BranchSyncState, BranchSyncStatus};
pub use change_ledger::{ChangeDetail, ChangeLedgerEntry, ChangeSource, LedgerKey};
pub use commit_record::{CommitRecord, CommitStatus};
pub use entity::EntityType;
pub use file_delta::{ChangeType, DiffResult, FileDelta};
pub use root_mapping::{owning_mapping, ConnectorInfo, RootMapping};
pub use sync_request::{
    queue_key, AccountScope, Direction, RequestStatus, StatusCounts, SyncRequest,
    WebhookCoordinates, REASON_MAX_RETRY_EXCEEDED,
};

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
