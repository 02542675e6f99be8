//! Business logic services.
//!
//! Storage-backed ledgers and the queue are plain functions over a `DbPool`.
//! Components that hold collaborators (ingestion, handlers, the branch state
//! machine and the dispatcher) are structs built once and shared.

pub mod activity_log;
pub mod branch_sync;
pub mod change_ledger;
pub mod collaborators;
pub mod commit_ledger;
pub mod diff_ingestion;
pub mod dispatcher;
pub mod handlers;
pub mod payload_parser;
pub mod retry;
pub mod sync_errors;
pub mod sync_queue;
pub mod time_ordering;

pub use diff_ingestion::{DiffIngestionProcessor, GitTarget};
pub use retry::RetryPolicy;
pub use time_ordering::TimeOrderingFilter;
