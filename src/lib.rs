//! gitsync - synchronization queue and conflict resolution between git
//! repositories and an internal configuration store.
//!
//! Webhooks and internal writes become durable sync requests. A dispatcher
//! runs them one at a time per queue key, bounded per account, while the
//! commit and change ledgers keep redelivered and out-of-order changes from
//! overwriting newer state.

pub mod commands;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod models;
pub mod services;

pub use config::{DispatcherConfig, SyncSettings};
pub use context::{Collaborators, SyncContext};
pub use error::SyncError;
pub use services::dispatcher::{Dispatcher, DispatcherHandle};
