//! Entry points for callers of the sync core.
//!
//! Commands are organized by functionality:
//! - `webhook`: inbound webhook acceptance
//! - `changes`: internal writes headed for git
//! - `sync`: diff delivery, branch resync, sweep and inspection
//! - `errors`: per-file sync error listing and discard

pub mod changes;
pub mod errors;
pub mod sync;
pub mod webhook;
