//! Per-file sync errors.

use crate::context::SyncContext;
use crate::error::SyncError;
use crate::models::SyncErrorRecord;
use crate::services::sync_errors;

/// List open sync errors for an account.
pub async fn list_sync_errors(
    ctx: &SyncContext,
    account_id: &str,
) -> Result<Vec<SyncErrorRecord>, SyncError> {
    sync_errors::list(&ctx.pool, account_id).await
}

/// Discard one error.
pub async fn discard_sync_error(
    ctx: &SyncContext,
    account_id: &str,
    error_id: i64,
) -> Result<(), SyncError> {
    if !sync_errors::discard(&ctx.pool, account_id, error_id).await? {
        return Err(SyncError::not_found_with_id("SyncError", error_id.to_string()));
    }
    log::info!("[errors] discarded sync error {} for {}", error_id, account_id);
    Ok(())
}

/// Discard every error recorded for the given paths.
///
/// # Returns
/// Number of errors discarded
pub async fn discard_sync_errors_for_paths(
    ctx: &SyncContext,
    account_id: &str,
    paths: &[String],
) -> Result<u64, SyncError> {
    if paths.is_empty() {
        return Err(SyncError::invalid_input_field("no paths given", "paths"));
    }
    let discarded = sync_errors::discard_for_paths(&ctx.pool, account_id, paths).await?;
    log::info!(
        "[errors] discarded {} sync error(s) for {} path(s)",
        discarded,
        paths.len()
    );
    Ok(discarded)
}
