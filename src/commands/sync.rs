//! Diff delivery, branch resync, sweep and inspection.

use serde::Serialize;

use crate::context::SyncContext;
use crate::error::SyncError;
use crate::models::{
    AccountScope, ActivityEntry, DiffResult, Direction, StatusCounts, SyncRequest,
    WebhookCoordinates,
};
use crate::services::activity_log;
use crate::services::diff_ingestion::{GitTarget, IngestionSummary};
use crate::services::sync_queue;

/// Default number of activity entries returned.
pub const DEFAULT_ACTIVITY_LIMIT: i64 = 50;

/// Queue overview for one account.
#[derive(Debug, Clone, Serialize)]
pub struct QueueOverview {
    pub counts: StatusCounts,
    pub recent_activity: Vec<ActivityEntry>,
}

/// Ingest a diff delivered by the git gateway.
pub async fn process_diff(
    ctx: &SyncContext,
    target: &GitTarget,
    diff: DiffResult,
) -> Result<IngestionSummary, SyncError> {
    ctx.ingestion().process_git_diff(target, diff).await
}

/// Queue a full resync of a branch.
///
/// # Returns
/// The id of the queued request
pub async fn request_branch_sync(
    ctx: &SyncContext,
    scope: AccountScope,
    target: &GitTarget,
) -> Result<String, SyncError> {
    if scope.account_id != target.account_id {
        return Err(SyncError::invalid_input_field(
            "scope and target belong to different accounts",
            "account_id",
        ));
    }

    let request = SyncRequest::new(scope, Direction::FullSync, Vec::new()).with_webhook(
        WebhookCoordinates {
            repo: target.repo.clone(),
            branch: target.branch.clone(),
            connector_id: target.connector_id.clone(),
            head_commit_id: None,
        },
    );
    let saved = sync_queue::save(&ctx.pool, ctx.collaborators.mappings.as_ref(), request).await?;

    log::info!(
        "[branch-sync] queued resync of {}@{} as {}",
        target.repo,
        target.branch,
        saved.id
    );
    Ok(saved.id)
}

/// Retire an account's requests that ran out of retries.
pub async fn sweep_retries(ctx: &SyncContext, account_id: &str) -> Result<u64, SyncError> {
    sync_queue::mark_skipped_if_retries_exceeded(&ctx.pool, account_id, ctx.config.max_retry_count)
        .await
}

/// Fetch a request by id.
pub async fn get_request(ctx: &SyncContext, request_id: &str) -> Result<SyncRequest, SyncError> {
    sync_queue::get(&ctx.pool, request_id)
        .await?
        .ok_or_else(|| SyncError::not_found_with_id("SyncRequest", request_id))
}

/// Requests on one queue key, oldest first.
pub async fn list_queue(
    ctx: &SyncContext,
    queue_key: &str,
) -> Result<Vec<SyncRequest>, SyncError> {
    sync_queue::list_for_queue_key(&ctx.pool, queue_key).await
}

/// Status counts and recent activity for an account.
pub async fn get_queue_overview(
    ctx: &SyncContext,
    account_id: &str,
    activity_limit: Option<i64>,
) -> Result<QueueOverview, SyncError> {
    let counts = sync_queue::counts_by_status(&ctx.pool, account_id).await?;
    let recent_activity = activity_log::recent(
        &ctx.pool,
        account_id,
        activity_limit.unwrap_or(DEFAULT_ACTIVITY_LIMIT),
    )
    .await?;

    Ok(QueueOverview {
        counts,
        recent_activity,
    })
}
