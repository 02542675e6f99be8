//! Branch sync state machine.
//!
//! A branch moves `unsynced -> syncing -> synced`. Only one resync may run per
//! branch; the store arbitrates the `unsynced -> syncing` step with a single
//! conditional upsert and records the request that won it. A failed resync
//! returns the branch to `unsynced` so a later event can try again, and a
//! retried request may resume a sync it still owns.

use async_trait::async_trait;
use std::sync::Arc;

use crate::db::pool::DbPool;
use crate::error::SyncError;
use crate::models::branch_sync::BranchSyncStateRow;
use crate::models::{
    now_ms, AccountScope, BranchSyncState, BranchSyncStatus, RequestStatus, SyncRequest,
};
use crate::services::collaborators::{ConnectorResolver, GitGateway, RootMappingProvider};
use crate::services::diff_ingestion::{DiffIngestionProcessor, GitTarget};
use crate::services::handlers::DirectionHandler;

/// Current state of a branch, if it has ever been seen.
pub async fn get_state(
    pool: &DbPool,
    account_id: &str,
    repo: &str,
    branch: &str,
) -> Result<Option<BranchSyncState>, SyncError> {
    let row = sqlx::query_as::<_, BranchSyncStateRow>(
        r#"
        SELECT account_id, repo, branch, status, owner_request_id, last_updated_at
        FROM branch_sync_states
        WHERE account_id = ? AND repo = ? AND branch = ?
        "#,
    )
    .bind(account_id)
    .bind(repo)
    .bind(branch)
    .fetch_optional(pool)
    .await?;

    row.map(BranchSyncState::try_from).transpose()
}

/// Move a branch to `syncing` on behalf of `request_id`.
///
/// Succeeds for an unknown or unsynced branch, and for a branch still
/// syncing under the same request (a retry after a crash or a lost write).
///
/// # Returns
/// True if this caller owns the resync
pub async fn try_begin(
    pool: &DbPool,
    account_id: &str,
    repo: &str,
    branch: &str,
    request_id: &str,
) -> Result<bool, SyncError> {
    let result = sqlx::query(
        r#"
        INSERT INTO branch_sync_states (account_id, repo, branch, status, owner_request_id, last_updated_at)
        VALUES (?, ?, ?, 'syncing', ?, ?)
        ON CONFLICT (account_id, repo, branch) DO UPDATE SET
            status = 'syncing',
            owner_request_id = excluded.owner_request_id,
            last_updated_at = excluded.last_updated_at
        WHERE branch_sync_states.status = 'unsynced'
           OR (branch_sync_states.status = 'syncing'
               AND branch_sync_states.owner_request_id = excluded.owner_request_id)
        "#,
    )
    .bind(account_id)
    .bind(repo)
    .bind(branch)
    .bind(request_id)
    .bind(now_ms())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Finish a resync owned by `request_id`, moving `syncing` to `status`.
pub async fn finish(
    pool: &DbPool,
    account_id: &str,
    repo: &str,
    branch: &str,
    request_id: &str,
    status: BranchSyncStatus,
) -> Result<bool, SyncError> {
    let result = sqlx::query(
        r#"
        UPDATE branch_sync_states SET status = ?, last_updated_at = ?
        WHERE account_id = ? AND repo = ? AND branch = ?
          AND status = 'syncing' AND owner_request_id = ?
        "#,
    )
    .bind(status.as_str())
    .bind(now_ms())
    .bind(account_id)
    .bind(repo)
    .bind(branch)
    .bind(request_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Full resync of a branch from a gateway snapshot.
pub struct BranchSyncStateMachine {
    pool: DbPool,
    mappings: Arc<dyn RootMappingProvider>,
    connectors: Arc<dyn ConnectorResolver>,
    gateway: Arc<dyn GitGateway>,
    ingestion: Arc<DiffIngestionProcessor>,
}

impl BranchSyncStateMachine {
    pub fn new(
        pool: DbPool,
        mappings: Arc<dyn RootMappingProvider>,
        connectors: Arc<dyn ConnectorResolver>,
        gateway: Arc<dyn GitGateway>,
        ingestion: Arc<DiffIngestionProcessor>,
    ) -> Self {
        Self {
            pool,
            mappings,
            connectors,
            gateway,
            ingestion,
        }
    }

    /// Process a branch sync event raised by `request_id`.
    pub async fn process(
        &self,
        request_id: &str,
        scope: &AccountScope,
        target: &GitTarget,
    ) -> Result<RequestStatus, SyncError> {
        let mapped = !self
            .mappings
            .get_by_repo_branch(&target.repo, &target.branch, &target.account_id)
            .await?
            .is_empty();
        if !mapped {
            log::info!(
                "[branch-sync] no root mapping for {}@{}, skipping",
                target.repo,
                target.branch
            );
            return Ok(RequestStatus::Skipped);
        }

        let began = try_begin(
            &self.pool,
            &target.account_id,
            &target.repo,
            &target.branch,
            request_id,
        )
        .await?;
        if !began {
            let state = get_state(&self.pool, &target.account_id, &target.repo, &target.branch)
                .await?
                .map(|s| s.status.to_string())
                .unwrap_or_default();
            log::info!(
                "[branch-sync] {}@{} is {}, skipping",
                target.repo,
                target.branch,
                state
            );
            return Ok(RequestStatus::Skipped);
        }

        log::info!("[branch-sync] resyncing {}@{}", target.repo, target.branch);
        let (branch_status, request_status) = match self.spawn_resync(scope, target).await {
            Ok(()) => (BranchSyncStatus::Synced, RequestStatus::Completed),
            Err(e) => {
                log::warn!(
                    "[branch-sync] resync of {}@{} failed: {}",
                    target.repo,
                    target.branch,
                    e
                );
                (BranchSyncStatus::Unsynced, RequestStatus::FailedWithRetry)
            }
        };

        // On a write error the branch stays syncing under this request, which
        // resumes it when the dispatcher retries.
        let finished = finish(
            &self.pool,
            &target.account_id,
            &target.repo,
            &target.branch,
            request_id,
            branch_status,
        )
        .await?;
        if finished {
            log::info!(
                "[branch-sync] {}@{} {}",
                target.repo,
                target.branch,
                branch_status
            );
        } else {
            log::warn!(
                "[branch-sync] {}@{} no longer owned by {}",
                target.repo,
                target.branch,
                request_id
            );
        }
        Ok(request_status)
    }

    /// Run the resync in its own task so a panic still releases the branch.
    async fn spawn_resync(
        &self,
        scope: &AccountScope,
        target: &GitTarget,
    ) -> Result<(), SyncError> {
        let connectors = self.connectors.clone();
        let gateway = self.gateway.clone();
        let ingestion = self.ingestion.clone();
        let scope = scope.clone();
        let target = target.clone();

        let task = tokio::spawn(async move {
            resync(
                connectors.as_ref(),
                gateway.as_ref(),
                &ingestion,
                &scope,
                &target,
            )
            .await
        });
        match task.await {
            Ok(result) => result,
            Err(e) => Err(SyncError::handler_fault(format!("resync aborted: {}", e))),
        }
    }
}

async fn resync(
    connectors: &dyn ConnectorResolver,
    gateway: &dyn GitGateway,
    ingestion: &DiffIngestionProcessor,
    scope: &AccountScope,
    target: &GitTarget,
) -> Result<(), SyncError> {
    let connector = connectors
        .get(
            &scope.account_id,
            &scope.org_id,
            &scope.project_id,
            &target.connector_id,
        )
        .await?;
    let snapshot = gateway
        .snapshot_branch(&connector, &target.repo, &target.branch)
        .await?;
    let summary = ingestion.ingest_snapshot(target, snapshot).await?;
    log::debug!(
        "[branch-sync] snapshot of {}@{}: {} accepted, {} excluded",
        target.repo,
        target.branch,
        summary.accepted,
        summary.excluded.len()
    );
    Ok(())
}

#[async_trait]
impl DirectionHandler for BranchSyncStateMachine {
    async fn handle(&self, request: &SyncRequest) -> Result<RequestStatus, SyncError> {
        let Some(coordinates) = &request.webhook else {
            log::warn!("[branch-sync] {} has no coordinates, skipping", request.id);
            return Ok(RequestStatus::Skipped);
        };
        let target = GitTarget::new(
            request.account_id(),
            &coordinates.connector_id,
            &coordinates.repo,
            &coordinates.branch,
        );
        self.process(&request.id, &request.scope, &target).await
    }
}
