//! Direction handlers executed by the dispatcher.
//!
//! A handler returns the status the request should end in. `Running` means
//! the work continues elsewhere (a diff was requested and will arrive through
//! ingestion). An `Err` sends the request back through the retry path.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::db::pool::DbPool;
use crate::error::SyncError;
use crate::models::{
    now_ms, ActivityStatus, ChangeDetail, ChangeLedgerEntry, Direction, FileDelta, LedgerKey,
    RequestStatus, RootMapping, SyncRequest,
};
use crate::services::collaborators::{
    ActivityLog, ConnectorResolver, DiffRequest, EntityApplier, GitGateway, PushRequest,
    RootMappingProvider,
};
use crate::services::time_ordering::TimeOrderingFilter;
use crate::services::{change_ledger, commit_ledger, sync_errors};

/// Executes requests of one direction.
#[async_trait]
pub trait DirectionHandler: Send + Sync {
    async fn handle(&self, request: &SyncRequest) -> Result<RequestStatus, SyncError>;
}

/// Handlers keyed by direction.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<Direction, Arc<dyn DirectionHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, direction: Direction, handler: Arc<dyn DirectionHandler>) -> Self {
        self.handlers.insert(direction, handler);
        self
    }

    pub fn resolve(&self, direction: Direction) -> Result<Arc<dyn DirectionHandler>, SyncError> {
        self.handlers
            .get(&direction)
            .cloned()
            .ok_or_else(|| SyncError::internal(format!("no handler registered for {}", direction)))
    }
}

/// Applies git changes to the entity store, or asks for the diff when the
/// request is a webhook placeholder.
pub struct GitToInternalHandler {
    pool: DbPool,
    mappings: Arc<dyn RootMappingProvider>,
    connectors: Arc<dyn ConnectorResolver>,
    gateway: Arc<dyn GitGateway>,
    applier: Arc<dyn EntityApplier>,
    activity: Arc<dyn ActivityLog>,
    filter: TimeOrderingFilter,
}

impl GitToInternalHandler {
    pub fn new(
        pool: DbPool,
        mappings: Arc<dyn RootMappingProvider>,
        connectors: Arc<dyn ConnectorResolver>,
        gateway: Arc<dyn GitGateway>,
        applier: Arc<dyn EntityApplier>,
        activity: Arc<dyn ActivityLog>,
    ) -> Self {
        let filter = TimeOrderingFilter::new(pool.clone());
        Self {
            pool,
            mappings,
            connectors,
            gateway,
            applier,
            activity,
            filter,
        }
    }

    async fn request_diff(&self, request: &SyncRequest) -> Result<RequestStatus, SyncError> {
        let Some(coordinates) = &request.webhook else {
            log::warn!("[git-to-internal] {} has neither deltas nor coordinates", request.id);
            return Ok(RequestStatus::Skipped);
        };
        let account_id = request.account_id();

        if let Some(head) = &coordinates.head_commit_id {
            if commit_ledger::is_processed(
                &self.pool,
                account_id,
                head,
                &coordinates.repo,
                &coordinates.branch,
            )
            .await?
            {
                log::info!("[git-to-internal] head {} already processed", head);
                return Ok(RequestStatus::Skipped);
            }
        }

        let mapped = self
            .mappings
            .get_by_repo_branch(&coordinates.repo, &coordinates.branch, account_id)
            .await?
            .iter()
            .any(|m| m.connector_id == coordinates.connector_id);
        if !mapped {
            log::warn!(
                "[git-to-internal] no root mapping for {}@{}, skipping {}",
                coordinates.repo,
                coordinates.branch,
                request.id
            );
            return Ok(RequestStatus::Skipped);
        }

        let last = commit_ledger::find_last_processed(
            &self.pool,
            account_id,
            &coordinates.repo,
            &coordinates.branch,
        )
        .await?;
        let connector = self
            .connectors
            .get(
                account_id,
                &request.scope.org_id,
                &request.scope.project_id,
                &coordinates.connector_id,
            )
            .await?;

        self.gateway
            .request_diff(
                &connector,
                DiffRequest {
                    request_id: request.id.clone(),
                    account_id: account_id.to_string(),
                    repo: coordinates.repo.clone(),
                    branch: coordinates.branch.clone(),
                    from_commit_id: last.map(|c| c.commit_id),
                    to_commit_id: coordinates.head_commit_id.clone(),
                },
            )
            .await?;

        log::info!(
            "[git-to-internal] diff requested for {} on {}@{}",
            request.id,
            coordinates.repo,
            coordinates.branch
        );
        Ok(RequestStatus::Running)
    }

    async fn apply(&self, request: &SyncRequest) -> Result<RequestStatus, SyncError> {
        let account_id = request.account_id();
        let Some(coordinates) = &request.webhook else {
            log::warn!("[git-to-internal] {} carries deltas without coordinates", request.id);
            return Ok(RequestStatus::Skipped);
        };
        let processing_commit = coordinates.head_commit_id.clone().unwrap_or_default();

        let mappings = self
            .mappings
            .get_by_repo_branch(&coordinates.repo, &coordinates.branch, account_id)
            .await?;

        let mut groups: Vec<(RootMapping, Vec<FileDelta>)> = Vec::new();
        for delta in &request.file_deltas {
            let owner = delta
                .root_mapping_id
                .as_deref()
                .and_then(|id| mappings.iter().find(|m| m.root_folder_id == id));
            let Some(mapping) = owner else {
                log::warn!(
                    "[git-to-internal] mapping for {} no longer exists, dropping",
                    delta.path
                );
                self.activity
                    .record(
                        account_id,
                        Some(&request.id),
                        std::slice::from_ref(delta),
                        ActivityStatus::Skipped,
                        Some("root mapping removed"),
                    )
                    .await;
                continue;
            };
            match groups
                .iter_mut()
                .find(|(m, _)| m.root_folder_id == mapping.root_folder_id)
            {
                Some((_, deltas)) => deltas.push(delta.clone()),
                None => groups.push((mapping.clone(), vec![delta.clone()])),
            }
        }

        let mapping_ids: Vec<String> = groups.iter().map(|(m, _)| m.root_folder_id.clone()).collect();
        let mut applied_any = false;

        for (mapping, deltas) in groups {
            // The ledger may have moved while this request waited
            let outcome = self.filter.partition(&mapping, deltas).await?;
            for excluded in &outcome.excluded {
                self.activity
                    .record(
                        account_id,
                        Some(&request.id),
                        std::slice::from_ref(&excluded.delta),
                        ActivityStatus::Skipped,
                        Some(&excluded.reason.to_string()),
                    )
                    .await;
            }
            if outcome.accepted.is_empty() {
                continue;
            }

            let result = self.applier.apply(&mapping, &outcome.accepted).await?;
            applied_any = true;

            let now = now_ms();
            let mut succeeded = Vec::new();
            for delta in outcome.accepted {
                if let Some(failure) = result.failed(&delta.path) {
                    log::warn!(
                        "[git-to-internal] failed to apply {}: {}",
                        delta.path,
                        failure.message
                    );
                    sync_errors::upsert(
                        &self.pool,
                        account_id,
                        &delta.path,
                        Direction::GitToInternal,
                        delta.commit_id.as_deref(),
                        &failure.message,
                    )
                    .await?;
                    self.activity
                        .record(
                            account_id,
                            Some(&request.id),
                            std::slice::from_ref(&delta),
                            ActivityStatus::Failed,
                            Some(&failure.message),
                        )
                        .await;
                    continue;
                }

                change_ledger::upsert(
                    &self.pool,
                    &ChangeLedgerEntry {
                        scope: mapping.scope(),
                        file_path: delta.path.clone(),
                        change_request_ts: delta.commit_time_ms.unwrap_or(now),
                        change_processed_ts: Some(now),
                        change_detail: ChangeDetail::Git {
                            commit_id: delta
                                .commit_id
                                .clone()
                                .unwrap_or_else(|| processing_commit.clone()),
                            processing_commit_id: processing_commit.clone(),
                        },
                    },
                )
                .await?;
                succeeded.push(delta);
            }

            let paths: Vec<String> = succeeded.iter().map(|d| d.path.clone()).collect();
            sync_errors::clear_for_paths(&self.pool, account_id, Direction::GitToInternal, &paths)
                .await?;
            self.activity
                .record(
                    account_id,
                    Some(&request.id),
                    &succeeded,
                    ActivityStatus::Completed,
                    None,
                )
                .await;
        }

        if !processing_commit.is_empty() {
            commit_ledger::mark_completed(
                &self.pool,
                account_id,
                &processing_commit,
                &coordinates.repo,
                &coordinates.branch,
                mapping_ids,
            )
            .await?;
        }

        log::info!(
            "[git-to-internal] {} finished for commit {} (applied: {})",
            request.id,
            processing_commit,
            applied_any
        );
        Ok(RequestStatus::Completed)
    }
}

#[async_trait]
impl DirectionHandler for GitToInternalHandler {
    async fn handle(&self, request: &SyncRequest) -> Result<RequestStatus, SyncError> {
        if request.is_placeholder() {
            return self.request_diff(request).await;
        }

        if let Some(coordinates) = &request.webhook {
            if let Some(head) = &coordinates.head_commit_id {
                if commit_ledger::is_processed(
                    &self.pool,
                    request.account_id(),
                    head,
                    &coordinates.repo,
                    &coordinates.branch,
                )
                .await?
                {
                    log::info!("[git-to-internal] commit {} already applied, skipping", head);
                    return Ok(RequestStatus::Skipped);
                }
            }
        }

        self.apply(request).await
    }
}

/// Pushes internal changes to git.
pub struct InternalToGitHandler {
    pool: DbPool,
    mappings: Arc<dyn RootMappingProvider>,
    connectors: Arc<dyn ConnectorResolver>,
    gateway: Arc<dyn GitGateway>,
    activity: Arc<dyn ActivityLog>,
}

impl InternalToGitHandler {
    pub fn new(
        pool: DbPool,
        mappings: Arc<dyn RootMappingProvider>,
        connectors: Arc<dyn ConnectorResolver>,
        gateway: Arc<dyn GitGateway>,
        activity: Arc<dyn ActivityLog>,
    ) -> Self {
        Self {
            pool,
            mappings,
            connectors,
            gateway,
            activity,
        }
    }
}

#[async_trait]
impl DirectionHandler for InternalToGitHandler {
    async fn handle(&self, request: &SyncRequest) -> Result<RequestStatus, SyncError> {
        let scope = &request.scope;
        let Some(mapping) = self
            .mappings
            .get_default(&scope.project_id, &scope.org_id, &scope.account_id)
            .await?
        else {
            log::warn!(
                "[internal-to-git] default mapping for {}/{}/{} removed, skipping {}",
                scope.account_id,
                scope.org_id,
                scope.project_id,
                request.id
            );
            return Ok(RequestStatus::Skipped);
        };

        let connector = self
            .connectors
            .get(
                &scope.account_id,
                &scope.org_id,
                &scope.project_id,
                &mapping.connector_id,
            )
            .await?;

        let message = format!("Sync {} file(s) from {}", request.file_deltas.len(), request.id);
        let pushed = self
            .gateway
            .push_changes(
                &connector,
                PushRequest {
                    request_id: request.id.clone(),
                    mapping: mapping.clone(),
                    deltas: request.file_deltas.clone(),
                    message,
                },
            )
            .await?;

        let now = now_ms();
        for delta in &request.file_deltas {
            let key = LedgerKey::new(mapping.scope(), delta.path.clone());
            if !change_ledger::mark_processed(&self.pool, &key, &request.id, now).await? {
                log::debug!("[internal-to-git] {} superseded in change ledger", delta.path);
            }
        }

        // The pushed commit is already reflected internally
        commit_ledger::mark_completed(
            &self.pool,
            &scope.account_id,
            &pushed.commit_id,
            &mapping.repo,
            &mapping.branch,
            vec![mapping.root_folder_id.clone()],
        )
        .await?;

        let paths: Vec<String> = request.file_deltas.iter().map(|d| d.path.clone()).collect();
        sync_errors::clear_for_paths(&self.pool, &scope.account_id, Direction::InternalToGit, &paths)
            .await?;
        self.activity
            .record(
                &scope.account_id,
                Some(&request.id),
                &request.file_deltas,
                ActivityStatus::Completed,
                None,
            )
            .await;

        log::info!(
            "[internal-to-git] {} pushed as commit {} to {}@{}",
            request.id,
            pushed.commit_id,
            mapping.repo,
            mapping.branch
        );
        Ok(RequestStatus::Completed)
    }
}
