//! Diff ingestion: turns a git diff into a git-to-internal sync request.
//!
//! Steps, in order: skip commits already processed, stamp every delta with
//! the processing commit, assign each path to the mapping with the longest
//! matching root folder, drop non-entity paths, apply the time-ordering
//! filter, then queue one combined request for the commit.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::DEFAULT_MAX_RETRY_COUNT;
use crate::db::pool::DbPool;
use crate::error::SyncError;
use crate::models::{
    owning_mapping, AccountScope, ActivityStatus, CommitRecord, CommitStatus, DiffResult,
    Direction, EntityType, FileDelta, RequestStatus, RootMapping, SyncRequest, WebhookCoordinates,
};
use crate::services::collaborators::{ActivityLog, RootMappingProvider};
use crate::services::time_ordering::{ExcludedDelta, ExclusionReason, TimeOrderingFilter};
use crate::services::{commit_ledger, sync_queue};

const REASON_COMMIT_ALREADY_PROCESSED: &str = "commit already processed";

/// Branch a diff belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitTarget {
    pub account_id: String,
    pub connector_id: String,
    pub repo: String,
    pub branch: String,
}

impl GitTarget {
    pub fn new(
        account_id: impl Into<String>,
        connector_id: impl Into<String>,
        repo: impl Into<String>,
        branch: impl Into<String>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            connector_id: connector_id.into(),
            repo: repo.into(),
            branch: branch.into(),
        }
    }

    fn coordinates(&self, head_commit_id: Option<String>) -> WebhookCoordinates {
        WebhookCoordinates {
            repo: self.repo.clone(),
            branch: self.branch.clone(),
            connector_id: self.connector_id.clone(),
            head_commit_id,
        }
    }
}

/// What ingestion did with a diff.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IngestionSummary {
    pub processing_commit_id: String,
    /// Request queued for the accepted deltas, if any were accepted.
    pub request_id: Option<String>,
    pub accepted: usize,
    pub excluded: Vec<ExcludedDelta>,
    /// The commit had already completed; nothing was queued.
    pub already_processed: bool,
}

/// Converts diffs into queued git-to-internal work.
pub struct DiffIngestionProcessor {
    pool: DbPool,
    mappings: Arc<dyn RootMappingProvider>,
    activity: Arc<dyn ActivityLog>,
    filter: TimeOrderingFilter,
    max_retry_count: i64,
}

impl DiffIngestionProcessor {
    pub fn new(
        pool: DbPool,
        mappings: Arc<dyn RootMappingProvider>,
        activity: Arc<dyn ActivityLog>,
    ) -> Self {
        let filter = TimeOrderingFilter::new(pool.clone());
        Self {
            pool,
            mappings,
            activity,
            filter,
            max_retry_count: DEFAULT_MAX_RETRY_COUNT,
        }
    }

    /// Retry budget applied when requeueing a webhook request after a failure.
    pub fn with_max_retry_count(mut self, max_retry_count: i64) -> Self {
        self.max_retry_count = max_retry_count;
        self
    }

    /// Ingest the diff delivered for a commit.
    ///
    /// When the diff answers a pending webhook request, that request is
    /// settled here: completed on success, skipped for duplicates or missing
    /// configuration, requeued on transient failures.
    pub async fn process_git_diff(
        &self,
        target: &GitTarget,
        diff: DiffResult,
    ) -> Result<IngestionSummary, SyncError> {
        let origin = diff.request_id.clone();
        let processing_commit_id = diff.processing_commit_id.clone();

        if commit_ledger::is_processed(
            &self.pool,
            &target.account_id,
            &processing_commit_id,
            &target.repo,
            &target.branch,
        )
        .await?
        {
            log::info!(
                "[ingest] commit {} on {}@{} already processed, skipping",
                processing_commit_id,
                target.repo,
                target.branch
            );
            self.settle_origin(
                target,
                origin.as_deref(),
                RequestStatus::Skipped,
                Some(REASON_COMMIT_ALREADY_PROCESSED),
            )
            .await?;
            return Ok(IngestionSummary {
                processing_commit_id,
                already_processed: true,
                ..IngestionSummary::default()
            });
        }

        match self.ingest(target, diff).await {
            Ok(summary) => {
                self.settle_origin(target, origin.as_deref(), RequestStatus::Completed, None)
                    .await?;
                Ok(summary)
            }
            Err(e) if e.is_configuration_not_found() => {
                let reason = e.to_string();
                self.settle_origin(target, origin.as_deref(), RequestStatus::Skipped, Some(&reason))
                    .await?;
                Err(e)
            }
            Err(e) => {
                if let Some(origin) = origin.as_deref() {
                    log::warn!("[ingest] requeueing {} after failure: {}", origin, e);
                    sync_queue::increment_retry_and_requeue(
                        &self.pool,
                        &target.account_id,
                        origin,
                        self.max_retry_count,
                    )
                    .await?;
                }
                Err(e)
            }
        }
    }

    /// Ingest a full branch snapshot. No duplicate-commit check applies.
    pub async fn ingest_snapshot(
        &self,
        target: &GitTarget,
        snapshot: DiffResult,
    ) -> Result<IngestionSummary, SyncError> {
        self.ingest(target, snapshot).await
    }

    async fn ingest(
        &self,
        target: &GitTarget,
        diff: DiffResult,
    ) -> Result<IngestionSummary, SyncError> {
        let mappings: Vec<RootMapping> = self
            .mappings
            .get_by_repo_branch(&target.repo, &target.branch, &target.account_id)
            .await?
            .into_iter()
            .filter(|m| m.connector_id == target.connector_id)
            .collect();

        if mappings.is_empty() {
            return Err(SyncError::configuration_not_found_for(
                &target.repo,
                &target.branch,
            ));
        }

        let processing_commit_id = diff.processing_commit_id.clone();
        let stamped = stamp(diff);

        let mut groups: Vec<(&RootMapping, Vec<FileDelta>)> = Vec::new();
        let mut excluded: Vec<ExcludedDelta> = Vec::new();
        for mut delta in stamped {
            let owner = owning_mapping(&mappings, &delta.path)
                .filter(|m| EntityType::from_path(&m.root_folder, &delta.path).is_some());
            let Some(mapping) = owner else {
                log::debug!("[ingest] ignoring unrecognized path {}", delta.path);
                excluded.push(ExcludedDelta {
                    delta,
                    reason: ExclusionReason::UnrecognizedPath,
                });
                continue;
            };

            delta.root_mapping_id = Some(mapping.root_folder_id.clone());
            match groups
                .iter_mut()
                .find(|(m, _)| m.root_folder_id == mapping.root_folder_id)
            {
                Some((_, deltas)) => deltas.push(delta),
                None => groups.push((mapping, vec![delta])),
            }
        }

        let own_commit: Vec<FileDelta> = groups
            .iter()
            .flat_map(|(_, deltas)| deltas.iter())
            .filter(|d| !d.from_another_commit)
            .cloned()
            .collect();
        self.activity
            .record(&target.account_id, None, &own_commit, ActivityStatus::Queued, None)
            .await;

        let mapping_ids: Vec<String> = groups
            .iter()
            .map(|(m, _)| m.root_folder_id.clone())
            .collect();
        let scope = match groups.as_slice() {
            [(only, _)] => only.scope(),
            _ => AccountScope::account(&target.account_id),
        };

        let mut accepted = Vec::new();
        for (mapping, deltas) in groups {
            let outcome = self.filter.partition(mapping, deltas).await?;
            accepted.extend(outcome.accepted);
            excluded.extend(outcome.excluded);
        }

        for item in &excluded {
            self.activity
                .record(
                    &target.account_id,
                    None,
                    std::slice::from_ref(&item.delta),
                    ActivityStatus::Skipped,
                    Some(&item.reason.to_string()),
                )
                .await;
        }

        let mut summary = IngestionSummary {
            processing_commit_id: processing_commit_id.clone(),
            accepted: accepted.len(),
            ..IngestionSummary::default()
        };

        if accepted.is_empty() {
            log::info!(
                "[ingest] commit {} on {}@{}: nothing to apply ({} excluded)",
                processing_commit_id,
                target.repo,
                target.branch,
                excluded.len()
            );
            commit_ledger::mark_completed(
                &self.pool,
                &target.account_id,
                &processing_commit_id,
                &target.repo,
                &target.branch,
                mapping_ids,
            )
            .await?;
            summary.excluded = excluded;
            return Ok(summary);
        }

        commit_ledger::upsert(
            &self.pool,
            &CommitRecord::new(
                &target.account_id,
                &processing_commit_id,
                &target.repo,
                &target.branch,
                CommitStatus::Queued,
                mapping_ids,
            ),
        )
        .await?;

        let request = SyncRequest::new(scope, Direction::GitToInternal, accepted)
            .with_webhook(target.coordinates(Some(processing_commit_id.clone())));
        let saved = sync_queue::save(&self.pool, self.mappings.as_ref(), request).await?;

        log::info!(
            "[ingest] commit {} on {}@{}: queued {} with {} delta(s), {} excluded",
            processing_commit_id,
            target.repo,
            target.branch,
            saved.id,
            summary.accepted,
            excluded.len()
        );

        summary.request_id = Some(saved.id);
        summary.excluded = excluded;
        Ok(summary)
    }

    async fn settle_origin(
        &self,
        target: &GitTarget,
        origin: Option<&str>,
        status: RequestStatus,
        reason: Option<&str>,
    ) -> Result<(), SyncError> {
        let Some(origin) = origin else {
            return Ok(());
        };
        let updated = sync_queue::update_status_with_reason(
            &self.pool,
            &target.account_id,
            origin,
            status,
            reason,
        )
        .await?;
        if !updated {
            log::debug!("[ingest] origin request {} already settled", origin);
        }
        Ok(())
    }
}

/// Stamp each delta with the processing commit. Deltas without their own
/// commit inherit it; deltas from an earlier commit are flagged.
fn stamp(diff: DiffResult) -> Vec<FileDelta> {
    let DiffResult {
        processing_commit_id,
        processing_commit_time_ms,
        processing_commit_message,
        deltas,
        ..
    } = diff;

    deltas
        .into_iter()
        .map(|mut delta| {
            delta.originated_from_git = true;
            delta.processing_commit_id = Some(processing_commit_id.clone());
            delta.processing_commit_time_ms = processing_commit_time_ms;
            delta.processing_commit_message = processing_commit_message.clone();

            match &delta.commit_id {
                Some(commit_id) => delta.from_another_commit = *commit_id != processing_commit_id,
                None => {
                    delta.commit_id = Some(processing_commit_id.clone());
                    delta.from_another_commit = false;
                }
            }
            if delta.commit_time_ms.is_none() && !delta.from_another_commit {
                delta.commit_time_ms = processing_commit_time_ms;
            }
            delta
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::models::ChangeType;
    use crate::services::activity_log::{recent, SqliteActivityLog};
    use crate::services::collaborators::StaticRootMappings;

    fn mapping(id: &str, root: &str, project: &str) -> RootMapping {
        RootMapping {
            root_folder_id: id.into(),
            root_folder: root.into(),
            repo: "org/repo".into(),
            branch: "main".into(),
            connector_id: "conn".into(),
            account_id: "acc".into(),
            org_id: "org".into(),
            project_id: project.into(),
        }
    }

    fn processor(pool: &DbPool, mappings: Vec<RootMapping>) -> DiffIngestionProcessor {
        DiffIngestionProcessor::new(
            pool.clone(),
            Arc::new(StaticRootMappings::new(mappings)),
            Arc::new(SqliteActivityLog::new(pool.clone())),
        )
    }

    fn target() -> GitTarget {
        GitTarget::new("acc", "conn", "org/repo", "main")
    }

    fn diff(deltas: Vec<FileDelta>) -> DiffResult {
        let mut diff = DiffResult::new("c2", deltas);
        diff.processing_commit_time_ms = Some(1_000);
        diff
    }

    #[test]
    fn test_stamp_marks_foreign_commits() {
        let stamped = stamp(diff(vec![
            FileDelta::new("a.yaml", ChangeType::Add),
            FileDelta::new("b.yaml", ChangeType::Modify).with_commit("c1", 500),
        ]));

        assert_eq!(stamped[0].commit_id.as_deref(), Some("c2"));
        assert_eq!(stamped[0].commit_time_ms, Some(1_000));
        assert!(!stamped[0].from_another_commit);
        assert!(stamped[1].from_another_commit);
        assert_eq!(stamped[1].commit_time_ms, Some(500));
        assert!(stamped.iter().all(|d| d.originated_from_git));
        assert!(stamped
            .iter()
            .all(|d| d.processing_commit_id.as_deref() == Some("c2")));
    }

    #[tokio::test]
    async fn test_combined_request_with_longest_prefix_owner() {
        let pool = test_pool().await;
        let ingest = processor(
            &pool,
            vec![
                mapping("outer", ".harness", "p1"),
                mapping("inner", ".harness/team", "p2"),
            ],
        );

        let summary = ingest
            .process_git_diff(
                &target(),
                diff(vec![
                    FileDelta::new(".harness/pipelines/a.yaml", ChangeType::Add),
                    FileDelta::new(".harness/team/services/s.yaml", ChangeType::Modify),
                    FileDelta::new("README.md", ChangeType::Modify),
                ]),
            )
            .await
            .unwrap();

        assert_eq!(summary.accepted, 2);
        assert_eq!(summary.excluded.len(), 1);
        assert_eq!(summary.excluded[0].reason, ExclusionReason::UnrecognizedPath);

        let request = sync_queue::get(&pool, summary.request_id.as_deref().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(request.direction, Direction::GitToInternal);
        assert_eq!(request.queue_key, "acc:conn:main");
        let owners: Vec<_> = request
            .file_deltas
            .iter()
            .map(|d| d.root_mapping_id.clone().unwrap())
            .collect();
        assert_eq!(owners, vec!["outer".to_string(), "inner".to_string()]);

        let commit = commit_ledger::get(&pool, "acc", "c2", "org/repo", "main")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(commit.status, CommitStatus::Queued);
    }

    #[tokio::test]
    async fn test_processed_commit_is_skipped_and_origin_settled() {
        let pool = test_pool().await;
        let ingest = processor(&pool, vec![mapping("rf", ".harness", "p1")]);
        commit_ledger::mark_completed(&pool, "acc", "c2", "org/repo", "main", vec![])
            .await
            .unwrap();

        let placeholder = SyncRequest::new(AccountScope::account("acc"), Direction::GitToInternal, vec![])
            .with_webhook(target().coordinates(Some("c2".into())));
        let placeholder = sync_queue::save(&pool, &StaticRootMappings::default(), placeholder)
            .await
            .unwrap();

        let summary = ingest
            .process_git_diff(
                &target(),
                diff(vec![FileDelta::new(".harness/pipelines/a.yaml", ChangeType::Add)])
                    .for_request(&placeholder.id),
            )
            .await
            .unwrap();

        assert!(summary.already_processed);
        assert!(summary.request_id.is_none());
        let settled = sync_queue::get(&pool, &placeholder.id).await.unwrap().unwrap();
        assert_eq!(settled.status, RequestStatus::Skipped);
        assert_eq!(
            sync_queue::counts_by_status(&pool, "acc").await.unwrap().total(),
            1
        );
    }

    #[tokio::test]
    async fn test_missing_mapping_is_configuration_error() {
        let pool = test_pool().await;
        let ingest = processor(&pool, vec![]);

        let result = ingest
            .process_git_diff(&target(), diff(vec![FileDelta::new("a.yaml", ChangeType::Add)]))
            .await;
        assert!(matches!(result, Err(SyncError::ConfigurationNotFound { .. })));
    }

    #[tokio::test]
    async fn test_fully_excluded_diff_completes_commit() {
        let pool = test_pool().await;
        let ingest = processor(&pool, vec![mapping("rf", ".harness", "p1")]);

        let summary = ingest
            .process_git_diff(&target(), diff(vec![FileDelta::new("docs/x.md", ChangeType::Add)]))
            .await
            .unwrap();

        assert!(summary.request_id.is_none());
        assert!(commit_ledger::is_processed(&pool, "acc", "c2", "org/repo", "main")
            .await
            .unwrap());

        let activity = recent(&pool, "acc", 10).await.unwrap();
        assert_eq!(activity.len(), 1);
        assert_eq!(activity[0].status(), ActivityStatus::Skipped);
    }
}
