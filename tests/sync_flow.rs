//! End-to-end sync flow tests.
//!
//! These drive the public commands against a temporary database with fake
//! git and entity-store integrations:
//! 1. Webhook -> diff request -> ingestion -> apply
//! 2. Redelivered webhooks and diffs for processed commits
//! 3. Ordering against the change ledger, including in-flight internal writes
//! 4. Internal writes pushed to git and their webhook echo
//! 5. Full branch resync, including a crash mid-resync
//! 6. Per-file sync errors

mod common;

use common::*;
use gitsync::commands::changes::{submit_internal_change, InternalChange};
use gitsync::commands::errors::{
    discard_sync_error, discard_sync_errors_for_paths, list_sync_errors,
};
use gitsync::commands::sync::{
    get_queue_overview, get_request, list_queue, process_diff, request_branch_sync,
};
use gitsync::commands::webhook::{accept_webhook, WebhookOutcome};
use gitsync::error::SyncError;
use gitsync::models::{
    ChangeDetail, ChangeLedgerEntry, ChangeType, DiffResult, Direction, EntityType, FileDelta,
    LedgerKey, RequestStatus,
};
use gitsync::services::branch_sync::get_state;
use gitsync::services::diff_ingestion::GitTarget;
use gitsync::services::time_ordering::ExclusionReason;
use gitsync::services::{change_ledger, commit_ledger};

fn target() -> GitTarget {
    GitTarget::new(ACCOUNT, CONNECTOR, REPO, BRANCH)
}

fn diff_at(commit_id: &str, time_ms: i64, paths: &[&str]) -> DiffResult {
    let deltas = paths
        .iter()
        .map(|p| FileDelta::new(*p, ChangeType::Modify).with_content("pipeline: {}"))
        .collect();
    let mut diff = DiffResult::new(commit_id, deltas);
    diff.processing_commit_time_ms = Some(time_ms);
    diff
}

fn pipeline_change(id: &str) -> InternalChange {
    InternalChange {
        scope: scope(),
        entity_type: EntityType::Pipeline,
        entity_id: id.into(),
        change_type: ChangeType::Modify,
        content: Some("pipeline: {}".into()),
    }
}

async fn accepted_webhook(h: &Harness, commit_id: &str) -> String {
    let outcome = accept_webhook(
        &h.ctx,
        scope(),
        TOKEN,
        &github_push_payload(commit_id),
        &github_push_headers(),
    )
    .await
    .unwrap();
    match outcome {
        WebhookOutcome::Accepted { request_id } => request_id,
        other => panic!("expected accepted webhook, got {:?}", other),
    }
}

#[tokio::test]
async fn test_webhook_diff_apply_flow() {
    let h = Harness::new().await;
    let p1 = pipeline_path("p1");

    let placeholder = accepted_webhook(&h, "c1").await;
    let request = get_request(&h.ctx, &placeholder).await.unwrap();
    assert_eq!(request.direction, Direction::GitToInternal);
    assert!(request.is_placeholder());
    assert_eq!(request.queue_key, QUEUE_KEY);

    // Running the placeholder asks the gateway for the diff
    let (id, status) = h.run_next().await.unwrap();
    assert_eq!(id, placeholder);
    assert_eq!(status, RequestStatus::Running);
    let asked = h.gateway.diff_requests();
    assert_eq!(asked.len(), 1);
    assert_eq!(asked[0].request_id, placeholder);
    assert_eq!(asked[0].to_commit_id.as_deref(), Some("c1"));
    assert_eq!(asked[0].from_commit_id, None);

    let summary = process_diff(
        &h.ctx,
        &target(),
        diff_at("c1", 1_000, &[&p1]).for_request(&placeholder),
    )
    .await
    .unwrap();
    assert_eq!(summary.accepted, 1);
    assert!(summary.excluded.is_empty());
    assert_eq!(h.status_of(&placeholder).await, RequestStatus::Completed);

    let (apply_id, status) = h.run_next().await.unwrap();
    assert_eq!(Some(apply_id), summary.request_id);
    assert_eq!(status, RequestStatus::Completed);
    assert_eq!(h.applier.applied_paths(), vec![p1.clone()]);

    assert!(commit_ledger::is_processed(&h.ctx.pool, ACCOUNT, "c1", REPO, BRANCH)
        .await
        .unwrap());

    let entry = change_ledger::get(&h.ctx.pool, &LedgerKey::new(scope(), p1.clone()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.change_request_ts, 1_000);
    assert!(entry.change_processed_ts.is_some());
    assert_eq!(
        entry.change_detail,
        ChangeDetail::Git {
            commit_id: "c1".into(),
            processing_commit_id: "c1".into(),
        }
    );

    assert!(h.run_next().await.is_none());
}

#[tokio::test]
async fn test_redelivery_of_processed_commit_is_ignored() {
    let h = Harness::new().await;
    let p1 = pipeline_path("p1");

    process_diff(&h.ctx, &target(), diff_at("c1", 1_000, &[&p1]))
        .await
        .unwrap();
    h.run_next().await.unwrap();
    assert_eq!(h.applier.applied_paths().len(), 1);

    let outcome = accept_webhook(
        &h.ctx,
        scope(),
        TOKEN,
        &github_push_payload("c1"),
        &github_push_headers(),
    )
    .await
    .unwrap();
    assert_eq!(
        outcome,
        WebhookOutcome::Duplicate {
            commit_id: "c1".into()
        }
    );

    let again = process_diff(&h.ctx, &target(), diff_at("c1", 1_000, &[&p1]))
        .await
        .unwrap();
    assert!(again.already_processed);
    assert_eq!(again.request_id, None);
    assert!(h.run_next().await.is_none());
    assert_eq!(h.applier.applied_paths().len(), 1);
}

#[tokio::test]
async fn test_diff_redelivered_while_queued_applies_once() {
    let h = Harness::new().await;
    let p1 = pipeline_path("p1");

    let first = process_diff(&h.ctx, &target(), diff_at("c1", 1_000, &[&p1]))
        .await
        .unwrap();
    // c1 is only queued, so the redelivery is ingested again
    let second = process_diff(&h.ctx, &target(), diff_at("c1", 1_000, &[&p1]))
        .await
        .unwrap();
    assert!(!second.already_processed);
    assert!(second.request_id.is_some());
    assert_ne!(first.request_id, second.request_id);

    let (id, status) = h.run_next().await.unwrap();
    assert_eq!(Some(id), first.request_id);
    assert_eq!(status, RequestStatus::Completed);

    let (id, status) = h.run_next().await.unwrap();
    assert_eq!(Some(id), second.request_id);
    assert_eq!(status, RequestStatus::Skipped);
    assert_eq!(h.applier.applied_paths(), vec![p1]);
}

#[tokio::test]
async fn test_webhook_rejections() {
    let h = Harness::new().await;
    let payload = github_push_payload("c1");

    let outcome = accept_webhook(&h.ctx, scope(), "wrong-token", &payload, &github_push_headers())
        .await
        .unwrap();
    assert!(matches!(outcome, WebhookOutcome::Rejected { .. }));

    let mut ping = github_push_headers();
    ping.insert("X-GitHub-Event".into(), "ping".into());
    let outcome = accept_webhook(&h.ctx, scope(), TOKEN, &payload, &ping)
        .await
        .unwrap();
    assert!(matches!(outcome, WebhookOutcome::Rejected { .. }));

    let no_branch = serde_json::json!({ "after": "c1" }).to_string();
    let outcome = accept_webhook(&h.ctx, scope(), TOKEN, &no_branch, &github_push_headers())
        .await
        .unwrap();
    assert!(matches!(outcome, WebhookOutcome::Rejected { .. }));

    let outcome = accept_webhook(&h.ctx, scope(), TOKEN, "{ not json", &github_push_headers())
        .await
        .unwrap();
    assert!(matches!(outcome, WebhookOutcome::Rejected { .. }));

    let overview = get_queue_overview(&h.ctx, ACCOUNT, None).await.unwrap();
    assert_eq!(overview.counts.total(), 0);
}

#[tokio::test]
async fn test_stale_git_change_is_excluded() {
    let h = Harness::new().await;
    let p1 = pipeline_path("p1");
    let p2 = pipeline_path("p2");

    change_ledger::upsert(
        &h.ctx.pool,
        &ChangeLedgerEntry {
            scope: scope(),
            file_path: p1.clone(),
            change_request_ts: 2_000,
            change_processed_ts: Some(2_000),
            change_detail: ChangeDetail::Git {
                commit_id: "c-newer".into(),
                processing_commit_id: "c-newer".into(),
            },
        },
    )
    .await
    .unwrap();

    let summary = process_diff(&h.ctx, &target(), diff_at("c-old", 1_500, &[&p1, &p2]))
        .await
        .unwrap();
    assert_eq!(summary.accepted, 1);
    assert_eq!(summary.excluded.len(), 1);
    assert_eq!(summary.excluded[0].delta.path, p1);
    assert_eq!(
        summary.excluded[0].reason,
        ExclusionReason::StaleChange {
            incoming_ms: 1_500,
            recorded_ms: 2_000
        }
    );

    h.run_next().await.unwrap();
    assert_eq!(h.applier.applied_paths(), vec![p2]);
}

#[tokio::test]
async fn test_fully_excluded_diff_completes_commit() {
    let h = Harness::new().await;

    let summary = process_diff(&h.ctx, &target(), diff_at("c1", 1_000, &["README.md"]))
        .await
        .unwrap();
    assert_eq!(summary.request_id, None);
    assert_eq!(summary.excluded[0].reason, ExclusionReason::UnrecognizedPath);
    assert!(commit_ledger::is_processed(&h.ctx.pool, ACCOUNT, "c1", REPO, BRANCH)
        .await
        .unwrap());
}

#[tokio::test]
async fn test_git_change_waits_for_in_flight_internal_write() {
    let h = Harness::new().await;
    let p1 = pipeline_path("p1");

    let internal_id = submit_internal_change(&h.ctx, pipeline_change("p1"))
        .await
        .unwrap();

    // Pin the internal write at t=200 so only the in-flight rule applies
    change_ledger::upsert(
        &h.ctx.pool,
        &ChangeLedgerEntry {
            scope: scope(),
            file_path: p1.clone(),
            change_request_ts: 200,
            change_processed_ts: None,
            change_detail: ChangeDetail::Internal {
                internal_request_id: internal_id.clone(),
            },
        },
    )
    .await
    .unwrap();

    let summary = process_diff(&h.ctx, &target(), diff_at("c1", 250, &[&p1]))
        .await
        .unwrap();
    assert_eq!(summary.accepted, 0);
    assert_eq!(
        summary.excluded[0].reason,
        ExclusionReason::InternalWriteInFlight {
            internal_request_id: internal_id.clone()
        }
    );

    let (id, status) = h.run_next().await.unwrap();
    assert_eq!(id, internal_id);
    assert_eq!(status, RequestStatus::Completed);

    // Once the push settles, a newer git change goes through
    let summary = process_diff(&h.ctx, &target(), diff_at("c2", 300, &[&p1]))
        .await
        .unwrap();
    assert_eq!(summary.accepted, 1);
    h.run_next().await.unwrap();
    assert_eq!(h.applier.applied_paths(), vec![p1]);
}

#[tokio::test]
async fn test_internal_push_suppresses_its_webhook_echo() {
    let h = Harness::new().await;
    let p1 = pipeline_path("p1");

    let request_id = submit_internal_change(&h.ctx, pipeline_change("p1"))
        .await
        .unwrap();
    let request = get_request(&h.ctx, &request_id).await.unwrap();
    assert_eq!(request.direction, Direction::InternalToGit);
    assert_eq!(request.queue_key, QUEUE_KEY);
    assert_eq!(request.file_deltas[0].path, p1);

    let (_, status) = h.run_next().await.unwrap();
    assert_eq!(status, RequestStatus::Completed);

    let pushes = h.gateway.pushes();
    assert_eq!(pushes.len(), 1);
    assert_eq!(pushes[0].request_id, request_id);

    let entry = change_ledger::get(&h.ctx.pool, &LedgerKey::new(scope(), p1))
        .await
        .unwrap()
        .unwrap();
    assert!(entry.change_processed_ts.is_some());

    let outcome = accept_webhook(
        &h.ctx,
        scope(),
        TOKEN,
        &github_push_payload("pushed-1"),
        &github_push_headers(),
    )
    .await
    .unwrap();
    assert!(matches!(outcome, WebhookOutcome::Duplicate { .. }));
}

#[tokio::test]
async fn test_internal_change_validation() {
    let h = Harness::new().await;

    assert!(matches!(
        submit_internal_change(&h.ctx, pipeline_change("../escape")).await,
        Err(SyncError::InvalidInput { .. })
    ));

    let mut unmapped = pipeline_change("p1");
    unmapped.scope.project_id = "other".into();
    let err = submit_internal_change(&h.ctx, unmapped).await.unwrap_err();
    assert!(err.is_configuration_not_found());

    let mut no_content = pipeline_change("p1");
    no_content.content = None;
    assert!(submit_internal_change(&h.ctx, no_content).await.is_err());

    let mut deletion = pipeline_change("p1");
    deletion.change_type = ChangeType::Delete;
    deletion.content = None;
    assert!(submit_internal_change(&h.ctx, deletion).await.is_ok());
}

#[tokio::test]
async fn test_branch_sync_imports_snapshot() {
    let h = Harness::new().await;
    let p1 = pipeline_path("p1");
    h.gateway.set_snapshot(diff_at("head", 9_000, &[&p1]));

    let sync_id = request_branch_sync(&h.ctx, scope(), &target()).await.unwrap();
    let (id, status) = h.run_next().await.unwrap();
    assert_eq!(id, sync_id);
    assert_eq!(status, RequestStatus::Completed);

    let state = get_state(&h.ctx.pool, ACCOUNT, REPO, BRANCH)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.status.to_string(), "synced");

    // The snapshot became an ordinary git-to-internal request
    let (_, status) = h.run_next().await.unwrap();
    assert_eq!(status, RequestStatus::Completed);
    assert_eq!(h.applier.applied_paths(), vec![p1]);

    // A synced branch is not resynced again
    let second = request_branch_sync(&h.ctx, scope(), &target()).await.unwrap();
    let (id, status) = h.run_next().await.unwrap();
    assert_eq!(id, second);
    assert_eq!(status, RequestStatus::Skipped);
}

#[tokio::test]
async fn test_failed_branch_sync_returns_to_unsynced() {
    let h = Harness::new().await;
    h.gateway
        .fail_snapshots
        .store(true, std::sync::atomic::Ordering::SeqCst);

    let sync_id = request_branch_sync(&h.ctx, scope(), &target()).await.unwrap();
    let (_, status) = h.run_next().await.unwrap();
    assert_eq!(status, RequestStatus::Queued);

    let request = get_request(&h.ctx, &sync_id).await.unwrap();
    assert_eq!(request.retry_count, 1);
    let state = get_state(&h.ctx.pool, ACCOUNT, REPO, BRANCH)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.status.to_string(), "unsynced");

    h.gateway
        .fail_snapshots
        .store(false, std::sync::atomic::Ordering::SeqCst);
    h.gateway.set_snapshot(diff_at("head", 9_000, &[]));
    let (_, status) = h.run_next().await.unwrap();
    assert_eq!(status, RequestStatus::Completed);
}

#[tokio::test]
async fn test_panicking_branch_sync_releases_branch() {
    let h = Harness::new().await;
    h.gateway.set_snapshot(diff_at("head", 9_000, &[]));
    h.gateway
        .panic_next_snapshot
        .store(true, std::sync::atomic::Ordering::SeqCst);

    let sync_id = request_branch_sync(&h.ctx, scope(), &target()).await.unwrap();
    let (id, status) = h.run_next().await.unwrap();
    assert_eq!(id, sync_id);
    assert_eq!(status, RequestStatus::Queued);
    let state = get_state(&h.ctx.pool, ACCOUNT, REPO, BRANCH)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.status.to_string(), "unsynced");

    let (id, status) = h.run_next().await.unwrap();
    assert_eq!(id, sync_id);
    assert_eq!(status, RequestStatus::Completed);
    let state = get_state(&h.ctx.pool, ACCOUNT, REPO, BRANCH)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.status.to_string(), "synced");
    assert_eq!(state.owner_request_id, Some(sync_id));
}

#[tokio::test]
async fn test_apply_failures_become_sync_errors() {
    let h = Harness::new().await;
    let p1 = pipeline_path("p1");
    let p2 = pipeline_path("p2");
    h.applier.fail_path(&p2);

    process_diff(&h.ctx, &target(), diff_at("c1", 1_000, &[&p1, &p2]))
        .await
        .unwrap();
    let (_, status) = h.run_next().await.unwrap();
    assert_eq!(status, RequestStatus::Completed);
    assert_eq!(h.applier.applied_paths(), vec![p1]);

    let errors = list_sync_errors(&h.ctx, ACCOUNT).await.unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].file_path, p2);
    assert_eq!(errors[0].direction, "git_to_internal");
    assert_eq!(errors[0].message, "invalid YAML");

    discard_sync_error(&h.ctx, ACCOUNT, errors[0].id).await.unwrap();
    assert!(list_sync_errors(&h.ctx, ACCOUNT).await.unwrap().is_empty());
    assert!(matches!(
        discard_sync_error(&h.ctx, ACCOUNT, errors[0].id).await,
        Err(SyncError::NotFound { .. })
    ));

    assert!(discard_sync_errors_for_paths(&h.ctx, ACCOUNT, &[]).await.is_err());
}

#[tokio::test]
async fn test_queue_overview_reports_counts_and_activity() {
    let h = Harness::new().await;
    let p1 = pipeline_path("p1");

    process_diff(&h.ctx, &target(), diff_at("c1", 1_000, &[&p1]))
        .await
        .unwrap();
    submit_internal_change(&h.ctx, pipeline_change("p2"))
        .await
        .unwrap();
    h.run_next().await.unwrap();

    let overview = get_queue_overview(&h.ctx, ACCOUNT, Some(10)).await.unwrap();
    assert_eq!(overview.counts.completed, 1);
    assert_eq!(overview.counts.queued, 1);
    assert!(overview
        .recent_activity
        .iter()
        .any(|a| a.file_path == pipeline_path("p1") && a.status == "completed"));
}

#[tokio::test]
async fn test_failed_ledger_write_leaves_no_request() {
    let h = Harness::new().await;
    sqlx::query("DROP TABLE change_ledger")
        .execute(&h.ctx.pool)
        .await
        .unwrap();

    assert!(submit_internal_change(&h.ctx, pipeline_change("p1"))
        .await
        .is_err());

    let overview = get_queue_overview(&h.ctx, ACCOUNT, None).await.unwrap();
    assert_eq!(overview.counts.total(), 0);
    assert!(h.run_next().await.is_none());
}

#[tokio::test]
async fn test_list_queue_returns_requests_in_order() {
    let h = Harness::new().await;
    let first = submit_internal_change(&h.ctx, pipeline_change("p1"))
        .await
        .unwrap();
    let second = submit_internal_change(&h.ctx, pipeline_change("p2"))
        .await
        .unwrap();
    h.run_next().await.unwrap();

    let queue = list_queue(&h.ctx, QUEUE_KEY).await.unwrap();
    let ids: Vec<&str> = queue.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec![first.as_str(), second.as_str()]);
    assert_eq!(queue[0].status, RequestStatus::Completed);
    assert_eq!(queue[1].status, RequestStatus::Queued);
    assert!(list_queue(&h.ctx, "acc:conn:dev").await.unwrap().is_empty());
}
