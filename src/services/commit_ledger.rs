//! Commit ledger: which commits have been processed on which branch.
//!
//! A `completed` record is never downgraded. Later upserts may still replace
//! its root mapping list.

use crate::db::pool::DbPool;
use crate::error::SyncError;
use crate::models::commit_record::CommitRecordRow;
use crate::models::{CommitRecord, CommitStatus};

/// Check if a commit has completed processing on a branch.
pub async fn is_processed(
    pool: &DbPool,
    account_id: &str,
    commit_id: &str,
    repo: &str,
    branch: &str,
) -> Result<bool, SyncError> {
    let found: Option<(i64,)> = sqlx::query_as(
        r#"
        SELECT 1 FROM commit_records
        WHERE account_id = ? AND commit_id = ? AND repo = ? AND branch_name = ? AND status = 'completed'
        "#,
    )
    .bind(account_id)
    .bind(commit_id)
    .bind(repo)
    .bind(branch)
    .fetch_optional(pool)
    .await?;

    Ok(found.is_some())
}

/// Insert or update a commit record.
pub async fn upsert(pool: &DbPool, record: &CommitRecord) -> Result<(), SyncError> {
    let mapping_ids = serde_json::to_string(&record.root_mapping_ids)?;

    sqlx::query(
        r#"
        INSERT INTO commit_records (account_id, commit_id, repo, branch_name, status, root_mapping_ids, last_updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (account_id, commit_id, repo, branch_name) DO UPDATE SET
            root_mapping_ids = excluded.root_mapping_ids,
            status = CASE WHEN commit_records.status = 'completed'
                THEN commit_records.status ELSE excluded.status END,
            last_updated_at = CASE WHEN commit_records.status = 'completed'
                THEN commit_records.last_updated_at ELSE excluded.last_updated_at END
        "#,
    )
    .bind(&record.account_id)
    .bind(&record.commit_id)
    .bind(&record.repo)
    .bind(&record.branch_name)
    .bind(record.status.as_str())
    .bind(mapping_ids)
    .bind(record.last_updated_at)
    .execute(pool)
    .await?;

    log::debug!(
        "[commit-ledger] {} on {}@{} -> {}",
        record.commit_id,
        record.repo,
        record.branch_name,
        record.status
    );
    Ok(())
}

/// Most recently completed commit on a branch.
pub async fn find_last_processed(
    pool: &DbPool,
    account_id: &str,
    repo: &str,
    branch: &str,
) -> Result<Option<CommitRecord>, SyncError> {
    let row = sqlx::query_as::<_, CommitRecordRow>(
        r#"
        SELECT account_id, commit_id, repo, branch_name, status, root_mapping_ids, last_updated_at
        FROM commit_records
        WHERE account_id = ? AND repo = ? AND branch_name = ? AND status = 'completed'
        ORDER BY last_updated_at DESC, rowid DESC
        LIMIT 1
        "#,
    )
    .bind(account_id)
    .bind(repo)
    .bind(branch)
    .fetch_optional(pool)
    .await?;

    row.map(CommitRecord::try_from).transpose()
}

/// Fetch one commit record in any status.
pub async fn get(
    pool: &DbPool,
    account_id: &str,
    commit_id: &str,
    repo: &str,
    branch: &str,
) -> Result<Option<CommitRecord>, SyncError> {
    let row = sqlx::query_as::<_, CommitRecordRow>(
        r#"
        SELECT account_id, commit_id, repo, branch_name, status, root_mapping_ids, last_updated_at
        FROM commit_records
        WHERE account_id = ? AND commit_id = ? AND repo = ? AND branch_name = ?
        "#,
    )
    .bind(account_id)
    .bind(commit_id)
    .bind(repo)
    .bind(branch)
    .fetch_optional(pool)
    .await?;

    row.map(CommitRecord::try_from).transpose()
}

/// Record a commit as completed for the given mappings.
pub async fn mark_completed(
    pool: &DbPool,
    account_id: &str,
    commit_id: &str,
    repo: &str,
    branch: &str,
    root_mapping_ids: Vec<String>,
) -> Result<(), SyncError> {
    let record = CommitRecord::new(
        account_id,
        commit_id,
        repo,
        branch,
        CommitStatus::Completed,
        root_mapping_ids,
    );
    upsert(pool, &record).await
}
