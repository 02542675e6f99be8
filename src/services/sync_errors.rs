//! Per-file sync errors awaiting a fix or an explicit discard.

use crate::db::pool::DbPool;
use crate::error::SyncError;
use crate::models::{now_ms, Direction, SyncErrorRecord};

/// Record (or refresh) the failure of one file.
pub async fn upsert(
    pool: &DbPool,
    account_id: &str,
    file_path: &str,
    direction: Direction,
    commit_id: Option<&str>,
    message: &str,
) -> Result<(), SyncError> {
    let now = now_ms();
    sqlx::query(
        r#"
        INSERT INTO sync_errors (account_id, file_path, direction, commit_id, message, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (account_id, file_path, direction) DO UPDATE SET
            commit_id = excluded.commit_id,
            message = excluded.message,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(account_id)
    .bind(file_path)
    .bind(direction.as_str())
    .bind(commit_id)
    .bind(message)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(())
}

/// Remove errors for paths that have since synced successfully.
pub async fn clear_for_paths(
    pool: &DbPool,
    account_id: &str,
    direction: Direction,
    paths: &[String],
) -> Result<u64, SyncError> {
    let mut cleared = 0;
    let mut tx = pool.begin().await?;
    for path in paths {
        let result = sqlx::query(
            "DELETE FROM sync_errors WHERE account_id = ? AND direction = ? AND file_path = ?",
        )
        .bind(account_id)
        .bind(direction.as_str())
        .bind(path)
        .execute(&mut *tx)
        .await?;
        cleared += result.rows_affected();
    }
    tx.commit().await?;
    Ok(cleared)
}

/// All open errors for an account, newest first.
pub async fn list(pool: &DbPool, account_id: &str) -> Result<Vec<SyncErrorRecord>, SyncError> {
    let records = sqlx::query_as::<_, SyncErrorRecord>(
        r#"
        SELECT id, account_id, file_path, direction, commit_id, message, created_at, updated_at
        FROM sync_errors
        WHERE account_id = ?
        ORDER BY updated_at DESC, id DESC
        "#,
    )
    .bind(account_id)
    .fetch_all(pool)
    .await?;

    Ok(records)
}

/// Discard one error by id. Returns false if it did not exist.
pub async fn discard(pool: &DbPool, account_id: &str, id: i64) -> Result<bool, SyncError> {
    let result = sqlx::query("DELETE FROM sync_errors WHERE account_id = ? AND id = ?")
        .bind(account_id)
        .bind(id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}

/// Discard every error for the given paths, in any direction.
pub async fn discard_for_paths(
    pool: &DbPool,
    account_id: &str,
    paths: &[String],
) -> Result<u64, SyncError> {
    let mut discarded = 0;
    let mut tx = pool.begin().await?;
    for path in paths {
        let result = sqlx::query("DELETE FROM sync_errors WHERE account_id = ? AND file_path = ?")
            .bind(account_id)
            .bind(path)
            .execute(&mut *tx)
            .await?;
        discarded += result.rows_affected();
    }
    tx.commit().await?;
    Ok(discarded)
}
