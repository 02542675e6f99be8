//! Change ledger: latest known change per file path.

use sqlx::SqliteConnection;

use crate::db::pool::DbPool;
use crate::error::SyncError;
use crate::models::change_ledger::ChangeLedgerRow;
use crate::models::{ChangeDetail, ChangeLedgerEntry, LedgerKey};

/// Fetch the entry for a path.
pub async fn get(pool: &DbPool, key: &LedgerKey) -> Result<Option<ChangeLedgerEntry>, SyncError> {
    let row = sqlx::query_as::<_, ChangeLedgerRow>(
        r#"
        SELECT account_id, org_id, project_id, file_path, change_request_ts, change_processed_ts,
               change_source, internal_request_id, commit_id, processing_commit_id
        FROM change_ledger
        WHERE account_id = ? AND org_id = ? AND project_id = ? AND file_path = ?
        "#,
    )
    .bind(&key.scope.account_id)
    .bind(&key.scope.org_id)
    .bind(&key.scope.project_id)
    .bind(&key.file_path)
    .fetch_optional(pool)
    .await?;

    row.map(ChangeLedgerEntry::try_from).transpose()
}

/// Replace the entry for a path.
///
/// Delete and insert run in one transaction so readers never observe a
/// missing entry for a tracked path.
pub async fn upsert(pool: &DbPool, entry: &ChangeLedgerEntry) -> Result<(), SyncError> {
    let mut tx = pool.begin().await?;
    upsert_in(&mut *tx, entry).await?;
    tx.commit().await?;
    Ok(())
}

/// Replace the entry for a path inside a caller-held transaction.
pub async fn upsert_in(
    conn: &mut SqliteConnection,
    entry: &ChangeLedgerEntry,
) -> Result<(), SyncError> {
    let (internal_request_id, commit_id, processing_commit_id) = match &entry.change_detail {
        ChangeDetail::Internal {
            internal_request_id,
        } => (Some(internal_request_id.as_str()), None, None),
        ChangeDetail::Git {
            commit_id,
            processing_commit_id,
        } => (None, Some(commit_id.as_str()), Some(processing_commit_id.as_str())),
    };

    sqlx::query(
        "DELETE FROM change_ledger WHERE account_id = ? AND org_id = ? AND project_id = ? AND file_path = ?",
    )
    .bind(&entry.scope.account_id)
    .bind(&entry.scope.org_id)
    .bind(&entry.scope.project_id)
    .bind(&entry.file_path)
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO change_ledger (account_id, org_id, project_id, file_path, change_request_ts,
                                   change_processed_ts, change_source, internal_request_id,
                                   commit_id, processing_commit_id)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&entry.scope.account_id)
    .bind(&entry.scope.org_id)
    .bind(&entry.scope.project_id)
    .bind(&entry.file_path)
    .bind(entry.change_request_ts)
    .bind(entry.change_processed_ts)
    .bind(entry.change_source().as_str())
    .bind(internal_request_id)
    .bind(commit_id)
    .bind(processing_commit_id)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Stamp an internal change as applied, if the entry still belongs to
/// `internal_request_id`. Returns false when a newer change replaced it.
pub async fn mark_processed(
    pool: &DbPool,
    key: &LedgerKey,
    internal_request_id: &str,
    processed_at: i64,
) -> Result<bool, SyncError> {
    let result = sqlx::query(
        r#"
        UPDATE change_ledger SET change_processed_ts = ?
        WHERE account_id = ? AND org_id = ? AND project_id = ? AND file_path = ?
          AND change_source = 'internal' AND internal_request_id = ?
        "#,
    )
    .bind(processed_at)
    .bind(&key.scope.account_id)
    .bind(&key.scope.org_id)
    .bind(&key.scope.project_id)
    .bind(&key.file_path)
    .bind(internal_request_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}
