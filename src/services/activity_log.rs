//! SQLite-backed activity log.

use async_trait::async_trait;

use super::collaborators::ActivityLog;
use crate::db::pool::DbPool;
use crate::error::SyncError;
use crate::models::{now_ms, ActivityEntry, ActivityStatus, FileDelta};

/// Maximum rows returned by a single `recent` query.
const MAX_RECENT_ENTRIES: i64 = 500;

/// Activity log writing to the `activity_log` table.
#[derive(Clone)]
pub struct SqliteActivityLog {
    pool: DbPool,
}

impl SqliteActivityLog {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn insert(
        &self,
        account_id: &str,
        request_id: Option<&str>,
        deltas: &[FileDelta],
        status: ActivityStatus,
        reason: Option<&str>,
    ) -> Result<(), SyncError> {
        let now = now_ms();
        let mut tx = self.pool.begin().await?;
        for delta in deltas {
            sqlx::query(
                r#"
                INSERT INTO activity_log (account_id, request_id, file_path, commit_id, status, reason, recorded_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(account_id)
            .bind(request_id)
            .bind(&delta.path)
            .bind(delta.commit_id.as_deref().or(delta.processing_commit_id.as_deref()))
            .bind(status.as_str())
            .bind(reason)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl ActivityLog for SqliteActivityLog {
    async fn record(
        &self,
        account_id: &str,
        request_id: Option<&str>,
        deltas: &[FileDelta],
        status: ActivityStatus,
        reason: Option<&str>,
    ) {
        if deltas.is_empty() {
            return;
        }
        if let Err(e) = self.insert(account_id, request_id, deltas, status, reason).await {
            log::warn!(
                "[activity] failed to record {} {} entries for account {}: {}",
                deltas.len(),
                status,
                account_id,
                e
            );
        }
    }
}

/// Most recent activity for an account, newest first.
pub async fn recent(
    pool: &DbPool,
    account_id: &str,
    limit: i64,
) -> Result<Vec<ActivityEntry>, SyncError> {
    let entries = sqlx::query_as::<_, ActivityEntry>(
        r#"
        SELECT id, account_id, request_id, file_path, commit_id, status, reason, recorded_at
        FROM activity_log
        WHERE account_id = ?
        ORDER BY recorded_at DESC, id DESC
        LIMIT ?
        "#,
    )
    .bind(account_id)
    .bind(limit.clamp(1, MAX_RECENT_ENTRIES))
    .fetch_all(pool)
    .await?;

    Ok(entries)
}
