//! Sync request queue persistence.
//!
//! Requests sharing a queue key run one at a time in insertion order. Every
//! transition is a single conditional statement, so several pollers may work
//! the same database without a coordinating lock. The claim in
//! [`select_next`] additionally relies on the partial unique index over
//! running rows.

use sqlx::SqliteConnection;

use crate::db::pool::DbPool;
use crate::error::SyncError;
use crate::models::sync_request::SyncRequestRow;
use crate::models::{
    now_ms, Direction, RequestStatus, StatusCounts, SyncRequest, REASON_MAX_RETRY_EXCEEDED,
};
use crate::services::collaborators::RootMappingProvider;

/// Resolve the queue key a request serializes on.
///
/// Requests with git coordinates key on `account:connector:branch`. Others
/// key on the project's default mapping, which must exist.
pub async fn resolve_queue_key(
    mappings: &dyn RootMappingProvider,
    request: &SyncRequest,
) -> Result<String, SyncError> {
    if !request.queue_key.is_empty() {
        return Ok(request.queue_key.clone());
    }

    if let Some(coordinates) = &request.webhook {
        return Ok(coordinates.queue_key(request.account_id()));
    }

    let scope = &request.scope;
    let mapping = mappings
        .get_default(&scope.project_id, &scope.org_id, &scope.account_id)
        .await?
        .ok_or_else(|| {
            SyncError::configuration_not_found(format!(
                "no default root mapping for {}/{}/{}",
                scope.account_id, scope.org_id, scope.project_id
            ))
        })?;

    Ok(mapping.queue_key())
}

/// Persist a new request, resolving its queue key first.
///
/// # Returns
/// The stored request with its queue key set
pub async fn save(
    pool: &DbPool,
    mappings: &dyn RootMappingProvider,
    request: SyncRequest,
) -> Result<SyncRequest, SyncError> {
    let mut conn = pool.acquire().await?;
    save_in(&mut *conn, mappings, request).await
}

/// Same as [`save`], on a caller-held connection or transaction.
pub async fn save_in(
    conn: &mut SqliteConnection,
    mappings: &dyn RootMappingProvider,
    mut request: SyncRequest,
) -> Result<SyncRequest, SyncError> {
    request.queue_key = resolve_queue_key(mappings, &request).await?;
    insert(conn, &request).await?;

    log::info!(
        "[queue] saved {} request {} on {} ({} deltas)",
        request.direction,
        request.id,
        request.queue_key,
        request.file_deltas.len()
    );
    Ok(request)
}

async fn insert(conn: &mut SqliteConnection, request: &SyncRequest) -> Result<(), SyncError> {
    let deltas = serde_json::to_string(&request.file_deltas)?;
    let coordinates = request.webhook.as_ref();

    sqlx::query(
        r#"
        INSERT INTO sync_requests (id, account_id, org_id, project_id, direction, status, retry_count,
                                   queue_key, file_deltas, repo, branch, connector_id, head_commit_id,
                                   status_reason, created_at, last_updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&request.id)
    .bind(&request.scope.account_id)
    .bind(&request.scope.org_id)
    .bind(&request.scope.project_id)
    .bind(request.direction.as_str())
    .bind(request.status.as_str())
    .bind(request.retry_count)
    .bind(&request.queue_key)
    .bind(deltas)
    .bind(coordinates.map(|c| c.repo.as_str()))
    .bind(coordinates.map(|c| c.branch.as_str()))
    .bind(coordinates.map(|c| c.connector_id.as_str()))
    .bind(coordinates.and_then(|c| c.head_commit_id.as_deref()))
    .bind(request.status_reason.as_deref())
    .bind(request.created_at)
    .bind(request.last_updated_at)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Fetch a request by id.
pub async fn get(pool: &DbPool, request_id: &str) -> Result<Option<SyncRequest>, SyncError> {
    let row = sqlx::query_as::<_, SyncRequestRow>("SELECT * FROM sync_requests WHERE id = ?")
        .bind(request_id)
        .fetch_optional(pool)
        .await?;

    row.map(SyncRequest::try_from).transpose()
}

/// Current status of a request, if it exists.
pub async fn get_status(
    pool: &DbPool,
    account_id: &str,
    request_id: &str,
) -> Result<Option<RequestStatus>, SyncError> {
    let status: Option<(String,)> =
        sqlx::query_as("SELECT status FROM sync_requests WHERE id = ? AND account_id = ?")
            .bind(request_id)
            .bind(account_id)
            .fetch_optional(pool)
            .await?;

    status.map(|(s,)| s.parse()).transpose()
}

/// Claim the next request for a queue key, moving it to `running`.
///
/// Returns `None` when the key already has a running request, the account is
/// at its running cap, nothing is queued, or another poller won the claim.
/// Git-to-internal work jumps ahead of other queued work unless the head of
/// the queue is a full sync.
pub async fn select_next(
    pool: &DbPool,
    account_id: &str,
    queue_key: &str,
    max_running_per_account: i64,
) -> Result<Option<SyncRequest>, SyncError> {
    let (running_for_key,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM sync_requests WHERE queue_key = ? AND status = 'running'",
    )
    .bind(queue_key)
    .fetch_one(pool)
    .await?;
    if running_for_key > 0 {
        return Ok(None);
    }

    let (running_for_account,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM sync_requests WHERE account_id = ? AND status = 'running'",
    )
    .bind(account_id)
    .fetch_one(pool)
    .await?;
    if running_for_account >= max_running_per_account {
        log::debug!(
            "[queue] account {} at running cap ({}/{})",
            account_id,
            running_for_account,
            max_running_per_account
        );
        return Ok(None);
    }

    let head = sqlx::query_as::<_, SyncRequestRow>(
        r#"
        SELECT * FROM sync_requests
        WHERE queue_key = ? AND account_id = ? AND status = 'queued'
        ORDER BY seq ASC
        LIMIT 1
        "#,
    )
    .bind(queue_key)
    .bind(account_id)
    .fetch_optional(pool)
    .await?;

    let Some(head) = head else {
        return Ok(None);
    };
    let head = SyncRequest::try_from(head)?;

    let mut candidate = head;
    if candidate.direction != Direction::FullSync {
        let git_first = sqlx::query_as::<_, SyncRequestRow>(
            r#"
            SELECT * FROM sync_requests
            WHERE queue_key = ? AND account_id = ? AND status = 'queued' AND direction = 'git_to_internal'
            ORDER BY seq ASC
            LIMIT 1
            "#,
        )
        .bind(queue_key)
        .bind(account_id)
        .fetch_optional(pool)
        .await?;

        if let Some(row) = git_first {
            candidate = SyncRequest::try_from(row)?;
        }
    }

    let now = now_ms();
    let claimed = sqlx::query(
        r#"
        UPDATE sync_requests SET status = 'running', last_updated_at = ?
        WHERE id = ? AND status = 'queued'
          AND NOT EXISTS (
              SELECT 1 FROM sync_requests WHERE queue_key = ? AND status = 'running'
          )
          AND (SELECT COUNT(*) FROM sync_requests WHERE account_id = ? AND status = 'running') < ?
        "#,
    )
    .bind(now)
    .bind(&candidate.id)
    .bind(queue_key)
    .bind(account_id)
    .bind(max_running_per_account)
    .execute(pool)
    .await;

    let claimed = match claimed {
        Ok(result) => result.rows_affected() == 1,
        // A concurrent claim on the same key tripped the unique index
        Err(sqlx::Error::Database(e)) if e.is_unique_violation() => false,
        Err(e) => return Err(e.into()),
    };

    if !claimed {
        log::debug!("[queue] lost claim on {} for {}", candidate.id, queue_key);
        return Ok(None);
    }

    candidate.status = RequestStatus::Running;
    candidate.last_updated_at = now;
    log::info!(
        "[queue] claimed {} request {} on {} (retry {})",
        candidate.direction,
        candidate.id,
        queue_key,
        candidate.retry_count
    );
    Ok(Some(candidate))
}

/// Move a request to `new_status` unless it is already terminal.
///
/// # Returns
/// True if the row was updated
pub async fn update_status(
    pool: &DbPool,
    account_id: &str,
    request_id: &str,
    new_status: RequestStatus,
) -> Result<bool, SyncError> {
    update_status_with_reason(pool, account_id, request_id, new_status, None).await
}

/// Like [`update_status`], also recording why.
pub async fn update_status_with_reason(
    pool: &DbPool,
    account_id: &str,
    request_id: &str,
    new_status: RequestStatus,
    reason: Option<&str>,
) -> Result<bool, SyncError> {
    let result = sqlx::query(
        r#"
        UPDATE sync_requests
        SET status = ?, status_reason = COALESCE(?, status_reason), last_updated_at = ?
        WHERE id = ? AND account_id = ? AND status NOT IN ('completed', 'skipped')
        "#,
    )
    .bind(new_status.as_str())
    .bind(reason)
    .bind(now_ms())
    .bind(request_id)
    .bind(account_id)
    .execute(pool)
    .await?;

    let updated = result.rows_affected() == 1;
    if updated {
        log::debug!("[queue] {} -> {}", request_id, new_status);
    }
    Ok(updated)
}

/// Requeue a failed request.
///
/// While the retry count is below `max_retry_count` it is incremented and the
/// request returns to `queued`. Once exhausted the request is parked as
/// `failed_with_retry` for the sweep to retire.
///
/// # Returns
/// True if the row was updated
pub async fn increment_retry_and_requeue(
    pool: &DbPool,
    account_id: &str,
    request_id: &str,
    max_retry_count: i64,
) -> Result<bool, SyncError> {
    let result = sqlx::query(
        r#"
        UPDATE sync_requests SET
            retry_count = CASE WHEN retry_count < ? THEN retry_count + 1 ELSE retry_count END,
            status = CASE WHEN retry_count < ? THEN 'queued' ELSE 'failed_with_retry' END,
            last_updated_at = ?
        WHERE id = ? AND account_id = ? AND status IN ('running', 'queued', 'failed_with_retry')
        "#,
    )
    .bind(max_retry_count)
    .bind(max_retry_count)
    .bind(now_ms())
    .bind(request_id)
    .bind(account_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Return requests stuck in `running` since before `stale_before_ms` to the
/// queue, consuming a retry. Requests without budget are parked.
///
/// # Returns
/// Number of requests reclaimed
pub async fn requeue_stale_running(
    pool: &DbPool,
    stale_before_ms: i64,
    max_retry_count: i64,
) -> Result<u64, SyncError> {
    let result = sqlx::query(
        r#"
        UPDATE sync_requests SET
            retry_count = CASE WHEN retry_count < ? THEN retry_count + 1 ELSE retry_count END,
            status = CASE WHEN retry_count < ? THEN 'queued' ELSE 'failed_with_retry' END,
            last_updated_at = ?
        WHERE status = 'running' AND last_updated_at < ?
        "#,
    )
    .bind(max_retry_count)
    .bind(max_retry_count)
    .bind(now_ms())
    .bind(stale_before_ms)
    .execute(pool)
    .await?;

    if result.rows_affected() > 0 {
        log::warn!(
            "[queue] reclaimed {} request(s) running since before {}",
            result.rows_affected(),
            stale_before_ms
        );
    }
    Ok(result.rows_affected())
}

/// Retire requests that ran out of retries, marking them skipped.
///
/// # Returns
/// Number of requests retired
pub async fn mark_skipped_if_retries_exceeded(
    pool: &DbPool,
    account_id: &str,
    max_retry_count: i64,
) -> Result<u64, SyncError> {
    let result = sqlx::query(
        r#"
        UPDATE sync_requests
        SET status = 'skipped', status_reason = ?, last_updated_at = ?
        WHERE account_id = ?
          AND ((status = 'failed_with_retry' AND retry_count >= ?)
               OR (status IN ('queued', 'failed_with_retry') AND retry_count > ?))
        "#,
    )
    .bind(REASON_MAX_RETRY_EXCEEDED)
    .bind(now_ms())
    .bind(account_id)
    .bind(max_retry_count)
    .bind(max_retry_count)
    .execute(pool)
    .await?;

    let retired = result.rows_affected();
    if retired > 0 {
        log::warn!(
            "[queue] retired {} request(s) for account {} after {} retries",
            retired,
            account_id,
            max_retry_count
        );
    }
    Ok(retired)
}

/// Distinct (account, queue key) pairs with queued work.
pub async fn ready_queue_keys(pool: &DbPool) -> Result<Vec<(String, String)>, SyncError> {
    let keys: Vec<(String, String)> = sqlx::query_as(
        r#"
        SELECT account_id, queue_key FROM sync_requests
        WHERE status = 'queued'
        GROUP BY account_id, queue_key
        ORDER BY MIN(seq) ASC
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(keys)
}

/// Accounts holding queued or parked requests.
pub async fn accounts_with_pending(pool: &DbPool) -> Result<Vec<String>, SyncError> {
    let accounts: Vec<(String,)> = sqlx::query_as(
        "SELECT DISTINCT account_id FROM sync_requests WHERE status IN ('queued', 'failed_with_retry')",
    )
    .fetch_all(pool)
    .await?;

    Ok(accounts.into_iter().map(|(a,)| a).collect())
}

/// Requests on a queue key in insertion order.
pub async fn list_for_queue_key(
    pool: &DbPool,
    queue_key: &str,
) -> Result<Vec<SyncRequest>, SyncError> {
    let rows = sqlx::query_as::<_, SyncRequestRow>(
        "SELECT * FROM sync_requests WHERE queue_key = ? ORDER BY seq ASC",
    )
    .bind(queue_key)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(SyncRequest::try_from).collect()
}

/// Request totals per status for an account.
pub async fn counts_by_status(pool: &DbPool, account_id: &str) -> Result<StatusCounts, SyncError> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT status, COUNT(*) FROM sync_requests WHERE account_id = ? GROUP BY status",
    )
    .bind(account_id)
    .fetch_all(pool)
    .await?;

    let mut counts = StatusCounts::default();
    for (status, count) in rows {
        counts.add(status.parse()?, count);
    }
    Ok(counts)
}
