//! Internal writes headed for git.

use serde::{Deserialize, Serialize};

use crate::context::SyncContext;
use crate::error::SyncError;
use crate::models::{
    now_ms, AccountScope, ChangeDetail, ChangeLedgerEntry, ChangeType, Direction, EntityType,
    FileDelta, SyncRequest,
};
use crate::services::{change_ledger, sync_queue};

/// An entity changed through the internal API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InternalChange {
    pub scope: AccountScope,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub change_type: ChangeType,
    /// YAML body; absent for deletions.
    #[serde(default)]
    pub content: Option<String>,
}

/// Queue an internal change for push and record it in the change ledger.
///
/// The ledger entry points at the new request, which holds back older or
/// concurrent git changes to the same path until the push settles. Both are
/// written in one transaction; on failure neither exists.
///
/// # Returns
/// The id of the queued request
pub async fn submit_internal_change(
    ctx: &SyncContext,
    change: InternalChange,
) -> Result<String, SyncError> {
    let scope = change.scope;
    let mapping = ctx
        .collaborators
        .mappings
        .get_default(&scope.project_id, &scope.org_id, &scope.account_id)
        .await?
        .ok_or_else(|| {
            SyncError::configuration_not_found(format!(
                "no default root mapping for {}/{}/{}",
                scope.account_id, scope.org_id, scope.project_id
            ))
        })?;

    let path = change
        .entity_type
        .file_path(&mapping.root_folder, &change.entity_id)?;

    let mut delta = FileDelta::new(&path, change.change_type);
    delta.content = change.content;
    delta.root_mapping_id = Some(mapping.root_folder_id.clone());
    if delta.content.is_none() && !delta.is_deletion() {
        return Err(SyncError::invalid_input_field(
            "content is required unless the entity is deleted",
            "content",
        ));
    }

    let request = SyncRequest::new(scope.clone(), Direction::InternalToGit, vec![delta])
        .with_queue_key(mapping.queue_key());

    let mut tx = ctx.pool.begin().await?;
    let saved =
        sync_queue::save_in(&mut *tx, ctx.collaborators.mappings.as_ref(), request).await?;
    change_ledger::upsert_in(
        &mut *tx,
        &ChangeLedgerEntry {
            scope,
            file_path: path.clone(),
            change_request_ts: now_ms(),
            change_processed_ts: None,
            change_detail: ChangeDetail::Internal {
                internal_request_id: saved.id.clone(),
            },
        },
    )
    .await?;
    tx.commit().await?;

    log::info!(
        "[changes] queued {} of {} as {}",
        change.change_type,
        path,
        saved.id
    );
    Ok(saved.id)
}
