//! Webhook acceptance.
//!
//! A push webhook becomes a git-to-internal placeholder request. The diff is
//! fetched later, when the dispatcher runs the placeholder.

use serde::Serialize;

use crate::context::SyncContext;
use crate::error::SyncError;
use crate::models::{AccountScope, Direction, SyncRequest, WebhookCoordinates};
use crate::services::collaborators::WebhookHeaders;
use crate::services::{commit_ledger, sync_queue};

/// Outcome reported back to the webhook sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WebhookOutcome {
    Accepted { request_id: String },
    /// The announced commit has already been processed.
    Duplicate { commit_id: String },
    Rejected { reason: String },
}

impl WebhookOutcome {
    fn rejected(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        log::info!("[webhook] rejected: {}", reason);
        Self::Rejected { reason }
    }
}

/// Accept a raw webhook delivery.
///
/// Unknown tokens, pings, non-push events and payloads without a branch are
/// rejected without touching the queue. Storage failures are returned as
/// errors so the sender can redeliver.
pub async fn accept_webhook(
    ctx: &SyncContext,
    scope: AccountScope,
    connector_token: &str,
    raw_payload: &str,
    headers: &WebhookHeaders,
) -> Result<WebhookOutcome, SyncError> {
    let account_id = scope.account_id.clone();
    log::info!("[webhook] processing delivery for account {}", account_id);

    let collaborators = &ctx.collaborators;
    let Some(connector) = collaborators
        .connectors
        .find_by_webhook_token(&account_id, connector_token)
        .await?
    else {
        return Ok(WebhookOutcome::rejected("connector not found"));
    };

    if collaborators.payloads.is_ping(headers) {
        return Ok(WebhookOutcome::rejected("ping event, only push events are supported"));
    }

    let payload: serde_json::Value = match serde_json::from_str(raw_payload) {
        Ok(payload) => payload,
        Err(e) => return Ok(WebhookOutcome::rejected(format!("invalid JSON: {}", e))),
    };

    let parsed = parse(ctx, &payload, headers);
    let (repo, branch, commit_id) = match parsed {
        Ok(parsed) => parsed,
        Err(e @ SyncError::PayloadMalformed { .. }) => {
            return Ok(WebhookOutcome::rejected(e.to_string()))
        }
        Err(e) => return Err(e),
    };

    let Some(branch) = branch else {
        let e = SyncError::payload_malformed("payload carries no branch");
        return Ok(WebhookOutcome::rejected(e.to_string()));
    };
    let repo = repo.unwrap_or_else(|| connector.repo_url.clone());

    if let Some(commit_id) = &commit_id {
        if commit_ledger::is_processed(&ctx.pool, &account_id, commit_id, &repo, &branch).await? {
            log::info!(
                "[webhook] commit {} on {}@{} already processed",
                commit_id,
                repo,
                branch
            );
            return Ok(WebhookOutcome::Duplicate {
                commit_id: commit_id.clone(),
            });
        }
    }

    let request = SyncRequest::new(scope, Direction::GitToInternal, Vec::new()).with_webhook(
        WebhookCoordinates {
            repo,
            branch,
            connector_id: connector.connector_id.clone(),
            head_commit_id: commit_id,
        },
    );
    let saved = sync_queue::save(&ctx.pool, collaborators.mappings.as_ref(), request).await?;

    log::info!("[webhook] accepted as request {}", saved.id);
    Ok(WebhookOutcome::Accepted {
        request_id: saved.id,
    })
}

type ParsedPush = (Option<String>, Option<String>, Option<String>);

fn parse(
    ctx: &SyncContext,
    payload: &serde_json::Value,
    headers: &WebhookHeaders,
) -> Result<ParsedPush, SyncError> {
    let parser = &ctx.collaborators.payloads;
    Ok((
        parser.obtain_repo(payload, headers)?,
        parser.obtain_branch(payload, headers)?,
        parser.obtain_commit_id(payload, headers)?,
    ))
}
