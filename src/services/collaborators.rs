//! Collaborator seams injected into the sync core.
//!
//! The core never talks to git hosts or the entity store directly. It goes
//! through these traits, and deployments plug in their own implementations.
//! Static, settings-backed implementations are provided for the lookups.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

use crate::error::SyncError;
use crate::models::{ActivityStatus, ConnectorInfo, DiffResult, FileDelta, RootMapping};

/// Headers of an inbound webhook, keyed by lowercase header name.
pub type WebhookHeaders = HashMap<String, String>;

/// Lookup of root mappings.
#[async_trait]
pub trait RootMappingProvider: Send + Sync {
    /// Mappings tracking `repo`@`branch` for an account.
    async fn get_by_repo_branch(
        &self,
        repo: &str,
        branch: &str,
        account_id: &str,
    ) -> Result<Vec<RootMapping>, SyncError>;

    /// Mapping used for outbound writes from a project scope.
    async fn get_default(
        &self,
        project_id: &str,
        org_id: &str,
        account_id: &str,
    ) -> Result<Option<RootMapping>, SyncError>;
}

/// Lookup of git connectors.
#[async_trait]
pub trait ConnectorResolver: Send + Sync {
    async fn get(
        &self,
        account_id: &str,
        org_id: &str,
        project_id: &str,
        connector_ref: &str,
    ) -> Result<ConnectorInfo, SyncError>;

    /// Connector whose webhook token matches `token`.
    async fn find_by_webhook_token(
        &self,
        account_id: &str,
        token: &str,
    ) -> Result<Option<ConnectorInfo>, SyncError>;
}

/// Webhook payload interpretation.
pub trait PayloadParser: Send + Sync {
    /// Check if the delivery is a connectivity ping rather than an event.
    fn is_ping(&self, headers: &WebhookHeaders) -> bool;

    fn obtain_repo(
        &self,
        payload: &serde_json::Value,
        headers: &WebhookHeaders,
    ) -> Result<Option<String>, SyncError>;

    fn obtain_branch(
        &self,
        payload: &serde_json::Value,
        headers: &WebhookHeaders,
    ) -> Result<Option<String>, SyncError>;

    fn obtain_commit_id(
        &self,
        payload: &serde_json::Value,
        headers: &WebhookHeaders,
    ) -> Result<Option<String>, SyncError>;
}

/// Best-effort audit trail. Failures are logged and never propagated.
#[async_trait]
pub trait ActivityLog: Send + Sync {
    async fn record(
        &self,
        account_id: &str,
        request_id: Option<&str>,
        deltas: &[FileDelta],
        status: ActivityStatus,
        reason: Option<&str>,
    );
}

/// Diff window asked of the git gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffRequest {
    /// Request to complete once the diff arrives.
    pub request_id: String,
    pub account_id: String,
    pub repo: String,
    pub branch: String,
    /// Last processed commit; `None` asks for everything up to `to_commit_id`.
    pub from_commit_id: Option<String>,
    pub to_commit_id: Option<String>,
}

/// Outbound file changes for one root mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushRequest {
    pub request_id: String,
    pub mapping: RootMapping,
    pub deltas: Vec<FileDelta>,
    pub message: String,
}

/// Commit created by a push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushResult {
    pub commit_id: String,
    pub commit_time_ms: i64,
}

/// Git host operations.
#[async_trait]
pub trait GitGateway: Send + Sync {
    /// Ask for a diff. The result arrives later through diff ingestion.
    async fn request_diff(
        &self,
        connector: &ConnectorInfo,
        request: DiffRequest,
    ) -> Result<(), SyncError>;

    /// Every tracked file at the head of a branch.
    async fn snapshot_branch(
        &self,
        connector: &ConnectorInfo,
        repo: &str,
        branch: &str,
    ) -> Result<DiffResult, SyncError>;

    async fn push_changes(
        &self,
        connector: &ConnectorInfo,
        request: PushRequest,
    ) -> Result<PushResult, SyncError>;
}

/// Per-file failure reported by the entity applier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFailure {
    pub path: String,
    pub message: String,
}

/// Outcome of applying deltas to the entity store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyOutcome {
    pub failures: Vec<FileFailure>,
}

impl ApplyOutcome {
    pub fn failed(&self, path: &str) -> Option<&FileFailure> {
        self.failures.iter().find(|f| f.path == path)
    }
}

/// Writes git changes into the internal entity store.
#[async_trait]
pub trait EntityApplier: Send + Sync {
    /// Apply deltas for one mapping. Per-file failures go in the outcome;
    /// an `Err` means nothing could be attempted.
    async fn apply(
        &self,
        mapping: &RootMapping,
        deltas: &[FileDelta],
    ) -> Result<ApplyOutcome, SyncError>;
}

/// Root mappings held in memory, typically loaded from settings.
#[derive(Debug, Clone, Default)]
pub struct StaticRootMappings {
    mappings: Vec<RootMapping>,
}

impl StaticRootMappings {
    pub fn new(mappings: Vec<RootMapping>) -> Self {
        Self { mappings }
    }
}

#[async_trait]
impl RootMappingProvider for StaticRootMappings {
    async fn get_by_repo_branch(
        &self,
        repo: &str,
        branch: &str,
        account_id: &str,
    ) -> Result<Vec<RootMapping>, SyncError> {
        Ok(self
            .mappings
            .iter()
            .filter(|m| m.account_id == account_id && m.tracks(repo, branch))
            .cloned()
            .collect())
    }

    async fn get_default(
        &self,
        project_id: &str,
        org_id: &str,
        account_id: &str,
    ) -> Result<Option<RootMapping>, SyncError> {
        Ok(self
            .mappings
            .iter()
            .find(|m| m.account_id == account_id && m.org_id == org_id && m.project_id == project_id)
            .cloned())
    }
}

/// Hex SHA-256 digest of a webhook token.
pub fn token_digest(token: &str) -> String {
    format!("{:x}", Sha256::digest(token.as_bytes()))
}

/// Connectors held in memory, typically loaded from settings.
#[derive(Debug, Clone, Default)]
pub struct StaticConnectors {
    connectors: Vec<ConnectorInfo>,
}

impl StaticConnectors {
    pub fn new(connectors: Vec<ConnectorInfo>) -> Self {
        Self { connectors }
    }
}

#[async_trait]
impl ConnectorResolver for StaticConnectors {
    async fn get(
        &self,
        account_id: &str,
        _org_id: &str,
        _project_id: &str,
        connector_ref: &str,
    ) -> Result<ConnectorInfo, SyncError> {
        self.connectors
            .iter()
            .find(|c| c.account_id == account_id && c.connector_id == connector_ref)
            .cloned()
            .ok_or_else(|| SyncError::not_found_with_id("Connector", connector_ref))
    }

    async fn find_by_webhook_token(
        &self,
        account_id: &str,
        token: &str,
    ) -> Result<Option<ConnectorInfo>, SyncError> {
        let digest = token_digest(token);
        Ok(self
            .connectors
            .iter()
            .find(|c| {
                c.account_id == account_id && c.webhook_token_sha256.as_deref() == Some(digest.as_str())
            })
            .cloned())
    }
}
