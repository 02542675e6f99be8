//! Shared fixtures for integration tests: in-memory git gateway and entity
//! applier fakes, plus a context backed by a temporary database.

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use gitsync::config::{DispatcherConfig, SyncSettings};
use gitsync::context::SyncContext;
use gitsync::error::SyncError;
use gitsync::models::{
    AccountScope, ConnectorInfo, DiffResult, FileDelta, RequestStatus, RootMapping,
};
use gitsync::services::collaborators::{
    token_digest, ApplyOutcome, DiffRequest, EntityApplier, FileFailure, GitGateway, PushRequest,
    PushResult,
};
use gitsync::services::retry::RetryPolicy;
use gitsync::services::sync_queue;

pub const ACCOUNT: &str = "acc";
pub const ORG: &str = "org";
pub const PROJECT: &str = "proj";
pub const CONNECTOR: &str = "conn";
pub const REPO: &str = "org/repo";
pub const BRANCH: &str = "main";
pub const TOKEN: &str = "webhook-secret";
pub const QUEUE_KEY: &str = "acc:conn:main";

pub fn mapping() -> RootMapping {
    RootMapping {
        root_folder_id: "rf1".into(),
        root_folder: ".harness".into(),
        repo: REPO.into(),
        branch: BRANCH.into(),
        connector_id: CONNECTOR.into(),
        account_id: ACCOUNT.into(),
        org_id: ORG.into(),
        project_id: PROJECT.into(),
    }
}

pub fn connector() -> ConnectorInfo {
    ConnectorInfo {
        connector_id: CONNECTOR.into(),
        account_id: ACCOUNT.into(),
        org_id: ORG.into(),
        project_id: PROJECT.into(),
        repo_url: REPO.into(),
        webhook_token_sha256: Some(token_digest(TOKEN)),
    }
}

pub fn scope() -> AccountScope {
    AccountScope::new(ACCOUNT, ORG, PROJECT)
}

/// Git gateway that records calls and answers from scripted state.
#[derive(Default)]
pub struct FakeGateway {
    pub diff_requests: Mutex<Vec<DiffRequest>>,
    pub pushes: Mutex<Vec<PushRequest>>,
    pub snapshot: Mutex<Option<DiffResult>>,
    pub fail_pushes: AtomicBool,
    pub fail_snapshots: AtomicBool,
    /// Panic on the next snapshot, then behave normally.
    pub panic_next_snapshot: AtomicBool,
    push_counter: AtomicUsize,
}

impl FakeGateway {
    pub fn diff_requests(&self) -> Vec<DiffRequest> {
        self.diff_requests.lock().unwrap().clone()
    }

    pub fn pushes(&self) -> Vec<PushRequest> {
        self.pushes.lock().unwrap().clone()
    }

    pub fn set_snapshot(&self, snapshot: DiffResult) {
        *self.snapshot.lock().unwrap() = Some(snapshot);
    }
}

#[async_trait]
impl GitGateway for FakeGateway {
    async fn request_diff(
        &self,
        _connector: &ConnectorInfo,
        request: DiffRequest,
    ) -> Result<(), SyncError> {
        self.diff_requests.lock().unwrap().push(request);
        Ok(())
    }

    async fn snapshot_branch(
        &self,
        _connector: &ConnectorInfo,
        _repo: &str,
        _branch: &str,
    ) -> Result<DiffResult, SyncError> {
        if self.panic_next_snapshot.swap(false, Ordering::SeqCst) {
            panic!("git client crashed");
        }
        if self.fail_snapshots.load(Ordering::SeqCst) {
            return Err(SyncError::transient("git host unavailable"));
        }
        self.snapshot
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| SyncError::not_found("snapshot"))
    }

    async fn push_changes(
        &self,
        _connector: &ConnectorInfo,
        request: PushRequest,
    ) -> Result<PushResult, SyncError> {
        if self.fail_pushes.load(Ordering::SeqCst) {
            return Err(SyncError::transient_with_op("git host unavailable", "push"));
        }
        let n = self.push_counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.pushes.lock().unwrap().push(request);
        Ok(PushResult {
            commit_id: format!("pushed-{}", n),
            commit_time_ms: 5_000 + n as i64,
        })
    }
}

/// Entity applier that records applied deltas and fails listed paths.
#[derive(Default)]
pub struct FakeApplier {
    pub applied: Mutex<Vec<FileDelta>>,
    pub failing_paths: Mutex<Vec<String>>,
}

impl FakeApplier {
    pub fn applied_paths(&self) -> Vec<String> {
        self.applied
            .lock()
            .unwrap()
            .iter()
            .map(|d| d.path.clone())
            .collect()
    }

    pub fn fail_path(&self, path: &str) {
        self.failing_paths.lock().unwrap().push(path.to_string());
    }
}

#[async_trait]
impl EntityApplier for FakeApplier {
    async fn apply(
        &self,
        _mapping: &RootMapping,
        deltas: &[FileDelta],
    ) -> Result<ApplyOutcome, SyncError> {
        let failing = self.failing_paths.lock().unwrap().clone();
        let mut outcome = ApplyOutcome::default();
        for delta in deltas {
            if failing.contains(&delta.path) {
                outcome.failures.push(FileFailure {
                    path: delta.path.clone(),
                    message: "invalid YAML".into(),
                });
            } else {
                self.applied.lock().unwrap().push(delta.clone());
            }
        }
        Ok(outcome)
    }
}

/// A context over a fresh database with fake integrations.
pub struct Harness {
    pub ctx: SyncContext,
    pub gateway: Arc<FakeGateway>,
    pub applier: Arc<FakeApplier>,
    _dir: TempDir,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(dispatcher: DispatcherConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let settings = SyncSettings {
            database_path: dir.path().join("gitsync.db"),
            dispatcher,
            root_mappings: vec![mapping()],
            connectors: vec![connector()],
            ..SyncSettings::default()
        };

        let gateway = Arc::new(FakeGateway::default());
        let applier = Arc::new(FakeApplier::default());
        let ctx = SyncContext::open(&settings, gateway.clone(), applier.clone())
            .await
            .unwrap();

        Self {
            ctx,
            gateway,
            applier,
            _dir: dir,
        }
    }

    /// Claim and run the next request on the test queue key.
    pub async fn run_next(&self) -> Option<(String, RequestStatus)> {
        let request = sync_queue::select_next(
            &self.ctx.pool,
            ACCOUNT,
            QUEUE_KEY,
            self.ctx.config.max_running_per_account,
        )
        .await
        .unwrap()?;
        let id = request.id.clone();
        let status = self.ctx.dispatcher().run(request).await.unwrap();
        Some((id, status))
    }

    pub async fn status_of(&self, request_id: &str) -> RequestStatus {
        sync_queue::get_status(&self.ctx.pool, ACCOUNT, request_id)
            .await
            .unwrap()
            .unwrap()
    }
}

/// Dispatcher config without write retry delays.
pub fn test_config() -> DispatcherConfig {
    DispatcherConfig {
        poll_interval_ms: 20,
        max_retry_count: 2,
        status_write_retry: RetryPolicy::none(),
        ..DispatcherConfig::default()
    }
}

pub fn pipeline_path(id: &str) -> String {
    format!(".harness/pipelines/{}.yaml", id)
}

pub fn github_push_headers() -> gitsync::services::collaborators::WebhookHeaders {
    let mut headers = gitsync::services::collaborators::WebhookHeaders::new();
    headers.insert("X-GitHub-Event".into(), "push".into());
    headers
}

pub fn github_push_payload(commit_id: &str) -> String {
    serde_json::json!({
        "ref": "refs/heads/main",
        "after": commit_id,
        "repository": { "full_name": REPO }
    })
    .to_string()
}
