//! Shared state passed to commands: the pool, the collaborators and the
//! services built on top of them.

use std::sync::Arc;

use crate::config::{DispatcherConfig, SyncSettings};
use crate::db::{self, pool::DbPool};
use crate::error::SyncError;
use crate::models::Direction;
use crate::services::activity_log::SqliteActivityLog;
use crate::services::branch_sync::BranchSyncStateMachine;
use crate::services::collaborators::{
    ActivityLog, ConnectorResolver, EntityApplier, GitGateway, PayloadParser, RootMappingProvider,
    StaticConnectors, StaticRootMappings,
};
use crate::services::diff_ingestion::DiffIngestionProcessor;
use crate::services::dispatcher::Dispatcher;
use crate::services::handlers::{GitToInternalHandler, HandlerRegistry, InternalToGitHandler};
use crate::services::payload_parser::JsonPayloadParser;

/// Injected collaborators.
#[derive(Clone)]
pub struct Collaborators {
    pub mappings: Arc<dyn RootMappingProvider>,
    pub connectors: Arc<dyn ConnectorResolver>,
    pub payloads: Arc<dyn PayloadParser>,
    pub activity: Arc<dyn ActivityLog>,
    pub gateway: Arc<dyn GitGateway>,
    pub applier: Arc<dyn EntityApplier>,
}

impl Collaborators {
    /// Settings-backed lookups, JSON payload parsing and the SQLite activity
    /// log, with caller-supplied git and entity-store integrations.
    pub fn from_settings(
        settings: &SyncSettings,
        pool: &DbPool,
        gateway: Arc<dyn GitGateway>,
        applier: Arc<dyn EntityApplier>,
    ) -> Self {
        Self {
            mappings: Arc::new(StaticRootMappings::new(settings.root_mappings.clone())),
            connectors: Arc::new(StaticConnectors::new(settings.connectors.clone())),
            payloads: Arc::new(JsonPayloadParser),
            activity: Arc::new(SqliteActivityLog::new(pool.clone())),
            gateway,
            applier,
        }
    }
}

/// Everything a command needs.
#[derive(Clone)]
pub struct SyncContext {
    pub pool: DbPool,
    pub collaborators: Collaborators,
    pub config: DispatcherConfig,
    ingestion: Arc<DiffIngestionProcessor>,
}

impl SyncContext {
    pub fn new(pool: DbPool, collaborators: Collaborators, config: DispatcherConfig) -> Self {
        let ingestion = Arc::new(
            DiffIngestionProcessor::new(
                pool.clone(),
                collaborators.mappings.clone(),
                collaborators.activity.clone(),
            )
            .with_max_retry_count(config.max_retry_count),
        );
        Self {
            pool,
            collaborators,
            config,
            ingestion,
        }
    }

    /// Open the database from settings and build a context.
    pub async fn open(
        settings: &SyncSettings,
        gateway: Arc<dyn GitGateway>,
        applier: Arc<dyn EntityApplier>,
    ) -> Result<Self, SyncError> {
        settings.dispatcher.validate()?;
        let pool = db::initialize(&settings.database_path, settings.max_connections).await?;
        let collaborators = Collaborators::from_settings(settings, &pool, gateway, applier);
        Ok(Self::new(pool, collaborators, settings.dispatcher.clone()))
    }

    pub fn ingestion(&self) -> &DiffIngestionProcessor {
        &self.ingestion
    }

    /// Handlers for every direction.
    pub fn handler_registry(&self) -> HandlerRegistry {
        let c = &self.collaborators;
        HandlerRegistry::new()
            .register(
                Direction::GitToInternal,
                Arc::new(GitToInternalHandler::new(
                    self.pool.clone(),
                    c.mappings.clone(),
                    c.connectors.clone(),
                    c.gateway.clone(),
                    c.applier.clone(),
                    c.activity.clone(),
                )),
            )
            .register(
                Direction::InternalToGit,
                Arc::new(InternalToGitHandler::new(
                    self.pool.clone(),
                    c.mappings.clone(),
                    c.connectors.clone(),
                    c.gateway.clone(),
                    c.activity.clone(),
                )),
            )
            .register(
                Direction::FullSync,
                Arc::new(BranchSyncStateMachine::new(
                    self.pool.clone(),
                    c.mappings.clone(),
                    c.connectors.clone(),
                    c.gateway.clone(),
                    self.ingestion.clone(),
                )),
            )
    }

    /// A dispatcher wired to this context's handlers.
    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(self.pool.clone(), self.handler_registry(), self.config.clone())
    }
}
