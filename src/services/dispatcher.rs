//! Dispatcher: polls the queue and runs claimed requests on a worker pool.
//!
//! The background loop owns nothing but timers and a command channel. Each
//! poll claims at most one request per ready queue key and hands it to a
//! worker task; a bounded semaphore caps concurrent workers. Handlers run in
//! their own task so a panic is reported as a handler fault instead of
//! taking the worker down.

use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::config::DispatcherConfig;
use crate::db::pool::DbPool;
use crate::error::SyncError;
use crate::models::{now_ms, RequestStatus, SyncRequest};
use crate::services::handlers::HandlerRegistry;
use crate::services::sync_queue;

/// Commands accepted by the background loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchCommand {
    /// Poll immediately instead of waiting for the next tick.
    TriggerPoll,
    /// Run the retry sweep immediately.
    Sweep,
    Stop,
}

/// Handle for controlling a running dispatcher.
#[derive(Clone)]
pub struct DispatcherHandle {
    command_tx: mpsc::Sender<DispatchCommand>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl DispatcherHandle {
    /// Request an immediate poll.
    pub async fn trigger_poll(&self) -> Result<(), SyncError> {
        self.send(DispatchCommand::TriggerPoll).await
    }

    /// Request an immediate sweep.
    pub async fn sweep(&self) -> Result<(), SyncError> {
        self.send(DispatchCommand::Sweep).await
    }

    /// Stop polling and wait for the loop to exit. Requests already handed to
    /// workers run to completion.
    pub async fn stop(&self) -> Result<(), SyncError> {
        // Already stopped loops have dropped their receiver
        let _ = self.command_tx.send(DispatchCommand::Stop).await;

        let task = self.task.lock().await.take();
        if let Some(task) = task {
            task.await
                .map_err(|e| SyncError::internal(format!("dispatcher loop failed: {}", e)))?;
        }
        Ok(())
    }

    async fn send(&self, command: DispatchCommand) -> Result<(), SyncError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| SyncError::internal("Dispatcher not running"))
    }
}

/// Queue dispatcher.
#[derive(Clone)]
pub struct Dispatcher {
    pool: DbPool,
    handlers: Arc<HandlerRegistry>,
    config: DispatcherConfig,
    workers: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(pool: DbPool, handlers: HandlerRegistry, config: DispatcherConfig) -> Self {
        let workers = Arc::new(Semaphore::new(config.max_workers.max(1)));
        Self {
            pool,
            handlers: Arc::new(handlers),
            config,
            workers,
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Start the background loop.
    pub fn start(self) -> DispatcherHandle {
        let (tx, mut rx) = mpsc::channel::<DispatchCommand>(16);

        let task = tokio::spawn(async move {
            let mut poll = time::interval(self.config.poll_interval());
            poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut sweep = time::interval(self.config.sweep_interval());
            sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

            log::info!(
                "[dispatch] started (poll {}ms, sweep {}ms, {} workers)",
                self.config.poll_interval_ms,
                self.config.sweep_interval_ms,
                self.config.max_workers
            );

            loop {
                tokio::select! {
                    _ = poll.tick() => {
                        if let Err(e) = self.poll_once().await {
                            log::error!("[dispatch] poll failed: {}", e);
                        }
                    }
                    _ = sweep.tick() => {
                        if let Err(e) = self.sweep_once().await {
                            log::error!("[dispatch] sweep failed: {}", e);
                        }
                    }
                    cmd = rx.recv() => match cmd {
                        Some(DispatchCommand::TriggerPoll) => {
                            if let Err(e) = self.poll_once().await {
                                log::error!("[dispatch] triggered poll failed: {}", e);
                            }
                        }
                        Some(DispatchCommand::Sweep) => {
                            if let Err(e) = self.sweep_once().await {
                                log::error!("[dispatch] triggered sweep failed: {}", e);
                            }
                        }
                        Some(DispatchCommand::Stop) | None => break,
                    }
                }
            }

            log::info!("[dispatch] stopped");
        });

        DispatcherHandle {
            command_tx: tx,
            task: Arc::new(Mutex::new(Some(task))),
        }
    }

    /// Claim ready requests and hand them to workers without waiting for
    /// them to finish.
    ///
    /// # Returns
    /// Number of requests handed to workers
    pub async fn poll_once(&self) -> Result<usize, SyncError> {
        let mut submitted = 0;

        for (account_id, queue_key) in sync_queue::ready_queue_keys(&self.pool).await? {
            let Ok(permit) = self.workers.clone().try_acquire_owned() else {
                log::debug!("[dispatch] all workers busy");
                break;
            };

            let claimed = sync_queue::select_next(
                &self.pool,
                &account_id,
                &queue_key,
                self.config.max_running_per_account,
            )
            .await?;
            let Some(request) = claimed else {
                continue;
            };

            let dispatcher = self.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let request_id = request.id.clone();
                if let Err(e) = dispatcher.run(request).await {
                    log::error!("[dispatch] could not settle {}: {}", request_id, e);
                }
            });
            submitted += 1;
        }

        Ok(submitted)
    }

    /// Reclaim abandoned running requests, then retire requests that ran
    /// out of retries across all accounts.
    ///
    /// # Returns
    /// Number of requests retired
    pub async fn sweep_once(&self) -> Result<u64, SyncError> {
        if self.config.stale_running_ms > 0 {
            let stale_before = now_ms().saturating_sub(self.config.stale_running_ms as i64);
            sync_queue::requeue_stale_running(
                &self.pool,
                stale_before,
                self.config.max_retry_count,
            )
            .await?;
        }

        let mut retired = 0;
        for account_id in sync_queue::accounts_with_pending(&self.pool).await? {
            retired += sync_queue::mark_skipped_if_retries_exceeded(
                &self.pool,
                &account_id,
                self.config.max_retry_count,
            )
            .await?;
        }
        Ok(retired)
    }

    /// Run a claimed request to completion and record its outcome.
    ///
    /// # Returns
    /// The status the request was left in
    pub async fn run(&self, request: SyncRequest) -> Result<RequestStatus, SyncError> {
        let outcome = match self.handlers.resolve(request.direction) {
            Ok(handler) => {
                let task_request = request.clone();
                match tokio::spawn(async move { handler.handle(&task_request).await }).await {
                    Ok(result) => result,
                    Err(e) => Err(SyncError::handler_fault_for(
                        format!("handler aborted: {}", e),
                        &request.id,
                    )),
                }
            }
            Err(e) => Err(e),
        };

        self.settle(&request, outcome).await
    }

    async fn settle(
        &self,
        request: &SyncRequest,
        outcome: Result<RequestStatus, SyncError>,
    ) -> Result<RequestStatus, SyncError> {
        let account_id = request.account_id();

        match outcome {
            Ok(RequestStatus::Running) => {
                log::debug!("[dispatch] {} continues asynchronously", request.id);
                Ok(RequestStatus::Running)
            }
            Ok(status) if status.is_terminal() => {
                let written = self
                    .config
                    .status_write_retry
                    .execute("status write", || {
                        sync_queue::update_status(&self.pool, account_id, &request.id, status)
                    })
                    .await
                    .map_err(|e| {
                        log::error!(
                            "[dispatch] could not record {} as {}: {}",
                            request.id,
                            status,
                            e
                        );
                        e
                    })?;
                if !written {
                    log::warn!("[dispatch] {} was settled elsewhere", request.id);
                }
                log::info!("[dispatch] {} {} -> {}", request.direction, request.id, status);
                Ok(status)
            }
            Ok(status) => {
                log::warn!("[dispatch] {} ended as {}, retrying", request.id, status);
                self.requeue(request).await
            }
            Err(e) => {
                log::error!("[dispatch] {} failed: {}", request.id, e);
                self.requeue(request).await
            }
        }
    }

    async fn requeue(&self, request: &SyncRequest) -> Result<RequestStatus, SyncError> {
        let account_id = request.account_id();
        let max_retry_count = self.config.max_retry_count;

        self.config
            .status_write_retry
            .execute("requeue", || {
                sync_queue::increment_retry_and_requeue(
                    &self.pool,
                    account_id,
                    &request.id,
                    max_retry_count,
                )
            })
            .await?;

        let status = sync_queue::get_status(&self.pool, account_id, &request.id)
            .await?
            .ok_or_else(|| SyncError::not_found_with_id("SyncRequest", &request.id))?;

        if status == RequestStatus::FailedWithRetry {
            log::warn!(
                "[dispatch] {}",
                SyncError::retry_budget_exceeded(&request.id, max_retry_count)
            );
        }
        Ok(status)
    }
}
