//! Background runner
//!
//! Executes workflows off the request path on a bounded pool of tokio tasks.
//! Submissions go through a bounded queue; a dispatcher hands each one to the
//! step executor once a concurrency permit is free.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::engine::{RunOutcome, StepExecutor};
use crate::reliability::duration_millis;

/// Runner errors
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// The submission queue is full
    #[error("runner queue is full")]
    QueueFull,

    /// The runner no longer accepts work
    #[error("runner is shutting down")]
    ShuttingDown,

    /// Active workflows did not finish in time
    #[error("graceful shutdown timed out with {0} workflow(s) still running")]
    ShutdownTimeout(usize),
}

/// Trait for workflow execution backends
///
/// Initiation and retry hand workflow ids to a runner and return immediately.
#[async_trait]
pub trait WorkflowRunner: Send + Sync {
    /// Queue a workflow for execution
    ///
    /// Submitting an id that is already queued or running is a no-op.
    async fn submit(&self, workflow_id: Uuid) -> Result<(), RunnerError>;

    /// Check if a workflow is queued or running in this runner
    async fn is_running(&self, workflow_id: Uuid) -> bool;

    /// Get count of workflows currently executing
    async fn active_count(&self) -> usize;

    /// Stop accepting work and wait for active workflows
    async fn shutdown(&self) -> Result<(), RunnerError>;
}

/// Background runner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Maximum workflows executing at once
    pub max_concurrency: usize,

    /// Maximum workflows waiting for a permit
    pub queue_capacity: usize,

    /// Graceful shutdown timeout
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 16,
            queue_capacity: 1024,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl RunnerConfig {
    /// Set maximum concurrency
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    /// Set queue capacity
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// Set shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Bounded pool running workflows on tokio tasks
///
/// # Example
///
/// ```ignore
/// let runner = BackgroundRunner::start(executor, RunnerConfig::default().with_max_concurrency(8));
/// runner.submit(workflow_id).await?;
///
/// // ... later, graceful shutdown
/// runner.shutdown().await?;
/// ```
pub struct BackgroundRunner {
    config: RunnerConfig,
    queue_tx: mpsc::Sender<Uuid>,
    /// Ids queued or running
    tracked: Arc<Mutex<HashSet<Uuid>>>,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl BackgroundRunner {
    /// Create the runner and start its dispatcher
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(executor: Arc<StepExecutor>, config: RunnerConfig) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity.max(1));
        let runner = Self {
            queue_tx,
            tracked: Arc::new(Mutex::new(HashSet::new())),
            permits: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            config,
        };

        info!(
            max_concurrency = runner.config.max_concurrency,
            queue_capacity = runner.config.queue_capacity,
            "Starting background runner"
        );
        runner.spawn_dispatcher(executor, queue_rx);
        runner
    }

    /// Workflows currently holding a permit
    pub fn running_count(&self) -> usize {
        self.config.max_concurrency.max(1) - self.permits.available_permits()
    }

    /// Workflows queued or running
    pub fn tracked_count(&self) -> usize {
        self.tracked.lock().len()
    }

    fn spawn_dispatcher(&self, executor: Arc<StepExecutor>, mut queue_rx: mpsc::Receiver<Uuid>) {
        let permits = Arc::clone(&self.permits);
        let tracked = Arc::clone(&self.tracked);
        let tracker = self.tracker.clone();
        let shutdown = self.shutdown.clone();

        self.tracker.spawn(async move {
            loop {
                let workflow_id = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    next = queue_rx.recv() => match next {
                        Some(id) => id,
                        None => break,
                    },
                };

                let permit = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    permit = Arc::clone(&permits).acquire_owned() => match permit {
                        Ok(p) => p,
                        Err(_) => break,
                    },
                };

                let executor = Arc::clone(&executor);
                let tracked = Arc::clone(&tracked);
                tracker.spawn(async move {
                    run_supervised(executor, workflow_id).await;
                    tracked.lock().remove(&workflow_id);
                    drop(permit);
                });
            }

            debug!("Dispatcher exited");
        });
    }
}

/// Run one workflow on its own task so a panic is contained and recorded.
async fn run_supervised(executor: Arc<StepExecutor>, workflow_id: Uuid) {
    let inner = Arc::clone(&executor);
    let handle = tokio::spawn(async move { inner.run(workflow_id).await });

    match handle.await {
        Ok(RunOutcome::Skipped { reason }) => {
            debug!(%workflow_id, reason, "workflow run skipped");
        }
        Ok(outcome) => {
            debug!(%workflow_id, ?outcome, "workflow run finished");
        }
        Err(e) if e.is_panic() => {
            error!(%workflow_id, "workflow run panicked");
            executor
                .record_system_failure(workflow_id, "executor panicked", true)
                .await;
        }
        Err(e) => {
            warn!(%workflow_id, error = %e, "workflow run cancelled");
        }
    }
}

#[async_trait]
impl WorkflowRunner for BackgroundRunner {
    async fn submit(&self, workflow_id: Uuid) -> Result<(), RunnerError> {
        if self.shutdown.is_cancelled() {
            return Err(RunnerError::ShuttingDown);
        }
        if !self.tracked.lock().insert(workflow_id) {
            debug!(%workflow_id, "workflow already queued or running");
            return Ok(());
        }

        match self.queue_tx.try_send(workflow_id) {
            Ok(()) => {
                debug!(%workflow_id, "workflow queued");
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                self.tracked.lock().remove(&workflow_id);
                Err(RunnerError::QueueFull)
            }
            Err(TrySendError::Closed(_)) => {
                self.tracked.lock().remove(&workflow_id);
                Err(RunnerError::ShuttingDown)
            }
        }
    }

    async fn is_running(&self, workflow_id: Uuid) -> bool {
        self.tracked.lock().contains(&workflow_id)
    }

    async fn active_count(&self) -> usize {
        self.running_count()
    }

    async fn shutdown(&self) -> Result<(), RunnerError> {
        info!("Shutting down background runner");
        self.shutdown.cancel();
        self.tracker.close();

        match tokio::time::timeout(self.config.shutdown_timeout, self.tracker.wait()).await {
            Ok(()) => {
                info!("Background runner stopped");
                Ok(())
            }
            Err(_) => {
                let remaining = self.running_count();
                warn!(remaining, "Shutdown timeout reached");
                Err(RunnerError::ShutdownTimeout(remaining))
            }
        }
    }
}
