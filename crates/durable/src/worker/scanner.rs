//! Retry scanner
//!
//! Periodic maintenance over the workflow table. Each pass runs, in order:
//! 1. Stale recovery: PROCESSING rows with no progress within `stale_threshold` are failed
//! 2. Retry: FAILED rows due for a retry are reopened and resubmitted
//! 3. Purge: rows older than `retention` are deleted
//! 4. Pending sweep: PENDING rows the runner never received are resubmitted

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use graduation_core::{Workflow, WorkflowStatus};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::runner::WorkflowRunner;
use crate::engine::{reopen_for_retry, ExecutorError};
use crate::persistence::{ScanFilter, StoreError, WorkflowStore};
use crate::reliability::{duration_millis, RetryPolicy};

/// Retry scanner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    /// Time between passes
    #[serde(with = "duration_millis")]
    pub scan_interval: Duration,

    /// Failed workflows older than this are no longer retried
    #[serde(with = "duration_millis")]
    pub retry_window: Duration,

    /// Workflows older than this are deleted
    #[serde(with = "duration_millis")]
    pub retention: Duration,

    /// PROCESSING workflows without an update for this long are considered abandoned
    #[serde(with = "duration_millis")]
    pub stale_threshold: Duration,

    /// PENDING workflows older than this are resubmitted
    #[serde(with = "duration_millis")]
    pub pending_grace: Duration,

    /// Maximum rows examined per phase
    pub batch_size: usize,

    /// Schedules retries after stale recovery and caps attempts
    pub retry_policy: RetryPolicy,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(30),
            retry_window: Duration::from_secs(6 * 3600),
            retention: Duration::from_secs(30 * 24 * 3600),
            stale_threshold: Duration::from_secs(600),
            pending_grace: Duration::from_secs(60),
            batch_size: 100,
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl ScannerConfig {
    pub fn with_scan_interval(mut self, interval: Duration) -> Self {
        self.scan_interval = interval;
        self
    }

    pub fn with_retry_window(mut self, window: Duration) -> Self {
        self.retry_window = window;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_stale_threshold(mut self, threshold: Duration) -> Self {
        self.stale_threshold = threshold;
        self
    }

    pub fn with_pending_grace(mut self, grace: Duration) -> Self {
        self.pending_grace = grace;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }
}

/// What a single pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    /// Stale PROCESSING workflows marked FAILED
    pub recovered: usize,
    /// FAILED workflows reopened and resubmitted
    pub retried: usize,
    /// Rows deleted by retention
    pub purged: u64,
    /// PENDING workflows resubmitted
    pub resubmitted: usize,
}

impl ScanReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Periodic retry, recovery and retention over the workflow table
pub struct RetryScanner {
    store: Arc<dyn WorkflowStore>,
    runner: Arc<dyn WorkflowRunner>,
    config: ScannerConfig,
}

impl RetryScanner {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        runner: Arc<dyn WorkflowRunner>,
        config: ScannerConfig,
    ) -> Self {
        Self {
            store,
            runner,
            config,
        }
    }

    pub fn config(&self) -> &ScannerConfig {
        &self.config
    }

    /// Run the scan loop until `shutdown` is cancelled
    ///
    /// The first pass runs immediately, which also resubmits work left over
    /// from a previous process.
    pub fn start(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.scan_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match self.scan_once().await {
                            Ok(report) if !report.is_empty() => {
                                info!(
                                    recovered = report.recovered,
                                    retried = report.retried,
                                    purged = report.purged,
                                    resubmitted = report.resubmitted,
                                    "Scan pass finished"
                                );
                            }
                            Ok(_) => {}
                            Err(e) => {
                                error!("Scan pass failed: {}", e);
                            }
                        }
                    }
                    _ = shutdown.cancelled() => {
                        debug!("Scanner: shutdown requested");
                        break;
                    }
                }
            }

            debug!("Scanner exited");
        })
    }

    /// Run one pass of every phase
    pub async fn scan_once(&self) -> Result<ScanReport, StoreError> {
        let now = Utc::now();
        Ok(ScanReport {
            recovered: self.recover_stale(now).await?,
            retried: self.retry_failed(now).await?,
            purged: self.purge(now).await?,
            resubmitted: self.sweep_pending(now).await?,
        })
    }

    async fn recover_stale(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let threshold = self.config.stale_threshold;
        let filter = ScanFilter::default()
            .updated_before(before(now, threshold))
            .with_limit(self.config.batch_size);
        let stale = self
            .store
            .list_by_status(WorkflowStatus::Processing, filter)
            .await?;

        let message = format!(
            "executor lost: no progress within {}s",
            threshold.as_secs()
        );
        let mut recovered = 0;
        for mut workflow in stale {
            if self.runner.is_running(workflow.id).await {
                debug!(workflow_id = %workflow.id, "stale workflow still owned by this runner");
                continue;
            }

            let workflow_id = workflow.id;
            if let Err(e) = workflow.fail(message.clone()) {
                warn!(%workflow_id, error = %e, "cannot fail stale workflow");
                continue;
            }
            workflow.next_retry_at =
                self.config
                    .retry_policy
                    .next_retry_at(workflow.attempts, true, now);

            match self.store.update_workflow(&workflow).await {
                Ok(_) => {
                    warn!(%workflow_id, step = ?workflow.current_kind(), "recovered stale workflow");
                    recovered += 1;
                }
                Err(e) if e.is_conflict() => {
                    debug!(%workflow_id, "stale workflow made progress, leaving it");
                }
                Err(e) => {
                    error!(%workflow_id, error = %e, "failed to recover stale workflow");
                }
            }
        }
        Ok(recovered)
    }

    async fn retry_failed(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let filter = ScanFilter::default()
            .created_after(before(now, self.config.retry_window))
            .with_limit(self.config.batch_size);
        let failed = self
            .store
            .list_by_status(WorkflowStatus::Failed, filter)
            .await?;

        let mut retried = 0;
        for workflow in failed.iter().filter(|w| self.is_due(w, now)) {
            let reopened = match reopen_for_retry(self.store.as_ref(), workflow).await {
                Ok(reopened) => reopened,
                Err(ExecutorError::Store(e)) if e.is_conflict() => {
                    debug!(workflow_id = %workflow.id, "workflow retried elsewhere");
                    continue;
                }
                Err(e) => {
                    error!(workflow_id = %workflow.id, error = %e, "failed to reopen workflow");
                    continue;
                }
            };

            info!(
                workflow_id = %reopened.id,
                attempt = reopened.attempts,
                step = ?reopened.current_kind(),
                "retrying workflow"
            );
            retried += 1;
            if let Err(e) = self.runner.submit(reopened.id).await {
                // Reopened rows without an executor fall to stale recovery.
                warn!(workflow_id = %reopened.id, error = %e, "runner did not accept retry");
                break;
            }
        }
        Ok(retried)
    }

    fn is_due(&self, workflow: &Workflow, now: DateTime<Utc>) -> bool {
        workflow.attempts < self.config.retry_policy.max_attempts
            && workflow.next_retry_at.is_some_and(|at| at <= now)
    }

    async fn purge(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let purged = self
            .store
            .purge_created_before(before(now, self.config.retention))
            .await?;
        if purged > 0 {
            info!(purged, "purged expired workflows");
        }
        Ok(purged)
    }

    async fn sweep_pending(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let filter = ScanFilter::default()
            .created_before(before(now, self.config.pending_grace))
            .with_limit(self.config.batch_size);
        let pending = self
            .store
            .list_by_status(WorkflowStatus::Pending, filter)
            .await?;

        let mut resubmitted = 0;
        for workflow in pending {
            if self.runner.is_running(workflow.id).await {
                continue;
            }
            if let Err(e) = self.runner.submit(workflow.id).await {
                warn!(workflow_id = %workflow.id, error = %e, "runner did not accept pending workflow");
                break;
            }
            debug!(workflow_id = %workflow.id, "resubmitted pending workflow");
            resubmitted += 1;
        }
        Ok(resubmitted)
    }
}

/// `now - age`, saturating at the earliest representable time
fn before(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
