//! Orchestrator service
//!
//! The injected entry point used by the API layer. It holds the store and the
//! background runner and exposes:
//! - `initiate`: the idempotency gate
//! - `get_status`, `get_by_key`, `list_for_subject`: status queries
//! - `retry`: manual retry of a recently failed workflow

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use graduation_core::{LaunchMode, Workflow, WorkflowStatus};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::builder::build_steps;
use super::executor::{reopen_for_retry, ExecutorError};
use crate::persistence::{StoreError, WorkflowStore};
use crate::worker::WorkflowRunner;

/// Maximum length of an idempotency key
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;

/// Errors surfaced synchronously to callers
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// Malformed request (e.g. bad idempotency key)
    #[error("validation error: {0}")]
    Validation(String),

    /// Subject does not exist
    #[error("subject not found: {0}")]
    SubjectNotFound(Uuid),

    /// Workflow does not exist
    #[error("workflow not found: {0}")]
    WorkflowNotFound(Uuid),

    /// No workflow for an idempotency key
    #[error("no workflow for idempotency key: {0}")]
    KeyNotFound(String),

    /// Subject already completed a graduation
    #[error("subject {0} is already provisioned")]
    AlreadyProvisioned(Uuid),

    /// Workflow cannot be retried now
    #[error("workflow {id} is not retryable: {reason}")]
    NotRetryable { id: Uuid, reason: String },

    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Result of an initiation
#[derive(Debug, Clone)]
pub struct Initiation {
    pub workflow: Workflow,

    /// `false` when the idempotency key was already used; the existing workflow is returned
    pub created: bool,
}

/// Validate a caller-supplied idempotency key
pub fn validate_idempotency_key(key: &str) -> Result<(), OrchestratorError> {
    if key.trim().is_empty() {
        return Err(OrchestratorError::Validation(
            "idempotency key is required".to_string(),
        ));
    }
    if key.chars().count() > MAX_IDEMPOTENCY_KEY_LEN {
        return Err(OrchestratorError::Validation(format!(
            "idempotency key exceeds {MAX_IDEMPOTENCY_KEY_LEN} characters"
        )));
    }
    if key.chars().any(char::is_control) {
        return Err(OrchestratorError::Validation(
            "idempotency key contains control characters".to_string(),
        ));
    }
    Ok(())
}

/// Graduation orchestrator
///
/// # Example
///
/// ```ignore
/// let orchestrator = Orchestrator::new(store, runner)
///     .with_retry_window(Duration::from_secs(6 * 3600));
///
/// let initiation = orchestrator.initiate(subject_id, requester_id, "abc-123").await?;
/// let workflow = orchestrator.get_status(initiation.workflow.id).await?;
/// ```
pub struct Orchestrator {
    store: Arc<dyn WorkflowStore>,
    runner: Arc<dyn WorkflowRunner>,
    retry_window: Duration,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn WorkflowStore>, runner: Arc<dyn WorkflowRunner>) -> Self {
        Self {
            store,
            runner,
            retry_window: Duration::from_secs(6 * 3600),
        }
    }

    /// How long after creation a failed workflow may still be retried
    pub fn with_retry_window(mut self, window: Duration) -> Self {
        self.retry_window = window;
        self
    }

    pub fn store(&self) -> &Arc<dyn WorkflowStore> {
        &self.store
    }

    /// Create the workflow for an idempotency key, or return the one that exists
    ///
    /// A duplicate key never creates rows, submits work or checks the subject again.
    #[instrument(skip(self))]
    pub async fn initiate(
        &self,
        subject_id: Uuid,
        requester_id: Uuid,
        idempotency_key: &str,
    ) -> Result<Initiation, OrchestratorError> {
        validate_idempotency_key(idempotency_key)?;

        if let Some(existing) = self.store.find_by_idempotency_key(idempotency_key).await? {
            debug!(workflow_id = %existing.id, "returning existing workflow for key");
            return Ok(Initiation {
                workflow: existing,
                created: false,
            });
        }

        let subject = self
            .store
            .get_subject(subject_id)
            .await?
            .ok_or(OrchestratorError::SubjectNotFound(subject_id))?;
        if subject.is_graduated() {
            return Err(OrchestratorError::AlreadyProvisioned(subject_id));
        }
        if subject.mode == LaunchMode::Tokenized && subject.token.is_none() {
            return Err(OrchestratorError::Validation(
                "tokenized subject has no token spec".to_string(),
            ));
        }

        let workflow = Workflow::new(
            idempotency_key,
            subject_id,
            requester_id,
            build_steps(subject.mode),
        );
        let outcome = self.store.insert_workflow(&workflow).await?;
        let created = outcome.created();
        let workflow = outcome.into_workflow();

        if created {
            info!(
                workflow_id = %workflow.id,
                steps = workflow.steps.len(),
                "graduation workflow created"
            );
            self.submit(workflow.id).await;
        } else {
            debug!(workflow_id = %workflow.id, "lost initiation race, returning winner");
        }

        Ok(Initiation { workflow, created })
    }

    /// Current state of a workflow
    pub async fn get_status(&self, workflow_id: Uuid) -> Result<Workflow, OrchestratorError> {
        self.store
            .get_workflow(workflow_id)
            .await?
            .ok_or(OrchestratorError::WorkflowNotFound(workflow_id))
    }

    /// Workflow created for an idempotency key
    pub async fn get_by_key(&self, idempotency_key: &str) -> Result<Workflow, OrchestratorError> {
        self.store
            .find_by_idempotency_key(idempotency_key)
            .await?
            .ok_or_else(|| OrchestratorError::KeyNotFound(idempotency_key.to_string()))
    }

    /// Every workflow of a subject, newest first
    pub async fn list_for_subject(
        &self,
        subject_id: Uuid,
    ) -> Result<Vec<Workflow>, OrchestratorError> {
        Ok(self.store.list_for_subject(subject_id).await?)
    }

    /// Re-run a FAILED workflow from its failed step
    #[instrument(skip(self))]
    pub async fn retry(&self, workflow_id: Uuid) -> Result<Workflow, OrchestratorError> {
        let workflow = self.get_status(workflow_id).await?;

        if workflow.status != WorkflowStatus::Failed {
            return Err(OrchestratorError::NotRetryable {
                id: workflow_id,
                reason: format!("workflow is {}", workflow.status),
            });
        }
        let age = (Utc::now() - workflow.created_at)
            .to_std()
            .unwrap_or_default();
        if age > self.retry_window {
            return Err(OrchestratorError::NotRetryable {
                id: workflow_id,
                reason: "outside the retry window".to_string(),
            });
        }

        let reopened = reopen_for_retry(self.store.as_ref(), &workflow)
            .await
            .map_err(|e| match e {
                ExecutorError::Store(e) if e.is_conflict() => OrchestratorError::NotRetryable {
                    id: workflow_id,
                    reason: "workflow was modified concurrently".to_string(),
                },
                ExecutorError::Store(e) => OrchestratorError::Store(e),
                other => OrchestratorError::NotRetryable {
                    id: workflow_id,
                    reason: other.to_string(),
                },
            })?;

        info!(attempt = reopened.attempts, "manual retry accepted");
        self.submit(reopened.id).await;
        Ok(reopened)
    }

    async fn submit(&self, workflow_id: Uuid) {
        // The row is durable; the pending sweep or stale recovery picks it up if
        // the runner refuses it now.
        if let Err(e) = self.runner.submit(workflow_id).await {
            warn!(%workflow_id, error = %e, "runner did not accept workflow");
        }
    }
}
