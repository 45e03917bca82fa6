//! Step executor
//!
//! The `StepExecutor` drives one workflow from its current-step pointer to a
//! terminal status:
//! - Claims the workflow (PENDING -> PROCESSING) with a compare-and-swap write
//! - Persists each step as PROCESSING before calling its provisioner
//! - Records the result, advances the pointer, or halts on the first failure
//! - Turns any error that escapes the step loop into a FAILED workflow
//!
//! Every write is a compare-and-swap on the workflow version, so a second executor
//! holding a stale copy loses its next write and stops without side effects.

use std::sync::Arc;

use chrono::Utc;
use graduation_core::{
    LedgerRegistration, ProvisionError, Provisioners, StepCompletion, StepKind, StepOutput,
    StepStatus, Subject, TransitionError, Workflow, WorkflowStatus, MAX_COST,
};
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::persistence::{StoreError, WorkflowStore};
use crate::reliability::RetryPolicy;

/// Errors that abort a run outside of any provisioner call
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Illegal status change
    #[error("invalid transition: {0}")]
    Transition(#[from] TransitionError),

    /// The subject the workflow graduates no longer exists
    #[error("subject not found: {0}")]
    SubjectNotFound(Uuid),
}

impl ExecutorError {
    /// Whether running the workflow again may get past this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExecutorError::Store(_))
    }
}

/// How a single run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every step succeeded
    Completed { aggregated_cost: u64 },

    /// A step or the executor failed; the workflow is FAILED
    Failed { error: String },

    /// Nothing was done: the workflow is terminal, gone, or owned by another executor
    Skipped { reason: &'static str },
}

/// Inputs threaded from earlier steps into later ones.
///
/// Rebuilt from the outputs of SUCCESS steps, so a resumed run sees exactly what
/// the interrupted run produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisioningContext {
    pub metadata_ref: Option<String>,
    pub wallet_address: Option<String>,
    pub token_address: Option<String>,
}

impl ProvisioningContext {
    pub fn from_workflow(workflow: &Workflow) -> Self {
        let mut context = Self::default();
        for step in &workflow.steps {
            if step.status != StepStatus::Success {
                continue;
            }
            match &step.output {
                Some(StepOutput::Metadata { content_ref }) => {
                    context.metadata_ref = Some(content_ref.clone())
                }
                Some(StepOutput::Wallet { address }) => {
                    context.wallet_address = Some(address.clone())
                }
                Some(StepOutput::Token { address }) => {
                    context.token_address = Some(address.clone())
                }
                _ => {}
            }
        }
        context
    }
}

/// Metadata document uploaded by the `create-metadata` step.
pub fn metadata_document(subject: &Subject) -> serde_json::Value {
    let mut document = json!({
        "subject_id": subject.id,
        "owner_id": subject.owner_id,
        "name": subject.name,
        "description": subject.description,
        "launch_mode": subject.mode.to_string(),
    });
    if let Some(image_url) = &subject.image_url {
        document["image"] = json!(image_url);
    }
    if let Some(token) = &subject.token {
        document["token"] = json!({
            "name": token.name,
            "symbol": token.symbol,
            "total_supply": token.total_supply,
        });
    }
    document
}

/// Runs graduation workflows step by step
///
/// # Example
///
/// ```ignore
/// use graduation_durable::prelude::*;
///
/// let executor = StepExecutor::new(store, provisioners)
///     .with_retry_policy(RetryPolicy::exponential().with_max_attempts(3));
///
/// match executor.run(workflow_id).await {
///     RunOutcome::Completed { aggregated_cost } => println!("done, cost {aggregated_cost}"),
///     RunOutcome::Failed { error } => println!("halted: {error}"),
///     RunOutcome::Skipped { reason } => println!("skipped: {reason}"),
/// }
/// ```
pub struct StepExecutor {
    store: Arc<dyn WorkflowStore>,
    provisioners: Provisioners,
    retry_policy: RetryPolicy,
}

impl StepExecutor {
    pub fn new(store: Arc<dyn WorkflowStore>, provisioners: Provisioners) -> Self {
        Self {
            store,
            provisioners,
            retry_policy: RetryPolicy::default(),
        }
    }

    /// Set the policy that schedules the next run after a failure
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn store(&self) -> &Arc<dyn WorkflowStore> {
        &self.store
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Run a workflow until it is terminal.
    ///
    /// Never returns an error: failures are recorded on the workflow and reported
    /// through the outcome.
    #[instrument(skip(self))]
    pub async fn run(&self, workflow_id: Uuid) -> RunOutcome {
        match self.drive(workflow_id).await {
            Ok(outcome) => outcome,
            Err(ExecutorError::Store(e)) if e.is_conflict() => {
                debug!("workflow written by a concurrent executor, stopping");
                RunOutcome::Skipped {
                    reason: "concurrent writer",
                }
            }
            Err(ExecutorError::Store(StoreError::WorkflowNotFound(_))) => {
                warn!("workflow removed while running");
                RunOutcome::Skipped {
                    reason: "workflow removed",
                }
            }
            Err(e) => {
                let message = e.to_string();
                error!(error = %message, "workflow run aborted");
                self.record_system_failure(workflow_id, &message, e.is_retryable())
                    .await;
                RunOutcome::Failed { error: message }
            }
        }
    }

    /// Mark a PROCESSING workflow FAILED for a reason outside any provisioner call.
    ///
    /// Reads the latest copy first, so it also works after a lost write.
    pub async fn record_system_failure(&self, workflow_id: Uuid, message: &str, retryable: bool) {
        let result: Result<(), ExecutorError> = async {
            let Some(mut workflow) = self.store.get_workflow(workflow_id).await? else {
                return Ok(());
            };
            if workflow.status != WorkflowStatus::Processing {
                return Ok(());
            }
            workflow.fail(message)?;
            workflow.next_retry_at =
                self.retry_policy
                    .next_retry_at(workflow.attempts, retryable, Utc::now());
            self.store.update_workflow(&workflow).await?;
            Ok(())
        }
        .await;

        if let Err(e) = result {
            error!(%workflow_id, error = %e, "failed to record workflow failure");
        }
    }

    async fn drive(&self, workflow_id: Uuid) -> Result<RunOutcome, ExecutorError> {
        let Some(mut workflow) = self.store.get_workflow(workflow_id).await? else {
            warn!("workflow not found");
            return Ok(RunOutcome::Skipped {
                reason: "workflow not found",
            });
        };

        match workflow.status {
            WorkflowStatus::Pending => {
                workflow.begin()?;
                workflow = self.store.update_workflow(&workflow).await?;
                info!(attempt = workflow.attempts, "workflow started");
            }
            WorkflowStatus::Processing => {
                let in_flight = workflow
                    .steps
                    .get(workflow.current_step)
                    .is_some_and(|s| s.status == StepStatus::Processing);
                if in_flight {
                    debug!("current step already in flight");
                    return Ok(RunOutcome::Skipped {
                        reason: "step in flight",
                    });
                }
                info!(
                    attempt = workflow.attempts,
                    step = ?workflow.current_kind(),
                    "workflow resumed"
                );
            }
            WorkflowStatus::Success | WorkflowStatus::Failed => {
                debug!(status = %workflow.status, "workflow is terminal");
                return Ok(RunOutcome::Skipped { reason: "terminal" });
            }
        }

        let subject = self
            .store
            .get_subject(workflow.subject_id)
            .await?
            .ok_or(ExecutorError::SubjectNotFound(workflow.subject_id))?;

        while let Some(kind) = workflow.current_kind() {
            workflow.start_step()?;
            workflow = self.store.update_workflow(&workflow).await?;
            debug!(step = %kind, "step started");

            let context = ProvisioningContext::from_workflow(&workflow);
            let result = self
                .execute_step(kind, &subject, &workflow, &context)
                .await
                .and_then(|completion| check_cost(&workflow, completion));
            match result {
                Ok(completion) => {
                    let unit_cost = completion.unit_cost;
                    workflow.complete_step(completion)?;
                    workflow = self.store.update_workflow(&workflow).await?;
                    info!(step = %kind, ?unit_cost, "step succeeded");
                }
                Err(err) => {
                    workflow.fail_step(err.message.clone())?;
                    workflow.next_retry_at = self.retry_policy.next_retry_at(
                        workflow.attempts,
                        err.retryable,
                        Utc::now(),
                    );
                    workflow = self.store.update_workflow(&workflow).await?;
                    warn!(
                        step = %kind,
                        error = %err,
                        retryable = err.retryable,
                        next_retry_at = ?workflow.next_retry_at,
                        "step failed, workflow halted"
                    );
                    return Ok(RunOutcome::Failed {
                        error: workflow.error.clone().unwrap_or(err.message),
                    });
                }
            }
        }

        match (workflow.status, workflow.aggregated_cost) {
            (WorkflowStatus::Success, Some(aggregated_cost)) => {
                info!(aggregated_cost, "workflow succeeded");
                Ok(RunOutcome::Completed { aggregated_cost })
            }
            _ => {
                let message = "workflow has no steps to run";
                workflow.fail(message)?;
                self.store.update_workflow(&workflow).await?;
                Ok(RunOutcome::Failed {
                    error: message.to_string(),
                })
            }
        }
    }

    async fn execute_step(
        &self,
        kind: StepKind,
        subject: &Subject,
        workflow: &Workflow,
        context: &ProvisioningContext,
    ) -> Result<StepCompletion, ProvisionError> {
        match kind {
            StepKind::CreateMetadata => {
                let document = metadata_document(subject);
                let content_ref = self.provisioners.metadata.upload_metadata(&document).await?;
                Ok(StepCompletion {
                    operation_ref: None,
                    unit_cost: Some(0),
                    output: StepOutput::Metadata { content_ref },
                })
            }
            StepKind::DeployWallet => {
                let deployment = self
                    .provisioners
                    .wallets
                    .deploy_wallet(subject.owner_id)
                    .await?;
                Ok(StepCompletion {
                    operation_ref: Some(deployment.operation_ref),
                    unit_cost: Some(deployment.unit_cost),
                    output: StepOutput::Wallet {
                        address: deployment.address,
                    },
                })
            }
            StepKind::DeployToken => {
                let spec = subject.token.as_ref().ok_or_else(|| {
                    ProvisionError::non_retryable("tokenized subject has no token spec")
                        .with_type("invalid_subject")
                })?;
                let owner_address = require(&context.wallet_address, "wallet address")?;
                let deployment = self
                    .provisioners
                    .tokens
                    .deploy_token(spec, owner_address)
                    .await?;
                Ok(StepCompletion {
                    operation_ref: Some(deployment.operation_ref),
                    unit_cost: Some(deployment.unit_cost),
                    output: StepOutput::Token {
                        address: deployment.address,
                    },
                })
            }
            StepKind::RegisterOnLedger => {
                let registration = LedgerRegistration {
                    subject_id: subject.id,
                    name: subject.name.clone(),
                    description: subject.description.clone(),
                    image_url: subject.image_url.clone(),
                    wallet_address: require(&context.wallet_address, "wallet address")?
                        .to_string(),
                    token_address: context.token_address.clone(),
                    metadata_ref: require(&context.metadata_ref, "metadata reference")?
                        .to_string(),
                };
                let receipt = self
                    .provisioners
                    .ledger
                    .register_on_ledger(&registration)
                    .await?;
                Ok(StepCompletion {
                    operation_ref: Some(receipt.operation_ref),
                    unit_cost: Some(receipt.unit_cost),
                    output: StepOutput::Ledger {
                        registration_id: receipt.registration_id,
                        block_ref: receipt.block_ref,
                    },
                })
            }
            StepKind::ConfigureSubject => {
                self.store
                    .configure_subject(subject.id, &workflow.resources)
                    .await
                    .map_err(subject_update_failed)?;
                Ok(StepCompletion {
                    operation_ref: None,
                    unit_cost: Some(0),
                    output: StepOutput::SubjectConfigured,
                })
            }
            StepKind::ActivateSubject => {
                self.store
                    .activate_subject(subject.id, Utc::now())
                    .await
                    .map_err(subject_update_failed)?;
                Ok(StepCompletion {
                    operation_ref: None,
                    unit_cost: Some(0),
                    output: StepOutput::SubjectActivated,
                })
            }
        }
    }
}

/// Re-enter a FAILED workflow into PROCESSING so the executor resumes it at the
/// failed step. Loses with `VersionConflict` if another writer got there first.
pub async fn reopen_for_retry(
    store: &dyn WorkflowStore,
    workflow: &Workflow,
) -> Result<Workflow, ExecutorError> {
    let mut reopened = workflow.clone();
    reopened.reopen()?;
    Ok(store.update_workflow(&reopened).await?)
}

fn require<'a>(value: &'a Option<String>, what: &str) -> Result<&'a str, ProvisionError> {
    value.as_deref().ok_or_else(|| {
        ProvisionError::non_retryable(format!("{what} missing from earlier steps"))
            .with_type("missing_input")
    })
}

/// Reject a unit cost that would push the aggregated cost past [`MAX_COST`].
///
/// Runs before the step is recorded, so later steps (and the subject update) never run.
fn check_cost(
    workflow: &Workflow,
    completion: StepCompletion,
) -> Result<StepCompletion, ProvisionError> {
    if workflow.cost_with(completion.unit_cost).is_some() {
        return Ok(completion);
    }
    Err(ProvisionError::non_retryable(format!(
        "unit cost {} puts the aggregated cost above {MAX_COST}",
        completion.unit_cost.unwrap_or(0)
    ))
    .with_type("cost_overflow"))
}

fn subject_update_failed(err: StoreError) -> ProvisionError {
    ProvisionError::retryable(format!("subject update failed: {err}")).with_type("store")
}
