// Workflow domain types
//
// A workflow is a single graduation attempt for one subject, identified by a unique
// idempotency key. It owns the ordered step list, the current-step pointer and the
// produced resource references.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[cfg(feature = "openapi")]
use utoipa::ToSchema;

use crate::error::TransitionError;
use crate::step::{Step, StepCompletion, StepKind, StepOutput, StepStatus};

/// Largest aggregated cost a workflow can carry (the `BIGINT` column bound).
pub const MAX_COST: u64 = i64::MAX as u64;

fn checked_cost_add(total: u64, cost: u64) -> Option<u64> {
    total.checked_add(cost).filter(|sum| *sum <= MAX_COST)
}

/// Workflow execution status.
/// - `pending`: created by the idempotency gate, not picked up yet
/// - `processing`: owned by an executor
/// - `success`: every step succeeded
/// - `failed`: a step failed (or the executor hit a system error) and the run halted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Pending,
    Processing,
    Success,
    Failed,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowStatus::Success | WorkflowStatus::Failed)
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowStatus::Pending => write!(f, "pending"),
            WorkflowStatus::Processing => write!(f, "processing"),
            WorkflowStatus::Success => write!(f, "success"),
            WorkflowStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(WorkflowStatus::Pending),
            "processing" => Ok(WorkflowStatus::Processing),
            "success" => Ok(WorkflowStatus::Success),
            "failed" => Ok(WorkflowStatus::Failed),
            other => Err(format!("unknown workflow status: {other}")),
        }
    }
}

/// Resource references produced by a graduation.
///
/// Fields are only ever filled in, never cleared.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct ResourceRefs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wallet_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_ref: Option<String>,
}

impl ResourceRefs {
    /// Copy the references carried by a step output.
    pub fn absorb(&mut self, output: &StepOutput) {
        match output {
            StepOutput::Wallet { address } => self.wallet_address = Some(address.clone()),
            StepOutput::Token { address } => self.token_address = Some(address.clone()),
            StepOutput::Ledger {
                registration_id,
                block_ref,
            } => {
                self.registration_id = Some(registration_id.clone());
                if let Some(block_ref) = block_ref {
                    self.block_ref = Some(block_ref.clone());
                }
            }
            StepOutput::Metadata { .. }
            | StepOutput::SubjectConfigured
            | StepOutput::SubjectActivated => {}
        }
    }

    /// Fill in every reference set in `other`, keeping the rest.
    pub fn merge(&mut self, other: &ResourceRefs) {
        if let Some(v) = &other.wallet_address {
            self.wallet_address = Some(v.clone());
        }
        if let Some(v) = &other.token_address {
            self.token_address = Some(v.clone());
        }
        if let Some(v) = &other.registration_id {
            self.registration_id = Some(v.clone());
        }
        if let Some(v) = &other.block_ref {
            self.block_ref = Some(v.clone());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.wallet_address.is_none()
            && self.token_address.is_none()
            && self.registration_id.is_none()
            && self.block_ref.is_none()
    }
}

/// A single graduation attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct Workflow {
    pub id: Uuid,
    /// Caller-supplied key; at most one workflow exists per key.
    pub idempotency_key: String,
    /// Subject being graduated.
    pub subject_id: Uuid,
    /// Who asked for the graduation.
    pub requester_id: Uuid,
    pub status: WorkflowStatus,
    /// Ordered steps, fixed at creation.
    pub steps: Vec<Step>,
    /// Index of the next step to run (equals `steps.len()` once all succeeded).
    pub current_step: usize,
    /// Sum of step unit costs; set only on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregated_cost: Option<u64>,
    #[serde(flatten)]
    pub resources: ResourceRefs,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Number of executor runs (first run plus retries).
    pub attempts: u32,
    /// Earliest time the retry scanner may pick this workflow up again.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Optimistic concurrency token, bumped by the store on every write.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Workflow {
    /// New pending workflow with the given step plan.
    pub fn new(
        idempotency_key: impl Into<String>,
        subject_id: Uuid,
        requester_id: Uuid,
        steps: Vec<Step>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            idempotency_key: idempotency_key.into(),
            subject_id,
            requester_id,
            status: WorkflowStatus::Pending,
            steps,
            current_step: 0,
            aggregated_cost: None,
            resources: ResourceRefs::default(),
            error: None,
            attempts: 0,
            next_retry_at: None,
            version: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Step names in execution order.
    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.kind.name()).collect()
    }

    /// Kind of the step at the current-step pointer, if any is left.
    pub fn current_kind(&self) -> Option<StepKind> {
        self.steps.get(self.current_step).map(|s| s.kind)
    }

    /// Sum of unit costs recorded so far; missing costs count as zero.
    ///
    /// `None` when the sum exceeds [`MAX_COST`].
    pub fn cost_so_far(&self) -> Option<u64> {
        self.steps
            .iter()
            .filter_map(|s| s.unit_cost)
            .try_fold(0u64, checked_cost_add)
    }

    /// Aggregated cost after adding `unit_cost` to what is recorded so far.
    pub fn cost_with(&self, unit_cost: Option<u64>) -> Option<u64> {
        checked_cost_add(self.cost_so_far()?, unit_cost.unwrap_or(0))
    }

    /// First executor claim: `pending -> processing`.
    pub fn begin(&mut self) -> Result<(), TransitionError> {
        self.transition(WorkflowStatus::Pending, WorkflowStatus::Processing)?;
        self.attempts += 1;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Retry claim: `failed -> processing`. The failed step is restarted by the executor.
    pub fn reopen(&mut self) -> Result<(), TransitionError> {
        self.transition(WorkflowStatus::Failed, WorkflowStatus::Processing)?;
        self.attempts += 1;
        self.error = None;
        self.next_retry_at = None;
        self.completed_at = None;
        Ok(())
    }

    /// Start the step at the current-step pointer.
    pub fn start_step(&mut self) -> Result<StepKind, TransitionError> {
        self.require(WorkflowStatus::Processing, WorkflowStatus::Processing)?;
        let step = self.pointed_step()?;
        step.start()?;
        Ok(step.kind)
    }

    /// Record success of the current step and advance the pointer.
    ///
    /// Completing the last step completes the workflow and fixes its aggregated cost.
    pub fn complete_step(&mut self, completion: StepCompletion) -> Result<(), TransitionError> {
        self.require(WorkflowStatus::Processing, WorkflowStatus::Success)?;
        let total = self
            .cost_with(completion.unit_cost)
            .ok_or(TransitionError::CostOverflow { limit: MAX_COST })?;
        let output = completion.output.clone();
        self.pointed_step()?.succeed(completion)?;
        self.resources.absorb(&output);
        self.current_step += 1;

        if self.current_step == self.steps.len() {
            self.status = WorkflowStatus::Success;
            self.aggregated_cost = Some(total);
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Record failure of the current step and halt the workflow.
    pub fn fail_step(&mut self, message: impl Into<String>) -> Result<(), TransitionError> {
        self.require(WorkflowStatus::Processing, WorkflowStatus::Failed)?;
        let message = message.into();
        let step = self.pointed_step()?;
        step.fail(message.clone())?;
        let kind = step.kind;

        self.status = WorkflowStatus::Failed;
        self.error = Some(format!("{kind}: {message}"));
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Fail the workflow for a reason outside any provisioner call.
    ///
    /// A step left in `processing` is failed with the same message so no step outlives
    /// its workflow in a running state.
    pub fn fail(&mut self, message: impl Into<String>) -> Result<(), TransitionError> {
        self.require(WorkflowStatus::Processing, WorkflowStatus::Failed)?;
        let message = message.into();
        if let Some(step) = self.steps.get_mut(self.current_step) {
            if step.status == StepStatus::Processing {
                step.fail(message.clone())?;
            }
        }
        self.status = WorkflowStatus::Failed;
        self.error = Some(message);
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    fn pointed_step(&mut self) -> Result<&mut Step, TransitionError> {
        let len = self.steps.len();
        self.steps
            .get_mut(self.current_step)
            .ok_or(TransitionError::NoCurrentStep {
                index: self.current_step,
                len,
            })
    }

    fn require(&self, expected: WorkflowStatus, to: WorkflowStatus) -> Result<(), TransitionError> {
        if self.status != expected {
            return Err(TransitionError::Workflow {
                from: self.status,
                to,
            });
        }
        Ok(())
    }

    fn transition(
        &mut self,
        expected: WorkflowStatus,
        to: WorkflowStatus,
    ) -> Result<(), TransitionError> {
        self.require(expected, to)?;
        self.status = to;
        Ok(())
    }
}
