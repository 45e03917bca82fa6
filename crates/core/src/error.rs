// Error types for workflow state transitions

use thiserror::Error;

use crate::step::{StepKind, StepStatus};
use crate::workflow::WorkflowStatus;

/// Raised when a status change would break the workflow or step state machine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    /// Step cannot move between these states
    #[error("step {step} cannot move from {from} to {to}")]
    Step {
        step: StepKind,
        from: StepStatus,
        to: StepStatus,
    },

    /// Workflow cannot move between these states
    #[error("workflow cannot move from {from} to {to}")]
    Workflow {
        from: WorkflowStatus,
        to: WorkflowStatus,
    },

    /// The current-step pointer is past the last step
    #[error("no step left to run (current step {index} of {len})")]
    NoCurrentStep { index: usize, len: usize },

    /// The aggregated cost would exceed the largest storable cost
    #[error("aggregated cost exceeds {limit}")]
    CostOverflow { limit: u64 },
}
