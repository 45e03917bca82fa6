//! Graduation engine: step planning, execution and the orchestrator service

mod builder;
mod executor;
mod orchestrator;

pub use builder::{build_steps, step_plan};
pub use executor::{
    metadata_document, reopen_for_retry, ExecutorError, ProvisioningContext, RunOutcome,
    StepExecutor,
};
pub use orchestrator::{
    validate_idempotency_key, Initiation, Orchestrator, OrchestratorError,
    MAX_IDEMPOTENCY_KEY_LEN,
};
