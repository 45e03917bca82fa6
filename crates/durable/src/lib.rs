//! # Durable Graduation Engine
//!
//! Turns a draft subject into a provisioned one by running an ordered list of
//! external operations, with exactly-once initiation and a durable per-step trail.
//!
//! ## Features
//!
//! - **Idempotent initiation**: one workflow per caller-supplied key, enforced by the store
//! - **Ordered steps**: halt on first failure, never re-run a successful step
//! - **Optimistic concurrency**: every write is a compare-and-swap on the workflow version
//! - **Bounded background execution**: semaphore-limited worker pool fed by a queue
//! - **Retry scanner**: exponential-backoff retries, stale recovery and retention purge
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Orchestrator                          │
//! │  (idempotency gate, status queries, manual retry)           │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ submit(id)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │              BackgroundRunner  ◀──  RetryScanner             │
//! │  (bounded pool running the StepExecutor per workflow)       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkflowStore                           │
//! │  (PostgreSQL: graduation_workflows, graduation_subjects)    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use graduation_durable::prelude::*;
//!
//! let store: Arc<dyn WorkflowStore> = Arc::new(InMemoryWorkflowStore::new());
//! let executor = Arc::new(StepExecutor::new(store.clone(), provisioners));
//! let runner = Arc::new(BackgroundRunner::start(executor, RunnerConfig::default()));
//! let orchestrator = Orchestrator::new(store, runner);
//!
//! let initiation = orchestrator.initiate(subject_id, requester_id, "abc-123").await?;
//! let workflow = orchestrator.get_status(initiation.workflow.id).await?;
//! ```

pub mod engine;
pub mod persistence;
pub mod reliability;
pub mod testing;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::engine::{
        ExecutorError, Initiation, Orchestrator, OrchestratorError, RunOutcome, StepExecutor,
    };
    pub use crate::persistence::{
        InMemoryWorkflowStore, PostgresWorkflowStore, StoreError, WorkflowStore,
    };
    pub use crate::reliability::RetryPolicy;
    pub use crate::worker::{
        BackgroundRunner, RetryScanner, RunnerConfig, ScannerConfig, WorkflowRunner,
    };
    pub use graduation_core::{Workflow, WorkflowStatus};
}

// Re-export key types at crate root
pub use engine::{
    build_steps, ExecutorError, Initiation, Orchestrator, OrchestratorError, RunOutcome,
    StepExecutor,
};
pub use persistence::{
    InMemoryWorkflowStore, InsertOutcome, PostgresWorkflowStore, ScanFilter, StoreError,
    WorkflowStore,
};
pub use reliability::RetryPolicy;
pub use worker::{
    BackgroundRunner, RetryScanner, RunnerConfig, RunnerError, ScanReport, ScannerConfig,
    WorkflowRunner,
};
