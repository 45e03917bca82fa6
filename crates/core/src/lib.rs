// Graduation core abstractions
//
// This crate holds the DB-agnostic domain model shared by the engine and the server:
// - Workflow / Step: the durable record of one graduation attempt
// - Subject: the draft entity being graduated
// - Provisioner traits: the external services each step calls
//
// Key design decisions:
// - Step kinds are an enum with a per-kind output payload, not loose records
// - Status transitions are methods that reject illegal moves instead of plain field writes
// - Provisioners are injected, so tests and production differ only in the bound implementation

pub mod error;
pub mod provisioner;
pub mod step;
pub mod subject;
pub mod workflow;

pub use error::TransitionError;
pub use provisioner::{
    LedgerReceipt, LedgerRegistrar, LedgerRegistration, MetadataStore, ProvisionError,
    Provisioners, TokenDeployer, TokenDeployment, WalletDeployer, WalletDeployment,
};
pub use step::{Step, StepCompletion, StepKind, StepOutput, StepStatus};
pub use subject::{LaunchMode, Subject, SubjectStatus, TokenSpec};
pub use workflow::{ResourceRefs, Workflow, WorkflowStatus, MAX_COST};
