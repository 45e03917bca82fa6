//! Persistence layer for graduation workflows
//!
//! This module provides:
//! - [`WorkflowStore`] trait for workflow and subject persistence
//! - [`InMemoryWorkflowStore`] for testing and single-process runs
//! - [`PostgresWorkflowStore`] for production

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryWorkflowStore;
pub use postgres::PostgresWorkflowStore;
pub use store::{InsertOutcome, ScanFilter, StoreError, WorkflowStore};
