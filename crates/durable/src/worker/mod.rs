//! Background execution
//!
//! This module provides:
//! - [`WorkflowRunner`] - Trait for handing workflows to an executor off the request path
//! - [`BackgroundRunner`] - Bounded pool of tokio tasks running the step executor
//! - [`RetryScanner`] - Periodic stale recovery, retry, purge and pending sweep
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  submit(id)   ┌──────────────────────────────────────┐
//! │ Orchestrator │ ────────────▶ │          BackgroundRunner            │
//! └──────────────┘               │  mpsc queue ─▶ Semaphore ─▶ [run N]  │
//!                                └──────────────────────────────────────┘
//! ┌──────────────┐  submit(id)                    ▲
//! │ RetryScanner │ ───────────────────────────────┘
//! │  (interval)  │  stale recovery / retry / purge / pending sweep
//! └──────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use graduation_durable::worker::{BackgroundRunner, RetryScanner, RunnerConfig, ScannerConfig};
//!
//! let runner = Arc::new(BackgroundRunner::start(executor, RunnerConfig::default()));
//! let scanner = Arc::new(RetryScanner::new(store, runner.clone(), ScannerConfig::default()));
//! let scanner_handle = scanner.start(shutdown.clone());
//!
//! // Graceful shutdown
//! shutdown.cancel();
//! runner.shutdown().await?;
//! ```

mod runner;
mod scanner;

pub use runner::{BackgroundRunner, RunnerConfig, RunnerError, WorkflowRunner};
pub use scanner::{RetryScanner, ScanReport, ScannerConfig};
