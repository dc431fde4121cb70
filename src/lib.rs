#![forbid(unsafe_code)]
//! Golden-output test runner for Jupyter notebooks
//!
//! Each notebook in the input directory is executed cell by cell in a fresh kernel; the outputs it produces
//! must match the outputs stored in the notebook. A disposable kernel spec is installed for the run and
//! removed afterwards.
//!
//! - [`config`]: environment-derived configuration
//! - [`kernelspec`]: kernel spec lookup, installation and the scoped test-kernel guard
//! - [`kernel`]: the launcher/session seam and the Jupyter (ZeroMQ) implementation
//! - [`runner`]: the per-notebook state machine
//! - [`suite`]: discovery, the restart retry and the provisioning wrapper
//! - [`report`]: console reporting
//!
//! The notebook model and the comparison rule live in the `nbgolden_core` crate.
//!
//! ## Panic Policy
//!
//! This codebase follows explicit error handling:
//!
//! - **Production code**: Use `Result` or `Option` with `?` / `ok_or` / `map_err`. The `cli` module enforces
//!   `#![deny(clippy::unwrap_used)]`.
//!
//! - **Test code**: `.unwrap()` and `.expect()` are acceptable in tests.

pub mod cli;
pub mod config;
pub mod kernel;
pub mod kernelspec;
pub mod report;
pub mod runner;
pub mod suite;

pub use config::HarnessConfig;
pub use kernel::{ExecutionResult, KernelError, KernelLauncher, KernelSession};
pub use kernelspec::{KernelProvisioner, KernelSpecGuard, KernelSpecManager};
pub use runner::{CellExecutionError, NotebookRunner, RunError, RunOutcome, RunnerSettings};
pub use suite::{discover_notebooks, run_harness, run_suite};
