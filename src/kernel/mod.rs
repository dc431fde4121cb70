//! Kernel boundary
//!
//! The runner talks to kernels only through two traits:
//! - [`KernelLauncher`]: start a fresh kernel process for one notebook pass
//! - [`KernelSession`]: execute cell source and collect outputs, then shut down
//!
//! [`jupyter::JupyterLauncher`] is the real implementation (Jupyter messaging over ZeroMQ). Tests substitute
//! scripted sessions so the runner's state machine can be exercised without a Python kernel.

pub mod connection;
pub mod jupyter;
pub mod wire;

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use miette::Diagnostic;
use nbgolden_core::Output;
use thiserror::Error;

use crate::kernelspec::KernelSpecError;

pub use jupyter::JupyterLauncher;

#[derive(Debug, Error, Diagnostic)]
pub enum KernelError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    KernelSpec(#[from] KernelSpecError),

    #[error("failed to launch kernel `{name}`: {source}")]
    #[diagnostic(code(nbgolden::kernel::launch))]
    Launch {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("kernel did not become ready within {0:?}")]
    #[diagnostic(code(nbgolden::kernel::startup_timeout))]
    StartupTimeout(Duration),

    #[error("cell execution timed out after {0:?}")]
    #[diagnostic(
        code(nbgolden::kernel::timeout),
        help("raise the limit with `--timeout <SECS>`")
    )]
    Timeout(Duration),

    #[error("kernel died unexpectedly: {0}")]
    #[diagnostic(code(nbgolden::kernel::died))]
    Died(String),

    #[error("kernel transport error: {0}")]
    #[diagnostic(code(nbgolden::kernel::transport))]
    Transport(#[from] zeromq::ZmqError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Wire(#[from] wire::WireError),

    #[error("kernel I/O error: {0}")]
    #[diagnostic(code(nbgolden::kernel::io))]
    Io(#[from] std::io::Error),
}

/// An exception reported by the kernel for an executed cell.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct KernelException {
    pub ename: String,
    pub evalue: String,
    pub traceback: Vec<String>,
}

/// Status from the shell `execute_reply`.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyStatus {
    Ok,
    Error(KernelException),
    Aborted,
}

/// Everything one `execute` produced.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub outputs: Vec<Output>,
    pub execution_count: Option<u32>,
    pub status: ReplyStatus,
}

impl ExecutionResult {
    pub fn ok(outputs: Vec<Output>, execution_count: Option<u32>) -> Self {
        Self {
            outputs,
            execution_count,
            status: ReplyStatus::Ok,
        }
    }
}

/// Starts kernels by spec name.
#[async_trait]
pub trait KernelLauncher: Send + Sync {
    /// Start a new kernel process whose working directory is `working_dir`.
    async fn launch(&self, kernel_name: &str, working_dir: &Path) -> Result<Box<dyn KernelSession>, KernelError>;
}

#[async_trait]
impl<T: KernelLauncher + ?Sized> KernelLauncher for &T {
    async fn launch(&self, kernel_name: &str, working_dir: &Path) -> Result<Box<dyn KernelSession>, KernelError> {
        (**self).launch(kernel_name, working_dir).await
    }
}

/// A live kernel.
#[async_trait]
pub trait KernelSession: Send {
    /// Run `code` and wait (at most `timeout`) until the kernel is idle again.
    ///
    /// A kernel-side exception is an `Ok` result with [`ReplyStatus::Error`]; `Err` means the kernel or the
    /// transport failed.
    async fn execute(&mut self, code: &str, timeout: Duration) -> Result<ExecutionResult, KernelError>;

    /// Stop the kernel process.
    async fn shutdown(self: Box<Self>) -> Result<(), KernelError>;
}
