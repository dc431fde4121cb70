//! Notebook test runner
//!
//! One pass over one notebook:
//!
//! ```text
//! Loaded -> Executing(i) -> Compared(i) -> [next | RestartRequested | Failed] -> Persisted
//! ```
//!
//! - **Loaded**: read the notebook and force its kernel to the test kernel.
//! - **Executing(i)**: stash the stored outputs, clear them, execute the source, attach the fresh outputs.
//! - **Restart check**: a fresh output whose `text` contains the restart signal ends the pass with
//!   [`RunOutcome::RestartRequested`].
//! - **Compared(i)**: unless the cell opts out, the stored outputs must match the fresh ones.
//! - **Failed**: a kernel-reported error or a mismatch swaps the cell source for the diagnostic command, runs
//!   it, reports its first output and returns the original error.
//! - **Persisted**: whatever happened, the notebook is written to `<output_dir>/<file name>.out`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use miette::Diagnostic;
use nbgolden_core::{CodeCell, Notebook, NotebookError, OutputMismatch, compare_outputs, requests_restart, skips_comparison};
use thiserror::Error;

use crate::config::HarnessConfig;
use crate::kernel::{KernelError, KernelException, KernelLauncher, KernelSession, ReplyStatus};
use crate::kernelspec::ProvisionError;
use crate::report::RunReporter;

/// Extension appended to the notebook file name when persisting.
pub const OUT_EXTENSION: &str = "out";

/// A cell failed: the kernel raised, or the fresh outputs differ from the stored ones.
#[derive(Debug, Error, Diagnostic)]
pub enum CellExecutionError {
    #[error("cell {cell} raised {}: {}", .exception.ename, .exception.evalue)]
    #[diagnostic(code(nbgolden::cell::kernel_error))]
    Kernel { cell: usize, exception: KernelException },

    #[error("cell {cell} was aborted by the kernel")]
    #[diagnostic(code(nbgolden::cell::aborted))]
    Aborted { cell: usize },

    #[error("cell {cell}: {mismatch}")]
    #[diagnostic(code(nbgolden::cell::output_mismatch))]
    OutputMismatch {
        cell: usize,
        #[diagnostic_source]
        mismatch: OutputMismatch,
    },
}

impl CellExecutionError {
    pub fn cell(&self) -> usize {
        match self {
            CellExecutionError::Kernel { cell, .. }
            | CellExecutionError::Aborted { cell }
            | CellExecutionError::OutputMismatch { cell, .. } => *cell,
        }
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum RunError {
    #[error("failed to read {path}: {source}")]
    #[diagnostic(code(nbgolden::run::read))]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid notebook {path}: {source}")]
    #[diagnostic(code(nbgolden::run::notebook))]
    Notebook {
        path: PathBuf,
        #[source]
        source: NotebookError,
    },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Kernel(#[from] KernelError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Cell(#[from] CellExecutionError),

    #[error("failed to write {path}: {source}")]
    #[diagnostic(code(nbgolden::run::persist))]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to list notebooks in {path}: {source}")]
    #[diagnostic(code(nbgolden::run::discovery))]
    Discovery {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Provision(#[from] ProvisionError),

    #[error("{0} asked for a kernel restart again on its rerun")]
    #[diagnostic(
        code(nbgolden::run::repeated_restart),
        help("a notebook is rerun only once after printing `restart kernel`")
    )]
    RepeatedRestart(PathBuf),
}

/// How a pass over a notebook ended, when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    /// An output asked for a fresh kernel; the caller reruns the notebook.
    RestartRequested,
}

/// How a single cell ended, when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellOutcome {
    Passed,
    /// Executed, comparison skipped by the opt-out marker.
    Unchecked,
    RestartRequested,
}

/// The part of [`HarnessConfig`] a notebook pass needs.
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub kernel_name: String,
    pub output_dir: PathBuf,
    pub cell_timeout: Duration,
    pub diagnostic_command: String,
}

impl From<&HarnessConfig> for RunnerSettings {
    fn from(config: &HarnessConfig) -> Self {
        Self {
            kernel_name: config.kernel_name.clone(),
            output_dir: config.output_dir.clone(),
            cell_timeout: config.cell_timeout,
            diagnostic_command: config.diagnostic_command.clone(),
        }
    }
}

/// Runs notebooks against fresh kernels from a [`KernelLauncher`].
pub struct NotebookRunner<L> {
    launcher: L,
    settings: RunnerSettings,
}

impl<L: KernelLauncher> NotebookRunner<L> {
    pub fn new(launcher: L, settings: RunnerSettings) -> Self {
        Self { launcher, settings }
    }

    pub fn settings(&self) -> &RunnerSettings {
        &self.settings
    }

    /// Where the executed copy of `notebook_path` is written.
    pub fn output_path(&self, notebook_path: &Path) -> PathBuf {
        let mut name = notebook_path.file_name().unwrap_or(notebook_path.as_os_str()).to_os_string();
        name.push(".");
        name.push(OUT_EXTENSION);
        self.settings.output_dir.join(name)
    }

    /// Execute one notebook and persist the result.
    ///
    /// ## Returns
    /// - [`RunOutcome::Completed`] when every code cell ran and matched.
    /// - [`RunOutcome::RestartRequested`] when an output carried the restart signal.
    ///
    /// ## Errors
    /// - [`RunError::Cell`] after the diagnostic command has been run and reported.
    /// - [`RunError::Kernel`] for launch failures, timeouts and dead kernels.
    /// - [`RunError::Persist`] only when the pass itself succeeded; otherwise the pass error wins.
    #[tracing::instrument(skip(self, reporter), fields(kernel = %self.settings.kernel_name))]
    pub async fn run(&self, path: &Path, reporter: &mut dyn RunReporter) -> Result<RunOutcome, RunError> {
        let mut notebook = load_notebook(path)?;
        notebook.set_kernel_name(&self.settings.kernel_name);

        let working_dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let result = self.execute(&mut notebook, working_dir, reporter).await;
        if matches!(result, Ok(RunOutcome::RestartRequested)) {
            reporter.on_restart_requested(path);
        }

        let out_path = self.output_path(path);
        match (result, self.persist(&notebook, &out_path)) {
            (Ok(outcome), Ok(())) => {
                reporter.on_persisted(&out_path);
                Ok(outcome)
            }
            (Ok(_), Err(persist_error)) => Err(persist_error),
            (Err(run_error), Ok(())) => {
                reporter.on_persisted(&out_path);
                Err(run_error)
            }
            (Err(run_error), Err(persist_error)) => {
                tracing::error!(error = %persist_error, "could not persist the failed notebook");
                Err(run_error)
            }
        }
    }

    /// Launch a kernel, run every code cell, always shut the kernel down.
    async fn execute(
        &self,
        notebook: &mut Notebook,
        working_dir: &Path,
        reporter: &mut dyn RunReporter,
    ) -> Result<RunOutcome, RunError> {
        let mut session = self.launcher.launch(&self.settings.kernel_name, working_dir).await?;

        let result = match self.execute_cells(session.as_mut(), notebook).await {
            Ok(outcome) => Ok(outcome),
            Err(PassError::Kernel(error)) => Err(error.into()),
            Err(PassError::Cell { cell, error }) => {
                tracing::warn!(%error, "cell failed, running diagnostic command");
                if let Some(code) = notebook.cells.get_mut(cell).and_then(|c| c.as_code_mut()) {
                    self.fetch_diagnostics(session.as_mut(), code, reporter).await;
                }
                Err(error.into())
            }
        };

        if let Err(e) = session.shutdown().await {
            tracing::warn!(error = %e, "kernel shutdown failed");
        }
        result
    }

    async fn execute_cells(&self, session: &mut dyn KernelSession, notebook: &mut Notebook) -> Result<RunOutcome, PassError> {
        for (index, cell) in notebook.cells.iter_mut().enumerate() {
            let Some(code) = cell.as_code_mut() else {
                continue;
            };
            if code.source.trim().is_empty() {
                continue;
            }
            if self.execute_cell(session, index, code).await? == CellOutcome::RestartRequested {
                return Ok(RunOutcome::RestartRequested);
            }
        }
        Ok(RunOutcome::Completed)
    }

    /// Execute one code cell and check it against its stored outputs.
    #[tracing::instrument(skip(self, session, cell))]
    async fn execute_cell(
        &self,
        session: &mut dyn KernelSession,
        index: usize,
        cell: &mut CodeCell,
    ) -> Result<CellOutcome, PassError> {
        let expected = std::mem::take(&mut cell.outputs);
        let result = session
            .execute(&cell.source, self.settings.cell_timeout)
            .await
            .map_err(PassError::Kernel)?;
        cell.outputs = result.outputs;
        cell.execution_count = result.execution_count;

        let failed = |error| PassError::Cell { cell: index, error };
        match result.status {
            ReplyStatus::Ok => {}
            ReplyStatus::Error(exception) => {
                return Err(failed(CellExecutionError::Kernel { cell: index, exception }));
            }
            ReplyStatus::Aborted => return Err(failed(CellExecutionError::Aborted { cell: index })),
        }

        if requests_restart(&cell.outputs) {
            tracing::info!("output requested a kernel restart");
            return Ok(CellOutcome::RestartRequested);
        }
        if skips_comparison(&cell.source) {
            tracing::debug!("comparison skipped by marker");
            return Ok(CellOutcome::Unchecked);
        }
        compare_outputs(&expected, &cell.outputs)
            .map_err(|mismatch| failed(CellExecutionError::OutputMismatch { cell: index, mismatch }))?;
        Ok(CellOutcome::Passed)
    }

    /// Replace the failing cell with the diagnostic command and report what it prints.
    ///
    /// Failures here are logged; the caller still returns the original cell error.
    async fn fetch_diagnostics(&self, session: &mut dyn KernelSession, cell: &mut CodeCell, reporter: &mut dyn RunReporter) {
        cell.source = self.settings.diagnostic_command.clone();
        cell.outputs.clear();
        match session.execute(&cell.source, self.settings.cell_timeout).await {
            Ok(result) => {
                cell.outputs = result.outputs;
                cell.execution_count = result.execution_count;
                match cell.outputs.first() {
                    Some(output) => reporter.on_diagnostic_output(output.text().unwrap_or_default()),
                    None => tracing::warn!("diagnostic command produced no output"),
                }
            }
            Err(e) => tracing::warn!(error = %e, "diagnostic command failed"),
        }
    }

    fn persist(&self, notebook: &Notebook, out_path: &Path) -> Result<(), RunError> {
        let persist_error = |source| RunError::Persist {
            path: out_path.to_path_buf(),
            source,
        };
        fs::create_dir_all(&self.settings.output_dir).map_err(persist_error)?;
        let json = notebook
            .to_json_string()
            .map_err(|e| persist_error(std::io::Error::other(e)))?;
        fs::write(out_path, json).map_err(persist_error)?;
        tracing::debug!(path = %out_path.display(), "persisted notebook");
        Ok(())
    }
}

/// Read and parse a notebook file.
pub fn load_notebook(path: &Path) -> Result<Notebook, RunError> {
    let text = fs::read_to_string(path).map_err(|source| RunError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Notebook::from_json_str(&text).map_err(|source| RunError::Notebook {
        path: path.to_path_buf(),
        source,
    })
}

/// Why a pass stopped early: the kernel itself failed, or a cell did.
enum PassError {
    Kernel(KernelError),
    Cell { cell: usize, error: CellExecutionError },
}
