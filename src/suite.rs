//! Suite driver
//!
//! Runs every notebook in the input directory, one after the other:
//! - discovery is non-recursive and sorted by file name
//! - a restart request reruns the notebook once; a second request is [`RunError::RepeatedRestart`]
//! - the first error stops the loop
//!
//! [`run_harness`] wraps the loop in the kernel spec guard so the test kernel is removed however the loop ends.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::config::HarnessConfig;
use crate::kernel::KernelLauncher;
use crate::kernelspec::{KernelProvisioner, KernelSpecGuard};
use crate::report::{NotebookResult, RunReporter, RunSummary};
use crate::runner::{NotebookRunner, RunError, RunOutcome, RunnerSettings};

pub const NOTEBOOK_EXTENSION: &str = ".ipynb";

/// List the notebooks directly inside `dir`, sorted by file name.
pub fn discover_notebooks(dir: &Path) -> Result<Vec<PathBuf>, RunError> {
    let discovery_error = |source| RunError::Discovery {
        path: dir.to_path_buf(),
        source,
    };
    let mut notebooks = Vec::new();
    for entry in fs::read_dir(dir).map_err(discovery_error)? {
        let entry = entry.map_err(discovery_error)?;
        let is_notebook = entry.file_name().to_string_lossy().ends_with(NOTEBOOK_EXTENSION);
        if is_notebook && entry.path().is_file() {
            notebooks.push(entry.path());
        }
    }
    notebooks.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(notebooks)
}

/// Run one notebook, rerunning it once if it asks for a restart.
///
/// Returns whether the rerun was needed.
pub async fn run_with_restart<L: KernelLauncher>(
    runner: &NotebookRunner<L>,
    path: &Path,
    reporter: &mut dyn RunReporter,
) -> Result<bool, RunError> {
    match runner.run(path, reporter).await? {
        RunOutcome::Completed => Ok(false),
        RunOutcome::RestartRequested => {
            tracing::info!(path = %path.display(), "rerunning notebook with a fresh kernel");
            match runner.run(path, reporter).await? {
                RunOutcome::Completed => Ok(true),
                RunOutcome::RestartRequested => Err(RunError::RepeatedRestart(path.to_path_buf())),
            }
        }
    }
}

/// Run every notebook in `input_dir`, stopping at the first failure.
#[tracing::instrument(skip(runner, reporter))]
pub async fn run_suite<L: KernelLauncher>(
    runner: &NotebookRunner<L>,
    input_dir: &Path,
    reporter: &mut dyn RunReporter,
) -> Result<RunSummary, RunError> {
    let started = Instant::now();
    let notebooks = discover_notebooks(input_dir)?;
    reporter.on_discovery_complete(input_dir, &notebooks);
    tracing::info!(count = notebooks.len(), "discovered notebooks");

    let mut summary = RunSummary {
        discovered: notebooks.len(),
        ..RunSummary::default()
    };
    for path in &notebooks {
        reporter.on_notebook_start(path);
        let notebook_started = Instant::now();
        let result = run_with_restart(runner, path, reporter).await;

        let elapsed = notebook_started.elapsed();
        let notebook_result = match &result {
            Ok(false) => NotebookResult::Passed(elapsed),
            Ok(true) => NotebookResult::PassedAfterRestart(elapsed),
            Err(e) => NotebookResult::Failed(elapsed, e.to_string()),
        };
        summary.record(&notebook_result);
        reporter.on_notebook_complete(path, &notebook_result);

        if let Err(e) = result {
            summary.duration = started.elapsed();
            reporter.on_run_complete(&summary);
            return Err(e);
        }
    }

    summary.duration = started.elapsed();
    reporter.on_run_complete(&summary);
    Ok(summary)
}

/// Provision the test kernel, run the suite, remove the kernel spec again.
pub async fn run_harness<L: KernelLauncher>(
    config: &HarnessConfig,
    provisioner: &KernelProvisioner,
    launcher: L,
    reporter: &mut dyn RunReporter,
) -> Result<RunSummary, RunError> {
    let guard = KernelSpecGuard::acquire(provisioner, &config.kernel_name)?;
    if let Some(dir) = guard.installed_path() {
        tracing::info!(dir = %dir.display(), "installed test kernel spec");
    }

    let runner = NotebookRunner::new(launcher, RunnerSettings::from(config));
    let result = run_suite(&runner, &config.input_dir, reporter).await;

    if let Err(e) = guard.release() {
        tracing::warn!(error = %e, "failed to remove test kernel spec");
    }
    result
}
