//! CLI command implementations
//!
//! All commands return `CliResult<ExitCode>` for proper error handling.
//! The CLI entry point in `mod.rs` handles printing errors and exiting.

use std::path::Path;
use std::time::Duration;

use nbgolden_core::compare_notebooks;

use super::{CliError, CliResult, ExitCode, RunArgs};
use crate::config::HarnessConfig;
use crate::kernel::JupyterLauncher;
use crate::kernelspec::{KernelProvisioner, KernelSpecManager, ProvisionError};
use crate::report::ConsoleReporter;
use crate::runner::{RunError, load_notebook};
use crate::suite::run_harness;

/// Resolve the configuration from the environment and apply CLI overrides.
pub fn harness_config(args: &RunArgs) -> CliResult<HarnessConfig> {
    let config = HarnessConfig::from_env(args.output_dir.clone())
        .map_err(|e| CliError::from_diagnostic(e, ExitCode::CONFIG))?;
    Ok(apply_overrides(config, args))
}

/// Apply the remaining `run` flags on top of an environment-derived configuration.
///
/// `--output-dir` is consumed while resolving, so an explicit directory never requires `HOME`.
pub fn apply_overrides(mut config: HarnessConfig, args: &RunArgs) -> HarnessConfig {
    if let Some(dir) = &args.input_dir {
        config = config.with_input_dir(dir);
    }
    if let Some(name) = &args.kernel_name {
        config = config.with_kernel_name(name);
    }
    if let Some(secs) = args.timeout {
        config = config.with_cell_timeout(Duration::from_secs(secs));
    }
    if let Some(secs) = args.startup_timeout {
        config.startup_timeout = Duration::from_secs(secs);
    }
    if let Some(command) = &args.diagnostic_command {
        config = config.with_diagnostic_command(command);
    }
    config
}

/// Provision the test kernel, run the suite and remove the kernel spec again.
pub fn run_notebooks(args: &RunArgs, verbose: bool) -> CliResult<ExitCode> {
    let config = harness_config(args)?;
    tracing::debug!(?config, "resolved configuration");

    let manager = KernelSpecManager::new(config.jupyter.clone());
    let provisioner = KernelProvisioner::new(manager.clone(), config.kernel_env.clone());
    let launcher = JupyterLauncher::new(manager).with_startup_timeout(config.startup_timeout);
    let mut reporter = ConsoleReporter::new(verbose);

    let runtime = runtime()?;
    match runtime.block_on(run_harness(&config, &provisioner, launcher, &mut reporter)) {
        Ok(summary) => {
            tracing::debug!(passed = summary.passed, restarted = summary.restarted, "suite passed");
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            let code = match &e {
                RunError::Provision(ProvisionError::Config(_)) => ExitCode::CONFIG,
                _ => ExitCode::FAILURE,
            };
            Err(CliError::from_diagnostic(e, code))
        }
    }
}

/// Install the test kernel spec (if missing) and print where it lives.
pub fn provision(kernel_name: Option<&str>) -> CliResult<ExitCode> {
    let config = harness_config(&RunArgs {
        kernel_name: kernel_name.map(str::to_string),
        ..RunArgs::default()
    })?;
    let manager = KernelSpecManager::new(config.jupyter.clone());
    let provisioner = KernelProvisioner::new(manager.clone(), config.kernel_env.clone());

    let code = |e: &ProvisionError| match e {
        ProvisionError::Config(_) => ExitCode::CONFIG,
        _ => ExitCode::FAILURE,
    };
    match provisioner.ensure(&config.kernel_name) {
        Ok(Some(installed)) => println!("Installed kernel spec {} in {}", config.kernel_name, installed.display()),
        Ok(None) => {
            let found = manager
                .find(&config.kernel_name)
                .map_err(|e| CliError::from_diagnostic(e, ExitCode::FAILURE))?;
            println!(
                "Kernel spec {} already installed in {}",
                config.kernel_name,
                found.resource_dir.display()
            );
        }
        Err(e) => {
            let exit_code = code(&e);
            return Err(CliError::from_diagnostic(e, exit_code));
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// Compare the code cell outputs of two notebooks.
pub fn compare(expected: &Path, actual: &Path) -> CliResult<ExitCode> {
    let expected_nb = load_notebook(expected).map_err(|e| CliError::from_diagnostic(e, ExitCode::FAILURE))?;
    let actual_nb = load_notebook(actual).map_err(|e| CliError::from_diagnostic(e, ExitCode::FAILURE))?;

    let comparison =
        compare_notebooks(&expected_nb, &actual_nb).map_err(|e| CliError::from_diagnostic(e, ExitCode::FAILURE))?;

    for mismatch in &comparison.mismatches {
        eprintln!("{:?}", miette::Report::new(mismatch.clone()));
    }
    eprintln!(
        "{} checked, {} skipped, {} mismatched",
        comparison.checked,
        comparison.skipped,
        comparison.mismatches.len()
    );

    if comparison.is_match() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

fn runtime() -> CliResult<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| CliError::failure(format!("Error starting async runtime: {e}")))
}
