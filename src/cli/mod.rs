//! CLI module for the notebook golden-output runner
//!
//! ## Commands
//!
//! - `run` (default) - Provision the test kernel, run every notebook, clean up
//! - `provision` - Install the test kernel spec and leave it installed
//! - `compare <EXPECTED> <ACTUAL>` - Compare two notebooks' outputs offline
//!
//! ## Design
//!
//! The CLI uses clap for argument parsing with derive macros.
//! Command functions return `CliResult<T>` instead of calling `process::exit`.
//! Only the top-level `run()` function handles errors and exits.

// Enforce explicit error handling - no panicking in production code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod commands;

use std::fmt;
use std::path::PathBuf;
use std::process;

use clap::{Args, Parser, Subcommand};

// ============================================================================
// CLI Error handling
// ============================================================================

/// Exit code for CLI operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCode(pub i32);

impl ExitCode {
    pub const SUCCESS: ExitCode = ExitCode(0);
    pub const FAILURE: ExitCode = ExitCode(1);
    /// Invalid configuration or environment.
    pub const CONFIG: ExitCode = ExitCode(2);
}

/// Error type for CLI operations.
///
/// Contains a user-facing message and an exit code. The CLI entry point
/// catches these errors, prints the message, and exits with the code.
#[derive(Debug)]
pub struct CliError {
    /// User-facing error message (already formatted for display)
    pub message: String,
    /// Exit code to return to the shell
    pub exit_code: ExitCode,
}

impl CliError {
    pub fn new(message: impl Into<String>, exit_code: ExitCode) -> Self {
        Self {
            message: message.into(),
            exit_code,
        }
    }

    /// Create a failure error (exit code 1).
    pub fn failure(message: impl Into<String>) -> Self {
        Self::new(message, ExitCode::FAILURE)
    }

    /// Render a diagnostic with miette and wrap it with `exit_code`.
    pub fn from_diagnostic<E>(error: E, exit_code: ExitCode) -> Self
    where
        E: miette::Diagnostic + Send + Sync + 'static,
    {
        let report = miette::Report::new(error);
        Self::new(format!("{report:?}"), exit_code)
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

/// Result type for CLI operations.
pub type CliResult<T> = Result<T, CliError>;

const VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// Clap CLI definition
// ============================================================================

/// Run Jupyter notebooks and compare their outputs against the stored ones
#[derive(Parser, Debug)]
#[command(name = "nbgolden")]
#[command(version = VERSION)]
#[command(about = "Golden-output test runner for Jupyter notebooks", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Report every written file
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Provision the test kernel and run every notebook in the input directory (default)
    Run(RunArgs),

    /// Install the test kernel spec if missing and keep it installed
    Provision {
        /// Kernel spec name
        #[arg(long, value_name = "NAME")]
        kernel_name: Option<String>,
    },

    /// Compare the code cell outputs of two notebooks without running a kernel
    Compare {
        /// Notebook holding the golden outputs
        #[arg(value_name = "EXPECTED")]
        expected: PathBuf,
        /// Notebook to check, typically a `.out` file
        #[arg(value_name = "ACTUAL")]
        actual: PathBuf,
    },
}

/// Overrides for the environment-derived configuration.
#[derive(Args, Debug, Default, Clone)]
pub struct RunArgs {
    /// Directory scanned for `*.ipynb` files [env: PIXIEDUST_TEST_INPUT]
    #[arg(long, value_name = "DIR")]
    pub input_dir: Option<PathBuf>,

    /// Directory receiving `<notebook>.out` files [default: $PIXIEDUST_TEST_OUTPUT/tests]
    #[arg(long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Kernel spec name used for every notebook
    #[arg(long, value_name = "NAME")]
    pub kernel_name: Option<String>,

    /// Per-cell execution timeout in seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Kernel startup timeout in seconds
    #[arg(long, value_name = "SECS")]
    pub startup_timeout: Option<u64>,

    /// Command run in place of a failing cell to fetch diagnostics
    #[arg(long, value_name = "CODE")]
    pub diagnostic_command: Option<String>,
}

// ============================================================================
// CLI entry point
// ============================================================================

/// Main CLI entry point.
///
/// This is the only place where `process::exit` is called. All command
/// implementations return `CliResult` and errors are handled here.
pub fn run() {
    let cli = Cli::parse();

    match execute(cli) {
        Ok(exit_code) => {
            if exit_code.0 != 0 {
                process::exit(exit_code.0);
            }
        }
        Err(e) => {
            if !e.message.is_empty() {
                eprintln!("{}", e.message);
            }
            process::exit(e.exit_code.0);
        }
    }
}

/// Execute the CLI command and return result.
fn execute(cli: Cli) -> CliResult<ExitCode> {
    match cli.command {
        Some(Command::Run(args)) => commands::run_notebooks(&args, cli.verbose),
        Some(Command::Provision { kernel_name }) => commands::provision(kernel_name.as_deref()),
        Some(Command::Compare { expected, actual }) => commands::compare(&expected, &actual),
        None => commands::run_notebooks(&RunArgs::default(), cli.verbose),
    }
}

// ============================================================================
// Tests
// ============================================================================
