//! Progress reporting
//!
//! The runner and the suite driver never print directly; they call a [`RunReporter`]. [`ConsoleReporter`]
//! is the default and writes the familiar console transcript (file names, the restart notice, the diagnostic
//! banner and log text, a final summary). Other formats implement the trait.

use std::path::Path;
use std::time::Duration;

/// Printed before the diagnostic command's output when a cell fails.
pub const DIAGNOSTIC_BANNER: &str = "An error occurred executing the last cell. Fetching pixiedust log...";
/// Printed when a notebook asks for a kernel restart.
pub const RESTART_NOTICE: &str = "restarting kernel...";

/// How one notebook ended.
#[derive(Debug, Clone, PartialEq)]
pub enum NotebookResult {
    Passed(Duration),
    /// Passed on the single rerun after a restart request.
    PassedAfterRestart(Duration),
    Failed(Duration, String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub discovered: usize,
    pub passed: usize,
    pub failed: usize,
    pub restarted: usize,
    pub duration: Duration,
}

impl RunSummary {
    pub fn record(&mut self, result: &NotebookResult) {
        match result {
            NotebookResult::Passed(_) => self.passed += 1,
            NotebookResult::PassedAfterRestart(_) => {
                self.passed += 1;
                self.restarted += 1;
            }
            NotebookResult::Failed(..) => self.failed += 1,
        }
    }

    /// Notebooks never reached because an earlier one halted the suite.
    pub fn not_run(&self) -> usize {
        self.discovered.saturating_sub(self.passed + self.failed)
    }
}

/// Receives runner and suite events.
pub trait RunReporter {
    /// Called once the input directory has been scanned
    fn on_discovery_complete(&mut self, _input_dir: &Path, _notebooks: &[std::path::PathBuf]) {}

    /// Called before the first pass over a notebook
    fn on_notebook_start(&mut self, path: &Path);

    /// Called when a pass is abandoned because an output asked for a kernel restart
    fn on_restart_requested(&mut self, _path: &Path) {}

    /// Called with the text of the diagnostic command's first output after a cell failure
    fn on_diagnostic_output(&mut self, text: &str);

    /// Called after the executed notebook was written
    fn on_persisted(&mut self, _path: &Path) {}

    fn on_notebook_complete(&mut self, path: &Path, result: &NotebookResult);

    fn on_run_complete(&mut self, summary: &RunSummary);
}

/// Default console reporter.
#[derive(Debug, Default)]
pub struct ConsoleReporter {
    pub verbose: bool,
}

impl ConsoleReporter {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl RunReporter for ConsoleReporter {
    fn on_discovery_complete(&mut self, input_dir: &Path, notebooks: &[std::path::PathBuf]) {
        if notebooks.is_empty() {
            eprintln!("No notebooks found in {}", input_dir.display());
        }
    }

    fn on_notebook_start(&mut self, path: &Path) {
        println!("{}", file_name(path));
    }

    fn on_restart_requested(&mut self, _path: &Path) {
        println!("{RESTART_NOTICE}");
    }

    fn on_diagnostic_output(&mut self, text: &str) {
        println!("{DIAGNOSTIC_BANNER}");
        println!("{text}");
    }

    fn on_persisted(&mut self, path: &Path) {
        if self.verbose {
            eprintln!("wrote {}", path.display());
        }
    }

    fn on_notebook_complete(&mut self, path: &Path, result: &NotebookResult) {
        let status = match result {
            NotebookResult::Passed(d) => format!("\x1b[32mPASSED\x1b[0m ({:.0}ms)", d.as_millis()),
            NotebookResult::PassedAfterRestart(d) => {
                format!("\x1b[32mPASSED\x1b[0m after restart ({:.0}ms)", d.as_millis())
            }
            NotebookResult::Failed(d, _) => format!("\x1b[31mFAILED\x1b[0m ({:.0}ms)", d.as_millis()),
        };
        eprintln!("{} {}", path.display(), status);

        if let NotebookResult::Failed(_, error) = result {
            eprintln!("\x1b[31m{error}\x1b[0m");
        }
    }

    fn on_run_complete(&mut self, summary: &RunSummary) {
        let mut parts = Vec::new();
        if summary.passed > 0 {
            parts.push(format!("\x1b[32m{} passed\x1b[0m", summary.passed));
        }
        if summary.failed > 0 {
            parts.push(format!("\x1b[31m{} failed\x1b[0m", summary.failed));
        }
        if summary.restarted > 0 {
            parts.push(format!("{} restarted", summary.restarted));
        }
        if summary.not_run() > 0 {
            parts.push(format!("\x1b[33m{} not run\x1b[0m", summary.not_run()));
        }
        if parts.is_empty() {
            parts.push("no notebooks".to_string());
        }
        eprintln!(
            "=================== {} in {:.2}s ===================",
            parts.join(", "),
            summary.duration.as_secs_f64()
        );
    }
}

/// Reporter that stores every event, for tests and for callers that render their own output.
#[derive(Debug, Default)]
pub struct RecordingReporter {
    pub events: Vec<String>,
    pub diagnostics: Vec<String>,
    pub results: Vec<NotebookResult>,
    pub summary: Option<RunSummary>,
}

impl RunReporter for RecordingReporter {
    fn on_discovery_complete(&mut self, _input_dir: &Path, notebooks: &[std::path::PathBuf]) {
        self.events.push(format!("discovered {}", notebooks.len()));
    }

    fn on_notebook_start(&mut self, path: &Path) {
        self.events.push(format!("start {}", file_name(path)));
    }

    fn on_restart_requested(&mut self, path: &Path) {
        self.events.push(format!("restart {}", file_name(path)));
    }

    fn on_diagnostic_output(&mut self, text: &str) {
        self.events.push("diagnostic".to_string());
        self.diagnostics.push(text.to_string());
    }

    fn on_persisted(&mut self, path: &Path) {
        self.events.push(format!("persisted {}", file_name(path)));
    }

    fn on_notebook_complete(&mut self, path: &Path, result: &NotebookResult) {
        let status = match result {
            NotebookResult::Passed(_) => "passed",
            NotebookResult::PassedAfterRestart(_) => "passed after restart",
            NotebookResult::Failed(..) => "failed",
        };
        self.events.push(format!("{status} {}", file_name(path)));
        self.results.push(result.clone());
    }

    fn on_run_complete(&mut self, summary: &RunSummary) {
        self.summary = Some(summary.clone());
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_counts() {
        let mut summary = RunSummary {
            discovered: 4,
            ..RunSummary::default()
        };
        summary.record(&NotebookResult::Passed(Duration::ZERO));
        summary.record(&NotebookResult::PassedAfterRestart(Duration::ZERO));
        summary.record(&NotebookResult::Failed(Duration::ZERO, "boom".into()));

        assert_eq!(summary.passed, 2);
        assert_eq!(summary.restarted, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.not_run(), 1);
    }
}
