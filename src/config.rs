//! Harness configuration
//!
//! Everything the provisioner and the runner read from the process environment is resolved once, here, into
//! a [`HarnessConfig`]. The CLI then overrides individual fields from flags.
//!
//! ## Environment
//!
//! | Variable                | Required               | Default                 |
//! |-------------------------|------------------------|-------------------------|
//! | `PIXIEDUST_TEST_INPUT`  | no                     | `./tests`               |
//! | `PIXIEDUST_TEST_OUTPUT` | no                     | `$HOME/pixiedust`       |
//! | `SPARK_HOME`            | only to synthesize     | none                    |
//! | `SCALA_HOME`            | only to synthesize     | none                    |
//! | `HOME`                  | no                     | `dirs::home_dir()`      |
//! | `JUPYTER_DATA_DIR`      | no                     | `<data dir>/jupyter`    |
//! | `JUPYTER_PATH`          | no                     | empty                   |
//! | `XDG_DATA_HOME`         | no                     | `dirs::data_dir()`      |
//!
//! The output directory is `<output root>/tests` unless the CLI names one, in which case the output root is
//! never resolved.

use std::path::{Path, PathBuf};
use std::time::Duration;

use miette::Diagnostic;
use thiserror::Error;

/// Name of the disposable kernel spec the notebooks are bound to.
pub const DEFAULT_KERNEL_NAME: &str = "PixiedustTravisTest";
pub const DEFAULT_INPUT_DIR: &str = "./tests";
/// Directory under `$HOME` used when no output root is configured.
pub const DEFAULT_OUTPUT_ROOT: &str = "pixiedust";
pub const OUTPUT_SUBDIR: &str = "tests";
pub const DEFAULT_CELL_TIMEOUT: Duration = Duration::from_secs(3600);
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(60);
/// Cell source executed in place of a failing cell to fetch the kernel-side debug log.
pub const DEFAULT_DIAGNOSTIC_COMMAND: &str = "%pixiedustLog -l debug";

/// Environment variable names.
pub mod vars {
    pub const INPUT_DIR: &str = "PIXIEDUST_TEST_INPUT";
    pub const OUTPUT_ROOT: &str = "PIXIEDUST_TEST_OUTPUT";
    pub const SPARK_HOME: &str = "SPARK_HOME";
    pub const SCALA_HOME: &str = "SCALA_HOME";
    pub const HOME: &str = "HOME";
    pub const JUPYTER_DATA_DIR: &str = "JUPYTER_DATA_DIR";
    pub const JUPYTER_PATH: &str = "JUPYTER_PATH";
    pub const XDG_DATA_HOME: &str = "XDG_DATA_HOME";
}

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("environment variable `{0}` must be set")]
    #[diagnostic(code(nbgolden::config::missing_var))]
    MissingVar(&'static str),
}

/// Resolved configuration for one harness invocation.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub kernel_name: String,
    pub input_dir: PathBuf,
    /// Final directory receiving `<notebook>.out` files.
    pub output_dir: PathBuf,
    pub cell_timeout: Duration,
    pub startup_timeout: Duration,
    pub diagnostic_command: String,
    pub kernel_env: KernelEnvironment,
    pub jupyter: JupyterPaths,
}

impl HarnessConfig {
    /// Resolve the configuration from the process environment and the platform directories.
    ///
    /// `output_dir` replaces `<output root>/tests` when given.
    pub fn from_env(output_dir: Option<PathBuf>) -> Result<Self, ConfigError> {
        Self::resolve(|key| std::env::var(key).ok(), &PlatformDirs::detect(), output_dir)
    }

    /// Resolve the configuration from an arbitrary variable lookup, without platform fallbacks.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        Self::resolve(lookup, &PlatformDirs::default(), None)
    }

    /// ## Errors
    /// - [`ConfigError::MissingVar`] for `HOME` when neither `output_dir`, the output root nor a home directory
    ///   is available.
    pub fn resolve(
        lookup: impl Fn(&str) -> Option<String>,
        platform: &PlatformDirs,
        output_dir: Option<PathBuf>,
    ) -> Result<Self, ConfigError> {
        let home_dir = lookup(vars::HOME)
            .map(PathBuf::from)
            .or_else(|| platform.home_dir.clone());

        let input_dir = lookup(vars::INPUT_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_INPUT_DIR));

        let output_dir = match (output_dir, lookup(vars::OUTPUT_ROOT)) {
            (Some(dir), _) => dir,
            (None, Some(root)) => PathBuf::from(root).join(OUTPUT_SUBDIR),
            (None, None) => home_dir
                .as_ref()
                .map(|home| home.join(DEFAULT_OUTPUT_ROOT).join(OUTPUT_SUBDIR))
                .ok_or(ConfigError::MissingVar(vars::HOME))?,
        };

        Ok(Self {
            kernel_name: DEFAULT_KERNEL_NAME.to_string(),
            input_dir,
            output_dir,
            cell_timeout: DEFAULT_CELL_TIMEOUT,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            diagnostic_command: DEFAULT_DIAGNOSTIC_COMMAND.to_string(),
            kernel_env: KernelEnvironment {
                spark_home: lookup(vars::SPARK_HOME).map(PathBuf::from),
                scala_home: lookup(vars::SCALA_HOME).map(PathBuf::from),
                home_dir,
                ..KernelEnvironment::default()
            },
            jupyter: JupyterPaths::resolve(&lookup, platform),
        })
    }

    pub fn with_kernel_name(mut self, name: impl Into<String>) -> Self {
        self.kernel_name = name.into();
        self
    }

    pub fn with_input_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.input_dir = dir.into();
        self
    }

    pub fn with_cell_timeout(mut self, timeout: Duration) -> Self {
        self.cell_timeout = timeout;
        self
    }

    pub fn with_diagnostic_command(mut self, command: impl Into<String>) -> Self {
        self.diagnostic_command = command.into();
        self
    }
}

/// Directories the platform reports, used when the environment does not name them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlatformDirs {
    pub home_dir: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
}

impl PlatformDirs {
    pub fn detect() -> Self {
        Self {
            home_dir: dirs::home_dir(),
            data_dir: dirs::data_dir(),
        }
    }
}

/// Inputs for synthesizing the test kernel spec.
#[derive(Debug, Clone)]
pub struct KernelEnvironment {
    pub spark_home: Option<PathBuf>,
    pub scala_home: Option<PathBuf>,
    pub home_dir: Option<PathBuf>,
    /// Interpreter that runs `-m ipykernel`.
    pub python: String,
    pub driver_memory: String,
    pub master: String,
    pub local_ip: String,
}

impl Default for KernelEnvironment {
    fn default() -> Self {
        Self {
            spark_home: None,
            scala_home: None,
            home_dir: None,
            python: "python".to_string(),
            driver_memory: "10G".to_string(),
            master: "local[10]".to_string(),
            local_ip: "127.0.0.1".to_string(),
        }
    }
}

impl KernelEnvironment {
    pub fn spark_home(&self) -> Result<&Path, ConfigError> {
        self.spark_home.as_deref().ok_or(ConfigError::MissingVar(vars::SPARK_HOME))
    }

    pub fn scala_home(&self) -> Result<&Path, ConfigError> {
        self.scala_home.as_deref().ok_or(ConfigError::MissingVar(vars::SCALA_HOME))
    }

    pub fn home_dir(&self) -> Result<&Path, ConfigError> {
        self.home_dir.as_deref().ok_or(ConfigError::MissingVar(vars::HOME))
    }
}

/// Jupyter data directories, in lookup priority order.
#[derive(Debug, Clone, PartialEq)]
pub struct JupyterPaths {
    /// Per-user data directory; kernel specs are installed under its `kernels/`.
    pub user_data_dir: PathBuf,
    /// Every data directory searched for kernel specs, user directory included.
    pub data_dirs: Vec<PathBuf>,
}

impl JupyterPaths {
    /// `JUPYTER_DATA_DIR`, else `<XDG_DATA_HOME or platform data dir>/jupyter`.
    pub fn resolve(lookup: impl Fn(&str) -> Option<String>, platform: &PlatformDirs) -> Self {
        let user_data_dir = match lookup(vars::JUPYTER_DATA_DIR) {
            Some(dir) => PathBuf::from(dir),
            None => {
                let data_dir = lookup(vars::XDG_DATA_HOME)
                    .filter(|xdg| !xdg.is_empty())
                    .map(PathBuf::from)
                    .or_else(|| platform.data_dir.clone())
                    .unwrap_or_default();
                data_dir.join("jupyter")
            }
        };

        let mut data_dirs: Vec<PathBuf> = lookup(vars::JUPYTER_PATH)
            .map(|path| std::env::split_paths(&path).filter(|p| !p.as_os_str().is_empty()).collect())
            .unwrap_or_default();
        data_dirs.push(user_data_dir.clone());
        if cfg!(unix) {
            data_dirs.push(PathBuf::from("/usr/local/share/jupyter"));
            data_dirs.push(PathBuf::from("/usr/share/jupyter"));
        }

        Self {
            user_data_dir,
            data_dirs,
        }
    }

    /// A single data directory used both for installs and lookups.
    pub fn single(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            user_data_dir: dir.clone(),
            data_dirs: vec![dir],
        }
    }

    pub fn user_kernels_dir(&self) -> PathBuf {
        self.user_data_dir.join("kernels")
    }

    pub fn kernel_dirs(&self) -> impl Iterator<Item = PathBuf> + '_ {
        self.data_dirs.iter().map(|dir| dir.join("kernels"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    fn platform() -> PlatformDirs {
        PlatformDirs {
            home_dir: Some(PathBuf::from("/users/ci")),
            data_dir: Some(PathBuf::from("/users/ci/.data")),
        }
    }

    #[test]
    fn test_defaults_from_home() {
        let config = HarnessConfig::from_lookup(lookup(&[("HOME", "/home/ci")])).unwrap();
        assert_eq!(config.kernel_name, DEFAULT_KERNEL_NAME);
        assert_eq!(config.input_dir, PathBuf::from("./tests"));
        assert_eq!(config.output_dir, PathBuf::from("/home/ci/pixiedust/tests"));
        assert_eq!(config.cell_timeout, Duration::from_secs(3600));
        assert_eq!(config.diagnostic_command, "%pixiedustLog -l debug");
        assert!(config.kernel_env.spark_home.is_none());
    }

    #[test]
    fn test_overrides_from_environment() {
        let config = HarnessConfig::from_lookup(lookup(&[
            ("PIXIEDUST_TEST_INPUT", "/work/notebooks"),
            ("PIXIEDUST_TEST_OUTPUT", "/tmp/out"),
            ("SPARK_HOME", "/opt/spark"),
        ]))
        .unwrap();
        assert_eq!(config.input_dir, PathBuf::from("/work/notebooks"));
        assert_eq!(config.output_dir, PathBuf::from("/tmp/out/tests"));
        assert_eq!(config.kernel_env.spark_home().unwrap(), Path::new("/opt/spark"));
        assert!(matches!(config.kernel_env.scala_home(), Err(ConfigError::MissingVar("SCALA_HOME"))));
    }

    #[test]
    fn test_missing_home_without_output_root_is_an_error() {
        let err = HarnessConfig::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingVar("HOME")));
    }

    #[test]
    fn test_builder_overrides() {
        let config = HarnessConfig::from_lookup(lookup(&[("HOME", "/h")]))
            .unwrap()
            .with_kernel_name("other")
            .with_cell_timeout(Duration::from_secs(5));
        assert_eq!(config.kernel_name, "other");
        assert_eq!(config.cell_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_jupyter_data_dir_wins() {
        let paths = JupyterPaths::resolve(lookup(&[("JUPYTER_DATA_DIR", "/data/jupyter")]), &platform());
        assert_eq!(paths.user_data_dir, PathBuf::from("/data/jupyter"));
        assert_eq!(paths.user_kernels_dir(), PathBuf::from("/data/jupyter/kernels"));
        assert_eq!(paths.data_dirs[0], PathBuf::from("/data/jupyter"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_jupyter_path_entries_searched_first() {
        let paths = JupyterPaths::resolve(
            lookup(&[("JUPYTER_PATH", "/a:/b"), ("XDG_DATA_HOME", "/xdg")]),
            &platform(),
        );
        assert_eq!(
            paths.data_dirs[..3],
            [PathBuf::from("/a"), PathBuf::from("/b"), PathBuf::from("/xdg/jupyter")]
        );
    }

    #[test]
    fn test_home_falls_back_to_platform() {
        let config = HarnessConfig::resolve(lookup(&[]), &platform(), None).unwrap();
        assert_eq!(config.output_dir, PathBuf::from("/users/ci/pixiedust/tests"));
        assert_eq!(config.kernel_env.home_dir().unwrap(), Path::new("/users/ci"));
        assert_eq!(config.jupyter.user_data_dir, PathBuf::from("/users/ci/.data/jupyter"));
    }

    #[test]
    fn test_explicit_output_dir_needs_no_home() {
        let config =
            HarnessConfig::resolve(lookup(&[]), &PlatformDirs::default(), Some(PathBuf::from("/x"))).unwrap();
        assert_eq!(config.output_dir, PathBuf::from("/x"));
        assert!(config.kernel_env.home_dir.is_none());
    }

    #[test]
    fn test_explicit_output_dir_beats_output_root() {
        let config = HarnessConfig::resolve(
            lookup(&[("PIXIEDUST_TEST_OUTPUT", "/root-out")]),
            &PlatformDirs::default(),
            Some(PathBuf::from("/x")),
        )
        .unwrap();
        assert_eq!(config.output_dir, PathBuf::from("/x"));
    }
}
