//! The disposable test kernel.
//!
//! [`KernelProvisioner::ensure`] installs the test kernel spec only when it is missing, and reports the
//! installed directory so the caller can remove it again. [`KernelSpecGuard`] pairs the two: acquiring it runs
//! `ensure`, releasing it (explicitly, or on drop) deletes whatever was installed.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use miette::Diagnostic;
use thiserror::Error;

use super::{CONNECTION_FILE_PLACEHOLDER, KernelSpec, KernelSpecError, KernelSpecManager};
use crate::config::{ConfigError, KernelEnvironment};

/// py4j archive shipped with the supported Spark distribution.
const PY4J_ARCHIVE: &str = "python/lib/py4j-0.9-src.zip";

#[derive(Debug, Error, Diagnostic)]
pub enum ProvisionError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    KernelSpec(#[from] KernelSpecError),

    #[error("failed to stage kernel spec: {0}")]
    #[diagnostic(code(nbgolden::provision::staging))]
    Staging(#[source] std::io::Error),
}

/// Ensures the test kernel spec exists.
#[derive(Debug, Clone)]
pub struct KernelProvisioner {
    manager: KernelSpecManager,
    env: KernelEnvironment,
}

impl KernelProvisioner {
    pub fn new(manager: KernelSpecManager, env: KernelEnvironment) -> Self {
        Self { manager, env }
    }

    pub fn manager(&self) -> &KernelSpecManager {
        &self.manager
    }

    /// Make sure a kernel spec named `kernel_name` can be resolved.
    ///
    /// ## Returns
    /// - `Ok(None)` when the spec already exists; nothing was installed.
    /// - `Ok(Some(path))` with the directory that was installed; the caller owns its removal.
    ///
    /// ## Errors
    /// - Any resolution failure other than "no such kernel" is returned as is.
    /// - [`ConfigError::MissingVar`] when the spec has to be synthesized and a required variable is unset.
    #[tracing::instrument(skip(self))]
    pub fn ensure(&self, kernel_name: &str) -> Result<Option<PathBuf>, ProvisionError> {
        match self.manager.find(kernel_name) {
            Ok(found) => {
                tracing::info!(dir = %found.resource_dir.display(), "kernel spec already installed");
                Ok(None)
            }
            Err(KernelSpecError::NoSuchKernel(_)) => {
                let spec = synthesize_spec(kernel_name, &self.env)?;
                let staging = tempfile::Builder::new()
                    .prefix("nbgolden-kernelspec-")
                    .tempdir()
                    .map_err(ProvisionError::Staging)?;
                spec.write_to(staging.path())?;
                let installed = self.manager.install_for_user(staging.path(), kernel_name)?;
                discard_staging(staging);
                Ok(Some(installed))
            }
            Err(other) => Err(other.into()),
        }
    }
}

/// Remove the staging copy of an installed spec.
///
/// The installed directory is already the caller's to remove, so a failure here only warns.
fn discard_staging(staging: tempfile::TempDir) {
    let dir = staging.path().to_path_buf();
    if let Err(e) = staging.close() {
        tracing::warn!(dir = %dir.display(), error = %e, "failed to remove kernel spec staging dir");
    }
}

/// Build the kernel spec for the Spark-backed Python test kernel.
pub fn synthesize_spec(kernel_name: &str, env: &KernelEnvironment) -> Result<KernelSpec, ConfigError> {
    let spark_home = env.spark_home()?;
    let scala_home = env.scala_home()?;
    let home_dir = env.home_dir()?;
    let spark = spark_home.display();

    let mut vars = BTreeMap::new();
    vars.insert("SCALA_HOME".to_string(), scala_home.display().to_string());
    vars.insert("SPARK_HOME".to_string(), spark.to_string());
    vars.insert("PYTHONPATH".to_string(), format!("{spark}/python/:{spark}/{PY4J_ARCHIVE}"));
    vars.insert("PYTHONSTARTUP".to_string(), format!("{spark}/python/pyspark/shell.py"));
    vars.insert(
        "PYSPARK_SUBMIT_ARGS".to_string(),
        format!(
            "--driver-class-path {}/data/libs/* --master {} pyspark-shell",
            home_dir.display(),
            env.master
        ),
    );
    vars.insert("SPARK_DRIVER_MEMORY".to_string(), env.driver_memory.clone());
    vars.insert("SPARK_LOCAL_IP".to_string(), env.local_ip.clone());

    Ok(KernelSpec {
        argv: vec![
            env.python.clone(),
            "-m".to_string(),
            "ipykernel".to_string(),
            "-f".to_string(),
            CONNECTION_FILE_PLACEHOLDER.to_string(),
        ],
        display_name: kernel_name.to_string(),
        language: "python".to_string(),
        env: vars,
        interrupt_mode: None,
        metadata: None,
    })
}

/// Scoped ownership of a provisioned kernel spec.
///
/// Holds the installed directory (if `ensure` installed one) and removes it on [`release`](Self::release).
/// Dropping an unreleased guard removes it too, so unwinding and early returns are covered.
#[derive(Debug)]
#[must_use = "dropping the guard immediately removes the kernel spec it installed"]
pub struct KernelSpecGuard {
    installed: Option<PathBuf>,
}

impl KernelSpecGuard {
    pub fn acquire(provisioner: &KernelProvisioner, kernel_name: &str) -> Result<Self, ProvisionError> {
        let installed = provisioner.ensure(kernel_name)?;
        Ok(Self { installed })
    }

    /// The directory this guard installed, or `None` if the spec pre-existed.
    pub fn installed_path(&self) -> Option<&Path> {
        self.installed.as_deref()
    }

    /// Remove the installed spec.
    pub fn release(mut self) -> std::io::Result<()> {
        match self.installed.take() {
            Some(dir) => remove_spec_dir(&dir),
            None => Ok(()),
        }
    }
}

impl Drop for KernelSpecGuard {
    fn drop(&mut self) {
        if let Some(dir) = self.installed.take() {
            if let Err(e) = remove_spec_dir(&dir) {
                tracing::warn!(dir = %dir.display(), error = %e, "failed to remove kernel spec");
            }
        }
    }
}

fn remove_spec_dir(dir: &Path) -> std::io::Result<()> {
    tracing::info!(dir = %dir.display(), "removing kernel spec");
    match fs::remove_dir_all(dir) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JupyterPaths;

    fn spark_env() -> KernelEnvironment {
        KernelEnvironment {
            spark_home: Some(PathBuf::from("/opt/spark")),
            scala_home: Some(PathBuf::from("/opt/scala")),
            home_dir: Some(PathBuf::from("/home/ci")),
            ..KernelEnvironment::default()
        }
    }

    fn provisioner(data_dir: &Path, env: KernelEnvironment) -> KernelProvisioner {
        KernelProvisioner::new(KernelSpecManager::new(JupyterPaths::single(data_dir)), env)
    }

    #[test]
    fn test_synthesized_environment() {
        let spec = synthesize_spec("GoldenTest", &spark_env()).unwrap();
        assert_eq!(spec.argv, ["python", "-m", "ipykernel", "-f", "{connection_file}"]);
        assert_eq!(spec.env["SPARK_HOME"], "/opt/spark");
        assert_eq!(spec.env["SCALA_HOME"], "/opt/scala");
        assert_eq!(
            spec.env["PYTHONPATH"],
            "/opt/spark/python/:/opt/spark/python/lib/py4j-0.9-src.zip"
        );
        assert_eq!(spec.env["PYTHONSTARTUP"], "/opt/spark/python/pyspark/shell.py");
        assert_eq!(
            spec.env["PYSPARK_SUBMIT_ARGS"],
            "--driver-class-path /home/ci/data/libs/* --master local[10] pyspark-shell"
        );
        assert_eq!(spec.env["SPARK_DRIVER_MEMORY"], "10G");
        assert_eq!(spec.env["SPARK_LOCAL_IP"], "127.0.0.1");
    }

    #[test]
    fn test_synthesis_requires_spark_home() {
        let env = KernelEnvironment {
            spark_home: None,
            ..spark_env()
        };
        assert!(matches!(synthesize_spec("x", &env), Err(ConfigError::MissingVar("SPARK_HOME"))));
    }

    #[test]
    fn test_ensure_is_idempotent() {
        let data = tempfile::tempdir().unwrap();
        let provisioner = provisioner(data.path(), spark_env());

        let first = provisioner.ensure("GoldenTest").unwrap();
        let installed = first.expect("first call installs");
        assert!(installed.join("kernel.json").is_file());

        assert_eq!(provisioner.ensure("GoldenTest").unwrap(), None);
    }

    #[test]
    fn test_existing_spec_needs_no_environment() {
        let data = tempfile::tempdir().unwrap();
        provisioner(data.path(), spark_env()).ensure("GoldenTest").unwrap();

        let bare = provisioner(data.path(), KernelEnvironment::default());
        assert_eq!(bare.ensure("GoldenTest").unwrap(), None);
    }

    #[test]
    fn test_malformed_spec_propagates() {
        let data = tempfile::tempdir().unwrap();
        let dir = data.path().join("kernels").join("goldentest");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("kernel.json"), "[]").unwrap();

        let err = provisioner(data.path(), spark_env()).ensure("GoldenTest").unwrap_err();
        assert!(matches!(err, ProvisionError::KernelSpec(KernelSpecError::Malformed { .. })));
    }

    #[test]
    fn test_guard_release_removes_installed_spec() {
        let data = tempfile::tempdir().unwrap();
        let provisioner = provisioner(data.path(), spark_env());

        let guard = KernelSpecGuard::acquire(&provisioner, "GoldenTest").unwrap();
        let installed = guard.installed_path().unwrap().to_path_buf();
        assert!(installed.exists());
        guard.release().unwrap();
        assert!(!installed.exists());
    }

    #[test]
    fn test_guard_drop_removes_installed_spec() {
        let data = tempfile::tempdir().unwrap();
        let provisioner = provisioner(data.path(), spark_env());

        let installed = {
            let guard = KernelSpecGuard::acquire(&provisioner, "GoldenTest").unwrap();
            guard.installed_path().unwrap().to_path_buf()
        };
        assert!(!installed.exists());
    }

    #[test]
    fn test_guard_leaves_preexisting_spec_alone() {
        let data = tempfile::tempdir().unwrap();
        let provisioner = provisioner(data.path(), spark_env());
        let installed = provisioner.ensure("GoldenTest").unwrap().unwrap();

        let guard = KernelSpecGuard::acquire(&provisioner, "GoldenTest").unwrap();
        assert!(guard.installed_path().is_none());
        guard.release().unwrap();
        assert!(installed.exists());
    }

    #[test]
    fn test_staging_cleanup_failure_is_not_fatal() {
        let staging = tempfile::tempdir().unwrap();
        let dir = staging.path().to_path_buf();
        fs::remove_dir_all(&dir).unwrap();

        discard_staging(staging);
        assert!(!dir.exists());
    }
}
