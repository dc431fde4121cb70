//! Kernel specifications
//!
//! A kernel spec is a directory named after the kernel that holds a `kernel.json` describing how to launch
//! it. Specs live under `<data dir>/kernels/` for each Jupyter data directory; names are matched
//! case-insensitively and installed lowercased.
//!
//! - [`KernelSpecManager`]: lookup and per-user installation
//! - [`provisioner`]: the disposable test kernel (`ensure` + scoped cleanup)

pub mod provisioner;

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::config::JupyterPaths;

pub use provisioner::{KernelProvisioner, KernelSpecGuard, ProvisionError};

pub const KERNEL_JSON: &str = "kernel.json";
/// Placeholder in `argv` replaced with the connection file path at launch.
pub const CONNECTION_FILE_PLACEHOLDER: &str = "{connection_file}";

#[derive(Debug, Error, Diagnostic)]
pub enum KernelSpecError {
    #[error("no such kernel named {0}")]
    #[diagnostic(code(nbgolden::kernelspec::not_found), help("install it with `nbgolden provision`"))]
    NoSuchKernel(String),

    #[error("invalid kernel name `{0}`: only ASCII letters, digits, `.`, `_` and `-` are allowed")]
    #[diagnostic(code(nbgolden::kernelspec::invalid_name))]
    InvalidName(String),

    #[error("malformed kernel spec {path}: {source}")]
    #[diagnostic(code(nbgolden::kernelspec::malformed))]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("kernel spec I/O error at {path}: {source}")]
    #[diagnostic(code(nbgolden::kernelspec::io))]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl KernelSpecError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Contents of `kernel.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelSpec {
    pub argv: Vec<String>,
    pub display_name: String,
    #[serde(default)]
    pub language: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interrupt_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl KernelSpec {
    /// The launch command with the connection file substituted into `argv`.
    pub fn command_line(&self, connection_file: &Path) -> Vec<String> {
        let connection_file = connection_file.to_string_lossy();
        self.argv
            .iter()
            .map(|arg| arg.replace(CONNECTION_FILE_PLACEHOLDER, &connection_file))
            .collect()
    }

    /// Write this spec as `kernel.json` into `dir`, creating the directory.
    pub fn write_to(&self, dir: &Path) -> Result<PathBuf, KernelSpecError> {
        fs::create_dir_all(dir).map_err(|e| KernelSpecError::io(dir, e))?;
        let path = dir.join(KERNEL_JSON);
        let json = serde_json::to_string_pretty(self).map_err(|source| KernelSpecError::Malformed {
            path: path.clone(),
            source,
        })?;
        fs::write(&path, json).map_err(|e| KernelSpecError::io(&path, e))?;
        Ok(path)
    }

    pub fn read_from(dir: &Path) -> Result<Self, KernelSpecError> {
        let path = dir.join(KERNEL_JSON);
        let text = fs::read_to_string(&path).map_err(|e| KernelSpecError::io(&path, e))?;
        serde_json::from_str(&text).map_err(|source| KernelSpecError::Malformed { path, source })
    }
}

/// A kernel spec found on disk.
#[derive(Debug, Clone)]
pub struct ResolvedKernelSpec {
    pub name: String,
    pub resource_dir: PathBuf,
    pub spec: KernelSpec,
}

/// Finds and installs kernel specs in the Jupyter data directories.
#[derive(Debug, Clone)]
pub struct KernelSpecManager {
    paths: JupyterPaths,
}

impl KernelSpecManager {
    pub fn new(paths: JupyterPaths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &JupyterPaths {
        &self.paths
    }

    /// Resolve a kernel spec by name.
    ///
    /// ## Errors
    /// - [`KernelSpecError::NoSuchKernel`] when no data directory has a spec directory with that name.
    /// - [`KernelSpecError::Malformed`] / [`KernelSpecError::Io`] when a directory exists but its
    ///   `kernel.json` cannot be read.
    #[tracing::instrument(skip(self))]
    pub fn find(&self, name: &str) -> Result<ResolvedKernelSpec, KernelSpecError> {
        let wanted = name.to_lowercase();
        for kernels_dir in self.paths.kernel_dirs() {
            let resource_dir = kernels_dir.join(&wanted);
            if !resource_dir.join(KERNEL_JSON).is_file() {
                continue;
            }
            tracing::debug!(dir = %resource_dir.display(), "found kernel spec");
            let spec = KernelSpec::read_from(&resource_dir)?;
            return Ok(ResolvedKernelSpec {
                name: wanted,
                resource_dir,
                spec,
            });
        }
        Err(KernelSpecError::NoSuchKernel(name.to_string()))
    }

    /// Copy a staged spec directory into the user kernels directory as `name`.
    ///
    /// An existing spec with the same name is replaced. Returns the installed directory.
    #[tracing::instrument(skip(self, source_dir))]
    pub fn install_for_user(&self, source_dir: &Path, name: &str) -> Result<PathBuf, KernelSpecError> {
        if !is_valid_kernel_name(name) {
            return Err(KernelSpecError::InvalidName(name.to_string()));
        }
        let dest = self.paths.user_kernels_dir().join(name.to_lowercase());
        if dest.exists() {
            tracing::info!(dest = %dest.display(), "replacing existing kernel spec");
            fs::remove_dir_all(&dest).map_err(|e| KernelSpecError::io(&dest, e))?;
        }
        copy_dir(source_dir, &dest)?;
        tracing::info!(dest = %dest.display(), "installed kernel spec");
        Ok(dest)
    }
}

/// Kernel names are restricted to ASCII alphanumerics plus `.`, `_` and `-`.
pub fn is_valid_kernel_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

fn copy_dir(from: &Path, to: &Path) -> Result<(), KernelSpecError> {
    fs::create_dir_all(to).map_err(|e| KernelSpecError::io(to, e))?;
    let entries = fs::read_dir(from).map_err(|e| KernelSpecError::io(from, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| KernelSpecError::io(from, e))?;
        let src = entry.path();
        let dst = to.join(entry.file_name());
        if src.is_dir() {
            copy_dir(&src, &dst)?;
        } else {
            fs::copy(&src, &dst).map_err(|e| KernelSpecError::io(&src, e))?;
        }
    }
    Ok(())
}
