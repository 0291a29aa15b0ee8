//! Collaborator trait definitions
//!
//! The pipeline never shells out itself. It talks to four collaborators:
//! - `EnvironmentManager`: named environment lifecycle, package lists, exports
//! - `ToolchainInstaller`: adds/removes the compiler package set
//! - `SecondaryResolver`: lockfile-driven dependency manager (poetry)
//! - `Archiver`: packs an environment into a relocatable archive
//!
//! All traits are async and backend-agnostic. `envpack-tools` provides the
//! conda/poetry/conda-pack implementations; in-memory fakes live in
//! [`crate::fakes`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::ToolError;
use crate::package::PackageRecord;

/// Result type for collaborator calls
pub type ToolResult<T> = std::result::Result<T, ToolError>;

/// How package installs should resolve artifacts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallMode {
    #[default]
    Default,

    /// Prefer already-cached binaries and keep logging short. Used after the
    /// isolation boundary, where everything has been fetched once already.
    PreferCached,
}

/// Per-call view of the pipeline context handed to collaborators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Target environment name
    pub env_name: String,

    pub install_mode: InstallMode,

    pub quiet: bool,

    /// Environment variables to set on spawned processes
    pub env_vars: BTreeMap<String, String>,
}

impl Invocation {
    pub fn new(env_name: impl Into<String>) -> Self {
        Invocation {
            env_name: env_name.into(),
            install_mode: InstallMode::Default,
            quiet: false,
            env_vars: BTreeMap::new(),
        }
    }
}

/// An activated environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentSession {
    pub name: String,

    /// Environment root directory
    pub prefix: PathBuf,
}

/// Outcome of a toolchain install as reported by the installer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallReport {
    /// Package names linked into the environment
    pub linked: Vec<String>,

    /// Package names unlinked (replaced) by the install
    pub unlinked: Vec<String>,
}

/// Result of a command run inside the environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    /// Command line as displayed to the user
    pub command: String,

    /// Exit code (0 = success, -1 = killed or never started)
    pub exit_code: i32,

    pub stdout: String,

    pub stderr: String,

    /// Duration in milliseconds
    pub duration_ms: u64,

    pub success: bool,
}

impl CommandResult {
    /// Whether this command passed (exit code 0).
    pub fn passed(&self) -> bool {
        self.success && self.exit_code == 0
    }

    /// A command that could not be started at all.
    pub fn not_started(command: impl Into<String>, reason: impl Into<String>) -> Self {
        CommandResult {
            command: command.into(),
            exit_code: -1,
            stdout: String::new(),
            stderr: reason.into(),
            duration_ms: 0,
            success: false,
        }
    }
}

/// Request to pack an environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackRequest {
    /// Archive file to write
    pub destination: PathBuf,

    /// Top-level directory inside the archive; `None` packs at the root
    pub arcroot: Option<String>,

    /// gzip level 0-9
    pub compress_level: Option<u8>,

    /// Overwrite an existing archive
    pub force: bool,
}

/// Named environment lifecycle.
#[async_trait]
pub trait EnvironmentManager: Send + Sync {
    /// Remove the environment. Removing a missing environment succeeds.
    async fn remove(&self, inv: &Invocation) -> ToolResult<()>;

    /// Create an empty environment.
    async fn create(&self, inv: &Invocation) -> ToolResult<()>;

    /// Activate the environment and report its root.
    async fn activate(&self, inv: &Invocation) -> ToolResult<EnvironmentSession>;

    async fn deactivate(&self, session: &EnvironmentSession) -> ToolResult<()>;

    /// Drop the implicit `defaults` channel from the environment's config.
    async fn remove_default_channel(&self, inv: &Invocation) -> ToolResult<()>;

    /// Merge a dependency file into the environment. Later calls override
    /// earlier declarations for the same package.
    async fn update(&self, inv: &Invocation, file: &Path) -> ToolResult<()>;

    /// Install plain package specs.
    async fn install_packages(&self, inv: &Invocation, packages: &[String]) -> ToolResult<()>;

    /// Installed packages; `None` when the manager reported nothing.
    async fn list(&self, inv: &Invocation) -> ToolResult<Option<Vec<PackageRecord>>>;

    /// Fully resolved manifest text.
    async fn export(&self, inv: &Invocation) -> ToolResult<String>;

    /// Run a program inside the environment. A non-zero exit is reported
    /// in the result, not as an error.
    async fn run(&self, inv: &Invocation, program: &str, args: &[String])
        -> ToolResult<CommandResult>;
}

/// Compiler toolchain installer.
#[async_trait]
pub trait ToolchainInstaller: Send + Sync {
    async fn install(&self, inv: &Invocation, packages: &[String]) -> ToolResult<InstallReport>;

    async fn uninstall(&self, inv: &Invocation, names: &[String], force: bool) -> ToolResult<()>;
}

/// Lockfile-driven secondary dependency manager.
#[async_trait]
pub trait SecondaryResolver: Send + Sync {
    /// Lockfile written into the project directory.
    fn lockfile_name(&self) -> &str {
        "poetry.lock"
    }

    /// Environment variable naming the resolver's cache directory.
    fn cache_dir_var(&self) -> &str {
        "POETRY_CACHE_DIR"
    }

    async fn get_config(&self, inv: &Invocation, project: &Path, key: &str)
        -> ToolResult<Option<String>>;

    async fn set_config(&self, inv: &Invocation, project: &Path, key: &str, value: &str)
        -> ToolResult<()>;

    async fn unset_config(&self, inv: &Invocation, project: &Path, key: &str) -> ToolResult<()>;

    /// Install from the lockfile.
    async fn install(&self, inv: &Invocation, project: &Path, no_dev: bool) -> ToolResult<()>;

    /// Re-resolve, rewrite the lockfile, and install.
    async fn update(&self, inv: &Invocation, project: &Path, no_dev: bool) -> ToolResult<()>;
}

/// Environment packer.
#[async_trait]
pub trait Archiver: Send + Sync {
    /// Pack the environment named in `inv`; returns the archive path.
    async fn pack(&self, inv: &Invocation, request: &PackRequest) -> ToolResult<PathBuf>;

    /// Extract `archive` into `target_dir` and make it usable in place.
    async fn unpack(&self, inv: &Invocation, archive: &Path, target_dir: &Path) -> ToolResult<()>;
}

/// The four collaborators a pipeline run needs.
#[derive(Clone)]
pub struct Collaborators {
    pub env: Arc<dyn EnvironmentManager>,
    pub toolchain: Arc<dyn ToolchainInstaller>,
    pub resolver: Arc<dyn SecondaryResolver>,
    pub archiver: Arc<dyn Archiver>,
}

impl Collaborators {
    pub fn new(
        env: Arc<dyn EnvironmentManager>,
        toolchain: Arc<dyn ToolchainInstaller>,
        resolver: Arc<dyn SecondaryResolver>,
        archiver: Arc<dyn Archiver>,
    ) -> Self {
        Collaborators {
            env,
            toolchain,
            resolver,
            archiver,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_result_passed() {
        let result = CommandResult {
            command: "echo hi".to_string(),
            exit_code: 0,
            stdout: "hi\n".to_string(),
            stderr: String::new(),
            duration_ms: 3,
            success: true,
        };
        assert!(result.passed());
    }

    #[test]
    fn test_command_result_not_started() {
        let result = CommandResult::not_started("missing-bin", "No such file or directory");
        assert!(!result.passed());
        assert_eq!(result.exit_code, -1);
    }

    #[test]
    fn test_invocation_defaults() {
        let inv = Invocation::new("demo");
        assert_eq!(inv.install_mode, InstallMode::Default);
        assert!(inv.env_vars.is_empty());
    }
}
