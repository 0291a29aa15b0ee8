//! envpack-tools: process-backed collaborators for envpack
//!
//! Implements the [`envpack`] collaborator traits by driving the real
//! command-line tools through `tokio::process`:
//!
//! - [`CondaEnvironmentManager`] and [`CondaToolchainInstaller`]: `conda`
//!   for queries, `mamba` for solves
//! - [`PoetryResolver`]: `poetry`, run inside the target environment
//! - [`CondaPackArchiver`]: `conda-pack` and `tar`
//!
//! Binary locations come from [`ToolPaths`], which reads `ENVPACK_*`
//! variables and falls back to bare names resolved on `PATH`.

pub mod conda;
pub mod conda_pack;
pub mod exec;
pub mod poetry;

pub use conda::{CondaEnvironmentManager, CondaToolchainInstaller};
pub use conda_pack::CondaPackArchiver;
pub use exec::ToolCommand;
pub use poetry::PoetryResolver;

use envpack::Collaborators;
use std::path::PathBuf;
use std::sync::Arc;

/// Locations of the external binaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolPaths {
    pub conda: PathBuf,

    /// Used for every solve (create, update, install, remove)
    pub mamba: PathBuf,

    pub poetry: PathBuf,

    pub conda_pack: PathBuf,

    pub tar: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        ToolPaths {
            conda: PathBuf::from("conda"),
            mamba: PathBuf::from("mamba"),
            poetry: PathBuf::from("poetry"),
            conda_pack: PathBuf::from("conda-pack"),
            tar: PathBuf::from("tar"),
        }
    }
}

impl ToolPaths {
    /// Defaults overridden by `ENVPACK_CONDA`, `ENVPACK_MAMBA`,
    /// `ENVPACK_POETRY`, `ENVPACK_CONDA_PACK` and `ENVPACK_TAR`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = ToolPaths::default();
        let pick = |key: &str, default: PathBuf| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or(default)
        };
        ToolPaths {
            conda: pick("ENVPACK_CONDA", defaults.conda),
            mamba: pick("ENVPACK_MAMBA", defaults.mamba),
            poetry: pick("ENVPACK_POETRY", defaults.poetry),
            conda_pack: pick("ENVPACK_CONDA_PACK", defaults.conda_pack),
            tar: pick("ENVPACK_TAR", defaults.tar),
        }
    }

    /// `(label, path)` pairs in display order.
    pub fn entries(&self) -> Vec<(&'static str, &PathBuf)> {
        vec![
            ("conda", &self.conda),
            ("mamba", &self.mamba),
            ("poetry", &self.poetry),
            ("conda-pack", &self.conda_pack),
            ("tar", &self.tar),
        ]
    }
}

/// Build the process-backed collaborator set.
pub fn collaborators(paths: &ToolPaths) -> Collaborators {
    Collaborators::new(
        Arc::new(CondaEnvironmentManager::new(paths.clone())),
        Arc::new(CondaToolchainInstaller::new(paths.clone())),
        Arc::new(PoetryResolver::new(paths.clone())),
        Arc::new(CondaPackArchiver::new(paths.clone())),
    )
}

/// Availability of one external binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolStatus {
    pub name: &'static str,
    pub path: PathBuf,
    /// First line of `--version` output; `None` when the tool did not run
    pub version: Option<String>,
}

impl ToolStatus {
    pub fn is_available(&self) -> bool {
        self.version.is_some()
    }
}

/// First line of `<tool> --version`, or `None` if it cannot be run.
pub async fn tool_version(name: &str, path: &PathBuf) -> Option<String> {
    let result = ToolCommand::new(name, "version", path)
        .arg("--version")
        .status()
        .await
        .ok()?;
    if !result.passed() {
        return None;
    }
    let text = if result.stdout.trim().is_empty() {
        &result.stderr
    } else {
        &result.stdout
    };
    Some(text.lines().next().unwrap_or_default().trim().to_string())
}

/// Probe every configured tool.
pub async fn check_tools(paths: &ToolPaths) -> Vec<ToolStatus> {
    let mut statuses = Vec::new();
    for (name, path) in paths.entries() {
        let version = tool_version(name, path).await;
        statuses.push(ToolStatus {
            name,
            path: path.clone(),
            version,
        });
    }
    statuses
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_tool_paths_defaults() {
        let paths = ToolPaths::from_lookup(|_| None);
        assert_eq!(paths, ToolPaths::default());
        assert_eq!(paths.conda_pack, PathBuf::from("conda-pack"));
    }

    #[test]
    fn test_tool_paths_overrides() {
        let vars: HashMap<&str, &str> = [
            ("ENVPACK_MAMBA", "/opt/micromamba/bin/micromamba"),
            ("ENVPACK_POETRY", "  "),
        ]
        .into_iter()
        .collect();
        let paths = ToolPaths::from_lookup(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(paths.mamba, PathBuf::from("/opt/micromamba/bin/micromamba"));
        // blank values fall back to the default
        assert_eq!(paths.poetry, PathBuf::from("poetry"));
    }

    #[tokio::test]
    async fn test_tool_version_missing_binary() {
        let path = PathBuf::from("/nonexistent/envpack-conda");
        assert_eq!(tool_version("conda", &path).await, None);
    }

    #[tokio::test]
    async fn test_check_tools_reports_each_entry() {
        let paths = ToolPaths {
            conda: PathBuf::from("/nonexistent/conda"),
            mamba: PathBuf::from("/nonexistent/mamba"),
            poetry: PathBuf::from("/nonexistent/poetry"),
            conda_pack: PathBuf::from("/nonexistent/conda-pack"),
            tar: PathBuf::from("/nonexistent/tar"),
        };
        let statuses = check_tools(&paths).await;
        assert_eq!(statuses.len(), 5);
        assert!(statuses.iter().all(|s| !s.is_available()));
        assert_eq!(statuses[3].name, "conda-pack");
    }
}
