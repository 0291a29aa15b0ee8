//! Compiler toolchain lifecycle.
//!
//! Tracks which packages a toolchain install actually introduced so they can
//! be removed again without touching packages the environment already had.

use crate::collaborators::{EnvironmentManager, Invocation, ToolchainInstaller};
use crate::package::{is_runtime_library, PackageDiff};
use crate::Result;
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::{debug, info};

/// Toolchain bookkeeping for one pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ToolchainState {
    /// Present in the current environment
    pub installed: bool,

    /// Installed at some point this run and still owed a removal
    pub temporary: bool,

    /// Packages newly linked by the last install, minus runtime libraries
    pub added_packages: BTreeSet<String>,
}

impl ToolchainState {
    /// Packages an uninstall would remove. Runtime libraries never qualify.
    pub fn removal_targets(&self) -> Vec<String> {
        self.added_packages
            .iter()
            .filter(|name| !is_runtime_library(name))
            .cloned()
            .collect()
    }
}

/// Stateful wrapper around a [`ToolchainInstaller`].
#[derive(Debug, Clone)]
pub struct Toolchain {
    packages: Vec<String>,
    state: ToolchainState,
}

impl Toolchain {
    pub fn new(packages: Vec<String>) -> Self {
        Toolchain {
            packages,
            state: ToolchainState::default(),
        }
    }

    pub fn state(&self) -> &ToolchainState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut ToolchainState {
        &mut self.state
    }

    pub fn packages(&self) -> &[String] {
        &self.packages
    }

    /// Install the toolchain unless it is already present.
    ///
    /// The package list is read before and after so that only packages the
    /// install introduced are recorded for removal.
    pub async fn install(
        &mut self,
        installer: &dyn ToolchainInstaller,
        env: &dyn EnvironmentManager,
        inv: &Invocation,
    ) -> Result<PackageDiff> {
        if self.state.installed {
            debug!(env = %inv.env_name, "Toolchain already installed");
            return Ok(PackageDiff::default());
        }

        info!(env = %inv.env_name, packages = ?self.packages, "Installing toolchain");

        let before = env.list(inv).await?;
        let report = installer.install(inv, &self.packages).await?;
        let after = env.list(inv).await?;

        let diff = PackageDiff::between(before.as_deref(), after.as_deref());
        debug!(
            linked = report.linked.len(),
            unlinked = report.unlinked.len(),
            added = diff.added.len(),
            "Toolchain install finished"
        );

        self.state.added_packages = diff.removable();
        self.state.installed = true;
        self.state.temporary = true;

        Ok(diff)
    }

    /// Remove the packages the toolchain introduced.
    ///
    /// No-op when the toolchain was never installed during this run. When it
    /// was, the installer is called exactly once, with an empty target set if
    /// the environment holding the recorded packages has since been replaced.
    pub async fn uninstall(
        &mut self,
        installer: &dyn ToolchainInstaller,
        inv: &Invocation,
    ) -> Result<()> {
        if !self.state.temporary {
            debug!(env = %inv.env_name, "Toolchain not installed this run");
            return Ok(());
        }

        let targets = self.state.removal_targets();
        info!(env = %inv.env_name, count = targets.len(), "Removing toolchain");
        installer.uninstall(inv, &targets, true).await?;

        self.state = ToolchainState::default();
        Ok(())
    }

    /// The environment holding the toolchain was destroyed, and the packages
    /// it introduced went with it. Anything with the same names in the next
    /// environment was put there by someone else.
    pub fn detach(&mut self) {
        self.state.installed = false;
        self.state.added_packages.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::RecordingTools;

    #[tokio::test]
    async fn test_install_is_idempotent() {
        let tools = RecordingTools::new();
        let inv = Invocation::new("demo");
        let mut toolchain = Toolchain::new(vec!["compilers".to_string()]);

        toolchain.install(&tools, &tools, &inv).await.unwrap();
        let second = toolchain.install(&tools, &tools, &inv).await.unwrap();

        assert!(second.is_empty());
        assert_eq!(tools.count("toolchain.install"), 1);
    }

    #[tokio::test]
    async fn test_install_records_only_new_non_library_packages() {
        let tools = RecordingTools::new();
        tools.seed_packages(&["python", "gcc"]);
        let inv = Invocation::new("demo");
        let mut toolchain = Toolchain::new(vec!["compilers".to_string()]);

        let diff = toolchain.install(&tools, &tools, &inv).await.unwrap();

        assert!(diff.added.contains("libgcc-ng"));
        let state = toolchain.state();
        assert!(state.installed);
        assert!(state.temporary);
        assert!(!state.added_packages.contains("gcc"), "gcc was already present");
        assert!(!state.added_packages.contains("libgcc-ng"));
        assert!(state.added_packages.contains("gxx"));
    }

    #[tokio::test]
    async fn test_uninstall_never_targets_runtime_libraries() {
        let tools = RecordingTools::new();
        let inv = Invocation::new("demo");
        let mut toolchain = Toolchain::new(vec!["compilers".to_string()]);
        toolchain.install(&tools, &tools, &inv).await.unwrap();
        toolchain
            .state_mut()
            .added_packages
            .insert("libstdcxx-ng".to_string());

        toolchain.uninstall(&tools, &inv).await.unwrap();

        let removed = tools.uninstalled();
        assert_eq!(removed.len(), 1);
        assert!(removed[0].iter().all(|name| !name.starts_with("lib")));
        assert!(!toolchain.state().installed);
    }

    #[tokio::test]
    async fn test_uninstall_without_install_is_noop() {
        let tools = RecordingTools::new();
        let inv = Invocation::new("demo");
        let mut toolchain = Toolchain::new(vec!["compilers".to_string()]);

        toolchain.uninstall(&tools, &inv).await.unwrap();
        assert_eq!(tools.count("toolchain.uninstall"), 0);
    }

    #[tokio::test]
    async fn test_detach_allows_reinstall_and_keeps_removal() {
        let tools = RecordingTools::new();
        let inv = Invocation::new("demo");
        let mut toolchain = Toolchain::new(vec!["compilers".to_string()]);
        toolchain.install(&tools, &tools, &inv).await.unwrap();

        toolchain.detach();
        assert!(!toolchain.state().installed);
        assert!(toolchain.state().temporary);
        assert!(toolchain.state().added_packages.is_empty());

        toolchain.install(&tools, &tools, &inv).await.unwrap();
        assert_eq!(tools.count("toolchain.install"), 2);
    }

    #[tokio::test]
    async fn test_uninstall_after_detach_targets_nothing() {
        let tools = RecordingTools::new();
        let inv = Invocation::new("demo");
        let mut toolchain = Toolchain::new(vec!["compilers".to_string()]);
        toolchain.install(&tools, &tools, &inv).await.unwrap();
        toolchain.detach();

        // same names, now declared by the recreated environment
        tools.seed_packages(&["python", "gcc", "binutils"]);
        toolchain.uninstall(&tools, &inv).await.unwrap();

        assert_eq!(tools.uninstalled(), vec![Vec::<String>::new()]);
        assert!(tools.installed_packages().contains("gcc"));
        assert!(!toolchain.state().temporary);
    }

    #[tokio::test]
    async fn test_install_error_propagates() {
        let tools = RecordingTools::new();
        tools.fail_on("toolchain.install");
        let inv = Invocation::new("demo");
        let mut toolchain = Toolchain::new(vec!["compilers".to_string()]);

        let err = toolchain.install(&tools, &tools, &inv).await.unwrap_err();
        assert!(err.to_string().contains("injected failure"));
        assert!(!toolchain.state().installed);
    }
}
