//! conda / mamba backed environment manager and toolchain installer.
//!
//! Queries (`env list`, `list`, `env export`, `config`, `run`) go through
//! `conda`; anything that solves goes through `mamba`.

use async_trait::async_trait;
use envpack::{
    CommandResult, EnvironmentManager, EnvironmentSession, InstallMode, InstallReport, Invocation,
    PackageRecord, ToolError, ToolResult, ToolchainInstaller,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::exec::ToolCommand;
use crate::ToolPaths;

const TOOL: &str = "conda";

/// Output of `conda env list --json`.
#[derive(Debug, Deserialize)]
struct EnvList {
    #[serde(default)]
    envs: Vec<PathBuf>,
}

/// Output of `mamba install --json`.
#[derive(Debug, Default, Deserialize)]
struct SolveOutput {
    #[serde(default)]
    error: Option<String>,

    #[serde(default)]
    actions: SolveActions,
}

#[derive(Debug, Default, Deserialize)]
struct SolveActions {
    #[serde(rename = "LINK", default)]
    link: Vec<ActionPackage>,

    #[serde(rename = "UNLINK", default)]
    unlink: Vec<ActionPackage>,
}

#[derive(Debug, Deserialize)]
struct ActionPackage {
    name: String,
}

/// Find the prefix of a named environment in `conda env list --json` output.
fn find_prefix(list_json: &str, name: &str) -> serde_json::Result<Option<PathBuf>> {
    let list: EnvList = serde_json::from_str(list_json)?;
    Ok(list
        .envs
        .into_iter()
        .find(|prefix| prefix.file_name().and_then(|n| n.to_str()) == Some(name)))
}

/// Parse `conda list --json`. Empty output and `null` mean "nothing reported".
fn parse_package_list(text: &str) -> serde_json::Result<Option<Vec<PackageRecord>>> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(text)
}

/// Parse `install --json` output into a report, surfacing the solver's
/// `error` field.
fn parse_install_report(text: &str) -> Result<InstallReport, String> {
    // mamba can print banner lines before the JSON document
    let start = text.find('{').ok_or_else(|| "no JSON in install output".to_string())?;
    let output: SolveOutput =
        serde_json::from_str(&text[start..]).map_err(|e| format!("unreadable install output: {e}"))?;

    if let Some(error) = output.error {
        return Err(error);
    }
    Ok(InstallReport {
        linked: output.actions.link.into_iter().map(|p| p.name).collect(),
        unlinked: output.actions.unlink.into_iter().map(|p| p.name).collect(),
    })
}

/// The solver's `error` field, when the output carries one.
fn solver_error(text: &str) -> Option<String> {
    let start = text.find('{')?;
    serde_json::from_str::<SolveOutput>(&text[start..]).ok()?.error
}

/// Apply the invocation's environment and install mode to a solve.
fn solve_command(paths: &ToolPaths, operation: &str, inv: &Invocation) -> ToolCommand {
    let cmd = ToolCommand::new(TOOL, operation, &paths.mamba).envs(&inv.env_vars);
    match inv.install_mode {
        InstallMode::Default => cmd,
        InstallMode::PreferCached => cmd
            .env("CONDA_USE_INDEX_CACHE", "true")
            .env("PIP_PREFER_BINARY", "1"),
    }
}

fn missing_env(inv: &Invocation, operation: &str) -> ToolError {
    ToolError::new(TOOL, operation, format!("environment {} does not exist", inv.env_name))
}

fn quiet_flag(inv: &Invocation) -> bool {
    inv.quiet || inv.install_mode == InstallMode::PreferCached
}

/// [`EnvironmentManager`] on top of `conda` and `mamba`.
#[derive(Debug, Clone)]
pub struct CondaEnvironmentManager {
    paths: ToolPaths,
}

impl CondaEnvironmentManager {
    pub fn new(paths: ToolPaths) -> Self {
        CondaEnvironmentManager { paths }
    }

    fn conda(&self, operation: &str, inv: &Invocation) -> ToolCommand {
        ToolCommand::new(TOOL, operation, &self.paths.conda).envs(&inv.env_vars)
    }

    /// Prefix of the named environment, if it exists.
    pub async fn prefix(&self, inv: &Invocation) -> ToolResult<Option<PathBuf>> {
        let cmd = self.conda("env list", inv).args(["env", "list", "--json"]);
        let out = cmd.output().await?;
        find_prefix(&out, &inv.env_name).map_err(|e| cmd.error(e.to_string()))
    }

    fn update_command(&self, inv: &Invocation, file: &Path) -> ToolCommand {
        solve_command(&self.paths, "env update", inv)
            .args(["env", "update", "-n", inv.env_name.as_str(), "-f"])
            .arg(file.display().to_string())
            .flag("--quiet", quiet_flag(inv))
    }
}

#[async_trait]
impl EnvironmentManager for CondaEnvironmentManager {
    async fn remove(&self, inv: &Invocation) -> ToolResult<()> {
        if self.prefix(inv).await?.is_none() {
            debug!(env = %inv.env_name, "No environment to remove");
            return Ok(());
        }
        self.conda("env remove", inv)
            .args(["env", "remove", "-n", inv.env_name.as_str(), "-y"])
            .flag("--quiet", inv.quiet)
            .output()
            .await?;
        Ok(())
    }

    async fn create(&self, inv: &Invocation) -> ToolResult<()> {
        solve_command(&self.paths, "create", inv)
            .args(["create", "-n", inv.env_name.as_str(), "-y"])
            .flag("--quiet", quiet_flag(inv))
            .output()
            .await?;
        Ok(())
    }

    async fn activate(&self, inv: &Invocation) -> ToolResult<EnvironmentSession> {
        // Every call is scoped with `-n`, so activation only resolves the root.
        let prefix = self
            .prefix(inv)
            .await?
            .ok_or_else(|| missing_env(inv, "activate"))?;
        debug!(env = %inv.env_name, prefix = %prefix.display(), "Activated");
        Ok(EnvironmentSession {
            name: inv.env_name.clone(),
            prefix,
        })
    }

    async fn deactivate(&self, session: &EnvironmentSession) -> ToolResult<()> {
        debug!(env = %session.name, "Deactivated");
        Ok(())
    }

    async fn remove_default_channel(&self, inv: &Invocation) -> ToolResult<()> {
        let prefix = self
            .prefix(inv)
            .await?
            .ok_or_else(|| missing_env(inv, "config"))?;
        let result = self
            .conda("config", inv)
            .args(["config", "--file"])
            .arg(prefix.join(".condarc").display().to_string())
            .args(["--remove", "channels", "defaults"])
            .status()
            .await?;

        // Not listed in the first place
        if result.passed() || result.stderr.contains("CondaKeyError") {
            return Ok(());
        }
        Err(self
            .conda("config", inv)
            .error(crate::exec::failure_message(&result)))
    }

    async fn update(&self, inv: &Invocation, file: &Path) -> ToolResult<()> {
        info!(env = %inv.env_name, file = %file.display(), "Merging dependency file");
        self.update_command(inv, file).output().await?;
        Ok(())
    }

    async fn install_packages(&self, inv: &Invocation, packages: &[String]) -> ToolResult<()> {
        if packages.is_empty() {
            return Ok(());
        }
        solve_command(&self.paths, "install", inv)
            .args(["install", "-n", inv.env_name.as_str(), "-y"])
            .flag("--quiet", quiet_flag(inv))
            .args(packages.iter().cloned())
            .output()
            .await?;
        Ok(())
    }

    async fn list(&self, inv: &Invocation) -> ToolResult<Option<Vec<PackageRecord>>> {
        let cmd = self
            .conda("list", inv)
            .args(["list", "-n", inv.env_name.as_str(), "--json"]);
        let out = cmd.output().await?;
        parse_package_list(&out).map_err(|e| cmd.error(e.to_string()))
    }

    async fn export(&self, inv: &Invocation) -> ToolResult<String> {
        self.conda("env export", inv)
            .args(["env", "export", "-n", inv.env_name.as_str()])
            .output()
            .await
    }

    async fn run(
        &self,
        inv: &Invocation,
        program: &str,
        args: &[String],
    ) -> ToolResult<CommandResult> {
        self.conda("run", inv)
            .args(["run", "-n", inv.env_name.as_str(), program])
            .args(args.iter().cloned())
            .status()
            .await
    }
}

/// [`ToolchainInstaller`] using `mamba install --json` / `mamba remove`.
#[derive(Debug, Clone)]
pub struct CondaToolchainInstaller {
    paths: ToolPaths,
}

impl CondaToolchainInstaller {
    pub fn new(paths: ToolPaths) -> Self {
        CondaToolchainInstaller { paths }
    }
}

#[async_trait]
impl ToolchainInstaller for CondaToolchainInstaller {
    async fn install(&self, inv: &Invocation, packages: &[String]) -> ToolResult<InstallReport> {
        let cmd = solve_command(&self.paths, "toolchain install", inv)
            .args(["install", "-n", inv.env_name.as_str(), "-y", "--json"])
            .args(packages.iter().cloned());

        let result = cmd.status().await?;
        if !result.passed() {
            // Lock contention and crashes leave no JSON, only stderr
            let message = solver_error(&result.stdout)
                .unwrap_or_else(|| crate::exec::failure_message(&result));
            return Err(cmd.error(message));
        }
        let report = parse_install_report(&result.stdout).map_err(|e| cmd.error(e))?;
        info!(
            env = %inv.env_name,
            linked = report.linked.len(),
            unlinked = report.unlinked.len(),
            "Toolchain installed"
        );
        Ok(report)
    }

    async fn uninstall(&self, inv: &Invocation, names: &[String], force: bool) -> ToolResult<()> {
        let list_cmd = ToolCommand::new(TOOL, "list", &self.paths.conda)
            .envs(&inv.env_vars)
            .args(["list", "-n", inv.env_name.as_str(), "--json"]);
        let present = parse_package_list(&list_cmd.output().await?)
            .map_err(|e| list_cmd.error(e.to_string()))?
            .unwrap_or_default();

        let targets: Vec<String> = names
            .iter()
            .filter(|name| present.iter().any(|p| &p.name == *name))
            .cloned()
            .collect();
        if targets.is_empty() {
            debug!(env = %inv.env_name, "Nothing to uninstall");
            return Ok(());
        }

        solve_command(&self.paths, "toolchain uninstall", inv)
            .args(["remove", "-n", inv.env_name.as_str(), "-y"])
            .flag("--force", force)
            .flag("--quiet", quiet_flag(inv))
            .args(targets)
            .output()
            .await?;
        Ok(())
    }
}
