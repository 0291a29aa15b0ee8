//! Poetry as the secondary resolver.
//!
//! Poetry must see the environment's interpreter, so every call goes
//! through `conda run -n <env>`.

use async_trait::async_trait;
use envpack::{Invocation, SecondaryResolver, ToolResult};
use std::path::Path;
use tracing::{debug, info};

use crate::exec::ToolCommand;
use crate::ToolPaths;

const TOOL: &str = "poetry";

/// Interpret `poetry config <key>` output; `null` and blank mean unset.
fn parse_config_value(stdout: &str) -> Option<String> {
    let value = stdout.lines().last().unwrap_or_default().trim();
    if value.is_empty() || value == "null" {
        None
    } else {
        Some(value.to_string())
    }
}

/// [`SecondaryResolver`] backed by `poetry`.
#[derive(Debug, Clone)]
pub struct PoetryResolver {
    paths: ToolPaths,
}

impl PoetryResolver {
    pub fn new(paths: ToolPaths) -> Self {
        PoetryResolver { paths }
    }

    /// `conda run -n <env> poetry ...` rooted at the project directory.
    fn poetry(&self, operation: &str, inv: &Invocation, project: &Path) -> ToolCommand {
        ToolCommand::new(TOOL, operation, &self.paths.conda)
            .envs(&inv.env_vars)
            .args(["run", "-n", inv.env_name.as_str()])
            .arg(self.paths.poetry.display().to_string())
            .current_dir(project)
    }

    fn sync_command(
        &self,
        operation: &str,
        inv: &Invocation,
        project: &Path,
        no_dev: bool,
    ) -> ToolCommand {
        self.poetry(operation, inv, project)
            .args([operation, "--directory"])
            .arg(project.display().to_string())
            .args(if no_dev { vec!["--without", "dev"] } else { vec![] })
            .arg("--no-interaction")
            .flag("--quiet", inv.quiet)
    }
}

#[async_trait]
impl SecondaryResolver for PoetryResolver {
    async fn get_config(
        &self,
        inv: &Invocation,
        project: &Path,
        key: &str,
    ) -> ToolResult<Option<String>> {
        let stdout = self
            .poetry("config", inv, project)
            .args(["config", key])
            .output()
            .await?;
        Ok(parse_config_value(&stdout))
    }

    async fn set_config(
        &self,
        inv: &Invocation,
        project: &Path,
        key: &str,
        value: &str,
    ) -> ToolResult<()> {
        debug!(key, value, "Setting poetry config");
        self.poetry("config", inv, project)
            .args(["config", key, value])
            .output()
            .await?;
        Ok(())
    }

    async fn unset_config(&self, inv: &Invocation, project: &Path, key: &str) -> ToolResult<()> {
        debug!(key, "Unsetting poetry config");
        self.poetry("config", inv, project)
            .args(["config", "--unset", key])
            .output()
            .await?;
        Ok(())
    }

    async fn install(&self, inv: &Invocation, project: &Path, no_dev: bool) -> ToolResult<()> {
        info!(project = %project.display(), no_dev, "poetry install");
        self.sync_command("install", inv, project, no_dev)
            .output()
            .await?;
        Ok(())
    }

    async fn update(&self, inv: &Invocation, project: &Path, no_dev: bool) -> ToolResult<()> {
        info!(project = %project.display(), no_dev, "poetry update");
        self.sync_command("update", inv, project, no_dev)
            .output()
            .await?;
        Ok(())
    }
}
