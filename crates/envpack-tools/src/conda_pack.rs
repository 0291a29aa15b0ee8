//! conda-pack archiver.

use async_trait::async_trait;
use envpack::{Archiver, Invocation, PackRequest, ToolResult};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::exec::ToolCommand;
use crate::ToolPaths;

const TOOL: &str = "conda-pack";

/// Script conda-pack ships inside every archive to rewrite prefixes.
const UNPACK_SCRIPT: &str = "bin/conda-unpack";

/// [`Archiver`] backed by `conda-pack` and `tar`.
#[derive(Debug, Clone)]
pub struct CondaPackArchiver {
    paths: ToolPaths,
}

impl CondaPackArchiver {
    pub fn new(paths: ToolPaths) -> Self {
        CondaPackArchiver { paths }
    }

    fn pack_command(&self, inv: &Invocation, request: &PackRequest) -> ToolCommand {
        let mut cmd = ToolCommand::new(TOOL, "pack", &self.paths.conda_pack)
            .envs(&inv.env_vars)
            .args(["-n", inv.env_name.as_str(), "-o"])
            .arg(request.destination.display().to_string());
        if let Some(arcroot) = &request.arcroot {
            cmd = cmd.args(["--arcroot", arcroot.as_str()]);
        }
        if let Some(level) = request.compress_level {
            cmd = cmd.args(["--compress-level".to_string(), level.to_string()]);
        }
        cmd.flag("--force", request.force).flag("--quiet", inv.quiet)
    }
}

#[async_trait]
impl Archiver for CondaPackArchiver {
    async fn pack(&self, inv: &Invocation, request: &PackRequest) -> ToolResult<PathBuf> {
        info!(env = %inv.env_name, destination = %request.destination.display(), "Packing");
        self.pack_command(inv, request).output().await?;
        Ok(request.destination.clone())
    }

    async fn unpack(&self, inv: &Invocation, archive: &Path, target_dir: &Path) -> ToolResult<()> {
        let mkdir = ToolCommand::new("tar", "unpack", &self.paths.tar);
        tokio::fs::create_dir_all(target_dir)
            .await
            .map_err(|e| mkdir.error(format!("{}: {}", target_dir.display(), e)))?;

        ToolCommand::new("tar", "unpack", &self.paths.tar)
            .arg("-xzf")
            .arg(archive.display().to_string())
            .arg("-C")
            .arg(target_dir.display().to_string())
            .output()
            .await?;

        let fixup = target_dir.join(UNPACK_SCRIPT);
        if fixup.exists() {
            debug!(script = %fixup.display(), "Rewriting prefixes");
            ToolCommand::new(TOOL, "unpack", &fixup)
                .envs(&inv.env_vars)
                .current_dir(target_dir)
                .output()
                .await?;
        }
        info!(target = %target_dir.display(), "Unpacked");
        Ok(())
    }
}
