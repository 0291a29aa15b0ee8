//! Environment assembly pipeline.
//!
//! Drives a validated [`EnvironmentSpec`] through the fixed sequence of
//! collaborator calls that produces an environment directory or archive:
//!
//! 1. validate the spec
//! 2. create and activate a fresh environment
//! 3. scan dependency files for embedded pip lists
//! 4. install the compiler toolchain
//! 5. probe-merge the flagged files
//! 6. recreate the environment (isolation boundary)
//! 7. merge every dependency file, in order
//! 8. run the secondary resolver
//! 9. reinstall the toolchain when later steps need it
//! 10. run user commands (best effort)
//! 11. remove the toolchain unless asked to keep it
//! 12. export the manifest
//! 13. pack, and unpack in place for create mode
//!
//! Any failing step aborts the run. Pending resources are released before
//! the error is returned, including when the run is interrupted.

use crate::collaborators::{CommandResult, Collaborators, InstallMode, PackRequest};
use crate::context::PipelineContext;
use crate::error::PipelineError;
use crate::scanner;
use crate::spec::{BuildMode, EnvironmentSpec, ResolvedSpec};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

/// Resolver setting that makes it create its own virtualenv.
pub const VIRTUALENVS_CREATE: &str = "virtualenvs.create";

/// Directory inside the environment root holding the exported manifest.
pub const MANIFEST_DIR: &str = "dependencies";

/// Where a completed run left its outputs.
#[derive(Debug, Clone, Serialize)]
pub struct ArtifactLocation {
    pub run_id: Uuid,

    pub mode: BuildMode,

    /// Environment directory (create) or archive (package)
    pub path: PathBuf,

    /// Exported manifest as written into the build environment
    pub manifest_path: PathBuf,

    /// SHA-256 of the manifest text
    pub manifest_digest: String,

    /// Copy of the resolver lockfile, when a project dir was given
    pub lockfile_path: Option<PathBuf>,

    /// Best-effort command outcomes, in run order
    pub commands: Vec<CommandResult>,

    /// Whether the compiler toolchain was left in the environment
    pub toolchain_retained: bool,

    pub started_at: DateTime<Utc>,

    pub finished_at: DateTime<Utc>,

    /// Total duration in milliseconds
    pub duration_ms: u64,
}

impl ArtifactLocation {
    /// Number of user commands that failed.
    pub fn failed_commands(&self) -> usize {
        self.commands.iter().filter(|c| !c.passed()).count()
    }
}

/// Environment pipeline orchestrator.
pub struct Pipeline {
    tools: Collaborators,
}

impl Pipeline {
    pub fn new(tools: Collaborators) -> Self {
        Pipeline { tools }
    }

    /// Run the pipeline to completion.
    pub async fn run(&self, spec: &EnvironmentSpec) -> Result<ArtifactLocation> {
        self.run_until(spec, std::future::pending::<()>()).await
    }

    /// Run the pipeline, aborting with [`PipelineError::Interrupted`] when
    /// `shutdown` completes first. Cleanup runs on every path.
    pub async fn run_until<F>(&self, spec: &EnvironmentSpec, shutdown: F) -> Result<ArtifactLocation>
    where
        F: Future<Output = ()>,
    {
        // Step 1: nothing has been acquired yet, so errors return directly.
        let resolved = spec.resolve()?;
        let mut ctx = PipelineContext::new(&resolved);

        let span = info_span!("pipeline", run_id = %ctx.run_id, env = %resolved.name, mode = resolved.mode.name());

        async {
            info!("Starting environment pipeline");
            tokio::pin!(shutdown);

            let outcome = tokio::select! {
                biased;
                _ = &mut shutdown => {
                    warn!("Interrupted, cleaning up");
                    Err(PipelineError::Interrupted)
                }
                result = self.execute(&resolved, &mut ctx) => result,
            };

            let released = ctx.release(&self.tools).await;

            match (outcome, released) {
                (Ok(artifact), Ok(())) => {
                    info!(path = %artifact.path.display(), "Environment pipeline completed");
                    Ok(artifact)
                }
                (Ok(_), Err(err)) => Err(err),
                (Err(err), released) => {
                    if let Err(cleanup_err) = released {
                        warn!(error = %cleanup_err, "Cleanup after failure was incomplete");
                    }
                    warn!(error = %err, "Environment pipeline failed");
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn execute(&self, spec: &ResolvedSpec, ctx: &mut PipelineContext) -> Result<ArtifactLocation> {
        let start = Instant::now();
        let started_at = Utc::now();

        // Step 2
        let inv = ctx.invocation();
        self.tools.env.remove(&inv).await?;
        self.create_and_activate(ctx).await?;

        // Step 3
        let flagged = scanner::scan_files(&spec.dependency_files)?;

        // Step 4
        self.install_toolchain(ctx).await?;

        // Step 5
        if !flagged.is_empty() {
            info!(files = flagged.len(), "Probing pip dependencies with toolchain present");
            let inv = ctx.invocation();
            for file in &flagged {
                self.tools.env.update(&inv, file).await?;
            }
        }

        // Step 6
        info!("Recreating environment");
        ctx.end_session(&self.tools).await?;
        self.tools.env.remove(&ctx.invocation()).await?;
        ctx.toolchain.detach();
        self.create_and_activate(ctx).await?;
        ctx.install_mode = InstallMode::PreferCached;

        // Step 7
        let inv = ctx.invocation();
        for file in &spec.dependency_files {
            info!(file = %file.display(), "Merging dependency file");
            self.tools.env.update(&inv, file).await?;
        }

        // Step 8
        let lockfile_path = match &spec.secondary_project_dir {
            Some(project) => self.run_secondary_resolver(spec, ctx, project).await?,
            None => None,
        };

        // Step 9
        if !flagged.is_empty() || spec.flags.build_tools || spec.wants_commands() {
            self.install_toolchain(ctx).await?;
        }

        // Step 10
        let commands = self.run_commands(spec, ctx).await?;

        // Step 11
        if spec.flags.build_tools {
            info!("Keeping toolchain in the environment");
        } else {
            let inv = ctx.invocation();
            ctx.toolchain
                .uninstall(self.tools.toolchain.as_ref(), &inv)
                .await?;
        }

        // Step 12
        let (manifest_path, manifest_digest) = self.export_manifest(spec, ctx).await?;

        // Step 13
        let path = self.produce_artifact(spec, ctx).await?;

        Ok(ArtifactLocation {
            run_id: ctx.run_id,
            mode: spec.mode,
            path,
            manifest_path,
            manifest_digest,
            lockfile_path,
            commands,
            toolchain_retained: ctx.toolchain.state().installed,
            started_at,
            finished_at: Utc::now(),
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }

    /// Create the environment, activate it, and drop the default channel.
    async fn create_and_activate(&self, ctx: &mut PipelineContext) -> Result<()> {
        let inv = ctx.invocation();
        self.tools.env.create(&inv).await?;
        let session = self.tools.env.activate(&inv).await?;
        ctx.begin_session(session);
        self.tools.env.remove_default_channel(&inv).await?;
        Ok(())
    }

    async fn install_toolchain(&self, ctx: &mut PipelineContext) -> Result<()> {
        let inv = ctx.invocation();
        ctx.toolchain
            .install(self.tools.toolchain.as_ref(), self.tools.env.as_ref(), &inv)
            .await?;
        Ok(())
    }

    fn manifest_dir(&self, ctx: &PipelineContext) -> Result<PathBuf> {
        let dir = ctx.env_root()?.join(MANIFEST_DIR);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Returns the lockfile copy, if the resolver left one behind.
    async fn run_secondary_resolver(
        &self,
        spec: &ResolvedSpec,
        ctx: &mut PipelineContext,
        project: &Path,
    ) -> Result<Option<PathBuf>> {
        let resolver = self.tools.resolver.as_ref();
        info!(project = %project.display(), "Running secondary resolver");

        ctx.install_mode = InstallMode::Default;
        let inv = ctx.invocation();
        self.tools
            .env
            .install_packages(&inv, &["pip".to_string()])
            .await?;
        self.install_toolchain(ctx).await?;

        ctx.override_resolver_setting(resolver, project, VIRTUALENVS_CREATE, "false")
            .await?;

        let lockfile = project.join(resolver.lockfile_name());
        if !lockfile.exists() {
            ctx.override_cache_dir(resolver.cache_dir_var())?;
        }

        let inv = ctx.invocation();
        if spec.flags.unlock_lockfile {
            resolver.update(&inv, project, spec.flags.no_dev).await?;
        } else {
            resolver.install(&inv, project, spec.flags.no_dev).await?;
        }

        let copied = if lockfile.is_file() {
            let target = self.manifest_dir(ctx)?.join(resolver.lockfile_name());
            std::fs::copy(&lockfile, &target)?;
            Some(target)
        } else {
            warn!(lockfile = %lockfile.display(), "Resolver did not produce a lockfile");
            None
        };

        ctx.restore_resolver_setting(resolver).await?;
        ctx.drop_cache_dir();
        Ok(copied)
    }

    /// Run extra commands and the post-setup script. Failures are logged and
    /// reported, never raised.
    async fn run_commands(&self, spec: &ResolvedSpec, ctx: &PipelineContext) -> Result<Vec<CommandResult>> {
        let inv = ctx.invocation();
        let mut results = Vec::new();

        for command in &spec.extra_commands {
            info!(command = %command, "Running command");
            let args = vec!["-c".to_string(), command.clone()];
            let result = match self.tools.env.run(&inv, "sh", &args).await {
                Ok(result) => result,
                Err(err) => CommandResult::not_started(command.clone(), err.to_string()),
            };
            report_command(&result);
            results.push(result);
        }

        if let Some(script) = &spec.post_setup_script {
            let root = ctx.env_root()?;
            info!(script = %script.display(), "Running post-setup script");
            let args = vec![
                script.to_string_lossy().into_owned(),
                root.to_string_lossy().into_owned(),
            ];
            let result = match self.tools.env.run(&inv, "bash", &args).await {
                Ok(result) => result,
                Err(err) => CommandResult::not_started(script.display().to_string(), err.to_string()),
            };
            report_command(&result);
            results.push(result);
        }

        Ok(results)
    }

    async fn export_manifest(&self, spec: &ResolvedSpec, ctx: &PipelineContext) -> Result<(PathBuf, String)> {
        let manifest = self.tools.env.export(&ctx.invocation()).await?;
        let path = self.manifest_dir(ctx)?.join(&spec.manifest_file_name);
        std::fs::write(&path, &manifest)?;

        let digest = hex::encode(Sha256::digest(manifest.as_bytes()));
        info!(path = %path.display(), digest = &digest[..12], "Manifest exported");
        Ok((path, digest))
    }

    async fn produce_artifact(&self, spec: &ResolvedSpec, ctx: &mut PipelineContext) -> Result<PathBuf> {
        let destination = &spec.destination;
        if spec.flags.force_overwrite {
            remove_existing(destination)?;
        }

        let inv = ctx.invocation();
        match spec.mode {
            BuildMode::Create => {
                let archive = ctx.staging_dir()?.join(format!("{}.tar.gz", spec.name));
                let request = PackRequest {
                    destination: archive,
                    arcroot: None,
                    compress_level: spec.compress_level,
                    force: true,
                };
                let archive = self.tools.archiver.pack(&inv, &request).await?;
                self.tools
                    .archiver
                    .unpack(&inv, &archive, destination)
                    .await?;
            }
            BuildMode::Package => {
                let request = PackRequest {
                    destination: destination.clone(),
                    arcroot: Some(spec.name.clone()),
                    compress_level: spec.compress_level,
                    force: spec.flags.force_overwrite,
                };
                self.tools.archiver.pack(&inv, &request).await?;
            }
        }

        Ok(destination.clone())
    }
}

fn report_command(result: &CommandResult) {
    if result.passed() {
        info!(command = %result.command, duration_ms = result.duration_ms, "Command succeeded");
    } else {
        warn!(
            command = %result.command,
            exit_code = result.exit_code,
            stderr = %result.stderr.trim(),
            "Command failed, continuing"
        );
    }
}

fn remove_existing(path: &Path) -> std::io::Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}
