//! Pipeline context and scoped cleanup.
//!
//! Everything a run overrides or acquires is owned here instead of living in
//! process-global state: the active session, install mode, environment
//! variable overrides, the resolver setting override and temp directories.
//! [`PipelineContext::release`] tears down whatever is still pending exactly
//! once, whichever way the run ends.

use crate::collaborators::{
    Collaborators, EnvironmentSession, InstallMode, Invocation, SecondaryResolver,
};
use crate::error::{PipelineError, ToolError};
use crate::spec::ResolvedSpec;
use crate::toolchain::Toolchain;
use crate::Result;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, warn};
use uuid::Uuid;

/// A resolver setting overridden for the duration of a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolverOverride {
    pub project_dir: PathBuf,
    pub key: String,

    /// Value before the override; `None` if it was unset
    pub previous: Option<String>,
}

/// A temporary cache directory exported through an environment variable.
#[derive(Debug)]
pub struct CacheOverride {
    pub var: String,
    pub dir: TempDir,
}

/// Resources that must be released on every exit path.
#[derive(Debug, Default)]
pub struct PendingCleanup {
    pub resolver_setting: Option<ResolverOverride>,
    pub cache_dir: Option<CacheOverride>,
    pub staging_dir: Option<TempDir>,
    pub session: Option<EnvironmentSession>,
}

impl PendingCleanup {
    pub fn is_empty(&self) -> bool {
        self.resolver_setting.is_none()
            && self.cache_dir.is_none()
            && self.staging_dir.is_none()
            && self.session.is_none()
    }
}

impl Drop for PendingCleanup {
    fn drop(&mut self) {
        // Temp dirs clean themselves up; a resolver setting needs an async call.
        if let Some(setting) = &self.resolver_setting {
            warn!(
                key = %setting.key,
                project = %setting.project_dir.display(),
                "Resolver setting was not restored"
            );
        }
    }
}

/// Mutable state threaded through every pipeline step.
#[derive(Debug)]
pub struct PipelineContext {
    pub run_id: Uuid,
    pub env_name: String,
    pub install_mode: InstallMode,
    pub quiet: bool,
    pub toolchain: Toolchain,
    env_vars: BTreeMap<String, String>,
    cleanup: PendingCleanup,
}

impl PipelineContext {
    pub fn new(spec: &ResolvedSpec) -> Self {
        PipelineContext {
            run_id: Uuid::new_v4(),
            env_name: spec.name.clone(),
            install_mode: InstallMode::Default,
            quiet: spec.flags.quiet,
            toolchain: Toolchain::new(spec.toolchain.clone()),
            env_vars: BTreeMap::new(),
            cleanup: PendingCleanup::default(),
        }
    }

    /// Snapshot of the context for a collaborator call.
    pub fn invocation(&self) -> Invocation {
        Invocation {
            env_name: self.env_name.clone(),
            install_mode: self.install_mode,
            quiet: self.quiet,
            env_vars: self.env_vars.clone(),
        }
    }

    pub fn env_vars(&self) -> &BTreeMap<String, String> {
        &self.env_vars
    }

    pub fn pending(&self) -> &PendingCleanup {
        &self.cleanup
    }

    // -------------------------------------------------------------------
    // Environment session
    // -------------------------------------------------------------------

    pub fn begin_session(&mut self, session: EnvironmentSession) {
        debug!(env = %session.name, prefix = %session.prefix.display(), "Session started");
        self.cleanup.session = Some(session);
    }

    pub fn session(&self) -> Option<&EnvironmentSession> {
        self.cleanup.session.as_ref()
    }

    /// Root directory of the active environment.
    pub fn env_root(&self) -> Result<&Path> {
        self.session()
            .map(|s| s.prefix.as_path())
            .ok_or_else(|| PipelineError::NoActiveEnvironment(self.env_name.clone()))
    }

    pub async fn end_session(&mut self, tools: &Collaborators) -> Result<()> {
        if let Some(session) = self.cleanup.session.take() {
            tools.env.deactivate(&session).await?;
            debug!(env = %session.name, "Session ended");
        }
        Ok(())
    }

    // -------------------------------------------------------------------
    // Resolver setting override
    // -------------------------------------------------------------------

    /// Set `key` to `value`, remembering the previous value for restoration.
    pub async fn override_resolver_setting(
        &mut self,
        resolver: &dyn SecondaryResolver,
        project_dir: &Path,
        key: &str,
        value: &str,
    ) -> Result<()> {
        let inv = self.invocation();
        let previous = resolver.get_config(&inv, project_dir, key).await?;
        // Registered before the set so a failed set is still rolled back.
        self.cleanup.resolver_setting = Some(ResolverOverride {
            project_dir: project_dir.to_path_buf(),
            key: key.to_string(),
            previous,
        });
        resolver.set_config(&inv, project_dir, key, value).await?;
        debug!(key, value, "Resolver setting overridden");
        Ok(())
    }

    /// Put the overridden resolver setting back.
    pub async fn restore_resolver_setting(&mut self, resolver: &dyn SecondaryResolver) -> Result<()> {
        let Some(setting) = self.cleanup.resolver_setting.take() else {
            return Ok(());
        };
        let inv = self.invocation();
        match &setting.previous {
            Some(value) => {
                resolver
                    .set_config(&inv, &setting.project_dir, &setting.key, value)
                    .await?
            }
            None => {
                resolver
                    .unset_config(&inv, &setting.project_dir, &setting.key)
                    .await?
            }
        }
        debug!(key = %setting.key, "Resolver setting restored");
        Ok(())
    }

    // -------------------------------------------------------------------
    // Temporary directories
    // -------------------------------------------------------------------

    /// Point `var` at a fresh temporary directory for subsequent calls.
    pub fn override_cache_dir(&mut self, var: &str) -> Result<PathBuf> {
        self.drop_cache_dir();
        let dir = tempfile::Builder::new().prefix("envpack-cache-").tempdir()?;
        let path = dir.path().to_path_buf();
        self.env_vars
            .insert(var.to_string(), path.to_string_lossy().into_owned());
        self.cleanup.cache_dir = Some(CacheOverride {
            var: var.to_string(),
            dir,
        });
        debug!(var, path = %path.display(), "Cache directory overridden");
        Ok(path)
    }

    /// Remove the cache override variable and delete its directory.
    pub fn drop_cache_dir(&mut self) {
        if let Some(cache) = self.cleanup.cache_dir.take() {
            self.env_vars.remove(&cache.var);
            let path = cache.dir.path().to_path_buf();
            if let Err(err) = cache.dir.close() {
                warn!(path = %path.display(), error = %err, "Failed to remove cache directory");
            }
        }
    }

    /// Staging directory for intermediate archives, created on first use.
    pub fn staging_dir(&mut self) -> Result<PathBuf> {
        if let Some(dir) = &self.cleanup.staging_dir {
            return Ok(dir.path().to_path_buf());
        }
        let dir = tempfile::Builder::new().prefix("envpack-stage-").tempdir()?;
        let path = dir.path().to_path_buf();
        self.cleanup.staging_dir = Some(dir);
        Ok(path)
    }

    // -------------------------------------------------------------------
    // Release
    // -------------------------------------------------------------------

    /// Release everything still pending. Every resource is attempted even if
    /// an earlier one fails; the first failure is returned.
    pub async fn release(&mut self, tools: &Collaborators) -> Result<()> {
        let mut first_err: Option<ToolError> = None;

        if let Err(err) = self.restore_resolver_setting(tools.resolver.as_ref()).await {
            warn!(error = %err, "Failed to restore resolver setting");
            first_err.get_or_insert(into_tool_error(err));
        }

        self.drop_cache_dir();

        if let Some(dir) = self.cleanup.staging_dir.take() {
            let path = dir.path().to_path_buf();
            if let Err(err) = dir.close() {
                warn!(path = %path.display(), error = %err, "Failed to remove staging directory");
            }
        }

        if let Err(err) = self.end_session(tools).await {
            warn!(error = %err, "Failed to deactivate environment");
            first_err.get_or_insert(into_tool_error(err));
        }

        match first_err {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }
}

fn into_tool_error(err: PipelineError) -> ToolError {
    match err {
        PipelineError::ExternalTool(e) => e,
        other => ToolError::new("envpack", "cleanup", other.to_string()),
    }
}
