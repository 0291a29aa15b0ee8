//! In-memory fakes for the collaborator traits (testing only)
//!
//! `RecordingTools` implements all four collaborators over one shared state,
//! logs every call in order, and can be told to fail specific operations.
//! Environment roots are real directories under a private temp dir so the
//! pipeline's manifest and lockfile writes land somewhere inspectable.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tempfile::TempDir;

use crate::collaborators::*;
use crate::error::ToolError;
use crate::package::PackageRecord;

/// Packages the fake toolchain install links.
pub const FAKE_TOOLCHAIN_PACKAGES: &[&str] =
    &["binutils", "gcc", "gxx", "libgcc-ng", "libstdcxx-ng"];

/// One recorded collaborator call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    /// `<collaborator>.<operation>`, e.g. `env.update`
    pub op: String,
    pub env: String,
    pub args: Vec<String>,
    pub install_mode: InstallMode,
    pub env_vars: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct FakeState {
    calls: Vec<Call>,
    failing_ops: BTreeSet<String>,
    hanging_ops: BTreeSet<String>,
    failing_commands: Vec<String>,
    seed: BTreeSet<String>,
    declared: BTreeSet<String>,
    packages: BTreeSet<String>,
    config: BTreeMap<String, String>,
}

#[derive(Debug)]
struct Inner {
    state: Mutex<FakeState>,
    root: TempDir,
}

/// Recording fake for every collaborator.
#[derive(Debug, Clone)]
pub struct RecordingTools {
    inner: Arc<Inner>,
}

impl Default for RecordingTools {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingTools {
    /// # Panics
    ///
    /// Panics if the temporary prefix root cannot be created.
    pub fn new() -> Self {
        let root = tempfile::Builder::new()
            .prefix("envpack-fake-")
            .tempdir()
            .expect("create fake root");
        RecordingTools {
            inner: Arc::new(Inner {
                state: Mutex::new(FakeState::default()),
                root,
            }),
        }
    }

    /// Bundle this fake as all four collaborators.
    pub fn collaborators(&self) -> Collaborators {
        Collaborators::new(
            Arc::new(self.clone()),
            Arc::new(self.clone()),
            Arc::new(self.clone()),
            Arc::new(self.clone()),
        )
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ---------------------------------------------------------------------
    // Setup
    // ---------------------------------------------------------------------

    /// Make every call to `op` fail.
    pub fn fail_on(&self, op: &str) {
        self.state().failing_ops.insert(op.to_string());
    }

    /// Make `op` never return. Supported by `env.update`, `env.run`,
    /// `resolver.install`, `resolver.update` and `archiver.pack`.
    pub fn hang_on(&self, op: &str) {
        self.state().hanging_ops.insert(op.to_string());
    }

    /// Commands containing `pattern` exit with status 1.
    pub fn fail_command(&self, pattern: &str) {
        self.state().failing_commands.push(pattern.to_string());
    }

    /// Packages every new environment starts with.
    pub fn seed_packages(&self, names: &[&str]) {
        let mut state = self.state();
        state.seed = names.iter().map(|s| s.to_string()).collect();
        state.packages = state.seed.clone();
    }

    /// Packages every `env.update` installs, as if declared in the file.
    pub fn declare_packages(&self, names: &[&str]) {
        self.state()
            .declared
            .extend(names.iter().map(|s| s.to_string()));
    }

    pub fn seed_config(&self, key: &str, value: &str) {
        self.state()
            .config
            .insert(key.to_string(), value.to_string());
    }

    // ---------------------------------------------------------------------
    // Inspection
    // ---------------------------------------------------------------------

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    /// Recorded operations in order, without `env.list` reads.
    pub fn sequence(&self) -> Vec<String> {
        self.state()
            .calls
            .iter()
            .filter(|c| c.op != "env.list")
            .map(|c| c.op.clone())
            .collect()
    }

    pub fn count(&self, op: &str) -> usize {
        self.state().calls.iter().filter(|c| c.op == op).count()
    }

    /// Calls to `op`, in order.
    pub fn calls_to(&self, op: &str) -> Vec<Call> {
        self.state()
            .calls
            .iter()
            .filter(|c| c.op == op)
            .cloned()
            .collect()
    }

    /// Name lists passed to each toolchain uninstall.
    pub fn uninstalled(&self) -> Vec<Vec<String>> {
        self.calls_to("toolchain.uninstall")
            .into_iter()
            .map(|c| c.args)
            .collect()
    }

    pub fn config(&self, key: &str) -> Option<String> {
        self.state().config.get(key).cloned()
    }

    pub fn installed_packages(&self) -> BTreeSet<String> {
        self.state().packages.clone()
    }

    /// Root directory the fake reports for environment `name`.
    pub fn env_prefix(&self, name: &str) -> PathBuf {
        self.inner.root.path().join("envs").join(name)
    }

    // ---------------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------------

    fn record(&self, op: &str, inv: &Invocation, args: Vec<String>) -> Result<(), ToolError> {
        let mut state = self.state();
        state.calls.push(Call {
            op: op.to_string(),
            env: inv.env_name.clone(),
            args,
            install_mode: inv.install_mode,
            env_vars: inv.env_vars.clone(),
        });
        if state.failing_ops.contains(op) {
            return Err(ToolError::new("fake", op, "injected failure"));
        }
        Ok(())
    }

    async fn maybe_hang(&self, op: &str) {
        let hang = self.state().hanging_ops.contains(op);
        if hang {
            std::future::pending::<()>().await;
        }
    }
}

fn display(path: &Path) -> String {
    path.display().to_string()
}

#[async_trait]
impl EnvironmentManager for RecordingTools {
    async fn remove(&self, inv: &Invocation) -> ToolResult<()> {
        self.record("env.remove", inv, vec![])?;
        let prefix = self.env_prefix(&inv.env_name);
        if prefix.exists() {
            std::fs::remove_dir_all(&prefix)
                .map_err(|e| ToolError::new("fake", "env.remove", e.to_string()))?;
        }
        self.state().packages.clear();
        Ok(())
    }

    async fn create(&self, inv: &Invocation) -> ToolResult<()> {
        self.record("env.create", inv, vec![])?;
        std::fs::create_dir_all(self.env_prefix(&inv.env_name))
            .map_err(|e| ToolError::new("fake", "env.create", e.to_string()))?;
        let mut state = self.state();
        state.packages = state.seed.clone();
        Ok(())
    }

    async fn activate(&self, inv: &Invocation) -> ToolResult<EnvironmentSession> {
        self.record("env.activate", inv, vec![])?;
        Ok(EnvironmentSession {
            name: inv.env_name.clone(),
            prefix: self.env_prefix(&inv.env_name),
        })
    }

    async fn deactivate(&self, session: &EnvironmentSession) -> ToolResult<()> {
        self.record("env.deactivate", &Invocation::new(session.name.clone()), vec![])
    }

    async fn remove_default_channel(&self, inv: &Invocation) -> ToolResult<()> {
        self.record("env.remove_default_channel", inv, vec![])
    }

    async fn update(&self, inv: &Invocation, file: &Path) -> ToolResult<()> {
        self.record("env.update", inv, vec![display(file)])?;
        self.maybe_hang("env.update").await;
        let mut state = self.state();
        let declared = state.declared.clone();
        state.packages.extend(declared);
        Ok(())
    }

    async fn install_packages(&self, inv: &Invocation, packages: &[String]) -> ToolResult<()> {
        self.record("env.install_packages", inv, packages.to_vec())?;
        self.state().packages.extend(packages.iter().cloned());
        Ok(())
    }

    async fn list(&self, inv: &Invocation) -> ToolResult<Option<Vec<PackageRecord>>> {
        self.record("env.list", inv, vec![])?;
        let records = self
            .state()
            .packages
            .iter()
            .map(|name| PackageRecord::new(name.clone(), "1.0"))
            .collect();
        Ok(Some(records))
    }

    async fn export(&self, inv: &Invocation) -> ToolResult<String> {
        self.record("env.export", inv, vec![])?;
        let mut manifest = format!("name: {}\ndependencies:\n", inv.env_name);
        for name in self.state().packages.iter() {
            manifest.push_str(&format!("  - {}=1.0\n", name));
        }
        Ok(manifest)
    }

    async fn run(&self, inv: &Invocation, program: &str, args: &[String]) -> ToolResult<CommandResult> {
        let mut recorded = vec![program.to_string()];
        recorded.extend(args.iter().cloned());
        self.record("env.run", inv, recorded)?;
        self.maybe_hang("env.run").await;

        let command = args.last().cloned().unwrap_or_else(|| program.to_string());
        let failing = self
            .state()
            .failing_commands
            .iter()
            .any(|pattern| command.contains(pattern.as_str()));
        let exit_code = if failing { 1 } else { 0 };

        Ok(CommandResult {
            command,
            exit_code,
            stdout: String::new(),
            stderr: if failing { "failed".to_string() } else { String::new() },
            duration_ms: 0,
            success: !failing,
        })
    }
}

#[async_trait]
impl ToolchainInstaller for RecordingTools {
    async fn install(&self, inv: &Invocation, packages: &[String]) -> ToolResult<InstallReport> {
        self.record("toolchain.install", inv, packages.to_vec())?;
        let mut state = self.state();
        let linked: Vec<String> = FAKE_TOOLCHAIN_PACKAGES
            .iter()
            .filter(|name| !state.packages.contains(**name))
            .map(|name| name.to_string())
            .collect();
        state.packages.extend(linked.iter().cloned());
        Ok(InstallReport {
            linked,
            unlinked: Vec::new(),
        })
    }

    async fn uninstall(&self, inv: &Invocation, names: &[String], _force: bool) -> ToolResult<()> {
        self.record("toolchain.uninstall", inv, names.to_vec())?;
        let mut state = self.state();
        for name in names {
            state.packages.remove(name);
        }
        Ok(())
    }
}

#[async_trait]
impl SecondaryResolver for RecordingTools {
    async fn get_config(&self, inv: &Invocation, _project: &Path, key: &str) -> ToolResult<Option<String>> {
        self.record("resolver.get_config", inv, vec![key.to_string()])?;
        Ok(self.state().config.get(key).cloned())
    }

    async fn set_config(&self, inv: &Invocation, _project: &Path, key: &str, value: &str) -> ToolResult<()> {
        self.record("resolver.set_config", inv, vec![key.to_string(), value.to_string()])?;
        self.state()
            .config
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn unset_config(&self, inv: &Invocation, _project: &Path, key: &str) -> ToolResult<()> {
        self.record("resolver.unset_config", inv, vec![key.to_string()])?;
        self.state().config.remove(key);
        Ok(())
    }

    async fn install(&self, inv: &Invocation, project: &Path, no_dev: bool) -> ToolResult<()> {
        self.record("resolver.install", inv, vec![display(project), no_dev.to_string()])?;
        self.maybe_hang("resolver.install").await;
        let lockfile = project.join(self.lockfile_name());
        if !lockfile.exists() {
            std::fs::write(&lockfile, "# generated\n")
                .map_err(|e| ToolError::new("fake", "resolver.install", e.to_string()))?;
        }
        Ok(())
    }

    async fn update(&self, inv: &Invocation, project: &Path, no_dev: bool) -> ToolResult<()> {
        self.record("resolver.update", inv, vec![display(project), no_dev.to_string()])?;
        self.maybe_hang("resolver.update").await;
        std::fs::write(project.join(self.lockfile_name()), "# relocked\n")
            .map_err(|e| ToolError::new("fake", "resolver.update", e.to_string()))
    }
}

#[async_trait]
impl Archiver for RecordingTools {
    async fn pack(&self, inv: &Invocation, request: &PackRequest) -> ToolResult<PathBuf> {
        self.record(
            "archiver.pack",
            inv,
            vec![
                display(&request.destination),
                request.arcroot.clone().unwrap_or_default(),
            ],
        )?;
        self.maybe_hang("archiver.pack").await;
        if let Some(parent) = request.destination.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ToolError::new("fake", "archiver.pack", e.to_string()))?;
        }
        std::fs::write(&request.destination, format!("packed {}\n", inv.env_name))
            .map_err(|e| ToolError::new("fake", "archiver.pack", e.to_string()))?;
        Ok(request.destination.clone())
    }

    async fn unpack(&self, inv: &Invocation, archive: &Path, target_dir: &Path) -> ToolResult<()> {
        self.record("archiver.unpack", inv, vec![display(archive), display(target_dir)])?;
        std::fs::create_dir_all(target_dir.join("conda-meta"))
            .map_err(|e| ToolError::new("fake", "archiver.unpack", e.to_string()))
    }
}
