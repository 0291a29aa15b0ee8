//! Environment specification and validation.

use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Toolchain package set installed when none is configured.
pub const DEFAULT_TOOLCHAIN: &[&str] = &["compilers"];

/// What the pipeline produces.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BuildMode {
    /// Materialize a live environment directory under the output dir
    Create,

    /// Write a relocatable `.tar.gz` archive to the output dir
    Package,
}

impl BuildMode {
    pub fn name(&self) -> &'static str {
        match self {
            BuildMode::Create => "create",
            BuildMode::Package => "package",
        }
    }
}

/// Boolean switches controlling the pipeline.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuildFlags {
    /// Leave the compiler toolchain installed in the final environment
    pub build_tools: bool,

    /// Skip the secondary resolver's dev dependencies
    pub no_dev: bool,

    /// Re-resolve and rewrite the secondary resolver's lockfile
    pub unlock_lockfile: bool,

    /// Replace an existing destination
    pub force_overwrite: bool,

    /// Ask external tools to keep their output short
    pub quiet: bool,
}

/// Caller-supplied description of the environment to build.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvironmentSpec {
    /// Environment name; also names the artifact and manifest
    pub name: String,

    /// Create a directory or a tarball
    pub mode: BuildMode,

    /// Dependency files, merged in order (last declaration wins)
    pub dependency_files: Vec<PathBuf>,

    /// Project directory handed to the secondary resolver
    pub secondary_project_dir: Option<PathBuf>,

    /// Directory receiving the artifact
    pub output_dir: PathBuf,

    /// Version suffix for package-mode artifact names
    pub version: Option<String>,

    pub flags: BuildFlags,

    /// Shell commands run inside the environment before packing
    pub extra_commands: Vec<String>,

    /// Script run after `extra_commands` (create mode)
    pub post_setup_script: Option<PathBuf>,

    /// gzip level for package mode
    pub compress_level: Option<u8>,

    /// Package specs making up the compiler toolchain
    pub toolchain: Vec<String>,
}

impl EnvironmentSpec {
    /// Create a spec with defaults for everything but the essentials.
    pub fn new(
        name: impl Into<String>,
        mode: BuildMode,
        dependency_files: Vec<PathBuf>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            mode,
            dependency_files,
            secondary_project_dir: None,
            output_dir: output_dir.into(),
            version: None,
            flags: BuildFlags::default(),
            extra_commands: Vec::new(),
            post_setup_script: None,
            compress_level: None,
            toolchain: DEFAULT_TOOLCHAIN.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Check invariants and normalize every path to absolute form.
    ///
    /// Touches only the filesystem; no collaborator is called.
    pub fn resolve(&self) -> Result<ResolvedSpec, ValidationError> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(ValidationError::EmptyName);
        }
        if self.dependency_files.is_empty() {
            return Err(ValidationError::NoDependencyFiles);
        }
        if let Some(level) = self.compress_level {
            if level > 9 {
                return Err(ValidationError::CompressLevel(level));
            }
        }

        let mut dependency_files = Vec::with_capacity(self.dependency_files.len());
        for file in &self.dependency_files {
            if !file.is_file() {
                return Err(ValidationError::MissingFile(file.clone()));
            }
            dependency_files.push(absolute(file));
        }

        if !self.output_dir.is_dir() {
            return Err(ValidationError::NotADirectory(self.output_dir.clone()));
        }
        let output_dir = absolute(&self.output_dir);

        let secondary_project_dir = match &self.secondary_project_dir {
            Some(dir) if dir.is_dir() => Some(absolute(dir)),
            Some(dir) => return Err(ValidationError::MissingProjectDir(dir.clone())),
            None => None,
        };

        let post_setup_script = match &self.post_setup_script {
            Some(script) if script.is_file() => Some(absolute(script)),
            Some(script) => return Err(ValidationError::MissingScript(script.clone())),
            None => None,
        };

        let stem = artifact_stem(name, self.mode, self.version.as_deref());
        let destination = match self.mode {
            BuildMode::Create => output_dir.join(name),
            BuildMode::Package => output_dir.join(format!("{}.tar.gz", stem)),
        };

        if path_exists(&destination) && !self.flags.force_overwrite {
            return Err(ValidationError::DestinationExists(destination));
        }

        Ok(ResolvedSpec {
            name: name.to_string(),
            mode: self.mode,
            dependency_files,
            secondary_project_dir,
            destination,
            manifest_file_name: format!("{}.yml", stem),
            flags: self.flags,
            extra_commands: self.extra_commands.clone(),
            post_setup_script,
            compress_level: self.compress_level,
            toolchain: if self.toolchain.is_empty() {
                DEFAULT_TOOLCHAIN.iter().map(|s| s.to_string()).collect()
            } else {
                self.toolchain.clone()
            },
        })
    }
}

/// A validated spec with absolute paths and derived output names.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ResolvedSpec {
    pub name: String,
    pub mode: BuildMode,
    pub dependency_files: Vec<PathBuf>,
    pub secondary_project_dir: Option<PathBuf>,

    /// Directory (create) or archive file (package) to produce
    pub destination: PathBuf,

    /// `<name>[-<version>].yml`
    pub manifest_file_name: String,

    pub flags: BuildFlags,
    pub extra_commands: Vec<String>,
    pub post_setup_script: Option<PathBuf>,
    pub compress_level: Option<u8>,
    pub toolchain: Vec<String>,
}

impl ResolvedSpec {
    /// Whether anything after the dependency merge needs a compiler.
    pub fn wants_commands(&self) -> bool {
        !self.extra_commands.is_empty() || self.post_setup_script.is_some()
    }
}

/// `<name>` in create mode, `<name>[-<version>]` in package mode.
fn artifact_stem(name: &str, mode: BuildMode, version: Option<&str>) -> String {
    match (mode, version.map(str::trim)) {
        (BuildMode::Package, Some(v)) if !v.is_empty() => format!("{}-{}", name, v),
        _ => name.to_string(),
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::fs::canonicalize(path)
        .or_else(|_| std::path::absolute(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

/// File-or-directory existence, counting dangling symlinks.
fn path_exists(path: &Path) -> bool {
    std::fs::symlink_metadata(path).is_ok()
}
