//! envpack - reproducible conda environment builder
//!
//! Provides an environment assembly pipeline that:
//! - Builds a fresh named environment from ordered dependency files
//! - Installs a compiler toolchain only for as long as it is needed
//! - Delegates to a lockfile-driven secondary resolver (poetry)
//! - Packs the result into a relocatable archive or a live directory
//! - Releases every override and temporary resource on any exit path
//!
//! External tools are reached only through the traits in [`collaborators`].

pub mod collaborators;
pub mod context;
pub mod error;
pub mod fakes;
pub mod package;
pub mod pipeline;
pub mod scanner;
pub mod spec;
pub mod telemetry;
pub mod toolchain;

// Re-export key types
pub use collaborators::{
    Archiver, Collaborators, CommandResult, EnvironmentManager, EnvironmentSession, InstallMode,
    InstallReport, Invocation, PackRequest, SecondaryResolver, ToolResult, ToolchainInstaller,
};
pub use context::{PendingCleanup, PipelineContext};
pub use error::{PipelineError, Result, ToolError, ValidationError};
pub use package::{is_runtime_library, PackageDiff, PackageRecord, RUNTIME_LIBRARY_PREFIX};
pub use pipeline::{ArtifactLocation, Pipeline};
pub use scanner::{has_risky_dependency, scan_files};
pub use spec::{BuildFlags, BuildMode, EnvironmentSpec, ResolvedSpec};
pub use telemetry::init_tracing;
pub use toolchain::{Toolchain, ToolchainState};
