//! Error types for envpack

use std::path::PathBuf;
use thiserror::Error;

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors raised while checking an [`EnvironmentSpec`](crate::spec::EnvironmentSpec)
/// before any environment is touched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Environment name was empty
    #[error("environment name must not be empty")]
    EmptyName,

    /// No dependency files were given
    #[error("at least one dependency file is required")]
    NoDependencyFiles,

    /// A dependency file does not exist
    #[error("dependency file not found: {0}")]
    MissingFile(PathBuf),

    /// Output directory missing or not a directory
    #[error("output directory is not a directory: {0}")]
    NotADirectory(PathBuf),

    /// Secondary resolver project directory missing
    #[error("project directory not found: {0}")]
    MissingProjectDir(PathBuf),

    /// Post-setup script missing
    #[error("post-setup script not found: {0}")]
    MissingScript(PathBuf),

    /// Destination already exists and `--force` was not given
    #[error("{0} already exists (use --force to overwrite)")]
    DestinationExists(PathBuf),

    /// Compression level outside 0-9
    #[error("compression level must be between 0 and 9, got {0}")]
    CompressLevel(u8),
}

/// Failure reported by an external collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{tool} {operation} failed: {message}")]
pub struct ToolError {
    /// Tool name (`conda`, `poetry`, ...)
    pub tool: String,
    /// Operation that failed (`create`, `install`, ...)
    pub operation: String,
    /// Error field or stderr reported by the tool
    pub message: String,
}

impl ToolError {
    pub fn new(
        tool: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        ToolError {
            tool: tool.into(),
            operation: operation.into(),
            message: message.into(),
        }
    }
}

/// Errors that abort a pipeline run
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Spec failed validation; nothing was created
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// An external tool reported an error or non-zero status
    #[error(transparent)]
    ExternalTool(#[from] ToolError),

    /// A step needed an activated environment and none was active
    #[error("no active environment for {0}")]
    NoActiveEnvironment(String),

    /// Run interrupted by a signal
    #[error("interrupted")]
    Interrupted,

    /// Filesystem error while staging outputs
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    /// Whether the failure happened before any resource was acquired.
    pub fn is_validation(&self) -> bool {
        matches!(self, PipelineError::Validation(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_error_display() {
        let err = ToolError::new("mamba", "install", "PackagesNotFoundError: foo");
        assert_eq!(
            err.to_string(),
            "mamba install failed: PackagesNotFoundError: foo"
        );
    }

    #[test]
    fn test_validation_wraps() {
        let err: PipelineError = ValidationError::EmptyName.into();
        assert!(err.is_validation());
        assert!(err.to_string().contains("must not be empty"));
    }
}
