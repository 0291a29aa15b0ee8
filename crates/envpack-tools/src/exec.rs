//! External process execution.

use envpack::{CommandResult, ToolError, ToolResult};
use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;
use tokio::process::Command;
use tracing::debug;

/// A fully described invocation of an external tool.
#[derive(Debug, Clone)]
pub struct ToolCommand {
    /// Tool name used in error messages
    tool: String,
    /// Operation name used in error messages
    operation: String,
    program: PathBuf,
    args: Vec<String>,
    env_vars: BTreeMap<String, String>,
    cwd: Option<PathBuf>,
}

impl ToolCommand {
    pub fn new(tool: &str, operation: &str, program: impl AsRef<OsStr>) -> Self {
        ToolCommand {
            tool: tool.to_string(),
            operation: operation.to_string(),
            program: PathBuf::from(program.as_ref()),
            args: Vec::new(),
            env_vars: BTreeMap::new(),
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Append `flag` when `enabled`.
    pub fn flag(self, flag: &str, enabled: bool) -> Self {
        if enabled {
            self.arg(flag)
        } else {
            self
        }
    }

    pub fn envs(mut self, vars: &BTreeMap<String, String>) -> Self {
        self.env_vars
            .extend(vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env_vars.insert(key.to_string(), value.to_string());
        self
    }

    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.cwd = Some(dir.to_path_buf());
        self
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    pub fn get_env(&self, key: &str) -> Option<&str> {
        self.env_vars.get(key).map(String::as_str)
    }

    /// Command line for logs and reports.
    pub fn display(&self) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }

    pub fn error(&self, message: impl Into<String>) -> ToolError {
        ToolError::new(self.tool.clone(), self.operation.clone(), message)
    }

    /// Run to completion, capturing output. A non-zero exit is reported in
    /// the result; only a failure to spawn is an error.
    pub async fn status(&self) -> ToolResult<CommandResult> {
        let start = Instant::now();
        debug!(command = %self.display(), "Executing");

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(&self.env_vars)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.cwd {
            command.current_dir(dir);
        }

        let output = command
            .output()
            .await
            .map_err(|e| self.error(format!("could not start {}: {}", self.program.display(), e)))?;

        let exit_code = output.status.code().unwrap_or(-1);
        Ok(CommandResult {
            command: self.display(),
            exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration_ms: start.elapsed().as_millis() as u64,
            success: output.status.success(),
        })
    }

    /// Run and require success; returns stdout.
    pub async fn output(&self) -> ToolResult<String> {
        let result = self.status().await?;
        if !result.passed() {
            return Err(self.error(failure_message(&result)));
        }
        Ok(result.stdout)
    }
}

/// Best error text from a failed command: stderr, else stdout, else the code.
pub fn failure_message(result: &CommandResult) -> String {
    let stderr = result.stderr.trim();
    if !stderr.is_empty() {
        return stderr.to_string();
    }
    let stdout = result.stdout.trim();
    if !stdout.is_empty() {
        return stdout.to_string();
    }
    format!("exited with code {}", result.exit_code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_output_captures_stdout() {
        let out = ToolCommand::new("sh", "echo", "sh")
            .args(["-c", "echo hello"])
            .output()
            .await
            .expect("execute failed");
        assert_eq!(out.trim(), "hello");
    }

    #[tokio::test]
    async fn test_status_reports_failure() {
        let result = ToolCommand::new("sh", "exit", "sh")
            .args(["-c", "echo oops >&2; exit 3"])
            .status()
            .await
            .expect("execute failed");
        assert!(!result.passed());
        assert_eq!(result.exit_code, 3);
        assert_eq!(failure_message(&result), "oops");
    }

    #[tokio::test]
    async fn test_output_failure_is_tool_error() {
        let err = ToolCommand::new("conda", "create", "false")
            .output()
            .await
            .unwrap_err();
        assert_eq!(err.tool, "conda");
        assert_eq!(err.operation, "create");
        assert!(err.message.contains("exited with code 1"));
    }

    #[tokio::test]
    async fn test_env_vars_are_passed() {
        let out = ToolCommand::new("sh", "env", "sh")
            .args(["-c", "printf %s \"$ENVPACK_TEST_VAR\""])
            .env("ENVPACK_TEST_VAR", "cached")
            .output()
            .await
            .unwrap();
        assert_eq!(out, "cached");
    }

    #[tokio::test]
    async fn test_missing_program() {
        let err = ToolCommand::new("poetry", "install", "/nonexistent/envpack-poetry")
            .status()
            .await
            .unwrap_err();
        assert!(err.message.contains("could not start"));
    }

    #[test]
    fn test_flag_and_display() {
        let cmd = ToolCommand::new("mamba", "install", "mamba")
            .args(["install", "-y"])
            .flag("--quiet", true)
            .flag("--json", false);
        assert_eq!(cmd.display(), "mamba install -y --quiet");
    }
}
