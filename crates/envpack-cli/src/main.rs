//! envpack - reproducible conda environment builder CLI
//!
//! ## Commands
//!
//! - `create`: build a live environment directory under `--output-dir`
//! - `package`: build a relocatable `<name>[-<version>].tar.gz`
//! - `doctor`: report which external tools are available

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use envpack::{
    ArtifactLocation, BuildFlags, BuildMode, Collaborators, EnvironmentSpec, Pipeline,
};
use envpack_tools::{check_tools, ToolPaths};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{info, Level};

#[derive(Parser)]
#[command(name = "envpack")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Build reproducible conda environments and relocatable archives", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Keep tool and log output short
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Emit JSON-formatted log lines and a JSON run report
    #[arg(long, global = true)]
    json: bool,

    /// Force coloured log output
    #[arg(long, global = true, overrides_with = "no_color")]
    color: bool,

    /// Disable coloured log output
    #[arg(long, global = true, overrides_with = "color")]
    no_color: bool,

    #[command(flatten)]
    tools: ToolArgs,

    #[command(subcommand)]
    command: Commands,
}

/// External binary locations. Unset flags fall back to `ENVPACK_*`
/// variables, then to the bare tool names.
#[derive(Args, Debug, Clone, Default)]
struct ToolArgs {
    /// conda binary [env: ENVPACK_CONDA]
    #[arg(long, global = true)]
    conda: Option<PathBuf>,

    /// mamba binary used for solves [env: ENVPACK_MAMBA]
    #[arg(long, global = true)]
    mamba: Option<PathBuf>,

    /// poetry binary [env: ENVPACK_POETRY]
    #[arg(long, global = true)]
    poetry: Option<PathBuf>,

    /// conda-pack binary [env: ENVPACK_CONDA_PACK]
    #[arg(long, global = true)]
    conda_pack: Option<PathBuf>,

    /// tar binary [env: ENVPACK_TAR]
    #[arg(long, global = true)]
    tar: Option<PathBuf>,
}

impl ToolArgs {
    /// Flags layered over [`ToolPaths::from_env`].
    fn into_paths(self) -> ToolPaths {
        let base = ToolPaths::from_env();
        ToolPaths {
            conda: self.conda.unwrap_or(base.conda),
            mamba: self.mamba.unwrap_or(base.mamba),
            poetry: self.poetry.unwrap_or(base.poetry),
            conda_pack: self.conda_pack.unwrap_or(base.conda_pack),
            tar: self.tar.unwrap_or(base.tar),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Build a live environment directory
    Create {
        #[command(flatten)]
        build: BuildArgs,

        /// Shell command to run inside the environment (repeatable, in order)
        #[arg(long = "command", value_name = "CMD")]
        commands: Vec<String>,

        /// Script run after the commands, with the environment root as argument
        #[arg(long)]
        post_setup_script: Option<PathBuf>,
    },

    /// Build a relocatable tar.gz archive
    Package {
        #[command(flatten)]
        build: BuildArgs,

        /// Version appended to the archive name
        #[arg(long = "version", value_name = "VERSION")]
        env_version: Option<String>,

        /// gzip compression level
        #[arg(long, value_parser = clap::value_parser!(u8).range(0..=9))]
        compress_level: Option<u8>,
    },

    /// Report which external tools are available
    Doctor,
}

/// Arguments shared by `create` and `package`.
#[derive(Args, Debug, Clone)]
struct BuildArgs {
    /// Environment name
    #[arg(short, long)]
    name: String,

    /// Dependency file (repeatable; later files win)
    #[arg(short, long = "file", value_name = "FILE", required = true)]
    files: Vec<PathBuf>,

    /// Poetry project directory
    #[arg(long)]
    poetry_dir: Option<PathBuf>,

    /// Directory receiving the artifact
    #[arg(short, long, default_value = ".")]
    output_dir: PathBuf,

    /// Compiler toolchain packages (comma separated)
    #[arg(long, env = "ENVPACK_TOOLCHAIN", value_delimiter = ',')]
    toolchain: Vec<String>,

    /// Keep the compiler toolchain in the final environment
    #[arg(long)]
    build_tools: bool,

    /// Skip poetry dev dependencies
    #[arg(long)]
    no_dev: bool,

    /// Re-resolve and rewrite poetry.lock
    #[arg(long)]
    unlock: bool,

    /// Replace an existing output
    #[arg(long)]
    force: bool,
}

impl BuildArgs {
    fn into_spec(self, mode: BuildMode, quiet: bool) -> EnvironmentSpec {
        let mut spec = EnvironmentSpec::new(self.name, mode, self.files, self.output_dir);
        spec.secondary_project_dir = self.poetry_dir;
        spec.flags = BuildFlags {
            build_tools: self.build_tools,
            no_dev: self.no_dev,
            unlock_lockfile: self.unlock,
            force_overwrite: self.force,
            quiet,
        };
        let toolchain: Vec<String> = self
            .toolchain
            .into_iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
        if !toolchain.is_empty() {
            spec.toolchain = toolchain;
        }
        spec
    }
}

impl Commands {
    /// Environment spec for build commands; `None` for `doctor`.
    fn build_spec(self, quiet: bool) -> Option<EnvironmentSpec> {
        match self {
            Commands::Create {
                build,
                commands,
                post_setup_script,
            } => {
                let mut spec = build.into_spec(BuildMode::Create, quiet);
                spec.extra_commands = commands;
                spec.post_setup_script = post_setup_script;
                Some(spec)
            }
            Commands::Package {
                build,
                env_version,
                compress_level,
            } => {
                let mut spec = build.into_spec(BuildMode::Package, quiet);
                spec.version = env_version;
                spec.compress_level = compress_level;
                Some(spec)
            }
            Commands::Doctor => None,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            // --help and --version are not errors
            return if err.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else if cli.quiet {
        Level::WARN
    } else {
        Level::INFO
    };
    let ansi = if cli.no_color {
        false
    } else {
        cli.color || std::io::stderr().is_terminal()
    };
    envpack::init_tracing(cli.json, level, ansi);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let paths = cli.tools.into_paths();
    let json = cli.json;

    let Some(spec) = cli.command.build_spec(cli.quiet) else {
        return cmd_doctor(&paths, json).await;
    };

    let tools = envpack_tools::collaborators(&paths);
    let artifact = cmd_build(tools, &spec, shutdown_signal()).await?;
    print_report(&artifact, json)
}

/// Resolves on Ctrl-C. If the handler cannot be installed, never resolves.
async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
    info!("Interrupted, cleaning up");
}

async fn cmd_build(
    tools: Collaborators,
    spec: &EnvironmentSpec,
    shutdown: impl std::future::Future<Output = ()>,
) -> Result<ArtifactLocation> {
    let pipeline = Pipeline::new(tools);
    pipeline
        .run_until(spec, shutdown)
        .await
        .with_context(|| format!("Failed to {} environment '{}'", spec.mode.name(), spec.name))
}

fn print_report(artifact: &ArtifactLocation, json: bool) -> Result<()> {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(artifact).context("Failed to serialize run report")?
        );
        return Ok(());
    }

    println!("{}", render_report(artifact));
    Ok(())
}

fn render_report(artifact: &ArtifactLocation) -> String {
    let mut out = String::new();
    out.push_str(&format!("Artifact:  {}\n", artifact.path.display()));
    out.push_str(&format!("Manifest:  {}\n", artifact.manifest_path.display()));
    out.push_str(&format!("Digest:    {}\n", artifact.manifest_digest));
    if let Some(lockfile) = &artifact.lockfile_path {
        out.push_str(&format!("Lockfile:  {}\n", lockfile.display()));
    }
    out.push_str(&format!(
        "Toolchain: {}\n",
        if artifact.toolchain_retained {
            "retained"
        } else {
            "removed"
        }
    ));
    if !artifact.commands.is_empty() {
        out.push_str(&format!(
            "Commands:  {} run, {} failed\n",
            artifact.commands.len(),
            artifact.failed_commands()
        ));
        for cmd in artifact.commands.iter().filter(|c| !c.passed()) {
            out.push_str(&format!("  - {} (exit {})\n", cmd.command, cmd.exit_code));
        }
    }
    out.push_str(&format!("Run:       {} ({} ms)", artifact.run_id, artifact.duration_ms));
    out
}

async fn cmd_doctor(paths: &ToolPaths, json: bool) -> Result<()> {
    let statuses = check_tools(paths).await;

    if json {
        let report: Vec<serde_json::Value> = statuses
            .iter()
            .map(|s| {
                serde_json::json!({
                    "tool": s.name,
                    "path": s.path,
                    "available": s.is_available(),
                    "version": s.version,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("envpack tools");
        println!("=============");
        for status in &statuses {
            match &status.version {
                Some(version) => println!("{:<11} yes  {}", status.name, version),
                None => println!("{:<11} no   ({})", status.name, status.path.display()),
            }
        }
    }

    let missing: Vec<&str> = statuses
        .iter()
        .filter(|s| !s.is_available())
        .map(|s| s.name)
        .collect();
    if !missing.is_empty() {
        anyhow::bail!("Missing tools: {}", missing.join(", "));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use envpack::fakes::RecordingTools;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args.iter().copied()).expect("parse failed")
    }

    #[test]
    fn test_package_args_build_spec() {
        let cli = parse(&[
            "envpack",
            "package",
            "--name",
            "demo",
            "--file",
            "base.yml",
            "--file",
            "extra.yml",
            "--version",
            "1.2.0",
            "--compress-level",
            "9",
            "--no-dev",
            "--force",
        ]);
        let spec = cli.command.build_spec(false).unwrap();

        assert_eq!(spec.mode, BuildMode::Package);
        assert_eq!(
            spec.dependency_files,
            vec![PathBuf::from("base.yml"), PathBuf::from("extra.yml")]
        );
        assert_eq!(spec.version.as_deref(), Some("1.2.0"));
        assert_eq!(spec.compress_level, Some(9));
        assert!(spec.flags.no_dev);
        assert!(spec.flags.force_overwrite);
        assert!(!spec.flags.build_tools);
        assert_eq!(spec.toolchain, vec!["compilers".to_string()]);
    }

    #[test]
    fn test_create_args_keep_command_order() {
        let cli = parse(&[
            "envpack",
            "--quiet",
            "create",
            "-n",
            "demo",
            "-f",
            "env.yml",
            "--command",
            "pip check",
            "--command",
            "python -V",
            "--post-setup-script",
            "setup.sh",
            "--toolchain",
            "gcc, gxx",
        ]);
        let quiet = cli.quiet;
        let spec = cli.command.build_spec(quiet).unwrap();

        assert_eq!(spec.mode, BuildMode::Create);
        assert!(spec.flags.quiet);
        assert_eq!(spec.extra_commands, vec!["pip check", "python -V"]);
        assert_eq!(spec.post_setup_script, Some(PathBuf::from("setup.sh")));
        assert_eq!(spec.toolchain, vec!["gcc", "gxx"]);
    }

    #[test]
    fn test_usage_errors() {
        // --file is required
        assert!(Cli::try_parse_from(["envpack", "package", "--name", "demo"]).is_err());
        // --command is create-only
        assert!(Cli::try_parse_from([
            "envpack", "package", "-n", "demo", "-f", "a.yml", "--command", "ls"
        ])
        .is_err());
        // --version is package-only
        assert!(Cli::try_parse_from([
            "envpack", "create", "-n", "demo", "-f", "a.yml", "--version", "1.0"
        ])
        .is_err());
        assert!(Cli::try_parse_from([
            "envpack", "package", "-n", "demo", "-f", "a.yml", "--compress-level", "10"
        ])
        .is_err());
    }

    #[test]
    fn test_help_is_not_an_error_exit() {
        let err = Cli::try_parse_from(["envpack", "--help"]).err().unwrap();
        assert!(!err.use_stderr());
    }

    #[test]
    fn test_tool_paths_from_args() {
        let cli = parse(&["envpack", "--mamba", "/opt/bin/micromamba", "doctor"]);
        let paths = cli.tools.into_paths();
        assert_eq!(paths.mamba, PathBuf::from("/opt/bin/micromamba"));
        assert!(cli.command.build_spec(false).is_none());
    }

    #[test]
    fn test_tool_paths_default_to_environment() {
        let paths = ToolArgs::default().into_paths();
        assert_eq!(paths, ToolPaths::from_env());
    }

    #[tokio::test]
    async fn test_cmd_build_with_fakes() {
        let dir = tempfile::tempdir().unwrap();
        let env_file = dir.path().join("env.yml");
        std::fs::write(&env_file, "dependencies:\n  - python=3.11\n").unwrap();

        let spec = EnvironmentSpec::new("demo", BuildMode::Package, vec![env_file], dir.path());
        let tools = RecordingTools::new();
        let artifact = cmd_build(tools.collaborators(), &spec, std::future::pending())
            .await
            .unwrap();

        assert!(artifact.path.ends_with("demo.tar.gz"));
        let report = render_report(&artifact);
        assert!(report.contains("demo.tar.gz"));
        assert!(report.contains("Toolchain: removed"));
    }

    #[tokio::test]
    async fn test_cmd_build_error_has_context() {
        let dir = tempfile::tempdir().unwrap();
        let spec = EnvironmentSpec::new(
            "demo",
            BuildMode::Create,
            vec![dir.path().join("missing.yml")],
            dir.path(),
        );
        let tools = RecordingTools::new();
        let err = cmd_build(tools.collaborators(), &spec, std::future::pending())
            .await
            .unwrap_err();

        assert!(format!("{:#}", err).contains("Failed to create environment 'demo'"));
        assert!(tools.calls().is_empty());
    }
}
