//! Cleanup guarantees: overrides and temp resources never outlive a run.

use envpack::fakes::RecordingTools;
use envpack::{BuildMode, EnvironmentSpec, Pipeline, PipelineError};
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;

fn fixture(mode: BuildMode) -> (TempDir, EnvironmentSpec, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let env_file = dir.path().join("env.yml");
    std::fs::write(&env_file, "dependencies:\n  - python=3.11\n").unwrap();
    let out = dir.path().join("out");
    std::fs::create_dir(&out).unwrap();
    let project = dir.path().join("project");
    std::fs::create_dir(&project).unwrap();

    let spec = EnvironmentSpec::new("demo", mode, vec![env_file], out);
    (dir, spec, project)
}

fn cache_dir_used(tools: &RecordingTools, op: &str) -> PathBuf {
    tools.calls_to(op)[0]
        .env_vars
        .get("POETRY_CACHE_DIR")
        .map(PathBuf::from)
        .expect("cache override was set")
}

/// Test: resolver failure restores the setting and drops the cache override
#[tokio::test]
async fn test_resolver_failure_restores_state() {
    let (_dir, mut spec, project) = fixture(BuildMode::Package);
    spec.secondary_project_dir = Some(project);
    let tools = RecordingTools::new();
    tools.seed_config("virtualenvs.create", "true");
    tools.fail_on("resolver.install");
    let pipeline = Pipeline::new(tools.collaborators());

    let err = pipeline.run(&spec).await.unwrap_err();

    match err {
        PipelineError::ExternalTool(e) => assert_eq!(e.operation, "resolver.install"),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(tools.config("virtualenvs.create").as_deref(), Some("true"));
    assert!(!cache_dir_used(&tools, "resolver.install").exists());

    // session released, nothing after the failure ran
    assert_eq!(tools.sequence().last().map(String::as_str), Some("env.deactivate"));
    assert_eq!(tools.count("archiver.pack"), 0);
    assert_eq!(tools.count("env.export"), 0);
}

/// Test: setting that was unset before the run is unset again after a failure
#[tokio::test]
async fn test_resolver_failure_unsets_new_setting() {
    let (_dir, mut spec, project) = fixture(BuildMode::Package);
    spec.secondary_project_dir = Some(project);
    spec.flags.unlock_lockfile = true;
    let tools = RecordingTools::new();
    tools.fail_on("resolver.update");
    let pipeline = Pipeline::new(tools.collaborators());

    assert!(pipeline.run(&spec).await.is_err());
    assert_eq!(tools.config("virtualenvs.create"), None);
    assert_eq!(tools.count("resolver.unset_config"), 1);
}

/// Test: failed pack in create mode leaves no staging directory behind
#[tokio::test]
async fn test_pack_failure_removes_staging() {
    let (_dir, spec, _project) = fixture(BuildMode::Create);
    let tools = RecordingTools::new();
    tools.fail_on("archiver.pack");
    let pipeline = Pipeline::new(tools.collaborators());

    let err = pipeline.run(&spec).await.unwrap_err();
    assert!(matches!(err, PipelineError::ExternalTool(_)));

    let staged = PathBuf::from(&tools.calls_to("archiver.pack")[0].args[0]);
    let staging_dir = staged.parent().unwrap().to_path_buf();
    assert!(!staging_dir.exists());
    assert_eq!(tools.count("archiver.unpack"), 0);
    assert!(!spec.output_dir.join("demo").exists());
}

/// Test: failure in the first merge still deactivates the environment
#[tokio::test]
async fn test_early_failure_releases_session() {
    let (_dir, spec, _project) = fixture(BuildMode::Package);
    let tools = RecordingTools::new();
    tools.fail_on("toolchain.install");
    let pipeline = Pipeline::new(tools.collaborators());

    assert!(pipeline.run(&spec).await.is_err());
    assert_eq!(tools.count("env.deactivate"), 1);
    assert_eq!(tools.count("env.update"), 0);
}

/// Test: interruption mid-resolver runs the same cleanup as a failure
#[tokio::test]
async fn test_interrupt_runs_cleanup() {
    let (_dir, mut spec, project) = fixture(BuildMode::Package);
    spec.secondary_project_dir = Some(project);
    let tools = RecordingTools::new();
    tools.seed_config("virtualenvs.create", "true");
    tools.hang_on("resolver.install");
    let pipeline = Pipeline::new(tools.collaborators());

    let err = pipeline
        .run_until(&spec, tokio::time::sleep(Duration::from_millis(50)))
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::Interrupted));
    assert_eq!(tools.config("virtualenvs.create").as_deref(), Some("true"));
    assert!(!cache_dir_used(&tools, "resolver.install").exists());
    assert_eq!(tools.count("env.deactivate"), 2);
}

/// Test: an already-fired shutdown signal stops the run before any call
#[tokio::test]
async fn test_interrupt_before_start() {
    let (_dir, spec, _project) = fixture(BuildMode::Package);
    let tools = RecordingTools::new();
    let pipeline = Pipeline::new(tools.collaborators());

    let err = pipeline
        .run_until(&spec, std::future::ready(()))
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::Interrupted));
    assert!(tools.calls().is_empty());
}
