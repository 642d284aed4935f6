//! Contract Invariant Tests
//!
//! These tests verify the non-negotiable guarantees.

use serde_json::json;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::tempdir;

use slurm_hybrid_core::{
    executor::{ExecutorError, StepError},
    pipeline::PipelineError,
    render::{RenderError, WriteOutcome, INSTALL_SCRIPT_NAME, SCRIPT_MODE},
    schema::RawConfig,
    secrets::RecordingSecretStore,
    tool_runner::{ExternalToolError, ToolRunner},
    HybridPipeline,
};

fn hybrid_config(output_dir: &Path) -> RawConfig {
    RawConfig::new()
        .with("slurm_cluster_name", "hpc")
        .with("enable_hybrid", true)
        .with("output_dir", output_dir.to_str().unwrap())
        .with("scripts_dir", "/tmp/y")
        .with("bucket_path", "gs://b/p")
        .with("munge_key_secret", "hpc-munge-key")
        .with("jwt_key_secret", "hpc-jwt-key")
        .with("secret_accessors", json!(["controller@example.iam"]))
}

/// Pretends to run the installer: records the call and drops a config.tgz.
struct FakeInstaller {
    calls: Mutex<Vec<String>>,
    exit_ok: bool,
}

impl FakeInstaller {
    fn new(exit_ok: bool) -> Self {
        Self { calls: Mutex::new(vec![]), exit_ok }
    }
}

impl ToolRunner for FakeInstaller {
    fn run(&self, program: &str, args: &[&str], cwd: &Path, log_path: &Path) -> Result<(), ExternalToolError> {
        self.calls.lock().unwrap().push(format!("{program} {}", args.join(" ")));
        // the script must already be on disk when it is run
        assert!(cwd.join(INSTALL_SCRIPT_NAME).exists());
        fs::write(log_path, "installing\n").unwrap();
        if !self.exit_ok {
            return Err(ExternalToolError::Failed {
                program: program.to_string(),
                status: "exit status: 1".to_string(),
                log_path: log_path.to_path_buf(),
            });
        }
        fs::write(cwd.join("config.tgz"), b"archive").unwrap();
        Ok(())
    }
}

#[test]
fn invariant_script_lines_in_order() {
    let pipeline = HybridPipeline::new().unwrap();
    let raw = RawConfig::new()
        .with("enable_hybrid", true)
        .with("output_dir", "/tmp/x")
        .with("scripts_dir", "/tmp/y")
        .with("bucket_path", "gs://b/p");

    let script = pipeline.render(&raw).unwrap().unwrap();
    let lines: Vec<&str> = script.content.lines().collect();
    let find = |pred: &dyn Fn(&str) -> bool| {
        lines
            .iter()
            .position(|l| pred(l))
            .unwrap_or_else(|| panic!("missing line in:\n{}", script.content))
    };

    let fail_fast = find(&|l| l == "set -e");
    let export = find(&|l| l.starts_with("export ") && l.ends_with("=/tmp/x"));
    let install = find(&|l| l.contains("/tmp/y/requirements.txt") && l.contains("> ") && l.contains("pip_install.log"));
    let setup = find(&|l| l.contains("--hybrid --bucket gs://b/p"));
    let extract = find(&|l| l.starts_with("unzip "));
    let package = find(&|l| {
        l.starts_with("tar ")
            && l.contains("--exclude='*.log'")
            && l.contains("--exclude='install_hybrid.sh'")
            && l.contains("--exclude='*.zip'")
    });
    let success = lines.len() - 1;

    assert!(fail_fast < export);
    assert!(export < install);
    assert!(install < setup);
    assert!(setup < extract);
    assert!(extract < package);
    assert!(package < success);
    assert!(lines[success].contains("Success"));
    assert!(lines[0].starts_with("#!"));
}

#[test]
fn invariant_render_is_idempotent() {
    let dir = tempdir().unwrap();
    let pipeline = HybridPipeline::new().unwrap();
    let raw = hybrid_config(dir.path());

    let first = pipeline.render(&raw).unwrap().unwrap();
    let second = pipeline.render(&raw).unwrap().unwrap();
    assert_eq!(first.content.as_bytes(), second.content.as_bytes());

    let d1 = pipeline.deploy(&raw).unwrap();
    let d2 = pipeline.deploy(&raw).unwrap();
    assert_eq!(d1.config_hash, d2.config_hash);
    assert_eq!(d1.outputs.script_sha256, d2.outputs.script_sha256);
    assert_eq!(d1.outputs.script_sha256.as_deref(), Some(first.sha256().as_str()));

    let outcome = |d: &slurm_hybrid_core::Deployment| {
        d.report.output::<slurm_hybrid_core::WrittenArtifact>("install-script", "artifact").unwrap().outcome
    };
    assert_eq!(outcome(&d1), WriteOutcome::Created);
    assert_eq!(outcome(&d2), WriteOutcome::Unchanged);
}

#[cfg(unix)]
#[test]
fn invariant_script_mode_is_0750() {
    use std::os::unix::fs::PermissionsExt;

    let pipeline = HybridPipeline::new().unwrap();
    for umask in [0o077, 0o000, 0o022] {
        let dir = tempdir().unwrap();
        let previous = unsafe { libc::umask(umask) };
        let deployment = pipeline.deploy(&hybrid_config(dir.path()));
        unsafe { libc::umask(previous) };

        let path = deployment.unwrap().outputs.install_script.unwrap();
        assert_eq!(path, dir.path().join(INSTALL_SCRIPT_NAME));
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, SCRIPT_MODE, "umask {umask:o}");
        assert_eq!(mode, 0o750);
    }
}

#[test]
fn invariant_hybrid_disabled_produces_nothing() {
    let dir = tempdir().unwrap();
    let store = Arc::new(RecordingSecretStore::new());
    let pipeline = HybridPipeline::new().unwrap().with_secret_store(store.clone());
    let raw = hybrid_config(dir.path()).with("enable_hybrid", false);

    let deployment = pipeline.deploy(&raw).unwrap();
    assert!(deployment.report.steps.is_empty());
    assert!(deployment.outputs.install_script.is_none());
    assert!(!dir.path().join(INSTALL_SCRIPT_NAME).exists());
    assert!(store.grants().is_empty());
    assert!(deployment.outputs.hybrid_conf.is_none());
    // outputs that do not depend on hybrid mode are still exposed
    assert_eq!(deployment.outputs.bucket_path, "gs://b/p");
    assert_eq!(deployment.outputs.munge_secret_id.as_deref(), Some("hpc-munge-key"));
}

#[test]
fn invariant_hybrid_enabled_grants_and_renders() {
    let dir = tempdir().unwrap();
    let store = Arc::new(RecordingSecretStore::new());
    let pipeline = HybridPipeline::new().unwrap().with_secret_store(store.clone());

    let deployment = pipeline.deploy(&hybrid_config(dir.path())).unwrap();
    let ids = deployment.report.step_ids();
    let pos = |id: &str| ids.iter().position(|s| *s == id).unwrap();
    assert!(pos("controller-address") < pos("install-script"));
    assert_eq!(store.grants().len(), 2);
    assert!(deployment.outputs.instructions.contains(INSTALL_SCRIPT_NAME));
    let conf = deployment.outputs.hybrid_conf.unwrap();
    assert_eq!(conf.slurm_uid, Some(401));
    assert_eq!(conf.output_dir.as_deref(), dir.path().to_str());
}

#[test]
fn invariant_render_skipped_when_hybrid_disabled() {
    let pipeline = HybridPipeline::new().unwrap();
    let raw = RawConfig::new()
        .with("scripts_dir", "/tmp/y")
        .with("bucket_path", "gs://b/p");
    assert!(pipeline.render(&raw).unwrap().is_none());
}

#[test]
fn invariant_validation_blocks_writes() {
    let dir = tempdir().unwrap();
    let pipeline = HybridPipeline::new().unwrap();
    let raw = hybrid_config(dir.path())
        .with("slurm_cluster_name", "Cluster-With-Caps")
        .with("controller_startup_scripts", json!([{ "filename": "a.sh", "content": "x", "source": "gs://b/a.sh" }]));

    let err = pipeline.deploy(&raw).unwrap_err();
    match err {
        PipelineError::ValidationFailed(e) => {
            assert_eq!(e.options(), vec!["slurm_cluster_name", "controller_startup_scripts[0]"]);
        }
        other => panic!("expected validation failure, got {other}"),
    }
    assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn invariant_missing_value_aborts_before_any_step() {
    let dir = tempdir().unwrap();
    let store = Arc::new(RecordingSecretStore::new());
    let pipeline = HybridPipeline::new().unwrap().with_secret_store(store.clone());
    let mut raw = hybrid_config(dir.path());
    raw.set("scripts_dir", serde_json::Value::Null);

    let err = pipeline.deploy(&raw).unwrap_err();
    assert!(matches!(
        err,
        PipelineError::RenderFailed(RenderError::MissingValue(ref m)) if m.option == "scripts_dir"
    ));
    assert!(err.to_string().contains("scripts_dir"));
    // no grant was made and nothing was written
    assert!(store.grants().is_empty());
    assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn invariant_archive_runs_after_script() {
    let dir = tempdir().unwrap();
    let installer = Arc::new(FakeInstaller::new(true));
    let pipeline = HybridPipeline::new().unwrap().with_tool_runner(installer.clone());
    let raw = hybrid_config(dir.path()).with("execute_install_script", true);

    let deployment = pipeline.deploy(&raw).unwrap();
    assert_eq!(installer.calls.lock().unwrap().len(), 1);
    assert!(installer.calls.lock().unwrap()[0].ends_with(INSTALL_SCRIPT_NAME));
    assert_eq!(deployment.outputs.config_archive, Some(dir.path().join("config.tgz")));
    assert!(deployment.outputs.instructions.contains("config.tgz"));
}

#[test]
fn invariant_tool_failure_keeps_log() {
    let dir = tempdir().unwrap();
    let pipeline = HybridPipeline::new()
        .unwrap()
        .with_tool_runner(Arc::new(FakeInstaller::new(false)));
    let raw = hybrid_config(dir.path()).with("execute_install_script", true);

    let err = pipeline.deploy(&raw).unwrap_err();
    match err {
        PipelineError::ApplyFailed(ExecutorError::StepFailed { step, completed, source }) => {
            assert_eq!(step, "config-archive");
            assert!(completed.contains(&"install-script".to_string()));
            assert!(matches!(source, StepError::ExternalTool(ExternalToolError::Failed { .. })));
        }
        other => panic!("expected tool failure, got {other}"),
    }
    assert!(dir.path().join("install_hybrid.log").exists());
    assert!(!dir.path().join("config.tgz").exists());
}

#[test]
fn invariant_literal_credentials_rejected() {
    let dir = tempdir().unwrap();
    let pipeline = HybridPipeline::new().unwrap();
    let raw = hybrid_config(dir.path()).with(
        "cloudsql",
        json!({ "server_ip": "10.0.0.2", "user": "slurm", "password": "verysecure", "db_name": "slurm_acct" }),
    );

    let result = pipeline.validate(&raw);
    assert!(!result.valid);
    assert_eq!(result.violations[0].option, "cloudsql.password");
}

#[cfg(feature = "test-hooks")]
#[test]
fn invariant_render_always_resolves() {
    use slurm_hybrid_core::pipeline::{get_resolve_call_count, reset_resolve_call_count};

    let pipeline = HybridPipeline::new().unwrap();
    reset_resolve_call_count();
    let _ = pipeline.render(&RawConfig::new().with("slurm_cluster_name", "1bad"));
    assert!(get_resolve_call_count() >= 1);
}
