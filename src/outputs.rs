//! Named deployment outputs handed back to the orchestrator.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

use crate::executor::ApplyReport;
use crate::render::WrittenArtifact;
use crate::resolver::{MissingValue, ResolvedConfig};
use crate::steps::{PackagedArchive, CONFIG_ARCHIVE_STEP, INSTALL_SCRIPT_STEP};

/// Settings of the externally hosted controller, as setup.py reads them
/// from the hybrid section of the cluster config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HybridConf {
    pub slurm_control_host: Option<String>,
    pub slurm_control_addr: Option<String>,
    pub slurm_bin_dir: Option<String>,
    pub slurm_log_dir: Option<String>,
    pub slurm_uid: Option<u64>,
    pub slurm_gid: Option<u64>,
    pub install_dir: Option<String>,
    pub output_dir: Option<String>,
    pub munge_mount: Option<Value>,
}

impl HybridConf {
    fn capture(config: &ResolvedConfig) -> Self {
        let owned = |name: &str| config.str(name).map(str::to_string);
        Self {
            slurm_control_host: owned("slurm_control_host"),
            slurm_control_addr: owned("slurm_control_addr"),
            slurm_bin_dir: owned("slurm_bin_dir"),
            slurm_log_dir: owned("slurm_log_dir"),
            slurm_uid: config.get("slurm_uid").and_then(Value::as_u64),
            slurm_gid: config.get("slurm_gid").and_then(Value::as_u64),
            install_dir: owned("install_dir"),
            output_dir: owned("output_dir"),
            munge_mount: config.get("munge_mount").cloned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentOutputs {
    pub instance_id: Option<String>,
    pub region: Option<String>,
    pub bucket_path: String,
    pub instructions: String,
    pub munge_secret_id: Option<String>,
    pub jwt_secret_id: Option<String>,
    pub install_script: Option<PathBuf>,
    pub script_sha256: Option<String>,
    pub config_archive: Option<PathBuf>,
    /// Present only in hybrid mode
    pub hybrid_conf: Option<HybridConf>,
}

/// The config-derived part of the outputs, captured before the config is
/// handed to the install step.
#[derive(Debug, Clone)]
pub struct OutputSeed {
    instance_id: Option<String>,
    region: Option<String>,
    bucket_path: String,
    munge_secret_id: Option<String>,
    jwt_secret_id: Option<String>,
    ssh_command: Option<String>,
    hybrid_conf: Option<HybridConf>,
}

impl OutputSeed {
    pub fn capture(config: &ResolvedConfig) -> Result<Self, MissingValue> {
        let owned = |name: &str| config.str(name).map(str::to_string);
        let instance_id = owned("controller_instance_id");

        let ssh_command = if config.hybrid_enabled() {
            owned("slurm_control_host").map(|host| format!("ssh {host}"))
        } else {
            instance_id.as_ref().map(|instance| {
                let mut cmd = format!("gcloud compute ssh {instance} --tunnel-through-iap");
                if let Some(zone) = config.str("zone") {
                    cmd.push_str(&format!(" --zone={zone}"));
                }
                if let Some(project) = config.str("project_id") {
                    cmd.push_str(&format!(" --project={project}"));
                }
                cmd
            })
        };

        Ok(Self {
            instance_id,
            region: owned("region"),
            bucket_path: config.bucket_path()?.to_string(),
            munge_secret_id: owned("munge_key_secret"),
            jwt_secret_id: owned("jwt_key_secret"),
            ssh_command,
            hybrid_conf: config.hybrid_enabled().then(|| HybridConf::capture(config)),
        })
    }

    pub fn finish(self, report: &ApplyReport) -> DeploymentOutputs {
        let script: Option<WrittenArtifact> = report.output(INSTALL_SCRIPT_STEP, "artifact");
        let archive: Option<PackagedArchive> = report.output(CONFIG_ARCHIVE_STEP, "archive");
        let instructions = self.instructions(script.as_ref(), archive.as_ref());

        DeploymentOutputs {
            instance_id: self.instance_id,
            region: self.region,
            bucket_path: self.bucket_path,
            instructions,
            munge_secret_id: self.munge_secret_id,
            jwt_secret_id: self.jwt_secret_id,
            script_sha256: script.as_ref().map(|s| s.sha256.clone()),
            install_script: script.map(|s| s.path),
            config_archive: archive.map(|a| a.path),
            hybrid_conf: self.hybrid_conf,
        }
    }

    fn instructions(&self, script: Option<&WrittenArtifact>, archive: Option<&PackagedArchive>) -> String {
        let mut text = String::new();
        if let Some(cmd) = &self.ssh_command {
            text.push_str("Use the following command to SSH into the controller:\n");
            text.push_str(&format!("  {cmd}\n"));
        }
        if self.hybrid_conf.is_some() {
            match (script, archive) {
                (_, Some(archive)) => text.push_str(&format!(
                    "Copy {} to the controller and unpack it into the slurm configuration directory.\n",
                    archive.path.display()
                )),
                (Some(script), None) => text.push_str(&format!(
                    "Run {} to fetch the configuration from {} and package it.\n",
                    script.path.display(),
                    self.bucket_path
                )),
                (None, None) => {}
            }
        }
        if text.is_empty() {
            text.push_str(&format!("Cluster configuration is stored in {}\n", self.bucket_path));
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::Resolver;
    use crate::schema::{ConfigSchema, RawConfig};
    use chrono::Utc;
    use uuid::Uuid;

    fn empty_report() -> ApplyReport {
        ApplyReport {
            run_id: Uuid::nil(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            steps: vec![],
        }
    }

    fn resolve(raw: RawConfig) -> ResolvedConfig {
        Resolver::new(ConfigSchema::hybrid_controller()).resolve(&raw).unwrap()
    }

    #[test]
    fn test_cloud_controller_instructions() {
        let config = resolve(
            RawConfig::new()
                .with("bucket_path", "gs://b/p")
                .with("controller_instance_id", "hpc-controller")
                .with("zone", "us-central1-a")
                .with("project_id", "proj"),
        );
        let outputs = OutputSeed::capture(&config).unwrap().finish(&empty_report());
        assert!(outputs.instructions.contains(
            "gcloud compute ssh hpc-controller --tunnel-through-iap --zone=us-central1-a --project=proj"
        ));
        assert_eq!(outputs.instance_id.as_deref(), Some("hpc-controller"));
        assert_eq!(outputs.install_script, None);
    }

    #[test]
    fn test_bucket_path_required() {
        let config = resolve(RawConfig::new());
        assert_eq!(OutputSeed::capture(&config).unwrap_err().option, "bucket_path");
    }

    #[test]
    fn test_hybrid_conf_passed_through() {
        let config = resolve(
            RawConfig::new()
                .with("enable_hybrid", true)
                .with("bucket_path", "gs://b/p")
                .with("region", "us-central1")
                .with("slurm_control_host", "ctl")
                .with("slurm_uid", 990)
                .with("install_dir", "/etc/slurm/hybrid"),
        );
        let outputs = OutputSeed::capture(&config).unwrap().finish(&empty_report());
        let conf = outputs.hybrid_conf.unwrap();
        assert_eq!(conf.slurm_uid, Some(990));
        assert_eq!(conf.slurm_gid, Some(401));
        assert_eq!(conf.slurm_log_dir.as_deref(), Some("/var/log/slurm"));
        assert_eq!(conf.install_dir.as_deref(), Some("/etc/slurm/hybrid"));
        assert_eq!(conf.output_dir.as_deref(), Some("/etc/slurm"));
        assert_eq!(outputs.region.as_deref(), Some("us-central1"));
        assert!(outputs.instructions.contains("ssh ctl"));

        let cloud = resolve(RawConfig::new().with("bucket_path", "gs://b/p"));
        assert!(OutputSeed::capture(&cloud).unwrap().finish(&empty_report()).hybrid_conf.is_none());
    }

    #[test]
    fn test_secret_ids_exposed() {
        let config = resolve(
            RawConfig::new()
                .with("bucket_path", "gs://b/p")
                .with("munge_key_secret", "munge")
                .with("jwt_key_secret", "jwt"),
        );
        let outputs = OutputSeed::capture(&config).unwrap().finish(&empty_report());
        assert_eq!(outputs.munge_secret_id.as_deref(), Some("munge"));
        assert_eq!(outputs.jwt_secret_id.as_deref(), Some("jwt"));
        assert!(outputs.instructions.contains("gs://b/p"));
    }
}
