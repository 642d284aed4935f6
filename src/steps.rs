//! Steps of the hybrid installer plan
//!
//! controller-address -> install-script -> config-archive
//! secret-accessor:<secret> (leaf)

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::addresses::{AddressAllocator, AddressError};
use crate::executor::{Step, StepContext, StepError, StepOutputs};
use crate::hashing::sha256_hex;
use crate::render::{RenderError, ScriptRenderer, WrittenArtifact, CONFIG_ARCHIVE_NAME};
use crate::resolver::ResolvedConfig;
use crate::secrets::SecretStore;
use crate::tool_runner::{ExternalToolError, ToolRunner};

pub const ADDRESS_STEP: &str = "controller-address";
pub const INSTALL_SCRIPT_STEP: &str = "install-script";
pub const CONFIG_ARCHIVE_STEP: &str = "config-archive";
pub const SECRET_ACCESSOR_PREFIX: &str = "secret-accessor:";

pub const INSTALL_RUN_LOG: &str = "install_hybrid.log";

fn outputs<const N: usize>(step: &str, pairs: [(&str, Result<Value, serde_json::Error>); N]) -> Result<StepOutputs, StepError> {
    pairs
        .into_iter()
        .map(|(key, value)| {
            value
                .map(|v| (key.to_string(), v))
                .map_err(|source| StepError::Outputs { step: step.to_string(), source })
        })
        .collect()
}

pub struct AddressAllocationStep {
    allocator: Arc<dyn AddressAllocator>,
    resource: String,
}

impl AddressAllocationStep {
    pub fn new(allocator: Arc<dyn AddressAllocator>, resource: impl Into<String>) -> Self {
        Self {
            allocator,
            resource: resource.into(),
        }
    }
}

impl Step for AddressAllocationStep {
    fn kind(&self) -> &'static str { "address_allocation" }

    fn run(self: Box<Self>, ctx: &StepContext<'_>) -> Result<StepOutputs, StepError> {
        let address = self.allocator.allocate(&self.resource)?;
        info!(resource = %self.resource, ?address, "address ready");
        outputs(
            ctx.step_id(),
            [
                ("resource", serde_json::to_value(&self.resource)),
                ("address", serde_json::to_value(address)),
            ],
        )
    }
}

/// Renders and writes install_hybrid.sh. Owns the resolved config.
pub struct InstallScriptStep {
    config: ResolvedConfig,
    renderer: ScriptRenderer,
}

impl InstallScriptStep {
    pub fn new(config: ResolvedConfig, renderer: ScriptRenderer) -> Self {
        Self { config, renderer }
    }

    fn control_addr(&self, ctx: &StepContext<'_>) -> Result<Option<IpAddr>, StepError> {
        let allocated = match ctx.output(ADDRESS_STEP, "address")? {
            Some(Value::String(s)) => Some(
                s.parse()
                    .map_err(|_| StepError::Address(AddressError::Invalid(s.clone())))?,
            ),
            _ => None,
        };
        Ok(effective_control_addr(&self.config, allocated))
    }
}

/// An explicit `slurm_control_addr` wins over the allocated address.
pub fn effective_control_addr(config: &ResolvedConfig, allocated: Option<IpAddr>) -> Option<IpAddr> {
    if let Some(explicit) = config.str("slurm_control_addr") {
        if let Ok(addr) = explicit.parse() {
            return Some(addr);
        }
        warn!(slurm_control_addr = explicit, "not an IP address, using allocated address");
    }
    allocated
}

impl Step for InstallScriptStep {
    fn kind(&self) -> &'static str { "install_script" }

    fn run(self: Box<Self>, ctx: &StepContext<'_>) -> Result<StepOutputs, StepError> {
        let control_addr = self.control_addr(ctx)?;
        let artifact = self.renderer.render_install_script(&self.config, control_addr)?;
        let output_dir = self.config.require_str("output_dir").map_err(RenderError::from)?;
        let written = artifact.write_to(Path::new(output_dir))?;
        outputs(
            ctx.step_id(),
            [
                ("artifact", serde_json::to_value(&written)),
                ("output_dir", serde_json::to_value(output_dir)),
            ],
        )
    }
}

pub struct SecretAccessorGrantStep {
    store: Arc<dyn SecretStore>,
    secret: String,
    principals: Vec<String>,
}

impl SecretAccessorGrantStep {
    pub fn new(store: Arc<dyn SecretStore>, secret: impl Into<String>, principals: Vec<String>) -> Self {
        Self {
            store,
            secret: secret.into(),
            principals,
        }
    }
}

impl Step for SecretAccessorGrantStep {
    fn kind(&self) -> &'static str { "secret_accessor_grant" }

    fn run(self: Box<Self>, ctx: &StepContext<'_>) -> Result<StepOutputs, StepError> {
        // one grant per principal; grants are independent of each other
        for principal in &self.principals {
            self.store.grant_accessor(&self.secret, principal)?;
        }
        outputs(
            ctx.step_id(),
            [
                ("secret", serde_json::to_value(&self.secret)),
                ("principals", serde_json::to_value(&self.principals)),
            ],
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackagedArchive {
    pub path: PathBuf,
    pub size: u64,
    pub sha256: String,
}

/// Runs the rendered installer, which packages config.tgz.
pub struct ConfigArchiveStep {
    runner: Arc<dyn ToolRunner>,
}

impl ConfigArchiveStep {
    pub fn new(runner: Arc<dyn ToolRunner>) -> Self {
        Self { runner }
    }
}

impl Step for ConfigArchiveStep {
    fn kind(&self) -> &'static str { "config_archive" }

    fn run(self: Box<Self>, ctx: &StepContext<'_>) -> Result<StepOutputs, StepError> {
        let script: Option<WrittenArtifact> = ctx
            .output(INSTALL_SCRIPT_STEP, "artifact")?
            .and_then(|v| serde_json::from_value(v.clone()).ok());
        let Some(script) = script else {
            return Err(ExternalToolError::MissingOutput {
                program: "bash".to_string(),
                path: PathBuf::from(crate::render::INSTALL_SCRIPT_NAME),
            }
            .into());
        };
        let output_dir = script.path.parent().unwrap_or(Path::new(".")).to_path_buf();
        let log_path = output_dir.join(INSTALL_RUN_LOG);
        let script_path = script.path.to_string_lossy().into_owned();

        self.runner.run("bash", &[script_path.as_str()], &output_dir, &log_path)?;

        let archive_path = output_dir.join(CONFIG_ARCHIVE_NAME);
        let data = fs::read(&archive_path).map_err(|_| ExternalToolError::MissingOutput {
            program: "bash".to_string(),
            path: archive_path.clone(),
        })?;
        let archive = PackagedArchive {
            path: archive_path,
            size: data.len() as u64,
            sha256: sha256_hex(&data),
        };
        info!(path = %archive.path.display(), size = archive.size, "configuration packaged");
        outputs(
            ctx.step_id(),
            [
                ("archive", serde_json::to_value(&archive)),
                ("log", serde_json::to_value(&log_path)),
            ],
        )
    }
}
