//! Hybrid Pipeline - Single Entry Point
//!
//! CRITICAL: render, plan and deploy all resolve (and therefore validate)
//! the raw config first. No bypass.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use crate::addresses::{AddressAllocator, AddressError, StaticAddressAllocator};
use crate::executor::{ApplyReport, ExecutorError, Plan, PlannedStepSummary};
use crate::hashing::compute_config_hash;
use crate::outputs::{DeploymentOutputs, OutputSeed};
use crate::render::{require_inputs, RenderError, RenderedArtifact, ScriptRenderer};
use crate::resolver::{MissingValue, ResolvedConfig, Resolver};
use crate::schema::{ConfigSchema, OptionSpec, RawConfig};
use crate::secrets::{RecordingSecretStore, SecretStore};
use crate::steps::{
    effective_control_addr, AddressAllocationStep, ConfigArchiveStep, InstallScriptStep,
    SecretAccessorGrantStep, ADDRESS_STEP, CONFIG_ARCHIVE_STEP, INSTALL_SCRIPT_STEP,
    SECRET_ACCESSOR_PREFIX,
};
use crate::tool_runner::{ProcessToolRunner, ToolRunner};
use crate::validation::{ValidationError, ValidationPolicy, ValidationResult};
use crate::ENGINE_VERSION;

#[cfg(feature = "test-hooks")]
use std::sync::atomic::{AtomicU32, Ordering};

#[cfg(feature = "test-hooks")]
static RESOLVE_CALL_COUNT: AtomicU32 = AtomicU32::new(0);

#[cfg(feature = "test-hooks")]
pub fn get_resolve_call_count() -> u32 {
    RESOLVE_CALL_COUNT.load(Ordering::SeqCst)
}

#[cfg(feature = "test-hooks")]
pub fn reset_resolve_call_count() {
    RESOLVE_CALL_COUNT.store(0, Ordering::SeqCst);
}

const CONTROLLER_RESOURCE: &str = "controller";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Validation failed: {0}")]
    ValidationFailed(#[from] ValidationError),

    #[error("Render failed: {0}")]
    RenderFailed(#[from] RenderError),

    #[error(transparent)]
    MissingValue(#[from] MissingValue),

    #[error("Invalid address: {0}")]
    Address(#[from] AddressError),

    #[error("Apply failed: {0}")]
    ApplyFailed(#[from] ExecutorError),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub config_hash: String,
    pub engine_version: String,
    pub outputs: DeploymentOutputs,
    pub report: ApplyReport,
}

/// The pipeline - single entry point for validate, render and deploy
pub struct HybridPipeline {
    schema: &'static ConfigSchema,
    policy: ValidationPolicy,
    renderer: ScriptRenderer,
    secrets: Arc<dyn SecretStore>,
    tools: Arc<dyn ToolRunner>,
}

impl HybridPipeline {
    pub fn new() -> Result<Self, PipelineError> {
        Ok(Self {
            schema: ConfigSchema::hybrid_controller(),
            policy: ValidationPolicy::default(),
            renderer: ScriptRenderer::new()?,
            secrets: Arc::new(RecordingSecretStore::new()),
            tools: Arc::new(ProcessToolRunner),
        })
    }

    pub fn with_policy(mut self, policy: ValidationPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_secret_store(mut self, store: Arc<dyn SecretStore>) -> Self {
        self.secrets = store;
        self
    }

    pub fn with_tool_runner(mut self, runner: Arc<dyn ToolRunner>) -> Self {
        self.tools = runner;
        self
    }

    /// List all known options
    pub fn list_options(&self) -> Vec<&OptionSpec> {
        self.schema.list()
    }

    fn resolver(&self) -> Resolver<'static> {
        Resolver::new(self.schema).with_policy(self.policy)
    }

    /// Validate a raw config without resolving it.
    pub fn validate(&self, raw: &RawConfig) -> ValidationResult {
        self.resolver().check(raw)
    }

    fn resolve(&self, raw: &RawConfig) -> Result<ResolvedConfig, PipelineError> {
        #[cfg(feature = "test-hooks")]
        RESOLVE_CALL_COUNT.fetch_add(1, Ordering::SeqCst);

        Ok(self.resolver().resolve(raw)?)
    }

    /// Render the install script without writing it. `None` when hybrid
    /// mode is disabled, since deploy would not produce a script either.
    pub fn render(&self, raw: &RawConfig) -> Result<Option<RenderedArtifact>, PipelineError> {
        let config = self.resolve(raw)?;
        if !config.hybrid_enabled() {
            return Ok(None);
        }
        let allocator = StaticAddressAllocator::parse(config.strings("static_ips"))?;
        let control_addr = effective_control_addr(&config, allocator.allocate(CONTROLLER_RESOURCE)?);
        Ok(Some(self.renderer.render_install_script(&config, control_addr)?))
    }

    /// The steps `deploy` would run, in order.
    pub fn plan(&self, raw: &RawConfig) -> Result<Vec<PlannedStepSummary>, PipelineError> {
        let config = self.resolve(raw)?;
        let (plan, _) = self.build_plan(config)?;
        Ok(plan.describe()?)
    }

    pub fn deploy(&self, raw: &RawConfig) -> Result<Deployment, PipelineError> {
        let config = self.resolve(raw)?;
        let config_hash = compute_config_hash(&config.values(), ENGINE_VERSION)?;
        info!(%config_hash, hybrid = config.hybrid_enabled(), "deploying");

        let (plan, seed) = self.build_plan(config)?;
        let report = plan.apply()?;

        Ok(Deployment {
            config_hash,
            engine_version: ENGINE_VERSION.to_string(),
            outputs: seed.finish(&report),
            report,
        })
    }

    /// Every hybrid-only step is registered through `register_if`, so a
    /// disabled hybrid mode yields an empty plan. Render inputs are checked
    /// here so a missing value aborts before any step has run.
    fn build_plan(&self, config: ResolvedConfig) -> Result<(Plan, OutputSeed), PipelineError> {
        let hybrid = config.hybrid_enabled();
        if hybrid {
            require_inputs(&config)?;
        }
        let seed = OutputSeed::capture(&config)?;
        let execute = hybrid && config.flag("execute_install_script");

        let allocator: Arc<dyn AddressAllocator> =
            Arc::new(StaticAddressAllocator::parse(config.strings("static_ips"))?);
        let principals: Vec<String> = config
            .strings("secret_accessors")
            .into_iter()
            .map(str::to_string)
            .collect();
        let secrets: BTreeSet<String> = ["munge_key_secret", "jwt_key_secret"]
            .iter()
            .filter_map(|name| config.str(name))
            .chain(
                config
                    .get("cloudsql")
                    .and_then(|db| db.get("password_secret"))
                    .and_then(Value::as_str),
            )
            .map(str::to_string)
            .collect();

        let mut plan = Plan::new();
        plan.register_if(hybrid, ADDRESS_STEP, &[], || {
            AddressAllocationStep::new(allocator, CONTROLLER_RESOURCE)
        })?;
        for secret in secrets {
            let id = format!("{SECRET_ACCESSOR_PREFIX}{secret}");
            let store = self.secrets.clone();
            let principals = principals.clone();
            plan.register_if(hybrid, &id, &[], move || {
                SecretAccessorGrantStep::new(store, secret, principals)
            })?;
        }
        plan.register_if(execute, CONFIG_ARCHIVE_STEP, &[INSTALL_SCRIPT_STEP], || {
            ConfigArchiveStep::new(self.tools.clone())
        })?;
        let renderer = self.renderer.clone();
        plan.register_if(hybrid, INSTALL_SCRIPT_STEP, &[ADDRESS_STEP], move || {
            InstallScriptStep::new(config, renderer)
        })?;

        Ok((plan, seed))
    }
}
