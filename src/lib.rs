//! Slurm Hybrid Core - Hybrid Controller Configuration Renderer
//!
//! # Guarantees
//! 1. Options Are Typed Contracts
//! 2. Validation Happens Before Anything Is Written
//! 3. Deterministic Script Output
//! 4. Whole-File Writes Only
//! 5. Dependencies Gate Execution
//! 6. Credentials Come From Secret References

pub mod schema;
pub mod validation;
pub mod provenance;
pub mod resolver;
pub mod hashing;
pub mod render;
pub mod executor;
pub mod secrets;
pub mod addresses;
pub mod tool_runner;
pub mod steps;
pub mod outputs;
pub mod pipeline;

pub use schema::{ConfigSchema, OptionFormat, OptionKind, OptionSpec, RawConfig};
pub use validation::{ValidationError, ValidationResult, ValidationRule, ValidationViolation, ViolationSeverity};
pub use resolver::{MissingValue, ResolvedConfig, Resolver};
pub use provenance::ValueSource;
pub use hashing::{canonical_json, compute_config_hash, sha256_hex};
pub use render::{RenderError, RenderedArtifact, ScriptRenderer, WriteOutcome, WrittenArtifact};
pub use executor::{ApplyReport, ExecutorError, Plan, Step, StepContext, StepError, StepOutputs};
pub use outputs::{DeploymentOutputs, HybridConf};
pub use pipeline::{Deployment, HybridPipeline, PipelineError};

pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
