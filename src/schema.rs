//! Option Schema - Typed Variable Contracts
//!
//! The schema is built once and shared by reference. Caller input is a
//! loose JSON object (`RawConfig`) that only becomes trustworthy after the
//! resolver has checked it against this table.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;
use thiserror::Error;

pub type OptionName = &'static str;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OptionKind {
    String,
    Bool,
    Number,
    List,
    Object,
}

impl OptionKind {
    pub fn matches(&self, value: &Value) -> bool {
        matches!(
            (self, value),
            (OptionKind::String, Value::String(_))
                | (OptionKind::Bool, Value::Bool(_))
                | (OptionKind::Number, Value::Number(_))
                | (OptionKind::List, Value::Array(_))
                | (OptionKind::Object, Value::Object(_))
        )
    }
}

/// Name of the JSON type of `value`, for error messages.
pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

/// Extra structure checked by a dedicated validation rule.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OptionFormat {
    ClusterName,
    PartitionList,
    ScriptList,
    IpList,
    MountList,
    Timeout,
    Database,
    EngineVersion,
}

#[derive(Debug, Clone, Serialize)]
pub struct OptionSpec {
    pub name: OptionName,
    pub kind: OptionKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<OptionFormat>,
    pub description: &'static str,
}

impl OptionSpec {
    pub fn new(name: OptionName, kind: OptionKind, description: &'static str) -> Self {
        Self {
            name,
            kind,
            default: None,
            format: None,
            description,
        }
    }

    pub fn default_value(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn format(mut self, format: OptionFormat) -> Self {
        self.format = Some(format);
        self
    }
}

/// Immutable table of every option the installer understands.
pub struct ConfigSchema {
    options: BTreeMap<OptionName, OptionSpec>,
}

impl ConfigSchema {
    pub fn new() -> Self {
        Self { options: BTreeMap::new() }
    }

    /// The schema of the hybrid controller installer, built on first use.
    pub fn hybrid_controller() -> &'static ConfigSchema {
        static SCHEMA: OnceLock<ConfigSchema> = OnceLock::new();
        SCHEMA.get_or_init(build_hybrid_controller_schema)
    }

    pub fn get(&self, name: &str) -> Option<&OptionSpec> {
        self.options.get(name)
    }

    pub fn list(&self) -> Vec<&OptionSpec> {
        self.options.values().collect()
    }

    pub fn with_format(&self, format: OptionFormat) -> impl Iterator<Item = &OptionSpec> {
        self.options.values().filter(move |o| o.format == Some(format))
    }

    pub fn register(&mut self, spec: OptionSpec) {
        self.options.insert(spec.name, spec);
    }
}

impl Default for ConfigSchema {
    fn default() -> Self {
        Self::new()
    }
}

fn build_hybrid_controller_schema() -> ConfigSchema {
    use OptionFormat::*;
    use OptionKind::*;

    let mut schema = ConfigSchema::new();
    let specs = [
        OptionSpec::new("slurm_cluster_name", String, "Cluster name, used for resource naming and slurm accounting")
            .format(ClusterName),
        OptionSpec::new("project_id", String, "Project the cluster resources live in"),
        OptionSpec::new("region", String, "Region of the cluster resources"),
        OptionSpec::new("zone", String, "Zone of the controller instance"),
        OptionSpec::new("bucket_name", String, "Bucket holding the cluster configuration"),
        OptionSpec::new("bucket_dir", String, "Directory inside the bucket; defaults to <cluster>-files"),
        OptionSpec::new("bucket_path", String, "Full bucket URI; derived from bucket_name and bucket_dir when unset"),
        OptionSpec::new("enable_hybrid", Bool, "Render the hybrid installer for an externally hosted controller")
            .default_value(json!(false)),
        OptionSpec::new("output_dir", String, "Directory the hybrid configuration files are written to")
            .default_value(json!("/etc/slurm")),
        OptionSpec::new("scripts_dir", String, "Directory containing setup.py and requirements.txt"),
        OptionSpec::new("install_dir", String, "Directory the configuration is installed to on the controller"),
        OptionSpec::new("slurm_control_host", String, "Short hostname of the external slurmctld host"),
        OptionSpec::new("slurm_control_addr", String, "Address of the external slurmctld host"),
        OptionSpec::new("slurm_bin_dir", String, "Directory of the slurm binaries on the controller")
            .default_value(json!("/usr/local/bin")),
        OptionSpec::new("slurm_log_dir", String, "Directory of the slurm logs on the controller")
            .default_value(json!("/var/log/slurm")),
        OptionSpec::new("slurm_uid", Number, "UID of the slurm user on the controller").default_value(json!(401)),
        OptionSpec::new("slurm_gid", Number, "GID of the slurm user on the controller").default_value(json!(401)),
        OptionSpec::new("munge_mount", Object, "Network mount of the munge key exported by the controller"),
        OptionSpec::new("controller_instance_id", String, "Identifier of the cloud-hosted controller instance"),
        OptionSpec::new("static_ips", List, "Static addresses reserved for the controller")
            .default_value(json!([]))
            .format(IpList),
        OptionSpec::new("controller_startup_scripts", List, "Scripts run on the controller after setup")
            .default_value(json!([]))
            .format(ScriptList),
        OptionSpec::new("login_startup_scripts", List, "Scripts run on login nodes after setup")
            .default_value(json!([]))
            .format(ScriptList),
        OptionSpec::new("compute_startup_scripts", List, "Scripts run on compute nodes after setup")
            .default_value(json!([]))
            .format(ScriptList),
        OptionSpec::new("prolog_scripts", List, "Scripts run by slurmd before each job")
            .default_value(json!([]))
            .format(ScriptList),
        OptionSpec::new("epilog_scripts", List, "Scripts run by slurmd after each job")
            .default_value(json!([]))
            .format(ScriptList),
        OptionSpec::new("controller_startup_scripts_timeout", Number, "Seconds before a controller script is killed; <= 0 disables")
            .default_value(json!(300))
            .format(Timeout),
        OptionSpec::new("login_startup_scripts_timeout", Number, "Seconds before a login script is killed; <= 0 disables")
            .default_value(json!(300))
            .format(Timeout),
        OptionSpec::new("compute_startup_scripts_timeout", Number, "Seconds before a compute script is killed; <= 0 disables")
            .default_value(json!(300))
            .format(Timeout),
        OptionSpec::new("partitions", List, "Partitions, each grouping one or more nodesets")
            .default_value(json!([]))
            .format(PartitionList),
        OptionSpec::new("network_storage", List, "Network filesystems mounted on every node")
            .default_value(json!([]))
            .format(MountList),
        OptionSpec::new("munge_key_secret", String, "Secret identifier holding the munge key"),
        OptionSpec::new("jwt_key_secret", String, "Secret identifier holding the slurm JWT key"),
        OptionSpec::new("secret_accessors", List, "Principals granted read access to the cluster secrets")
            .default_value(json!([])),
        OptionSpec::new("cloudsql", Object, "External accounting database; credentials by secret reference only")
            .format(Database),
        OptionSpec::new("execute_install_script", Bool, "Run the rendered installer to produce config.tgz")
            .default_value(json!(false)),
        OptionSpec::new("required_engine_version", String, "Semver requirement the installer version must satisfy")
            .format(EngineVersion),
    ];
    for spec in specs {
        schema.register(spec);
    }
    schema
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Config must be a JSON object: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid override '{0}': expected key=value")]
    Override(String),
}

/// Caller-supplied option values, before defaults and validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct RawConfig(BTreeMap<String, Value>);

impl RawConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_str(content: &str) -> Result<Self, ConfigLoadError> {
        Ok(serde_json::from_str(content)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigLoadError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigLoadError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&content)
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.0.insert(name.into(), value.into());
        self
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Apply a `key=value` override. The value is read as JSON when it
    /// parses, otherwise kept as a plain string.
    pub fn apply_override(&mut self, assignment: &str) -> Result<(), ConfigLoadError> {
        let (key, raw) = assignment
            .split_once('=')
            .filter(|(k, _)| !k.trim().is_empty())
            .ok_or_else(|| ConfigLoadError::Override(assignment.to_string()))?;
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        self.set(key.trim(), value);
        Ok(())
    }
}
