//! Validation System - Rule/Policy Separation
//!
//! Rules produce structured violations.
//! Policy maps violations to actions.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::OnceLock;
use thiserror::Error;

use crate::schema::{json_type_name, ConfigSchema, OptionFormat};
use crate::ENGINE_VERSION;

/// Option values after defaults were overlaid, keyed by option name.
pub type OptionValues = BTreeMap<String, Value>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationViolation {
    pub rule: String,
    pub option: String,
    pub severity: ViolationSeverity,
    pub message: String,
    pub expected: Option<String>,
    pub actual: Option<String>,
    pub remediation: Vec<String>,
}

impl ValidationViolation {
    fn error(rule: &str, option: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            rule: rule.to_string(),
            option: option.into(),
            severity: ViolationSeverity::Error,
            message: message.into(),
            expected: None,
            actual: None,
            remediation: vec![],
        }
    }

    fn warning(rule: &str, option: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: ViolationSeverity::Warning,
            ..Self::error(rule, option, message)
        }
    }

    fn expected(mut self, expected: impl Into<String>) -> Self {
        self.expected = Some(expected.into());
        self
    }

    fn actual(mut self, actual: impl Into<String>) -> Self {
        self.actual = Some(actual.into());
        self
    }

    fn remediation(mut self, hint: impl Into<String>) -> Self {
        self.remediation.push(hint.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub violations: Vec<ValidationViolation>,
    pub engine_version: String,
}

impl ValidationResult {
    pub fn success(violations: Vec<ValidationViolation>) -> Self {
        Self {
            valid: true,
            violations,
            engine_version: ENGINE_VERSION.to_string(),
        }
    }

    pub fn failure(violations: Vec<ValidationViolation>) -> Self {
        Self {
            valid: false,
            violations,
            engine_version: ENGINE_VERSION.to_string(),
        }
    }

    pub fn has_errors(&self) -> bool {
        self.violations.iter().any(|v| v.severity == ViolationSeverity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &ValidationViolation> {
        self.violations.iter().filter(|v| v.severity == ViolationSeverity::Warning)
    }

    pub fn into_error(self) -> Option<ValidationError> {
        if self.valid {
            None
        } else {
            Some(ValidationError { violations: self.violations })
        }
    }
}

/// Configuration rejected before anything was rendered or written.
#[derive(Debug, Clone, Error)]
#[error("Invalid configuration: {}", summarize(.violations))]
pub struct ValidationError {
    pub violations: Vec<ValidationViolation>,
}

impl ValidationError {
    /// Names of the offending options, deduplicated, in report order.
    pub fn options(&self) -> Vec<&str> {
        let mut names: Vec<&str> = vec![];
        for v in &self.violations {
            if !names.contains(&v.option.as_str()) {
                names.push(&v.option);
            }
        }
        names
    }
}

fn summarize(violations: &[ValidationViolation]) -> String {
    violations
        .iter()
        .map(|v| format!("{}: {}", v.option, v.message))
        .collect::<Vec<_>>()
        .join("; ")
}

/// How warnings are treated.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ValidationPolicy {
    /// Errors block, warnings are reported
    #[default]
    Block,
    /// Warnings block as well
    Strict,
}

/// Validation rule trait - produces violations
pub trait ValidationRule: Send + Sync {
    fn name(&self) -> &'static str;
    fn validate(&self, values: &OptionValues, schema: &ConfigSchema) -> Vec<ValidationViolation>;
}

fn cluster_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-z][a-z0-9]{0,9}$").expect("valid cluster name pattern"))
}

fn partition_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-z][a-z0-9]*$").expect("valid partition name pattern"))
}

/// Values of every option carrying `format`, skipping absent ones.
fn formatted<'a>(
    values: &'a OptionValues,
    schema: &'a ConfigSchema,
    format: OptionFormat,
) -> impl Iterator<Item = (&'static str, &'a Value)> + 'a {
    schema
        .with_format(format)
        .filter_map(move |spec| values.get(spec.name).map(|v| (spec.name, v)))
}

fn is_set(entry: &serde_json::Map<String, Value>, key: &str) -> bool {
    entry.get(key).map_or(false, |v| !v.is_null())
}

// --- Concrete Rules ---

pub struct KnownOptionRule;

impl ValidationRule for KnownOptionRule {
    fn name(&self) -> &'static str { "known_option" }

    fn validate(&self, values: &OptionValues, schema: &ConfigSchema) -> Vec<ValidationViolation> {
        values
            .keys()
            .filter(|name| schema.get(name).is_none())
            .map(|name| {
                ValidationViolation::error(self.name(), name.as_str(), "Unknown option")
                    .remediation("Remove the option or check its spelling")
            })
            .collect()
    }
}

pub struct TypeRule;

impl ValidationRule for TypeRule {
    fn name(&self) -> &'static str { "type" }

    fn validate(&self, values: &OptionValues, schema: &ConfigSchema) -> Vec<ValidationViolation> {
        let mut violations = vec![];
        for (name, value) in values {
            let Some(spec) = schema.get(name) else { continue };
            if !spec.kind.matches(value) {
                violations.push(
                    ValidationViolation::error(self.name(), name.as_str(), "Wrong value type")
                        .expected(format!("{:?}", spec.kind).to_lowercase())
                        .actual(json_type_name(value)),
                );
            }
        }
        violations
    }
}

pub struct ClusterNameRule;

impl ValidationRule for ClusterNameRule {
    fn name(&self) -> &'static str { "cluster_name" }

    fn validate(&self, values: &OptionValues, schema: &ConfigSchema) -> Vec<ValidationViolation> {
        formatted(values, schema, OptionFormat::ClusterName)
            .filter_map(|(name, value)| value.as_str().map(|s| (name, s)))
            .filter(|(_, s)| !cluster_name_pattern().is_match(s))
            .map(|(name, s)| {
                ValidationViolation::error(
                    self.name(),
                    name,
                    "Cluster name must start with a lowercase letter and contain 1-10 lowercase letters or digits",
                )
                .expected("^[a-z][a-z0-9]{0,9}$")
                .actual(s)
            })
            .collect()
    }
}

pub struct PartitionNameRule;

impl ValidationRule for PartitionNameRule {
    fn name(&self) -> &'static str { "partition_name" }

    fn validate(&self, values: &OptionValues, schema: &ConfigSchema) -> Vec<ValidationViolation> {
        let mut violations = vec![];
        for (name, value) in formatted(values, schema, OptionFormat::PartitionList) {
            let Some(entries) = value.as_array() else { continue };
            for (i, entry) in entries.iter().enumerate() {
                let option = format!("{name}[{i}].partition_name");
                match entry.get("partition_name").and_then(Value::as_str) {
                    Some(p) if partition_name_pattern().is_match(p) => {}
                    Some(p) => violations.push(
                        ValidationViolation::error(
                            self.name(),
                            option,
                            "Partition name must start with a lowercase letter followed by lowercase letters or digits",
                        )
                        .expected("^[a-z][a-z0-9]*$")
                        .actual(p),
                    ),
                    None => violations.push(ValidationViolation::error(
                        self.name(),
                        option,
                        "Partition entry has no partition_name",
                    )),
                }

                let nodesets = entry.get("partition_nodeset").and_then(Value::as_array);
                for (j, nodeset) in nodesets.into_iter().flatten().enumerate() {
                    let ok = nodeset.as_str().map_or(false, |n| partition_name_pattern().is_match(n));
                    if !ok {
                        violations.push(
                            ValidationViolation::error(
                                self.name(),
                                format!("{name}[{i}].partition_nodeset[{j}]"),
                                "Nodeset name must start with a lowercase letter followed by lowercase letters or digits",
                            )
                            .actual(nodeset.to_string()),
                        );
                    }
                }
            }
        }
        violations
    }
}

/// Each script entry carries its body inline or by reference, never both.
pub struct ScriptSourceRule;

impl ValidationRule for ScriptSourceRule {
    fn name(&self) -> &'static str { "script_source" }

    fn validate(&self, values: &OptionValues, schema: &ConfigSchema) -> Vec<ValidationViolation> {
        let mut violations = vec![];
        for (name, value) in formatted(values, schema, OptionFormat::ScriptList) {
            let Some(entries) = value.as_array() else { continue };
            for (i, entry) in entries.iter().enumerate() {
                let option = format!("{name}[{i}]");
                let Some(entry) = entry.as_object() else {
                    violations.push(
                        ValidationViolation::error(self.name(), option, "Script entry must be an object")
                            .actual(json_type_name(entry)),
                    );
                    continue;
                };

                let filename_ok = entry
                    .get("filename")
                    .and_then(Value::as_str)
                    .map_or(false, |f| !f.trim().is_empty());
                if !filename_ok {
                    violations.push(ValidationViolation::error(
                        self.name(),
                        option.clone(),
                        "Script entry needs a non-empty filename",
                    ));
                }

                match (is_set(entry, "content"), is_set(entry, "source")) {
                    (true, false) | (false, true) => {}
                    (true, true) => violations.push(
                        ValidationViolation::error(self.name(), option, "Both content and source are set")
                            .expected("exactly one of content, source")
                            .remediation("Keep either the inline content or the source reference"),
                    ),
                    (false, false) => violations.push(
                        ValidationViolation::error(self.name(), option, "Neither content nor source is set")
                            .expected("exactly one of content, source"),
                    ),
                }
            }
        }
        violations
    }
}

pub struct TimeoutRule;

impl ValidationRule for TimeoutRule {
    fn name(&self) -> &'static str { "timeout" }

    fn validate(&self, values: &OptionValues, schema: &ConfigSchema) -> Vec<ValidationViolation> {
        formatted(values, schema, OptionFormat::Timeout)
            .filter_map(|(name, value)| value.as_f64().map(|t| (name, t)))
            .filter(|(_, t)| *t <= 0.0)
            .map(|(name, t)| {
                ValidationViolation::warning(self.name(), name, "Timeout disabled, scripts may run forever")
                    .actual(t.to_string())
            })
            .collect()
    }
}

pub struct IpAddressRule;

impl ValidationRule for IpAddressRule {
    fn name(&self) -> &'static str { "ip_address" }

    fn validate(&self, values: &OptionValues, schema: &ConfigSchema) -> Vec<ValidationViolation> {
        let mut violations = vec![];
        for (name, value) in formatted(values, schema, OptionFormat::IpList) {
            let Some(entries) = value.as_array() else { continue };
            for (i, entry) in entries.iter().enumerate() {
                let parsed = entry.as_str().and_then(|s| s.parse::<IpAddr>().ok());
                if parsed.is_none() {
                    violations.push(
                        ValidationViolation::error(self.name(), format!("{name}[{i}]"), "Not an IP address")
                            .actual(entry.to_string()),
                    );
                }
            }
        }
        violations
    }
}

pub struct MountRule;

const MOUNT_FIELDS: [&str; 4] = ["server_ip", "remote_mount", "local_mount", "fs_type"];

impl ValidationRule for MountRule {
    fn name(&self) -> &'static str { "network_storage" }

    fn validate(&self, values: &OptionValues, schema: &ConfigSchema) -> Vec<ValidationViolation> {
        let mut violations = vec![];
        for (name, value) in formatted(values, schema, OptionFormat::MountList) {
            let Some(entries) = value.as_array() else { continue };
            for (i, entry) in entries.iter().enumerate() {
                let missing: Vec<_> = MOUNT_FIELDS
                    .iter()
                    .filter(|f| entry.get(**f).and_then(Value::as_str).map_or(true, str::is_empty))
                    .copied()
                    .collect();
                if !missing.is_empty() {
                    violations.push(
                        ValidationViolation::error(self.name(), format!("{name}[{i}]"), "Incomplete mount")
                            .expected(MOUNT_FIELDS.join(", "))
                            .actual(format!("missing {}", missing.join(", "))),
                    );
                }
            }
        }
        violations
    }
}

/// Database credentials must be injected from a secret store.
pub struct CredentialRule;

impl ValidationRule for CredentialRule {
    fn name(&self) -> &'static str { "credential" }

    fn validate(&self, values: &OptionValues, schema: &ConfigSchema) -> Vec<ValidationViolation> {
        let mut violations = vec![];
        for (name, value) in formatted(values, schema, OptionFormat::Database) {
            let Some(db) = value.as_object() else { continue };
            if is_set(db, "password") {
                violations.push(
                    ValidationViolation::error(self.name(), format!("{name}.password"), "Literal database password")
                        .expected("password_secret")
                        .remediation("Store the password in the secret store and reference it with password_secret"),
                );
            } else if !is_set(db, "password_secret") {
                violations.push(
                    ValidationViolation::error(self.name(), format!("{name}.password_secret"), "Missing database password secret")
                        .expected("secret identifier"),
                );
            }
        }
        violations
    }
}

pub struct EngineVersionRule;

impl ValidationRule for EngineVersionRule {
    fn name(&self) -> &'static str { "engine_version" }

    fn validate(&self, values: &OptionValues, schema: &ConfigSchema) -> Vec<ValidationViolation> {
        let mut violations = vec![];
        for (name, value) in formatted(values, schema, OptionFormat::EngineVersion) {
            let Some(requirement) = value.as_str() else { continue };
            let Ok(engine) = semver::Version::parse(ENGINE_VERSION) else { continue };
            match semver::VersionReq::parse(requirement) {
                Ok(req) if req.matches(&engine) => {}
                Ok(_) => violations.push(
                    ValidationViolation::error(self.name(), name, "Installer version does not satisfy requirement")
                        .expected(requirement)
                        .actual(ENGINE_VERSION),
                ),
                Err(e) => violations.push(
                    ValidationViolation::error(self.name(), name, format!("Invalid version requirement: {e}"))
                        .actual(requirement),
                ),
            }
        }
        violations
    }
}

/// Validator orchestrates rules and applies policy
pub struct Validator {
    rules: Vec<Box<dyn ValidationRule>>,
    policy: ValidationPolicy,
}

impl Validator {
    pub fn new() -> Self {
        Self {
            rules: vec![
                Box::new(KnownOptionRule),
                Box::new(TypeRule),
                Box::new(ClusterNameRule),
                Box::new(PartitionNameRule),
                Box::new(ScriptSourceRule),
                Box::new(TimeoutRule),
                Box::new(IpAddressRule),
                Box::new(MountRule),
                Box::new(CredentialRule),
                Box::new(EngineVersionRule),
            ],
            policy: ValidationPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: ValidationPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn validate(&self, values: &OptionValues, schema: &ConfigSchema) -> ValidationResult {
        let violations: Vec<_> = self
            .rules
            .iter()
            .flat_map(|rule| rule.validate(values, schema))
            .collect();

        let blocking = violations.iter().any(|v| match self.policy {
            ValidationPolicy::Block => v.severity == ViolationSeverity::Error,
            ValidationPolicy::Strict => v.severity != ViolationSeverity::Info,
        });

        if blocking {
            ValidationResult::failure(violations)
        } else {
            ValidationResult::success(violations)
        }
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new()
    }
}
