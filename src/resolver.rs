//! Configuration Resolver - Defaults, Overlay, Validation
//!
//! `resolve` is all-or-nothing: either every rule passed and a complete
//! `ResolvedConfig` is returned, or a `ValidationError` lists every
//! offending option. Options without a default stay absent; asking for
//! one later fails with `MissingValue`.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, warn};

use crate::provenance::{ResolvedValue, ValueSource};
use crate::schema::{ConfigSchema, RawConfig};
use crate::validation::{OptionValues, ValidationError, ValidationPolicy, ValidationResult, Validator};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Option '{option}' is required here but not set")]
pub struct MissingValue {
    pub option: String,
}

impl MissingValue {
    pub fn new(option: impl Into<String>) -> Self {
        Self { option: option.into() }
    }
}

/// Validated option values. Immutable once built.
#[derive(Debug, PartialEq, Serialize)]
pub struct ResolvedConfig {
    values: BTreeMap<String, ResolvedValue>,
}

impl ResolvedConfig {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name).map(|v| &v.value)
    }

    pub fn source(&self, name: &str) -> Option<ValueSource> {
        self.values.get(name).map(|v| v.source)
    }

    pub fn str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    pub fn require_str(&self, name: &str) -> Result<&str, MissingValue> {
        self.str(name).ok_or_else(|| MissingValue::new(name))
    }

    pub fn flag(&self, name: &str) -> bool {
        self.get(name).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn list(&self, name: &str) -> &[Value] {
        self.get(name)
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn strings(&self, name: &str) -> Vec<&str> {
        self.list(name).iter().filter_map(Value::as_str).collect()
    }

    pub fn hybrid_enabled(&self) -> bool {
        self.flag("enable_hybrid")
    }

    pub fn bucket_path(&self) -> Result<&str, MissingValue> {
        self.require_str("bucket_path")
    }

    /// Plain values without provenance, for hashing and reporting.
    pub fn values(&self) -> OptionValues {
        self.values
            .iter()
            .map(|(k, v)| (k.clone(), v.value.clone()))
            .collect()
    }
}

pub struct Resolver<'s> {
    schema: &'s ConfigSchema,
    validator: Validator,
}

impl<'s> Resolver<'s> {
    pub fn new(schema: &'s ConfigSchema) -> Self {
        Self {
            schema,
            validator: Validator::new(),
        }
    }

    pub fn with_policy(mut self, policy: ValidationPolicy) -> Self {
        self.validator = self.validator.with_policy(policy);
        self
    }

    pub fn schema(&self) -> &'s ConfigSchema {
        self.schema
    }

    /// Validate without building a config.
    pub fn check(&self, raw: &RawConfig) -> ValidationResult {
        let merged = self.overlay(raw);
        let plain: OptionValues = merged.iter().map(|(k, v)| (k.clone(), v.value.clone())).collect();
        self.validator.validate(&plain, self.schema)
    }

    pub fn resolve(&self, raw: &RawConfig) -> Result<ResolvedConfig, ValidationError> {
        let result = self.check(raw);
        for w in result.warnings() {
            warn!(option = %w.option, rule = %w.rule, "{}", w.message);
        }
        if let Some(err) = result.into_error() {
            return Err(err);
        }

        let mut values = self.overlay(raw);
        if let Some(path) = derive_bucket_path(&values) {
            debug!(bucket_path = %path, "derived bucket path");
            values.insert("bucket_path".to_string(), ResolvedValue::derived(Value::String(path)));
        }

        Ok(ResolvedConfig { values })
    }

    fn overlay(&self, raw: &RawConfig) -> BTreeMap<String, ResolvedValue> {
        let mut values: BTreeMap<String, ResolvedValue> = self
            .schema
            .list()
            .into_iter()
            .filter_map(|spec| {
                spec.default
                    .clone()
                    .map(|d| (spec.name.to_string(), ResolvedValue::from_default(d)))
            })
            .collect();

        // null means "not set", as with an omitted variable
        for (name, value) in raw.iter().filter(|(_, v)| !v.is_null()) {
            values.insert(name.clone(), ResolvedValue::from_caller(value.clone()));
        }
        values
    }
}

fn derive_bucket_path(values: &BTreeMap<String, ResolvedValue>) -> Option<String> {
    let text = |name: &str| values.get(name).and_then(|v| v.value.as_str());
    if text("bucket_path").is_some() {
        return None;
    }
    let bucket = text("bucket_name")?;
    let dir = match text("bucket_dir") {
        Some(dir) => dir.trim_matches('/').to_string(),
        None => format!("{}-files", text("slurm_cluster_name")?),
    };
    Some(format!("gs://{bucket}/{dir}"))
}
