//! Value Provenance
//!
//! Records where each resolved value came from. Callers ask the resolved
//! config instead of comparing raw input against defaults themselves.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// ValueSource determines which layer supplied a resolved value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueSource {
    /// Schema default (fallback)
    Default,
    /// Caller-supplied value (validated)
    Caller,
    /// Computed from other resolved values
    Derived,
}

impl Default for ValueSource {
    fn default() -> Self {
        Self::Default
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedValue {
    pub source: ValueSource,
    pub value: Value,
}

impl ResolvedValue {
    pub fn from_default(value: Value) -> Self {
        Self { source: ValueSource::Default, value }
    }

    pub fn from_caller(value: Value) -> Self {
        Self { source: ValueSource::Caller, value }
    }

    pub fn derived(value: Value) -> Self {
        Self { source: ValueSource::Derived, value }
    }
}
