//! Secret Store collaborator
//!
//! The installer never reads or rotates secret material. It only asks the
//! store to let a runtime identity read a named secret.

use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum SecretStoreError {
    #[error("Secret {secret} not found")]
    NotFound { secret: String },

    #[error("Granting {principal} access to {secret} was denied: {reason}")]
    Denied {
        secret: String,
        principal: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessorGrant {
    pub secret: String,
    pub principal: String,
}

pub trait SecretStore: Send + Sync {
    /// Grant `principal` read access to `secret`.
    fn grant_accessor(&self, secret: &str, principal: &str) -> Result<(), SecretStoreError>;
}

/// Records grants instead of calling a remote secret manager.
#[derive(Debug, Default)]
pub struct RecordingSecretStore {
    grants: Mutex<Vec<AccessorGrant>>,
    known: Option<Vec<String>>,
}

impl RecordingSecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only the listed secrets exist; grants on anything else fail.
    pub fn with_secrets<I, S>(secrets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            grants: Mutex::new(vec![]),
            known: Some(secrets.into_iter().map(Into::into).collect()),
        }
    }

    pub fn grants(&self) -> Vec<AccessorGrant> {
        self.grants.lock().map(|g| g.clone()).unwrap_or_default()
    }
}

impl SecretStore for RecordingSecretStore {
    fn grant_accessor(&self, secret: &str, principal: &str) -> Result<(), SecretStoreError> {
        if let Some(known) = &self.known {
            if !known.iter().any(|s| s == secret) {
                return Err(SecretStoreError::NotFound { secret: secret.to_string() });
            }
        }

        let mut grants = self.grants.lock().map_err(|_| SecretStoreError::Denied {
            secret: secret.to_string(),
            principal: principal.to_string(),
            reason: "grant ledger poisoned".to_string(),
        })?;
        info!(secret, principal, "granted secret accessor");
        grants.push(AccessorGrant {
            secret: secret.to_string(),
            principal: principal.to_string(),
        });
        Ok(())
    }
}
