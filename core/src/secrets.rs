//! Secret resolution and log redaction.
//!
//! The repository access token ends up in the clone URL and in the toolchain
//! environment. Anything that may echo it back (command lines, git errors)
//! passes through [`SecretsManager::redact`] before being logged.

use std::collections::HashMap;
use std::env;

use serde::{Deserialize, Serialize};

/// A reference to a secret that should be resolved.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SecretRef {
    /// Name of the secret (used as env var name in the sandbox).
    pub name: String,
    /// Source of the secret value.
    pub source: SecretSource,
}

/// Source from which to retrieve a secret value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SecretSource {
    /// Read from an environment variable.
    EnvVar(String),
    /// Provided directly (for testing only).
    Direct(String),
}

/// Holds resolved secrets for a run.
#[derive(Default)]
pub struct SecretsManager {
    /// Resolved secrets (name -> value).
    secrets: HashMap<String, String>,
}

impl SecretsManager {
    /// Creates an empty secrets manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves and stores a secret from its source.
    ///
    /// Empty values are treated as unset.
    pub fn load_secret(&mut self, secret_ref: &SecretRef) -> Result<(), SecretError> {
        let value = match &secret_ref.source {
            SecretSource::EnvVar(var_name) => env::var(var_name).map_err(|_| {
                SecretError::NotFound(format!("environment variable '{}' not set", var_name))
            })?,
            SecretSource::Direct(value) => value.clone(),
        };

        if value.trim().is_empty() {
            return Err(SecretError::NotFound(format!(
                "secret '{}' is empty",
                secret_ref.name
            )));
        }

        self.secrets.insert(secret_ref.name.clone(), value);
        Ok(())
    }

    /// Returns the resolved secrets keyed by name.
    pub fn environment(&self) -> &HashMap<String, String> {
        &self.secrets
    }

    /// Redacts all known secret values from a string.
    ///
    /// Secret values are replaced with `[REDACTED:<name>]`.
    pub fn redact(&self, text: &str) -> String {
        let mut ordered: Vec<_> = self.secrets.iter().collect();
        // Longer values first so a secret containing another is fully masked.
        ordered.sort_by(|a, b| b.1.len().cmp(&a.1.len()));

        ordered
            .into_iter()
            .fold(text.to_string(), |acc, (name, value)| {
                acc.replace(value.as_str(), &format!("[REDACTED:{}]", name))
            })
    }

    /// Returns true if any secrets are loaded.
    pub fn has_secrets(&self) -> bool {
        !self.secrets.is_empty()
    }
}

/// Error type for secret operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretError {
    /// Secret source could not be found or read.
    NotFound(String),
}

impl std::fmt::Display for SecretError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SecretError::NotFound(msg) => write!(f, "secret not found: {}", msg),
        }
    }
}

impl std::error::Error for SecretError {}
