//! Error types for the flux-drift sandbox.

use thiserror::Error;

use crate::runner::CommandError;

/// Top-level error type for sandbox runs.
///
/// Every variant is fatal to the run. Failures of individual post-bootstrap
/// steps are recorded in the run report instead of surfacing here.
#[derive(Error, Debug)]
pub enum Error {
    /// A mandatory provisioning step could not be completed.
    #[error("provisioning failed at {step}: {reason}")]
    Provisioning { step: String, reason: String },

    /// The node never reported ready within the retry budget.
    #[error("cluster did not become ready after {attempts} attempts")]
    ReadinessTimeout { attempts: u32 },

    /// Flux bootstrap failed; there is no cluster identity without it.
    #[error("flux bootstrap failed: {0}")]
    Bootstrap(#[source] CommandError),

    /// A command run through the sandbox failed.
    #[error("command failed: {0}")]
    Command(#[from] CommandError),

    /// IO error while preparing the sandbox.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Configuration file could not be parsed.
    #[error("invalid configuration file: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// The run was cancelled before it finished.
    #[error("run cancelled")]
    Cancelled,
}

impl Error {
    /// Builds a provisioning error for the named step.
    pub fn provisioning(step: impl Into<String>, reason: impl ToString) -> Self {
        Self::Provisioning {
            step: step.into(),
            reason: reason.to_string(),
        }
    }
}

/// Result type alias for sandbox operations.
pub type Result<T> = std::result::Result<T, Error>;
