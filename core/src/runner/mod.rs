//! Sandboxed process execution.
//!
//! The [`ProcessRunner`] trait runs one shell command inside the toolchain
//! container described by an [`Environment`] and captures its stdout.
//! [`DockerCli`] is the implementation backed by the `docker` binary.

mod docker;

pub use docker::DockerCli;

use async_trait::async_trait;
use thiserror::Error;

use crate::environment::Environment;

/// Cause of a failed command.
///
/// The message is never empty: when the process produced no diagnostic output
/// a message naming the exit status is synthesized.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct CommandError {
    /// Human-readable cause.
    pub message: String,
    /// Process exit code, when the process ran to completion.
    pub exit_code: Option<i32>,
}

impl CommandError {
    /// Creates an error, substituting a generic message for empty causes.
    pub fn new(message: impl Into<String>, exit_code: Option<i32>) -> Self {
        let message = message.into().trim().to_string();
        let message = if !message.is_empty() {
            message
        } else {
            match exit_code {
                Some(code) => format!("process exited with status {}", code),
                None => "process failed without diagnostic output".to_string(),
            }
        };
        Self { message, exit_code }
    }

    /// Error for a process that could not be started.
    pub fn launch(program: &str, err: impl std::fmt::Display) -> Self {
        Self::new(format!("failed to launch {}: {}", program, err), None)
    }
}

/// Classification of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Exit status zero.
    Success,
    /// Non-zero exit, launch failure, or cancellation.
    Failed(CommandError),
}

/// Outcome of one command run through the sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    /// Captured standard output, verbatim.
    pub stdout: String,
    /// Success or failure with its cause.
    pub outcome: Outcome,
}

impl CommandResult {
    /// A successful result with the given output.
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            outcome: Outcome::Success,
        }
    }

    /// A failed result. Output captured before the failure is kept.
    pub fn failed(stdout: impl Into<String>, error: CommandError) -> Self {
        Self {
            stdout: stdout.into(),
            outcome: Outcome::Failed(error),
        }
    }

    /// Returns true if the command succeeded.
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Success)
    }

    /// Returns the failure cause, if any.
    pub fn error(&self) -> Option<&CommandError> {
        match &self.outcome {
            Outcome::Success => None,
            Outcome::Failed(err) => Some(err),
        }
    }

    /// Exit code of a failed command, when known.
    pub fn exit_code(&self) -> Option<i32> {
        self.error().and_then(|err| err.exit_code)
    }

    /// Converts into the captured output or the failure cause.
    pub fn into_result(self) -> Result<String, CommandError> {
        match self.outcome {
            Outcome::Success => Ok(self.stdout),
            Outcome::Failed(err) => Err(err),
        }
    }
}

/// Executes commands inside a sandboxed environment.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Runs `command` through `sh -c` in the environment's container.
    ///
    /// Never retries. Any failure is reported through the returned result.
    async fn run(&self, env: &Environment, command: &str) -> CommandResult;
}
