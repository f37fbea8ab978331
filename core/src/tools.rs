//! Named tool wrappers over the process runner.
//!
//! Callers issue intent-labelled commands (`kubectl`, `helm`, `flux`, `git`)
//! instead of raw strings. Every call layers a fresh cache-busting marker and
//! pipeline labels onto the environment before forwarding, and returns the
//! runner's result untouched.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::Instrument;

use crate::environment::Environment;
use crate::runner::{CommandResult, ProcessRunner};
use crate::secrets::SecretsManager;

/// Environment variable carrying the cache-busting marker.
pub const CACHE_MARKER_VAR: &str = "CACHE";

/// A client tool available in the toolchain container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tool {
    /// Control-plane client.
    Kubectl,
    /// Package manager client.
    Helm,
    /// Reconciliation client.
    Flux,
    /// Source-control client.
    Git,
    /// Raw shell command, no prefix.
    Shell,
}

impl Tool {
    /// Binary name, or `"sh"` for raw commands.
    pub fn name(&self) -> &'static str {
        match self {
            Tool::Kubectl => "kubectl",
            Tool::Helm => "helm",
            Tool::Flux => "flux",
            Tool::Git => "git",
            Tool::Shell => "sh",
        }
    }

    /// Full command line for `args`.
    pub fn command_line(&self, args: &str) -> String {
        match self {
            Tool::Shell => args.trim().to_string(),
            tool => format!("{} {}", tool.name(), args.trim()),
        }
    }
}

/// Produces a distinct marker value on every call.
///
/// The wall-clock timestamp alone can repeat for calls issued within the
/// clock's resolution, so a sequence number is appended.
#[derive(Debug, Default)]
struct CacheBuster {
    seq: AtomicU64,
}

impl CacheBuster {
    fn next(&self) -> String {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        format!("{}-{}", chrono::Utc::now().to_rfc3339(), seq)
    }
}

/// Intent-labelled command wrappers.
pub struct ToolFacade<R: ProcessRunner + ?Sized> {
    runner: Arc<R>,
    cache: CacheBuster,
    secrets: Arc<SecretsManager>,
}

impl<R: ProcessRunner + ?Sized> ToolFacade<R> {
    /// Creates a facade over `runner`.
    pub fn new(runner: Arc<R>) -> Self {
        Self::with_secrets(runner, Arc::new(SecretsManager::new()))
    }

    /// Creates a facade that redacts `secrets` from logged command lines.
    pub fn with_secrets(runner: Arc<R>, secrets: Arc<SecretsManager>) -> Self {
        Self {
            runner,
            cache: CacheBuster::default(),
            secrets,
        }
    }

    /// Masks loaded secrets in `text`.
    pub fn redact(&self, text: &str) -> String {
        self.secrets.redact(text)
    }

    /// Runs a `kubectl` command.
    pub async fn kubectl(&self, env: &Environment, args: &str) -> CommandResult {
        self.tool(env, Tool::Kubectl, args).await
    }

    /// Runs a `helm` command.
    pub async fn helm(&self, env: &Environment, args: &str) -> CommandResult {
        self.tool(env, Tool::Helm, args).await
    }

    /// Runs a `flux` command.
    pub async fn flux(&self, env: &Environment, args: &str) -> CommandResult {
        self.tool(env, Tool::Flux, args).await
    }

    /// Runs a `git` command.
    pub async fn git(&self, env: &Environment, args: &str) -> CommandResult {
        self.tool(env, Tool::Git, args).await
    }

    /// Runs a raw shell command.
    pub async fn shell(&self, env: &Environment, command: &str) -> CommandResult {
        self.tool(env, Tool::Shell, command).await
    }

    /// Forwards `args` to `tool` through the runner.
    pub async fn tool(&self, env: &Environment, tool: Tool, args: &str) -> CommandResult {
        let command = tool.command_line(args);
        let logged = self.secrets.redact(&command);

        let env = env
            .with_pipeline(tool.name())
            .with_pipeline(logged.clone())
            .with_env(CACHE_MARKER_VAR, self.cache.next());

        let span = tracing::info_span!("tool", tool = tool.name(), command = %logged);
        async {
            tracing::debug!("running");
            let result = self.runner.run(&env, &command).await;
            if let Some(err) = result.error() {
                tracing::debug!(
                    error = %self.secrets.redact(&err.message),
                    exit_code = ?err.exit_code,
                    "command failed"
                );
            }
            result
        }
        .instrument(span)
        .await
    }
}
