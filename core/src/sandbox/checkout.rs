//! Configuration repository checkout on the host.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tempfile::TempDir;
use tokio::process::Command;

use crate::config::{BootstrapSpec, RepositorySource};
use crate::error::{Error, Result};
use crate::secrets::SecretsManager;

/// A repository tree on the host, mounted read-only into the toolchain.
///
/// Fetched checkouts live in a temporary directory removed on drop; local
/// checkouts are left alone.
#[derive(Debug)]
pub struct Checkout {
    path: PathBuf,
    _dir: Option<TempDir>,
}

impl Checkout {
    /// Wraps an existing local checkout.
    pub fn local(path: PathBuf) -> Self {
        Self { path, _dir: None }
    }

    /// Path of the repository root.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Shallow-clones the configured branch into a temporary directory.
    pub async fn fetch(
        bootstrap: &BootstrapSpec,
        source: &RepositorySource,
        secrets: &SecretsManager,
    ) -> Result<Self> {
        if let Some(local) = &source.local_path {
            let path = local.canonicalize().map_err(|e| {
                Error::provisioning(
                    "repository-fetch",
                    format!("cannot use {}: {}", local.display(), e),
                )
            })?;
            tracing::info!(path = ?path, "using local repository checkout");
            return Ok(Self::local(path));
        }

        let dir = tempfile::Builder::new()
            .prefix("flux-drift-repo-")
            .tempdir()?;
        let path = dir.path().join(&bootstrap.repository);

        tracing::info!(
            repository = %format!("{}/{}", bootstrap.owner, bootstrap.repository),
            branch = %source.checkout_branch,
            "fetching configuration repository"
        );

        let output = Command::new("git")
            .args(["clone", "--depth", "1", "--single-branch", "--branch"])
            .arg(&source.checkout_branch)
            .arg(bootstrap.clone_url())
            .arg(&path)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                Error::provisioning("repository-fetch", format!("failed to run git: {}", e))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::provisioning(
                "repository-fetch",
                redact(bootstrap, secrets, stderr.trim()),
            ));
        }

        Ok(Self {
            path,
            _dir: Some(dir),
        })
    }
}

fn redact(bootstrap: &BootstrapSpec, secrets: &SecretsManager, text: &str) -> String {
    let text = secrets.redact(text);
    match bootstrap.token.as_deref().filter(|t| !t.is_empty()) {
        Some(token) => text.replace(token, "[REDACTED]"),
        None => text,
    }
}
