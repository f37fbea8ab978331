//! Run configuration and validation.
//!
//! Every field has a default, so an empty (or absent) configuration file
//! reproduces the stock run against `shaked/fluxcd-test`. The access token is
//! never read from the file; it is resolved from the environment at startup
//! and carried explicitly in [`BootstrapSpec`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::secrets::{SecretRef, SecretSource, SecretsManager};
use crate::tools::Tool;

/// Environment variable holding the repository access token.
pub const TOKEN_ENV_VAR: &str = "GITHUB_TOKEN";

/// Bounded retry with a fixed delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of attempts.
    pub max_attempts: u32,
    /// Delay before each attempt, in milliseconds.
    pub delay_ms: u64,
}

impl RetryPolicy {
    /// Creates a policy with the given attempt budget and delay.
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Delay before each attempt.
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(5))
    }
}

/// Parameters for the one-time `flux bootstrap github` call.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapSpec {
    /// GitHub account owning the repository.
    pub owner: String,
    /// Repository name.
    pub repository: String,
    /// Branch flux reconciles from.
    pub branch: String,
    /// Cluster path inside the repository.
    pub path: String,
    /// Access token, resolved from the environment.
    #[serde(skip)]
    pub token: Option<String>,
}

impl Default for BootstrapSpec {
    fn default() -> Self {
        Self {
            owner: "shaked".to_string(),
            repository: "fluxcd-test".to_string(),
            branch: "main".to_string(),
            path: "clusters/tests".to_string(),
            token: None,
        }
    }
}

impl BootstrapSpec {
    /// Sets the access token.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Arguments passed to `flux` for the bootstrap.
    pub fn command(&self) -> String {
        format!(
            "bootstrap github --owner={} --repository={} --branch={} --path={}",
            self.owner, self.repository, self.branch, self.path
        )
    }

    /// Clone URL, authenticated when a token is present.
    pub fn clone_url(&self) -> String {
        match self.token.as_deref().filter(|t| !t.is_empty()) {
            Some(token) => format!(
                "https://oauth2:{}@github.com/{}/{}.git",
                token, self.owner, self.repository
            ),
            None => format!("https://github.com/{}/{}.git", self.owner, self.repository),
        }
    }
}

impl std::fmt::Debug for BootstrapSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootstrapSpec")
            .field("owner", &self.owner)
            .field("repository", &self.repository)
            .field("branch", &self.branch)
            .field("path", &self.path)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Where the configuration repository tree comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositorySource {
    /// Branch checked out for diffing. May differ from the bootstrap branch.
    pub checkout_branch: String,
    /// Use this local checkout instead of cloning.
    pub local_path: Option<PathBuf>,
    /// Mount point of the tree inside the toolchain container.
    pub mount_path: String,
}

impl Default for RepositorySource {
    fn default() -> Self {
        Self {
            checkout_branch: "diff".to_string(),
            local_path: None,
            mount_path: "/src".to_string(),
        }
    }
}

/// A binary copied out of an upstream image into the toolchain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolBinary {
    /// Binary name, installed to `/usr/local/bin/<name>`.
    pub name: String,
    /// Image the binary is copied from.
    pub image: String,
    /// Path of the binary inside that image.
    pub path: String,
}

impl ToolBinary {
    fn new(name: &str, image: &str, path: &str) -> Self {
        Self {
            name: name.to_string(),
            image: image.to_string(),
            path: path.to_string(),
        }
    }
}

/// Toolchain image composition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolchainImage {
    /// Tag the built image is stored under.
    pub tag: String,
    /// Minimal base image.
    pub base: String,
    /// Client binaries layered onto the base.
    pub binaries: Vec<ToolBinary>,
    /// OS packages for diagnostics and source control.
    pub packages: Vec<String>,
}

impl Default for ToolchainImage {
    fn default() -> Self {
        Self {
            tag: "flux-drift/toolchain:latest".to_string(),
            base: "cgr.dev/chainguard/wolfi-base:latest".to_string(),
            binaries: vec![
                ToolBinary::new("kubectl", "bitnami/kubectl", "/opt/bitnami/kubectl/bin/kubectl"),
                ToolBinary::new("helm", "alpine/helm", "/usr/bin/helm"),
                ToolBinary::new(
                    "flux",
                    "ghcr.io/fluxcd/flux-cli:v2.0.0-rc.5",
                    "/usr/local/bin/flux",
                ),
            ],
            packages: ["curl", "jq", "openssh-client", "git"]
                .iter()
                .map(|p| p.to_string())
                .collect(),
        }
    }
}

/// Node service settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSpec {
    /// k3s image.
    pub node_image: String,
    /// Cache volume persisting node config and credentials across runs.
    pub cache_volume: String,
    /// Network alias the toolchain reaches the node by.
    pub service_alias: String,
    /// Control-plane API port.
    pub api_port: u16,
    /// Packaged components disabled on the node.
    pub disable: Vec<String>,
    /// Where the toolchain copies the kubeconfig to.
    pub kubeconfig_path: String,
    /// Owner set on the copied kubeconfig.
    pub kubeconfig_owner: String,
    /// Wait for the node to write its kubeconfig into the cache volume.
    pub credential_wait: RetryPolicy,
}

impl Default for ClusterSpec {
    fn default() -> Self {
        Self {
            node_image: "rancher/k3s".to_string(),
            cache_volume: "k3s_config".to_string(),
            service_alias: "k3s".to_string(),
            api_port: 6443,
            disable: vec!["traefik".to_string(), "metrics-server".to_string()],
            kubeconfig_path: "/.kube/config".to_string(),
            kubeconfig_owner: "1001:0".to_string(),
            credential_wait: RetryPolicy::new(30, Duration::from_secs(2)),
        }
    }
}

/// A non-fatal diagnostic query run after bootstrap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCheck {
    /// Step name used in logs and the report.
    pub name: String,
    /// Tool the command is forwarded to.
    pub tool: Tool,
    /// Arguments after the tool name.
    pub command: String,
}

impl StatusCheck {
    /// Creates a status check.
    pub fn new(name: impl Into<String>, tool: Tool, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tool,
            command: command.into(),
        }
    }
}

/// A kustomization diffed against a subpath of the fetched tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffTarget {
    /// Kustomization name passed to `flux diff kustomization`.
    pub kustomization: String,
    /// Path relative to the repository root.
    pub path: String,
}

impl DiffTarget {
    /// Creates a diff target.
    pub fn new(kustomization: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            kustomization: kustomization.into(),
            path: path.into(),
        }
    }

    /// Arguments passed to `flux` for this diff.
    pub fn command(&self, repo_root: &str) -> String {
        format!(
            "diff kustomization {} --path {}/{}",
            self.kustomization,
            repo_root.trim_end_matches('/'),
            self.path.trim_start_matches('/')
        )
    }
}

fn default_status_checks() -> Vec<StatusCheck> {
    vec![
        StatusCheck::new(
            "wait-apps",
            Tool::Kubectl,
            "wait kustomization/apps --for=condition=ready --timeout=5m -n flux-system",
        ),
        StatusCheck::new("helm-releases", Tool::Kubectl, "get hr -A -o wide"),
        StatusCheck::new("pods", Tool::Kubectl, "get pods -A -o wide"),
        StatusCheck::new("helm-list", Tool::Helm, "ls -A"),
        StatusCheck::new("source-tree", Tool::Shell, "ls -la /src"),
    ]
}

fn default_diffs() -> Vec<DiffTarget> {
    vec![
        DiffTarget::new("infra-custom", "infra"),
        DiffTarget::new("apps", "apps"),
        DiffTarget::new("flux-system", "clusters/tests"),
    ]
}

/// Complete configuration for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Flux bootstrap parameters.
    pub bootstrap: BootstrapSpec,
    /// Configuration repository checkout.
    pub repository: RepositorySource,
    /// Node service settings.
    pub cluster: ClusterSpec,
    /// Toolchain image composition.
    pub toolchain: ToolchainImage,
    /// Readiness polling budget.
    pub readiness: RetryPolicy,
    /// Post-bootstrap diagnostic queries, in order.
    pub status_checks: Vec<StatusCheck>,
    /// Kustomization diffs, in order.
    pub diffs: Vec<DiffTarget>,
    /// Exit non-zero when any soft step failed.
    pub fail_on_soft_errors: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            bootstrap: BootstrapSpec::default(),
            repository: RepositorySource::default(),
            cluster: ClusterSpec::default(),
            toolchain: ToolchainImage::default(),
            readiness: RetryPolicy::default(),
            status_checks: default_status_checks(),
            diffs: default_diffs(),
            fail_on_soft_errors: false,
        }
    }
}

impl RunConfig {
    /// Parses a configuration from TOML text.
    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Loads configuration from `path`, or defaults when `None`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|e| {
                    Error::Config(format!("cannot read {}: {}", path.display(), e))
                })?;
                Self::from_toml(&text)
            }
            None => Ok(Self::default()),
        }
    }

    /// Resolves the access token from [`TOKEN_ENV_VAR`] into `secrets`.
    ///
    /// A missing token is not an error here; it surfaces later as an
    /// authentication failure from the fetch or the bootstrap.
    pub fn resolve_token(mut self, secrets: &mut SecretsManager) -> Self {
        let secret = SecretRef {
            name: TOKEN_ENV_VAR.to_string(),
            source: SecretSource::EnvVar(TOKEN_ENV_VAR.to_string()),
        };
        match secrets.load_secret(&secret) {
            Ok(()) => {
                self.bootstrap.token = secrets.environment().get(TOKEN_ENV_VAR).cloned();
            }
            Err(e) => tracing::debug!(error = %e, "no access token resolved"),
        }
        self
    }
}

/// Validation result containing all found issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// List of validation errors (fatal).
    pub errors: Vec<String>,
    /// List of validation warnings (non-fatal).
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Adds an error to the result.
    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    /// Adds a warning to the result.
    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    /// Merges another validation result into this one.
    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// Converts to a Result, failing if there are errors.
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.is_valid() {
            Ok(self.warnings)
        } else {
            Err(Error::Config(self.errors.join("; ")))
        }
    }
}

/// Trait for validatable configuration types.
pub trait Validate {
    /// Validates the configuration and returns any issues found.
    fn validate(&self) -> ValidationResult;
}

impl Validate for RetryPolicy {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.max_attempts == 0 {
            result.add_error("max_attempts must be at least 1");
        }

        if self.delay_ms == 0 {
            result.add_warning("a zero retry delay polls the cluster in a tight loop");
        }

        result
    }
}

impl Validate for BootstrapSpec {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        for (field, value) in [
            ("owner", &self.owner),
            ("repository", &self.repository),
            ("branch", &self.branch),
            ("path", &self.path),
        ] {
            if value.trim().is_empty() {
                result.add_error(format!("bootstrap.{} cannot be empty", field));
            }
        }

        if self.token.as_deref().map_or(true, str::is_empty) {
            result.add_warning(format!(
                "{} is not set; repository fetch and bootstrap will likely fail to authenticate",
                TOKEN_ENV_VAR
            ));
        }

        result
    }
}

impl Validate for RunConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        result.merge(self.bootstrap.validate());
        result.merge(self.readiness.validate());
        result.merge(self.cluster.credential_wait.validate());

        if self.toolchain.binaries.is_empty() {
            result.add_error("toolchain.binaries cannot be empty");
        }

        for tool in [Tool::Kubectl, Tool::Flux] {
            if !self.toolchain.binaries.iter().any(|b| b.name == tool.name()) {
                result.add_error(format!("toolchain is missing the {} binary", tool.name()));
            }
        }

        if self.diffs.is_empty() {
            result.add_warning("no diff targets configured; the run only checks status");
        }

        for diff in &self.diffs {
            if diff.kustomization.trim().is_empty() {
                result.add_error("diff kustomization name cannot be empty");
            }
        }

        if let Some(path) = &self.repository.local_path {
            if !path.is_dir() {
                result.add_error(format!(
                    "repository.local_path {} is not a directory",
                    path.display()
                ));
            }
        }

        result
    }
}
