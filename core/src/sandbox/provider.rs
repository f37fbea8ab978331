//! Cluster provider trait and the sandbox it produces.

use std::path::Path;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::RunConfig;
use crate::environment::Environment;
use crate::error::Result;

use super::checkout::Checkout;

/// The single ephemeral cluster of a run.
///
/// Holds the node service, the toolchain environment descriptor, the cache
/// volume carrying cluster credentials, and the repository checkout mounted
/// into the toolchain. Owned by the orchestrator and handed back to its
/// provider for teardown.
pub struct ClusterSandbox {
    run_id: String,
    network: Option<String>,
    node: Option<String>,
    cache_volume: Option<String>,
    toolchain: Environment,
    repo_root: String,
    checkout: Option<Checkout>,
    cancel: CancellationToken,
}

impl ClusterSandbox {
    /// Creates a sandbox whose toolchain commands run in `toolchain`.
    pub fn new(
        run_id: impl Into<String>,
        toolchain: Environment,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            network: None,
            node: None,
            cache_volume: None,
            toolchain,
            repo_root: "/src".to_string(),
            checkout: None,
            cancel,
        }
    }

    /// Sets the network joining node and toolchain.
    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = Some(network.into());
        self
    }

    /// Sets the node service container.
    pub fn with_node(mut self, node: impl Into<String>) -> Self {
        self.node = Some(node.into());
        self
    }

    /// Sets the cache volume holding node config and credentials.
    pub fn with_cache_volume(mut self, volume: impl Into<String>) -> Self {
        self.cache_volume = Some(volume.into());
        self
    }

    /// Sets where the repository tree is mounted in the toolchain.
    pub fn with_repo_root(mut self, root: impl Into<String>) -> Self {
        self.repo_root = root.into();
        self
    }

    /// Attaches the host checkout; it lives as long as the sandbox.
    pub fn with_checkout(mut self, checkout: Checkout) -> Self {
        self.checkout = Some(checkout);
        self
    }

    /// Run identifier, used as the resource name prefix.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Network name, if one was created.
    pub fn network(&self) -> Option<&str> {
        self.network.as_deref()
    }

    /// Node service container name.
    pub fn node(&self) -> Option<&str> {
        self.node.as_deref()
    }

    /// Cache volume name.
    pub fn cache_volume(&self) -> Option<&str> {
        self.cache_volume.as_deref()
    }

    /// Latest toolchain environment descriptor.
    pub fn toolchain(&self) -> &Environment {
        &self.toolchain
    }

    /// Repository root inside the toolchain.
    pub fn repo_root(&self) -> &str {
        &self.repo_root
    }

    /// Host path of the repository checkout.
    pub fn checkout_path(&self) -> Option<&Path> {
        self.checkout.as_ref().map(Checkout::path)
    }

    /// Cancellation token for the run.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl std::fmt::Debug for ClusterSandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterSandbox")
            .field("run_id", &self.run_id)
            .field("network", &self.network)
            .field("node", &self.node)
            .field("cache_volume", &self.cache_volume)
            .field("toolchain", &self.toolchain)
            .field("repo_root", &self.repo_root)
            .finish_non_exhaustive()
    }
}

/// Provider for the ephemeral cluster.
#[async_trait]
pub trait ClusterProvider: Send + Sync {
    /// Provisions a ready-to-poll sandbox.
    ///
    /// Any failed mandatory step aborts provisioning with
    /// [`Error::Provisioning`](crate::Error::Provisioning); resources created
    /// before the failure are removed first.
    async fn provision(
        &self,
        config: &RunConfig,
        cancel: &CancellationToken,
    ) -> Result<ClusterSandbox>;

    /// Releases every resource the sandbox holds except the cache volume.
    ///
    /// Failures are logged, never returned.
    async fn teardown(&self, sandbox: ClusterSandbox);
}
