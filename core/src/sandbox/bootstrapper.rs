//! Container-backed cluster provisioning.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::{ClusterSpec, RunConfig, TOKEN_ENV_VAR};
use crate::environment::Environment;
use crate::error::{Error, Result};
use crate::secrets::SecretsManager;

use super::checkout::Checkout;
use super::engine::{ContainerEngine, ContainerSpec, Mount};
use super::provider::{ClusterProvider, ClusterSandbox};
use super::recipe::ImageRecipe;

/// Where k3s writes its config, backed by the cache volume.
const NODE_CONFIG_DIR: &str = "/etc/rancher/k3s";
/// Where the toolchain sees the cache volume.
const CACHE_MOUNT: &str = "/cache/k3s";
/// Kubeconfig file k3s generates.
const NODE_KUBECONFIG: &str = "k3s.yaml";
/// Stamp the node writes into the cache volume, holding the run id.
const RUN_STAMP: &str = "run-id";
/// Node paths backed by scratch tmpfs.
const NODE_SCRATCH: &[&str] = &[
    "/etc/lib/cni",
    "/var/lib/kubelet",
    "/var/lib/rancher/k3s",
    "/var/log",
];

/// Resources created so far, removed again if provisioning fails.
#[derive(Debug, Default)]
struct Created {
    network: Option<String>,
    containers: Vec<String>,
}

/// Provisions the k3s node and toolchain through a [`ContainerEngine`].
pub struct ClusterBootstrapper<E: ContainerEngine + ?Sized> {
    engine: Arc<E>,
    secrets: Arc<SecretsManager>,
}

impl<E: ContainerEngine + ?Sized> ClusterBootstrapper<E> {
    /// Creates a bootstrapper driving `engine`.
    pub fn new(engine: Arc<E>, secrets: Arc<SecretsManager>) -> Self {
        Self { engine, secrets }
    }

    fn generate_run_id() -> String {
        let id = uuid::Uuid::new_v4().to_string();
        format!("flux-drift-{}", &id[..8])
    }

    /// Node server command line, run through `sh -c`.
    ///
    /// The cache volume outlives the run but the node's CA does not, so the
    /// previous kubeconfig is deleted and the run id stamped before k3s starts.
    fn node_command(run_id: &str, cluster: &ClusterSpec) -> String {
        let mut command = format!(
            "rm -f {dir}/{kubeconfig} && echo {run_id} > {dir}/{stamp} && \
             k3s server --bind-address $(ip route | grep src | awk '{{print $NF}}') \
             --https-listen-port {port} --tls-san {alias}",
            dir = NODE_CONFIG_DIR,
            kubeconfig = NODE_KUBECONFIG,
            run_id = run_id,
            stamp = RUN_STAMP,
            port = cluster.api_port,
            alias = cluster.service_alias,
        );
        for component in &cluster.disable {
            command.push_str(" --disable ");
            command.push_str(component);
        }
        command
    }

    fn node_spec(run_id: &str, network: &str, cluster: &ClusterSpec) -> ContainerSpec {
        let mut mounts = vec![Mount::Volume {
            name: cluster.cache_volume.clone(),
            target: NODE_CONFIG_DIR.to_string(),
            read_only: false,
        }];
        mounts.extend(NODE_SCRATCH.iter().map(|target| Mount::Tmpfs {
            target: target.to_string(),
        }));

        ContainerSpec {
            network: Some(network.to_string()),
            alias: Some(cluster.service_alias.clone()),
            mounts,
            privileged: true,
            entrypoint: Some("sh".to_string()),
            command: vec!["-c".to_string(), Self::node_command(run_id, cluster)],
            ..ContainerSpec::new(format!("{}-k3s", run_id), &cluster.node_image)
        }
    }

    fn toolchain_spec(
        run_id: &str,
        network: &str,
        config: &RunConfig,
        checkout: &Checkout,
    ) -> ContainerSpec {
        let mut env = vec![(
            "KUBECONFIG".to_string(),
            config.cluster.kubeconfig_path.clone(),
        )];
        if let Some(token) = config.bootstrap.token.as_deref() {
            env.push((TOKEN_ENV_VAR.to_string(), token.to_string()));
        }

        ContainerSpec {
            network: Some(network.to_string()),
            mounts: vec![
                Mount::Volume {
                    name: config.cluster.cache_volume.clone(),
                    target: CACHE_MOUNT.to_string(),
                    read_only: true,
                },
                Mount::Bind {
                    source: checkout.path().to_path_buf(),
                    target: config.repository.mount_path.clone(),
                    read_only: true,
                },
            ],
            env,
            entrypoint: Some("sleep".to_string()),
            command: vec!["infinity".to_string()],
            ..ContainerSpec::new(format!("{}-toolchain", run_id), &config.toolchain.tag)
        }
    }

    /// Copies the node kubeconfig into the toolchain once k3s has written it.
    ///
    /// Only a kubeconfig next to this run's stamp counts; one left in the
    /// cache volume by an earlier run was signed by a CA that no longer exists.
    async fn install_credentials(
        &self,
        env: &Environment,
        run_id: &str,
        cluster: &ClusterSpec,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let source = format!("{}/{}", CACHE_MOUNT, NODE_KUBECONFIG);
        let probe = format!(
            "grep -qx {} {}/{} && test -s {}",
            run_id, CACHE_MOUNT, RUN_STAMP, source
        );
        let env = env.with_pipeline("credentials");
        let policy = &cluster.credential_wait;

        let mut present = false;
        for attempt in 1..=policy.max_attempts {
            if self.engine.run(&env, &probe).await.is_success() {
                present = true;
                break;
            }
            tracing::debug!(attempt, "waiting for node kubeconfig");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(policy.delay()) => {}
            }
        }
        if !present {
            return Err(Error::provisioning(
                "credentials",
                format!(
                    "{} did not appear after {} attempts",
                    source, policy.max_attempts
                ),
            ));
        }

        let target = &cluster.kubeconfig_path;
        let command = format!(
            "mkdir -p $(dirname {target}) && cp {source} {target} && \
             sed -i 's#https://127.0.0.1:[0-9]*#https://{alias}:{port}#' {target} && \
             chown {owner} {target}",
            target = target,
            source = source,
            alias = cluster.service_alias,
            port = cluster.api_port,
            owner = cluster.kubeconfig_owner,
        );
        let result = self.engine.run(&env, &command).await;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        result
            .into_result()
            .map_err(|e| Error::provisioning("credentials", e))?;

        Ok(())
    }

    async fn provision_steps(
        &self,
        config: &RunConfig,
        run_id: &str,
        cancel: &CancellationToken,
        created: &mut Created,
    ) -> Result<ClusterSandbox> {
        let check_cancel = || {
            if cancel.is_cancelled() {
                Err(Error::Cancelled)
            } else {
                Ok(())
            }
        };
        let network = run_id.to_string();

        self.engine
            .create_network(&network)
            .await
            .map_err(|e| Error::provisioning("network", e))?;
        created.network = Some(network.clone());

        self.engine
            .ensure_volume(&config.cluster.cache_volume)
            .await
            .map_err(|e| Error::provisioning("cache-volume", e))?;
        check_cancel()?;

        // A failed `run` can still leave a created container behind, so the
        // name is tracked before starting.
        let node = Self::node_spec(run_id, &network, &config.cluster);
        created.containers.push(node.name.clone());
        self.engine
            .start_container(&node)
            .await
            .map_err(|e| Error::provisioning("node-service", e))?;
        tracing::info!(
            node = %node.name,
            alias = %config.cluster.service_alias,
            "node service started"
        );
        check_cancel()?;

        self.engine
            .build_image(&ImageRecipe::from(&config.toolchain))
            .await
            .map_err(|e| Error::provisioning("toolchain-image", e))?;
        check_cancel()?;

        let checkout =
            Checkout::fetch(&config.bootstrap, &config.repository, &self.secrets).await?;
        check_cancel()?;

        let toolchain = Self::toolchain_spec(run_id, &network, config, &checkout);
        created.containers.push(toolchain.name.clone());
        self.engine
            .start_container(&toolchain)
            .await
            .map_err(|e| Error::provisioning("toolchain-container", e))?;

        let env = Environment::new(&toolchain.name).with_user("root");
        self.install_credentials(&env, run_id, &config.cluster, cancel)
            .await?;

        Ok(ClusterSandbox::new(run_id, env.with_workdir("/tmp"), cancel.clone())
            .with_network(network)
            .with_node(node.name)
            .with_cache_volume(&config.cluster.cache_volume)
            .with_repo_root(&config.repository.mount_path)
            .with_checkout(checkout))
    }

    async fn release(&self, network: Option<&str>, containers: &[String]) {
        // Toolchain first, then the node it depends on.
        for name in containers.iter().rev() {
            if let Err(e) = self.engine.remove_container(name).await {
                tracing::warn!(container = %name, error = %e, "failed to remove container");
            }
        }
        if let Some(network) = network {
            if let Err(e) = self.engine.remove_network(network).await {
                tracing::warn!(network = %network, error = %e, "failed to remove network");
            }
        }
    }
}

#[async_trait]
impl<E: ContainerEngine + ?Sized> ClusterProvider for ClusterBootstrapper<E> {
    async fn provision(
        &self,
        config: &RunConfig,
        cancel: &CancellationToken,
    ) -> Result<ClusterSandbox> {
        let run_id = Self::generate_run_id();
        tracing::info!(run_id = %run_id, "provisioning cluster sandbox");

        let mut created = Created::default();
        match self.provision_steps(config, &run_id, cancel, &mut created).await {
            Ok(sandbox) => {
                tracing::info!(run_id = %run_id, "cluster sandbox provisioned");
                Ok(sandbox)
            }
            Err(e) => {
                tracing::error!(
                    run_id = %run_id,
                    error = %e,
                    "provisioning failed, releasing resources"
                );
                self.release(created.network.as_deref(), &created.containers)
                    .await;
                Err(e)
            }
        }
    }

    async fn teardown(&self, sandbox: ClusterSandbox) {
        tracing::info!(run_id = %sandbox.run_id(), "tearing down cluster sandbox");

        let mut containers: Vec<String> =
            sandbox.node().map(str::to_string).into_iter().collect();
        containers.push(sandbox.toolchain().container().to_string());

        self.release(sandbox.network(), &containers).await;
    }
}
