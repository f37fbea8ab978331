//! Container engine abstraction used during provisioning.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::runner::{CommandError, ProcessRunner};

use super::recipe::ImageRecipe;

/// A mount attached to a container at start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mount {
    /// Named volume, persisted across runs.
    Volume {
        name: String,
        target: String,
        read_only: bool,
    },
    /// Scratch tmpfs, discarded with the container.
    Tmpfs { target: String },
    /// Host directory.
    Bind {
        source: PathBuf,
        target: String,
        read_only: bool,
    },
}

impl Mount {
    fn to_arg(&self) -> String {
        let ro = |read_only: bool| if read_only { ",readonly" } else { "" };
        match self {
            Mount::Volume {
                name,
                target,
                read_only,
            } => format!(
                "type=volume,source={},target={}{}",
                name,
                target,
                ro(*read_only)
            ),
            Mount::Tmpfs { target } => format!("type=tmpfs,target={}", target),
            Mount::Bind {
                source,
                target,
                read_only,
            } => format!(
                "type=bind,source={},target={}{}",
                source.display(),
                target,
                ro(*read_only)
            ),
        }
    }
}

/// Everything needed to start a detached container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Container name, unique per run.
    pub name: String,
    /// Image to run.
    pub image: String,
    /// Network to attach to.
    pub network: Option<String>,
    /// Alias on that network other containers resolve.
    pub alias: Option<String>,
    /// Mounts in attach order.
    pub mounts: Vec<Mount>,
    /// Environment set for the container's lifetime.
    pub env: Vec<(String, String)>,
    /// Grants all capabilities (needed by k3s for its own netns).
    pub privileged: bool,
    /// Entrypoint override.
    pub entrypoint: Option<String>,
    /// Arguments passed to the entrypoint.
    pub command: Vec<String>,
}

impl ContainerSpec {
    /// Creates a spec for `name` running `image`.
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            ..Default::default()
        }
    }

    /// `docker run` arguments for this spec.
    pub fn run_args(&self) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--detach".to_string(),
            "--name".to_string(),
            self.name.clone(),
        ];

        if let Some(network) = &self.network {
            args.push("--network".to_string());
            args.push(network.clone());
        }
        if let Some(alias) = &self.alias {
            args.push("--network-alias".to_string());
            args.push(alias.clone());
        }
        if self.privileged {
            args.push("--privileged".to_string());
        }
        for mount in &self.mounts {
            args.push("--mount".to_string());
            args.push(mount.to_arg());
        }
        for (key, value) in &self.env {
            args.push("--env".to_string());
            args.push(format!("{}={}", key, value));
        }
        if let Some(entrypoint) = &self.entrypoint {
            args.push("--entrypoint".to_string());
            args.push(entrypoint.clone());
        }

        args.push(self.image.clone());
        args.extend(self.command.iter().cloned());
        args
    }
}

/// Container lifecycle operations.
///
/// Every engine is also a [`ProcessRunner`], used for the setup commands run
/// in the toolchain during provisioning.
#[async_trait]
pub trait ContainerEngine: ProcessRunner {
    /// Creates a network.
    async fn create_network(&self, name: &str) -> Result<(), CommandError>;

    /// Creates a named volume unless it already exists.
    async fn ensure_volume(&self, name: &str) -> Result<(), CommandError>;

    /// Builds `recipe` and tags it with `recipe.tag`.
    async fn build_image(&self, recipe: &ImageRecipe) -> Result<(), CommandError>;

    /// Starts a detached container.
    async fn start_container(&self, spec: &ContainerSpec) -> Result<(), CommandError>;

    /// Force-removes a container.
    async fn remove_container(&self, name: &str) -> Result<(), CommandError>;

    /// Removes a network.
    async fn remove_network(&self, name: &str) -> Result<(), CommandError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_args_for_node_service() {
        let spec = ContainerSpec {
            network: Some("net".to_string()),
            alias: Some("k3s".to_string()),
            privileged: true,
            mounts: vec![
                Mount::Volume {
                    name: "k3s_config".to_string(),
                    target: "/etc/rancher/k3s".to_string(),
                    read_only: false,
                },
                Mount::Tmpfs {
                    target: "/var/log".to_string(),
                },
            ],
            entrypoint: Some("sh".to_string()),
            command: vec!["-c".to_string(), "k3s server".to_string()],
            ..ContainerSpec::new("run-k3s", "rancher/k3s")
        };

        assert_eq!(
            spec.run_args(),
            vec![
                "run",
                "--detach",
                "--name",
                "run-k3s",
                "--network",
                "net",
                "--network-alias",
                "k3s",
                "--privileged",
                "--mount",
                "type=volume,source=k3s_config,target=/etc/rancher/k3s",
                "--mount",
                "type=tmpfs,target=/var/log",
                "--entrypoint",
                "sh",
                "rancher/k3s",
                "-c",
                "k3s server",
            ]
        );
    }

    #[test]
    fn read_only_bind_mount() {
        let mount = Mount::Bind {
            source: PathBuf::from("/tmp/checkout"),
            target: "/src".to_string(),
            read_only: true,
        };
        assert_eq!(mount.to_arg(), "type=bind,source=/tmp/checkout,target=/src,readonly");
    }

    #[test]
    fn minimal_spec_runs_image_only() {
        let spec = ContainerSpec::new("c", "alpine");
        assert_eq!(spec.run_args(), vec!["run", "--detach", "--name", "c", "alpine"]);
    }
}
