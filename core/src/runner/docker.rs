//! Docker CLI backed runner and container engine.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::environment::Environment;
use crate::sandbox::{ContainerEngine, ContainerSpec, ImageRecipe};

use super::{CommandError, CommandResult, ProcessRunner};

/// Runs commands and manages containers through the `docker` binary.
pub struct DockerCli {
    /// Path to the docker (or docker-compatible) CLI binary.
    binary: String,
    /// Cancels in-flight processes when triggered.
    cancel: CancellationToken,
}

impl DockerCli {
    /// Creates a runner using the default `docker` command.
    pub fn new(cancel: CancellationToken) -> Self {
        Self::with_binary("docker", cancel)
    }

    /// Creates a runner with a custom CLI binary, e.g. `podman`.
    pub fn with_binary(binary: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            binary: binary.into(),
            cancel,
        }
    }

    /// Returns the CLI binary in use.
    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Builds the `docker exec` arguments for a command in `env`.
    fn exec_args(env: &Environment, command: &str) -> Vec<String> {
        let mut args = vec!["exec".to_string()];

        if let Some(user) = env.user() {
            args.push("--user".to_string());
            args.push(user.to_string());
        }
        if let Some(dir) = env.workdir() {
            args.push("--workdir".to_string());
            args.push(dir.to_string());
        }
        for (key, value) in env.env() {
            args.push("--env".to_string());
            args.push(format!("{}={}", key, value));
        }

        args.push(env.container().to_string());
        args.extend(["sh".to_string(), "-c".to_string(), command.to_string()]);
        args
    }

    /// Invokes the CLI, optionally feeding `input` on stdin.
    ///
    /// Only `cancellable` invocations stop on cancellation, so teardown still
    /// runs after the token fires.
    async fn invoke(
        &self,
        args: &[String],
        input: Option<&str>,
        cancellable: bool,
    ) -> CommandResult {
        let mut child = match Command::new(&self.binary)
            .args(args)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => return CommandResult::failed("", CommandError::launch(&self.binary, e)),
        };

        if let (Some(input), Some(mut stdin)) = (input, child.stdin.take()) {
            if let Err(e) = stdin.write_all(input.as_bytes()).await {
                return CommandResult::failed(
                    "",
                    CommandError::new(format!("failed to write stdin: {}", e), None),
                );
            }
        }

        let output = tokio::select! {
            biased;
            _ = self.cancel.cancelled(), if cancellable => {
                return CommandResult::failed("", CommandError::new("cancelled", None));
            }
            output = child.wait_with_output() => output,
        };

        match output {
            Ok(output) => {
                let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
                if output.status.success() {
                    CommandResult::success(stdout)
                } else {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    CommandResult::failed(stdout, CommandError::new(stderr, output.status.code()))
                }
            }
            Err(e) => CommandResult::failed(
                "",
                CommandError::new(format!("failed to wait for {}: {}", self.binary, e), None),
            ),
        }
    }

    async fn invoke_checked(&self, args: &[String]) -> Result<(), CommandError> {
        self.invoke(args, None, false).await.into_result().map(|_| ())
    }
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|arg| arg.to_string()).collect()
}

#[async_trait]
impl ProcessRunner for DockerCli {
    async fn run(&self, env: &Environment, command: &str) -> CommandResult {
        let args = Self::exec_args(env, command);
        tracing::debug!(
            container = %env.container(),
            pipeline = ?env.pipeline(),
            "docker exec"
        );
        self.invoke(&args, None, true).await
    }
}

#[async_trait]
impl ContainerEngine for DockerCli {
    async fn create_network(&self, name: &str) -> Result<(), CommandError> {
        self.invoke_checked(&strings(&["network", "create", name])).await
    }

    async fn ensure_volume(&self, name: &str) -> Result<(), CommandError> {
        // `volume create` is a no-op for an existing volume.
        self.invoke_checked(&strings(&["volume", "create", name])).await
    }

    async fn build_image(&self, recipe: &ImageRecipe) -> Result<(), CommandError> {
        let dockerfile = recipe.render_dockerfile();
        tracing::info!(tag = %recipe.tag, "building toolchain image");
        self.invoke(&strings(&["build", "-t", &recipe.tag, "-"]), Some(&dockerfile), true)
            .await
            .into_result()
            .map(|_| ())
    }

    async fn start_container(&self, spec: &ContainerSpec) -> Result<(), CommandError> {
        tracing::info!(name = %spec.name, image = %spec.image, "starting container");
        self.invoke_checked(&spec.run_args()).await
    }

    async fn remove_container(&self, name: &str) -> Result<(), CommandError> {
        self.invoke_checked(&strings(&["rm", "-f", name])).await
    }

    async fn remove_network(&self, name: &str) -> Result<(), CommandError> {
        self.invoke_checked(&strings(&["network", "rm", name])).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_args_carry_user_workdir_and_env() {
        let env = Environment::new("run-1-toolchain")
            .with_user("root")
            .with_workdir("/tmp")
            .with_env("CACHE", "42");

        let args = DockerCli::exec_args(&env, "kubectl get nodes -o wide");

        assert_eq!(
            args,
            vec![
                "exec",
                "--user",
                "root",
                "--workdir",
                "/tmp",
                "--env",
                "CACHE=42",
                "run-1-toolchain",
                "sh",
                "-c",
                "kubectl get nodes -o wide",
            ]
        );
    }

    #[test]
    fn exec_args_omit_unset_fields() {
        let args = DockerCli::exec_args(&Environment::new("c"), "true");
        assert_eq!(args, vec!["exec", "c", "sh", "-c", "true"]);
    }

    #[tokio::test]
    async fn launch_failure_is_a_failed_result() {
        let cli = DockerCli::with_binary("flux-drift-no-such-binary", CancellationToken::new());
        let result = cli.run(&Environment::new("c"), "true").await;

        assert!(!result.is_success());
        let err = result.error().unwrap();
        assert!(err.message.contains("failed to launch"));
        assert_eq!(err.exit_code, None);
    }

    #[tokio::test]
    async fn silent_non_zero_exit_gets_a_cause() {
        let cli = DockerCli::with_binary("false", CancellationToken::new());
        let result = cli.run(&Environment::new("c"), "true").await;

        assert_eq!(result.exit_code(), Some(1));
        assert!(!result.error().unwrap().message.is_empty());
    }

    #[tokio::test]
    async fn stdout_is_captured_verbatim() {
        let cli = DockerCli::with_binary("echo", CancellationToken::new());
        let result = cli.run(&Environment::new("c"), "helm ls -A").await;

        assert!(result.is_success());
        assert_eq!(result.stdout, "exec c sh -c helm ls -A\n");
    }

    #[tokio::test]
    async fn cancelled_token_fails_the_command() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let cli = DockerCli::with_binary("sleep", cancel);

        let result = cli.invoke(&strings(&["5"]), None, true).await;

        assert_eq!(result.error().unwrap().message, "cancelled");
    }

    #[tokio::test]
    async fn lifecycle_commands_ignore_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let cli = DockerCli::with_binary("true", cancel);

        assert!(cli.remove_container("flux-drift-x-k3s").await.is_ok());
    }
}
