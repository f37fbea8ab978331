//! Scripted doubles shared by the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use flux_drift::sandbox::{ContainerSpec, ImageRecipe};
use flux_drift::tools::CACHE_MARKER_VAR;
use flux_drift::{
    ClusterProvider, ClusterSandbox, CommandError, CommandResult, ContainerEngine, Environment,
    Error, ProcessRunner, RunConfig,
};

pub const NODES_READY: &str = "NAME   STATUS   ROLES                  AGE   VERSION\n\
                               k3s    Ready    control-plane,master   20s   v1.27.3+k3s1\n";
pub const NODES_NOT_READY: &str = "NAME   STATUS     ROLES                  AGE   VERSION\n\
                                   k3s    NotReady   control-plane,master   2s    v1.27.3+k3s1\n";

/// A command seen by [`ScriptedRunner`].
#[derive(Debug, Clone)]
pub struct Call {
    pub command: String,
    pub container: String,
    pub pipeline: Vec<String>,
    pub user: Option<String>,
    pub workdir: Option<String>,
    pub marker: Option<String>,
}

struct Rule {
    pattern: String,
    responses: VecDeque<CommandResult>,
}

/// Runner answering commands by substring match.
///
/// Each rule replays its responses in order and repeats the last one. The
/// first matching rule wins; unmatched commands succeed with empty output.
#[derive(Default)]
pub struct ScriptedRunner {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<Call>>,
    interrupt: Mutex<Option<(String, CancellationToken)>>,
}

impl ScriptedRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn respond(&self, pattern: &str, responses: Vec<CommandResult>) {
        self.rules.lock().unwrap().push(Rule {
            pattern: pattern.to_string(),
            responses: responses.into(),
        });
    }

    pub fn respond_always(&self, pattern: &str, response: CommandResult) {
        self.respond(pattern, vec![response]);
    }

    /// Cancels `cancel` while running the first command matching `pattern`,
    /// which then fails the way an interrupted process does.
    pub fn cancel_during(&self, pattern: &str, cancel: &CancellationToken) {
        *self.interrupt.lock().unwrap() = Some((pattern.to_string(), cancel.clone()));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.command).collect()
    }

    pub fn count(&self, pattern: &str) -> usize {
        self.commands().iter().filter(|c| c.contains(pattern)).count()
    }
}

#[async_trait]
impl ProcessRunner for ScriptedRunner {
    async fn run(&self, env: &Environment, command: &str) -> CommandResult {
        self.calls.lock().unwrap().push(Call {
            command: command.to_string(),
            container: env.container().to_string(),
            pipeline: env.pipeline().into_iter().map(str::to_string).collect(),
            user: env.user().map(str::to_string),
            workdir: env.workdir().map(str::to_string),
            marker: env.env_var(CACHE_MARKER_VAR).map(str::to_string),
        });

        if let Some((pattern, cancel)) = self.interrupt.lock().unwrap().as_ref() {
            if command.contains(pattern.as_str()) && !cancel.is_cancelled() {
                cancel.cancel();
                return CommandResult::failed("", CommandError::new("cancelled", None));
            }
        }

        let mut rules = self.rules.lock().unwrap();
        match rules.iter_mut().find(|r| command.contains(&r.pattern)) {
            Some(rule) if rule.responses.len() > 1 => rule.responses.pop_front().unwrap(),
            Some(rule) => rule
                .responses
                .front()
                .cloned()
                .unwrap_or_else(|| CommandResult::success("")),
            None => CommandResult::success(""),
        }
    }
}

pub fn fail(stdout: &str, message: &str, exit_code: i32) -> CommandResult {
    CommandResult::failed(stdout, CommandError::new(message, Some(exit_code)))
}

/// Container engine recording lifecycle operations.
///
/// Commands run inside containers are forwarded to the inner runner.
pub struct FakeEngine {
    pub runner: Arc<ScriptedRunner>,
    ops: Mutex<Vec<String>>,
    fail_on: Mutex<Option<String>>,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            runner: ScriptedRunner::new(),
            ops: Mutex::new(Vec::new()),
            fail_on: Mutex::new(None),
        })
    }

    /// Makes every operation whose record starts with `prefix` fail.
    pub fn fail_on(&self, prefix: &str) {
        *self.fail_on.lock().unwrap() = Some(prefix.to_string());
    }

    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }

    fn record(&self, op: String) -> Result<(), CommandError> {
        let failing = self
            .fail_on
            .lock()
            .unwrap()
            .as_deref()
            .is_some_and(|prefix| op.starts_with(prefix));
        self.ops.lock().unwrap().push(op.clone());
        if failing {
            Err(CommandError::new(format!("{} refused", op), Some(125)))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ProcessRunner for FakeEngine {
    async fn run(&self, env: &Environment, command: &str) -> CommandResult {
        self.runner.run(env, command).await
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn create_network(&self, name: &str) -> Result<(), CommandError> {
        self.record(format!("network create {}", name))
    }

    async fn ensure_volume(&self, name: &str) -> Result<(), CommandError> {
        self.record(format!("volume create {}", name))
    }

    async fn build_image(&self, recipe: &ImageRecipe) -> Result<(), CommandError> {
        self.record(format!("build {}", recipe.tag))
    }

    async fn start_container(&self, spec: &ContainerSpec) -> Result<(), CommandError> {
        self.record(format!("run {}", spec.name))
    }

    async fn remove_container(&self, name: &str) -> Result<(), CommandError> {
        self.record(format!("rm {}", name))
    }

    async fn remove_network(&self, name: &str) -> Result<(), CommandError> {
        self.record(format!("network rm {}", name))
    }
}

/// Provider handing out a fixed sandbox without touching any engine.
#[derive(Default)]
pub struct FakeProvider {
    pub fail_provision: bool,
    provisioned: AtomicUsize,
    torn_down: AtomicUsize,
}

impl FakeProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail_provision: true,
            ..Default::default()
        })
    }

    pub fn provisioned(&self) -> usize {
        self.provisioned.load(Ordering::SeqCst)
    }

    pub fn torn_down(&self) -> usize {
        self.torn_down.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClusterProvider for FakeProvider {
    async fn provision(
        &self,
        _config: &RunConfig,
        cancel: &CancellationToken,
    ) -> flux_drift::Result<ClusterSandbox> {
        if self.fail_provision {
            return Err(Error::provisioning("node-service", "image pull failed"));
        }
        self.provisioned.fetch_add(1, Ordering::SeqCst);
        let toolchain = Environment::new("flux-drift-test-toolchain")
            .with_user("root")
            .with_workdir("/tmp");
        Ok(ClusterSandbox::new("flux-drift-test", toolchain, cancel.clone()))
    }

    async fn teardown(&self, _sandbox: ClusterSandbox) {
        self.torn_down.fetch_add(1, Ordering::SeqCst);
    }
}
