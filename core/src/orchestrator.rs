//! Run orchestration.
//!
//! Drives one sandbox through provisioning, readiness, Flux bootstrap, the
//! status battery and the drift diffs, then tears it down. Everything up to
//! and including bootstrap is fatal; later steps are recorded and skipped
//! past.

use std::fmt::Write as _;
use std::io::Write as _;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::RunConfig;
use crate::environment::Environment;
use crate::error::{Error, Result};
use crate::readiness::wait_until_ready;
use crate::runner::{CommandError, CommandResult, Outcome, ProcessRunner};
use crate::sandbox::{ClusterProvider, ClusterSandbox};
use crate::tools::{Tool, ToolFacade};

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Init,
    Provisioned,
    Ready,
    Bootstrapped,
    StatusChecked,
    Diffed,
    Done,
    Failed,
}

impl RunState {
    /// Returns true once the run can make no further progress.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Done | RunState::Failed)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunState::Init => "init",
            RunState::Provisioned => "provisioned",
            RunState::Ready => "ready",
            RunState::Bootstrapped => "bootstrapped",
            RunState::StatusChecked => "status_checked",
            RunState::Diffed => "diffed",
            RunState::Done => "done",
            RunState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Phase a step belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    Provision,
    Readiness,
    Bootstrap,
    Status,
    Diff,
}

/// Outcome of one step.
#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    /// Step name, e.g. `helm-list` or `diff/apps`.
    pub name: String,
    /// Phase of the run.
    pub kind: StepKind,
    /// Whether the step succeeded.
    pub succeeded: bool,
    /// Exit code of the failed command, when there was one.
    pub exit_code: Option<i32>,
    /// Failure cause.
    pub message: Option<String>,
    /// Wall-clock time spent in the step.
    pub duration_ms: u64,
}

/// A failed step as surfaced in the report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepFailure {
    pub step: String,
    pub message: String,
    pub exit_code: Option<i32>,
}

/// Summary of a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Run identifier, once a sandbox existed.
    pub run_id: Option<String>,
    /// Final state.
    pub state: RunState,
    /// Every step attempted, in order.
    pub steps: Vec<StepRecord>,
    /// Post-bootstrap failures the run continued past.
    pub soft_failures: Vec<StepFailure>,
    /// The failure that ended the run early.
    pub fatal: Option<StepFailure>,
    /// Total run time.
    pub duration_ms: u64,
}

impl RunReport {
    fn new() -> Self {
        Self {
            run_id: None,
            state: RunState::Init,
            steps: Vec::new(),
            soft_failures: Vec::new(),
            fatal: None,
            duration_ms: 0,
        }
    }

    /// Returns true if the run reached `Done`, and under `strict` also had no
    /// soft failures.
    pub fn succeeded(&self, strict: bool) -> bool {
        self.state == RunState::Done && (!strict || self.soft_failures.is_empty())
    }

    /// Process exit code for this report.
    pub fn exit_code(&self, strict: bool) -> i32 {
        if self.succeeded(strict) {
            0
        } else {
            1
        }
    }

    /// Steps of one phase.
    pub fn steps_of(&self, kind: StepKind) -> impl Iterator<Item = &StepRecord> {
        self.steps.iter().filter(move |s| s.kind == kind)
    }

    /// Human-readable summary.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "run {}: {} in {:.1}s",
            self.run_id.as_deref().unwrap_or("-"),
            self.state,
            self.duration_ms as f64 / 1000.0
        );
        for step in &self.steps {
            if step.succeeded {
                let _ = writeln!(out, "  ok    {}", step.name);
                continue;
            }
            let _ = write!(out, "  FAIL  {}", step.name);
            if let Some(code) = step.exit_code {
                let _ = write!(out, " (exit {})", code);
            }
            if let Some(message) = &step.message {
                let _ = write!(out, ": {}", message);
            }
            out.push('\n');
        }
        if !self.soft_failures.is_empty() {
            let _ = writeln!(out, "{} soft failure(s)", self.soft_failures.len());
        }
        out
    }

    fn passed(&mut self, name: &str, kind: StepKind, started: Instant) {
        self.steps.push(StepRecord {
            name: name.to_string(),
            kind,
            succeeded: true,
            exit_code: None,
            message: None,
            duration_ms: elapsed_ms(started),
        });
    }

    fn failed(&mut self, failure: StepFailure, kind: StepKind, started: Instant) {
        self.steps.push(StepRecord {
            name: failure.step.clone(),
            kind,
            succeeded: false,
            exit_code: failure.exit_code,
            message: Some(failure.message.clone()),
            duration_ms: elapsed_ms(started),
        });
        match kind {
            StepKind::Status | StepKind::Diff => self.soft_failures.push(failure),
            _ => self.fatal = Some(failure),
        }
    }
}

/// A report plus the fatal error that ended the run, if any.
#[derive(Debug)]
pub struct RunOutcome {
    pub report: RunReport,
    pub error: Option<Error>,
}

impl RunOutcome {
    /// Process exit code for this outcome.
    pub fn exit_code(&self, strict: bool) -> i32 {
        if self.error.is_some() {
            1
        } else {
            self.report.exit_code(strict)
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn ensure_running(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}

/// Sequences one sandbox run.
pub struct RunOrchestrator<P: ClusterProvider + ?Sized, R: ProcessRunner + ?Sized> {
    provider: Arc<P>,
    tools: ToolFacade<R>,
    config: RunConfig,
    echo: bool,
}

impl<P: ClusterProvider + ?Sized, R: ProcessRunner + ?Sized> RunOrchestrator<P, R> {
    /// Creates an orchestrator that echoes step output to stdout.
    pub fn new(provider: Arc<P>, tools: ToolFacade<R>, config: RunConfig) -> Self {
        Self {
            provider,
            tools,
            config,
            echo: true,
        }
    }

    /// Enables or disables echoing step output to stdout.
    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    /// The configuration this orchestrator runs.
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Runs every step once and tears the sandbox down.
    ///
    /// Never panics on step failure: fatal errors come back in
    /// [`RunOutcome::error`], soft failures in the report.
    pub async fn run(&self, cancel: &CancellationToken) -> RunOutcome {
        let started = Instant::now();
        let mut report = RunReport::new();

        let error = self.provision_and_drive(cancel, &mut report).await.err();
        match &error {
            Some(e) => {
                report.state = RunState::Failed;
                if report.fatal.is_none() {
                    report.fatal = Some(self.fatal_failure("run", e));
                }
                tracing::error!(error = %self.tools.redact(&e.to_string()), "run failed");
            }
            None => {
                report.state = RunState::Done;
                tracing::info!(
                    soft_failures = report.soft_failures.len(),
                    "run complete"
                );
            }
        }
        report.duration_ms = elapsed_ms(started);

        RunOutcome { report, error }
    }

    async fn provision_and_drive(
        &self,
        cancel: &CancellationToken,
        report: &mut RunReport,
    ) -> Result<()> {
        let started = Instant::now();
        let sandbox = match self
            .provider
            .provision(&self.config, cancel)
            .instrument(tracing::info_span!("step", step = "provision"))
            .await
        {
            Ok(sandbox) => sandbox,
            Err(e) => {
                let failure = self.fatal_failure("provision", &e);
                report.failed(failure, StepKind::Provision, started);
                return Err(e);
            }
        };
        report.run_id = Some(sandbox.run_id().to_string());
        report.passed("provision", StepKind::Provision, started);
        report.state = RunState::Provisioned;

        let result = self.drive(&sandbox, report).await;
        self.provider.teardown(sandbox).await;
        result
    }

    async fn drive(&self, sandbox: &ClusterSandbox, report: &mut RunReport) -> Result<()> {
        let env = sandbox.toolchain();
        let cancel = sandbox.cancel_token();

        let started = Instant::now();
        let readiness = wait_until_ready(
            &self.tools,
            &env.with_pipeline("readiness"),
            &self.config.readiness,
            cancel,
        )
        .instrument(tracing::info_span!("step", step = "readiness"))
        .await;
        if let Err(e) = readiness {
            let failure = self.fatal_failure("readiness", &e);
            report.failed(failure, StepKind::Readiness, started);
            return Err(e);
        }
        report.passed("readiness", StepKind::Readiness, started);
        report.state = RunState::Ready;

        let started = Instant::now();
        let result = self
            .tools
            .flux(&env.with_pipeline("bootstrap"), &self.config.bootstrap.command())
            .instrument(tracing::info_span!("step", step = "bootstrap"))
            .await;
        self.echo("bootstrap", &result);
        if cancel.is_cancelled() {
            let e = Error::Cancelled;
            let failure = self.fatal_failure("bootstrap", &e);
            report.failed(failure, StepKind::Bootstrap, started);
            return Err(e);
        }
        if let Outcome::Failed(err) = result.outcome {
            let err = CommandError::new(self.tools.redact(&err.message), err.exit_code);
            let e = Error::Bootstrap(err);
            let failure = self.fatal_failure("bootstrap", &e);
            report.failed(failure, StepKind::Bootstrap, started);
            return Err(e);
        }
        report.passed("bootstrap", StepKind::Bootstrap, started);
        report.state = RunState::Bootstrapped;

        let status_env = env.with_pipeline("status");
        // A step interrupted by cancellation still returns a result, so the
        // token is checked after each one.
        for check in &self.config.status_checks {
            self.soft_step(
                report,
                &check.name,
                StepKind::Status,
                &status_env,
                check.tool,
                &check.command,
            )
            .await;
            ensure_running(cancel)?;
        }
        report.state = RunState::StatusChecked;

        let diff_env = env.with_pipeline("diff");
        for diff in &self.config.diffs {
            let name = format!("diff/{}", diff.kustomization);
            let args = diff.command(sandbox.repo_root());
            self.soft_step(report, &name, StepKind::Diff, &diff_env, Tool::Flux, &args)
                .await;
            ensure_running(cancel)?;
        }
        report.state = RunState::Diffed;

        Ok(())
    }

    async fn soft_step(
        &self,
        report: &mut RunReport,
        name: &str,
        kind: StepKind,
        env: &Environment,
        tool: Tool,
        args: &str,
    ) {
        let started = Instant::now();
        let result = self
            .tools
            .tool(&env.with_pipeline(name), tool, args)
            .instrument(tracing::info_span!("step", step = %name))
            .await;
        // Diff output is the point of the run, so it is shown even on failure.
        self.echo(name, &result);

        match result.error() {
            None => report.passed(name, kind, started),
            Some(err) => {
                let message = self.tools.redact(&err.message);
                tracing::warn!(
                    step = %name,
                    exit_code = ?err.exit_code,
                    error = %message,
                    "step failed, continuing"
                );
                report.failed(
                    StepFailure {
                        step: name.to_string(),
                        message,
                        exit_code: err.exit_code,
                    },
                    kind,
                    started,
                );
            }
        }
    }

    fn fatal_failure(&self, step: &str, error: &Error) -> StepFailure {
        let exit_code = match error {
            Error::Bootstrap(err) | Error::Command(err) => err.exit_code,
            _ => None,
        };
        StepFailure {
            step: step.to_string(),
            message: self.tools.redact(&error.to_string()),
            exit_code,
        }
    }

    fn echo(&self, step: &str, result: &CommandResult) {
        if !self.echo || result.stdout.is_empty() {
            return;
        }
        let text = self.tools.redact(&result.stdout);
        let mut out = std::io::stdout().lock();
        let _ = writeln!(out, "==> {}", step);
        let _ = out.write_all(text.as_bytes());
        if !text.ends_with('\n') {
            let _ = writeln!(out);
        }
    }
}
