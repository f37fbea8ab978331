//! flux-drift - ephemeral k3s sandbox for Flux bootstrap and drift checks
//!
//! This library provisions a throwaway single-node cluster next to a toolchain
//! container, bootstraps Flux against a Git repository, collects cluster
//! status and diffs the repository's kustomizations against what is deployed.

pub mod config;
pub mod environment;
pub mod error;
pub mod orchestrator;
pub mod readiness;
pub mod runner;
pub mod sandbox;
pub mod secrets;
pub mod tools;

pub use config::{
    BootstrapSpec, ClusterSpec, DiffTarget, RepositorySource, RetryPolicy, RunConfig,
    StatusCheck, ToolchainImage, Validate, ValidationResult,
};
pub use environment::Environment;
pub use error::{Error, Result};
pub use orchestrator::{
    RunOrchestrator, RunOutcome, RunReport, RunState, StepFailure, StepKind, StepRecord,
};
pub use readiness::{is_ready, wait_until_ready};
pub use runner::{CommandError, CommandResult, DockerCli, Outcome, ProcessRunner};
pub use sandbox::{ClusterBootstrapper, ClusterProvider, ClusterSandbox, ContainerEngine};
pub use secrets::{SecretError, SecretRef, SecretSource, SecretsManager};
pub use tools::{Tool, ToolFacade};
