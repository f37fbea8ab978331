//! flux-drift CLI
//!
//! Spins up an ephemeral k3s cluster, bootstraps Flux and prints drift diffs.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use flux_drift::{
    ClusterBootstrapper, DockerCli, RunConfig, RunOrchestrator, SecretsManager, ToolFacade,
    Validate,
};

#[derive(Debug, Parser)]
#[command(name = "flux-drift", version, about)]
struct Args {
    /// TOML configuration file; built-in defaults when omitted.
    #[arg(short, long, env = "FLUX_DRIFT_CONFIG")]
    config: Option<PathBuf>,

    /// Exit non-zero when any status check or diff failed.
    #[arg(long)]
    strict: bool,

    /// Container CLI used to run the sandbox.
    #[arg(long, default_value = "docker")]
    docker: String,

    /// Write the run report as JSON to this path.
    #[arg(long)]
    report: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    // Logs go to stderr; stdout carries command output only.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();
    std::process::exit(run(args).await);
}

async fn run(args: Args) -> i32 {
    let config = match RunConfig::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("flux-drift: {}", e);
            return 2;
        }
    };

    let mut secrets = SecretsManager::new();
    let config = config.resolve_token(&mut secrets);

    match config.validate().into_result() {
        Ok(warnings) => {
            for warning in warnings {
                tracing::warn!("{}", warning);
            }
        }
        Err(e) => {
            eprintln!("flux-drift: {}", e);
            return 2;
        }
    }
    let strict = args.strict || config.fail_on_soft_errors;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cancelling run");
            on_interrupt.cancel();
        }
    });

    let secrets = Arc::new(secrets);
    let docker = Arc::new(DockerCli::with_binary(&args.docker, cancel.clone()));
    let provider = Arc::new(ClusterBootstrapper::new(docker.clone(), secrets.clone()));
    let tools = ToolFacade::with_secrets(docker, secrets);
    let orchestrator = RunOrchestrator::new(provider, tools, config);

    tracing::info!(
        repository = %format!(
            "{}/{}",
            orchestrator.config().bootstrap.owner,
            orchestrator.config().bootstrap.repository
        ),
        strict,
        "starting run"
    );
    let outcome = orchestrator.run(&cancel).await;

    println!("\n{}", "=".repeat(60));
    print!("{}", outcome.report.summary());
    println!("{}", "=".repeat(60));

    if let Some(path) = &args.report {
        match serde_json::to_string_pretty(&outcome.report) {
            Ok(json) => {
                if let Err(e) = std::fs::write(path, json) {
                    tracing::warn!(path = ?path, error = %e, "failed to write report");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to serialize report"),
        }
    }

    if let Some(e) = &outcome.error {
        eprintln!("flux-drift: {}", e);
    }
    outcome.exit_code(strict)
}
