//! Cluster provisioning and rollback against a recording engine.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use common::{fail, FakeEngine};
use flux_drift::{
    ClusterBootstrapper, ClusterProvider, CommandResult, Error, RetryPolicy, RunConfig,
    SecretsManager,
};

fn config(checkout: &TempDir) -> RunConfig {
    let mut config = RunConfig::default();
    config.repository.local_path = Some(checkout.path().to_path_buf());
    config.cluster.credential_wait = RetryPolicy::new(3, Duration::from_secs(1));
    config
}

fn bootstrapper(engine: &Arc<FakeEngine>) -> ClusterBootstrapper<FakeEngine> {
    ClusterBootstrapper::new(engine.clone(), Arc::new(SecretsManager::new()))
}

fn run_id(engine: &FakeEngine) -> String {
    engine.ops()[0]
        .strip_prefix("network create ")
        .unwrap()
        .to_string()
}

#[tokio::test(start_paused = true)]
async fn provisions_node_then_toolchain() {
    let checkout = TempDir::new().unwrap();
    let engine = FakeEngine::new();

    let sandbox = bootstrapper(&engine)
        .provision(&config(&checkout), &CancellationToken::new())
        .await
        .unwrap();

    let id = run_id(&engine);
    assert!(id.starts_with("flux-drift-"));
    assert_eq!(sandbox.run_id(), id);
    assert_eq!(
        engine.ops(),
        vec![
            format!("network create {}", id),
            "volume create k3s_config".to_string(),
            format!("run {}-k3s", id),
            "build flux-drift/toolchain:latest".to_string(),
            format!("run {}-toolchain", id),
        ]
    );

    assert_eq!(sandbox.toolchain().container(), format!("{}-toolchain", id));
    assert_eq!(sandbox.toolchain().user(), Some("root"));
    assert_eq!(sandbox.toolchain().workdir(), Some("/tmp"));
    assert_eq!(sandbox.cache_volume(), Some("k3s_config"));
    assert_eq!(sandbox.repo_root(), "/src");
    assert_eq!(
        sandbox.checkout_path(),
        Some(checkout.path().canonicalize().unwrap().as_path())
    );
}

#[tokio::test(start_paused = true)]
async fn credentials_are_copied_and_pointed_at_the_alias() {
    let checkout = TempDir::new().unwrap();
    let engine = FakeEngine::new();

    bootstrapper(&engine)
        .provision(&config(&checkout), &CancellationToken::new())
        .await
        .unwrap();

    let id = run_id(&engine);
    let commands = engine.runner.commands();
    assert_eq!(
        commands[0],
        format!(
            "grep -qx {} /cache/k3s/run-id && test -s /cache/k3s/k3s.yaml",
            id
        )
    );
    let install = &commands[1];
    assert!(install.contains("cp /cache/k3s/k3s.yaml /.kube/config"));
    assert!(install.contains("https://k3s:6443"));
    assert!(install.ends_with("chown 1001:0 /.kube/config"));

    let calls = engine.runner.calls();
    assert!(calls.iter().all(|c| c.container.ends_with("-toolchain")));
    assert!(calls.iter().all(|c| c.pipeline == ["credentials"]));
}

#[tokio::test(start_paused = true)]
async fn kubeconfig_from_an_earlier_run_is_not_copied() {
    let checkout = TempDir::new().unwrap();
    let engine = FakeEngine::new();
    // The volume still holds k3s.yaml, but the stamp names another run.
    engine.runner.respond_always("grep -qx", fail("", "", 1));

    let err = bootstrapper(&engine)
        .provision(&config(&checkout), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Provisioning { ref step, .. } if step == "credentials"));
    assert_eq!(engine.runner.count("cp /cache/k3s/k3s.yaml"), 0);
}

#[tokio::test(start_paused = true)]
async fn node_that_fails_to_start_is_still_removed() {
    let checkout = TempDir::new().unwrap();
    let engine = FakeEngine::new();
    engine.fail_on("run flux-drift-");

    let err = bootstrapper(&engine)
        .provision(&config(&checkout), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Provisioning { ref step, .. } if step == "node-service"));
    let id = run_id(&engine);
    let ops = engine.ops();
    assert_eq!(
        &ops[ops.len() - 2..],
        [format!("rm {}-k3s", id), format!("network rm {}", id)]
    );
}

#[tokio::test(start_paused = true)]
async fn waits_for_node_to_write_kubeconfig() {
    let checkout = TempDir::new().unwrap();
    let engine = FakeEngine::new();
    engine.runner.respond(
        "test -s",
        vec![
            CommandResult::failed("", flux_drift::CommandError::new("", Some(1))),
            CommandResult::success(""),
        ],
    );
    let started = tokio::time::Instant::now();

    bootstrapper(&engine)
        .provision(&config(&checkout), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(engine.runner.count("test -s"), 2);
    assert_eq!(started.elapsed(), Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn missing_kubeconfig_fails_and_rolls_back() {
    let checkout = TempDir::new().unwrap();
    let engine = FakeEngine::new();
    engine.runner.respond_always("test -s", fail("", "", 1));

    let err = bootstrapper(&engine)
        .provision(&config(&checkout), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Provisioning { ref step, .. } if step == "credentials"));
    assert_eq!(engine.runner.count("test -s"), 3);

    let id = run_id(&engine);
    let ops = engine.ops();
    assert_eq!(
        &ops[ops.len() - 3..],
        [
            format!("rm {}-toolchain", id),
            format!("rm {}-k3s", id),
            format!("network rm {}", id),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn failed_image_build_releases_node_and_network() {
    let checkout = TempDir::new().unwrap();
    let engine = FakeEngine::new();
    engine.fail_on("build");

    let err = bootstrapper(&engine)
        .provision(&config(&checkout), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Provisioning { ref step, .. } if step == "toolchain-image"));
    let id = run_id(&engine);
    let ops = engine.ops();
    assert_eq!(ops[ops.len() - 2], format!("rm {}-k3s", id));
    assert_eq!(ops[ops.len() - 1], format!("network rm {}", id));
    assert!(!ops.iter().any(|op| op.contains("toolchain") && op.starts_with("run")));
    assert!(engine.runner.commands().is_empty());
}

#[tokio::test(start_paused = true)]
async fn network_failure_leaves_nothing_to_release() {
    let checkout = TempDir::new().unwrap();
    let engine = FakeEngine::new();
    engine.fail_on("network create");

    let err = bootstrapper(&engine)
        .provision(&config(&checkout), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Provisioning { ref step, .. } if step == "network"));
    assert_eq!(engine.ops().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn cancellation_aborts_provisioning() {
    let checkout = TempDir::new().unwrap();
    let engine = FakeEngine::new();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = bootstrapper(&engine)
        .provision(&config(&checkout), &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Cancelled));
    let id = run_id(&engine);
    assert_eq!(engine.ops().last(), Some(&format!("network rm {}", id)));
    assert!(!engine.ops().iter().any(|op| op.starts_with("run")));
}

#[tokio::test(start_paused = true)]
async fn teardown_keeps_the_cache_volume() {
    let checkout = TempDir::new().unwrap();
    let engine = FakeEngine::new();
    let provider = bootstrapper(&engine);

    let sandbox = provider
        .provision(&config(&checkout), &CancellationToken::new())
        .await
        .unwrap();
    let id = sandbox.run_id().to_string();
    provider.teardown(sandbox).await;

    let ops = engine.ops();
    assert_eq!(
        &ops[5..],
        [
            format!("rm {}-toolchain", id),
            format!("rm {}-k3s", id),
            format!("network rm {}", id),
        ]
    );
    assert!(!ops.iter().any(|op| op.starts_with("volume rm")));
}
