//! Node readiness polling.
//!
//! k3s starts asynchronously and exposes no readiness event to the toolchain,
//! so the node listing is polled under a bounded retry with a fixed delay.

use tokio_util::sync::CancellationToken;

use crate::config::RetryPolicy;
use crate::environment::Environment;
use crate::error::{Error, Result};
use crate::runner::ProcessRunner;
use crate::tools::ToolFacade;

/// STATUS value of a healthy node in `kubectl get nodes` output.
pub const READY_MARKER: &str = "Ready";

/// Returns true if any listed node reports the ready status.
///
/// Matches whole whitespace-separated tokens, so `NotReady` and
/// `Ready,SchedulingDisabled` do not count.
pub fn is_ready(node_listing: &str) -> bool {
    node_listing
        .lines()
        .any(|line| line.split_whitespace().any(|token| token == READY_MARKER))
}

/// Waits until the node reports ready.
///
/// Sleeps `policy.delay()` before each of at most `policy.max_attempts`
/// probes and returns the number of the probe that saw the node ready.
pub async fn wait_until_ready<R: ProcessRunner + ?Sized>(
    tools: &ToolFacade<R>,
    env: &Environment,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<u32> {
    for attempt in 1..=policy.max_attempts {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep(policy.delay()) => {}
        }

        let result = tools.kubectl(env, "get nodes -o wide").await;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        match result.error() {
            Some(err) => {
                tracing::warn!(attempt, error = %err, "could not fetch nodes");
            }
            None if is_ready(&result.stdout) => {
                tracing::info!(attempt, "cluster node is ready");
                return Ok(attempt);
            }
            None => {
                tracing::info!(attempt, nodes = %result.stdout.trim(), "waiting for k8s to start");
            }
        }
    }

    Err(Error::ReadinessTimeout {
        attempts: policy.max_attempts,
    })
}
