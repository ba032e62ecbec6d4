//! Single-RPC helpers over short-lived diagnostic connections.
//!
//! Every function opens a connection through the context's
//! [`DiagnosticServiceProvider`](crate::traits::DiagnosticServiceProvider),
//! performs one call and drops the connection.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dynconf_core::{
    Cluster, Endpoint, HostPort, LogicalServerState, NodeContext, NomadChange, NomadChangeInfo,
};
use tracing::{debug, trace};

use crate::context::OrchestrationContext;
use crate::error::{ToolError, ToolResult};
use crate::failures::FailureRecorder;
use crate::node_states::NodeStates;
use crate::traits::DiagnosticService;

/// Bounds `call` by `timeout`. Expiry is reported like any other transport
/// failure.
pub(crate) async fn within<T>(
    timeout: Duration,
    what: &str,
    call: impl Future<Output = anyhow::Result<T>>,
) -> anyhow::Result<T> {
    tokio::time::timeout(timeout, call)
        .await
        .unwrap_or_else(|_| Err(anyhow::anyhow!("{what} timed out after {}ms", timeout.as_millis())))
}

async fn connect(ctx: &OrchestrationContext, address: &HostPort) -> ToolResult<Arc<dyn DiagnosticService>> {
    within(ctx.config().connection_timeout(), "connection", ctx.diagnostics().fetch(address))
        .await
        .map_err(|e| ToolError::connectivity(address, e))
}

/// Opens a connection to `address` and runs one request on it.
async fn request<T, F, Fut>(ctx: &OrchestrationContext, address: &HostPort, call: F) -> ToolResult<T>
where
    F: FnOnce(Arc<dyn DiagnosticService>) -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let service = connect(ctx, address).await?;
    within(ctx.config().request_timeout(), "request", call(service))
        .await
        .map_err(|e| ToolError::connectivity(address, e))
}

pub async fn get_upcoming_node_context(ctx: &OrchestrationContext, address: &HostPort) -> ToolResult<NodeContext> {
    request(ctx, address, |s| async move { s.upcoming_node_context().await }).await
}

pub async fn get_runtime_node_context(ctx: &OrchestrationContext, address: &HostPort) -> ToolResult<NodeContext> {
    request(ctx, address, |s| async move { s.runtime_node_context().await }).await
}

pub async fn get_upcoming_cluster(ctx: &OrchestrationContext, address: &HostPort) -> ToolResult<Cluster> {
    Ok(get_upcoming_node_context(ctx, address).await?.cluster)
}

pub async fn get_runtime_cluster(ctx: &OrchestrationContext, address: &HostPort) -> ToolResult<Cluster> {
    Ok(get_runtime_node_context(ctx, address).await?.cluster)
}

/// Endpoint of the node at `address`, resolved in the address group the
/// operator used to reach it.
pub async fn get_endpoint(ctx: &OrchestrationContext, address: &HostPort) -> ToolResult<Endpoint> {
    let context = get_runtime_node_context(ctx, address).await?;
    context
        .node()
        .map(|node| node.determine_endpoint(address))
        .ok_or_else(|| ToolError::validation(format!("Node at {address} is not part of its own cluster")))
}

pub async fn get_logical_server_state(ctx: &OrchestrationContext, address: &HostPort) -> ToolResult<LogicalServerState> {
    request(ctx, address, |s| async move { s.logical_server_state().await }).await
}

pub async fn is_activated(ctx: &OrchestrationContext, address: &HostPort) -> ToolResult<bool> {
    request(ctx, address, |s| async move { s.is_activated().await }).await
}

pub async fn must_be_restarted(ctx: &OrchestrationContext, address: &HostPort) -> ToolResult<bool> {
    request(ctx, address, |s| async move { s.must_be_restarted().await }).await
}

pub async fn has_incomplete_change(ctx: &OrchestrationContext, address: &HostPort) -> ToolResult<bool> {
    request(ctx, address, |s| async move { s.has_incomplete_change().await }).await
}

pub async fn is_scaling_denied(ctx: &OrchestrationContext, address: &HostPort) -> ToolResult<bool> {
    request(ctx, address, |s| async move { s.is_scaling_denied().await }).await
}

pub async fn get_change_history(ctx: &OrchestrationContext, address: &HostPort) -> ToolResult<Vec<NomadChangeInfo>> {
    request(ctx, address, |s| async move { s.change_history().await }).await
}

pub async fn get_license_content(ctx: &OrchestrationContext, address: &HostPort) -> ToolResult<Option<String>> {
    request(ctx, address, |s| async move { s.license_content().await }).await
}

/// Pushes `cluster` as the upcoming cluster of each endpoint, in order.
pub async fn set_upcoming_cluster(ctx: &OrchestrationContext, endpoints: &[Endpoint], cluster: &Cluster) -> ToolResult<()> {
    for endpoint in endpoints {
        trace!("Setting upcoming cluster on {endpoint}");
        request(ctx, &endpoint.address, |s| async move { s.set_upcoming_cluster(cluster).await }).await?;
    }
    Ok(())
}

pub async fn reset(ctx: &OrchestrationContext, endpoint: &Endpoint) -> ToolResult<()> {
    debug!("Resetting {endpoint}");
    request(ctx, &endpoint.address, |s| async move { s.reset().await }).await
}

/// Resets the node back to diagnostic mode, then asks it to stop.
pub async fn reset_and_stop(ctx: &OrchestrationContext, endpoint: &Endpoint, delay: Duration) -> ToolResult<()> {
    reset(ctx, endpoint).await?;
    debug!("Stopping {endpoint}");
    request(ctx, &endpoint.address, |s| async move { s.stop(delay).await }).await
}

/// Installs `license` on each endpoint.
pub async fn upgrade_license(ctx: &OrchestrationContext, endpoints: &[Endpoint], license: &str) -> ToolResult<()> {
    for endpoint in endpoints {
        debug!("Installing license on {endpoint}");
        request(ctx, &endpoint.address, |s| async move { s.upgrade_license(license).await }).await?;
    }
    Ok(())
}

/// Activates the configuration log of each endpoint with `cluster`.
pub async fn activate_nomad_system(
    ctx: &OrchestrationContext,
    endpoints: &[Endpoint],
    cluster: &Cluster,
    license: Option<&str>,
) -> ToolResult<()> {
    for endpoint in endpoints {
        debug!("Activating {endpoint}");
        request(ctx, &endpoint.address, |s| async move { s.activate(cluster, license).await }).await?;
    }
    Ok(())
}

/// Replays `history` on each endpoint so they share the destination's log.
pub async fn reset_and_sync(
    ctx: &OrchestrationContext,
    endpoints: &[Endpoint],
    history: &[NomadChangeInfo],
    cluster: &Cluster,
) -> ToolResult<()> {
    for endpoint in endpoints {
        debug!("Syncing {} change(s) to {endpoint}", history.len());
        request(ctx, &endpoint.address, |s| async move { s.reset_and_sync(history, cluster).await }).await?;
    }
    Ok(())
}

/// Submits `change` through the configuration log, wrapped with the held
/// lock token if any, and raises the aggregated failures.
pub async fn run_configuration_change(
    ctx: &OrchestrationContext,
    destination: &Cluster,
    nodes: &NodeStates,
    change: NomadChange,
) -> ToolResult<()> {
    let change = match ctx.lock_token() {
        Some(token) => change.lock_aware(token),
        None => change,
    };
    let failures = FailureRecorder::new();
    ctx.nomad()
        .run_configuration_change(destination, nodes, &change, &failures)
        .await;
    failures.reraise()
}

/// Finalizes the activation of `endpoints` through the configuration log.
pub async fn run_cluster_activation(ctx: &OrchestrationContext, endpoints: &[Endpoint], cluster: &Cluster) -> ToolResult<()> {
    let failures = FailureRecorder::new();
    ctx.nomad()
        .run_cluster_activation(endpoints, cluster, &failures)
        .await;
    failures.reraise()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ToolConfig;
    use crate::testing::{SimCluster, Stall};

    #[tokio::test]
    async fn license_is_installed_on_every_endpoint() {
        let sim = SimCluster::activated_one_stripe(&["a", "b"]);
        let ctx = sim.context();
        upgrade_license(&ctx, &sim.endpoints(), "renewed").await.unwrap();
        assert_eq!(get_license_content(&ctx, &sim.address("b")).await.unwrap().as_deref(), Some("renewed"));
        assert_eq!(sim.count("upgrade_license"), 2);
    }

    #[tokio::test]
    async fn unreachable_node_is_a_connectivity_error() {
        let sim = SimCluster::activated_one_stripe(&["a"]);
        sim.update("a", |n| n.reachable = false);
        let err = is_activated(&sim.context(), &sim.address("a")).await.unwrap_err();
        assert!(matches!(err, ToolError::Connectivity { ref address, .. } if *address == sim.address("a")));
        assert_eq!(err.exit_code(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_request_times_out() {
        let sim = SimCluster::activated_one_stripe(&["a"]);
        sim.update("a", |n| n.stall = Some(Stall::Request));
        let ctx = sim.context_with(ToolConfig {
            request_timeout_ms: 500,
            ..ToolConfig::default()
        });
        let err = is_activated(&ctx, &sim.address("a")).await.unwrap_err();
        assert_eq!(err.to_string(), "unable to reach a:9410: request timed out after 500ms");
        assert_eq!(sim.count("is_activated"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_connection_times_out() {
        let sim = SimCluster::activated_one_stripe(&["a", "b"]);
        sim.update("b", |n| n.stall = Some(Stall::Connect));
        let ctx = sim.context_with(ToolConfig {
            connection_timeout_ms: 250,
            ..ToolConfig::default()
        });
        let err = set_upcoming_cluster(&ctx, &sim.endpoints(), &sim.node("a").upcoming)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "unable to reach b:9410: connection timed out after 250ms");
        assert_eq!(sim.count("set_upcoming"), 1);
    }
}
