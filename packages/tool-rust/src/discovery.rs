//! Peer discovery and the state preconditions shared by mutating commands.

use std::sync::Arc;

use dynconf_core::{join_endpoints, Cluster, Endpoint, HostPort, LogicalServerState};
use futures_util::future::join_all;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::connectivity::{get_logical_server_state, get_runtime_cluster, is_activated};
use crate::context::OrchestrationContext;
use crate::error::{ToolError, ToolResult};
use crate::node_states::NodeStates;
use crate::poll::{poll_until, PollOutcome};

/// Reads the seed's runtime cluster and the state of every node in it.
///
/// Only the seed is required to answer; other nodes that fail are
/// reported as [`LogicalServerState::Unreachable`].
///
/// # Errors
///
/// Fails when the seed's runtime cluster cannot be read.
pub async fn find_runtime_peers_status(ctx: &OrchestrationContext, seed: &HostPort) -> ToolResult<NodeStates> {
    let cluster = get_runtime_cluster(ctx, seed).await?;
    let endpoints = cluster.determine_endpoints(seed);
    info!("Connecting to: {}", join_endpoints(&endpoints));
    Ok(get_logical_server_states(ctx, &endpoints).await)
}

/// Online subset of [`find_runtime_peers_status`].
///
/// # Errors
///
/// Fails when the seed's runtime cluster cannot be read.
pub async fn find_online_runtime_peers(ctx: &OrchestrationContext, seed: &HostPort) -> ToolResult<NodeStates> {
    Ok(filter_online(&find_runtime_peers_status(ctx, seed).await?))
}

#[must_use]
pub fn filter_online(states: &NodeStates) -> NodeStates {
    states.online()
}

/// Fetches the state of every endpoint concurrently, in endpoint order.
pub async fn get_logical_server_states(ctx: &OrchestrationContext, endpoints: &[Endpoint]) -> NodeStates {
    let semaphore = Arc::new(Semaphore::new(ctx.config().concurrency_for(endpoints.len())));
    let handles: Vec<_> = endpoints
        .iter()
        .cloned()
        .map(|endpoint| {
            let ctx = ctx.clone();
            let semaphore = Arc::clone(&semaphore);
            tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let state = get_logical_server_state(&ctx, &endpoint.address).await;
                (endpoint, state)
            })
        })
        .collect();

    let mut states = NodeStates::new();
    for (endpoint, joined) in endpoints.iter().zip(join_all(handles).await) {
        let state = match joined {
            Ok((_, Ok(state))) => state,
            Ok((_, Err(_))) => {
                warn!(" - {endpoint} is not reachable");
                LogicalServerState::Unreachable
            }
            Err(e) => {
                warn!(" - {endpoint} state lookup aborted: {e}");
                LogicalServerState::Unreachable
            }
        };
        states.insert(endpoint.clone(), state);
    }
    states
}

/// Whether the answering nodes are activated.
///
/// # Errors
///
/// Fails when no node answers, or when activated nodes are mixed with
/// nodes that are still being configured or repaired.
pub async fn are_all_nodes_activated(ctx: &OrchestrationContext, states: &NodeStates) -> ToolResult<bool> {
    let mut activated = Vec::new();
    let mut unconfigured = Vec::new();
    for endpoint in states.online().endpoints() {
        if is_activated(ctx, &endpoint.address).await? {
            activated.push(endpoint.clone());
        } else {
            unconfigured.push(endpoint.clone());
        }
    }
    match (activated.is_empty(), unconfigured.is_empty()) {
        (true, true) => Err(ToolError::validation("Cluster is empty or offline")),
        (false, true) => Ok(true),
        (true, false) => Ok(false),
        (false, false) => Err(ToolError::validation(format!(
            "Detected a mix of activated and unconfigured nodes (or being repaired). Activated: [{}], Unconfigured: [{}]",
            join_endpoints(&activated),
            join_endpoints(&unconfigured),
        ))),
    }
}

/// Waits for starting or synchronizing nodes, then requires every online
/// node to be either active or passive.
///
/// # Errors
///
/// Returns a validation error naming the first node in another state.
pub async fn ensure_nodes_are_either_active_or_passive(ctx: &OrchestrationContext, states: &NodeStates) -> ToolResult<()> {
    for (endpoint, mut state) in states.online().iter() {
        if state.is_starting() || state.is_synchronizing() {
            info!("Waiting for {endpoint} to leave state {state}");
            let outcome = poll_until(ctx.config().poll_interval(), Some(ctx.config().restart_wait()), || async move {
                match get_logical_server_state(ctx, &endpoint.address).await {
                    Ok(s) if s.is_starting() || s.is_synchronizing() => None,
                    Ok(s) => Some(s),
                    Err(_) => Some(LogicalServerState::Unreachable),
                }
            })
            .await;
            if let PollOutcome::Settled(settled) = outcome {
                state = settled;
            }
        }
        if !state.is_active() && !state.is_passive() {
            return Err(ToolError::validation(format!(
                "Unable to update node: {endpoint} that is currently in state: {state}. \
                 Please ensure all online nodes are either ACTIVE or PASSIVE before sending any update."
            )));
        }
    }
    Ok(())
}

/// Requires exactly one active node per stripe of `cluster`.
///
/// # Errors
///
/// Returns a validation error when some stripe has no reachable active, or
/// more than one.
pub fn ensure_actives_are_all_online(cluster: &Cluster, states: &NodeStates) -> ToolResult<()> {
    let actives = states.filter(|_, s| s.is_active());
    if actives.is_empty() {
        return Err(ToolError::validation(
            "Expected 1 active per stripe, but found no online node.",
        ));
    }
    let one_per_stripe = cluster
        .stripes
        .iter()
        .all(|stripe| actives.endpoints().filter(|e| stripe.contains(&e.node_uid)).count() == 1);
    if !one_per_stripe || actives.len() != cluster.stripe_count() {
        return Err(ToolError::validation(format!(
            "Expected 1 active per stripe, but only these nodes are active: {}",
            join_endpoints(actives.endpoints()),
        )));
    }
    Ok(())
}

/// Requires every non-active node of `cluster` to be reachable and passive.
///
/// # Errors
///
/// Returns a validation error listing the nodes that are not passive.
pub fn ensure_passives_are_all_online(cluster: &Cluster, states: &NodeStates) -> ToolResult<()> {
    let expected: Vec<Endpoint> = cluster
        .nodes()
        .filter(|node| !states.get(&node.uid).is_some_and(LogicalServerState::is_active))
        .map(|node| {
            states
                .endpoint(&node.uid)
                .cloned()
                .unwrap_or_else(|| node.internal_endpoint())
        })
        .collect();
    let failed: Vec<&Endpoint> = expected
        .iter()
        .filter(|e| !states.get(&e.node_uid).is_some_and(LogicalServerState::is_passive))
        .collect();
    if failed.is_empty() {
        return Ok(());
    }
    Err(ToolError::validation(format!(
        "Expected these nodes to be in PASSIVE state: {}, but nodes: {} are not",
        join_endpoints(&expected),
        join_endpoints(failed),
    )))
}
