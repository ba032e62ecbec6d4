use std::time::Duration;

use async_trait::async_trait;
use dynconf_core::{Endpoint, HostPort, NomadChange, Uid};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{
    check_or_bypass, ensure_no_pending_restart, ensure_scaling_allowed, list, run_topology_change,
    warn_on_voter_parity, Destination, OperationType, TopologyChange, TopologyEdit, TopologyHooks,
};
use crate::connectivity::reset;
use crate::context::OrchestrationContext;
use crate::discovery::{are_all_nodes_activated, get_logical_server_states};
use crate::error::{ToolError, ToolResult};
use crate::lock::{node_del_tag, scale_in_tag};
use crate::stop::follow_stop;

/// Removal of one node, or of the stripe holding `source`, from the
/// destination cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetachPlan {
    #[serde(default)]
    pub operation_type: OperationType,
    pub destination: HostPort,
    pub source: HostPort,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub lock: bool,
    pub stop_wait: Option<Duration>,
    pub stop_delay: Option<Duration>,
}

/// What the shape checks resolved `source` to.
struct Removal {
    /// UID of the removed node or stripe.
    uid: Uid,
    name: String,
    /// Every node leaving the cluster.
    nodes: Vec<Uid>,
}

/// Detaches the source of `plan` from its destination cluster.
///
/// # Errors
///
/// Fails on any validation error, when the topology change is not
/// committed, or when removed nodes do not stop in time.
pub async fn detach(ctx: &OrchestrationContext, plan: &DetachPlan) -> ToolResult<()> {
    let mut dest = Destination::read(ctx, &plan.destination, plan.force).await?;
    let removal = check_shape(plan, &dest)?;

    dest.discover(ctx).await?;
    validate(ctx, plan, &dest, &removal).await?;

    let to_remove: Vec<Endpoint> = dest
        .online
        .endpoints()
        .filter(|e| removal.nodes.contains(&e.node_uid))
        .cloned()
        .collect();

    if plan.operation_type == OperationType::Node && !to_remove.is_empty() {
        let removed_states = dest.online.filter(|e, _| to_remove.contains(e));
        if are_all_nodes_activated(ctx, &removed_states).await? {
            check_or_bypass(plan.force, false, || {
                format!(
                    "Nodes to be detached: {} are online. Nodes must be safely shutdown first. Please refer to the \
                     Troubleshooting Guide for more help.",
                    list(&to_remove)
                )
            })?;
        }
    }

    let cluster_name = dest.cluster.name.as_deref().unwrap_or("<unnamed>");
    let (edit, tag) = match plan.operation_type {
        OperationType::Node => {
            info!("Detaching node: {} from cluster: {cluster_name}", removal.name);
            (TopologyEdit::RemoveNode(removal.uid.clone()), node_del_tag(&removal.nodes))
        }
        OperationType::Stripe => {
            info!("Detaching stripe: {} from cluster: {cluster_name}", removal.name);
            (TopologyEdit::RemoveStripe(removal.uid.clone()), scale_in_tag(&removal.uid))
        }
    };

    let topology = TopologyChange {
        edit,
        lock_tag: plan.lock.then_some(tag),
        online_sources: to_remove.clone(),
    };
    let mut hooks = DetachHooks {
        operation_type: plan.operation_type,
        to_remove,
        stop_wait: plan.stop_wait.unwrap_or_else(|| ctx.config().stop_wait()),
        stop_delay: plan.stop_delay.unwrap_or_else(|| ctx.config().stop_delay()),
    };
    run_topology_change(ctx, &mut dest, topology, &mut hooks).await
}

/// Checks that only need the destination's topology.
fn check_shape(plan: &DetachPlan, dest: &Destination) -> ToolResult<Removal> {
    let cluster = &dest.cluster;
    if cluster.node_count() == 1 {
        return Err(ToolError::validation(
            "Unable to detach since destination cluster contains only 1 node",
        ));
    }
    let source = cluster.node_by_address(&plan.source).ok_or_else(|| {
        ToolError::validation(format!(
            "Source: {} is not part of cluster: {}",
            plan.source,
            cluster.shape()
        ))
    })?;

    match plan.operation_type {
        OperationType::Node => {
            if source.uid == dest.endpoint.node_uid {
                return Err(ToolError::validation(
                    "The destination and the source nodes must not be the same",
                ));
            }
            if !cluster.in_same_stripe(&source.uid, &dest.endpoint.node_uid) {
                return Err(ToolError::validation(format!(
                    "Source node: {} is not present in the same stripe as destination: {}",
                    plan.source, dest.endpoint
                )));
            }
            if cluster.stripe_of(&dest.endpoint.node_uid).map_or(0, |s| s.node_count()) == 1 {
                return Err(ToolError::validation(
                    "Unable to detach since destination stripe contains only 1 node",
                ));
            }
            Ok(Removal {
                uid: source.uid.clone(),
                name: source.name.clone(),
                nodes: vec![source.uid.clone()],
            })
        }
        OperationType::Stripe => {
            let stripe = cluster
                .stripe_of(&source.uid)
                .ok_or_else(|| ToolError::validation(format!("Source: {} has no stripe", plan.source)))?;
            if stripe.contains(&dest.endpoint.node_uid) {
                return Err(ToolError::validation(format!(
                    "Source: {} and destination: {} are part of the same stripe: {}",
                    plan.source, dest.endpoint, stripe.name
                )));
            }
            Ok(Removal {
                uid: stripe.uid.clone(),
                name: stripe.name.clone(),
                nodes: stripe.nodes.iter().map(|n| n.uid.clone()).collect(),
            })
        }
    }
}

/// Checks that need the online peers.
async fn validate(ctx: &OrchestrationContext, plan: &DetachPlan, dest: &Destination, removal: &Removal) -> ToolResult<()> {
    if plan.operation_type == OperationType::Stripe
        && dest.activated
        && dest.cluster.stripe_id_of(&removal.uid) == Some(1)
    {
        return Err(ToolError::validation("Removing the leading stripe is not allowed"));
    }

    // departing nodes may still wait for a restart
    let remaining: Vec<&Endpoint> = dest
        .online
        .endpoints()
        .filter(|e| !removal.nodes.contains(&e.node_uid))
        .collect();
    ensure_no_pending_restart(ctx, remaining, plan.force).await?;

    match plan.operation_type {
        OperationType::Node => {
            let stripe_size = dest.cluster.stripe_of(&dest.endpoint.node_uid).map_or(0, |s| s.node_count());
            warn_on_voter_parity(&dest.cluster, stripe_size, &format!("removal of node {}", plan.source));
        }
        OperationType::Stripe => {
            if dest.activated {
                ensure_scaling_allowed(ctx, &dest.online, plan.force).await?;
            }
        }
    }
    Ok(())
}

struct DetachHooks {
    operation_type: OperationType,
    to_remove: Vec<Endpoint>,
    stop_wait: Duration,
    stop_delay: Duration,
}

impl DetachHooks {
    /// Resets and stops the online nodes leaving the cluster, then refreshes
    /// the states of the remaining ones.
    async fn reset_and_stop_removed(&self, ctx: &OrchestrationContext, dest: &mut Destination) -> ToolResult<()> {
        if self.to_remove.is_empty() {
            return Ok(());
        }
        info!("Reset nodes: {}", list(&self.to_remove));
        for endpoint in &self.to_remove {
            if let Err(e) = reset(ctx, endpoint).await {
                warn!("Error during reset of node: {endpoint}: {e}");
            }
        }

        info!("Stopping nodes: {}", list(&self.to_remove));
        let progress = ctx.stop_service().stop_nodes(&self.to_remove, self.stop_delay).await?;
        follow_stop(progress, &self.to_remove, self.stop_wait).await?;

        // a failover may have happened meanwhile
        let remaining: Vec<Endpoint> = dest
            .online
            .endpoints()
            .filter(|e| !self.to_remove.contains(e))
            .cloned()
            .collect();
        dest.online = get_logical_server_states(ctx, &remaining).await;
        Ok(())
    }
}

#[async_trait]
impl TopologyHooks for DetachHooks {
    async fn on_ready(&mut self, ctx: &OrchestrationContext, dest: &mut Destination, _change: &NomadChange) -> ToolResult<()> {
        if self.operation_type == OperationType::Node {
            self.reset_and_stop_removed(ctx, dest).await?;
        }
        Ok(())
    }

    async fn after_release(&mut self, ctx: &OrchestrationContext, dest: &mut Destination) -> ToolResult<()> {
        if self.operation_type == OperationType::Stripe {
            self.reset_and_stop_removed(ctx, dest).await?;
        }
        Ok(())
    }
}
