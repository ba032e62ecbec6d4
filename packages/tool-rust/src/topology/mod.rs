//! Attach and detach of nodes and stripes.
//!
//! Both operations share one flow: validate against the destination
//! cluster, build the new topology as a new value, then either push it to
//! unconfigured nodes or submit it through the configuration log with
//! hooks around the submission.

mod attach;
mod detach;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use dynconf_core::{
    join_endpoints, Cluster, ClusterState, ClusterValidator, Endpoint, FailoverPriority, HostPort, Node, NomadChange,
    Stripe, Uid,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::connectivity::{get_endpoint, get_upcoming_cluster, is_scaling_denied, must_be_restarted, run_configuration_change, set_upcoming_cluster};
use crate::context::OrchestrationContext;
use crate::discovery::{
    are_all_nodes_activated, ensure_actives_are_all_online, ensure_nodes_are_either_active_or_passive,
    find_online_runtime_peers,
};
use crate::error::{ToolError, ToolResult};
use crate::lock;
use crate::node_states::NodeStates;

pub use attach::{attach, AttachPlan};
pub use detach::{detach, DetachPlan};

/// Whether a topology command moves single nodes or whole stripes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    #[default]
    Node,
    Stripe,
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Node => "node",
            Self::Stripe => "stripe",
        })
    }
}

impl FromStr for OperationType {
    type Err = ToolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "node" => Ok(Self::Node),
            "stripe" => Ok(Self::Stripe),
            other => Err(ToolError::validation(format!("Invalid operation type: '{other}'"))),
        }
    }
}

/// Fails with `message` unless `force` is set, in which case the bypass is
/// logged.
pub(crate) fn check_or_bypass(force: bool, passed: bool, message: impl FnOnce() -> String) -> ToolResult<()> {
    if passed {
        return Ok(());
    }
    let message = message();
    if force {
        warn!("Following validation has been bypassed with the force option:\n - {message}");
        Ok(())
    } else {
        Err(ToolError::Validation(message))
    }
}

/// Rejects the change when one of `endpoints` still has to be restarted
/// to apply an earlier change.
pub(crate) async fn ensure_no_pending_restart<'a>(
    ctx: &OrchestrationContext,
    endpoints: impl IntoIterator<Item = &'a Endpoint>,
    force: bool,
) -> ToolResult<()> {
    for endpoint in endpoints {
        let pending = must_be_restarted(ctx, &endpoint.address).await?;
        check_or_bypass(force, !pending, || {
            format!(
                "Impossible to do any topology change. Node: {endpoint} is waiting to be restarted to apply some \
                 pending changes. Please refer to the Troubleshooting Guide for more help."
            )
        })?;
    }
    Ok(())
}

/// First online node vetoing scaling operations.
pub(crate) async fn find_scaling_vetoer(ctx: &OrchestrationContext, online: &NodeStates) -> Option<Endpoint> {
    for endpoint in online.endpoints() {
        match is_scaling_denied(ctx, &endpoint.address).await {
            Ok(true) => return Some(endpoint.clone()),
            Ok(false) => {}
            Err(e) => warn!("Unable to check scaling veto of {endpoint}: {e}"),
        }
    }
    None
}

pub(crate) async fn ensure_scaling_allowed(ctx: &OrchestrationContext, online: &NodeStates, force: bool) -> ToolResult<()> {
    let vetoer = find_scaling_vetoer(ctx, online).await;
    if let Some(endpoint) = &vetoer {
        debug!("Scaling denied by {endpoint}");
    }
    check_or_bypass(force, vetoer.is_none(), || {
        "Scaling operation cannot be performed. Please refer to the Troubleshooting Guide for more help.".to_string()
    })
}

/// Warns when adding or removing one node turns an odd voter sum even.
pub(crate) fn warn_on_voter_parity(cluster: &Cluster, stripe_node_count: usize, change: &str) {
    let Some(FailoverPriority::Consistency { voters }) = cluster.failover_priority else {
        return;
    };
    let sum = voters as usize + stripe_node_count;
    if sum % 2 != 0 {
        warn!(
            "\n===================================================================================\n\
             IMPORTANT: The sum ({sum}) of voter count ({voters}) and number of nodes ({stripe_node_count}) in this stripe\n\
             is an odd number, which will become even with the {change}.\n\
             An even-numbered configuration is more likely to experience split-brain situations.\n\
             ==================================================================================="
        );
    }
}

/// Destination cluster of a topology command, as seen through one of its
/// nodes.
#[derive(Debug, Clone)]
pub(crate) struct Destination {
    pub address: HostPort,
    pub endpoint: Endpoint,
    pub cluster: Cluster,
    pub online: NodeStates,
    pub activated: bool,
}

impl Destination {
    /// Reads the destination endpoint and upcoming cluster. No peer is
    /// contacted.
    pub async fn read(ctx: &OrchestrationContext, address: &HostPort, force: bool) -> ToolResult<Self> {
        debug!("Validating the parameters");
        let endpoint = get_endpoint(ctx, address).await?;
        let pending = must_be_restarted(ctx, address).await?;
        check_or_bypass(force, !pending, || {
            format!(
                "Impossible to do any topology change. Cluster at address: {address} is waiting to be restarted to apply \
                 some pending changes. You can run the command with the force option to force the commit, but at the risk \
                 of breaking this cluster configuration consistency. The newly added node will be restarted, but not the \
                 existing ones."
            )
        })?;
        let cluster = get_upcoming_cluster(ctx, address).await?;
        if !cluster.contains_node(&endpoint.node_uid) {
            return Err(ToolError::validation(format!(
                "Wrong destination address: {address}. It does not match any node in destination cluster: {}",
                cluster.shape()
            )));
        }
        Ok(Self {
            address: address.clone(),
            endpoint,
            cluster,
            online: NodeStates::new(),
            activated: false,
        })
    }

    /// Discovers the online peers and checks they can take a change.
    pub async fn discover(&mut self, ctx: &OrchestrationContext) -> ToolResult<()> {
        self.online = find_online_runtime_peers(ctx, &self.address).await?;
        self.activated = are_all_nodes_activated(ctx, &self.online).await?;
        if self.activated {
            ensure_nodes_are_either_active_or_passive(ctx, &self.online).await?;
            ensure_actives_are_all_online(&self.cluster, &self.online)?;
        }
        Ok(())
    }

    fn cluster_state(&self) -> ClusterState {
        if self.activated {
            ClusterState::Activated
        } else {
            ClusterState::Configuring
        }
    }
}

/// Steps specific to one kind of topology change.
#[async_trait]
pub(crate) trait TopologyHooks: Send {
    /// Called before the change is submitted.
    async fn on_ready(&mut self, _ctx: &OrchestrationContext, _dest: &mut Destination, _change: &NomadChange) -> ToolResult<()> {
        Ok(())
    }

    /// Called once the change is committed, while the lock is still held.
    async fn on_success(&mut self, _ctx: &OrchestrationContext, _dest: &mut Destination, _change: &NomadChange) -> ToolResult<()> {
        Ok(())
    }

    /// Called when the submission failed. Returns the error to report.
    async fn on_failure(&mut self, _ctx: &OrchestrationContext, _change: &NomadChange, error: ToolError) -> ToolError {
        error
    }

    /// Called once the change is committed, after the lock release was
    /// attempted.
    async fn after_release(&mut self, _ctx: &OrchestrationContext, _dest: &mut Destination) -> ToolResult<()> {
        Ok(())
    }
}

/// Topology edit, applied to whichever cluster is current when the change
/// is built.
#[derive(Debug, Clone)]
pub(crate) enum TopologyEdit {
    AddNode { stripe: Uid, node: Node },
    AddStripe(Stripe),
    RemoveNode(Uid),
    RemoveStripe(Uid),
}

impl TopologyEdit {
    fn apply(&self, base: &Cluster) -> ToolResult<NomadChange> {
        Ok(match self {
            Self::AddNode { stripe, node } => NomadChange::node_addition(base, stripe, node.clone())?,
            Self::AddStripe(stripe) => NomadChange::stripe_addition(base, stripe.clone()),
            Self::RemoveNode(uid) => NomadChange::node_removal(base, uid)?,
            Self::RemoveStripe(uid) => NomadChange::stripe_removal(base, uid)?,
        })
    }
}

/// What to submit, and to whom, once validation passed.
pub(crate) struct TopologyChange {
    pub edit: TopologyEdit,
    pub lock_tag: Option<String>,
    /// Online nodes outside the destination that must see the new topology.
    pub online_sources: Vec<Endpoint>,
}

pub(crate) async fn run_topology_change(
    ctx: &OrchestrationContext,
    dest: &mut Destination,
    topology: TopologyChange,
    hooks: &mut dyn TopologyHooks,
) -> ToolResult<()> {
    let change = topology.edit.apply(&dest.cluster)?;
    let result = change.result_cluster();
    ClusterValidator::new(result).validate(dest.cluster_state())?;
    if tracing::enabled!(tracing::Level::DEBUG) {
        debug!(
            "Updated topology:\n{}",
            serde_json::to_string_pretty(result).map_err(anyhow::Error::from)?
        );
    }

    if !dest.activated {
        info!("Sending the topology change");
        let mut targets = topology.online_sources.clone();
        for endpoint in dest.online.endpoints() {
            if !targets.contains(endpoint) {
                targets.push(endpoint.clone());
            }
        }
        set_upcoming_cluster(ctx, &targets, result).await?;
        info!("Command successful!");
        return Ok(());
    }

    let Some(tag) = topology.lock_tag else {
        let base = dest.cluster.clone();
        submit(ctx, dest, &base, &change, hooks).await.outcome?;
        hooks.after_release(ctx, dest).await?;
        info!("Command successful!");
        return Ok(());
    };

    // changes made under the lock build on the locked cluster
    let (locked, base) = lock::acquire(ctx, &dest.cluster, &dest.online, &tag).await?;
    let change = match topology.edit.apply(&base) {
        Ok(change) => change,
        Err(e) => return lock::release_after(&locked, &base, &dest.online, Err(e)).await,
    };
    let submission = submit(&locked, dest, &base, &change, hooks).await;
    let current = if submission.committed { change.result_cluster() } else { &base };
    let released = lock::release_after(&locked, current, &dest.online, submission.outcome).await;
    let finished = if submission.committed {
        hooks.after_release(ctx, dest).await
    } else {
        Ok(())
    };
    released?;
    finished?;
    info!("Command successful!");
    Ok(())
}

/// Outcome of [`submit`].
struct Submission {
    /// Whether the change itself went through the configuration log. The
    /// hooks run after the commit may still have failed.
    committed: bool,
    outcome: ToolResult<()>,
}

async fn submit(
    ctx: &OrchestrationContext,
    dest: &mut Destination,
    base: &Cluster,
    change: &NomadChange,
    hooks: &mut dyn TopologyHooks,
) -> Submission {
    if let Err(e) = hooks.on_ready(ctx, dest, change).await {
        return Submission {
            committed: false,
            outcome: Err(e),
        };
    }
    info!("Sending the topology change: {}", change.summary());
    let nodes = dest.online.passives_first();
    if let Err(e) = run_configuration_change(ctx, base, &nodes, change.clone()).await {
        return Submission {
            committed: false,
            outcome: Err(hooks.on_failure(ctx, change, e).await),
        };
    }
    Submission {
        committed: true,
        outcome: hooks.on_success(ctx, dest, change).await,
    }
}

fn list(endpoints: &[Endpoint]) -> String {
    join_endpoints(endpoints)
}
