use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use dynconf_core::names::{default_node_name, default_stripe_name};
use dynconf_core::{Endpoint, HostPort, NameGenerator, Node, NodeContext, NomadChange, Stripe, Uid};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use super::{
    check_or_bypass, ensure_no_pending_restart, ensure_scaling_allowed, list, run_topology_change,
    warn_on_voter_parity, Destination, OperationType, TopologyChange, TopologyEdit, TopologyHooks,
};
use crate::connectivity::{
    activate_nomad_system, get_change_history, get_endpoint, get_license_content, get_runtime_cluster,
    get_upcoming_node_context, is_activated, reset_and_sync, run_cluster_activation, set_upcoming_cluster,
};
use crate::context::OrchestrationContext;
use crate::discovery::get_logical_server_states;
use crate::error::{ToolError, ToolResult};
use crate::lock::{node_add_tag, scale_out_tag};
use crate::restart::{follow_restart, ACTIVATION_ACCEPTED};

/// Attach of one node to the destination's stripe, or of a whole stripe to
/// the destination cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachPlan {
    #[serde(default)]
    pub operation_type: OperationType,
    pub destination: HostPort,
    /// For a stripe, either every node of the new stripe or one node of an
    /// existing single-stripe cluster.
    pub sources: Vec<HostPort>,
    pub stripe_name: Option<String>,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub lock: bool,
    pub restart_wait: Option<Duration>,
    pub restart_delay: Option<Duration>,
}

/// A node to attach, with the topology it had before the attach.
#[derive(Debug, Clone)]
struct Source {
    endpoint: Endpoint,
    backup: NodeContext,
}

/// Attaches the sources of `plan` to its destination.
///
/// # Errors
///
/// Fails on any validation error, when the topology change is not
/// committed, or when the attached nodes do not come back after their
/// restart.
pub async fn attach(ctx: &OrchestrationContext, plan: &AttachPlan) -> ToolResult<()> {
    if plan.sources.is_empty() {
        return Err(ToolError::validation("Missing source node"));
    }
    if plan.operation_type == OperationType::Node && plan.sources.len() > 1 {
        return Err(ToolError::validation("Cannot attach more than 1 node at a time"));
    }
    if plan.sources.contains(&plan.destination) {
        return Err(ToolError::validation(
            "The destination and the source endpoints must not be the same",
        ));
    }

    let mut dest = Destination::read(ctx, &plan.destination, plan.force).await?;
    dest.discover(ctx).await?;
    let sources = fetch_sources(ctx, plan).await?;
    validate(ctx, plan, &dest, &sources).await?;

    let (edit, added, lock_tag) = prepare(plan, &dest, &sources)?;
    let mut hooks = AttachHooks {
        operation_type: plan.operation_type,
        sources,
        added,
        restart_wait: plan.restart_wait.unwrap_or_else(|| ctx.config().restart_wait()),
        restart_delay: plan.restart_delay.unwrap_or_else(|| ctx.config().restart_delay()),
    };
    let topology = TopologyChange {
        edit,
        lock_tag: plan.lock.then_some(lock_tag),
        online_sources: hooks.sources.iter().map(|s| s.endpoint.clone()).collect(),
    };
    run_topology_change(ctx, &mut dest, topology, &mut hooks).await
}

async fn fetch_sources(ctx: &OrchestrationContext, plan: &AttachPlan) -> ToolResult<Vec<Source>> {
    let mut sources = Vec::with_capacity(plan.sources.len());
    for address in &plan.sources {
        let endpoint = get_endpoint(ctx, address).await?;
        let backup = get_upcoming_node_context(ctx, address).await?;
        sources.push(Source { endpoint, backup });
    }

    // one node of an existing stripe stands for the whole stripe
    if plan.operation_type == OperationType::Stripe && sources.len() == 1 {
        let Source { endpoint, backup } = sources.remove(0);
        let Some(stripe) = backup.stripe() else {
            return Err(ToolError::validation(format!("Source node: {endpoint} is not part of any stripe")));
        };
        for node in &stripe.nodes {
            sources.push(Source {
                endpoint: node.similar_endpoint(&endpoint),
                backup: NodeContext::new(backup.cluster.clone(), node.uid.clone())?,
            });
        }
    }
    Ok(sources)
}

async fn validate(ctx: &OrchestrationContext, plan: &AttachPlan, dest: &Destination, sources: &[Source]) -> ToolResult<()> {
    for source in sources {
        if source.endpoint.node_uid == dest.endpoint.node_uid {
            return Err(ToolError::validation(
                "The destination and the source endpoints must not be the same",
            ));
        }
    }

    ensure_no_pending_restart(ctx, dest.online.endpoints(), plan.force).await?;

    let peers = dest.cluster.determine_endpoints(&dest.address);
    for source in sources {
        if peers.contains(&source.endpoint) {
            return Err(ToolError::validation(format!(
                "Source node: {} is already part of cluster: {}",
                source.endpoint,
                dest.cluster.shape()
            )));
        }
        if is_activated(ctx, &source.endpoint.address).await? {
            let runtime = get_runtime_cluster(ctx, &source.endpoint.address).await?;
            return Err(ToolError::validation(format!(
                "Source node: {} cannot be attached since it is part of an existing cluster with name: {}",
                source.endpoint,
                runtime.name.as_deref().unwrap_or("<unnamed>")
            )));
        }
    }

    match plan.operation_type {
        OperationType::Node => {
            let stripe_size = dest.cluster.stripe_of(&dest.endpoint.node_uid).map_or(0, |s| s.node_count());
            for source in sources {
                check_or_bypass(plan.force, source.backup.cluster.node_count() == 1, || {
                    format!(
                        "Source node: {} is part of a stripe containing more than 1 nodes. It must be detached first \
                         before being attached to a new stripe. Please refer to the Troubleshooting Guide for more help.",
                        source.endpoint
                    )
                })?;
                warn_on_voter_parity(&dest.cluster, stripe_size, &format!("addition of node {}", source.endpoint));
            }
        }
        OperationType::Stripe => {
            for source in sources {
                check_or_bypass(plan.force, source.backup.cluster.stripe_count() == 1, || {
                    format!(
                        "Source stripe from node: {} is part of a cluster containing more than 1 stripes. It must be \
                         detached first before being attached to a new cluster. Please refer to the Troubleshooting \
                         Guide for more help.",
                        source.endpoint
                    )
                })?;
            }
            let listed: HashSet<&Uid> = sources.iter().map(|s| &s.endpoint.node_uid).collect();
            for source in sources {
                let forgotten: Vec<&str> = source
                    .backup
                    .stripe()
                    .into_iter()
                    .flat_map(|s| s.nodes.iter())
                    .filter(|n| !listed.contains(&n.uid))
                    .map(|n| n.uid.as_str())
                    .collect();
                if !forgotten.is_empty() {
                    return Err(ToolError::validation(format!(
                        "Source node: {} points to a stripe with more than one node and the following nodes were not \
                         marked to be attached: {}",
                        source.endpoint,
                        forgotten.join(", ")
                    )));
                }
            }
            if dest.activated {
                ensure_scaling_allowed(ctx, &dest.online, plan.force).await?;
            }
        }
    }
    Ok(())
}

/// Copies `node` under a fresh UID, keeping its name unless it was a
/// generated default.
fn fresh_copy(node: &Node) -> Node {
    let mut copy = node.clone();
    copy.uid = Uid::generate();
    if node.has_generated_name() {
        copy.name = default_node_name(&copy.uid);
    }
    copy
}

/// Builds the edit and the endpoints under which the attached nodes will be
/// known once it is applied.
fn prepare(plan: &AttachPlan, dest: &Destination, sources: &[Source]) -> ToolResult<(TopologyEdit, Vec<Endpoint>, String)> {
    let mut names = NameGenerator::new(rand::rng());
    let originals: Vec<&Node> = sources
        .iter()
        .map(|s| {
            s.backup
                .node()
                .ok_or_else(|| ToolError::validation(format!("Source node: {} is not part of its own cluster", s.endpoint)))
        })
        .collect::<ToolResult<_>>()?;

    let (edit, nodes, tag) = match plan.operation_type {
        OperationType::Node => {
            let stripe = dest
                .cluster
                .stripe_of(&dest.endpoint.node_uid)
                .ok_or_else(|| ToolError::validation(format!("Destination node: {} has no stripe", dest.endpoint)))?;
            let mut node = fresh_copy(originals[0]);
            if dest.activated {
                names.assign_friendly_node_name(&dest.cluster, stripe, &mut node);
            }
            info!("Attaching node: {} to stripe: {}", node.name, stripe.name);
            let tag = node_add_tag(&node.uid);
            let edit = TopologyEdit::AddNode {
                stripe: stripe.uid.clone(),
                node: node.clone(),
            };
            (edit, vec![node], tag)
        }
        OperationType::Stripe => {
            let mut stripe = Stripe::new("", originals.iter().map(|n| fresh_copy(n)).collect());
            let source_name = sources
                .first()
                .and_then(|s| s.backup.stripe())
                .filter(|s| !s.has_generated_name())
                .map(|s| s.name.clone());
            stripe.name = plan
                .stripe_name
                .clone()
                .or(source_name)
                .unwrap_or_else(|| default_stripe_name(&stripe.uid));
            if dest.activated {
                names.assign_friendly_stripe_name(&dest.cluster, &mut stripe);
            }
            info!(
                "Attaching a new stripe: {} to cluster: {}",
                stripe.name,
                dest.cluster.name.as_deref().unwrap_or("<unnamed>")
            );
            let tag = scale_out_tag(&stripe.uid);
            let nodes = stripe.nodes.iter().map(|n| Node::clone(n)).collect();
            (TopologyEdit::AddStripe(stripe), nodes, tag)
        }
    };

    let added = sources
        .iter()
        .zip(&nodes)
        .map(|(source, node)| {
            Endpoint::new(node.uid.clone(), node.name.clone(), source.endpoint.address.clone(), source.endpoint.group)
        })
        .collect();
    Ok((edit, added, tag))
}

struct AttachHooks {
    operation_type: OperationType,
    sources: Vec<Source>,
    /// The sources under their new identity.
    added: Vec<Endpoint>,
    restart_wait: Duration,
    restart_delay: Duration,
}

impl AttachHooks {
    fn source_endpoints(&self) -> Vec<Endpoint> {
        self.sources.iter().map(|s| s.endpoint.clone()).collect()
    }

    async fn activate(&self, ctx: &OrchestrationContext, dest: &mut Destination, change: &NomadChange) -> ToolResult<()> {
        let result = change.result_cluster();
        let license = match self.operation_type {
            OperationType::Stripe => get_license_content(ctx, &dest.endpoint.address).await?,
            OperationType::Node => None,
        };
        activate_nomad_system(ctx, &self.added, result, license.as_deref()).await?;
        run_cluster_activation(ctx, &self.added, result).await?;

        if self.operation_type == OperationType::Stripe {
            info!("Sync'ing nomad changes to nodes: {}", list(&self.added));
            let history = get_change_history(ctx, &dest.endpoint.address).await?;
            reset_and_sync(ctx, &self.added, &history, result).await?;
            info!("Nomad changes sync successful");
        }

        info!("Restarting nodes: {}", list(&self.added));
        let progress = ctx
            .restart_service()
            .restart_nodes(&self.added, self.restart_delay, &ACTIVATION_ACCEPTED)
            .await?;
        follow_restart(progress, &self.added, self.restart_wait).await?;
        info!("All nodes came back up");

        // the joined nodes share the configuration log from now on
        for (endpoint, state) in get_logical_server_states(ctx, &self.added).await.online() {
            dest.online.insert(endpoint, state);
        }
        Ok(())
    }
}

#[async_trait]
impl TopologyHooks for AttachHooks {
    async fn on_ready(&mut self, ctx: &OrchestrationContext, _dest: &mut Destination, change: &NomadChange) -> ToolResult<()> {
        set_upcoming_cluster(ctx, &self.source_endpoints(), change.result_cluster()).await
    }

    async fn on_success(&mut self, ctx: &OrchestrationContext, dest: &mut Destination, change: &NomadChange) -> ToolResult<()> {
        self.activate(ctx, dest, change).await
    }

    async fn on_failure(&mut self, ctx: &OrchestrationContext, _change: &NomadChange, error: ToolError) -> ToolError {
        error!(
            "An error occurred during the attach transaction.\n\
             The node/stripe information may still be added to the destination cluster: you will need to run the \
             diagnostic / export command to check the state of the transaction.\n\
             The node/stripe to attach won't be activated and restarted, and their topology will be rolled back to \
             their initial value."
        );
        for source in &self.sources {
            info!("Rollback topology of node: {}", source.endpoint);
            if let Err(e) = set_upcoming_cluster(ctx, std::slice::from_ref(&source.endpoint), &source.backup.cluster).await {
                warn!("Unable to rollback configuration on node: {}. Error: {e}", source.endpoint);
            }
        }
        error
    }
}

#[cfg(test)]
mod tests {
    use dynconf_core::{Cluster, LogicalServerState};

    use super::*;
    use crate::testing::{SimCluster, SimNode};

    fn node_plan(sim: &SimCluster, dest: &str, source: &str) -> AttachPlan {
        AttachPlan {
            operation_type: OperationType::Node,
            destination: sim.address(dest),
            sources: vec![sim.address(source)],
            stripe_name: None,
            force: false,
            lock: false,
            restart_wait: None,
            restart_delay: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn lone_node_joins_activated_stripe() {
        let sim = SimCluster::activated_one_stripe(&["a", "b"]);
        sim.add_unconfigured(&["c"]);
        let old_uid = sim.node("c").node_uid;

        attach(&sim.context(), &node_plan(&sim, "a", "c")).await.unwrap();

        let submitted = sim.submitted();
        assert_eq!(submitted.len(), 1);
        let NomadChange::NodeAddition { node, .. } = &submitted[0] else {
            panic!("unexpected change {:?}", submitted[0]);
        };
        assert_ne!(node.uid, old_uid);
        assert!(!node.has_generated_name());
        assert!(node.name.starts_with("s1-"));

        let c = sim.node("c");
        assert_eq!(c.node_uid, node.uid);
        assert!(c.activated);
        assert_eq!(c.state, LogicalServerState::Passive);
        assert_eq!(c.runtime.node_count(), 3);
        assert_eq!(sim.node("a").upcoming.node_count(), 3);
        assert_eq!(sim.count("restart"), 1);
    }

    /// The addition that went through the configuration log.
    fn committed_addition(sim: &SimCluster) -> NomadChange {
        sim.submitted()
            .iter()
            .map(NomadChange::inner)
            .find(|c| matches!(c, NomadChange::NodeAddition { .. } | NomadChange::StripeAddition { .. }))
            .cloned()
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn every_peer_ends_on_the_committed_topology() {
        let sim = SimCluster::activated_one_stripe(&["a", "b"]);
        sim.add_unconfigured(&["c"]);

        attach(&sim.context(), &node_plan(&sim, "a", "c")).await.unwrap();

        let addition = committed_addition(&sim);
        let result = addition.result_cluster();
        assert!(result.lock_context.is_none());
        for label in ["a", "b", "c"] {
            assert_eq!(sim.node(label).upcoming, *result, "upcoming cluster of {label}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn locked_addition_holds_the_lock_until_released() {
        let sim = SimCluster::activated_one_stripe(&["a", "b"]);
        sim.add_unconfigured(&["c"]);
        let mut plan = node_plan(&sim, "a", "c");
        plan.lock = true;

        attach(&sim.context(), &plan).await.unwrap();

        let submitted = sim.submitted();
        let NomadChange::LockConfig { lock_context, .. } = &submitted[0] else {
            panic!("expected a lock first, got {:?}", submitted[0]);
        };
        let addition = committed_addition(&sim);
        assert_eq!(addition.result_cluster().lock_context.as_ref(), Some(lock_context));

        let released = addition.result_cluster().with_lock_context(None);
        assert_eq!(released.node_count(), 3);
        for label in ["a", "b", "c"] {
            assert_eq!(sim.node(label).upcoming, released, "upcoming cluster of {label}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_activation_keeps_the_committed_topology() {
        let sim = SimCluster::activated_one_stripe(&["a", "b"]);
        sim.add_unconfigured(&["c"]);
        sim.fail_activation("activation rejected by c");
        let mut plan = node_plan(&sim, "a", "c");
        plan.lock = true;

        let err = attach(&sim.context(), &plan).await.unwrap_err();

        assert!(matches!(&err, ToolError::Protocol { reasons } if reasons[0] == "activation rejected by c"));
        let released = committed_addition(&sim).result_cluster().with_lock_context(None);
        assert_eq!(released.node_count(), 3);
        for label in ["a", "b"] {
            assert_eq!(sim.node(label).upcoming, released, "upcoming cluster of {label}");
        }
        assert!(matches!(
            sim.submitted().last().map(NomadChange::inner),
            Some(NomadChange::UnlockConfig { forced: false, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_commit_rolls_sources_back() {
        let sim = SimCluster::activated_one_stripe(&["a", "b"]);
        let before = sim.add_unconfigured(&["c"]);
        sim.fail_changes("prepare rejected by b");

        let err = attach(&sim.context(), &node_plan(&sim, "a", "c")).await.unwrap_err();

        assert!(matches!(&err, ToolError::Protocol { reasons } if reasons[0] == "prepare rejected by b"));
        let c = sim.node("c");
        assert_eq!(c.upcoming, before);
        assert_eq!(c.node_uid, before.stripes[0].nodes[0].uid);
        assert_eq!(sim.count("activate"), 0);
        assert_eq!(sim.count("restart"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stripe_attach_under_lock_syncs_history() {
        let sim = SimCluster::activated_one_stripe(&["a", "b"]);
        sim.add_unconfigured(&["c", "d"]);
        let mut plan = node_plan(&sim, "a", "c");
        plan.operation_type = OperationType::Stripe;
        plan.lock = true;

        attach(&sim.context(), &plan).await.unwrap();

        let kinds: Vec<&str> = sim
            .submitted()
            .iter()
            .map(|c| match (c, c.inner()) {
                (NomadChange::LockConfig { .. }, _) => "lock",
                (NomadChange::LockAware { .. }, NomadChange::StripeAddition { .. }) => "stripe",
                (NomadChange::LockAware { .. }, NomadChange::UnlockConfig { .. }) => "unlock",
                _ => "other",
            })
            .collect();
        assert_eq!(kinds, ["lock", "stripe", "unlock"]);
        assert_eq!(sim.count("reset_and_sync"), 2);
        assert_eq!(sim.count("restart"), 2);
        let runtime = sim.node("d").runtime;
        assert_eq!(runtime.stripe_count(), 2);
        assert!(!runtime.stripes[1].has_generated_name());
        assert_eq!(sim.node("d").license.as_deref(), Some("license"));

        let addition = committed_addition(&sim);
        assert!(addition.result_cluster().lock_context.is_some());
        let released = addition.result_cluster().with_lock_context(None);
        for label in ["a", "b", "c", "d"] {
            assert_eq!(sim.node(label).upcoming, released, "upcoming cluster of {label}");
        }
    }

    #[tokio::test]
    async fn unconfigured_destination_gets_new_topology_directly() {
        let sim = SimCluster::default();
        sim.add_unconfigured(&["a"]);
        sim.add_unconfigured(&["b"]);

        attach(&sim.context(), &node_plan(&sim, "a", "b")).await.unwrap();

        assert_eq!(sim.count("change"), 0);
        assert_eq!(sim.count("set_upcoming"), 2);
        assert_eq!(sim.node("a").upcoming.node_count(), 2);
        assert_eq!(sim.node("b").upcoming, sim.node("a").upcoming);
    }

    #[tokio::test]
    async fn rejects_invalid_sources() {
        let sim = SimCluster::activated_one_stripe(&["a", "b"]);
        let other = Cluster::new(Some("other".into()), vec![Stripe::new("x", vec![Node::with_defaults("z", "z")])]);
        sim.add_cluster(&other, true);
        let ctx = sim.context();

        let mut plan = node_plan(&sim, "a", "z");
        plan.sources.push(sim.address("b"));
        let err = attach(&ctx, &plan).await.unwrap_err();
        assert_eq!(err.to_string(), "Cannot attach more than 1 node at a time");

        let err = attach(&ctx, &node_plan(&sim, "a", "a")).await.unwrap_err();
        assert_eq!(err.to_string(), "The destination and the source endpoints must not be the same");

        let err = attach(&ctx, &node_plan(&sim, "a", "b")).await.unwrap_err();
        assert!(err.to_string().starts_with("Source node: b@b:9410 is already part of cluster"));

        let err = attach(&ctx, &node_plan(&sim, "a", "z")).await.unwrap_err();
        assert!(err.to_string().ends_with("part of an existing cluster with name: other"));
        assert_eq!(sim.count("change"), 0);
    }

    #[tokio::test]
    async fn pending_restart_blocks_unless_forced() {
        let sim = SimCluster::activated_one_stripe(&["a", "b"]);
        sim.add_unconfigured(&["c"]);
        sim.update("b", |n: &mut SimNode| n.must_restart = true);

        let err = attach(&sim.context(), &node_plan(&sim, "a", "c")).await.unwrap_err();
        assert!(err.to_string().contains("Node: b@b:9410 is waiting to be restarted"));
        assert_eq!(sim.count("change"), 0);
    }
}
