//! `set` and `unset` of configuration settings on a running cluster.

use std::collections::BTreeSet;
use std::time::Duration;

use dynconf_core::{
    apply_all, join_endpoints, validate_all, Cluster, ClusterState, ClusterValidator, Configuration, Endpoint,
    HostPort, NomadChange, Operation, Requirement, Setting, SettingLevel, Uid,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::connectivity::{
    get_logical_server_state, get_upcoming_cluster, is_activated, must_be_restarted, run_configuration_change,
    set_upcoming_cluster,
};
use crate::context::OrchestrationContext;
use crate::discovery::{
    are_all_nodes_activated, ensure_actives_are_all_online, ensure_nodes_are_either_active_or_passive,
    ensure_passives_are_all_online, find_online_runtime_peers,
};
use crate::error::{ToolError, ToolResult};
use crate::restart::{follow_restart, ACTIVE_OR_PASSIVE};

/// Settings to change through one node of the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationPlan {
    pub seed: HostPort,
    pub configurations: Vec<Configuration>,
    /// Defaults to [`ToolConfig::auto_restart`](crate::config::ToolConfig).
    pub auto_restart: Option<bool>,
    pub restart_wait: Option<Duration>,
    pub restart_delay: Option<Duration>,
}

/// Applies `operation` for every configuration of `plan`, as one change.
///
/// # Errors
///
/// Fails on invalid configurations, when targeted nodes are offline, when
/// the change is not committed, or when restarted nodes do not come back.
pub async fn mutate(ctx: &OrchestrationContext, operation: Operation, plan: &MutationPlan) -> ToolResult<()> {
    let configurations = &plan.configurations;
    if configurations.is_empty() {
        info!("Command successful!");
        return Ok(());
    }
    let state = if is_activated(ctx, &plan.seed).await? {
        ClusterState::Activated
    } else {
        ClusterState::Configuring
    };
    validate_all(configurations, operation, state)?;

    debug!("Validating the new configuration change(s) against the topology of: {}", plan.seed);
    let original = get_upcoming_cluster(ctx, &plan.seed).await?;
    let applied = apply_all(&original, configurations, operation)?;

    // only node settings are validated by the nodes they target
    let mut targeted = BTreeSet::new();
    let mut requiring_restart = BTreeSet::new();
    for configuration in configurations {
        if configuration.setting.level() != SettingLevel::Node {
            continue;
        }
        let nodes = configuration.targeted_nodes(&original)?;
        if configuration.setting.requires(Requirement::NodeRestart) {
            requiring_restart.extend(nodes.iter().cloned());
        }
        targeted.extend(nodes);
    }

    if applied.cluster == original {
        warn!(
            "\n=======================================================================================\n\
             The requested update will not result in any change to the cluster configuration.\n\
             ======================================================================================="
        );
        return Ok(());
    }

    let mut online = find_online_runtime_peers(ctx, &plan.seed).await?;
    debug!("Online nodes: {}", join_endpoints(online.endpoints()));
    let activated = are_all_nodes_activated(ctx, &online).await?;
    ClusterValidator::new(&applied.cluster).validate(if activated {
        ClusterState::Activated
    } else {
        ClusterState::Configuring
    })?;

    let missing: Vec<&str> = targeted
        .iter()
        .filter(|uid| !online.contains(uid))
        .filter_map(|uid| original.node(uid))
        .map(|node| node.name.as_str())
        .collect();
    if !missing.is_empty() {
        return Err(ToolError::validation(format!(
            "Some nodes that are targeted by the change are not reachable and thus cannot be validated. \
             Please ensure these nodes are online, or remove them from the request: {}",
            missing.join(", ")
        )));
    }
    debug!("New configuration change(s) can be sent");

    if !activated {
        let endpoints: Vec<Endpoint> = online.endpoints().cloned().collect();
        info!("Applying new configuration change(s) to nodes: {}", join_endpoints(&endpoints));
        set_upcoming_cluster(ctx, &endpoints, &applied.cluster).await?;
        info!("Command successful!");
        return Ok(());
    }

    ensure_nodes_are_either_active_or_passive(ctx, &online).await?;
    if configurations.iter().any(|c| c.setting.requires(Requirement::ClusterOnline)) {
        ensure_passives_are_all_online(&original, &online)?;
    }
    ensure_actives_are_all_online(&original, &online)?;

    info!("Applying new configuration change(s) to activated nodes: {}", join_endpoints(online.endpoints()));
    if !applied.changes.is_empty() {
        let change = NomadChange::multi_setting(applied.cluster.clone(), applied.changes.clone());
        run_configuration_change(ctx, &original, &online.passives_first(), change).await?;
    }

    let restart = RollingRestart {
        ctx,
        cluster: &applied.cluster,
        wait: plan.restart_wait.unwrap_or_else(|| ctx.config().restart_wait()),
        delay: plan.restart_delay.unwrap_or_else(|| ctx.config().restart_delay()),
    };
    let auto_restart = plan.auto_restart.unwrap_or(ctx.config().auto_restart);

    if applied.changes.iter().any(|c| c.setting.requires(Requirement::ClusterRestart)) {
        info!("Restart required for cluster");
        if auto_restart {
            let endpoints: Vec<Endpoint> = online.endpoints().cloned().collect();
            restart.run(&endpoints).await?;
        } else {
            warn!(
                "\n====================================================================\n\
                 IMPORTANT: A manual restart of the cluster is required to apply the changes\n\
                 ===================================================================="
            );
        }
    } else {
        let settings: BTreeSet<Setting> = configurations.iter().map(|c| c.setting).collect();
        // settings applied at runtime may still be vetoed by a node
        if settings.iter().any(|s| !s.requires(Requirement::NodeRestart)) {
            let to_check: Vec<Endpoint> = online
                .endpoints()
                .filter(|e| targeted.contains(&e.node_uid))
                .cloned()
                .collect();
            for endpoint in to_check {
                match must_be_restarted(ctx, &endpoint.address).await {
                    Ok(true) => {
                        requiring_restart.insert(endpoint.node_uid.clone());
                    }
                    Ok(false) => {}
                    Err(e) => {
                        warn!("Node: {endpoint} is not reachable anymore: {e}");
                        online.remove(&endpoint);
                    }
                }
            }
        }

        if !requiring_restart.is_empty() {
            let targets: Vec<Endpoint> = online
                .endpoints()
                .filter(|e| requiring_restart.contains(&e.node_uid))
                .cloned()
                .collect();
            info!("Restart required for nodes: {}", join_endpoints(&targets));
            if auto_restart {
                restart.run(&targets).await?;
            } else {
                warn!(
                    "\n=======================================================================================\n\
                     IMPORTANT: A manual restart of nodes: {} is required to apply the changes\n\
                     =======================================================================================",
                    node_names(&original, &requiring_restart)
                );
            }
        }
    }

    info!("Command successful!");
    Ok(())
}

fn node_names(cluster: &Cluster, uids: &BTreeSet<Uid>) -> String {
    uids.iter()
        .map(|uid| cluster.node(uid).map_or_else(|| uid.to_string(), |n| n.name.clone()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Restarts nodes passives first, so that every stripe keeps an active.
struct RollingRestart<'a> {
    ctx: &'a OrchestrationContext,
    cluster: &'a Cluster,
    wait: Duration,
    delay: Duration,
}

impl RollingRestart<'_> {
    async fn run(&self, targets: &[Endpoint]) -> ToolResult<()> {
        let ctx = self.ctx;
        let mut cannot_restart: Vec<Endpoint> = Vec::new();
        let mut actives: Vec<Endpoint> = Vec::new();
        let mut others: Vec<Endpoint> = Vec::new();

        for stripe in &self.cluster.stripes {
            let in_stripe: Vec<&Endpoint> = targets.iter().filter(|e| stripe.contains(&e.node_uid)).collect();
            match in_stripe.as_slice() {
                [] => warn!("No node in stripe '{}' seem to be online", stripe.name),
                [alone] => {
                    warn!(
                        "Unable to restart node: {alone} in stripe '{}' because this is the only online node",
                        stripe.name
                    );
                    cannot_restart.push((*alone).clone());
                }
                _ => {
                    for endpoint in in_stripe {
                        match get_logical_server_state(ctx, &endpoint.address).await {
                            Ok(state) if state.is_active() => actives.push(endpoint.clone()),
                            Ok(_) => others.push(endpoint.clone()),
                            Err(e) => {
                                warn!("Node: {endpoint} in stripe '{}' is not reachable anymore: {e}", stripe.name);
                                cannot_restart.push(endpoint.clone());
                            }
                        }
                    }
                }
            }
        }

        if !others.is_empty() {
            info!("Restarting non active nodes: {}...", join_endpoints(&others));
            let progress = ctx
                .restart_service()
                .restart_nodes_if_passives(&others, self.delay, &ACTIVE_OR_PASSIVE)
                .await?;
            follow_restart(progress, &others, self.wait).await?;
        }
        if !actives.is_empty() {
            // actives fail over to the passives restarted above
            info!("Restarting active nodes: {}...", join_endpoints(&actives));
            let progress = ctx
                .restart_service()
                .restart_nodes_if_actives(&actives, self.delay, &ACTIVE_OR_PASSIVE)
                .await?;
            follow_restart(progress, &actives, self.wait).await?;
        }

        // a node may have changed role between the state check and its wave
        for endpoint in others.iter().chain(&actives) {
            match must_be_restarted(ctx, &endpoint.address).await {
                Ok(false) => {}
                Ok(true) => cannot_restart.push(endpoint.clone()),
                Err(e) => {
                    warn!("Node: {endpoint} is not reachable anymore: {e}");
                    cannot_restart.push(endpoint.clone());
                }
            }
        }
        if !cannot_restart.is_empty() {
            warn!(
                "\n=======================================================================================\n\
                 IMPORTANT: A manual restart of nodes: {} will be required to apply the changes\n\
                 =======================================================================================",
                join_endpoints(&cannot_restart)
            );
        }
        Ok(())
    }
}
