//! Repair of a configuration change interrupted half-way.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use dynconf_core::{join_endpoints, ChangeRequestState, HostPort};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::analyzer::{ConsistencyAnalyzer, ConsistencyState};
use crate::connectivity::{get_endpoint, get_upcoming_cluster, is_activated, reset_and_stop};
use crate::context::OrchestrationContext;
use crate::discovery::find_runtime_peers_status;
use crate::error::{ToolError, ToolResult};
use crate::failures::FailureRecorder;
use crate::lock;
use crate::node_states::NodeStates;

/// Remedy forced by the operator instead of the one the analysis picks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepairMethod {
    Commit,
    Rollback,
    /// Resets the target node and stops it.
    Reset,
    /// Clears the configuration lock whoever holds it.
    Unlock,
}

impl fmt::Display for RepairMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Commit => "commit",
            Self::Rollback => "rollback",
            Self::Reset => "reset",
            Self::Unlock => "unlock",
        })
    }
}

impl FromStr for RepairMethod {
    type Err = ToolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "commit" => Ok(Self::Commit),
            "rollback" => Ok(Self::Rollback),
            "reset" => Ok(Self::Reset),
            "unlock" => Ok(Self::Unlock),
            _ => Err(ToolError::validation(format!("Invalid repair method: '{s}'"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairPlan {
    pub seed: HostPort,
    #[serde(default)]
    pub forced: Option<RepairMethod>,
    #[serde(default)]
    pub stop_delay: Option<Duration>,
}

/// Brings the cluster reached through `plan.seed` back to a state that
/// accepts new changes.
///
/// # Errors
///
/// Fails when the configuration is in a state that cannot be repaired
/// automatically, when the forced method contradicts the analysis, or when
/// the repair is not acknowledged by every node.
pub async fn repair(ctx: &OrchestrationContext, plan: &RepairPlan) -> ToolResult<()> {
    match plan.forced {
        Some(RepairMethod::Reset) => {
            let endpoint = get_endpoint(ctx, &plan.seed).await?;
            let delay = plan.stop_delay.unwrap_or_else(|| ctx.config().stop_delay());
            info!("Resetting and stopping node: {endpoint}");
            reset_and_stop(ctx, &endpoint, delay).await?;
            info!("Command successful!");
            return Ok(());
        }
        Some(RepairMethod::Unlock) => {
            let all = find_runtime_peers_status(ctx, &plan.seed).await?;
            warn_unreachable(&all);
            let cluster = get_upcoming_cluster(ctx, &plan.seed).await?;
            lock::force_release(ctx, &cluster, &all.online()).await?;
            info!("Command successful!");
            return Ok(());
        }
        Some(RepairMethod::Commit | RepairMethod::Rollback) | None => {}
    }

    let all = find_runtime_peers_status(ctx, &plan.seed).await?;
    warn_unreachable(&all);
    let online = all.online();
    let activated = activated_nodes(ctx, &online).await;
    if activated.is_empty() {
        return Err(ToolError::validation(
            "No activated node found. Repair command only works with activated nodes.",
        ));
    }
    if activated.len() != online.len() {
        let unconfigured: Vec<_> = online
            .endpoints()
            .filter(|e| !activated.contains(&e.node_uid))
            .cloned()
            .collect();
        let activated_list: Vec<_> = activated.endpoints().cloned().collect();
        warn!(
            "Some online nodes are not activated: {}. Automatic repair will only work against activated nodes: {}",
            join_endpoints(&unconfigured),
            join_endpoints(&activated_list)
        );
    }

    let analyzer = ConsistencyAnalyzer::analyze(ctx, &all).await;
    let Some(wanted) = decide(&analyzer, plan.forced)? else {
        return Ok(());
    };

    info!("Repairing configuration by running a {wanted}...");
    let forced_state = match wanted {
        RepairMethod::Rollback => ChangeRequestState::RolledBack,
        _ => ChangeRequestState::Committed,
    };
    let failures = FailureRecorder::new();
    ctx.nomad()
        .run_configuration_repair(&activated, all.len(), &failures, Some(forced_state))
        .await;
    failures.reraise()?;
    info!("Configuration is repaired.");
    info!("Command successful!");
    Ok(())
}

/// The remedy to run for the analyzed state, `None` when nothing is
/// needed.
fn decide(analyzer: &ConsistencyAnalyzer, forced: Option<RepairMethod>) -> ToolResult<Option<RepairMethod>> {
    let state = analyzer.state();
    let description = analyzer.description();
    let contradicts = |needed: RepairMethod, refused: RepairMethod, adjective: &str| {
        if forced == Some(refused) {
            Err(ToolError::validation(format!(
                "The configuration is {adjective}. A {needed} is needed. A {} cannot be executed.",
                refused.to_string().to_ascii_uppercase()
            )))
        } else {
            Ok(Some(needed))
        }
    };
    match state {
        ConsistencyState::AllAccepting | ConsistencyState::OnlineAccepting => {
            info!("{description}");
            Ok(None)
        }
        ConsistencyState::DiscoveryFailure
        | ConsistencyState::Inconsistent
        | ConsistencyState::Partitioned
        | ConsistencyState::ChangeInProgress
        | ConsistencyState::Unknown => {
            error!("{description}");
            Err(ToolError::Inconsistency {
                state: state.as_str().to_string(),
                description,
            })
        }
        ConsistencyState::AllPrepared => {
            info!("{description}");
            Ok(Some(forced.unwrap_or(RepairMethod::Commit)))
        }
        ConsistencyState::OnlinePrepared => {
            info!("{description}");
            match forced {
                Some(method) => Ok(Some(method)),
                None => Err(ToolError::validation(
                    "Please use the '-force' option to specify whether a commit or rollback is wanted.",
                )),
            }
        }
        ConsistencyState::PartiallyPrepared => {
            info!("{description}");
            contradicts(RepairMethod::Rollback, RepairMethod::Commit, "partially prepared")
        }
        ConsistencyState::PartiallyCommitted => {
            info!("{description}");
            contradicts(RepairMethod::Commit, RepairMethod::Rollback, "partially committed")
        }
        ConsistencyState::PartiallyRolledBack => {
            info!("{description}");
            contradicts(RepairMethod::Rollback, RepairMethod::Commit, "partially rolled back")
        }
    }
}

async fn activated_nodes(ctx: &OrchestrationContext, online: &NodeStates) -> NodeStates {
    let mut activated = NodeStates::new();
    for (endpoint, state) in online.iter() {
        match is_activated(ctx, &endpoint.address).await {
            Ok(true) => activated.insert(endpoint.clone(), state),
            Ok(false) => {}
            Err(e) => warn!("Unable to check activation of {endpoint}: {e}"),
        }
    }
    activated
}

fn warn_unreachable(all: &NodeStates) {
    let offline: Vec<_> = all
        .filter(|_, state| !state.is_online())
        .endpoints()
        .cloned()
        .collect();
    if !offline.is_empty() {
        warn!("Some nodes are not reachable: {}", join_endpoints(&offline));
    }
}
