//! Read-only report of the cluster and configuration log state.

use std::fmt::{self, Write as _};

use chrono::{DateTime, Utc};
use dynconf_core::{ChangeRequestState, Endpoint, HostPort, LogicalServerState, NomadServerMode};
use serde::Serialize;
use tracing::warn;

use crate::analyzer::{ConsistencyAnalyzer, ConsistencyState};
use crate::connectivity::{has_incomplete_change, must_be_restarted};
use crate::context::OrchestrationContext;
use crate::discovery::find_runtime_peers_status;
use crate::error::ToolResult;
use crate::node_states::NodeStates;
use crate::topology::find_scaling_vetoer;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";

/// Nodes sharing one condition, sorted by their display form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeGroup {
    pub count: usize,
    pub nodes: Vec<String>,
}

impl NodeGroup {
    fn of(states: &NodeStates) -> Self {
        Self::from_endpoints(states.endpoints())
    }

    fn from_endpoints<'a>(endpoints: impl IntoIterator<Item = &'a Endpoint>) -> Self {
        let mut nodes: Vec<String> = endpoints.into_iter().map(ToString::to_string).collect();
        nodes.sort();
        Self {
            count: nodes.len(),
            nodes,
        }
    }

    fn contains(&self, endpoint: &Endpoint) -> bool {
        let name = endpoint.to_string();
        self.nodes.iter().any(|n| *n == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSummary {
    pub nodes: NodeGroup,
    pub online: NodeGroup,
    pub activated: NodeGroup,
    pub in_repair: NodeGroup,
    pub in_configuration: NodeGroup,
    pub pending_restart: NodeGroup,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Consistency {
    pub state: ConsistencyState,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LastChange {
    pub uuid: String,
    pub state: ChangeRequestState,
    pub created_at: DateTime<Utc>,
    pub created_from: String,
    pub created_by: String,
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LastMutation {
    pub at: Option<DateTime<Utc>>,
    pub from: Option<String>,
    pub by: Option<String>,
}

/// Details of one node. Fields past the flags are only filled for nodes
/// that answered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeReport {
    pub endpoint: String,
    pub state: LogicalServerState,
    pub activated: bool,
    pub in_repair: bool,
    pub in_configuration: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart_required: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_in_progress: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accepts_changes: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_version: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub highest_version: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_change: Option<LastChange>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_mutation: Option<LastMutation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticReport {
    pub cluster: ClusterSummary,
    pub consistency: Consistency,
    pub config_locked: bool,
    pub manual_intervention_required: bool,
    pub ready_for_topology_change: bool,
    pub scaling_denied: bool,
    pub nodes: Vec<NodeReport>,
}

impl DiagnosticReport {
    /// Pretty JSON rendering with camelCase keys.
    ///
    /// # Errors
    ///
    /// Fails only if a field cannot be serialized.
    pub fn to_json(&self) -> ToolResult<String> {
        Ok(serde_json::to_string_pretty(self).map_err(anyhow::Error::from)?)
    }
}

/// Collects the report of the cluster reached through `seed`.
///
/// # Errors
///
/// Fails when the seed's runtime cluster cannot be read.
pub async fn diagnose(ctx: &OrchestrationContext, seed: &HostPort) -> ToolResult<DiagnosticReport> {
    let all = find_runtime_peers_status(ctx, seed).await?;
    let analyzer = ConsistencyAnalyzer::analyze(ctx, &all).await;
    let online = analyzer.online_nodes();

    let mut pending = Vec::new();
    let mut incomplete = Vec::new();
    for endpoint in online.endpoints() {
        if probe(must_be_restarted(ctx, &endpoint.address).await, endpoint, "pending restart") {
            pending.push(endpoint.clone());
        }
        if probe(has_incomplete_change(ctx, &endpoint.address).await, endpoint, "incomplete change") {
            incomplete.push(endpoint.clone());
        }
    }

    let cluster = ClusterSummary {
        nodes: NodeGroup::of(&all),
        online: NodeGroup::of(&online),
        activated: NodeGroup::of(&analyzer.online_activated_nodes()),
        in_repair: NodeGroup::of(&analyzer.online_nodes_in_repair()),
        in_configuration: NodeGroup::of(&analyzer.online_nodes_in_configuration()),
        pending_restart: NodeGroup::from_endpoints(&pending),
    };

    let nodes = all
        .iter()
        .map(|(endpoint, state)| {
            let mut node = NodeReport {
                endpoint: endpoint.to_string(),
                state,
                activated: cluster.activated.contains(endpoint),
                in_repair: cluster.in_repair.contains(endpoint),
                in_configuration: cluster.in_configuration.contains(endpoint),
                restart_required: None,
                change_in_progress: None,
                accepts_changes: None,
                current_version: None,
                highest_version: None,
                last_change: None,
                last_mutation: None,
            };
            if online.contains(&endpoint.node_uid) {
                node.restart_required = Some(pending.contains(endpoint));
                node.change_in_progress = Some(incomplete.contains(endpoint));
            }
            if let Some(response) = analyzer.response(endpoint) {
                node.accepts_changes = Some(response.mode == NomadServerMode::Accepting);
                node.current_version = Some(response.current_version);
                node.highest_version = Some(response.highest_version);
                if let Some(change) = &response.latest_change {
                    node.last_change = Some(LastChange {
                        uuid: change.change_uuid.clone(),
                        state: change.state,
                        created_at: change.creation_timestamp,
                        created_from: change.creation_host.clone(),
                        created_by: change.creation_user.clone(),
                        summary: change.operation.summary(),
                    });
                    node.last_mutation = Some(LastMutation {
                        at: response.last_mutation_timestamp,
                        from: response.last_mutation_host.clone(),
                        by: response.last_mutation_user.clone(),
                    });
                }
            }
            node
        })
        .collect();

    let state = analyzer.state();
    let config_locked = analyzer.lock_context().is_some();
    Ok(DiagnosticReport {
        manual_intervention_required: matches!(
            state,
            ConsistencyState::Inconsistent | ConsistencyState::Partitioned | ConsistencyState::Unknown
        ) || cluster.in_repair.count > 0,
        ready_for_topology_change: state == ConsistencyState::AllAccepting
            && !config_locked
            && cluster.pending_restart.count == 0,
        scaling_denied: find_scaling_vetoer(ctx, &online).await.is_some(),
        config_locked,
        consistency: Consistency {
            state,
            description: analyzer.description(),
        },
        cluster,
        nodes,
    })
}

fn probe(answer: ToolResult<bool>, endpoint: &Endpoint, what: &str) -> bool {
    answer.unwrap_or_else(|e| {
        warn!("Unable to check {what} of {endpoint}: {e}");
        false
    })
}

fn yes_no(flag: bool) -> &'static str {
    if flag {
        "YES"
    } else {
        "NO"
    }
}

fn timestamp(at: &DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

fn group_line(out: &mut String, label: &str, group: &NodeGroup) -> fmt::Result {
    write!(out, " - {label}: {}", group.count)?;
    if !group.nodes.is_empty() {
        write!(out, " ({})", group.nodes.join(", "))?;
    }
    writeln!(out)
}

impl fmt::Display for DiagnosticReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        writeln!(out, "Diagnostic result:")?;
        writeln!(out)?;
        writeln!(out, "[Cluster]")?;
        let c = &self.cluster;
        group_line(&mut out, "Nodes", &c.nodes)?;
        group_line(&mut out, "Nodes online", &c.online)?;
        group_line(&mut out, "Nodes online, configured and activated", &c.activated)?;
        group_line(&mut out, "Nodes online, configured and in repair", &c.in_repair)?;
        group_line(&mut out, "Nodes online, new and being configured", &c.in_configuration)?;
        group_line(&mut out, "Nodes pending restart", &c.pending_restart)?;
        writeln!(out, " - Configuration state: {}", self.consistency.description)?;
        writeln!(out, " - Configuration locked: {}", yes_no(self.config_locked))?;
        writeln!(out, " - Manual intervention required: {}", yes_no(self.manual_intervention_required))?;
        writeln!(out, " - Ready for topology change: {}", yes_no(self.ready_for_topology_change))?;
        writeln!(out, " - Scaling denied: {}", yes_no(self.scaling_denied))?;

        for node in &self.nodes {
            writeln!(out, "[{}]", node.endpoint)?;
            writeln!(out, " - Node state: {}", node.state)?;
            writeln!(out, " - Node online, configured and activated: {}", yes_no(node.activated))?;
            writeln!(out, " - Node online, configured and in repair: {}", yes_no(node.in_repair))?;
            writeln!(out, " - Node online, new and being configured: {}", yes_no(node.in_configuration))?;
            if let Some(flag) = node.restart_required {
                writeln!(out, " - Node restart required: {}", yes_no(flag))?;
            }
            if let Some(flag) = node.change_in_progress {
                writeln!(out, " - Node configuration change in progress: {}", yes_no(flag))?;
            }
            if let Some(flag) = node.accepts_changes {
                writeln!(out, " - Node can accept new changes: {}", yes_no(flag))?;
            }
            if let (Some(current), Some(highest)) = (node.current_version, node.highest_version) {
                writeln!(out, " - Node current configuration version: {current}")?;
                writeln!(out, " - Node highest configuration version: {highest}")?;
            }
            if let Some(change) = &node.last_change {
                writeln!(out, " - Node last configuration change UUID: {}", change.uuid)?;
                writeln!(out, " - Node last configuration state: {}", change.state.as_str())?;
                writeln!(out, " - Node last configuration created at: {}", timestamp(&change.created_at))?;
                writeln!(out, " - Node last configuration created from: {}", change.created_from)?;
                writeln!(out, " - Node last configuration created by: {}", change.created_by)?;
                writeln!(out, " - Node last configuration change details: {}", change.summary)?;
            }
            if let Some(mutation) = &node.last_mutation {
                let at = mutation.at.as_ref().map_or_else(String::new, timestamp);
                writeln!(out, " - Node last mutation at: {at}")?;
                writeln!(out, " - Node last mutation from: {}", mutation.from.as_deref().unwrap_or_default())?;
                writeln!(out, " - Node last mutation by: {}", mutation.by.as_deref().unwrap_or_default())?;
            }
        }
        f.write_str(&out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock;
    use crate::testing::SimCluster;

    #[tokio::test]
    async fn healthy_cluster_is_ready() {
        let sim = SimCluster::activated_one_stripe(&["a", "b"]);
        let report = diagnose(&sim.context(), &sim.address("a")).await.unwrap();
        assert_eq!(report.consistency.state, ConsistencyState::AllAccepting);
        assert_eq!(report.cluster.nodes.count, 2);
        assert_eq!(report.cluster.activated.count, 2);
        assert!(report.ready_for_topology_change);
        assert!(!report.manual_intervention_required);
        assert_eq!(report.nodes[0].state, LogicalServerState::Active);
        assert_eq!(report.nodes[1].accepts_changes, Some(true));
    }

    #[tokio::test]
    async fn offline_and_pending_nodes_block_topology_changes() {
        let sim = SimCluster::activated_one_stripe(&["a", "b", "c"]);
        sim.update("b", |n| n.must_restart = true);
        sim.update("c", |n| n.reachable = false);
        let report = diagnose(&sim.context(), &sim.address("a")).await.unwrap();
        assert_eq!(report.consistency.state, ConsistencyState::OnlineAccepting);
        assert_eq!(report.cluster.online.count, 2);
        assert_eq!(report.cluster.pending_restart.nodes, vec![sim.endpoint("b").to_string()]);
        assert!(!report.ready_for_topology_change);

        let c = &report.nodes[2];
        assert_eq!(c.state, LogicalServerState::Unreachable);
        assert_eq!(c.restart_required, None);
        assert!(c.last_change.is_none());
    }

    #[tokio::test]
    async fn lock_and_scaling_veto_are_reported() {
        let sim = SimCluster::activated_one_stripe(&["a", "b"]);
        let ctx = sim.context();
        lock::lock_cluster(&ctx, &sim.address("a"), None, "maintenance").await.unwrap();
        sim.update("b", |n| n.scaling_denied = true);
        let report = diagnose(&ctx, &sim.address("a")).await.unwrap();
        assert!(report.config_locked);
        assert!(report.scaling_denied);
        assert!(!report.ready_for_topology_change);
    }

    #[tokio::test]
    async fn text_and_json_renderings() {
        let sim = SimCluster::activated_one_stripe(&["a"]);
        let report = diagnose(&sim.context(), &sim.address("a")).await.unwrap();
        let endpoint = sim.endpoint("a");

        let text = report.to_string();
        assert!(text.contains("[Cluster]\n - Nodes: 1 ("));
        assert!(text.contains(&format!("[{endpoint}]\n - Node state: ACTIVE")));
        assert!(text.contains(" - Node can accept new changes: YES"));
        assert!(text.contains(" - Node last configuration created at: 2026-03-04T05:06:07.000"));

        let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(json["consistency"]["state"], "ALL_ACCEPTING");
        assert_eq!(json["readyForTopologyChange"], true);
        assert_eq!(json["nodes"][0]["lastChange"]["state"], "COMMITTED");
        assert!(json["nodes"][0].get("inRepair").is_some());
    }
}
