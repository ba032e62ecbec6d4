//! In-memory cluster implementing every collaborator trait.
//!
//! Nodes are keyed by a short label that doubles as their hostname. Every
//! remote call is appended to a call log as `"<op> <label>"`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use dynconf_core::names::{default_node_name, default_stripe_name};
use dynconf_core::{
    AddressGroup, ChangeDetails, ChangeRequestState, Cluster, DiscoverResponse, Endpoint, FailoverPriority,
    HostPort, LogicalServerState, Node, NodeContext, NomadChange, NomadChangeInfo, NomadServerMode,
    Requirement, Stripe, Uid,
};
use parking_lot::Mutex;

use crate::config::ToolConfig;
use crate::context::OrchestrationContext;
use crate::failures::FailureRecorder;
use crate::node_states::NodeStates;
use crate::traits::{DiagnosticService, DiagnosticServiceProvider, DiscoverResultsReceiver, NomadManager};

#[derive(Debug, Clone)]
pub(crate) struct SimNode {
    pub label: String,
    pub address: HostPort,
    pub node_uid: Uid,
    pub upcoming: Cluster,
    pub runtime: Cluster,
    pub state: LogicalServerState,
    pub state_after_restart: LogicalServerState,
    pub activated: bool,
    pub must_restart: bool,
    pub incomplete: bool,
    pub scaling_denied: bool,
    pub reachable: bool,
    pub history: Vec<NomadChangeInfo>,
    pub license: Option<String>,
    pub discovery: Option<DiscoverResponse>,
    pub stall: Option<Stall>,
}

/// Where a simulated node stops answering without failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stall {
    Connect,
    Request,
}

/// Longer than any timeout a test configures.
const STALL: Duration = Duration::from_secs(24 * 3600);

impl SimNode {
    /// Takes `cluster` as upcoming, along with the identity it assigns to
    /// this node's address.
    fn adopt(&mut self, cluster: &Cluster) {
        if let Some(node) = cluster.node_by_address(&self.address) {
            self.node_uid = node.uid.clone();
        }
        self.upcoming = cluster.clone();
    }

    fn restart(&mut self) {
        self.state = self.state_after_restart;
        self.must_restart = false;
        self.runtime = self.upcoming.clone();
    }
}

#[derive(Debug, Default)]
struct SimState {
    nodes: Vec<SimNode>,
    calls: Vec<String>,
    submitted: Vec<NomadChange>,
    repairs: Vec<(Vec<String>, Option<ChangeRequestState>)>,
    change_failure: Option<String>,
    activation_failure: Option<String>,
}

impl SimState {
    fn index_by_address(&self, address: &HostPort) -> Option<usize> {
        self.nodes.iter().position(|n| n.address == *address)
    }

    fn index_by_uid(&self, uid: &Uid) -> Option<usize> {
        self.nodes.iter().position(|n| n.node_uid == *uid)
    }

    fn log(&mut self, op: &str, label: &str) {
        self.calls.push(format!("{op} {label}"));
    }
}

/// Shared handle on a simulated set of nodes.
#[derive(Debug, Clone, Default)]
pub(crate) struct SimCluster {
    state: Arc<Mutex<SimState>>,
}

impl SimCluster {
    /// Registers every node of `cluster`. Activated stripes get their first
    /// node active and the others passive; otherwise nodes are starting in
    /// diagnostic mode.
    pub fn add_cluster(&self, cluster: &Cluster, activated: bool) {
        let mut state = self.state.lock();
        for stripe in &cluster.stripes {
            for (i, node) in stripe.nodes.iter().enumerate() {
                let logical = match (activated, i) {
                    (true, 0) => LogicalServerState::Active,
                    (true, _) => LogicalServerState::Passive,
                    (false, _) => LogicalServerState::Starting,
                };
                state.nodes.push(SimNode {
                    label: node.hostname.clone(),
                    address: node.internal_address(),
                    node_uid: node.uid.clone(),
                    upcoming: cluster.clone(),
                    runtime: cluster.clone(),
                    state: logical,
                    state_after_restart: if activated { logical } else { LogicalServerState::Passive },
                    activated,
                    must_restart: false,
                    incomplete: false,
                    scaling_denied: false,
                    reachable: true,
                    history: Vec::new(),
                    license: activated.then(|| "license".to_string()),
                    discovery: None,
                    stall: None,
                });
            }
        }
    }

    /// Activated cluster `main` whose stripes hold the given node labels.
    pub fn activated(stripes: &[&[&str]]) -> Self {
        let stripes = stripes
            .iter()
            .enumerate()
            .map(|(i, labels)| {
                let nodes = labels.iter().map(|l| Node::with_defaults(*l, *l)).collect();
                Stripe::new(format!("s{}", i + 1), nodes)
            })
            .collect();
        let mut cluster = Cluster::new(Some("main".into()), stripes);
        cluster.failover_priority = Some(FailoverPriority::Availability);
        let sim = Self::default();
        sim.add_cluster(&cluster, true);
        sim
    }

    pub fn activated_one_stripe(labels: &[&str]) -> Self {
        Self::activated(&[labels])
    }

    pub fn two_by_two() -> Self {
        Self::activated(&[&["a", "b"], &["c", "d"]])
    }

    /// Adds a freshly started single-stripe cluster with generated names.
    pub fn add_unconfigured(&self, labels: &[&str]) -> Cluster {
        let nodes = labels
            .iter()
            .map(|l| {
                let mut node = Node::with_defaults("", *l);
                node.name = default_node_name(&node.uid);
                node
            })
            .collect();
        let mut stripe = Stripe::new("", nodes);
        stripe.name = default_stripe_name(&stripe.uid);
        let cluster = Cluster::new(None, vec![stripe]);
        self.add_cluster(&cluster, false);
        cluster
    }

    pub fn provider(&self) -> Arc<dyn DiagnosticServiceProvider> {
        Arc::new(SimProvider { sim: self.clone() })
    }

    pub fn nomad(&self) -> Arc<dyn NomadManager> {
        Arc::new(SimNomad { sim: self.clone() })
    }

    pub fn context(&self) -> OrchestrationContext {
        self.context_with(ToolConfig::default())
    }

    pub fn context_with(&self, config: ToolConfig) -> OrchestrationContext {
        OrchestrationContext::with_diagnostic_services(self.provider(), self.nomad(), Arc::new(config))
    }

    pub fn node(&self, label: &str) -> SimNode {
        self.state
            .lock()
            .nodes
            .iter()
            .find(|n| n.label == label)
            .cloned()
            .unwrap_or_else(|| panic!("no simulated node {label}"))
    }

    pub fn update(&self, label: &str, f: impl FnOnce(&mut SimNode)) {
        let mut state = self.state.lock();
        let node = state
            .nodes
            .iter_mut()
            .find(|n| n.label == label)
            .unwrap_or_else(|| panic!("no simulated node {label}"));
        f(node);
    }

    pub fn address(&self, label: &str) -> HostPort {
        self.node(label).address
    }

    pub fn endpoint(&self, label: &str) -> Endpoint {
        let node = self.node(label);
        node.runtime
            .node(&node.node_uid)
            .or_else(|| node.upcoming.node(&node.node_uid))
            .map_or_else(
                || Endpoint::new(node.node_uid.clone(), label, node.address.clone(), AddressGroup::Internal),
                Node::internal_endpoint,
            )
    }

    pub fn endpoints(&self) -> Vec<Endpoint> {
        let labels: Vec<String> = self.state.lock().nodes.iter().map(|n| n.label.clone()).collect();
        labels.iter().map(|l| self.endpoint(l)).collect()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    /// Number of logged calls of `op`.
    pub fn count(&self, op: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.split(' ').next() == Some(op))
            .count()
    }

    pub fn submitted(&self) -> Vec<NomadChange> {
        self.state.lock().submitted.clone()
    }

    pub fn repairs(&self) -> Vec<(Vec<String>, Option<ChangeRequestState>)> {
        self.state.lock().repairs.clone()
    }

    pub fn fail_changes(&self, reason: &str) {
        self.state.lock().change_failure = Some(reason.to_string());
    }

    pub fn fail_activation(&self, reason: &str) {
        self.state.lock().activation_failure = Some(reason.to_string());
    }
}

pub(crate) fn accepting() -> DiscoverResponse {
    DiscoverResponse {
        mode: NomadServerMode::Accepting,
        mutative_message_count: 0,
        last_mutation_host: None,
        last_mutation_user: None,
        last_mutation_timestamp: None,
        current_version: 0,
        highest_version: 0,
        latest_change: None,
    }
}

pub(crate) fn with_change(
    mut response: DiscoverResponse,
    uuid: &str,
    state: ChangeRequestState,
    version: u64,
    result: &Cluster,
) -> DiscoverResponse {
    let at = Utc.with_ymd_and_hms(2026, 3, 4, 5, 6, 7).single();
    response.current_version = version;
    response.highest_version = version;
    response.mutative_message_count = version;
    response.last_mutation_host = Some("ops-host".into());
    response.last_mutation_user = Some("ops".into());
    response.last_mutation_timestamp = at;
    response.latest_change = at.map(|creation_timestamp| ChangeDetails {
        change_uuid: uuid.to_string(),
        state,
        version,
        operation: NomadChange::cluster_activation(result.clone()),
        result: result.clone(),
        result_hash: format!("hash-{version}"),
        creation_host: "ops-host".into(),
        creation_user: "ops".into(),
        creation_timestamp,
    });
    response
}

pub(crate) fn prepared_on(uuid: &str, version: u64, result: &Cluster) -> DiscoverResponse {
    let mut response = with_change(accepting(), uuid, ChangeRequestState::Prepared, version, result);
    response.mode = NomadServerMode::Prepared;
    response
}

fn default_response(node: &SimNode) -> DiscoverResponse {
    if node.activated {
        let version = u64::try_from(node.history.len().max(1)).unwrap_or(1);
        with_change(accepting(), "activation", ChangeRequestState::Committed, version, &node.runtime)
    } else {
        accepting()
    }
}

struct SimProvider {
    sim: SimCluster,
}

#[async_trait]
impl DiagnosticServiceProvider for SimProvider {
    async fn fetch(&self, address: &HostPort) -> anyhow::Result<Arc<dyn DiagnosticService>> {
        let stall = {
            let state = self.sim.state.lock();
            let index = state
                .index_by_address(address)
                .ok_or_else(|| anyhow::anyhow!("unknown host {address}"))?;
            anyhow::ensure!(state.nodes[index].reachable, "connection refused: {address}");
            state.nodes[index].stall
        };
        if stall == Some(Stall::Connect) {
            tokio::time::sleep(STALL).await;
        }
        Ok(Arc::new(SimDiagnostic {
            sim: self.sim.clone(),
            address: address.clone(),
        }))
    }
}

struct SimDiagnostic {
    sim: SimCluster,
    address: HostPort,
}

impl SimDiagnostic {
    async fn call<T: Send>(
        &self,
        op: &str,
        f: impl FnOnce(&mut SimNode) -> anyhow::Result<T> + Send,
    ) -> anyhow::Result<T> {
        let stall = {
            let state = self.sim.state.lock();
            state.index_by_address(&self.address).and_then(|i| state.nodes[i].stall)
        };
        if stall == Some(Stall::Request) {
            tokio::time::sleep(STALL).await;
        }
        let mut state = self.sim.state.lock();
        let index = state
            .index_by_address(&self.address)
            .ok_or_else(|| anyhow::anyhow!("unknown host {}", self.address))?;
        anyhow::ensure!(state.nodes[index].reachable, "connection reset: {}", self.address);
        let label = state.nodes[index].label.clone();
        state.log(op, &label);
        f(&mut state.nodes[index])
    }
}

#[async_trait]
impl DiagnosticService for SimDiagnostic {
    async fn logical_server_state(&self) -> anyhow::Result<LogicalServerState> {
        self.call("state", |n| Ok(n.state)).await
    }

    async fn upcoming_node_context(&self) -> anyhow::Result<NodeContext> {
        self.call("upcoming", |n| Ok(NodeContext::new(n.upcoming.clone(), n.node_uid.clone())?)).await
    }

    async fn runtime_node_context(&self) -> anyhow::Result<NodeContext> {
        self.call("runtime", |n| Ok(NodeContext::new(n.runtime.clone(), n.node_uid.clone())?)).await
    }

    async fn is_activated(&self) -> anyhow::Result<bool> {
        self.call("is_activated", |n| Ok(n.activated)).await
    }

    async fn must_be_restarted(&self) -> anyhow::Result<bool> {
        self.call("must_be_restarted", |n| Ok(n.must_restart)).await
    }

    async fn has_incomplete_change(&self) -> anyhow::Result<bool> {
        self.call("has_incomplete_change", |n| Ok(n.incomplete)).await
    }

    async fn is_scaling_denied(&self) -> anyhow::Result<bool> {
        self.call("is_scaling_denied", |n| Ok(n.scaling_denied)).await
    }

    async fn change_history(&self) -> anyhow::Result<Vec<NomadChangeInfo>> {
        self.call("change_history", |n| Ok(n.history.clone())).await
    }

    async fn set_upcoming_cluster(&self, cluster: &Cluster) -> anyhow::Result<()> {
        self.call("set_upcoming", |n| {
            n.adopt(cluster);
            Ok(())
        })
        .await
    }

    async fn activate(&self, cluster: &Cluster, license: Option<&str>) -> anyhow::Result<()> {
        self.call("activate", |n| {
            n.activated = true;
            n.adopt(cluster);
            n.license = license.map(ToString::to_string);
            Ok(())
        })
        .await
    }

    async fn reset(&self) -> anyhow::Result<()> {
        self.call("reset", |n| {
            n.activated = false;
            n.history.clear();
            Ok(())
        })
        .await
    }

    async fn reset_and_sync(&self, history: &[NomadChangeInfo], cluster: &Cluster) -> anyhow::Result<()> {
        self.call("reset_and_sync", |n| {
            n.history = history.to_vec();
            n.upcoming = cluster.clone();
            Ok(())
        })
        .await
    }

    async fn license_content(&self) -> anyhow::Result<Option<String>> {
        self.call("license", |n| Ok(n.license.clone())).await
    }

    async fn upgrade_license(&self, license: &str) -> anyhow::Result<()> {
        self.call("upgrade_license", |n| {
            n.license = Some(license.to_string());
            Ok(())
        })
        .await
    }

    async fn restart(&self, _delay: Duration) -> anyhow::Result<()> {
        self.call("restart", |n| {
            n.restart();
            Ok(())
        })
        .await
    }

    async fn restart_if_active(&self, _delay: Duration) -> anyhow::Result<()> {
        self.call("restart_if_active", |n| {
            if n.state.is_active() {
                n.restart();
            }
            Ok(())
        })
        .await
    }

    async fn restart_if_passive(&self, _delay: Duration) -> anyhow::Result<()> {
        self.call("restart_if_passive", |n| {
            if n.state.is_passive() {
                n.restart();
            }
            Ok(())
        })
        .await
    }

    async fn stop(&self, _delay: Duration) -> anyhow::Result<()> {
        self.call("stop", |n| {
            n.reachable = false;
            n.state = LogicalServerState::Unreachable;
            Ok(())
        })
        .await
    }
}

struct SimNomad {
    sim: SimCluster,
}

#[async_trait]
impl NomadManager for SimNomad {
    async fn run_configuration_discovery(&self, nodes: &NodeStates, receiver: &dyn DiscoverResultsReceiver) {
        let answers: Vec<(Endpoint, Option<DiscoverResponse>)> = {
            let mut state = self.sim.state.lock();
            nodes
                .endpoints()
                .map(|endpoint| {
                    let (label, answer) = match state.index_by_uid(&endpoint.node_uid) {
                        Some(i) => {
                            let node = &state.nodes[i];
                            let answer = node
                                .reachable
                                .then(|| node.discovery.clone().unwrap_or_else(|| default_response(node)));
                            (node.label.clone(), answer)
                        }
                        None => (endpoint.node_name.clone(), None),
                    };
                    state.log("discover", &label);
                    (endpoint.clone(), answer)
                })
                .collect()
        };
        for (endpoint, answer) in answers {
            match answer {
                Some(response) => receiver.discovered(&endpoint, &response),
                None => receiver.discover_fail(&endpoint, "node unreachable"),
            }
        }
    }

    async fn run_configuration_change(
        &self,
        _destination: &Cluster,
        nodes: &NodeStates,
        change: &NomadChange,
        failures: &FailureRecorder,
    ) {
        let mut state = self.sim.state.lock();
        state.log("change", &change.summary());
        state.submitted.push(change.clone());
        if let Some(reason) = state.change_failure.clone() {
            failures.add(reason);
            return;
        }
        let needs_restart = match change.inner() {
            NomadChange::MultiSetting { changes, .. } => changes.iter().any(|c| {
                c.setting.requires(Requirement::NodeRestart) || c.setting.requires(Requirement::ClusterRestart)
            }),
            _ => false,
        };
        let result = change.result_cluster().clone();
        for endpoint in nodes.endpoints() {
            let Some(index) = state.index_by_uid(&endpoint.node_uid) else {
                continue;
            };
            let node = &mut state.nodes[index];
            if !node.reachable {
                continue;
            }
            node.upcoming = result.clone();
            if needs_restart {
                node.must_restart = true;
            } else {
                node.runtime = result.clone();
            }
        }
    }

    async fn run_configuration_repair(
        &self,
        nodes: &NodeStates,
        _total_node_count: usize,
        _failures: &FailureRecorder,
        forced: Option<ChangeRequestState>,
    ) {
        let mut state = self.sim.state.lock();
        let names: Vec<String> = nodes.endpoints().map(|e| e.node_name.clone()).collect();
        state.log("repair", &names.join(","));
        state.repairs.push((names, forced));
    }

    async fn run_cluster_activation(&self, nodes: &[Endpoint], _cluster: &Cluster, failures: &FailureRecorder) {
        let mut state = self.sim.state.lock();
        for endpoint in nodes {
            state.log("cluster_activation", &endpoint.node_name);
        }
        if let Some(reason) = state.activation_failure.clone() {
            failures.add(reason);
            return;
        }
        for endpoint in nodes {
            if let Some(index) = state.index_by_uid(&endpoint.node_uid) {
                let node = &mut state.nodes[index];
                node.runtime = node.upcoming.clone();
            }
        }
    }
}
