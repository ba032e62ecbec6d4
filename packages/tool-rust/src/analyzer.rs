//! Classification of the configuration log state across a cluster.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use dynconf_core::{
    join_endpoints, ChangeRequestState, DiscoverResponse, Endpoint, LockContext, LogicalServerState,
    NomadServerMode,
};
use parking_lot::Mutex;
use serde::Serialize;

use crate::context::OrchestrationContext;
use crate::node_states::NodeStates;
use crate::traits::DiscoverResultsReceiver;

/// Overall configuration consistency of a cluster. Derived, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsistencyState {
    AllAccepting,
    OnlineAccepting,
    AllPrepared,
    OnlinePrepared,
    PartiallyPrepared,
    PartiallyCommitted,
    PartiallyRolledBack,
    Inconsistent,
    Partitioned,
    DiscoveryFailure,
    ChangeInProgress,
    Unknown,
}

impl ConsistencyState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AllAccepting => "ALL_ACCEPTING",
            Self::OnlineAccepting => "ONLINE_ACCEPTING",
            Self::AllPrepared => "ALL_PREPARED",
            Self::OnlinePrepared => "ONLINE_PREPARED",
            Self::PartiallyPrepared => "PARTIALLY_PREPARED",
            Self::PartiallyCommitted => "PARTIALLY_COMMITTED",
            Self::PartiallyRolledBack => "PARTIALLY_ROLLED_BACK",
            Self::Inconsistent => "INCONSISTENT",
            Self::Partitioned => "PARTITIONED",
            Self::DiscoveryFailure => "DISCOVERY_FAILURE",
            Self::ChangeInProgress => "CHANGE_IN_PROGRESS",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// States where the configuration log accepts new changes.
    #[must_use]
    pub fn is_accepting(self) -> bool {
        matches!(self, Self::AllAccepting | Self::OnlineAccepting)
    }
}

impl fmt::Display for ConsistencyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
struct Inconsistency {
    change_uuid: String,
    committed: Vec<Endpoint>,
    rolled_back: Vec<Endpoint>,
}

#[derive(Debug, Clone)]
struct OtherClient {
    endpoint: Endpoint,
    host: String,
    user: String,
}

#[derive(Debug, Default)]
struct Collected {
    responses: Vec<(Endpoint, DiscoverResponse)>,
    failure: Option<(Endpoint, String)>,
    inconsistency: Option<Inconsistency>,
    partitions: Option<Vec<Vec<Endpoint>>>,
    other_client: Option<OtherClient>,
}

/// [`DiscoverResultsReceiver`] collecting discovery callbacks.
#[derive(Debug, Default)]
struct Collector {
    collected: Mutex<Collected>,
}

impl DiscoverResultsReceiver for Collector {
    fn discovered(&self, endpoint: &Endpoint, response: &DiscoverResponse) {
        self.collected
            .lock()
            .responses
            .push((endpoint.clone(), response.clone()));
    }

    fn discover_fail(&self, endpoint: &Endpoint, reason: &str) {
        self.collected.lock().failure = Some((endpoint.clone(), reason.to_string()));
    }

    fn discover_config_inconsistent(&self, change_uuid: &str, committed: &[Endpoint], rolled_back: &[Endpoint]) {
        self.collected.lock().inconsistency = Some(Inconsistency {
            change_uuid: change_uuid.to_string(),
            committed: committed.to_vec(),
            rolled_back: rolled_back.to_vec(),
        });
    }

    fn discover_config_partitioned(&self, partitions: &[Vec<Endpoint>]) {
        self.collected.lock().partitions = Some(partitions.to_vec());
    }

    fn discover_other_client(&self, endpoint: &Endpoint, host: &str, user: &str) {
        self.collected.lock().other_client = Some(OtherClient {
            endpoint: endpoint.clone(),
            host: host.to_string(),
            user: user.to_string(),
        });
    }
}

/// Outcome of a configuration discovery over every known node.
#[derive(Debug)]
pub struct ConsistencyAnalyzer {
    all_nodes: NodeStates,
    collected: Collected,
}

impl ConsistencyAnalyzer {
    /// Runs a discovery on the online subset of `all_nodes` and analyzes
    /// the responses.
    pub async fn analyze(ctx: &OrchestrationContext, all_nodes: &NodeStates) -> Self {
        let online = all_nodes.online();
        let collector = Collector::default();
        if !online.is_empty() {
            ctx.nomad()
                .run_configuration_discovery(&online, &collector)
                .await;
        }
        Self::from_collected(all_nodes.clone(), collector.collected.into_inner())
    }

    fn from_collected(all_nodes: NodeStates, mut collected: Collected) -> Self {
        if collected.inconsistency.is_none() {
            collected.inconsistency = derive_inconsistency(&collected.responses);
        }
        if collected.partitions.is_none() {
            collected.partitions = derive_partitions(&collected.responses);
        }
        Self { all_nodes, collected }
    }

    #[must_use]
    pub fn state(&self) -> ConsistencyState {
        let c = &self.collected;
        if c.failure.is_some() {
            return ConsistencyState::DiscoveryFailure;
        }
        if c.inconsistency.is_some() {
            return ConsistencyState::Inconsistent;
        }
        if c.partitions.is_some() {
            return ConsistencyState::Partitioned;
        }
        if c.other_client.is_some() {
            return ConsistencyState::ChangeInProgress;
        }
        if c.responses.is_empty() {
            return ConsistencyState::Unknown;
        }

        let all_online = self.online_node_count() >= self.node_count();
        let modes = || c.responses.iter().map(|(_, r)| r.mode);
        if modes().all(|m| m == NomadServerMode::Accepting) {
            return if all_online {
                ConsistencyState::AllAccepting
            } else {
                ConsistencyState::OnlineAccepting
            };
        }
        if modes().all(|m| m == NomadServerMode::Prepared) {
            return if all_online {
                ConsistencyState::AllPrepared
            } else {
                ConsistencyState::OnlinePrepared
            };
        }
        if self.is_partially_prepared() {
            return ConsistencyState::PartiallyPrepared;
        }

        let uuids: BTreeSet<Option<&str>> = c.responses.iter().map(|(_, r)| r.latest_change_uuid()).collect();
        if uuids.len() == 1 {
            let states: BTreeSet<&str> = c
                .responses
                .iter()
                .filter_map(|(_, r)| r.latest_change_state())
                .map(ChangeRequestState::as_str)
                .collect();
            let prepared = ChangeRequestState::Prepared.as_str();
            let committed = ChangeRequestState::Committed.as_str();
            let rolled_back = ChangeRequestState::RolledBack.as_str();
            if states == BTreeSet::from([prepared, committed]) {
                return ConsistencyState::PartiallyCommitted;
            }
            if states == BTreeSet::from([prepared, rolled_back]) {
                return ConsistencyState::PartiallyRolledBack;
            }
        }
        ConsistencyState::Unknown
    }

    /// Some nodes hold a prepared change that other nodes never received.
    fn is_partially_prepared(&self) -> bool {
        let prepared: BTreeSet<&str> = self
            .collected
            .responses
            .iter()
            .filter(|(_, r)| r.mode == NomadServerMode::Prepared)
            .filter_map(|(_, r)| r.latest_change_uuid())
            .collect();
        if prepared.len() != 1 {
            return false;
        }
        self.collected
            .responses
            .iter()
            .any(|(_, r)| !r.latest_change_uuid().is_some_and(|uuid| prepared.contains(uuid)))
    }

    /// Number of nodes known to the cluster, online or not.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.all_nodes.len()
    }

    /// Number of nodes that answered the discovery.
    #[must_use]
    pub fn online_node_count(&self) -> usize {
        self.collected.responses.len()
    }

    #[must_use]
    pub fn all_nodes(&self) -> &NodeStates {
        &self.all_nodes
    }

    #[must_use]
    pub fn response(&self, endpoint: &Endpoint) -> Option<&DiscoverResponse> {
        self.collected
            .responses
            .iter()
            .find(|(e, _)| e == endpoint)
            .map(|(_, r)| r)
    }

    fn responders(&self, predicate: impl Fn(LogicalServerState, &DiscoverResponse) -> bool) -> NodeStates {
        self.collected
            .responses
            .iter()
            .filter_map(|(endpoint, response)| {
                let state = self.all_nodes.get(&endpoint.node_uid).unwrap_or(LogicalServerState::Unknown);
                predicate(state, response).then(|| (endpoint.clone(), state))
            })
            .collect()
    }

    /// Nodes that answered the discovery.
    #[must_use]
    pub fn online_nodes(&self) -> NodeStates {
        self.responders(|_, _| true)
    }

    /// Actives and passives that have configuration changes.
    #[must_use]
    pub fn online_activated_nodes(&self) -> NodeStates {
        self.responders(|state, r| !state.is_starting() && r.latest_change.is_some())
    }

    /// Nodes started in diagnostic mode that already have changes.
    #[must_use]
    pub fn online_nodes_in_repair(&self) -> NodeStates {
        self.responders(|state, r| state.is_starting() && r.latest_change.is_some())
    }

    /// New nodes started in diagnostic mode without any change yet.
    #[must_use]
    pub fn online_nodes_in_configuration(&self) -> NodeStates {
        self.responders(|state, r| state.is_starting() && r.latest_change.is_none())
    }

    /// Lock held on the configuration, as seen by any latest change.
    #[must_use]
    pub fn lock_context(&self) -> Option<&LockContext> {
        self.collected
            .responses
            .iter()
            .find_map(|(_, r)| r.latest_change.as_ref())
            .and_then(|change| change.result.lock_context.as_ref())
    }

    fn locking_info(&self) -> String {
        match self.lock_context() {
            Some(lock) => format!("No changes are possible as config is locked by '{}'.", lock.owner_info()),
            None => "New configuration changes are possible.".to_string(),
        }
    }

    /// Operator-facing explanation of [`Self::state`].
    #[must_use]
    pub fn description(&self) -> String {
        let c = &self.collected;
        match self.state() {
            ConsistencyState::AllAccepting => format!(
                "The cluster configuration is healthy and all nodes are online. No repair needed. {}",
                self.locking_info()
            ),
            ConsistencyState::OnlineAccepting => format!(
                "The cluster configuration seems healthy (some nodes are unreachable). {}",
                self.locking_info()
            ),
            ConsistencyState::DiscoveryFailure => match &c.failure {
                Some((_, reason)) if !reason.is_empty() => {
                    format!("Failed to analyze cluster configuration. Reason: {reason}")
                }
                _ => "Failed to analyze cluster configuration.".to_string(),
            },
            ConsistencyState::ChangeInProgress => match &c.other_client {
                Some(other) => format!(
                    "Failed to analyze cluster configuration. Reason: a change is in progress: Host: {}, By: {}, On: {}",
                    other.host, other.user, other.endpoint
                ),
                None => "Failed to analyze cluster configuration. Reason: a change is in progress".to_string(),
            },
            ConsistencyState::Inconsistent => match &c.inconsistency {
                Some(i) => format!(
                    "Cluster configuration is inconsistent: Change {} is committed on {} and rolled back on {}",
                    i.change_uuid,
                    sorted_list(&i.committed),
                    sorted_list(&i.rolled_back)
                ),
                None => "Cluster configuration is inconsistent".to_string(),
            },
            ConsistencyState::Partitioned => {
                let groups: Vec<String> = c
                    .partitions
                    .iter()
                    .flatten()
                    .map(|group| sorted_list(group))
                    .collect();
                format!(
                    "Cluster configuration is partitioned and cannot be automatically repaired. \
                     Some nodes have a different configuration that others. Groups: | {} |",
                    groups.join(" | ")
                )
            }
            ConsistencyState::AllPrepared => "A new cluster configuration has been prepared on all nodes but not yet committed. \
                No further configuration change can be done until the 'repair' command is run to finalize the configuration change."
                .to_string(),
            ConsistencyState::OnlinePrepared => "A new cluster configuration has been prepared but not yet committed or rolled back on online nodes. \
                Some nodes are unreachable so we do not know if the last configuration change has been committed or rolled back on them. \
                No further configuration change can be done until the 'repair' command is run to finalize the configuration change. \
                If the unreachable nodes do not become available again, you might need to use the '-force' option to force a commit or rollback."
                .to_string(),
            ConsistencyState::PartiallyPrepared => "A new cluster configuration has been *partially* prepared (some nodes didn't get the new change). \
                No further configuration change can be done until the 'repair' command is run to rollback the prepared nodes."
                .to_string(),
            ConsistencyState::PartiallyCommitted => "A new cluster configuration has been *partially* committed (some nodes didn't commit). \
                No further configuration change can be done until the 'repair' command is run to commit all nodes."
                .to_string(),
            ConsistencyState::PartiallyRolledBack => "A new cluster configuration has been *partially* rolled back (some nodes didn't rollback). \
                No further configuration change can be done until the 'repair' command is run to rollback all nodes."
                .to_string(),
            ConsistencyState::Unknown => "Unable to determine the global configuration state. \
                There might be some configuration inconsistencies. Please look at each node details. \
                A manual intervention might be needed to reset some nodes."
                .to_string(),
        }
    }
}

fn sorted_list(endpoints: &[Endpoint]) -> String {
    let mut sorted = endpoints.to_vec();
    sorted.sort_by_key(ToString::to_string);
    join_endpoints(&sorted)
}

/// Same latest change committed on some nodes and rolled back on others.
fn derive_inconsistency(responses: &[(Endpoint, DiscoverResponse)]) -> Option<Inconsistency> {
    let mut by_uuid: BTreeMap<&str, (Vec<Endpoint>, Vec<Endpoint>)> = BTreeMap::new();
    for (endpoint, response) in responses {
        let Some(change) = &response.latest_change else {
            continue;
        };
        let entry = by_uuid.entry(change.change_uuid.as_str()).or_default();
        match change.state {
            ChangeRequestState::Committed => entry.0.push(endpoint.clone()),
            ChangeRequestState::RolledBack => entry.1.push(endpoint.clone()),
            ChangeRequestState::Prepared => {}
        }
    }
    by_uuid
        .into_iter()
        .find(|(_, (committed, rolled_back))| !committed.is_empty() && !rolled_back.is_empty())
        .map(|(uuid, (committed, rolled_back))| Inconsistency {
            change_uuid: uuid.to_string(),
            committed,
            rolled_back,
        })
}

/// Configured nodes grouped by latest change, when two of them disagree on
/// the change at the same version.
fn derive_partitions(responses: &[(Endpoint, DiscoverResponse)]) -> Option<Vec<Vec<Endpoint>>> {
    let mut by_version: BTreeMap<u64, BTreeSet<&str>> = BTreeMap::new();
    for (_, response) in responses {
        if let Some(change) = &response.latest_change {
            by_version.entry(change.version).or_default().insert(&change.change_uuid);
        }
    }
    if by_version.values().all(|uuids| uuids.len() <= 1) {
        return None;
    }
    let mut groups: BTreeMap<&str, Vec<Endpoint>> = BTreeMap::new();
    for (endpoint, response) in responses {
        if let Some(uuid) = response.latest_change_uuid() {
            groups.entry(uuid).or_default().push(endpoint.clone());
        }
    }
    Some(groups.into_values().collect())
}
