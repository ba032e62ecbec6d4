use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dynconf_core::{
    ChangeRequestState, Cluster, DiscoverResponse, Endpoint, HostPort, LogicalServerState,
    NodeContext, NomadChange, NomadChangeInfo,
};

use crate::error::ToolResult;
use crate::failures::FailureRecorder;
use crate::node_states::NodeStates;
use crate::progress::NodeProgress;

/// Diagnostic RPCs exposed by a single node.
/// Implementations: the wire transport (external), in-memory simulation (tests).
#[async_trait]
pub trait DiagnosticService: Send + Sync {
    /// Current role or health of the node.
    async fn logical_server_state(&self) -> anyhow::Result<LogicalServerState>;

    /// Cluster the node will run after its next restart or pending change.
    async fn upcoming_node_context(&self) -> anyhow::Result<NodeContext>;

    /// Cluster the node runs now.
    async fn runtime_node_context(&self) -> anyhow::Result<NodeContext>;

    /// Whether the node has an activated configuration log.
    async fn is_activated(&self) -> anyhow::Result<bool>;

    /// Whether a committed change only takes effect after a restart.
    async fn must_be_restarted(&self) -> anyhow::Result<bool>;

    /// Whether the configuration log holds a prepared change.
    async fn has_incomplete_change(&self) -> anyhow::Result<bool>;

    /// Whether the node currently vetoes scaling operations.
    async fn is_scaling_denied(&self) -> anyhow::Result<bool>;

    /// Full change history of the configuration log.
    async fn change_history(&self) -> anyhow::Result<Vec<NomadChangeInfo>>;

    /// Replace the upcoming cluster of a node that is not activated.
    async fn set_upcoming_cluster(&self, cluster: &Cluster) -> anyhow::Result<()>;

    /// Activate the configuration log with `cluster`.
    async fn activate(&self, cluster: &Cluster, license: Option<&str>) -> anyhow::Result<()>;

    /// Drop the configuration log and return to diagnostic mode.
    async fn reset(&self) -> anyhow::Result<()>;

    /// Reset the log and replay `history`, ending at `cluster`.
    async fn reset_and_sync(&self, history: &[NomadChangeInfo], cluster: &Cluster) -> anyhow::Result<()>;

    async fn license_content(&self) -> anyhow::Result<Option<String>>;

    /// Replace the installed license.
    async fn upgrade_license(&self, license: &str) -> anyhow::Result<()>;

    async fn restart(&self, delay: Duration) -> anyhow::Result<()>;

    /// Restart only if the node is currently active.
    async fn restart_if_active(&self, delay: Duration) -> anyhow::Result<()>;

    /// Restart only if the node is currently passive.
    async fn restart_if_passive(&self, delay: Duration) -> anyhow::Result<()>;

    async fn stop(&self, delay: Duration) -> anyhow::Result<()>;
}

/// Opens short-lived diagnostic connections.
#[async_trait]
pub trait DiagnosticServiceProvider: Send + Sync {
    /// Connect to the diagnostic service at `address`.
    async fn fetch(&self, address: &HostPort) -> anyhow::Result<Arc<dyn DiagnosticService>>;
}

/// Callbacks of a configuration discovery.
///
/// The protocol may call these from several tasks; implementations use
/// interior mutability.
pub trait DiscoverResultsReceiver: Send + Sync {
    fn discovered(&self, endpoint: &Endpoint, response: &DiscoverResponse);

    fn discover_fail(&self, endpoint: &Endpoint, reason: &str);

    /// The same change is committed on some nodes and rolled back on others.
    fn discover_config_inconsistent(
        &self,
        change_uuid: &str,
        committed: &[Endpoint],
        rolled_back: &[Endpoint],
    );

    /// Nodes disagree on the configuration history.
    fn discover_config_partitioned(&self, partitions: &[Vec<Endpoint>]);

    /// Another client holds a mutative session on `endpoint`.
    fn discover_other_client(&self, endpoint: &Endpoint, host: &str, user: &str);
}

/// Two-phase-commit configuration log operations spanning several nodes.
///
/// Failures on individual peers are recorded into the given
/// [`FailureRecorder`]; the caller decides when to raise them.
#[async_trait]
pub trait NomadManager: Send + Sync {
    async fn run_configuration_discovery(&self, nodes: &NodeStates, receiver: &dyn DiscoverResultsReceiver);

    /// Prepare and commit `change` on `nodes`, in the order given.
    async fn run_configuration_change(
        &self,
        destination: &Cluster,
        nodes: &NodeStates,
        change: &NomadChange,
        failures: &FailureRecorder,
    );

    /// Commit or roll back the prepared change. `forced` overrides the
    /// protocol's own decision.
    async fn run_configuration_repair(
        &self,
        nodes: &NodeStates,
        total_node_count: usize,
        failures: &FailureRecorder,
        forced: Option<ChangeRequestState>,
    );

    async fn run_cluster_activation(&self, nodes: &[Endpoint], cluster: &Cluster, failures: &FailureRecorder);
}

/// Sends restart requests and tracks nodes coming back.
#[async_trait]
pub trait RestartService: Send + Sync {
    async fn restart_nodes(
        &self,
        endpoints: &[Endpoint],
        delay: Duration,
        accepted: &[LogicalServerState],
    ) -> ToolResult<NodeProgress>;

    async fn restart_nodes_if_actives(
        &self,
        endpoints: &[Endpoint],
        delay: Duration,
        accepted: &[LogicalServerState],
    ) -> ToolResult<NodeProgress>;

    async fn restart_nodes_if_passives(
        &self,
        endpoints: &[Endpoint],
        delay: Duration,
        accepted: &[LogicalServerState],
    ) -> ToolResult<NodeProgress>;
}

/// Sends stop requests and tracks nodes going away.
#[async_trait]
pub trait StopService: Send + Sync {
    async fn stop_nodes(&self, endpoints: &[Endpoint], delay: Duration) -> ToolResult<NodeProgress>;
}
