//! Restart requests and restart confirmation.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dynconf_core::{join_endpoints, Endpoint, LogicalServerState};
use tracing::{info, warn};

use crate::config::ToolConfig;
use crate::connectivity::within;
use crate::error::{ToolError, ToolResult};
use crate::node_states::NodeStates;
use crate::progress::NodeProgress;
use crate::traits::{DiagnosticServiceProvider, RestartService};

/// States accepted after a plain restart.
pub const ACTIVE_OR_PASSIVE: &[LogicalServerState] = &[
    LogicalServerState::Active,
    LogicalServerState::ActiveReconnecting,
    LogicalServerState::Passive,
];

/// States accepted after restarting freshly activated nodes.
pub const ACTIVATION_ACCEPTED: &[LogicalServerState] = &[
    LogicalServerState::Active,
    LogicalServerState::ActiveReconnecting,
    LogicalServerState::ActiveSuspended,
    LogicalServerState::Passive,
    LogicalServerState::PassiveSuspended,
    LogicalServerState::Synchronizing,
];

#[derive(Debug, Clone, Copy)]
enum RestartKind {
    Always,
    IfActive,
    IfPassive,
}

/// [`RestartService`] that sends restart RPCs and polls the logical state
/// through the diagnostic service.
pub struct DiagnosticRestartService {
    diagnostics: Arc<dyn DiagnosticServiceProvider>,
    config: Arc<ToolConfig>,
}

impl DiagnosticRestartService {
    #[must_use]
    pub fn new(diagnostics: Arc<dyn DiagnosticServiceProvider>, config: Arc<ToolConfig>) -> Self {
        Self { diagnostics, config }
    }

    async fn restart(
        &self,
        endpoints: &[Endpoint],
        delay: Duration,
        accepted: &[LogicalServerState],
        kind: RestartKind,
    ) -> ToolResult<NodeProgress> {
        if delay < Duration::from_secs(1) {
            return Err(ToolError::validation("Restart delay must be at least 1 second"));
        }

        let mut requested = Vec::with_capacity(endpoints.len());
        let mut errors = Vec::new();
        for endpoint in endpoints {
            let sent = async {
                let service = within(
                    self.config.connection_timeout(),
                    "connection",
                    self.diagnostics.fetch(&endpoint.address),
                )
                .await?;
                let request = async {
                    match kind {
                        RestartKind::Always => service.restart(delay).await,
                        RestartKind::IfActive => service.restart_if_active(delay).await,
                        RestartKind::IfPassive => service.restart_if_passive(delay).await,
                    }
                };
                within(self.config.request_timeout(), "restart request", request).await
            }
            .await;
            match sent {
                Ok(()) => requested.push(endpoint.clone()),
                Err(e) => {
                    warn!("Failed asking node {endpoint} to restart: {e:#}");
                    errors.push((endpoint.clone(), format!("{e:#}")));
                }
            }
        }

        let diagnostics = Arc::clone(&self.diagnostics);
        let accepted: Arc<[LogicalServerState]> = Arc::from(accepted);
        Ok(NodeProgress::track(
            requested,
            errors,
            self.config.concurrency_for(endpoints.len()),
            delay + self.config.settle_grace(),
            self.config.poll_interval(),
            move |endpoint: Endpoint| {
                let diagnostics = Arc::clone(&diagnostics);
                let accepted = Arc::clone(&accepted);
                async move {
                    // errors while the node is down are expected
                    let service = diagnostics.fetch(&endpoint.address).await.ok()?;
                    let state = service.logical_server_state().await.ok()?;
                    accepted.contains(&state).then_some(state)
                }
            },
        ))
    }
}

#[async_trait]
impl RestartService for DiagnosticRestartService {
    async fn restart_nodes(
        &self,
        endpoints: &[Endpoint],
        delay: Duration,
        accepted: &[LogicalServerState],
    ) -> ToolResult<NodeProgress> {
        self.restart(endpoints, delay, accepted, RestartKind::Always).await
    }

    async fn restart_nodes_if_actives(
        &self,
        endpoints: &[Endpoint],
        delay: Duration,
        accepted: &[LogicalServerState],
    ) -> ToolResult<NodeProgress> {
        self.restart(endpoints, delay, accepted, RestartKind::IfActive).await
    }

    async fn restart_nodes_if_passives(
        &self,
        endpoints: &[Endpoint],
        delay: Duration,
        accepted: &[LogicalServerState],
    ) -> ToolResult<NodeProgress> {
        self.restart(endpoints, delay, accepted, RestartKind::IfPassive).await
    }
}

/// Waits for `progress`, warns about nodes that could not be contacted and
/// fails when some requested node did not come back in time.
///
/// # Errors
///
/// Returns [`ToolError::Incomplete`] listing the nodes that neither failed
/// to be contacted nor reached an accepted state.
pub async fn follow_restart(
    mut progress: NodeProgress,
    endpoints: &[Endpoint],
    wait: Duration,
) -> ToolResult<NodeStates> {
    let reached = progress.await_reached(wait).await;
    for (endpoint, _) in progress.errors() {
        warn!("Unable to ask node: {endpoint} to restart: please restart it manually.");
    }
    let failed: HashSet<&Endpoint> = progress.errors().iter().map(|(e, _)| e).collect();
    let missing: Vec<Endpoint> = endpoints
        .iter()
        .filter(|e| !failed.contains(e) && !reached.contains(&e.node_uid))
        .cloned()
        .collect();
    if !missing.is_empty() {
        return Err(ToolError::Incomplete {
            action: "restart",
            timeout_secs: wait.as_secs(),
            missing,
        });
    }
    if !reached.is_empty() {
        info!("Restarted nodes: {}", join_endpoints(reached.endpoints()));
    }
    Ok(reached)
}
