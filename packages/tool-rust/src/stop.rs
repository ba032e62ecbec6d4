//! Stop requests and stop confirmation.

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
use crate::traits::{DiagnosticServiceProvider, StopService};

/// [`StopService`] that sends stop RPCs and treats a node as stopped once
/// its diagnostic service no longer answers.
pub struct DiagnosticStopService {
    diagnostics: Arc<dyn DiagnosticServiceProvider>,
    config: Arc<ToolConfig>,
}

impl DiagnosticStopService {
    #[must_use]
    pub fn new(diagnostics: Arc<dyn DiagnosticServiceProvider>, config: Arc<ToolConfig>) -> Self {
        Self { diagnostics, config }
    }
}

#[async_trait]
impl StopService for DiagnosticStopService {
    async fn stop_nodes(&self, endpoints: &[Endpoint], delay: Duration) -> ToolResult<NodeProgress> {
        if delay < Duration::from_secs(1) {
            return Err(ToolError::validation("Stop delay must be at least 1 second"));
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
                within(self.config.request_timeout(), "stop request", service.stop(delay)).await
            }
            .await;
            match sent {
                Ok(()) => requested.push(endpoint.clone()),
                Err(e) => {
                    warn!("Failed asking node {endpoint} to stop: {e:#}");
                    errors.push((endpoint.clone(), format!("{e:#}")));
                }
            }
        }

        let diagnostics = Arc::clone(&self.diagnostics);
        Ok(NodeProgress::track(
            requested,
            errors,
            self.config.concurrency_for(endpoints.len()),
            delay + self.config.settle_grace(),
            self.config.poll_interval(),
            move |endpoint: Endpoint| {
                let diagnostics = Arc::clone(&diagnostics);
                async move {
                    let Ok(service) = diagnostics.fetch(&endpoint.address).await else {
                        return Some(LogicalServerState::Unreachable);
                    };
                    match service.logical_server_state().await {
                        Err(_) | Ok(LogicalServerState::Unreachable) => Some(LogicalServerState::Unreachable),
                        Ok(_) => None,
                    }
                }
            },
        ))
    }
}

/// Waits for `progress` and fails when some requested node is still up.
///
/// # Errors
///
/// Returns [`ToolError::Incomplete`] listing the nodes that did not stop.
pub async fn follow_stop(mut progress: NodeProgress, endpoints: &[Endpoint], wait: Duration) -> ToolResult<NodeStates> {
    let stopped = progress.await_reached(wait).await;
    for (endpoint, _) in progress.errors() {
        warn!("Unable to ask node: {endpoint} to stop: please stop it manually.");
    }
    let failed: HashSet<&Endpoint> = progress.errors().iter().map(|(e, _)| e).collect();
    let missing: Vec<Endpoint> = endpoints
        .iter()
        .filter(|e| !failed.contains(e) && !stopped.contains(&e.node_uid))
        .cloned()
        .collect();
    if !missing.is_empty() {
        return Err(ToolError::Incomplete {
            action: "stop",
            timeout_secs: wait.as_secs(),
            missing,
        });
    }
    if !stopped.is_empty() {
        info!("Stopped nodes: {}", join_endpoints(stopped.endpoints()));
    }
    Ok(stopped)
}
