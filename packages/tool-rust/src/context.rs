//! Collaborators and configuration shared by orchestration commands.

use std::sync::Arc;

use crate::config::ToolConfig;
use crate::restart::DiagnosticRestartService;
use crate::stop::DiagnosticStopService;
use crate::traits::{DiagnosticServiceProvider, NomadManager, RestartService, StopService};

/// Services bundle handed to every orchestration function.
///
/// A lock-aware copy created with [`OrchestrationContext::with_lock_token`]
/// wraps every submitted change with the held lock token.
#[derive(Clone)]
pub struct OrchestrationContext {
    diagnostics: Arc<dyn DiagnosticServiceProvider>,
    nomad: Arc<dyn NomadManager>,
    restart: Arc<dyn RestartService>,
    stop: Arc<dyn StopService>,
    config: Arc<ToolConfig>,
    lock_token: Option<String>,
}

impl OrchestrationContext {
    #[must_use]
    pub fn new(
        diagnostics: Arc<dyn DiagnosticServiceProvider>,
        nomad: Arc<dyn NomadManager>,
        restart: Arc<dyn RestartService>,
        stop: Arc<dyn StopService>,
        config: Arc<ToolConfig>,
    ) -> Self {
        Self {
            diagnostics,
            nomad,
            restart,
            stop,
            config,
            lock_token: None,
        }
    }

    /// Context whose restart and stop services poll through `diagnostics`.
    #[must_use]
    pub fn with_diagnostic_services(
        diagnostics: Arc<dyn DiagnosticServiceProvider>,
        nomad: Arc<dyn NomadManager>,
        config: Arc<ToolConfig>,
    ) -> Self {
        let restart = Arc::new(DiagnosticRestartService::new(
            Arc::clone(&diagnostics),
            Arc::clone(&config),
        ));
        let stop = Arc::new(DiagnosticStopService::new(
            Arc::clone(&diagnostics),
            Arc::clone(&config),
        ));
        Self::new(diagnostics, nomad, restart, stop, config)
    }

    #[must_use]
    pub fn with_lock_token(&self, token: impl Into<String>) -> Self {
        Self {
            lock_token: Some(token.into()),
            ..self.clone()
        }
    }

    #[must_use]
    pub fn lock_token(&self) -> Option<&str> {
        self.lock_token.as_deref()
    }

    #[must_use]
    pub fn diagnostics(&self) -> &Arc<dyn DiagnosticServiceProvider> {
        &self.diagnostics
    }

    #[must_use]
    pub fn nomad(&self) -> &dyn NomadManager {
        self.nomad.as_ref()
    }

    #[must_use]
    pub fn restart_service(&self) -> &dyn RestartService {
        self.restart.as_ref()
    }

    #[must_use]
    pub fn stop_service(&self) -> &dyn StopService {
        self.stop.as_ref()
    }

    #[must_use]
    pub fn config(&self) -> &ToolConfig {
        &self.config
    }
}
