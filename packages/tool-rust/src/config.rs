//! Tool-level configuration: timeouts, restart/stop pacing, fan-out limits.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use dynconf_core::model::options::PLATFORM_OWNER;

/// Logging options applied by [`crate::logging::init_tracing`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LogConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
    /// Emit JSON lines instead of human readable output.
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_owned(),
            json: false,
        }
    }
}

/// Configuration shared by every orchestration command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ToolConfig {
    /// Timeout of a single diagnostic request in milliseconds.
    pub request_timeout_ms: u64,
    /// Timeout of establishing a diagnostic connection in milliseconds.
    pub connection_timeout_ms: u64,
    /// Upper bound of concurrent remote calls during fan-out.
    pub max_concurrency: usize,
    /// Interval between state probes in milliseconds.
    pub poll_interval_ms: u64,
    /// Grace period added to the restart/stop delay before the first probe.
    pub restart_settle_grace_ms: u64,
    pub restart_wait_ms: u64,
    pub restart_delay_ms: u64,
    pub stop_wait_ms: u64,
    pub stop_delay_ms: u64,
    /// Restart nodes automatically when a change requires it.
    pub auto_restart: bool,
    /// Owner name recorded when the configuration lock is taken.
    pub lock_owner: String,
    pub log: LogConfig,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 10_000,
            connection_timeout_ms: 10_000,
            max_concurrency: 32,
            poll_interval_ms: 1_000,
            restart_settle_grace_ms: 5_000,
            restart_wait_ms: 120_000,
            restart_delay_ms: 2_000,
            stop_wait_ms: 120_000,
            stop_delay_ms: 2_000,
            auto_restart: true,
            lock_owner: PLATFORM_OWNER.to_owned(),
            log: LogConfig::default(),
        }
    }
}

impl ToolConfig {
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    #[must_use]
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub fn settle_grace(&self) -> Duration {
        Duration::from_millis(self.restart_settle_grace_ms)
    }

    #[must_use]
    pub fn restart_wait(&self) -> Duration {
        Duration::from_millis(self.restart_wait_ms)
    }

    #[must_use]
    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    #[must_use]
    pub fn stop_wait(&self) -> Duration {
        Duration::from_millis(self.stop_wait_ms)
    }

    #[must_use]
    pub fn stop_delay(&self) -> Duration {
        Duration::from_millis(self.stop_delay_ms)
    }

    /// Pool size for a fan-out over `node_count` nodes.
    #[must_use]
    pub fn concurrency_for(&self, node_count: usize) -> usize {
        node_count.min(self.max_concurrency).max(1)
    }
}
