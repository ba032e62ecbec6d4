//! Error taxonomy of orchestration commands.

use dynconf_core::{Endpoint, HostPort, ModelError};

/// Failure of an orchestration command.
///
/// `Validation` errors are raised before any mutating remote call.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("{0}")]
    Validation(String),

    #[error("unable to reach {address}: {source:#}")]
    Connectivity {
        address: HostPort,
        #[source]
        source: anyhow::Error,
    },

    /// Aggregate of the failures recorded while talking to every peer.
    #[error("{}", format_reasons(.reasons))]
    Protocol { reasons: Vec<String> },

    /// Configuration state that must not be corrected automatically.
    #[error("{description}")]
    Inconsistency { state: String, description: String },

    /// Nodes that did not reach the expected state before the deadline.
    #[error("Some nodes may have failed to {action}. Timeout: {timeout_secs}s. Nodes: {}", dynconf_core::join_endpoints(.missing))]
    Incomplete {
        action: &'static str,
        timeout_secs: u64,
        missing: Vec<Endpoint>,
    },

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("internal error: {0:#}")]
    Internal(#[from] anyhow::Error),
}

fn format_reasons(reasons: &[String]) -> String {
    let mut out = String::from("Two-Phase commit failed with ");
    out.push_str(&reasons.len().to_string());
    out.push_str(" messages(s):");
    for (i, reason) in reasons.iter().enumerate() {
        out.push_str(&format!("\n\n({}) {reason}", i + 1));
    }
    out
}

impl ToolError {
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub(crate) fn connectivity(address: &HostPort, source: anyhow::Error) -> Self {
        Self::Connectivity {
            address: address.clone(),
            source,
        }
    }

    /// Short name of the error category, used as a metric label.
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Connectivity { .. } => "connectivity",
            Self::Protocol { .. } => "protocol",
            Self::Inconsistency { .. } => "inconsistency",
            Self::Incomplete { .. } => "incomplete",
            Self::Model(_) => "model",
            Self::Internal(_) => "internal",
        }
    }

    /// Stable process exit code for the error category.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Validation(_) | Self::Model(_) => 2,
            Self::Connectivity { .. } => 3,
            Self::Protocol { .. } => 4,
            Self::Inconsistency { .. } => 5,
            Self::Incomplete { .. } => 6,
            Self::Internal(_) => 1,
        }
    }
}

pub type ToolResult<T> = Result<T, ToolError>;
