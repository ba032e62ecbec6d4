//! Observed role and health of a server node.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Observed role or health of a node, as reported by its diagnostic service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogicalServerState {
    Active,
    ActiveReconnecting,
    ActiveSuspended,
    Passive,
    PassiveSuspended,
    Synchronizing,
    Starting,
    StartSuspended,
    Unreachable,
    Unknown,
}

impl LogicalServerState {
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::Active | Self::ActiveReconnecting | Self::ActiveSuspended
        )
    }

    #[must_use]
    pub fn is_passive(self) -> bool {
        matches!(self, Self::Passive | Self::PassiveSuspended)
    }

    /// Node is up but not yet configured or still in diagnostic mode.
    #[must_use]
    pub fn is_starting(self) -> bool {
        matches!(self, Self::Starting | Self::StartSuspended)
    }

    #[must_use]
    pub fn is_synchronizing(self) -> bool {
        self == Self::Synchronizing
    }

    #[must_use]
    pub fn is_unreachable(self) -> bool {
        self == Self::Unreachable
    }

    #[must_use]
    pub fn is_unknown(self) -> bool {
        self == Self::Unknown
    }

    #[must_use]
    pub fn is_online(self) -> bool {
        !self.is_unknown() && !self.is_unreachable()
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::ActiveReconnecting => "ACTIVE_RECONNECTING",
            Self::ActiveSuspended => "ACTIVE_SUSPENDED",
            Self::Passive => "PASSIVE",
            Self::PassiveSuspended => "PASSIVE_SUSPENDED",
            Self::Synchronizing => "SYNCHRONIZING",
            Self::Starting => "STARTING",
            Self::StartSuspended => "START_SUSPENDED",
            Self::Unreachable => "UNREACHABLE",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for LogicalServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::LogicalServerState::*;
    use super::*;

    const ALL: [LogicalServerState; 10] = [
        Active,
        ActiveReconnecting,
        ActiveSuspended,
        Passive,
        PassiveSuspended,
        Synchronizing,
        Starting,
        StartSuspended,
        Unreachable,
        Unknown,
    ];

    #[test]
    fn role_helpers_partition_states() {
        for state in ALL {
            let roles = [
                state.is_active(),
                state.is_passive(),
                state.is_starting(),
                state.is_synchronizing(),
                !state.is_online(),
            ];
            assert_eq!(roles.iter().filter(|r| **r).count(), 1, "{state}");
        }
    }

    #[test]
    fn serde_uses_wire_names() {
        for state in ALL {
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{}\"", state.as_str()));
        }
    }
}
