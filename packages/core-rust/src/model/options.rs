//! Cluster-wide option values: failover priority, security mode, lock context.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// Tie-breaking policy when a stripe loses its active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum FailoverPriority {
    Availability,
    /// Consistency with an optional number of external voters.
    Consistency { voters: u32 },
}

impl FailoverPriority {
    #[must_use]
    pub fn voters(self) -> u32 {
        match self {
            Self::Availability => 0,
            Self::Consistency { voters } => voters,
        }
    }

    #[must_use]
    pub fn is_consistency(self) -> bool {
        matches!(self, Self::Consistency { .. })
    }
}

impl FromStr for FailoverPriority {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            None if s == "availability" => Ok(Self::Availability),
            None if s == "consistency" => Ok(Self::Consistency { voters: 0 }),
            Some(("consistency", voters)) => voters
                .parse::<u32>()
                .map(|voters| Self::Consistency { voters })
                .map_err(|_| ModelError::malformed("failover-priority", s)),
            _ => Err(ModelError::malformed("failover-priority", s)),
        }
    }
}

impl fmt::Display for FailoverPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Availability => f.write_str("availability"),
            Self::Consistency { voters: 0 } => f.write_str("consistency"),
            Self::Consistency { voters } => write!(f, "consistency:{voters}"),
        }
    }
}

/// Authentication mechanism for client connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Authc {
    File,
    Ldap,
    Certificate,
}

impl FromStr for Authc {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file" => Ok(Self::File),
            "ldap" => Ok(Self::Ldap),
            "certificate" => Ok(Self::Certificate),
            _ => Err(ModelError::malformed("authc", s)),
        }
    }
}

impl fmt::Display for Authc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::File => "file",
            Self::Ldap => "ldap",
            Self::Certificate => "certificate",
        })
    }
}

/// Owner name used for locks taken by the operator platform.
pub const PLATFORM_OWNER: &str = "platform";

/// Tag allowing scaling operations while locked.
pub const TAG_ALLOW_SCALING: &str = "allow_scaling";

/// Tag denying scale-out while locked.
pub const TAG_DENY_SCALE_OUT: &str = "deny_scale_out";

/// Tag denying scale-in while locked.
pub const TAG_DENY_SCALE_IN: &str = "deny_scale_in";

/// Distributed configuration lock held by an operator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockContext {
    pub token: String,
    pub owner_name: String,
    pub tag: String,
}

impl LockContext {
    /// Creates a lock context with a fresh random token.
    #[must_use]
    pub fn new(owner_name: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            token: uuid::Uuid::new_v4().to_string(),
            owner_name: owner_name.into(),
            tag: tag.into(),
        }
    }

    /// Human readable owner description, `"<owner> (<tag>)"`.
    #[must_use]
    pub fn owner_info(&self) -> String {
        format!("{} ({})", self.owner_name, self.tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failover_priority_parses_and_displays() {
        assert_eq!(
            "availability".parse::<FailoverPriority>().unwrap(),
            FailoverPriority::Availability
        );
        let c: FailoverPriority = "consistency:2".parse().unwrap();
        assert_eq!(c.voters(), 2);
        assert_eq!(c.to_string(), "consistency:2");
        assert_eq!(
            "consistency".parse::<FailoverPriority>().unwrap().to_string(),
            "consistency"
        );
        assert!("consistency:x".parse::<FailoverPriority>().is_err());
        assert!("quorum".parse::<FailoverPriority>().is_err());
    }

    #[test]
    fn lock_context_owner_info() {
        let lock = LockContext::new(PLATFORM_OWNER, TAG_ALLOW_SCALING);
        assert_eq!(lock.owner_info(), "platform (allow_scaling)");
        assert_ne!(lock.token, LockContext::new("a", "b").token);
    }
}
