//! Network addresses and resolved node endpoints.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::uid::Uid;

/// Default client port of a node.
pub const DEFAULT_PORT: u16 = 9410;

/// Default group (replication) port of a node.
pub const DEFAULT_GROUP_PORT: u16 = 9430;

/// A host name or IP address paired with a TCP port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl HostPort {
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parses `host[:port]`, `[v6]` or `[v6]:port`, substituting `default_port`
    /// when no port is present.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::Malformed`] for an empty host or an invalid port.
    pub fn parse_with_default(input: &str, default_port: u16) -> Result<Self, ModelError> {
        let input = input.trim();
        let (host, port) = if let Some(rest) = input.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| ModelError::malformed("address", input))?;
            match tail {
                "" => (host, None),
                _ => (
                    host,
                    Some(
                        tail.strip_prefix(':')
                            .ok_or_else(|| ModelError::malformed("address", input))?,
                    ),
                ),
            }
        } else {
            match input.rsplit_once(':') {
                Some((host, port)) if !host.contains(':') => (host, Some(port)),
                // no colon, or a bare IPv6 literal without brackets
                _ => (input, None),
            }
        };

        if host.is_empty() {
            return Err(ModelError::malformed("address", input));
        }
        let port = match port {
            None => default_port,
            Some(p) => match p.parse::<u16>() {
                Ok(p) if p > 0 => p,
                _ => return Err(ModelError::malformed("port", p)),
            },
        };
        Ok(Self::new(host, port))
    }
}

impl FromStr for HostPort {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_with_default(s, DEFAULT_PORT)
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Which of a node's addresses an endpoint was resolved against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AddressGroup {
    Internal,
    Public,
}

/// A node identity resolved to one of its reachable addresses.
///
/// Equality and hashing consider the node UID only: the same node reached
/// through its internal or public address is the same endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub node_uid: Uid,
    pub node_name: String,
    pub address: HostPort,
    pub group: AddressGroup,
}

impl Endpoint {
    #[must_use]
    pub fn new(node_uid: Uid, node_name: impl Into<String>, address: HostPort, group: AddressGroup) -> Self {
        Self {
            node_uid,
            node_name: node_name.into(),
            address,
            group,
        }
    }
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        self.node_uid == other.node_uid
    }
}

impl Eq for Endpoint {}

impl Hash for Endpoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.node_uid.hash(state);
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.node_name, self.address)
    }
}

/// Renders endpoints as a comma separated list for operator messages.
#[must_use]
pub fn join_endpoints<'a>(endpoints: impl IntoIterator<Item = &'a Endpoint>) -> String {
    endpoints
        .into_iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
