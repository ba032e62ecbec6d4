//! A single server node and its address resolution rules.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::endpoint::{AddressGroup, Endpoint, HostPort, DEFAULT_GROUP_PORT, DEFAULT_PORT};
use crate::uid::Uid;

/// One server process of a stripe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub uid: Uid,
    pub name: String,
    pub hostname: String,
    pub port: u16,
    pub group_port: u16,
    pub bind_address: String,
    pub group_bind_address: String,
    pub public_hostname: Option<String>,
    pub public_port: Option<u16>,
    pub metadata_dir: String,
    pub log_dir: String,
    pub backup_dir: Option<String>,
    pub security_dir: Option<String>,
    pub security_audit_log_dir: Option<String>,
    pub data_dirs: BTreeMap<String, String>,
    pub tc_properties: BTreeMap<String, String>,
    pub logger_overrides: BTreeMap<String, String>,
}

impl Node {
    /// Creates a node with default ports, bind addresses and directories.
    #[must_use]
    pub fn new(name: impl Into<String>, hostname: impl Into<String>, port: u16) -> Self {
        Self {
            uid: Uid::generate(),
            name: name.into(),
            hostname: hostname.into(),
            port,
            group_port: DEFAULT_GROUP_PORT,
            bind_address: "0.0.0.0".to_owned(),
            group_bind_address: "0.0.0.0".to_owned(),
            public_hostname: None,
            public_port: None,
            metadata_dir: "%H/dynconf/metadata".to_owned(),
            log_dir: "%H/dynconf/logs".to_owned(),
            backup_dir: None,
            security_dir: None,
            security_audit_log_dir: None,
            data_dirs: BTreeMap::from([("main".to_owned(), "%H/dynconf/user-data/main".to_owned())]),
            tc_properties: BTreeMap::new(),
            logger_overrides: BTreeMap::new(),
        }
    }

    /// Creates a node listening on the default port.
    #[must_use]
    pub fn with_defaults(name: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self::new(name, hostname, DEFAULT_PORT)
    }

    #[must_use]
    pub fn internal_address(&self) -> HostPort {
        HostPort::new(self.hostname.clone(), self.port)
    }

    /// The public address, if both public hostname and port are configured.
    #[must_use]
    pub fn public_address(&self) -> Option<HostPort> {
        match (&self.public_hostname, self.public_port) {
            (Some(host), Some(port)) => Some(HostPort::new(host.clone(), port)),
            _ => None,
        }
    }

    /// Whether `address` is one of this node's internal or public addresses.
    #[must_use]
    pub fn is_reachable_with(&self, address: &HostPort) -> bool {
        self.internal_address() == *address || self.public_address().as_ref() == Some(address)
    }

    #[must_use]
    pub fn internal_endpoint(&self) -> Endpoint {
        Endpoint::new(
            self.uid.clone(),
            self.name.clone(),
            self.internal_address(),
            AddressGroup::Internal,
        )
    }

    #[must_use]
    pub fn public_endpoint(&self) -> Option<Endpoint> {
        self.public_address()
            .map(|addr| Endpoint::new(self.uid.clone(), self.name.clone(), addr, AddressGroup::Public))
    }

    /// Resolves the endpoint to use given the address the operator connected with.
    ///
    /// A public address equal to the initiator wins, then an internal address
    /// equal to the initiator, then the public address, then the internal one.
    #[must_use]
    pub fn determine_endpoint(&self, initiator: &HostPort) -> Endpoint {
        match self.public_endpoint() {
            Some(public) if public.address == *initiator => public,
            _ if self.internal_address() == *initiator => self.internal_endpoint(),
            Some(public) => public,
            None => self.internal_endpoint(),
        }
    }

    /// Endpoint in the requested address group, falling back to internal.
    #[must_use]
    pub fn endpoint_in(&self, group: AddressGroup) -> Endpoint {
        match group {
            AddressGroup::Public => self
                .public_endpoint()
                .unwrap_or_else(|| self.internal_endpoint()),
            AddressGroup::Internal => self.internal_endpoint(),
        }
    }

    /// Endpoint of this node in the same address group as `endpoint`.
    #[must_use]
    pub fn similar_endpoint(&self, endpoint: &Endpoint) -> Endpoint {
        self.endpoint_in(endpoint.group)
    }

    /// Names this node would get by default before a friendly name is assigned.
    #[must_use]
    pub fn has_generated_name(&self) -> bool {
        self.name.is_empty() || self.name == format!("node-{}", self.uid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node_with_public() -> Node {
        let mut node = Node::new("n1", "internal-host", 9410);
        node.public_hostname = Some("public-host".into());
        node.public_port = Some(9510);
        node
    }

    #[test]
    fn initiator_matching_public_address_resolves_public() {
        let node = node_with_public();
        let e = node.determine_endpoint(&HostPort::new("public-host", 9510));
        assert_eq!(e.group, AddressGroup::Public);
    }

    #[test]
    fn initiator_matching_internal_address_resolves_internal() {
        let node = node_with_public();
        let e = node.determine_endpoint(&HostPort::new("internal-host", 9410));
        assert_eq!(e.group, AddressGroup::Internal);
        assert_eq!(e.address, HostPort::new("internal-host", 9410));
    }

    #[test]
    fn unknown_initiator_prefers_public_then_internal() {
        let other = HostPort::new("elsewhere", 1);
        assert_eq!(
            node_with_public().determine_endpoint(&other).group,
            AddressGroup::Public
        );
        let plain = Node::new("n2", "h", 9410);
        assert_eq!(plain.determine_endpoint(&other).group, AddressGroup::Internal);
    }

    #[test]
    fn similar_endpoint_falls_back_to_internal() {
        let plain = Node::new("n2", "h", 9410);
        let public = node_with_public().public_endpoint().unwrap();
        assert_eq!(plain.similar_endpoint(&public).group, AddressGroup::Internal);
    }

    #[test]
    fn public_address_requires_both_parts() {
        let mut node = Node::new("n", "h", 1);
        node.public_hostname = Some("p".into());
        assert!(node.public_address().is_none());
        assert!(node.is_reachable_with(&HostPort::new("h", 1)));
    }

    #[test]
    fn generated_name_detection() {
        let mut node = Node::new("", "h", 1);
        assert!(node.has_generated_name());
        node.name = format!("node-{}", node.uid);
        assert!(node.has_generated_name());
        node.name = "tiger-alpha".into();
        assert!(!node.has_generated_name());
    }
}
