//! Immutable cluster snapshot with copy-on-write updates.
//!
//! Stripes and nodes are reference counted. Every `with_*`/`update_*`
//! method takes `&self` and returns a new [`Cluster`] that shares all
//! untouched stripes and nodes with the receiver.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::node::Node;
use super::options::{Authc, FailoverPriority, LockContext};
use super::stripe::Stripe;
use crate::endpoint::{AddressGroup, Endpoint, HostPort};
use crate::error::ModelError;
use crate::uid::Uid;

/// Default client reconnect window.
pub const DEFAULT_CLIENT_RECONNECT_WINDOW: &str = "120s";

/// Default client lease duration.
pub const DEFAULT_CLIENT_LEASE_DURATION: &str = "150s";

/// Topology and cluster-wide settings, as run by or pending on a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    pub uid: Uid,
    pub name: Option<String>,
    pub failover_priority: Option<FailoverPriority>,
    pub client_reconnect_window: String,
    pub client_lease_duration: String,
    pub offheap_resources: BTreeMap<String, String>,
    pub security_authc: Option<Authc>,
    pub security_ssl_tls: bool,
    pub security_whitelist: bool,
    pub lock_context: Option<LockContext>,
    pub stripes: Vec<Arc<Stripe>>,
}

impl Cluster {
    #[must_use]
    pub fn new(name: Option<String>, stripes: Vec<Stripe>) -> Self {
        Self {
            uid: Uid::generate(),
            name,
            failover_priority: None,
            client_reconnect_window: DEFAULT_CLIENT_RECONNECT_WINDOW.to_owned(),
            client_lease_duration: DEFAULT_CLIENT_LEASE_DURATION.to_owned(),
            offheap_resources: BTreeMap::from([("main".to_owned(), "512MB".to_owned())]),
            security_authc: None,
            security_ssl_tls: false,
            security_whitelist: false,
            lock_context: None,
            stripes: stripes.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.stripes
            .iter()
            .flat_map(|s| s.nodes.iter().map(AsRef::as_ref))
    }

    #[must_use]
    pub fn node(&self, uid: &Uid) -> Option<&Node> {
        self.nodes().find(|n| n.uid == *uid)
    }

    #[must_use]
    pub fn stripe(&self, uid: &Uid) -> Option<&Stripe> {
        self.stripes.iter().find(|s| s.uid == *uid).map(AsRef::as_ref)
    }

    /// The stripe containing the node `node_uid`.
    #[must_use]
    pub fn stripe_of(&self, node_uid: &Uid) -> Option<&Stripe> {
        self.stripes
            .iter()
            .find(|s| s.contains(node_uid))
            .map(AsRef::as_ref)
    }

    /// 1-based position of the stripe `uid`, or of the stripe containing node `uid`.
    #[must_use]
    pub fn stripe_id_of(&self, uid: &Uid) -> Option<usize> {
        self.stripes
            .iter()
            .position(|s| s.uid == *uid || s.contains(uid))
            .map(|i| i + 1)
    }

    /// Stripe at a 1-based position.
    #[must_use]
    pub fn stripe_at(&self, stripe_id: usize) -> Option<&Stripe> {
        stripe_id
            .checked_sub(1)
            .and_then(|i| self.stripes.get(i))
            .map(AsRef::as_ref)
    }

    #[must_use]
    pub fn contains_node(&self, uid: &Uid) -> bool {
        self.node(uid).is_some()
    }

    /// Finds the node reachable through `address` (internal or public).
    #[must_use]
    pub fn node_by_address(&self, address: &HostPort) -> Option<&Node> {
        self.nodes().find(|n| n.is_reachable_with(address))
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.stripes.iter().map(|s| s.node_count()).sum()
    }

    #[must_use]
    pub fn stripe_count(&self) -> usize {
        self.stripes.len()
    }

    #[must_use]
    pub fn in_same_stripe(&self, a: &Uid, b: &Uid) -> bool {
        self.stripe_of(a).is_some_and(|s| s.contains(b))
    }

    /// Union of all data-dir names used by any node.
    #[must_use]
    pub fn data_dir_names(&self) -> BTreeSet<String> {
        self.nodes()
            .flat_map(|n| n.data_dirs.keys().cloned())
            .collect()
    }

    /// Endpoints of all nodes, resolved in the address group of the node
    /// matching `initiator`.
    ///
    /// When no node matches, every node uses its preferred endpoint.
    #[must_use]
    pub fn determine_endpoints(&self, initiator: &HostPort) -> Vec<Endpoint> {
        let group: Option<AddressGroup> = self
            .node_by_address(initiator)
            .map(|n| n.determine_endpoint(initiator).group);
        self.nodes()
            .map(|n| match group {
                Some(group) => n.endpoint_in(group),
                None => n.determine_endpoint(initiator),
            })
            .collect()
    }

    /// Endpoints of all nodes in the same address group as `reference`.
    #[must_use]
    pub fn similar_endpoints(&self, reference: &Endpoint) -> Vec<Endpoint> {
        self.nodes().map(|n| n.similar_endpoint(reference)).collect()
    }

    /// Compact description of the topology for logs, e.g. `main (s1: a, b; s2: c)`.
    #[must_use]
    pub fn shape(&self) -> String {
        let stripes = self
            .stripes
            .iter()
            .map(|s| format!("{}: {}", s.name, s.node_names().collect::<Vec<_>>().join(", ")))
            .collect::<Vec<_>>()
            .join("; ");
        format!("{} ({stripes})", self.name.as_deref().unwrap_or("<unnamed>"))
    }

    /// Returns a copy with `node` appended to stripe `stripe_uid`.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::NotFound`] when the stripe does not exist.
    pub fn with_node_added(&self, stripe_uid: &Uid, node: Node) -> Result<Self, ModelError> {
        self.update_stripe(stripe_uid, |stripe| stripe.nodes.push(Arc::new(node)))
    }

    /// Returns a copy without node `uid`.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::NotFound`] when the node does not exist.
    pub fn with_node_removed(&self, uid: &Uid) -> Result<Self, ModelError> {
        let stripe_uid = self
            .stripe_of(uid)
            .map(|s| s.uid.clone())
            .ok_or_else(|| ModelError::NotFound(format!("Node {uid}")))?;
        self.update_stripe(&stripe_uid, |stripe| stripe.nodes.retain(|n| n.uid != *uid))
    }

    #[must_use]
    pub fn with_stripe_added(&self, stripe: Stripe) -> Self {
        let mut next = self.clone();
        next.stripes.push(Arc::new(stripe));
        next
    }

    /// Returns a copy without stripe `uid`.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::NotFound`] when the stripe does not exist.
    pub fn with_stripe_removed(&self, uid: &Uid) -> Result<Self, ModelError> {
        if self.stripe(uid).is_none() {
            return Err(ModelError::NotFound(format!("Stripe {uid}")));
        }
        let mut next = self.clone();
        next.stripes.retain(|s| s.uid != *uid);
        Ok(next)
    }

    #[must_use]
    pub fn with_lock_context(&self, lock_context: Option<LockContext>) -> Self {
        let mut next = self.clone();
        next.lock_context = lock_context;
        next
    }

    /// Returns a copy with the cluster-wide fields changed by `f`.
    #[must_use]
    pub fn update_settings(&self, f: impl FnOnce(&mut Self)) -> Self {
        let mut next = self.clone();
        f(&mut next);
        next
    }

    /// Returns a copy with stripe `uid` changed by `f`.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::NotFound`] when the stripe does not exist.
    pub fn update_stripe(&self, uid: &Uid, f: impl FnOnce(&mut Stripe)) -> Result<Self, ModelError> {
        let mut next = self.clone();
        let slot = next
            .stripes
            .iter_mut()
            .find(|s| s.uid == *uid)
            .ok_or_else(|| ModelError::NotFound(format!("Stripe {uid}")))?;
        f(Arc::make_mut(slot));
        Ok(next)
    }

    /// Returns a copy with node `uid` changed by `f`.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::NotFound`] when the node does not exist.
    pub fn update_node(&self, uid: &Uid, f: impl FnOnce(&mut Node)) -> Result<Self, ModelError> {
        let stripe_uid = self
            .stripe_of(uid)
            .map(|s| s.uid.clone())
            .ok_or_else(|| ModelError::NotFound(format!("Node {uid}")))?;
        self.update_stripe(&stripe_uid, move |stripe| {
            if let Some(slot) = stripe.nodes.iter_mut().find(|n| n.uid == *uid) {
                f(Arc::make_mut(slot));
            }
        })
    }

    /// Returns a copy with every node changed by `f`.
    #[must_use]
    pub fn update_all_nodes(&self, mut f: impl FnMut(&mut Node)) -> Self {
        let mut next = self.clone();
        for stripe in &mut next.stripes {
            for node in &mut Arc::make_mut(stripe).nodes {
                f(Arc::make_mut(node));
            }
        }
        next
    }
}
