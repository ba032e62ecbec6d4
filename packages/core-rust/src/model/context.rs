//! A cluster viewed from one of its nodes.

use serde::{Deserialize, Serialize};

use super::{Cluster, Node, Stripe};
use crate::error::ModelError;
use crate::uid::Uid;

/// Cluster snapshot together with the UID of the node that reported it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeContext {
    pub cluster: Cluster,
    pub node_uid: Uid,
}

impl NodeContext {
    /// # Errors
    ///
    /// Returns [`ModelError::NotFound`] when the node is not part of `cluster`.
    pub fn new(cluster: Cluster, node_uid: Uid) -> Result<Self, ModelError> {
        if cluster.contains_node(&node_uid) {
            Ok(Self { cluster, node_uid })
        } else {
            Err(ModelError::NotFound(format!("Node {node_uid}")))
        }
    }

    /// The reporting node. `None` only for contexts built by deserialization.
    #[must_use]
    pub fn node(&self) -> Option<&Node> {
        self.cluster.node(&self.node_uid)
    }

    #[must_use]
    pub fn stripe(&self) -> Option<&Stripe> {
        self.cluster.stripe_of(&self.node_uid)
    }
}
