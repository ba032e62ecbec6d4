//! A stripe: one active/passive failover group of nodes.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::node::Node;
use crate::uid::Uid;

/// Ordered replica set of nodes sharing one failover group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stripe {
    pub uid: Uid,
    pub name: String,
    pub nodes: Vec<Arc<Node>>,
}

impl Stripe {
    #[must_use]
    pub fn new(name: impl Into<String>, nodes: Vec<Node>) -> Self {
        Self {
            uid: Uid::generate(),
            name: name.into(),
            nodes: nodes.into_iter().map(Arc::new).collect(),
        }
    }

    #[must_use]
    pub fn node(&self, uid: &Uid) -> Option<&Node> {
        self.nodes.iter().find(|n| n.uid == *uid).map(AsRef::as_ref)
    }

    #[must_use]
    pub fn contains(&self, uid: &Uid) -> bool {
        self.node(uid).is_some()
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node_names(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(|n| n.name.as_str())
    }

    #[must_use]
    pub fn has_generated_name(&self) -> bool {
        self.name.is_empty() || self.name == format!("stripe-{}", self.uid)
    }
}
