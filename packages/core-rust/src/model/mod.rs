//! Cluster topology model: clusters, stripes, nodes and cluster-wide options.

pub mod cluster;
pub mod context;
pub mod node;
pub mod options;
pub mod stripe;

pub use cluster::Cluster;
pub use context::NodeContext;
pub use node::Node;
pub use options::{Authc, FailoverPriority, LockContext};
pub use stripe::Stripe;

#[cfg(test)]
pub(crate) mod fixtures {
    use super::{Cluster, Node, Stripe};

    /// Two stripes of two nodes: `s1: a@h1, b@h2` and `s2: c@h3, d@h4`.
    pub(crate) fn two_by_two() -> Cluster {
        Cluster::new(
            Some("main".into()),
            vec![
                Stripe::new(
                    "s1",
                    vec![Node::new("a", "h1", 9410), Node::new("b", "h2", 9410)],
                ),
                Stripe::new(
                    "s2",
                    vec![Node::new("c", "h3", 9410), Node::new("d", "h4", 9410)],
                ),
            ],
        )
    }
}
