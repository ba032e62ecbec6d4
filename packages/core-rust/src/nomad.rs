//! Change descriptors and discovery data of the configuration log.
//!
//! A [`NomadChange`] always carries the complete cluster that results from
//! applying it, so any node can adopt the change without replaying history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::model::{Cluster, LockContext, Node, Stripe};
use crate::setting::SettingChange;
use crate::uid::Uid;

/// Mode reported by a node's configuration log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NomadServerMode {
    /// No change is pending; a new one can be prepared.
    Accepting,
    /// A change is prepared and awaits commit or rollback.
    Prepared,
}

/// Outcome of a change on one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeRequestState {
    Prepared,
    Committed,
    RolledBack,
}

impl ChangeRequestState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Prepared => "PREPARED",
            Self::Committed => "COMMITTED",
            Self::RolledBack => "ROLLED_BACK",
        }
    }
}

impl std::fmt::Display for ChangeRequestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A mutation of the cluster configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum NomadChange {
    #[serde(rename_all = "camelCase")]
    NodeAddition {
        cluster: Cluster,
        stripe_uid: Uid,
        node: Node,
    },
    #[serde(rename_all = "camelCase")]
    NodeRemoval {
        cluster: Cluster,
        stripe_uid: Uid,
        node: Node,
    },
    StripeAddition { cluster: Cluster, stripe: Stripe },
    StripeRemoval { cluster: Cluster, stripe: Stripe },
    MultiSetting {
        cluster: Cluster,
        changes: Vec<SettingChange>,
    },
    #[serde(rename_all = "camelCase")]
    LockConfig {
        cluster: Cluster,
        lock_context: LockContext,
    },
    UnlockConfig { cluster: Cluster, forced: bool },
    ClusterActivation { cluster: Cluster },
    /// Any other change submitted while holding the configuration lock.
    LockAware {
        token: String,
        change: Box<NomadChange>,
    },
}

impl NomadChange {
    /// Adds `node` to stripe `stripe_uid` of `base`.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::NotFound`] when the stripe does not exist.
    pub fn node_addition(base: &Cluster, stripe_uid: &Uid, node: Node) -> Result<Self, ModelError> {
        Ok(Self::NodeAddition {
            cluster: base.with_node_added(stripe_uid, node.clone())?,
            stripe_uid: stripe_uid.clone(),
            node,
        })
    }

    /// Removes node `uid` from `base`.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::NotFound`] when the node does not exist.
    pub fn node_removal(base: &Cluster, uid: &Uid) -> Result<Self, ModelError> {
        let stripe = base
            .stripe_of(uid)
            .ok_or_else(|| ModelError::NotFound(format!("Node {uid}")))?;
        let node = stripe
            .node(uid)
            .cloned()
            .ok_or_else(|| ModelError::NotFound(format!("Node {uid}")))?;
        Ok(Self::NodeRemoval {
            cluster: base.with_node_removed(uid)?,
            stripe_uid: stripe.uid.clone(),
            node,
        })
    }

    #[must_use]
    pub fn stripe_addition(base: &Cluster, stripe: Stripe) -> Self {
        Self::StripeAddition {
            cluster: base.with_stripe_added(stripe.clone()),
            stripe,
        }
    }

    /// Removes stripe `uid` from `base`.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::NotFound`] when the stripe does not exist.
    pub fn stripe_removal(base: &Cluster, uid: &Uid) -> Result<Self, ModelError> {
        let stripe = base
            .stripe(uid)
            .cloned()
            .ok_or_else(|| ModelError::NotFound(format!("Stripe {uid}")))?;
        Ok(Self::StripeRemoval {
            cluster: base.with_stripe_removed(uid)?,
            stripe,
        })
    }

    /// Bundles already-applied setting changes with their resulting cluster.
    #[must_use]
    pub fn multi_setting(result: Cluster, changes: Vec<SettingChange>) -> Self {
        Self::MultiSetting {
            cluster: result,
            changes,
        }
    }

    #[must_use]
    pub fn lock_config(base: &Cluster, lock_context: LockContext) -> Self {
        Self::LockConfig {
            cluster: base.with_lock_context(Some(lock_context.clone())),
            lock_context,
        }
    }

    #[must_use]
    pub fn unlock_config(base: &Cluster, forced: bool) -> Self {
        Self::UnlockConfig {
            cluster: base.with_lock_context(None),
            forced,
        }
    }

    #[must_use]
    pub fn cluster_activation(cluster: Cluster) -> Self {
        Self::ClusterActivation { cluster }
    }

    /// Wraps this change with the token of the lock held by the submitter.
    #[must_use]
    pub fn lock_aware(self, token: impl Into<String>) -> Self {
        match self {
            // a forced unlock needs no token
            Self::LockConfig { .. } | Self::UnlockConfig { forced: true, .. } | Self::LockAware { .. } => self,
            other => Self::LockAware {
                token: token.into(),
                change: Box::new(other),
            },
        }
    }

    /// The change without any lock wrapper.
    #[must_use]
    pub fn inner(&self) -> &Self {
        match self {
            Self::LockAware { change, .. } => change.inner(),
            other => other,
        }
    }

    /// The complete cluster after this change is applied.
    #[must_use]
    pub fn result_cluster(&self) -> &Cluster {
        match self {
            Self::NodeAddition { cluster, .. }
            | Self::NodeRemoval { cluster, .. }
            | Self::StripeAddition { cluster, .. }
            | Self::StripeRemoval { cluster, .. }
            | Self::MultiSetting { cluster, .. }
            | Self::LockConfig { cluster, .. }
            | Self::UnlockConfig { cluster, .. }
            | Self::ClusterActivation { cluster } => cluster,
            Self::LockAware { change, .. } => change.result_cluster(),
        }
    }

    /// Operator facing one-line description.
    #[must_use]
    pub fn summary(&self) -> String {
        match self {
            Self::NodeAddition { cluster, stripe_uid, node } => format!(
                "Attaching node: {} to stripe: {}",
                node.internal_address(),
                stripe_name(cluster, stripe_uid)
            ),
            Self::NodeRemoval { stripe_uid, node, .. } => format!(
                "Detaching node: {} from stripe ID: {stripe_uid}",
                node.internal_address()
            ),
            Self::StripeAddition { stripe, .. } => format!(
                "Attaching stripe: {} with nodes: {}",
                stripe.name,
                stripe.node_names().collect::<Vec<_>>().join(", ")
            ),
            Self::StripeRemoval { stripe, .. } => format!("Detaching stripe: {}", stripe.name),
            Self::MultiSetting { changes, .. } => changes
                .iter()
                .map(SettingChange::summary)
                .collect::<Vec<_>>()
                .join(", "),
            Self::LockConfig { lock_context, .. } => {
                format!("Locking the config by {}", lock_context.owner_info())
            }
            Self::UnlockConfig { forced: true, .. } => "Forcefully unlocking the config".to_owned(),
            Self::UnlockConfig { forced: false, .. } => "Unlocking the config".to_owned(),
            Self::ClusterActivation { cluster } => format!(
                "Activating cluster: {}",
                cluster.name.as_deref().unwrap_or("<unnamed>")
            ),
            Self::LockAware { change, .. } => change.summary(),
        }
    }
}

fn stripe_name(cluster: &Cluster, stripe_uid: &Uid) -> String {
    cluster
        .stripe(stripe_uid)
        .map_or_else(|| stripe_uid.to_string(), |s| s.name.clone())
}

/// Latest change recorded by a node's configuration log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeDetails {
    pub change_uuid: String,
    pub state: ChangeRequestState,
    pub version: u64,
    pub operation: NomadChange,
    pub result: Cluster,
    pub result_hash: String,
    pub creation_host: String,
    pub creation_user: String,
    pub creation_timestamp: DateTime<Utc>,
}

/// Answer of a node to a configuration discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoverResponse {
    pub mode: NomadServerMode,
    pub mutative_message_count: u64,
    pub last_mutation_host: Option<String>,
    pub last_mutation_user: Option<String>,
    pub last_mutation_timestamp: Option<DateTime<Utc>>,
    pub current_version: u64,
    pub highest_version: u64,
    pub latest_change: Option<ChangeDetails>,
}

impl DiscoverResponse {
    #[must_use]
    pub fn latest_change_uuid(&self) -> Option<&str> {
        self.latest_change.as_ref().map(|c| c.change_uuid.as_str())
    }

    #[must_use]
    pub fn latest_change_state(&self) -> Option<ChangeRequestState> {
        self.latest_change.as_ref().map(|c| c.state)
    }
}

/// One entry of a node's change history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NomadChangeInfo {
    pub change_uuid: String,
    pub change: NomadChange,
    pub state: ChangeRequestState,
    pub version: u64,
    pub creation_host: String,
    pub creation_user: String,
    pub creation_timestamp: DateTime<Utc>,
}
