//! Namespaced configuration expressions such as `stripe.1.node.2.log-dir=/x`.
//!
//! Grammar: `[stripe.<i>.[node.<j>.]]<setting>[.<key>][=<value>]` with
//! 1-based indexes. The separator after a namespace may be `.` or `:`.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::model::Cluster;
use crate::setting::{ClusterState, Operation, Setting, SettingChange, SettingLevel, SettingTarget};
use crate::uid::Uid;

static EXPRESSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:stripe\.(?P<stripe>\d+)[.:](?:node\.(?P<node>\d+)[.:])?)?(?P<setting>[a-z][a-z-]*)(?:\.(?P<key>[^=]+))?(?:=(?P<value>.*))?$",
    )
    .expect("static regex")
});

/// Namespace a configuration expression addresses, by 1-based position.
///
/// Variants are ordered from the widest to the narrowest scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ConfigScope {
    Cluster,
    Stripe { stripe: usize },
    Node { stripe: usize, node: usize },
}

/// A parsed configuration expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Configuration {
    pub raw: String,
    pub scope: ConfigScope,
    pub setting: Setting,
    pub key: Option<String>,
    pub value: Option<String>,
}

impl Configuration {
    /// Parses and pre-validates an expression.
    ///
    /// # Errors
    ///
    /// Fails on syntax errors, zero indexes, unknown settings, or a key on a
    /// non-map setting.
    pub fn parse(input: &str) -> Result<Self, ModelError> {
        let raw = input.trim();
        let caps = EXPRESSION
            .captures(raw)
            .ok_or_else(|| ModelError::malformed("configuration", raw))?;

        let index = |name: &str| -> Result<Option<usize>, ModelError> {
            caps.name(name)
                .map(|m| match m.as_str().parse::<usize>() {
                    Ok(0) | Err(_) => Err(ModelError::invalid(format!(
                        "Invalid {name} ID in: '{raw}'. IDs start at 1"
                    ))),
                    Ok(id) => Ok(id),
                })
                .transpose()
        };
        let scope = match (index("stripe")?, index("node")?) {
            (None, _) => ConfigScope::Cluster,
            (Some(stripe), None) => ConfigScope::Stripe { stripe },
            (Some(stripe), Some(node)) => ConfigScope::Node { stripe, node },
        };

        let setting: Setting = caps["setting"].parse()?;
        let key = caps.name("key").map(|m| m.as_str().to_owned());
        if key.is_some() && !setting.is_map() {
            return Err(ModelError::invalid(format!(
                "Invalid input: '{raw}'. Reason: {setting} is not a map and must not have a key"
            )));
        }
        let value = caps.name("value").map(|m| m.as_str().trim().to_owned());

        Ok(Self {
            raw: raw.to_owned(),
            scope,
            setting,
            key,
            value,
        })
    }

    /// Identity used to detect duplicate expressions within one request.
    #[must_use]
    pub fn identity(&self) -> (Setting, ConfigScope, Option<&str>) {
        (self.setting, self.scope, self.key.as_deref())
    }

    /// Checks this expression can be used for `operation` on a cluster in `state`.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::Invalid`] describing the first rejected rule.
    pub fn validate(&self, operation: Operation, state: ClusterState) -> Result<(), ModelError> {
        let raw = &self.raw;
        match (operation, &self.value) {
            (Operation::Set, None) => {
                return Err(ModelError::invalid(format!(
                    "Invalid input: '{raw}'. Reason: a value is required to set {}",
                    self.setting
                )))
            }
            (Operation::Set, Some(v)) if v.is_empty() => {
                return Err(ModelError::invalid(format!(
                    "Invalid input: '{raw}'. Reason: value cannot be empty"
                )))
            }
            (Operation::Unset, Some(_)) => {
                return Err(ModelError::invalid(format!(
                    "Invalid input: '{raw}'. Reason: unset does not take a value"
                )))
            }
            _ => {}
        }
        if self.setting.level() == SettingLevel::Cluster && self.scope != ConfigScope::Cluster {
            return Err(ModelError::invalid(format!(
                "Invalid input: '{raw}'. Reason: {} can only be configured at cluster level",
                self.setting
            )));
        }
        if self.setting.requires_node_scope() && !matches!(self.scope, ConfigScope::Node { .. }) {
            return Err(ModelError::invalid(format!(
                "Invalid input: '{raw}'. Reason: {} must target a single node (stripe.<i>.node.<j>.)",
                self.setting
            )));
        }
        if !self.setting.allows(operation, state) {
            let phase = match state {
                ClusterState::Configuring => "configuring",
                ClusterState::Activated => "activated",
            };
            return Err(ModelError::invalid(format!(
                "Invalid input: '{raw}'. Reason: {operation} is not allowed on {} when the cluster is {phase}",
                self.setting
            )));
        }
        if let (Operation::Set, Some(value)) = (operation, &self.value) {
            self.setting.validate_value(self.key.as_deref(), value)?;
        }
        Ok(())
    }

    /// Resolves the scope indexes against `cluster`.
    ///
    /// # Errors
    ///
    /// Fails when a stripe or node index is out of range.
    pub fn target(&self, cluster: &Cluster) -> Result<SettingTarget, ModelError> {
        let stripe_at = |stripe: usize| {
            cluster.stripe_at(stripe).ok_or_else(|| {
                ModelError::invalid(format!(
                    "Invalid stripe ID: {stripe} in '{}'. Cluster contains: {} stripe(s)",
                    self.raw,
                    cluster.stripe_count()
                ))
            })
        };
        match self.scope {
            ConfigScope::Cluster => Ok(SettingTarget::Cluster),
            ConfigScope::Stripe { stripe } => Ok(SettingTarget::Stripe(stripe_at(stripe)?.uid.clone())),
            ConfigScope::Node { stripe, node } => {
                let s = stripe_at(stripe)?;
                let n = node.checked_sub(1).and_then(|i| s.nodes.get(i)).ok_or_else(|| {
                    ModelError::invalid(format!(
                        "Invalid node ID: {node} in '{}'. Stripe ID: {stripe} contains: {} node(s)",
                        self.raw,
                        s.node_count()
                    ))
                })?;
                Ok(SettingTarget::Node(n.uid.clone()))
            }
        }
    }

    /// Resolves this expression into a UID-addressed [`SettingChange`].
    ///
    /// # Errors
    ///
    /// See [`Configuration::target`].
    pub fn to_change(&self, cluster: &Cluster, operation: Operation) -> Result<SettingChange, ModelError> {
        Ok(SettingChange {
            operation,
            setting: self.setting,
            target: self.target(cluster)?,
            key: self.key.clone(),
            value: match operation {
                Operation::Set => self.value.clone(),
                Operation::Unset => None,
            },
        })
    }

    /// Nodes affected by this expression.
    ///
    /// # Errors
    ///
    /// See [`Configuration::target`].
    pub fn targeted_nodes(&self, cluster: &Cluster) -> Result<Vec<Uid>, ModelError> {
        Ok(match self.target(cluster)? {
            SettingTarget::Cluster => cluster.nodes().map(|n| n.uid.clone()).collect(),
            SettingTarget::Stripe(uid) => cluster
                .stripe(&uid)
                .map(|s| s.nodes.iter().map(|n| n.uid.clone()).collect())
                .unwrap_or_default(),
            SettingTarget::Node(uid) => vec![uid],
        })
    }
}

impl FromStr for Configuration {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Result of applying a batch of configurations to a cluster.
#[derive(Debug, Clone)]
pub struct AppliedConfigurations {
    pub cluster: Cluster,
    pub changes: Vec<SettingChange>,
    pub targeted_nodes: BTreeSet<Uid>,
}

/// Validates a whole request: no duplicate expressions, each one valid.
///
/// # Errors
///
/// Returns the first validation failure.
pub fn validate_all(
    configurations: &[Configuration],
    operation: Operation,
    state: ClusterState,
) -> Result<(), ModelError> {
    let mut seen = HashSet::new();
    for configuration in configurations {
        if !seen.insert(configuration.identity()) {
            return Err(ModelError::Duplicate(format!(
                "configuration: '{}'",
                configuration.raw
            )));
        }
        configuration.validate(operation, state)?;
    }
    Ok(())
}

/// Applies `configurations` in scope order (cluster, stripe, node) so that
/// narrower scopes win.
///
/// # Errors
///
/// Fails when a configuration cannot be resolved or applied.
pub fn apply_all(
    cluster: &Cluster,
    configurations: &[Configuration],
    operation: Operation,
) -> Result<AppliedConfigurations, ModelError> {
    let mut ordered: Vec<&Configuration> = configurations.iter().collect();
    ordered.sort_by_key(|c| c.scope);

    let mut next = cluster.clone();
    let mut changes = Vec::with_capacity(ordered.len());
    let mut targeted_nodes = BTreeSet::new();
    for configuration in ordered {
        let change = configuration.to_change(&next, operation)?;
        targeted_nodes.extend(configuration.targeted_nodes(&next)?);
        next = change.apply(&next)?;
        changes.push(change);
    }
    Ok(AppliedConfigurations {
        cluster: next,
        changes,
        targeted_nodes,
    })
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::model::fixtures::two_by_two;

    #[test]
    fn parses_all_namespace_forms() {
        let c = Configuration::parse("log-dir=/x").unwrap();
        assert_eq!(c.scope, ConfigScope::Cluster);
        assert_eq!(c.value.as_deref(), Some("/x"));

        let c = Configuration::parse("stripe.2.backup-dir=/b").unwrap();
        assert_eq!(c.scope, ConfigScope::Stripe { stripe: 2 });

        let c = Configuration::parse("stripe.1.node.2:log-dir=/y").unwrap();
        assert_eq!(c.scope, ConfigScope::Node { stripe: 1, node: 2 });

        let c = Configuration::parse("offheap-resources.main=1GB").unwrap();
        assert_eq!(c.key.as_deref(), Some("main"));

        let c = Configuration::parse("stripe.1:node.1:tc-properties.a.b").unwrap();
        assert_eq!(c.key.as_deref(), Some("a.b"));
        assert!(c.value.is_none());
    }

    #[test]
    fn rejects_zero_index_key_on_scalar_and_unknown_setting() {
        assert!(Configuration::parse("stripe.0.log-dir=/x").is_err());
        assert!(Configuration::parse("log-dir.key=/x")
            .unwrap_err()
            .to_string()
            .contains("not a map"));
        assert_eq!(
            Configuration::parse("colour=blue").unwrap_err(),
            ModelError::UnknownSetting("colour".into())
        );
    }

    #[test]
    fn validate_requires_values_for_set_and_none_for_unset() {
        let set = Configuration::parse("log-dir").unwrap();
        assert!(set.validate(Operation::Set, ClusterState::Configuring).is_err());
        let empty = Configuration::parse("log-dir=").unwrap();
        assert!(empty.validate(Operation::Set, ClusterState::Configuring).is_err());
        let unset = Configuration::parse("backup-dir=/x").unwrap();
        assert!(unset.validate(Operation::Unset, ClusterState::Activated).is_err());
    }

    #[test]
    fn validate_checks_scope_and_allowed_operations() {
        let wrong_level = Configuration::parse("stripe.1.failover-priority=availability").unwrap();
        assert!(wrong_level.validate(Operation::Set, ClusterState::Configuring).is_err());
        let name = Configuration::parse("name=foo").unwrap();
        assert!(name.validate(Operation::Set, ClusterState::Configuring).is_err());
        let port = Configuration::parse("stripe.1.node.1.port=9999").unwrap();
        assert!(port.validate(Operation::Set, ClusterState::Configuring).is_ok());
        assert!(port.validate(Operation::Set, ClusterState::Activated).is_err());
    }

    #[test]
    fn duplicates_are_rejected() {
        let configs = vec![
            Configuration::parse("log-dir=/a").unwrap(),
            Configuration::parse("log-dir=/b").unwrap(),
        ];
        assert!(matches!(
            validate_all(&configs, Operation::Set, ClusterState::Configuring),
            Err(ModelError::Duplicate(_))
        ));
    }

    #[test]
    fn out_of_range_indexes_fail_on_resolution() {
        let cluster = two_by_two();
        let c = Configuration::parse("stripe.3.log-dir=/x").unwrap();
        assert!(c.target(&cluster).unwrap_err().to_string().contains("2 stripe(s)"));
        let c = Configuration::parse("stripe.1.node.5.log-dir=/x").unwrap();
        assert!(c.target(&cluster).is_err());
    }

    #[test]
    fn narrower_scope_wins_regardless_of_order() {
        let cluster = two_by_two();
        let configs = vec![
            Configuration::parse("stripe.1.node.1.log-dir=/node").unwrap(),
            Configuration::parse("log-dir=/cluster").unwrap(),
        ];
        let applied = apply_all(&cluster, &configs, Operation::Set).unwrap();
        let first = cluster.stripes[0].nodes[0].uid.clone();
        assert_eq!(applied.cluster.node(&first).unwrap().log_dir, "/node");
        let others = applied.cluster.nodes().filter(|n| n.uid != first);
        assert!(others.into_iter().all(|n| n.log_dir == "/cluster"));
        assert_eq!(applied.targeted_nodes.len(), 4);
        assert_eq!(applied.changes[0].setting, Setting::NodeLogDir);
        assert_eq!(applied.changes[0].target, SettingTarget::Cluster);
    }

    #[test]
    fn stripe_scope_targets_only_stripe_nodes() {
        let cluster = two_by_two();
        let c = Configuration::parse("stripe.2.log-dir=/x").unwrap();
        let targeted = c.targeted_nodes(&cluster).unwrap();
        let expected: Vec<_> = cluster.stripes[1].nodes.iter().map(|n| n.uid.clone()).collect();
        assert_eq!(targeted, expected);
    }

    proptest! {
        #[test]
        fn scope_order_is_widest_first(stripe in 1usize..9, node in 1usize..9) {
            prop_assert!(ConfigScope::Cluster < ConfigScope::Stripe { stripe }, "cluster scope must order before stripe scope");
            prop_assert!(ConfigScope::Stripe { stripe: 9 } < ConfigScope::Node { stripe, node }, "stripe scope must order before node scope");
        }
    }
}
