//! Named configuration settings, their requirements, and how they are
//! written into a [`Cluster`].

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::model::{Authc, Cluster, FailoverPriority, Node};
use crate::uid::Uid;

static TIME_MEASURE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+(ms|s|m|h)$").expect("static regex"));
static MEMORY_MEASURE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+(B|KB|MB|GB|TB|PB)$").expect("static regex"));
static LOG_LEVEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(TRACE|DEBUG|INFO|WARN|ERROR)$").expect("static regex"));

/// Whether a mutation writes or clears a setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operation {
    Set,
    Unset,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Set => "set",
            Self::Unset => "unset",
        })
    }
}

/// Lifecycle phase of the cluster a mutation is applied to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ClusterState {
    /// Nodes run in diagnostic mode with no configuration log yet.
    Configuring,
    /// The cluster is activated: changes go through the configuration log.
    Activated,
}

/// Level at which a setting is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SettingLevel {
    Cluster,
    Node,
}

/// What applying a change to a setting needs from the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Requirement {
    /// Targeted nodes take the change only after a restart.
    NodeRestart,
    /// All nodes must be restarted for the change to apply.
    ClusterRestart,
    /// All nodes must be online when the change is submitted.
    ClusterOnline,
    /// Targeted nodes must be present and online.
    Presence,
}

/// Part of the cluster a setting change is applied to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "uid", rename_all = "camelCase")]
pub enum SettingTarget {
    Cluster,
    Stripe(Uid),
    Node(Uid),
}

/// Every setting the tool can mutate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Setting {
    ClusterName,
    ClientReconnectWindow,
    ClientLeaseDuration,
    FailoverPriority,
    OffheapResources,
    Authc,
    SslTls,
    Whitelist,
    NodeName,
    NodeHostname,
    NodePort,
    NodeGroupPort,
    NodeBindAddress,
    NodeGroupBindAddress,
    NodePublicHostname,
    NodePublicPort,
    NodeMetadataDir,
    NodeLogDir,
    NodeBackupDir,
    SecurityDir,
    AuditLogDir,
    DataDirs,
    TcProperties,
    NodeLoggerOverrides,
}

impl Setting {
    pub const ALL: [Self; 24] = [
        Self::ClusterName,
        Self::ClientReconnectWindow,
        Self::ClientLeaseDuration,
        Self::FailoverPriority,
        Self::OffheapResources,
        Self::Authc,
        Self::SslTls,
        Self::Whitelist,
        Self::NodeName,
        Self::NodeHostname,
        Self::NodePort,
        Self::NodeGroupPort,
        Self::NodeBindAddress,
        Self::NodeGroupBindAddress,
        Self::NodePublicHostname,
        Self::NodePublicPort,
        Self::NodeMetadataDir,
        Self::NodeLogDir,
        Self::NodeBackupDir,
        Self::SecurityDir,
        Self::AuditLogDir,
        Self::DataDirs,
        Self::TcProperties,
        Self::NodeLoggerOverrides,
    ];

    /// Name used in configuration expressions.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::ClusterName => "cluster-name",
            Self::ClientReconnectWindow => "client-reconnect-window",
            Self::ClientLeaseDuration => "client-lease-duration",
            Self::FailoverPriority => "failover-priority",
            Self::OffheapResources => "offheap-resources",
            Self::Authc => "authc",
            Self::SslTls => "ssl-tls",
            Self::Whitelist => "whitelist",
            Self::NodeName => "name",
            Self::NodeHostname => "hostname",
            Self::NodePort => "port",
            Self::NodeGroupPort => "group-port",
            Self::NodeBindAddress => "bind-address",
            Self::NodeGroupBindAddress => "group-bind-address",
            Self::NodePublicHostname => "public-hostname",
            Self::NodePublicPort => "public-port",
            Self::NodeMetadataDir => "metadata-dir",
            Self::NodeLogDir => "log-dir",
            Self::NodeBackupDir => "backup-dir",
            Self::SecurityDir => "security-dir",
            Self::AuditLogDir => "audit-log-dir",
            Self::DataDirs => "data-dirs",
            Self::TcProperties => "tc-properties",
            Self::NodeLoggerOverrides => "logger-overrides",
        }
    }

    #[must_use]
    pub fn level(self) -> SettingLevel {
        match self {
            Self::ClusterName
            | Self::ClientReconnectWindow
            | Self::ClientLeaseDuration
            | Self::FailoverPriority
            | Self::OffheapResources
            | Self::Authc
            | Self::SslTls
            | Self::Whitelist => SettingLevel::Cluster,
            _ => SettingLevel::Node,
        }
    }

    /// Map settings accept a `.<key>` suffix.
    #[must_use]
    pub fn is_map(self) -> bool {
        matches!(
            self,
            Self::OffheapResources | Self::DataDirs | Self::TcProperties | Self::NodeLoggerOverrides
        )
    }

    /// Settings unique per node that can only be addressed through a node namespace.
    #[must_use]
    pub fn requires_node_scope(self) -> bool {
        matches!(
            self,
            Self::NodeName | Self::NodeHostname | Self::NodePublicHostname
        )
    }

    #[must_use]
    pub fn requirements(self) -> &'static [Requirement] {
        match self {
            Self::NodeLogDir | Self::SecurityDir | Self::AuditLogDir => &[Requirement::NodeRestart],
            Self::TcProperties => &[Requirement::ClusterRestart],
            Self::FailoverPriority | Self::Authc | Self::SslTls | Self::Whitelist => {
                &[Requirement::ClusterOnline, Requirement::ClusterRestart]
            }
            // a change of an existing backup dir is vetoed at runtime
            // and reported through the node's restart flag
            Self::NodeBackupDir => &[],
            _ => &[Requirement::Presence],
        }
    }

    #[must_use]
    pub fn requires(self, requirement: Requirement) -> bool {
        self.requirements().contains(&requirement)
    }

    /// Whether `operation` is allowed on this setting in `state`.
    #[must_use]
    pub fn allows(self, operation: Operation, state: ClusterState) -> bool {
        match (operation, state) {
            (Operation::Set, ClusterState::Configuring) => true,
            (Operation::Set, ClusterState::Activated) => !matches!(
                self,
                Self::NodeHostname
                    | Self::NodePort
                    | Self::NodeGroupPort
                    | Self::NodeBindAddress
                    | Self::NodeGroupBindAddress
                    | Self::NodeMetadataDir
            ),
            (Operation::Unset, ClusterState::Configuring) => matches!(
                self,
                Self::FailoverPriority
                    | Self::OffheapResources
                    | Self::DataDirs
                    | Self::Authc
                    | Self::SslTls
                    | Self::Whitelist
                    | Self::NodePublicHostname
                    | Self::NodePublicPort
                    | Self::NodeBackupDir
                    | Self::SecurityDir
                    | Self::AuditLogDir
                    | Self::TcProperties
                    | Self::NodeLoggerOverrides
            ),
            (Operation::Unset, ClusterState::Activated) => matches!(
                self,
                Self::Authc
                    | Self::SslTls
                    | Self::Whitelist
                    | Self::NodePublicHostname
                    | Self::NodePublicPort
                    | Self::NodeBackupDir
                    | Self::SecurityDir
                    | Self::AuditLogDir
                    | Self::TcProperties
                    | Self::NodeLoggerOverrides
            ),
        }
    }

    /// Checks the shape of a value destined for this setting.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::Malformed`] when `value` is not acceptable.
    pub fn validate_value(self, key: Option<&str>, value: &str) -> Result<(), ModelError> {
        if self.is_map() && key.is_none() {
            return parse_map(self, value).map(|_| ());
        }
        let ok = match self {
            Self::ClientReconnectWindow | Self::ClientLeaseDuration => TIME_MEASURE.is_match(value),
            Self::OffheapResources => MEMORY_MEASURE.is_match(value),
            Self::NodeLoggerOverrides => LOG_LEVEL.is_match(value),
            Self::FailoverPriority => value.parse::<FailoverPriority>().is_ok(),
            Self::Authc => value.parse::<Authc>().is_ok(),
            Self::SslTls | Self::Whitelist => matches!(value, "true" | "false"),
            Self::NodePort | Self::NodeGroupPort | Self::NodePublicPort => {
                value.parse::<u16>().is_ok_and(|p| p > 0)
            }
            _ => !value.trim().is_empty(),
        };
        if ok {
            Ok(())
        } else {
            Err(ModelError::malformed(self.name(), value))
        }
    }

    /// Returns a copy of `cluster` with this setting written (`Some` value)
    /// or cleared (`None`) on `target`.
    ///
    /// # Errors
    ///
    /// Fails when the value is malformed, the target does not exist, or the
    /// setting level does not match the target.
    pub fn apply(
        self,
        cluster: &Cluster,
        target: &SettingTarget,
        key: Option<&str>,
        value: Option<&str>,
    ) -> Result<Cluster, ModelError> {
        if let Some(value) = value {
            self.validate_value(key, value)?;
        }
        match (self.level(), target) {
            (SettingLevel::Cluster, SettingTarget::Cluster) => self.write_cluster(cluster, key, value),
            (SettingLevel::Cluster, _) => Err(ModelError::invalid(format!(
                "Setting '{}' can only be configured at cluster level",
                self.name()
            ))),
            (SettingLevel::Node, target) => {
                let uids: Vec<Uid> = match target {
                    SettingTarget::Cluster => cluster.nodes().map(|n| n.uid.clone()).collect(),
                    SettingTarget::Stripe(uid) => cluster
                        .stripe(uid)
                        .ok_or_else(|| ModelError::NotFound(format!("Stripe {uid}")))?
                        .nodes
                        .iter()
                        .map(|n| n.uid.clone())
                        .collect(),
                    SettingTarget::Node(uid) => vec![uid.clone()],
                };
                let mut next = cluster.clone();
                for uid in &uids {
                    let mut outcome = Ok(());
                    next = next.update_node(uid, |node| outcome = self.write_node(node, key, value))?;
                    outcome?;
                }
                Ok(next)
            }
        }
    }

    fn write_cluster(self, cluster: &Cluster, key: Option<&str>, value: Option<&str>) -> Result<Cluster, ModelError> {
        let mut next = cluster.clone();
        match self {
            Self::ClusterName => next.name = value.map(str::to_owned),
            Self::ClientReconnectWindow => {
                next.client_reconnect_window = value
                    .unwrap_or(crate::model::cluster::DEFAULT_CLIENT_RECONNECT_WINDOW)
                    .to_owned();
            }
            Self::ClientLeaseDuration => {
                next.client_lease_duration = value
                    .unwrap_or(crate::model::cluster::DEFAULT_CLIENT_LEASE_DURATION)
                    .to_owned();
            }
            Self::FailoverPriority => next.failover_priority = value.map(str::parse).transpose()?,
            Self::OffheapResources => write_map(self, &mut next.offheap_resources, key, value)?,
            Self::Authc => next.security_authc = value.map(str::parse).transpose()?,
            Self::SslTls => next.security_ssl_tls = value == Some("true"),
            Self::Whitelist => next.security_whitelist = value == Some("true"),
            _ => {
                return Err(ModelError::invalid(format!(
                    "Setting '{}' is not a cluster setting",
                    self.name()
                )))
            }
        }
        Ok(next)
    }

    fn write_node(self, node: &mut Node, key: Option<&str>, value: Option<&str>) -> Result<(), ModelError> {
        let required = |value: Option<&str>| {
            value
                .map(str::to_owned)
                .ok_or_else(|| ModelError::invalid(format!("Setting '{}' cannot be unset", self.name())))
        };
        let port = |v: &str| v.parse::<u16>().map_err(|_| ModelError::malformed(self.name(), v));
        match self {
            Self::NodeName => node.name = required(value)?,
            Self::NodeHostname => node.hostname = required(value)?,
            Self::NodePort => node.port = port(&required(value)?)?,
            Self::NodeGroupPort => node.group_port = port(&required(value)?)?,
            Self::NodeBindAddress => node.bind_address = required(value)?,
            Self::NodeGroupBindAddress => node.group_bind_address = required(value)?,
            Self::NodePublicHostname => node.public_hostname = value.map(str::to_owned),
            Self::NodePublicPort => node.public_port = value.map(port).transpose()?,
            Self::NodeMetadataDir => node.metadata_dir = required(value)?,
            Self::NodeLogDir => node.log_dir = required(value)?,
            Self::NodeBackupDir => node.backup_dir = value.map(str::to_owned),
            Self::SecurityDir => node.security_dir = value.map(str::to_owned),
            Self::AuditLogDir => node.security_audit_log_dir = value.map(str::to_owned),
            Self::DataDirs => write_map(self, &mut node.data_dirs, key, value)?,
            Self::TcProperties => write_map(self, &mut node.tc_properties, key, value)?,
            Self::NodeLoggerOverrides => write_map(self, &mut node.logger_overrides, key, value)?,
            _ => {
                return Err(ModelError::invalid(format!(
                    "Setting '{}' is not a node setting",
                    self.name()
                )))
            }
        }
        Ok(())
    }
}

impl FromStr for Setting {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|setting| setting.name() == s)
            .ok_or_else(|| ModelError::UnknownSetting(s.to_owned()))
    }
}

impl fmt::Display for Setting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One resolved setting mutation, addressed by UID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingChange {
    pub operation: Operation,
    pub setting: Setting,
    pub target: SettingTarget,
    pub key: Option<String>,
    pub value: Option<String>,
}

impl SettingChange {
    /// Writes this change into a copy of `cluster`.
    ///
    /// # Errors
    ///
    /// See [`Setting::apply`].
    pub fn apply(&self, cluster: &Cluster) -> Result<Cluster, ModelError> {
        let value = match self.operation {
            Operation::Set => self.value.as_deref(),
            Operation::Unset => None,
        };
        self.setting
            .apply(cluster, &self.target, self.key.as_deref(), value)
    }

    /// One-line description, e.g. `set log-dir=/x (node:<uid>)`.
    #[must_use]
    pub fn summary(&self) -> String {
        let mut out = format!("{} {}", self.operation, self.setting);
        if let Some(key) = &self.key {
            out.push('.');
            out.push_str(key);
        }
        if let (Operation::Set, Some(value)) = (self.operation, &self.value) {
            out.push('=');
            out.push_str(value);
        }
        match &self.target {
            SettingTarget::Cluster => {}
            SettingTarget::Stripe(uid) => out.push_str(&format!(" (stripe:{uid})")),
            SettingTarget::Node(uid) => out.push_str(&format!(" (node:{uid})")),
        }
        out
    }
}

/// Parses `k1:v1,k2:v2` into a map, validating each entry value.
fn parse_map(setting: Setting, value: &str) -> Result<BTreeMap<String, String>, ModelError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (k, v) = entry
                .split_once(':')
                .ok_or_else(|| ModelError::malformed(setting.name(), entry))?;
            setting.validate_value(Some(k), v)?;
            Ok((k.to_owned(), v.to_owned()))
        })
        .collect()
}

fn write_map(
    setting: Setting,
    map: &mut BTreeMap<String, String>,
    key: Option<&str>,
    value: Option<&str>,
) -> Result<(), ModelError> {
    match (key, value) {
        (Some(key), Some(value)) => {
            map.insert(key.to_owned(), value.to_owned());
        }
        (Some(key), None) => {
            map.remove(key);
        }
        (None, Some(value)) => *map = parse_map(setting, value)?,
        (None, None) => map.clear(),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::two_by_two;

    #[test]
    fn names_round_trip_through_from_str() {
        for setting in Setting::ALL {
            assert_eq!(setting.name().parse::<Setting>().unwrap(), setting);
        }
        assert_eq!(
            "bogus".parse::<Setting>().unwrap_err(),
            ModelError::UnknownSetting("bogus".into())
        );
    }

    #[test]
    fn restart_requirements() {
        assert!(Setting::NodeLogDir.requires(Requirement::NodeRestart));
        assert!(Setting::TcProperties.requires(Requirement::ClusterRestart));
        assert!(Setting::FailoverPriority.requires(Requirement::ClusterOnline));
        assert!(Setting::SslTls.requires(Requirement::ClusterRestart));
        assert!(Setting::NodeBackupDir.requirements().is_empty());
        assert_eq!(
            Setting::ClientLeaseDuration.requirements(),
            &[Requirement::Presence]
        );
    }

    #[test]
    fn activated_cluster_rejects_address_changes() {
        assert!(!Setting::NodeHostname.allows(Operation::Set, ClusterState::Activated));
        assert!(Setting::NodeHostname.allows(Operation::Set, ClusterState::Configuring));
        assert!(!Setting::OffheapResources.allows(Operation::Unset, ClusterState::Activated));
        assert!(Setting::NodeBackupDir.allows(Operation::Unset, ClusterState::Activated));
    }

    #[test]
    fn node_setting_at_cluster_scope_targets_every_node() {
        let cluster = two_by_two();
        let next = Setting::NodeLogDir
            .apply(&cluster, &SettingTarget::Cluster, None, Some("/logs"))
            .unwrap();
        assert!(next.nodes().all(|n| n.log_dir == "/logs"));
        assert!(cluster.nodes().all(|n| n.log_dir != "/logs"));
    }

    #[test]
    fn node_setting_at_stripe_scope_targets_stripe_nodes() {
        let cluster = two_by_two();
        let s2 = cluster.stripes[1].uid.clone();
        let next = Setting::NodeBackupDir
            .apply(&cluster, &SettingTarget::Stripe(s2.clone()), None, Some("/bk"))
            .unwrap();
        for node in next.nodes() {
            let in_s2 = next.stripe_of(&node.uid).unwrap().uid == s2;
            assert_eq!(node.backup_dir.is_some(), in_s2);
        }
    }

    #[test]
    fn map_setting_with_and_without_key() {
        let cluster = two_by_two();
        let next = Setting::OffheapResources
            .apply(&cluster, &SettingTarget::Cluster, Some("second"), Some("1GB"))
            .unwrap();
        assert_eq!(next.offheap_resources.len(), 2);
        let replaced = Setting::OffheapResources
            .apply(&next, &SettingTarget::Cluster, None, Some("a:1MB,b:2MB"))
            .unwrap();
        assert_eq!(
            replaced.offheap_resources.keys().cloned().collect::<Vec<_>>(),
            vec!["a".to_string(), "b".to_string()]
        );
        assert!(Setting::OffheapResources
            .apply(&next, &SettingTarget::Cluster, Some("x"), Some("lots"))
            .is_err());
    }

    #[test]
    fn cluster_setting_rejects_node_target() {
        let cluster = two_by_two();
        let uid = cluster.stripes[0].nodes[0].uid.clone();
        let err = Setting::FailoverPriority
            .apply(&cluster, &SettingTarget::Node(uid), None, Some("availability"))
            .unwrap_err();
        assert!(err.to_string().contains("cluster level"));
    }

    #[test]
    fn value_validation() {
        assert!(Setting::ClientReconnectWindow.validate_value(None, "30s").is_ok());
        assert!(Setting::ClientReconnectWindow.validate_value(None, "30 seconds").is_err());
        assert!(Setting::NodePort.validate_value(None, "0").is_err());
        assert!(Setting::NodeLoggerOverrides.validate_value(Some("com.x"), "DEBUG").is_ok());
        assert!(Setting::SslTls.validate_value(None, "yes").is_err());
    }
}
