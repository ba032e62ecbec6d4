//! Structural validation of a cluster before it is pushed to nodes.

use std::collections::{BTreeSet, HashSet};

use tracing::warn;

use crate::endpoint::HostPort;
use crate::error::ModelError;
use crate::model::{Authc, Cluster};
use crate::setting::ClusterState;

/// Checks the rules every cluster sent to nodes must satisfy.
pub struct ClusterValidator<'a> {
    cluster: &'a Cluster,
}

impl<'a> ClusterValidator<'a> {
    #[must_use]
    pub fn new(cluster: &'a Cluster) -> Self {
        Self { cluster }
    }

    /// Runs every rule in order, failing on the first violation.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::Invalid`] describing the violated rule.
    pub fn validate(&self, state: ClusterState) -> Result<(), ModelError> {
        self.validate_names()?;
        self.validate_addresses()?;
        self.validate_public_addresses()?;
        self.validate_all_or_none()?;
        self.validate_data_dirs()?;
        self.validate_security()?;
        self.validate_failover_priority(state)?;
        Ok(())
    }

    fn validate_names(&self) -> Result<(), ModelError> {
        let mut stripe_names = HashSet::new();
        for stripe in &self.cluster.stripes {
            if stripe.name.trim().is_empty() {
                return Err(ModelError::invalid(format!(
                    "Found stripe without name: {}",
                    stripe.uid
                )));
            }
            if !stripe_names.insert(stripe.name.as_str()) {
                return Err(ModelError::invalid(format!(
                    "Found duplicate stripe name: {}",
                    stripe.name
                )));
            }
        }
        let mut node_names = HashSet::new();
        for node in self.cluster.nodes() {
            if node.name.trim().is_empty() {
                return Err(ModelError::invalid(format!(
                    "Found node without name: {}",
                    node.internal_address()
                )));
            }
            if !node_names.insert(node.name.as_str()) {
                return Err(ModelError::invalid(format!(
                    "Found duplicate node name: {}",
                    node.name
                )));
            }
        }
        Ok(())
    }

    fn validate_addresses(&self) -> Result<(), ModelError> {
        let mut seen = HashSet::new();
        for node in self.cluster.nodes() {
            let address = node.internal_address();
            if !seen.insert(address.clone()) {
                return Err(ModelError::invalid(format!(
                    "Nodes with duplicate addresses found: {address}"
                )));
            }
        }
        Ok(())
    }

    fn validate_public_addresses(&self) -> Result<(), ModelError> {
        let mut seen: HashSet<HostPort> = HashSet::new();
        let mut with_public = 0;
        for node in self.cluster.nodes() {
            if node.public_hostname.is_some() != node.public_port.is_some() {
                return Err(ModelError::invalid(format!(
                    "Public address of node {} must have both a hostname and a port",
                    node.name
                )));
            }
            if let Some(public) = node.public_address() {
                with_public += 1;
                if !seen.insert(public.clone()) {
                    return Err(ModelError::invalid(format!(
                        "Nodes with duplicate public addresses found: {public}"
                    )));
                }
            }
        }
        if with_public != 0 && with_public != self.cluster.node_count() {
            return Err(ModelError::invalid(
                "Public addresses must be configured on all nodes or on none",
            ));
        }
        Ok(())
    }

    fn validate_all_or_none(&self) -> Result<(), ModelError> {
        let total = self.cluster.node_count();
        let backups = self.cluster.nodes().filter(|n| n.backup_dir.is_some()).count();
        if backups != 0 && backups != total {
            return Err(ModelError::invalid(
                "Nodes with backup-dir setting found: backup-dir must be set on all nodes or on none",
            ));
        }
        let audits = self
            .cluster
            .nodes()
            .filter(|n| n.security_audit_log_dir.is_some())
            .count();
        if audits != 0 && audits != total {
            return Err(ModelError::invalid(
                "Nodes with audit-log-dir setting found: audit-log-dir must be set on all nodes or on none",
            ));
        }
        Ok(())
    }

    fn validate_data_dirs(&self) -> Result<(), ModelError> {
        let mut names = self
            .cluster
            .nodes()
            .map(|n| n.data_dirs.keys().collect::<BTreeSet<_>>());
        if let Some(first) = names.next() {
            if names.any(|other| other != first) {
                return Err(ModelError::invalid(
                    "Data directory names need to match across the cluster",
                ));
            }
        }
        Ok(())
    }

    fn validate_security(&self) -> Result<(), ModelError> {
        let cluster = self.cluster;
        if cluster.security_authc == Some(Authc::Certificate) && !cluster.security_ssl_tls {
            return Err(ModelError::invalid(
                "ssl-tls is required for authc=certificate",
            ));
        }
        let uses_security = cluster.security_authc.is_some()
            || cluster.security_ssl_tls
            || cluster.security_whitelist;
        for node in cluster.nodes() {
            if uses_security && node.security_dir.is_none() {
                return Err(ModelError::invalid(format!(
                    "security-dir is mandatory for any of the security configuration (node: {})",
                    node.name
                )));
            }
            if node.security_dir.is_some() && !uses_security {
                return Err(ModelError::invalid(format!(
                    "One of ssl-tls, authc, or whitelist is required for security configuration (node: {})",
                    node.name
                )));
            }
            if node.security_audit_log_dir.is_some() && node.security_dir.is_none() {
                return Err(ModelError::invalid(format!(
                    "security-dir is required for audit-log-dir (node: {})",
                    node.name
                )));
            }
        }
        Ok(())
    }

    fn validate_failover_priority(&self, state: ClusterState) -> Result<(), ModelError> {
        match self.cluster.failover_priority {
            None if state == ClusterState::Activated => Err(ModelError::invalid(
                "failover-priority setting is missing",
            )),
            Some(priority) if priority.is_consistency() => {
                let sum = priority.voters() as usize + self.cluster.node_count();
                if sum % 2 == 0 {
                    warn!(
                        "The sum ({sum}) of voter count ({}) and number of nodes ({}) is an even number. \
                         An odd-numbered configuration is recommended for optimal availability",
                        priority.voters(),
                        self.cluster.node_count()
                    );
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::two_by_two;
    use crate::model::FailoverPriority;

    fn valid() -> Cluster {
        two_by_two().update_settings(|c| c.failover_priority = Some(FailoverPriority::Availability))
    }

    fn message(cluster: &Cluster) -> String {
        ClusterValidator::new(cluster)
            .validate(ClusterState::Activated)
            .unwrap_err()
            .to_string()
    }

    #[test]
    fn accepts_a_well_formed_cluster() {
        assert!(ClusterValidator::new(&valid()).validate(ClusterState::Activated).is_ok());
    }

    #[test]
    fn rejects_duplicate_node_names_and_addresses() {
        let cluster = valid();
        let b = cluster.stripes[0].nodes[1].uid.clone();
        let dup_name = cluster.update_node(&b, |n| n.name = "a".into()).unwrap();
        assert!(message(&dup_name).contains("duplicate node name"));
        let dup_addr = cluster.update_node(&b, |n| n.hostname = "h1".into()).unwrap();
        assert!(message(&dup_addr).contains("duplicate addresses"));
    }

    #[test]
    fn public_addresses_all_or_none() {
        let cluster = valid();
        let a = cluster.stripes[0].nodes[0].uid.clone();
        let half = cluster
            .update_node(&a, |n| n.public_hostname = Some("p".into()))
            .unwrap();
        assert!(message(&half).contains("both a hostname and a port"));
        let one = cluster
            .update_node(&a, |n| {
                n.public_hostname = Some("p".into());
                n.public_port = Some(1);
            })
            .unwrap();
        assert!(message(&one).contains("all nodes or on none"));
    }

    #[test]
    fn backup_dir_all_or_none() {
        let cluster = valid();
        let a = cluster.stripes[0].nodes[0].uid.clone();
        let one = cluster.update_node(&a, |n| n.backup_dir = Some("/bk".into())).unwrap();
        assert!(message(&one).contains("backup-dir"));
    }

    #[test]
    fn data_dir_names_must_match() {
        let cluster = valid();
        let a = cluster.stripes[0].nodes[0].uid.clone();
        let extra = cluster
            .update_node(&a, |n| {
                n.data_dirs.insert("other".into(), "/o".into());
            })
            .unwrap();
        assert!(message(&extra).contains("Data directory names"));
    }

    #[test]
    fn security_rules() {
        let cert = valid().update_settings(|c| c.security_authc = Some(Authc::Certificate));
        assert!(message(&cert).contains("ssl-tls is required"));

        let tls = valid().update_settings(|c| c.security_ssl_tls = true);
        assert!(message(&tls).contains("security-dir is mandatory"));

        let dir_only = valid().update_all_nodes(|n| n.security_dir = Some("/sec".into()));
        assert!(message(&dir_only).contains("One of ssl-tls"));

        let ok = tls.update_all_nodes(|n| n.security_dir = Some("/sec".into()));
        assert!(ClusterValidator::new(&ok).validate(ClusterState::Activated).is_ok());
    }

    #[test]
    fn failover_priority_required_only_when_activated() {
        let cluster = two_by_two();
        assert!(ClusterValidator::new(&cluster).validate(ClusterState::Configuring).is_ok());
        assert!(message(&cluster).contains("failover-priority"));
    }
}
