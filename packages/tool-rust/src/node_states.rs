//! Insertion-ordered snapshot of endpoint states.

use dynconf_core::{Endpoint, LogicalServerState, Uid};

/// Endpoints with their observed logical state, in discovery order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeStates {
    entries: Vec<(Endpoint, LogicalServerState)>,
}

impl NodeStates {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the state of `endpoint`, keeping its original position.
    pub fn insert(&mut self, endpoint: Endpoint, state: LogicalServerState) {
        match self.entries.iter_mut().find(|(e, _)| *e == endpoint) {
            Some(slot) => *slot = (endpoint, state),
            None => self.entries.push((endpoint, state)),
        }
    }

    pub fn remove(&mut self, endpoint: &Endpoint) -> Option<LogicalServerState> {
        let index = self.entries.iter().position(|(e, _)| e == endpoint)?;
        Some(self.entries.remove(index).1)
    }

    #[must_use]
    pub fn get(&self, node_uid: &Uid) -> Option<LogicalServerState> {
        self.entries
            .iter()
            .find(|(e, _)| e.node_uid == *node_uid)
            .map(|(_, s)| *s)
    }

    #[must_use]
    pub fn endpoint(&self, node_uid: &Uid) -> Option<&Endpoint> {
        self.entries
            .iter()
            .find(|(e, _)| e.node_uid == *node_uid)
            .map(|(e, _)| e)
    }

    #[must_use]
    pub fn contains(&self, node_uid: &Uid) -> bool {
        self.get(node_uid).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Endpoint, LogicalServerState)> {
        self.entries.iter().map(|(e, s)| (e, *s))
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &Endpoint> {
        self.entries.iter().map(|(e, _)| e)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries matching `predicate`, order preserved.
    #[must_use]
    pub fn filter(&self, predicate: impl Fn(&Endpoint, LogicalServerState) -> bool) -> Self {
        self.entries
            .iter()
            .filter(|(e, s)| predicate(e, *s))
            .cloned()
            .collect()
    }

    /// Entries that are neither UNREACHABLE nor UNKNOWN.
    #[must_use]
    pub fn online(&self) -> Self {
        self.filter(|_, s| s.is_online())
    }

    /// Passive and other non-active entries first, actives last.
    ///
    /// Changes are applied in this order so that actives commit after their
    /// passives have prepared.
    #[must_use]
    pub fn passives_first(&self) -> Self {
        let (actives, others): (Vec<_>, Vec<_>) =
            self.entries.iter().cloned().partition(|(_, s)| s.is_active());
        others.into_iter().chain(actives).collect()
    }
}

impl FromIterator<(Endpoint, LogicalServerState)> for NodeStates {
    fn from_iter<T: IntoIterator<Item = (Endpoint, LogicalServerState)>>(iter: T) -> Self {
        let mut states = Self::new();
        for (endpoint, state) in iter {
            states.insert(endpoint, state);
        }
        states
    }
}

impl IntoIterator for NodeStates {
    type Item = (Endpoint, LogicalServerState);
    type IntoIter = std::vec::IntoIter<(Endpoint, LogicalServerState)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use dynconf_core::{AddressGroup, HostPort};

    use super::*;
    use LogicalServerState::{Active, Passive, Unreachable};

    fn endpoint(name: &str) -> Endpoint {
        Endpoint::new(
            name.parse().unwrap(),
            name,
            HostPort::new(name, 9410),
            AddressGroup::Internal,
        )
    }

    #[test]
    fn insert_replaces_in_place() {
        let mut states = NodeStates::new();
        states.insert(endpoint("a"), Active);
        states.insert(endpoint("b"), Passive);
        states.insert(endpoint("a"), Unreachable);
        let order: Vec<_> = states.iter().map(|(e, s)| (e.node_name.clone(), s)).collect();
        assert_eq!(order, vec![("a".to_string(), Unreachable), ("b".to_string(), Passive)]);
    }

    #[test]
    fn passives_first_keeps_relative_order() {
        let states: NodeStates = [
            (endpoint("a1"), Active),
            (endpoint("p1"), Passive),
            (endpoint("a2"), Active),
            (endpoint("p2"), Passive),
        ]
        .into_iter()
        .collect();
        let names: Vec<_> = states
            .passives_first()
            .endpoints()
            .map(|e| e.node_name.clone())
            .collect();
        assert_eq!(names, ["p1", "p2", "a1", "a2"]);
    }

    #[test]
    fn online_drops_unreachable() {
        let states: NodeStates = [(endpoint("a"), Active), (endpoint("b"), Unreachable)]
            .into_iter()
            .collect();
        assert_eq!(states.online().len(), 1);
        assert!(states.online().contains(&"a".parse().unwrap()));
    }
}
