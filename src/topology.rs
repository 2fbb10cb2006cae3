use serde::Deserialize;

use crate::cluster::NodeInfo;

/// Answers rack and node-group membership queries. Purely a function of
/// the location strings the name service reports for each node.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct Topology {
    #[serde(default)]
    node_group_aware: bool,
}

impl Topology {
    pub fn new(node_group_aware: bool) -> Self {
        Self { node_group_aware }
    }

    pub fn node_group_aware(&self) -> bool {
        self.node_group_aware
    }

    pub fn same_rack(&self, a: &NodeInfo, b: &NodeInfo) -> bool {
        a.rack == b.rack
    }

    pub fn same_node_group(&self, a: &NodeInfo, b: &NodeInfo) -> bool {
        match (&a.node_group, &b.node_group) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

/// Locality constraint applied during one pairing pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Matcher {
    SameNodeGroup,
    SameRack,
    Any,
}

impl Matcher {
    pub fn matches(&self, topology: &Topology, a: &NodeInfo, b: &NodeInfo) -> bool {
        match self {
            Matcher::SameNodeGroup => topology.same_node_group(a, b),
            Matcher::SameRack => topology.same_rack(a, b),
            Matcher::Any => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(uuid: &str, rack: &str, group: Option<&str>) -> NodeInfo {
        NodeInfo {
            uuid: uuid.to_string(),
            hostname: format!("{uuid}.example"),
            ip: "10.0.0.1".to_string(),
            transfer_addr: "10.0.0.1:9866".to_string(),
            rack: rack.to_string(),
            node_group: group.map(|g| g.to_string()),
            decommissioning: false,
        }
    }

    #[test]
    fn matchers_follow_their_locality() {
        let topology = Topology::new(true);
        let a = node("a", "/r1", Some("/r1/g1"));
        let b = node("b", "/r1", Some("/r1/g1"));
        let c = node("c", "/r2", Some("/r2/g1"));

        assert!(Matcher::SameNodeGroup.matches(&topology, &a, &b));
        assert!(!Matcher::SameNodeGroup.matches(&topology, &a, &c));
        assert!(Matcher::SameRack.matches(&topology, &a, &b));
        assert!(!Matcher::SameRack.matches(&topology, &a, &c));
        assert!(Matcher::Any.matches(&topology, &a, &c));
    }

    #[test]
    fn node_groups_require_both_sides() {
        let topology = Topology::new(true);
        let a = node("a", "/r1", Some("/r1/g1"));
        let b = node("b", "/r1", None);
        assert!(!topology.same_node_group(&a, &b));
    }
}
