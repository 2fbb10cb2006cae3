use std::collections::HashMap;

use clap::ValueEnum;
use serde::Deserialize;

use crate::cluster::StorageType;
use crate::service::DatanodeStorageReport;

/// Pluggable utilization definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
pub enum PolicyKind {
    /// One figure per node: every storage type summed together.
    Node,
    /// One figure per storage type on each node.
    Pool,
}

#[derive(Debug, Clone, Copy, Default)]
struct Totals {
    capacity: u64,
    used: u64,
}

impl Totals {
    fn utilization(&self) -> Option<f64> {
        (self.capacity > 0).then(|| self.used as f64 / self.capacity as f64)
    }
}

/// Accumulates cluster capacity and usage, then answers per-type cluster
/// averages and per-node utilization according to the active policy.
pub struct UtilizationPolicy {
    kind: PolicyKind,
    per_type: HashMap<StorageType, Totals>,
    node_wide: Totals,
}

impl UtilizationPolicy {
    pub fn new(kind: PolicyKind) -> Self {
        Self {
            kind,
            per_type: HashMap::new(),
            node_wide: Totals::default(),
        }
    }

    pub fn kind(&self) -> PolicyKind {
        self.kind
    }

    pub fn reset(&mut self) {
        self.per_type.clear();
        self.node_wide = Totals::default();
    }

    pub fn accumulate(&mut self, report: &DatanodeStorageReport) {
        for storage in &report.storages {
            match self.kind {
                PolicyKind::Node => {
                    self.node_wide.capacity += storage.capacity;
                    self.node_wide.used += storage.dfs_used;
                }
                PolicyKind::Pool => {
                    let totals = self.per_type.entry(storage.kind).or_default();
                    totals.capacity += storage.capacity;
                    totals.used += storage.dfs_used;
                }
            }
        }
    }

    /// Cluster mean for the given type; `None` while no capacity of that
    /// type has been accumulated.
    pub fn average(&self, kind: StorageType) -> Option<f64> {
        match self.kind {
            PolicyKind::Node => self.node_wide.utilization(),
            PolicyKind::Pool => self.per_type.get(&kind)?.utilization(),
        }
    }

    /// Utilization one node shows for the given type.
    pub fn utilization(&self, report: &DatanodeStorageReport, kind: StorageType) -> Option<f64> {
        let mut totals = Totals::default();
        for storage in &report.storages {
            if self.kind == PolicyKind::Pool && storage.kind != kind {
                continue;
            }
            totals.capacity += storage.capacity;
            totals.used += storage.dfs_used;
        }
        totals.utilization()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::NodeInfo;
    use crate::service::StorageReport;

    fn report(uuid: &str, storages: Vec<(StorageType, u64, u64)>) -> DatanodeStorageReport {
        DatanodeStorageReport {
            node: NodeInfo {
                uuid: uuid.to_string(),
                hostname: format!("{uuid}.example"),
                ip: "10.0.0.1".to_string(),
                transfer_addr: "10.0.0.1:9866".to_string(),
                rack: "/r1".to_string(),
                node_group: None,
                decommissioning: false,
            },
            storages: storages
                .into_iter()
                .map(|(kind, capacity, dfs_used)| StorageReport {
                    kind,
                    capacity,
                    dfs_used,
                    remaining: capacity - dfs_used,
                })
                .collect(),
        }
    }

    #[test]
    fn node_policy_sums_all_storage_types() {
        let mut policy = UtilizationPolicy::new(PolicyKind::Node);
        let a = report("a", vec![(StorageType::Disk, 100, 80), (StorageType::Ssd, 100, 0)]);
        let b = report("b", vec![(StorageType::Disk, 200, 40)]);
        policy.accumulate(&a);
        policy.accumulate(&b);

        assert_eq!(policy.average(StorageType::Disk), Some(0.3));
        // Same mean regardless of type under the node policy.
        assert_eq!(policy.average(StorageType::Ssd), Some(0.3));
        assert_eq!(policy.utilization(&a, StorageType::Disk), Some(0.4));
    }

    #[test]
    fn pool_policy_keeps_types_apart() {
        let mut policy = UtilizationPolicy::new(PolicyKind::Pool);
        let a = report("a", vec![(StorageType::Disk, 100, 80), (StorageType::Ssd, 100, 10)]);
        let b = report("b", vec![(StorageType::Disk, 100, 20)]);
        policy.accumulate(&a);
        policy.accumulate(&b);

        assert_eq!(policy.average(StorageType::Disk), Some(0.5));
        assert_eq!(policy.average(StorageType::Ssd), Some(0.1));
        assert_eq!(policy.average(StorageType::Archive), None);
        assert_eq!(policy.utilization(&a, StorageType::Ssd), Some(0.1));
    }

    #[test]
    fn reset_clears_accumulated_state() {
        let mut policy = UtilizationPolicy::new(PolicyKind::Pool);
        policy.accumulate(&report("a", vec![(StorageType::Disk, 100, 50)]));
        policy.reset();
        assert_eq!(policy.average(StorageType::Disk), None);
    }
}
