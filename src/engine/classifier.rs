use std::sync::Arc;

use log::{debug, info};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use strum::IntoEnumIterator;

use crate::cluster::node::{DNode, Source, StorageGroup};
use crate::cluster::{NodeInfo, StorageType};
use crate::policy::UtilizationPolicy;
use crate::service::DatanodeStorageReport;

use super::EngineShared;

/// A single group never schedules more than this per iteration.
pub(crate) const MAX_SIZE_TO_MOVE: u64 = 10 * 1024 * 1024 * 1024;

/// The four utilization buckets of one iteration. Source-side buckets
/// carry `Source` wrappers, target-side buckets the bare groups. Bucket
/// membership is fixed until the next classification.
pub(crate) struct Classification {
    pub over_utilized: Vec<Arc<Source>>,
    pub above_avg_utilized: Vec<Arc<Source>>,
    pub below_avg_utilized: Vec<Arc<StorageGroup>>,
    pub under_utilized: Vec<Arc<StorageGroup>>,
    /// `max(Σ overloaded, Σ underloaded)` — the cluster cannot move more
    /// than the larger of the excess above the band and the deficit
    /// below it.
    pub bytes_left: u64,
}

pub(crate) fn pct2bytes(fraction: f64, capacity: u64) -> u64 {
    (fraction * capacity as f64) as u64
}

fn should_ignore(shared: &EngineShared, node: &NodeInfo) -> bool {
    if node.decommissioning {
        debug!("ignoring {}: decommissioning", node.uuid);
        return true;
    }
    if shared.excluded.matches(node) {
        debug!("ignoring {}: excluded", node.uuid);
        return true;
    }
    if !shared.included.is_empty() && !shared.included.matches(node) {
        debug!("ignoring {}: not in the include list", node.uuid);
        return true;
    }
    false
}

/// Consume the node reports, compute per-type cluster means, and assign
/// every storage group of every participating node to one of the four
/// buckets. The node order is shuffled so that rack-local pairings do not
/// systematically favor earlier-seen nodes.
pub(crate) fn classify(
    policy: &mut UtilizationPolicy,
    shared: &EngineShared,
    rng: &mut StdRng,
    reports: Vec<DatanodeStorageReport>,
) -> Classification {
    policy.reset();
    let mut reports: Vec<DatanodeStorageReport> = reports
        .into_iter()
        .filter(|r| !should_ignore(shared, &r.node))
        .collect();
    for report in &reports {
        policy.accumulate(report);
    }
    reports.shuffle(rng);

    for kind in StorageType::iter() {
        if let Some(avg) = policy.average(kind) {
            debug!("cluster average for {kind:?}: {:.2}%", avg * 100.0);
        }
    }

    let mut classification = Classification {
        over_utilized: Vec::new(),
        above_avg_utilized: Vec::new(),
        below_avg_utilized: Vec::new(),
        under_utilized: Vec::new(),
        bytes_left: 0,
    };
    let mut overloaded_bytes = 0u64;
    let mut underloaded_bytes = 0u64;

    let mut cluster = shared.cluster.lock();
    let mut storage_groups = shared.storage_groups.lock();
    for report in &reports {
        let node = Arc::new(DNode::new(
            report.node.clone(),
            shared.config.max_concurrent_moves,
        ));
        cluster.insert(node.uuid().to_string(), node.clone());

        let mut kinds: Vec<StorageType> = Vec::new();
        for storage in &report.storages {
            if !kinds.contains(&storage.kind) {
                kinds.push(storage.kind);
            }
        }
        for kind in kinds {
            let (capacity, remaining) = report
                .storages
                .iter()
                .filter(|s| s.kind == kind)
                .fold((0u64, 0u64), |(c, r), s| (c + s.capacity, r + s.remaining));
            if capacity == 0 {
                continue;
            }
            let (Some(avg), Some(utilization)) =
                (policy.average(kind), policy.utilization(report, kind))
            else {
                continue;
            };
            let deviation = utilization - avg;
            let beyond_band = deviation.abs() - shared.threshold;
            let band = shared.threshold.min(deviation.abs());
            let mut max_movable = MAX_SIZE_TO_MOVE.min(pct2bytes(band, capacity));
            if deviation <= 0.0 {
                max_movable = max_movable.min(remaining);
            }

            let group = Arc::new(StorageGroup::new(
                node.clone(),
                kind,
                utilization,
                max_movable,
            ));
            storage_groups.insert(group.id(), group.clone());
            if deviation > 0.0 {
                let source = Arc::new(Source::new(group));
                if beyond_band > 0.0 {
                    overloaded_bytes += pct2bytes(beyond_band, capacity);
                    classification.over_utilized.push(source);
                } else {
                    classification.above_avg_utilized.push(source);
                }
            } else if beyond_band > 0.0 {
                underloaded_bytes += pct2bytes(beyond_band, capacity);
                classification.under_utilized.push(group);
            } else {
                classification.below_avg_utilized.push(group);
            }
        }
    }

    classification.bytes_left = overloaded_bytes.max(underloaded_bytes);
    info!(
        "{}: over-utilized {}, above-average {}, below-average {}, under-utilized {}, bytes left {}",
        shared.connector.name(),
        classification.over_utilized.len(),
        classification.above_avg_utilized.len(),
        classification.below_avg_utilized.len(),
        classification.under_utilized.len(),
        indicatif::HumanBytes(classification.bytes_left),
    );
    classification
}
