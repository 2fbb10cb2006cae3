use std::sync::Arc;

use log::debug;

use crate::cluster::node::{Source, StorageGroup};
use crate::topology::Matcher;

use super::classifier::Classification;
use super::EngineShared;

/// Match sources to targets in three passes with progressively looser
/// locality, each pass visiting the bucket pairs over/under, over/below
/// and under/above. Returns the total bytes scheduled onto sources.
pub(crate) fn pair(shared: &EngineShared, c: &mut Classification) -> u64 {
    let mut matchers = vec![Matcher::SameRack, Matcher::Any];
    if shared.topology.node_group_aware() {
        matchers.insert(0, Matcher::SameNodeGroup);
    }
    for matcher in matchers {
        choose_targets(shared, &mut c.over_utilized, &mut c.under_utilized, matcher);
        choose_targets(
            shared,
            &mut c.over_utilized,
            &mut c.below_avg_utilized,
            matcher,
        );
        choose_sources(
            shared,
            &mut c.under_utilized,
            &mut c.above_avg_utilized,
            matcher,
        );
    }
    shared
        .sources
        .lock()
        .iter()
        .map(|s| s.group().scheduled())
        .sum()
}

/// Walk the source bucket and pick matching targets for each entry.
/// Exhausted groups leave their bucket so later passes skip them.
fn choose_targets(
    shared: &EngineShared,
    sources: &mut Vec<Arc<Source>>,
    targets: &mut Vec<Arc<StorageGroup>>,
    matcher: Matcher,
) {
    sources.retain(|source| {
        while source.group().has_space() {
            let found = targets.iter().position(|target| {
                target.has_space()
                    && target.kind() == source.group().kind()
                    && matcher.matches(
                        &shared.topology,
                        source.group().node().info(),
                        target.node().info(),
                    )
            });
            let Some(index) = found else { break };
            let target = targets[index].clone();
            match_pair(shared, source, &target);
            if !target.has_space() {
                targets.remove(index);
            }
        }
        source.group().has_space()
    });
}

/// Walk the target bucket and pick matching sources for each entry.
fn choose_sources(
    shared: &EngineShared,
    targets: &mut Vec<Arc<StorageGroup>>,
    sources: &mut Vec<Arc<Source>>,
    matcher: Matcher,
) {
    targets.retain(|target| {
        while target.has_space() {
            let found = sources.iter().position(|source| {
                source.group().has_space()
                    && source.group().kind() == target.kind()
                    && matcher.matches(
                        &shared.topology,
                        source.group().node().info(),
                        target.node().info(),
                    )
            });
            let Some(index) = found else { break };
            let source = sources[index].clone();
            match_pair(shared, &source, target);
            if !source.group().has_space() {
                sources.remove(index);
            }
        }
        target.has_space()
    });
}

/// Reserve `min(available, available)` bytes on both sides and record the
/// quota as a task on the source.
fn match_pair(shared: &EngineShared, source: &Arc<Source>, target: &Arc<StorageGroup>) {
    let size = source
        .group()
        .available_to_move()
        .min(target.available_to_move());
    if size == 0 {
        return;
    }
    source.add_task(target.clone(), size);
    source.group().inc_scheduled(size);
    target.inc_scheduled(size);
    debug!(
        "paired {} -> {} for {}",
        source.group().id(),
        target.id(),
        indicatif::HumanBytes(size)
    );

    let mut sources = shared.sources.lock();
    if !sources.iter().any(|s| Arc::ptr_eq(s, source)) {
        sources.push(source.clone());
    }
    let mut targets = shared.targets.lock();
    if !targets.iter().any(|t| Arc::ptr_eq(t, target)) {
        targets.push(target.clone());
    }
}
