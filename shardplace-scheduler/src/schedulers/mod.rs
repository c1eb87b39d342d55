//! Schedulers
//!
//! A scheduler is a named unit of recurring decision-making. On every tick
//! the coordinator:
//! - checks the scheduler's run mode window
//! - asks `is_schedule_allowed` whether the relevant operator budget has room
//! - collects the operators returned by `schedule`
//!
//! Ticks that propose nothing grow the scheduler's interval; an accepted
//! operator resets it to the minimum.

pub mod base;
pub mod registry;

pub mod adjacent_region;
pub mod balance_leader;
pub mod balance_region;
pub mod evict_leader;
pub mod grant_leader;
pub mod hot_region;
pub mod label_affinity;
pub mod random_merge;
pub mod scatter_range;
pub mod shuffle_hot_region;
pub mod shuffle_leader;
pub mod shuffle_region;
pub mod transfer_leader;
pub mod transfer_to_label;
pub mod transfer_to_store;

use std::time::Duration;

use shardplace_core::{Cluster, Node, Operator, ResourceKind, Result, ScheduleOptions, Shard};

pub use base::{
    interval_grow, BaseScheduler, IntervalGrowth, ScheduleMode, MAX_SCHEDULE_INTERVAL,
    MIN_SCHEDULE_INTERVAL, MIN_SLOW_SCHEDULE_INTERVAL,
};
pub use registry::{SchedulerContext, SchedulerFactory, SchedulerRegistry};

/// Number of random shards a balance scheduler tries per tick
const BALANCE_RETRY_LIMIT: usize = 10;

/// A recurring placement decision maker
pub trait Scheduler: Send + Sync {
    /// Unique instance name
    fn name(&self) -> &str;

    /// Registry type name
    fn scheduler_type(&self) -> &'static str;

    /// Constructor arguments, persisted so the scheduler can be rebuilt
    fn args(&self) -> Vec<String> {
        Vec::new()
    }

    fn mode(&self) -> ScheduleMode {
        ScheduleMode::Periodic
    }

    fn min_interval(&self) -> Duration {
        MIN_SCHEDULE_INTERVAL
    }

    fn next_interval(&self, prev: Duration) -> Duration {
        interval_grow(prev, MAX_SCHEDULE_INTERVAL, IntervalGrowth::Exponential)
    }

    /// Reserve resources before the first tick
    fn prepare(&self, _cluster: &dyn Cluster) -> Result<()> {
        Ok(())
    }

    /// Release what `prepare` reserved
    fn cleanup(&self, _cluster: &dyn Cluster) {}

    fn is_schedule_allowed(&self, cluster: &dyn Cluster) -> bool;

    fn schedule(&self, cluster: &dyn Cluster) -> Vec<Operator>;
}

/// Moving `shard` from `source` to `target` narrows their score gap by
/// more than the tolerance instead of reversing it
pub(crate) fn should_balance(
    opts: &ScheduleOptions,
    source: &Node,
    target: &Node,
    shard: &Shard,
    kind: ResourceKind,
) -> bool {
    let size = shard.approximate_size.max(1);
    let tolerant = ((size as f64) * opts.tolerant_size_ratio).ceil() as i64;
    let source_score =
        source.resource_score(kind, opts.high_space_ratio, opts.low_space_ratio, -tolerant);
    let target_score =
        target.resource_score(kind, opts.high_space_ratio, opts.low_space_ratio, tolerant);
    source_score > target_score
}

/// Nodes currently holding a replica of `shard`
pub(crate) fn shard_nodes(cluster: &dyn Cluster, shard: &Shard) -> Vec<Node> {
    shard
        .replicas
        .iter()
        .filter_map(|r| cluster.get_node(r.node_id))
        .collect()
}

/// Shards that are safe to move: full voter set, no down or pending replica
pub(crate) fn is_healthy(shard: &Shard, max_replicas: usize) -> bool {
    !shard.has_abnormal_peer(max_replicas)
}

/// Register every built-in scheduler type
pub fn register_all(registry: &mut SchedulerRegistry) {
    adjacent_region::register(registry);
    balance_leader::register(registry);
    balance_region::register(registry);
    evict_leader::register(registry);
    grant_leader::register(registry);
    hot_region::register(registry);
    label_affinity::register(registry);
    random_merge::register(registry);
    scatter_range::register(registry);
    shuffle_hot_region::register(registry);
    shuffle_leader::register(registry);
    shuffle_region::register(registry);
    transfer_leader::register(registry);
    transfer_to_label::register(registry);
    transfer_to_store::register(registry);
}


#[cfg(test)]
mod tests {
    use super::*;
    use shardplace_core::MemoryCluster;

    fn make_node(id: u64, region_size: i64) -> Node {
        let mut node = Node::new(id, format!("127.0.0.1:{}", 20160 + id));
        node.region_size = region_size;
        node.leader_size = region_size;
        node
    }

    #[test]
    fn test_should_balance_tolerance() {
        let opts = ScheduleOptions::default();
        let mut shard = Shard::new(1, b"", b"");
        shard.approximate_size = 10;

        // gap 100 > 2 * 10
        assert!(should_balance(&opts, &make_node(1, 100), &make_node(2, 0), &shard, ResourceKind::Region));
        // gap 15 < 2 * 10 would just flip the imbalance
        assert!(!should_balance(&opts, &make_node(1, 15), &make_node(2, 0), &shard, ResourceKind::Leader));
        assert!(!should_balance(&opts, &make_node(1, 0), &make_node(2, 100), &shard, ResourceKind::Region));
    }

    #[test]
    fn test_shard_nodes_skips_unknown() {
        let cluster = MemoryCluster::default();
        cluster.add_labeled_node(1, &[]);
        cluster.add_labeled_node(2, &[]);
        cluster.add_leader_shard(1, b"", b"", 1, &[2]).unwrap();
        let shard = cluster.get_shard(1).unwrap();
        let ids: Vec<_> = shard_nodes(&cluster, &shard).iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert!(!is_healthy(&shard, 3));
        assert!(is_healthy(&shard, 2));
    }

    #[test]
    fn test_registry_knows_every_type() {
        let registry = SchedulerRegistry::with_builtin();
        let types = registry.types();
        for name in [
            "adjacent-region",
            "balance-leader",
            "balance-region",
            "evict-leader",
            "grant-leader",
            "hot-region",
            "label-affinity-migrate",
            "random-merge",
            "scatter-range",
            "shuffle-hot-region",
            "shuffle-leader",
            "shuffle-region",
            "transfer-leader",
            "transfer-to-label",
            "transfer-to-store",
        ] {
            assert!(types.contains(&name), "missing {}", name);
        }
    }
}
