//! Shuffle hot region scheduler: moves a replica of a random write-hot
//! shard to a random node that does not hold it.

use rand::seq::SliceRandom;
use std::sync::Arc;
use tracing::debug;

use shardplace_core::{Cluster, Node, Operator, OperatorKind, Result, ScheduleError, Shard};

use crate::affinity::LabelAffinity;
use crate::builder::create_move_peer_operator;
use crate::controller::OperatorController;
use crate::filter::{
    ExcludedFilter, Filter, Filters, LabelMemoFilter, StateFilter, StorageThresholdFilter,
};
use crate::selector::RandomSelector;

use super::hot_region::HotStats;
use super::registry::{parse_arg, SchedulerContext, SchedulerRegistry};
use super::{is_healthy, BaseScheduler, Scheduler};

pub const TYPE: &str = "shuffle-hot-region";

const DEFAULT_LIMIT: u64 = 1;

const SOURCE_FILTER: StateFilter = StateFilter {
    transfer_leader: false,
    move_region: true,
};

pub(crate) fn register(registry: &mut SchedulerRegistry) {
    registry.register(TYPE, create);
}

fn create(ctx: &SchedulerContext, args: &[String]) -> Result<Arc<dyn Scheduler>> {
    let limit = match args.len() {
        0 => DEFAULT_LIMIT,
        1 => parse_arg(args, 0, "limit")?,
        n => {
            return Err(ScheduleError::invalid_args(format!(
                "{} takes at most one argument, got {}",
                TYPE, n
            )))
        }
    };
    Ok(Arc::new(ShuffleHotRegionScheduler::new(
        ctx.controller.clone(),
        ctx.affinity.clone(),
        limit,
    )))
}

pub struct ShuffleHotRegionScheduler {
    base: BaseScheduler,
    affinity: Arc<LabelAffinity>,
    limit: u64,
    selector: RandomSelector,
}

impl ShuffleHotRegionScheduler {
    pub fn new(controller: Arc<OperatorController>, affinity: Arc<LabelAffinity>, limit: u64) -> Self {
        let filters: Filters = vec![
            Box::new(SOURCE_FILTER),
            Box::new(StorageThresholdFilter),
        ];
        Self {
            base: BaseScheduler::new(controller),
            affinity,
            limit,
            selector: RandomSelector::new(filters),
        }
    }

    fn shuffle(&self, cluster: &dyn Cluster, shard: &Shard, nodes: &[Node]) -> Option<Operator> {
        let opts = cluster.options();
        let sources: Vec<&Node> = nodes
            .iter()
            .filter(|n| shard.replica_on(n.id).is_some())
            .filter(|n| !SOURCE_FILTER.filter_source(&opts, n))
            .collect();
        let source = sources.choose(&mut rand::thread_rng())?;

        let excluded: Vec<Box<dyn Filter>> = vec![
            Box::new(ExcludedFilter::new([], shard.node_ids())),
            Box::new(LabelMemoFilter::new(&self.affinity, shard.id)),
        ];
        let target = self.selector.select_target(&opts, nodes, &excluded)?;
        create_move_peer_operator(
            "random-move-hot-region",
            cluster,
            shard,
            OperatorKind::HOT_REGION,
            source.id,
            target.id,
        )
        .map_err(|e| debug!(shard_id = shard.id, error = %e, "Cannot shuffle hot replica"))
        .ok()
    }
}

impl Scheduler for ShuffleHotRegionScheduler {
    fn name(&self) -> &str {
        "shuffle-hot-region-scheduler"
    }

    fn scheduler_type(&self) -> &'static str {
        TYPE
    }

    fn args(&self) -> Vec<String> {
        vec![self.limit.to_string()]
    }

    fn is_schedule_allowed(&self, _cluster: &dyn Cluster) -> bool {
        self.base.allow(OperatorKind::HOT_REGION, self.limit)
    }

    fn schedule(&self, cluster: &dyn Cluster) -> Vec<Operator> {
        let opts = cluster.options();
        let stats = HotStats::collect(cluster, opts.hot_region_write_threshold);
        let hot: Vec<&Shard> = stats
            .shards
            .iter()
            .filter(|s| is_healthy(s, opts.max_replicas))
            .collect();
        let Some(shard) = hot.choose(&mut rand::thread_rng()) else {
            return Vec::new();
        };
        let nodes = cluster.nodes();
        self.shuffle(cluster, shard, &nodes).into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedulers::testutil::{args, make_context};
    use shardplace_core::MemoryCluster;

    #[test]
    fn test_moves_hot_shard_only() {
        let cluster = Arc::new(MemoryCluster::default());
        for id in 1..=4 {
            cluster.add_labeled_node(id, &[]);
        }
        cluster.add_leader_shard(1, b"", b"m", 1, &[2, 3]).unwrap();
        cluster.add_leader_shard(2, b"m", b"", 1, &[2, 3]).unwrap();
        cluster
            .update_shard(2, |s| s.written_bytes = 8 * 1024 * 1024)
            .unwrap();
        let ctx = make_context(&cluster);
        let scheduler = create(&ctx, &[]).unwrap();
        assert_eq!(scheduler.args(), args(&["1"]));

        let ops = scheduler.schedule(cluster.as_ref());
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].shard_id(), 2);
        assert!(ops[0].kind().contains(OperatorKind::HOT_REGION));
        assert!(ops[0].limited_nodes().contains(&4));
    }

    #[test]
    fn test_limit_argument() {
        let cluster = Arc::new(MemoryCluster::default());
        let ctx = make_context(&cluster);
        let scheduler = create(&ctx, &args(&["0"])).unwrap();
        assert!(!scheduler.is_schedule_allowed(cluster.as_ref()));
        assert!(create(&ctx, &args(&["x"])).is_err());
        assert!(create(&ctx, &args(&["1", "2"])).is_err());
    }
}
