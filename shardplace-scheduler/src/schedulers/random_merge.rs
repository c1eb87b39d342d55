//! Random merge scheduler: merges a random small shard into one of its
//! key-range neighbours. With one-way merge enabled only the successor is
//! considered.

use rand::seq::SliceRandom;
use rand::Rng;
use std::sync::Arc;
use tracing::debug;

use shardplace_core::{Cluster, Operator, OperatorKind, Result, Shard};

use crate::builder::create_merge_region_operator;
use crate::controller::OperatorController;
use crate::filter::{Filters, StateFilter};
use crate::selector::RandomSelector;

use super::registry::{expect_args, SchedulerContext, SchedulerRegistry};
use super::{is_healthy, BaseScheduler, Scheduler};

pub const TYPE: &str = "random-merge";

pub(crate) fn register(registry: &mut SchedulerRegistry) {
    registry.register(TYPE, create);
}

fn create(ctx: &SchedulerContext, args: &[String]) -> Result<Arc<dyn Scheduler>> {
    expect_args(TYPE, args, 0)?;
    Ok(Arc::new(RandomMergeScheduler::new(ctx.controller.clone())))
}

pub struct RandomMergeScheduler {
    base: BaseScheduler,
    selector: RandomSelector,
}

impl RandomMergeScheduler {
    pub fn new(controller: Arc<OperatorController>) -> Self {
        let filters: Filters = vec![Box::new(StateFilter {
            transfer_leader: false,
            move_region: true,
        })];
        Self {
            base: BaseScheduler::new(controller),
            selector: RandomSelector::new(filters),
        }
    }

    fn pick_target(&self, cluster: &dyn Cluster, shard: &Shard) -> Option<Shard> {
        let (prev, next) = cluster.adjacent_shards(shard);
        if cluster.options().enable_one_way_merge {
            return next;
        }
        match (prev, next) {
            (Some(prev), Some(next)) => {
                if rand::thread_rng().gen_bool(0.5) {
                    Some(prev)
                } else {
                    Some(next)
                }
            }
            (prev, next) => prev.or(next),
        }
    }
}

impl Scheduler for RandomMergeScheduler {
    fn name(&self) -> &str {
        "random-merge-scheduler"
    }

    fn scheduler_type(&self) -> &'static str {
        TYPE
    }

    fn is_schedule_allowed(&self, cluster: &dyn Cluster) -> bool {
        self.base
            .allow(OperatorKind::MERGE, cluster.options().merge_schedule_limit)
    }

    fn schedule(&self, cluster: &dyn Cluster) -> Vec<Operator> {
        let opts = cluster.options();
        let nodes = cluster.nodes();
        let Some(node) = self.selector.select_source(&opts, &nodes) else {
            return Vec::new();
        };
        let candidates: Vec<Shard> = cluster
            .shards_on_node(node.id)
            .into_iter()
            .filter(|s| is_healthy(s, opts.max_replicas) && s.approximate_size <= opts.max_merge_region_size)
            .collect();
        let Some(shard) = candidates.choose(&mut rand::thread_rng()) else {
            return Vec::new();
        };
        let Some(target) = self.pick_target(cluster, shard) else {
            debug!(shard_id = shard.id, "No neighbour to merge with");
            return Vec::new();
        };
        if !is_healthy(&target, opts.max_replicas) {
            return Vec::new();
        }

        match create_merge_region_operator("random-merge", cluster, shard, &target, OperatorKind::ADMIN) {
            Ok(ops) => ops,
            Err(e) => {
                debug!(shard_id = shard.id, target_id = target.id, error = %e, "Cannot merge");
                Vec::new()
            }
        }
    }
}
