//! Shuffle region scheduler: moves a random replica of a random shard to a
//! random node that does not hold the shard.

use rand::seq::SliceRandom;
use std::sync::Arc;
use tracing::debug;

use shardplace_core::{Cluster, Operator, OperatorKind, Result, Shard};

use crate::affinity::LabelAffinity;
use crate::builder::create_move_peer_operator;
use crate::controller::OperatorController;
use crate::filter::{ExcludedFilter, Filter, Filters, LabelMemoFilter, StateFilter};
use crate::selector::RandomSelector;

use super::registry::{expect_args, SchedulerContext, SchedulerRegistry};
use super::{is_healthy, BaseScheduler, Scheduler};

pub const TYPE: &str = "shuffle-region";

pub(crate) fn register(registry: &mut SchedulerRegistry) {
    registry.register(TYPE, create);
}

fn create(ctx: &SchedulerContext, args: &[String]) -> Result<Arc<dyn Scheduler>> {
    expect_args(TYPE, args, 0)?;
    Ok(Arc::new(ShuffleRegionScheduler::new(
        ctx.controller.clone(),
        ctx.affinity.clone(),
    )))
}

pub struct ShuffleRegionScheduler {
    base: BaseScheduler,
    affinity: Arc<LabelAffinity>,
    selector: RandomSelector,
}

impl ShuffleRegionScheduler {
    pub fn new(controller: Arc<OperatorController>, affinity: Arc<LabelAffinity>) -> Self {
        let filters: Filters = vec![Box::new(StateFilter {
            transfer_leader: false,
            move_region: true,
        })];
        Self {
            base: BaseScheduler::new(controller),
            affinity,
            selector: RandomSelector::new(filters),
        }
    }
}

impl Scheduler for ShuffleRegionScheduler {
    fn name(&self) -> &str {
        "shuffle-region-scheduler"
    }

    fn scheduler_type(&self) -> &'static str {
        TYPE
    }

    fn is_schedule_allowed(&self, cluster: &dyn Cluster) -> bool {
        self.base
            .allow(OperatorKind::REGION, cluster.options().region_schedule_limit)
    }

    fn schedule(&self, cluster: &dyn Cluster) -> Vec<Operator> {
        let opts = cluster.options();
        let nodes = cluster.nodes();
        let Some(source) = self.selector.select_source(&opts, &nodes) else {
            return Vec::new();
        };
        let shards: Vec<Shard> = cluster
            .shards_on_node(source.id)
            .into_iter()
            .filter(|s| is_healthy(s, opts.max_replicas))
            .collect();
        let Some(shard) = shards.choose(&mut rand::thread_rng()) else {
            return Vec::new();
        };

        let excluded: Vec<Box<dyn Filter>> = vec![
            Box::new(ExcludedFilter::new([], shard.node_ids())),
            Box::new(LabelMemoFilter::new(&self.affinity, shard.id)),
        ];
        let Some(target) = self.selector.select_target(&opts, &nodes, &excluded) else {
            debug!(shard_id = shard.id, "No node left to shuffle to");
            return Vec::new();
        };
        match create_move_peer_operator(
            "shuffle-region",
            cluster,
            shard,
            OperatorKind::ADMIN,
            source.id,
            target.id,
        ) {
            Ok(op) => vec![op],
            Err(e) => {
                debug!(shard_id = shard.id, error = %e, "Cannot shuffle replica");
                Vec::new()
            }
        }
    }
}
