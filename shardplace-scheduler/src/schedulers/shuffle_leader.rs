//! Shuffle leader scheduler: hands the leadership of a random shard to a
//! randomly chosen node holding one of its followers. Used to exercise
//! leader movement in test clusters.

use rand::seq::SliceRandom;
use std::sync::Arc;
use tracing::debug;

use shardplace_core::{Cluster, Operator, OperatorKind, Result, Shard};

use crate::builder::create_transfer_leader_operator;
use crate::controller::OperatorController;
use crate::filter::{Filters, StateFilter};
use crate::selector::RandomSelector;

use super::registry::{expect_args, SchedulerContext, SchedulerRegistry};
use super::{BaseScheduler, Scheduler};

pub const TYPE: &str = "shuffle-leader";

pub(crate) fn register(registry: &mut SchedulerRegistry) {
    registry.register(TYPE, create);
}

fn create(ctx: &SchedulerContext, args: &[String]) -> Result<Arc<dyn Scheduler>> {
    expect_args(TYPE, args, 0)?;
    Ok(Arc::new(ShuffleLeaderScheduler::new(ctx.controller.clone())))
}

pub struct ShuffleLeaderScheduler {
    base: BaseScheduler,
    selector: RandomSelector,
}

impl ShuffleLeaderScheduler {
    pub fn new(controller: Arc<OperatorController>) -> Self {
        let filters: Filters = vec![Box::new(StateFilter {
            transfer_leader: true,
            move_region: false,
        })];
        Self {
            base: BaseScheduler::new(controller),
            selector: RandomSelector::new(filters),
        }
    }
}

impl Scheduler for ShuffleLeaderScheduler {
    fn name(&self) -> &str {
        "shuffle-leader-scheduler"
    }

    fn scheduler_type(&self) -> &'static str {
        TYPE
    }

    fn is_schedule_allowed(&self, cluster: &dyn Cluster) -> bool {
        self.base
            .allow(OperatorKind::LEADER, cluster.options().leader_schedule_limit)
    }

    fn schedule(&self, cluster: &dyn Cluster) -> Vec<Operator> {
        let opts = cluster.options();
        let nodes = cluster.nodes();
        let Some(target) = self.selector.select_target(&opts, &nodes, &[]) else {
            return Vec::new();
        };

        let shards: Vec<Shard> = cluster
            .shards_on_node(target.id)
            .into_iter()
            .filter(|s| s.leader_node() != Some(target.id) && s.voter_on(target.id).is_some())
            .collect();
        let Some(shard) = shards.choose(&mut rand::thread_rng()) else {
            debug!(node_id = target.id, "No follower to promote on node");
            return Vec::new();
        };
        match create_transfer_leader_operator("shuffle-leader", shard, target.id, OperatorKind::ADMIN) {
            Ok(op) => vec![op],
            Err(e) => {
                debug!(shard_id = shard.id, error = %e, "Cannot shuffle leader");
                Vec::new()
            }
        }
    }
}
