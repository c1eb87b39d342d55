//! Evict leader scheduler
//!
//! Drains leadership from one node. The node is blocked while the
//! scheduler exists so no other scheduler moves leaders back onto it.

use rand::seq::SliceRandom;
use std::sync::Arc;
use tracing::{debug, info};

use shardplace_core::{Cluster, NodeId, Operator, OperatorKind, Result, Shard};

use crate::builder::create_transfer_leader_operator;
use crate::controller::OperatorController;
use crate::filter::{Filters, StateFilter};
use crate::selector::RandomSelector;

use super::registry::{expect_args, parse_arg, SchedulerContext, SchedulerRegistry};
use super::{BaseScheduler, Scheduler, BALANCE_RETRY_LIMIT};

pub const TYPE: &str = "evict-leader";

pub(crate) fn register(registry: &mut SchedulerRegistry) {
    registry.register(TYPE, create);
}

fn create(ctx: &SchedulerContext, args: &[String]) -> Result<Arc<dyn Scheduler>> {
    expect_args(TYPE, args, 1)?;
    let node_id = parse_arg(args, 0, "node id")?;
    Ok(Arc::new(EvictLeaderScheduler::new(ctx.controller.clone(), node_id)))
}

pub struct EvictLeaderScheduler {
    base: BaseScheduler,
    name: String,
    node_id: NodeId,
    selector: RandomSelector,
}

impl EvictLeaderScheduler {
    pub fn new(controller: Arc<OperatorController>, node_id: NodeId) -> Self {
        let filters: Filters = vec![Box::new(StateFilter {
            transfer_leader: true,
            move_region: false,
        })];
        Self {
            base: BaseScheduler::new(controller),
            name: format!("evict-leader-scheduler-{}", node_id),
            node_id,
            selector: RandomSelector::new(filters),
        }
    }
}

impl Scheduler for EvictLeaderScheduler {
    fn name(&self) -> &str {
        &self.name
    }

    fn scheduler_type(&self) -> &'static str {
        TYPE
    }

    fn args(&self) -> Vec<String> {
        vec![self.node_id.to_string()]
    }

    fn prepare(&self, cluster: &dyn Cluster) -> Result<()> {
        cluster.block_node(self.node_id)?;
        info!(node_id = self.node_id, "Node blocked for leader eviction");
        Ok(())
    }

    fn cleanup(&self, cluster: &dyn Cluster) {
        cluster.unblock_node(self.node_id);
        info!(node_id = self.node_id, "Node unblocked");
    }

    fn is_schedule_allowed(&self, cluster: &dyn Cluster) -> bool {
        self.base
            .allow(OperatorKind::LEADER, cluster.options().leader_schedule_limit)
    }

    fn schedule(&self, cluster: &dyn Cluster) -> Vec<Operator> {
        let opts = cluster.options();
        let nodes = cluster.nodes();
        let mut shards: Vec<Shard> = cluster
            .shards_on_node(self.node_id)
            .into_iter()
            .filter(|s| s.leader_node() == Some(self.node_id))
            .collect();
        shards.shuffle(&mut rand::thread_rng());

        for shard in shards.iter().take(BALANCE_RETRY_LIMIT) {
            let followers: Vec<_> = nodes
                .iter()
                .filter(|n| {
                    shard
                        .followers()
                        .any(|r| r.node_id == n.id && !shard.is_down(r.id) && !shard.is_pending(r.id))
                })
                .cloned()
                .collect();
            let Some(target) = self.selector.select_target(&opts, &followers, &[]) else {
                continue;
            };
            match create_transfer_leader_operator("evict-leader", shard, target.id, OperatorKind::empty()) {
                Ok(op) => return vec![op],
                Err(e) => debug!(shard_id = shard.id, error = %e, "Cannot evict leader"),
            }
        }
        Vec::new()
    }
}
