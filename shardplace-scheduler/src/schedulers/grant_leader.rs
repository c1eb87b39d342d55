//! Grant leader scheduler
//!
//! Pulls the leadership of every shard with a voter on one node onto that
//! node. The node is blocked while the scheduler exists, keeping other
//! leader schedulers from moving leaders away again.

use rand::seq::SliceRandom;
use std::sync::Arc;
use tracing::{debug, info};

use shardplace_core::{Cluster, NodeId, Operator, OperatorKind, Result, Shard};

use crate::builder::create_transfer_leader_operator;
use crate::controller::OperatorController;

use super::registry::{expect_args, parse_arg, SchedulerContext, SchedulerRegistry};
use super::{BaseScheduler, Scheduler, BALANCE_RETRY_LIMIT};

pub const TYPE: &str = "grant-leader";

pub(crate) fn register(registry: &mut SchedulerRegistry) {
    registry.register(TYPE, create);
}

fn create(ctx: &SchedulerContext, args: &[String]) -> Result<Arc<dyn Scheduler>> {
    expect_args(TYPE, args, 1)?;
    let node_id = parse_arg(args, 0, "node id")?;
    Ok(Arc::new(GrantLeaderScheduler::new(ctx.controller.clone(), node_id)))
}

pub struct GrantLeaderScheduler {
    base: BaseScheduler,
    name: String,
    node_id: NodeId,
}

impl GrantLeaderScheduler {
    pub fn new(controller: Arc<OperatorController>, node_id: NodeId) -> Self {
        Self {
            base: BaseScheduler::new(controller),
            name: format!("grant-leader-scheduler-{}", node_id),
            node_id,
        }
    }
}

impl Scheduler for GrantLeaderScheduler {
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
        info!(node_id = self.node_id, "Node blocked for leader grant");
        Ok(())
    }

    fn cleanup(&self, cluster: &dyn Cluster) {
        cluster.unblock_node(self.node_id);
    }

    fn is_schedule_allowed(&self, cluster: &dyn Cluster) -> bool {
        self.base
            .allow(OperatorKind::LEADER, cluster.options().leader_schedule_limit)
    }

    fn schedule(&self, cluster: &dyn Cluster) -> Vec<Operator> {
        let mut shards: Vec<Shard> = cluster
            .shards_on_node(self.node_id)
            .into_iter()
            .filter(|s| {
                s.leader_node() != Some(self.node_id)
                    && s
                        .voter_on(self.node_id)
                        .is_some_and(|r| !s.is_down(r.id) && !s.is_pending(r.id))
            })
            .collect();
        shards.shuffle(&mut rand::thread_rng());

        for shard in shards.iter().take(BALANCE_RETRY_LIMIT) {
            match create_transfer_leader_operator("grant-leader", shard, self.node_id, OperatorKind::empty()) {
                Ok(op) => return vec![op],
                Err(e) => debug!(shard_id = shard.id, error = %e, "Cannot grant leader"),
            }
        }
        Vec::new()
    }
}
