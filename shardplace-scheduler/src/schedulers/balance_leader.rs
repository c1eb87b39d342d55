//! Balance leader scheduler
//!
//! Moves leadership off the node with the highest leader score onto one of
//! the shard's followers with a lower score. When the busiest node has no
//! movable leader, it tries the other direction and pulls a leader onto
//! the least loaded node.

use rand::seq::SliceRandom;
use std::sync::Arc;
use tracing::debug;

use shardplace_core::{Cluster, Node, Operator, OperatorKind, ResourceKind, Result, ScheduleOptions, Shard};

use crate::affinity::LabelAffinity;
use crate::builder::create_transfer_leader_operator;
use crate::controller::OperatorController;
use crate::filter::{Filters, StateFilter};
use crate::selector::BalanceSelector;

use super::registry::{expect_args, SchedulerContext, SchedulerRegistry};
use super::{should_balance, BaseScheduler, Scheduler, BALANCE_RETRY_LIMIT};

pub const TYPE: &str = "balance-leader";

pub(crate) fn register(registry: &mut SchedulerRegistry) {
    registry.register(TYPE, create);
}

fn create(ctx: &SchedulerContext, args: &[String]) -> Result<Arc<dyn Scheduler>> {
    expect_args(TYPE, args, 0)?;
    Ok(Arc::new(BalanceLeaderScheduler::new(
        ctx.controller.clone(),
        ctx.affinity.clone(),
    )))
}

pub struct BalanceLeaderScheduler {
    base: BaseScheduler,
    selector: BalanceSelector,
}

impl BalanceLeaderScheduler {
    pub fn new(controller: Arc<OperatorController>, affinity: Arc<LabelAffinity>) -> Self {
        let filters: Filters = vec![Box::new(StateFilter {
            transfer_leader: true,
            move_region: false,
        })];
        Self {
            base: BaseScheduler::new(controller),
            selector: BalanceSelector::new(ResourceKind::Leader, filters, affinity),
        }
    }

    fn transfer_leader_out(
        &self,
        cluster: &dyn Cluster,
        opts: &ScheduleOptions,
        nodes: &[Node],
        source: &Node,
    ) -> Option<Operator> {
        let mut shards: Vec<Shard> = cluster
            .shards_on_node(source.id)
            .into_iter()
            .filter(|s| s.leader_node() == Some(source.id))
            .collect();
        shards.shuffle(&mut rand::thread_rng());

        for shard in shards.iter().take(BALANCE_RETRY_LIMIT) {
            let followers: Vec<Node> = shard
                .followers()
                .filter(|r| !shard.is_down(r.id) && !shard.is_pending(r.id))
                .filter_map(|r| nodes.iter().find(|n| n.id == r.node_id).cloned())
                .collect();
            let Some(target) = self.selector.select_target(opts, &followers, &[]) else {
                continue;
            };
            if !should_balance(opts, source, target, shard, ResourceKind::Leader) {
                continue;
            }
            match create_transfer_leader_operator("balance-leader", shard, target.id, OperatorKind::empty()) {
                Ok(op) => return Some(op),
                Err(e) => debug!(shard_id = shard.id, error = %e, "Cannot transfer leader out"),
            }
        }
        None
    }

    fn transfer_leader_in(
        &self,
        cluster: &dyn Cluster,
        opts: &ScheduleOptions,
        nodes: &[Node],
        target: &Node,
    ) -> Option<Operator> {
        let mut shards: Vec<Shard> = cluster
            .shards_on_node(target.id)
            .into_iter()
            .filter(|s| {
                s.leader_node() != Some(target.id)
                    && s.voter_on(target.id).is_some_and(|r| !s.is_pending(r.id) && !s.is_down(r.id))
            })
            .collect();
        shards.shuffle(&mut rand::thread_rng());

        for shard in shards.iter().take(BALANCE_RETRY_LIMIT) {
            let Some(source) = shard
                .leader_node()
                .and_then(|id| nodes.iter().find(|n| n.id == id))
            else {
                continue;
            };
            if source.blocked || !should_balance(opts, source, target, shard, ResourceKind::Leader) {
                continue;
            }
            match create_transfer_leader_operator("balance-leader", shard, target.id, OperatorKind::empty()) {
                Ok(op) => return Some(op),
                Err(e) => debug!(shard_id = shard.id, error = %e, "Cannot transfer leader in"),
            }
        }
        None
    }
}

impl Scheduler for BalanceLeaderScheduler {
    fn name(&self) -> &str {
        "balance-leader-scheduler"
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

        if let Some(source) = self.selector.select_source(&opts, &nodes, &[]) {
            if let Some(op) = self.transfer_leader_out(cluster, &opts, &nodes, source) {
                return vec![op];
            }
        }
        if let Some(target) = self.selector.select_target(&opts, &nodes, &[]) {
            if let Some(op) = self.transfer_leader_in(cluster, &opts, &nodes, target) {
                return vec![op];
            }
        }
        Vec::new()
    }
}
