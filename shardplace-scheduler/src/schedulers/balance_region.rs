//! Balance region scheduler
//!
//! Relieves the node with the highest region score by moving one replica
//! of a healthy shard to the most label-diverse, least loaded node that
//! does not hold the shard yet.

use rand::seq::SliceRandom;
use std::sync::Arc;
use tracing::debug;

use shardplace_core::{Cluster, Node, Operator, OperatorKind, ResourceKind, Result, ScheduleOptions, Shard};

use crate::affinity::LabelAffinity;
use crate::builder::create_move_peer_operator;
use crate::controller::OperatorController;
use crate::filter::{
    DistinctScoreFilter, ExcludedFilter, Filter, Filters, PendingPeerCountFilter, StateFilter,
    StorageThresholdFilter,
};
use crate::selector::{BalanceSelector, ReplicaSelector};

use super::registry::{expect_args, SchedulerContext, SchedulerRegistry};
use super::{is_healthy, shard_nodes, should_balance, BaseScheduler, Scheduler, BALANCE_RETRY_LIMIT};

pub const TYPE: &str = "balance-region";

pub(crate) fn register(registry: &mut SchedulerRegistry) {
    registry.register(TYPE, create);
}

fn create(ctx: &SchedulerContext, args: &[String]) -> Result<Arc<dyn Scheduler>> {
    expect_args(TYPE, args, 0)?;
    Ok(Arc::new(BalanceRegionScheduler::new(
        ctx.controller.clone(),
        ctx.affinity.clone(),
    )))
}

pub struct BalanceRegionScheduler {
    base: BaseScheduler,
    affinity: Arc<LabelAffinity>,
    selector: BalanceSelector,
}

impl BalanceRegionScheduler {
    pub fn new(controller: Arc<OperatorController>, affinity: Arc<LabelAffinity>) -> Self {
        let filters: Filters = vec![
            Box::new(StateFilter {
                transfer_leader: false,
                move_region: true,
            }),
            Box::new(PendingPeerCountFilter),
        ];
        Self {
            base: BaseScheduler::new(controller),
            selector: BalanceSelector::new(ResourceKind::Region, filters, affinity.clone()),
            affinity,
        }
    }

    /// Best node to receive the replica of `shard` leaving `source`
    fn pick_target<'a>(
        &self,
        cluster: &dyn Cluster,
        opts: &ScheduleOptions,
        nodes: &'a [Node],
        shard: &Shard,
        source: &Node,
    ) -> Option<&'a Node> {
        let placed = shard_nodes(cluster, shard);
        let filters: Filters = vec![
            Box::new(StateFilter {
                transfer_leader: false,
                move_region: true,
            }),
            Box::new(ExcludedFilter::new([], shard.node_ids())),
            Box::new(StorageThresholdFilter),
            Box::new(PendingPeerCountFilter),
        ];
        let distinct: Vec<Box<dyn Filter>> = vec![Box::new(DistinctScoreFilter::new(
            opts.location_labels.clone(),
            placed.clone(),
            source,
        ))];
        ReplicaSelector::new(placed, opts.location_labels.clone(), filters, self.affinity.clone())
            .for_shard(shard.id)
            .select_target(opts, nodes, &distinct)
    }
}

impl Scheduler for BalanceRegionScheduler {
    fn name(&self) -> &str {
        "balance-region-scheduler"
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
        let Some(source) = self.selector.select_source(&opts, &nodes, &[]) else {
            return Vec::new();
        };

        let mut shards: Vec<Shard> = cluster
            .shards_on_node(source.id)
            .into_iter()
            .filter(|s| is_healthy(s, opts.max_replicas))
            .collect();
        shards.shuffle(&mut rand::thread_rng());

        for shard in shards.iter().take(BALANCE_RETRY_LIMIT) {
            let Some(target) = self.pick_target(cluster, &opts, &nodes, shard, source) else {
                debug!(shard_id = shard.id, source = source.id, "No target for shard");
                continue;
            };
            if !should_balance(&opts, source, target, shard, ResourceKind::Region) {
                continue;
            }
            match create_move_peer_operator(
                "balance-region",
                cluster,
                shard,
                OperatorKind::empty(),
                source.id,
                target.id,
            ) {
                Ok(op) => return vec![op],
                Err(e) => debug!(shard_id = shard.id, error = %e, "Cannot move replica"),
            }
        }
        Vec::new()
    }
}
