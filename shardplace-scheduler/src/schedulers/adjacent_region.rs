//! Adjacent region scheduler
//!
//! Consecutive shards led from the same node concentrate sequential
//! traffic on it. The scheduler walks the key space with a cursor and,
//! for each such pair, first tries to hand the second shard's leadership
//! to a follower that does not lead a neighbour. When leadership cannot
//! move (or the leader budget is spent) it moves the second shard's
//! replica off the shared leader node instead.

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

use shardplace_core::{Cluster, Node, NodeId, Operator, OperatorKind, Result, ScheduleError, Shard};

use crate::affinity::LabelAffinity;
use crate::builder::{create_move_peer_operator, create_transfer_leader_operator};
use crate::controller::OperatorController;
use crate::filter::{
    filter_target, DistinctScoreFilter, ExcludedFilter, Filter, LabelMemoFilter, StateFilter,
    StorageThresholdFilter,
};

use super::registry::{parse_arg, SchedulerContext, SchedulerRegistry};
use super::{is_healthy, shard_nodes, BaseScheduler, Scheduler};

pub const TYPE: &str = "adjacent-region";

const DEFAULT_LEADER_LIMIT: u64 = 64;
const DEFAULT_PEER_LIMIT: u64 = 1;
const SCAN_LIMIT: usize = 1000;

pub(crate) fn register(registry: &mut SchedulerRegistry) {
    registry.register(TYPE, create);
}

fn create(ctx: &SchedulerContext, args: &[String]) -> Result<Arc<dyn Scheduler>> {
    let (leader_limit, peer_limit) = match args.len() {
        0 => (DEFAULT_LEADER_LIMIT, DEFAULT_PEER_LIMIT),
        2 => (parse_arg(args, 0, "leader limit")?, parse_arg(args, 1, "peer limit")?),
        n => {
            return Err(ScheduleError::invalid_args(format!(
                "{} takes zero or two arguments, got {}",
                TYPE, n
            )))
        }
    };
    Ok(Arc::new(AdjacentRegionScheduler::new(
        ctx.controller.clone(),
        ctx.affinity.clone(),
        leader_limit,
        peer_limit,
    )))
}

pub struct AdjacentRegionScheduler {
    base: BaseScheduler,
    affinity: Arc<LabelAffinity>,
    leader_limit: u64,
    peer_limit: u64,
    cursor: Mutex<Vec<u8>>,
}

impl AdjacentRegionScheduler {
    pub fn new(
        controller: Arc<OperatorController>,
        affinity: Arc<LabelAffinity>,
        leader_limit: u64,
        peer_limit: u64,
    ) -> Self {
        Self {
            base: BaseScheduler::new(controller),
            affinity,
            leader_limit,
            peer_limit,
            cursor: Mutex::new(Vec::new()),
        }
    }

    fn allow_leader(&self) -> bool {
        self.base.allow(OperatorKind::ADJACENT, self.leader_limit)
    }

    fn allow_peer(&self) -> bool {
        self.base.allow(OperatorKind::ADJACENT, self.peer_limit)
    }

    /// Hand leadership to the least loaded healthy follower that leads
    /// neither neighbour
    fn disperse_leader(&self, cluster: &dyn Cluster, shard: &Shard, busy: &[NodeId]) -> Option<Operator> {
        let opts = cluster.options();
        let state = StateFilter {
            transfer_leader: true,
            move_region: false,
        };
        let target = shard
            .followers()
            .filter(|r| !shard.is_down(r.id) && !shard.is_pending(r.id) && !busy.contains(&r.node_id))
            .filter_map(|r| cluster.get_node(r.node_id))
            .filter(|n| !state.filter_target(&opts, n))
            .min_by(|a, b| a.leader_score(0).total_cmp(&b.leader_score(0)))?;

        create_transfer_leader_operator("balance-adjacent-leader", shard, target.id, OperatorKind::ADJACENT)
            .map_err(|e| debug!(shard_id = shard.id, error = %e, "Cannot disperse leader"))
            .ok()
    }

    /// Move the replica on the shared leader node to the least loaded node
    /// that keeps placement as diverse and is not busy with a neighbour
    fn disperse_peer(
        &self,
        cluster: &dyn Cluster,
        shard: &Shard,
        leader: &Node,
        busy: &[NodeId],
    ) -> Option<Operator> {
        let opts = cluster.options();
        let mut excluded = shard.node_ids();
        excluded.extend_from_slice(busy);
        let filters: Vec<Box<dyn Filter>> = vec![
            Box::new(StateFilter {
                transfer_leader: false,
                move_region: true,
            }),
            Box::new(StorageThresholdFilter),
            Box::new(ExcludedFilter::new([], excluded)),
            Box::new(LabelMemoFilter::new(&self.affinity, shard.id)),
            Box::new(DistinctScoreFilter::new(
                opts.location_labels.clone(),
                shard_nodes(cluster, shard),
                leader,
            )),
        ];
        let target = cluster
            .nodes()
            .into_iter()
            .filter(|n| !filter_target(&opts, n, &filters))
            .min_by(|a, b| {
                a.region_score(opts.high_space_ratio, opts.low_space_ratio, 0)
                    .total_cmp(&b.region_score(opts.high_space_ratio, opts.low_space_ratio, 0))
            })?;

        create_move_peer_operator(
            "balance-adjacent-peer",
            cluster,
            shard,
            OperatorKind::ADJACENT,
            leader.id,
            target.id,
        )
        .map_err(|e| debug!(shard_id = shard.id, error = %e, "Cannot disperse peer"))
        .ok()
    }

    fn disperse(&self, cluster: &dyn Cluster, shard: &Shard, next: Option<&Shard>) -> Option<Operator> {
        let leader_id = shard.leader_node()?;
        let leader = cluster.get_node(leader_id)?;
        let mut busy = vec![leader_id];
        if let Some(next_leader) = next.filter(|n| shard.is_adjacent(n)).and_then(|n| n.leader_node()) {
            busy.push(next_leader);
        }

        if self.allow_leader() {
            if let Some(op) = self.disperse_leader(cluster, shard, &busy) {
                return Some(op);
            }
        }
        if self.allow_peer() {
            return self.disperse_peer(cluster, shard, &leader, &busy);
        }
        None
    }
}

impl Scheduler for AdjacentRegionScheduler {
    fn name(&self) -> &str {
        "balance-adjacent-region-scheduler"
    }

    fn scheduler_type(&self) -> &'static str {
        TYPE
    }

    fn args(&self) -> Vec<String> {
        vec![self.leader_limit.to_string(), self.peer_limit.to_string()]
    }

    fn is_schedule_allowed(&self, _cluster: &dyn Cluster) -> bool {
        self.allow_leader() || self.allow_peer()
    }

    fn schedule(&self, cluster: &dyn Cluster) -> Vec<Operator> {
        let max_replicas = cluster.options().max_replicas;
        let mut cursor = self.cursor.lock();
        let shards = cluster.scan_shards(&cursor, SCAN_LIMIT);

        for (i, pair) in shards.windows(2).enumerate() {
            let (prev, shard) = (&pair[0], &pair[1]);
            let shared = prev.is_adjacent(shard)
                && prev.leader_node().is_some()
                && prev.leader_node() == shard.leader_node();
            if !shared || !is_healthy(shard, max_replicas) {
                continue;
            }
            if let Some(op) = self.disperse(cluster, shard, shards.get(i + 2)) {
                *cursor = shard.end_key.clone();
                return vec![op];
            }
        }

        // resume after the scanned batch, or wrap at the end of the key space
        *cursor = match shards.last() {
            Some(last) if shards.len() == SCAN_LIMIT => last.start_key.clone(),
            _ => Vec::new(),
        };
        Vec::new()
    }
}
