//! Hot region scheduler
//!
//! Spreads write-hot shards. A shard is hot when its written bytes reach
//! the configured threshold. Each node's hot flow is the sum over the hot
//! shards it holds (peer flow) or leads (leader flow); the scheduler moves
//! one hot replica, or failing that one hot leader, from the node with the
//! largest flow to a node whose flow stays below the source's.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use shardplace_core::{Cluster, Node, NodeId, Operator, OperatorKind, Result, ScheduleOptions, Shard};

use crate::affinity::LabelAffinity;
use crate::builder::{create_move_peer_operator, create_transfer_leader_operator};
use crate::controller::OperatorController;
use crate::filter::{
    filter_source, filter_target, DistinctScoreFilter, ExcludedFilter, Filters, LabelMemoFilter,
    PendingPeerCountFilter, StateFilter, StorageThresholdFilter,
};

use super::registry::{expect_args, SchedulerContext, SchedulerRegistry};
use super::{interval_grow, is_healthy, shard_nodes, BaseScheduler, IntervalGrowth, Scheduler};

pub const TYPE: &str = "hot-region";

const MIN_HOT_SCHEDULE_INTERVAL: Duration = Duration::from_secs(1);
const MAX_HOT_SCHEDULE_INTERVAL: Duration = Duration::from_secs(20);

pub(crate) fn register(registry: &mut SchedulerRegistry) {
    registry.register(TYPE, create);
}

fn create(ctx: &SchedulerContext, args: &[String]) -> Result<Arc<dyn Scheduler>> {
    expect_args(TYPE, args, 0)?;
    Ok(Arc::new(HotRegionScheduler::new(
        ctx.controller.clone(),
        ctx.affinity.clone(),
    )))
}

/// Hot shards and per-node write flow
pub(crate) struct HotStats {
    pub shards: Vec<Shard>,
    pub peer_flow: HashMap<NodeId, u64>,
    pub leader_flow: HashMap<NodeId, u64>,
}

impl HotStats {
    pub fn collect(cluster: &dyn Cluster, threshold: u64) -> Self {
        let mut shards: Vec<Shard> = cluster
            .shards()
            .into_iter()
            .filter(|s| s.written_bytes >= threshold)
            .collect();
        shards.sort_by(|a, b| b.written_bytes.cmp(&a.written_bytes).then(a.id.cmp(&b.id)));

        let mut peer_flow = HashMap::new();
        let mut leader_flow = HashMap::new();
        for shard in &shards {
            for replica in &shard.replicas {
                *peer_flow.entry(replica.node_id).or_insert(0) += shard.written_bytes;
            }
            if let Some(leader) = shard.leader_node() {
                *leader_flow.entry(leader).or_insert(0) += shard.written_bytes;
            }
        }
        Self {
            shards,
            peer_flow,
            leader_flow,
        }
    }
}

fn flow_of(flows: &HashMap<NodeId, u64>, node_id: NodeId) -> u64 {
    flows.get(&node_id).copied().unwrap_or(0)
}

/// Node with the largest non-zero flow that passes `filters` as a source
fn busiest<'a>(
    opts: &ScheduleOptions,
    nodes: &'a [Node],
    flows: &HashMap<NodeId, u64>,
    filters: &Filters,
) -> Option<&'a Node> {
    let mut best: Option<(&Node, u64)> = None;
    for node in nodes {
        let flow = flow_of(flows, node.id);
        if flow == 0 || filter_source(opts, node, filters) {
            continue;
        }
        if best.map_or(true, |(_, f)| flow > f) {
            best = Some((node, flow));
        }
    }
    best.map(|(node, _)| node)
}

/// Node with the smallest flow that passes `filters` as a target
fn coolest<'a>(
    opts: &ScheduleOptions,
    nodes: impl IntoIterator<Item = &'a Node>,
    flows: &HashMap<NodeId, u64>,
    filters: &Filters,
) -> Option<&'a Node> {
    let mut best: Option<(&Node, u64)> = None;
    for node in nodes {
        if filter_target(opts, node, filters) {
            continue;
        }
        let flow = flow_of(flows, node.id);
        if best.map_or(true, |(_, f)| flow < f) {
            best = Some((node, flow));
        }
    }
    best.map(|(node, _)| node)
}

pub struct HotRegionScheduler {
    base: BaseScheduler,
    affinity: Arc<LabelAffinity>,
}

impl HotRegionScheduler {
    pub fn new(controller: Arc<OperatorController>, affinity: Arc<LabelAffinity>) -> Self {
        Self {
            base: BaseScheduler::new(controller),
            affinity,
        }
    }

    fn balance_hot_peers(
        &self,
        cluster: &dyn Cluster,
        opts: &ScheduleOptions,
        nodes: &[Node],
        stats: &HotStats,
    ) -> Option<Operator> {
        let state: Filters = vec![Box::new(StateFilter {
            transfer_leader: false,
            move_region: true,
        })];
        let source = busiest(opts, nodes, &stats.peer_flow, &state)?;
        let source_flow = flow_of(&stats.peer_flow, source.id);

        for shard in stats
            .shards
            .iter()
            .filter(|s| s.replica_on(source.id).is_some() && is_healthy(s, opts.max_replicas))
        {
            let filters: Filters = vec![
                Box::new(StateFilter {
                    transfer_leader: false,
                    move_region: true,
                }),
                Box::new(ExcludedFilter::new([], shard.node_ids())),
                Box::new(StorageThresholdFilter),
                Box::new(PendingPeerCountFilter),
                Box::new(LabelMemoFilter::new(&self.affinity, shard.id)),
                Box::new(DistinctScoreFilter::new(
                    opts.location_labels.clone(),
                    shard_nodes(cluster, shard),
                    source,
                )),
            ];
            let Some(target) = coolest(opts, nodes, &stats.peer_flow, &filters) else {
                continue;
            };
            if flow_of(&stats.peer_flow, target.id) + shard.written_bytes >= source_flow {
                continue;
            }
            match create_move_peer_operator(
                "move-hot-write-region",
                cluster,
                shard,
                OperatorKind::HOT_REGION,
                source.id,
                target.id,
            ) {
                Ok(op) => return Some(op),
                Err(e) => debug!(shard_id = shard.id, error = %e, "Cannot move hot replica"),
            }
        }
        None
    }

    fn balance_hot_leaders(
        &self,
        opts: &ScheduleOptions,
        nodes: &[Node],
        stats: &HotStats,
    ) -> Option<Operator> {
        let state: Filters = vec![Box::new(StateFilter {
            transfer_leader: true,
            move_region: false,
        })];
        let source = busiest(opts, nodes, &stats.leader_flow, &state)?;
        let source_flow = flow_of(&stats.leader_flow, source.id);

        for shard in stats
            .shards
            .iter()
            .filter(|s| s.leader_node() == Some(source.id))
        {
            let followers = nodes.iter().filter(|n| {
                shard
                    .followers()
                    .any(|r| r.node_id == n.id && !shard.is_down(r.id) && !shard.is_pending(r.id))
            });
            let Some(target) = coolest(opts, followers, &stats.leader_flow, &state) else {
                continue;
            };
            if flow_of(&stats.leader_flow, target.id) + shard.written_bytes >= source_flow {
                continue;
            }
            match create_transfer_leader_operator(
                "transfer-hot-write-leader",
                shard,
                target.id,
                OperatorKind::HOT_REGION,
            ) {
                Ok(op) => return Some(op),
                Err(e) => debug!(shard_id = shard.id, error = %e, "Cannot transfer hot leader"),
            }
        }
        None
    }
}

impl Scheduler for HotRegionScheduler {
    fn name(&self) -> &str {
        "balance-hot-region-scheduler"
    }

    fn scheduler_type(&self) -> &'static str {
        TYPE
    }

    fn min_interval(&self) -> Duration {
        MIN_HOT_SCHEDULE_INTERVAL
    }

    fn next_interval(&self, prev: Duration) -> Duration {
        interval_grow(prev, MAX_HOT_SCHEDULE_INTERVAL, IntervalGrowth::Linear)
    }

    fn is_schedule_allowed(&self, cluster: &dyn Cluster) -> bool {
        self.base.allow(
            OperatorKind::HOT_REGION,
            cluster.options().hot_region_schedule_limit,
        )
    }

    fn schedule(&self, cluster: &dyn Cluster) -> Vec<Operator> {
        let opts = cluster.options();
        let nodes = cluster.nodes();
        let stats = HotStats::collect(cluster, opts.hot_region_write_threshold);
        if stats.shards.is_empty() {
            return Vec::new();
        }

        self.balance_hot_peers(cluster, &opts, &nodes, &stats)
            .or_else(|| self.balance_hot_leaders(&opts, &nodes, &stats))
            .into_iter()
            .collect()
    }
}
