//! Label-affinity migration scheduler
//!
//! Moves one shard's replicas onto nodes carrying a target label. Each tick
//! takes the first replica (in replica order) whose node lacks the label
//! and moves it to the eligible labeled node with the lowest region score,
//! trying the next candidate when an operator cannot be built. A shard
//! whose replicas all carry the label yields nothing.
//!
//! On success the shard's label memo is recorded so replica rebalancing
//! keeps the shard on labeled nodes.

use chrono::Utc;
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, info};

use shardplace_core::{Cluster, Label, Node, Operator, OperatorKind, Result, Shard, ShardId};

use crate::affinity::LabelAffinity;
use crate::builder::create_move_peer_operator;
use crate::controller::OperatorController;

use super::registry::{expect_args, parse_arg, SchedulerContext, SchedulerRegistry};
use super::{BaseScheduler, ScheduleMode, Scheduler};

pub const TYPE: &str = "label-affinity-migrate";

pub(crate) fn register(registry: &mut SchedulerRegistry) {
    registry.register(TYPE, create);
}

fn create(ctx: &SchedulerContext, args: &[String]) -> Result<Arc<dyn Scheduler>> {
    expect_args(TYPE, args, 3)?;
    let shard_id = parse_arg(args, 0, "shard id")?;
    let label = Label::new(args[1].as_str(), args[2].as_str());
    Ok(Arc::new(LabelAffinityScheduler::new(
        ctx.controller.clone(),
        ctx.affinity.clone(),
        shard_id,
        label,
    )))
}

/// Build the next operator moving `shard` towards nodes labeled `label`,
/// recording the label memo when one is produced
pub fn migrate_shard_to_label(
    cluster: &dyn Cluster,
    affinity: &LabelAffinity,
    shard: &Shard,
    label: &Label,
) -> Option<Operator> {
    let source = shard
        .replicas
        .iter()
        .find(|r| {
            cluster
                .get_node(r.node_id)
                .map_or(true, |node| !label.matches(&node))
        })?
        .node_id;

    let opts = cluster.options();
    let mut candidates: Vec<(Node, f64)> = cluster
        .nodes()
        .into_iter()
        .filter(|n| label.matches(n) && !n.is_tombstone() && shard.replica_on(n.id).is_none())
        .map(|n| {
            let score = n.region_score(opts.high_space_ratio, opts.low_space_ratio, 0);
            (n, score)
        })
        .collect();
    if candidates.is_empty() {
        debug!(shard_id = shard.id, label = %label, "No labeled node can receive the shard");
        return None;
    }
    candidates.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));

    for (target, _) in &candidates {
        match create_move_peer_operator(
            "label-affinity-migrate",
            cluster,
            shard,
            OperatorKind::empty(),
            source,
            target.id,
        ) {
            Ok(op) => {
                affinity.record(shard.id, label.clone());
                info!(
                    shard_id = shard.id,
                    from = source,
                    to = target.id,
                    label = %label,
                    "Migrating replica to labeled node"
                );
                return Some(op);
            }
            Err(e) => debug!(shard_id = shard.id, node_id = target.id, error = %e, "Candidate rejected"),
        }
    }
    None
}

pub struct LabelAffinityScheduler {
    base: BaseScheduler,
    affinity: Arc<LabelAffinity>,
    name: String,
    shard_id: ShardId,
    label: Label,
    mode: ScheduleMode,
}

impl LabelAffinityScheduler {
    pub fn new(
        controller: Arc<OperatorController>,
        affinity: Arc<LabelAffinity>,
        shard_id: ShardId,
        label: Label,
    ) -> Self {
        Self {
            base: BaseScheduler::new(controller),
            affinity,
            name: format!("{}-{}-to-{}", TYPE, shard_id, label),
            shard_id,
            label,
            mode: ScheduleMode::UserTriggered {
                start: Utc::now(),
                end: None,
            },
        }
    }
}

impl Scheduler for LabelAffinityScheduler {
    fn name(&self) -> &str {
        &self.name
    }

    fn scheduler_type(&self) -> &'static str {
        TYPE
    }

    fn args(&self) -> Vec<String> {
        vec![
            self.shard_id.to_string(),
            self.label.key.clone(),
            self.label.value.clone(),
        ]
    }

    fn mode(&self) -> ScheduleMode {
        self.mode
    }

    fn is_schedule_allowed(&self, cluster: &dyn Cluster) -> bool {
        self.base
            .allow(OperatorKind::REGION, cluster.options().region_schedule_limit)
    }

    fn schedule(&self, cluster: &dyn Cluster) -> Vec<Operator> {
        let Some(shard) = cluster.get_shard(self.shard_id) else {
            debug!(shard_id = self.shard_id, "Shard not found");
            return Vec::new();
        };
        migrate_shard_to_label(cluster, &self.affinity, &shard, &self.label)
            .into_iter()
            .collect()
    }
}
