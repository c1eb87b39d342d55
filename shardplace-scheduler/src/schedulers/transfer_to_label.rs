//! Label-set migration scheduler
//!
//! Migrates every shard hosted on nodes carrying a source label towards
//! nodes carrying a target label, one label-affinity migration per shard
//! and tick, bounded by the free region operator budget.

use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

use shardplace_core::{Cluster, Label, Operator, OperatorKind, Result, ScheduleError, ShardId};

use crate::affinity::LabelAffinity;
use crate::controller::OperatorController;

use super::label_affinity::migrate_shard_to_label;
use super::registry::{expect_args, SchedulerContext, SchedulerRegistry};
use super::{BaseScheduler, ScheduleMode, Scheduler};

pub const TYPE: &str = "transfer-to-label";

pub(crate) fn register(registry: &mut SchedulerRegistry) {
    registry.register(TYPE, create);
}

fn create(ctx: &SchedulerContext, args: &[String]) -> Result<Arc<dyn Scheduler>> {
    expect_args(TYPE, args, 4)?;
    let from = Label::new(args[0].as_str(), args[1].as_str());
    let to = Label::new(args[2].as_str(), args[3].as_str());
    labeled_shards(ctx.cluster.as_ref(), &from, &to)?;
    Ok(Arc::new(TransferToLabelScheduler::new(
        ctx.controller.clone(),
        ctx.affinity.clone(),
        from,
        to,
    )))
}

/// Shards hosted on nodes labeled `from`, in id order. Fails when either
/// label matches no node or no shard is hosted under `from`.
pub fn labeled_shards(cluster: &dyn Cluster, from: &Label, to: &Label) -> Result<Vec<ShardId>> {
    let nodes = cluster.nodes();
    for label in [from, to] {
        if !nodes.iter().any(|n| label.matches(n)) {
            return Err(ScheduleError::LabelNotFound {
                key: label.key.clone(),
                value: label.value.clone(),
            });
        }
    }

    let shard_ids: BTreeSet<ShardId> = nodes
        .iter()
        .filter(|n| from.matches(n))
        .flat_map(|n| cluster.shards_on_node(n.id))
        .map(|s| s.id)
        .collect();
    if shard_ids.is_empty() {
        return Err(ScheduleError::NoShardsForLabel {
            key: from.key.clone(),
            value: from.value.clone(),
        });
    }
    Ok(shard_ids.into_iter().collect())
}

pub struct TransferToLabelScheduler {
    base: BaseScheduler,
    affinity: Arc<LabelAffinity>,
    name: String,
    from: Label,
    to: Label,
    mode: ScheduleMode,
}

impl TransferToLabelScheduler {
    pub fn new(
        controller: Arc<OperatorController>,
        affinity: Arc<LabelAffinity>,
        from: Label,
        to: Label,
    ) -> Self {
        Self {
            base: BaseScheduler::new(controller),
            affinity,
            name: format!("{}-{}-to-{}", TYPE, from, to),
            from,
            to,
            mode: ScheduleMode::UserTriggered {
                start: Utc::now(),
                end: None,
            },
        }
    }
}

impl Scheduler for TransferToLabelScheduler {
    fn name(&self) -> &str {
        &self.name
    }

    fn scheduler_type(&self) -> &'static str {
        TYPE
    }

    fn args(&self) -> Vec<String> {
        vec![
            self.from.key.clone(),
            self.from.value.clone(),
            self.to.key.clone(),
            self.to.value.clone(),
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
        let shard_ids = match labeled_shards(cluster, &self.from, &self.to) {
            Ok(ids) => ids,
            Err(e) => {
                debug!(scheduler = %self.name, error = %e, "Nothing to migrate");
                return Vec::new();
            }
        };

        let budget = cluster
            .options()
            .region_schedule_limit
            .saturating_sub(self.base.controller.operator_count(OperatorKind::REGION))
            as usize;
        let mut ops = Vec::new();
        for shard_id in shard_ids {
            if ops.len() >= budget {
                break;
            }
            if self.base.controller.get_operator(shard_id).is_some() {
                continue;
            }
            let Some(shard) = cluster.get_shard(shard_id) else {
                continue;
            };
            if let Some(op) = migrate_shard_to_label(cluster, &self.affinity, &shard, &self.to) {
                ops.push(op);
            }
        }
        ops
    }
}
