//! Moves one replica of a shard onto a given node. The replica moved is
//! the first one in replica order.

use chrono::Utc;
use std::sync::Arc;
use tracing::debug;

use shardplace_core::{Cluster, NodeId, Operator, OperatorKind, Result, ShardId};

use crate::builder::create_move_peer_operator;
use crate::controller::OperatorController;

use super::registry::{expect_args, parse_arg, SchedulerContext, SchedulerRegistry};
use super::{BaseScheduler, ScheduleMode, Scheduler};

pub const TYPE: &str = "transfer-to-store";

pub(crate) fn register(registry: &mut SchedulerRegistry) {
    registry.register(TYPE, create);
}

fn create(ctx: &SchedulerContext, args: &[String]) -> Result<Arc<dyn Scheduler>> {
    expect_args(TYPE, args, 2)?;
    let shard_id = parse_arg(args, 0, "shard id")?;
    let node_id = parse_arg(args, 1, "node id")?;
    Ok(Arc::new(TransferToStoreScheduler::new(
        ctx.controller.clone(),
        shard_id,
        node_id,
    )))
}

pub struct TransferToStoreScheduler {
    base: BaseScheduler,
    name: String,
    shard_id: ShardId,
    node_id: NodeId,
    mode: ScheduleMode,
}

impl TransferToStoreScheduler {
    pub fn new(controller: Arc<OperatorController>, shard_id: ShardId, node_id: NodeId) -> Self {
        Self {
            base: BaseScheduler::new(controller),
            name: format!("transfer-shard-{}-to-node-{}", shard_id, node_id),
            shard_id,
            node_id,
            mode: ScheduleMode::UserTriggered {
                start: Utc::now(),
                end: None,
            },
        }
    }
}

impl Scheduler for TransferToStoreScheduler {
    fn name(&self) -> &str {
        &self.name
    }

    fn scheduler_type(&self) -> &'static str {
        TYPE
    }

    fn args(&self) -> Vec<String> {
        vec![self.shard_id.to_string(), self.node_id.to_string()]
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
        if shard.replica_on(self.node_id).is_some() {
            return Vec::new();
        }
        let Some(source) = shard.replicas.first().map(|r| r.node_id) else {
            return Vec::new();
        };
        match create_move_peer_operator(
            "transfer-region-peer",
            cluster,
            &shard,
            OperatorKind::empty(),
            source,
            self.node_id,
        ) {
            Ok(op) => vec![op],
            Err(e) => {
                debug!(shard_id = shard.id, node_id = self.node_id, error = %e, "Cannot move replica");
                Vec::new()
            }
        }
    }
}
