//! Delayed leader transfer
//!
//! A one-shot scheduler that, once `run_at` has passed, moves the shard's
//! leadership to the given node and is then retired by the coordinator.

use chrono::{DateTime, SecondsFormat, Utc};
use std::sync::Arc;
use tracing::{debug, info};

use shardplace_core::{Cluster, NodeId, Operator, OperatorKind, Result, ScheduleError, ShardId};

use crate::builder::create_transfer_leader_operator;
use crate::controller::OperatorController;

use super::registry::{expect_args, parse_arg, SchedulerContext, SchedulerRegistry};
use super::{BaseScheduler, ScheduleMode, Scheduler};

pub const TYPE: &str = "transfer-leader";

pub(crate) fn register(registry: &mut SchedulerRegistry) {
    registry.register(TYPE, create);
}

fn create(ctx: &SchedulerContext, args: &[String]) -> Result<Arc<dyn Scheduler>> {
    expect_args(TYPE, args, 3)?;
    let shard_id = parse_arg(args, 0, "shard id")?;
    let node_id = parse_arg(args, 1, "node id")?;
    let run_at = DateTime::parse_from_rfc3339(&args[2])
        .map_err(|e| ScheduleError::invalid_args(format!("invalid run time {}: {}", args[2], e)))?
        .with_timezone(&Utc);
    Ok(Arc::new(TransferLeaderScheduler::new(
        ctx.controller.clone(),
        shard_id,
        node_id,
        run_at,
    )))
}

pub struct TransferLeaderScheduler {
    base: BaseScheduler,
    name: String,
    shard_id: ShardId,
    node_id: NodeId,
    run_at: DateTime<Utc>,
}

impl TransferLeaderScheduler {
    pub fn new(
        controller: Arc<OperatorController>,
        shard_id: ShardId,
        node_id: NodeId,
        run_at: DateTime<Utc>,
    ) -> Self {
        Self {
            base: BaseScheduler::new(controller),
            name: format!("transfer-leader-{}-to-{}-at-{}", shard_id, node_id, run_at.timestamp()),
            shard_id,
            node_id,
            run_at,
        }
    }
}

impl Scheduler for TransferLeaderScheduler {
    fn name(&self) -> &str {
        &self.name
    }

    fn scheduler_type(&self) -> &'static str {
        TYPE
    }

    fn args(&self) -> Vec<String> {
        vec![
            self.shard_id.to_string(),
            self.node_id.to_string(),
            self.run_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        ]
    }

    fn mode(&self) -> ScheduleMode {
        ScheduleMode::OneShotAt {
            run_at: self.run_at,
        }
    }

    fn is_schedule_allowed(&self, cluster: &dyn Cluster) -> bool {
        self.base
            .allow(OperatorKind::LEADER, cluster.options().leader_schedule_limit)
    }

    fn schedule(&self, cluster: &dyn Cluster) -> Vec<Operator> {
        let Some(shard) = cluster.get_shard(self.shard_id) else {
            debug!(shard_id = self.shard_id, "Shard not found");
            return Vec::new();
        };
        match create_transfer_leader_operator("transfer-leader", &shard, self.node_id, OperatorKind::ADMIN) {
            Ok(op) => {
                info!(shard_id = self.shard_id, node_id = self.node_id, "Delayed leader transfer due");
                vec![op]
            }
            Err(e) => {
                debug!(shard_id = self.shard_id, node_id = self.node_id, error = %e, "Leader transfer not possible");
                Vec::new()
            }
        }
    }
}
