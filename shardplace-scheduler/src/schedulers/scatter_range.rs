//! Scatter range scheduler
//!
//! Walks the shards of a key range with a cursor and scatters them so
//! consecutive shards end up on different node sets. The cursor wraps to
//! the range start after the last shard.

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

use shardplace_core::{Cluster, Operator, OperatorKind, Result, ScheduleError};

use crate::controller::OperatorController;
use crate::scatter::Scatterer;

use super::registry::{expect_args, SchedulerContext, SchedulerRegistry};
use super::{BaseScheduler, Scheduler, BALANCE_RETRY_LIMIT};

pub const TYPE: &str = "scatter-range";

pub(crate) fn register(registry: &mut SchedulerRegistry) {
    registry.register(TYPE, create);
}

fn create(ctx: &SchedulerContext, args: &[String]) -> Result<Arc<dyn Scheduler>> {
    expect_args(TYPE, args, 3)?;
    if args[2].is_empty() {
        return Err(ScheduleError::invalid_args("scatter-range needs a name"));
    }
    Ok(Arc::new(ScatterRangeScheduler::new(
        ctx.controller.clone(),
        Scatterer::new(ctx.cluster.clone(), ctx.affinity.clone()),
        args[0].as_bytes().to_vec(),
        args[1].as_bytes().to_vec(),
        args[2].clone(),
    )))
}

pub struct ScatterRangeScheduler {
    base: BaseScheduler,
    scatterer: Scatterer,
    name: String,
    range_name: String,
    start_key: Vec<u8>,
    end_key: Vec<u8>,
    cursor: Mutex<Vec<u8>>,
}

impl ScatterRangeScheduler {
    pub fn new(
        controller: Arc<OperatorController>,
        scatterer: Scatterer,
        start_key: Vec<u8>,
        end_key: Vec<u8>,
        range_name: String,
    ) -> Self {
        Self {
            base: BaseScheduler::new(controller),
            scatterer,
            name: format!("scatter-range-{}", range_name),
            range_name,
            cursor: Mutex::new(start_key.clone()),
            start_key,
            end_key,
        }
    }

    fn past_end(&self, key: &[u8]) -> bool {
        !self.end_key.is_empty() && key >= self.end_key.as_slice()
    }
}

impl Scheduler for ScatterRangeScheduler {
    fn name(&self) -> &str {
        &self.name
    }

    fn scheduler_type(&self) -> &'static str {
        TYPE
    }

    fn args(&self) -> Vec<String> {
        vec![
            String::from_utf8_lossy(&self.start_key).into_owned(),
            String::from_utf8_lossy(&self.end_key).into_owned(),
            self.range_name.clone(),
        ]
    }

    fn is_schedule_allowed(&self, cluster: &dyn Cluster) -> bool {
        self.base
            .allow(OperatorKind::RANGE, cluster.options().region_schedule_limit)
    }

    fn schedule(&self, cluster: &dyn Cluster) -> Vec<Operator> {
        let mut cursor = self.cursor.lock();
        let shards = cluster.scan_shards(&cursor, BALANCE_RETRY_LIMIT);
        let mut wrapped = shards.is_empty();
        let mut ops = Vec::new();

        for shard in &shards {
            if self.past_end(&shard.start_key) {
                wrapped = true;
                break;
            }
            if shard.end_key.is_empty() || self.past_end(&shard.end_key) {
                wrapped = true;
            } else {
                *cursor = shard.end_key.clone();
            }

            match self.scatterer.scatter(shard, OperatorKind::RANGE) {
                Ok(Some(op)) => {
                    ops.push(op);
                    break;
                }
                Ok(None) => {}
                Err(e) => debug!(shard_id = shard.id, error = %e, "Cannot scatter shard"),
            }
            if wrapped {
                break;
            }
        }

        if wrapped {
            *cursor = self.start_key.clone();
        }
        ops
    }
}
