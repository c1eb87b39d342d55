//! Collaborator traits
//!
//! The scheduler never owns topology. It reads a [`Cluster`] snapshot and
//! hands steps to a [`StepSink`] that forwards them to storage nodes.

use crate::config::ScheduleOptions;
use crate::error::Result;
use crate::model::{Node, NodeId, Replica, Shard, ShardId};
use crate::operator::OpStep;

/// Read access to cluster topology plus the few mutations schedulers need
pub trait Cluster: Send + Sync {
    fn get_node(&self, id: NodeId) -> Option<Node>;

    /// All nodes in id order
    fn nodes(&self) -> Vec<Node>;

    fn get_shard(&self, id: ShardId) -> Option<Shard>;

    /// Shard whose range contains `key`
    fn shard_by_key(&self, key: &[u8]) -> Option<Shard>;

    /// Up to `limit` shards in key order, starting with the one containing
    /// `start_key`. A `limit` of 0 means no limit.
    fn scan_shards(&self, start_key: &[u8], limit: usize) -> Vec<Shard>;

    /// All shards in key order
    fn shards(&self) -> Vec<Shard>;

    /// Shards with a replica on the node
    fn shards_on_node(&self, node_id: NodeId) -> Vec<Shard>;

    /// Shards immediately before and after `shard` in key order
    fn adjacent_shards(&self, shard: &Shard) -> (Option<Shard>, Option<Shard>);

    /// Allocate a fresh replica identity placed on `node_id`
    fn alloc_replica(&self, node_id: NodeId) -> Result<Replica>;

    fn options(&self) -> ScheduleOptions;

    /// Pause leader transfers from and to the node
    fn block_node(&self, node_id: NodeId) -> Result<()>;

    fn unblock_node(&self, node_id: NodeId);
}

/// Transport used to deliver the current step of an operator
pub trait StepSink: Send + Sync {
    fn send_step(&self, shard: &Shard, step: &OpStep);
}

/// Sink that drops every step, used for dry runs
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl StepSink for NoopSink {
    fn send_step(&self, _shard: &Shard, _step: &OpStep) {}
}
