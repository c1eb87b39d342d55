//! Candidate filters
//!
//! A filter answers "should this node be excluded" separately for the
//! source direction (a node to relieve) and the target direction (a node
//! to receive). Filters compose by logical AND: a node rejected by any
//! filter is never scored.

use std::collections::HashSet;

use shardplace_core::{Label, Node, NodeId, ScheduleOptions, ShardId};

use crate::affinity::LabelAffinity;
use crate::selector::distinct_score;

/// Predicate over a node, evaluated per direction
pub trait Filter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Return true if the node must not be used as a source
    fn filter_source(&self, opts: &ScheduleOptions, node: &Node) -> bool;

    /// Return true if the node must not be used as a target
    fn filter_target(&self, opts: &ScheduleOptions, node: &Node) -> bool;
}

/// Boxed filter list
pub type Filters = Vec<Box<dyn Filter>>;

/// True if any filter rejects the node as a source
pub fn filter_source<'a>(
    opts: &ScheduleOptions,
    node: &Node,
    filters: impl IntoIterator<Item = &'a Box<dyn Filter>>,
) -> bool {
    filters.into_iter().any(|f| f.filter_source(opts, node))
}

/// True if any filter rejects the node as a target
pub fn filter_target<'a>(
    opts: &ScheduleOptions,
    node: &Node,
    filters: impl IntoIterator<Item = &'a Box<dyn Filter>>,
) -> bool {
    filters.into_iter().any(|f| f.filter_target(opts, node))
}

/// Excludes nodes by lifecycle state and blocking
#[derive(Debug, Clone, Copy, Default)]
pub struct StateFilter {
    /// Leadership moves: blocked nodes are skipped in both directions
    pub transfer_leader: bool,
    /// Replica moves: only up nodes may receive
    pub move_region: bool,
}

impl Filter for StateFilter {
    fn name(&self) -> &'static str {
        "state-filter"
    }

    fn filter_source(&self, _opts: &ScheduleOptions, node: &Node) -> bool {
        if node.is_tombstone() {
            return true;
        }
        self.transfer_leader && node.blocked
    }

    fn filter_target(&self, _opts: &ScheduleOptions, node: &Node) -> bool {
        if !node.is_up() {
            return true;
        }
        if self.transfer_leader && node.blocked {
            return true;
        }
        self.move_region && node.blocked
    }
}

/// Excludes explicit node ids
#[derive(Debug, Clone, Default)]
pub struct ExcludedFilter {
    sources: HashSet<NodeId>,
    targets: HashSet<NodeId>,
}

impl ExcludedFilter {
    pub fn new(
        sources: impl IntoIterator<Item = NodeId>,
        targets: impl IntoIterator<Item = NodeId>,
    ) -> Self {
        Self {
            sources: sources.into_iter().collect(),
            targets: targets.into_iter().collect(),
        }
    }
}

impl Filter for ExcludedFilter {
    fn name(&self) -> &'static str {
        "exclude-filter"
    }

    fn filter_source(&self, _opts: &ScheduleOptions, node: &Node) -> bool {
        self.sources.contains(&node.id)
    }

    fn filter_target(&self, _opts: &ScheduleOptions, node: &Node) -> bool {
        self.targets.contains(&node.id)
    }
}

/// Keeps replicas off nodes that are running out of space
#[derive(Debug, Clone, Copy, Default)]
pub struct StorageThresholdFilter;

impl Filter for StorageThresholdFilter {
    fn name(&self) -> &'static str {
        "storage-threshold-filter"
    }

    fn filter_source(&self, _opts: &ScheduleOptions, _node: &Node) -> bool {
        false
    }

    fn filter_target(&self, opts: &ScheduleOptions, node: &Node) -> bool {
        node.is_low_space(opts.low_space_ratio)
    }
}

/// Skips nodes that are still catching up on many replicas
#[derive(Debug, Clone, Copy, Default)]
pub struct PendingPeerCountFilter;

impl PendingPeerCountFilter {
    fn over_limit(opts: &ScheduleOptions, node: &Node) -> bool {
        opts.max_pending_peer_count > 0 && node.pending_peer_count > opts.max_pending_peer_count
    }
}

impl Filter for PendingPeerCountFilter {
    fn name(&self) -> &'static str {
        "pending-peer-filter"
    }

    fn filter_source(&self, opts: &ScheduleOptions, node: &Node) -> bool {
        Self::over_limit(opts, node)
    }

    fn filter_target(&self, opts: &ScheduleOptions, node: &Node) -> bool {
        Self::over_limit(opts, node)
    }
}

/// Rejects targets that would make a shard's placement less diverse than
/// keeping the replica on the source
pub struct DistinctScoreFilter {
    labels: Vec<String>,
    shard_nodes: Vec<Node>,
    safe_score: f64,
}

impl DistinctScoreFilter {
    pub fn new(labels: Vec<String>, shard_nodes: Vec<Node>, source: &Node) -> Self {
        let others: Vec<Node> = shard_nodes
            .into_iter()
            .filter(|n| n.id != source.id)
            .collect();
        let safe_score = distinct_score(&labels, &others, source);
        Self {
            labels,
            shard_nodes: others,
            safe_score,
        }
    }
}

impl Filter for DistinctScoreFilter {
    fn name(&self) -> &'static str {
        "distinct-filter"
    }

    fn filter_source(&self, _opts: &ScheduleOptions, _node: &Node) -> bool {
        false
    }

    fn filter_target(&self, _opts: &ScheduleOptions, node: &Node) -> bool {
        distinct_score(&self.labels, &self.shard_nodes, node) < self.safe_score
    }
}

/// Keeps a shard on nodes carrying the label it was last migrated
/// towards. Shards without a memo are unrestricted.
#[derive(Debug, Clone, Default)]
pub struct LabelMemoFilter {
    memo: Option<Label>,
}

impl LabelMemoFilter {
    pub fn new(affinity: &LabelAffinity, shard_id: ShardId) -> Self {
        Self {
            memo: affinity.memo_for(shard_id),
        }
    }
}

impl Filter for LabelMemoFilter {
    fn name(&self) -> &'static str {
        "label-memo-filter"
    }

    fn filter_source(&self, _opts: &ScheduleOptions, _node: &Node) -> bool {
        false
    }

    fn filter_target(&self, _opts: &ScheduleOptions, node: &Node) -> bool {
        self.memo.as_ref().is_some_and(|label| !label.matches(node))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardplace_core::NodeState;

    fn make_node(id: NodeId, zone: &str) -> Node {
        Node::new(id, format!("n{}", id)).with_label("zone", zone)
    }

    #[test]
    fn test_state_filter() {
        let opts = ScheduleOptions::default();
        let mut node = make_node(1, "z1");
        let leader = StateFilter {
            transfer_leader: true,
            move_region: false,
        };
        let region = StateFilter {
            transfer_leader: false,
            move_region: true,
        };

        assert!(!leader.filter_source(&opts, &node));
        node.blocked = true;
        assert!(leader.filter_source(&opts, &node));
        assert!(leader.filter_target(&opts, &node));
        assert!(!region.filter_source(&opts, &node));

        node.blocked = false;
        node.state = NodeState::Offline;
        assert!(region.filter_target(&opts, &node));
        assert!(!region.filter_source(&opts, &node));

        node.state = NodeState::Tombstone;
        assert!(region.filter_source(&opts, &node));
    }

    #[test]
    fn test_excluded_filter() {
        let opts = ScheduleOptions::default();
        let filter = ExcludedFilter::new([1], [2, 3]);
        assert!(filter.filter_source(&opts, &make_node(1, "z1")));
        assert!(!filter.filter_target(&opts, &make_node(1, "z1")));
        assert!(filter.filter_target(&opts, &make_node(3, "z1")));
    }

    #[test]
    fn test_storage_threshold_filter() {
        let opts = ScheduleOptions::default();
        let mut node = make_node(1, "z1");
        node.capacity = 100;
        node.available = 10;
        assert!(StorageThresholdFilter.filter_target(&opts, &node));
        node.available = 50;
        assert!(!StorageThresholdFilter.filter_target(&opts, &node));
    }

    #[test]
    fn test_distinct_score_filter() {
        let opts = ScheduleOptions::default();
        let labels = vec!["zone".to_string()];
        let shard_nodes = vec![make_node(1, "z1"), make_node(2, "z2"), make_node(3, "z3")];
        let filter = DistinctScoreFilter::new(labels, shard_nodes, &make_node(3, "z3"));

        // z1 duplicates an existing zone, z4 keeps diversity
        assert!(filter.filter_target(&opts, &make_node(4, "z1")));
        assert!(!filter.filter_target(&opts, &make_node(5, "z4")));
    }

    #[test]
    fn test_label_memo_filter() {
        let opts = ScheduleOptions::default();
        let affinity = LabelAffinity::new();
        affinity.record(1, Label::new("zone", "z2"));

        let memoed = LabelMemoFilter::new(&affinity, 1);
        assert!(memoed.filter_target(&opts, &make_node(1, "z1")));
        assert!(!memoed.filter_target(&opts, &make_node(2, "z2")));
        assert!(!memoed.filter_source(&opts, &make_node(1, "z1")));

        let free = LabelMemoFilter::new(&affinity, 2);
        assert!(!free.filter_target(&opts, &make_node(1, "z1")));
    }

    #[test]
    fn test_compose_filters() {
        let opts = ScheduleOptions::default();
        let filters: Filters = vec![
            Box::new(StateFilter::default()),
            Box::new(ExcludedFilter::new([], [2])),
        ];
        assert!(!filter_target(&opts, &make_node(1, "z1"), &filters));
        assert!(filter_target(&opts, &make_node(2, "z1"), &filters));
    }
}
