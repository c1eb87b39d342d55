//! Candidate selection
//!
//! Picks a source node (to relieve) or a target node (to receive) among
//! candidates that pass every filter. Three policies:
//! - [`BalanceSelector`]: resource score, biased by the label-affinity
//!   override
//! - [`ReplicaSelector`]: label diversity against a shard's placement
//! - [`RandomSelector`]: uniform choice
//!
//! No candidate is a normal outcome and is reported as `None`.

use rand::seq::SliceRandom;
use std::cmp::Ordering;
use std::sync::Arc;

use shardplace_core::{Node, ResourceKind, ScheduleOptions, ShardId};

use crate::affinity::LabelAffinity;
use crate::filter::{filter_source, filter_target, Filter, Filters};

const REPLICA_BASE_SCORE: f64 = 100.0;

/// Label diversity of `candidate` against the nodes already holding a
/// shard. Differing on a more significant location label weighs more.
pub fn distinct_score(labels: &[String], shard_nodes: &[Node], candidate: &Node) -> f64 {
    shard_nodes
        .iter()
        .filter(|n| n.id != candidate.id)
        .filter_map(|n| n.compare_location(candidate, labels))
        .map(|index| REPLICA_BASE_SCORE.powi((labels.len() - index - 1) as i32))
        .sum()
}

/// Compare two candidates by distinct score, then by lower region score.
/// `Greater` means `a` is the better target.
pub fn compare_node_score(
    opts: &ScheduleOptions,
    a: &Node,
    a_score: f64,
    b: &Node,
    b_score: f64,
) -> Ordering {
    if a_score > b_score {
        return Ordering::Greater;
    }
    if a_score < b_score {
        return Ordering::Less;
    }
    let a_region = a.region_score(opts.high_space_ratio, opts.low_space_ratio, 0);
    let b_region = b.region_score(opts.high_space_ratio, opts.low_space_ratio, 0);
    if a_region < b_region {
        Ordering::Greater
    } else if a_region > b_region {
        Ordering::Less
    } else {
        Ordering::Equal
    }
}

/// Selects by resource score
pub struct BalanceSelector {
    kind: ResourceKind,
    filters: Filters,
    affinity: Arc<LabelAffinity>,
}

impl BalanceSelector {
    pub fn new(kind: ResourceKind, filters: Filters, affinity: Arc<LabelAffinity>) -> Self {
        Self {
            kind,
            filters,
            affinity,
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    fn score(&self, opts: &ScheduleOptions, node: &Node) -> f64 {
        node.resource_score(self.kind, opts.high_space_ratio, opts.low_space_ratio, 0)
    }

    /// Most loaded eligible node. A node the override marks for relief
    /// wins over any node it does not mark.
    pub fn select_source<'a>(
        &self,
        opts: &ScheduleOptions,
        nodes: &'a [Node],
        extra: &[Box<dyn Filter>],
    ) -> Option<&'a Node> {
        let mut best: Option<(&Node, f64)> = None;
        let mut preferred: Option<(&Node, f64)> = None;

        for node in nodes {
            if filter_source(opts, node, self.filters.iter().chain(extra)) {
                continue;
            }
            let score = self.score(opts, node);
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((node, score));
            }
            if self.affinity.should_move_from(node) && preferred.map_or(true, |(_, s)| score > s) {
                preferred = Some((node, score));
            }
        }

        preferred.or(best).map(|(node, _)| node)
    }

    /// Least loaded eligible node
    pub fn select_target<'a>(
        &self,
        opts: &ScheduleOptions,
        nodes: &'a [Node],
        extra: &[Box<dyn Filter>],
    ) -> Option<&'a Node> {
        let mut best: Option<(&Node, f64)> = None;

        for node in nodes {
            if filter_target(opts, node, self.filters.iter().chain(extra)) {
                continue;
            }
            let score = self.score(opts, node);
            if best.map_or(true, |(_, s)| score < s) {
                best = Some((node, score));
            }
        }

        best.map(|(node, _)| node)
    }
}

/// Selects by label diversity against one shard's replica placement
pub struct ReplicaSelector {
    shard_id: Option<ShardId>,
    shard_nodes: Vec<Node>,
    labels: Vec<String>,
    filters: Filters,
    affinity: Arc<LabelAffinity>,
}

impl ReplicaSelector {
    pub fn new(
        shard_nodes: Vec<Node>,
        labels: Vec<String>,
        filters: Filters,
        affinity: Arc<LabelAffinity>,
    ) -> Self {
        Self {
            shard_id: None,
            shard_nodes,
            labels,
            filters,
            affinity,
        }
    }

    /// Scope target selection to a shard so its label memo applies
    pub fn for_shard(mut self, shard_id: ShardId) -> Self {
        self.shard_id = Some(shard_id);
        self
    }

    /// Least diverse eligible node, i.e. the best replica to drop
    pub fn select_source<'a>(&self, opts: &ScheduleOptions, nodes: &'a [Node]) -> Option<&'a Node> {
        let mut best: Option<(&Node, f64)> = None;

        for node in nodes {
            if filter_source(opts, node, &self.filters) {
                continue;
            }
            let score = distinct_score(&self.labels, &self.shard_nodes, node);
            let better = match best {
                None => true,
                Some((b, s)) => compare_node_score(opts, node, score, b, s) == Ordering::Less,
            };
            if better {
                best = Some((node, score));
            }
        }

        best.map(|(node, _)| node)
    }

    /// Most diverse eligible node. When the shard carries a label memo,
    /// nodes without the memoed label are never candidates.
    pub fn select_target<'a>(
        &self,
        opts: &ScheduleOptions,
        nodes: &'a [Node],
        extra: &[Box<dyn Filter>],
    ) -> Option<&'a Node> {
        let memo = self.shard_id.and_then(|id| self.affinity.memo_for(id));
        let mut best: Option<(&Node, f64)> = None;
        let mut preferred: Option<(&Node, f64)> = None;

        for node in nodes {
            if let Some(label) = &memo {
                if !label.matches(node) {
                    continue;
                }
            }
            if filter_target(opts, node, self.filters.iter().chain(extra)) {
                continue;
            }
            let score = distinct_score(&self.labels, &self.shard_nodes, node);
            let beats = |current: Option<(&Node, f64)>| match current {
                None => true,
                Some((b, s)) => compare_node_score(opts, node, score, b, s) == Ordering::Greater,
            };
            if beats(best) {
                best = Some((node, score));
            }
            if !self.affinity.should_move_from(node) && beats(preferred) {
                preferred = Some((node, score));
            }
        }

        preferred.or(best).map(|(node, _)| node)
    }
}

/// Uniform choice among eligible nodes
pub struct RandomSelector {
    filters: Filters,
}

impl RandomSelector {
    pub fn new(filters: Filters) -> Self {
        Self { filters }
    }

    pub fn select_source<'a>(&self, opts: &ScheduleOptions, nodes: &'a [Node]) -> Option<&'a Node> {
        let candidates: Vec<&Node> = nodes
            .iter()
            .filter(|n| !filter_source(opts, n, &self.filters))
            .collect();
        candidates.choose(&mut rand::thread_rng()).copied()
    }

    pub fn select_target<'a>(
        &self,
        opts: &ScheduleOptions,
        nodes: &'a [Node],
        extra: &[Box<dyn Filter>],
    ) -> Option<&'a Node> {
        let candidates: Vec<&Node> = nodes
            .iter()
            .filter(|n| !filter_target(opts, n, self.filters.iter().chain(extra)))
            .collect();
        candidates.choose(&mut rand::thread_rng()).copied()
    }
}
