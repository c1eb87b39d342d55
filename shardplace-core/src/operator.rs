//! Change operations
//!
//! An [`Operator`] is an ordered list of [`OpStep`]s that moves one shard
//! towards a desired placement. Steps are checked against the live shard:
//! a step is done once the shard reflects it, and the operator advances.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::time::Duration;

use crate::model::{NodeId, ReplicaId, ResourceKind, Shard, ShardId};

/// Bit set describing what an operator does and who asked for it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperatorKind(u32);

impl OperatorKind {
    pub const LEADER: OperatorKind = OperatorKind(1);
    pub const REGION: OperatorKind = OperatorKind(1 << 1);
    pub const ADMIN: OperatorKind = OperatorKind(1 << 2);
    pub const ADJACENT: OperatorKind = OperatorKind(1 << 3);
    pub const HOT_REGION: OperatorKind = OperatorKind(1 << 4);
    pub const RANGE: OperatorKind = OperatorKind(1 << 5);
    pub const MERGE: OperatorKind = OperatorKind(1 << 6);
    pub const SPLIT: OperatorKind = OperatorKind(1 << 7);

    const NAMES: [(OperatorKind, &'static str); 8] = [
        (OperatorKind::LEADER, "leader"),
        (OperatorKind::REGION, "region"),
        (OperatorKind::ADMIN, "admin"),
        (OperatorKind::ADJACENT, "adjacent"),
        (OperatorKind::HOT_REGION, "hot-region"),
        (OperatorKind::RANGE, "range"),
        (OperatorKind::MERGE, "merge"),
        (OperatorKind::SPLIT, "split"),
    ];

    pub fn empty() -> Self {
        OperatorKind(0)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    /// True when every bit of `other` is set
    pub fn contains(&self, other: OperatorKind) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn intersects(&self, other: OperatorKind) -> bool {
        self.0 & other.0 != 0
    }

    /// Parse a single kind name such as `leader` or `hot-region`
    pub fn parse(name: &str) -> Option<OperatorKind> {
        Self::NAMES
            .iter()
            .find(|(_, n)| *n == name)
            .map(|(kind, _)| *kind)
    }
}

impl BitOr for OperatorKind {
    type Output = OperatorKind;

    fn bitor(self, rhs: Self) -> Self::Output {
        OperatorKind(self.0 | rhs.0)
    }
}

impl BitOrAssign for OperatorKind {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for OperatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(kind, _)| self.contains(*kind))
            .map(|(_, name)| *name)
            .collect();
        if names.is_empty() {
            write!(f, "unknown")
        } else {
            write!(f, "{}", names.join(","))
        }
    }
}

/// How a split point is chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SplitPolicy {
    /// Split at the approximate middle reported by the node
    #[default]
    Approximate,
    /// Scan the range to find the exact middle
    Scan,
    /// Split at caller-supplied keys
    Keys,
}

impl SplitPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "approximate" => Some(SplitPolicy::Approximate),
            "scan" => Some(SplitPolicy::Scan),
            "keys" | "usekey" => Some(SplitPolicy::Keys),
            _ => None,
        }
    }
}

/// One atomic change applied to a shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum OpStep {
    TransferLeader {
        from_node: NodeId,
        to_node: NodeId,
    },
    AddPeer {
        node_id: NodeId,
        replica_id: ReplicaId,
    },
    AddLearner {
        node_id: NodeId,
        replica_id: ReplicaId,
    },
    PromoteLearner {
        node_id: NodeId,
        replica_id: ReplicaId,
    },
    RemovePeer {
        node_id: NodeId,
    },
    MergeRegion {
        from_shard: ShardId,
        to_shard: ShardId,
        /// The passive side only waits for its key range to change
        is_passive: bool,
        start_key: Vec<u8>,
        end_key: Vec<u8>,
    },
    SplitRegion {
        start_key: Vec<u8>,
        end_key: Vec<u8>,
        policy: SplitPolicy,
        split_keys: Vec<Vec<u8>>,
    },
}

impl OpStep {
    /// Whether the live shard already reflects this step
    pub fn is_finished(&self, shard: &Shard) -> bool {
        match self {
            OpStep::TransferLeader { to_node, .. } => shard.leader_node() == Some(*to_node),
            OpStep::AddPeer {
                node_id,
                replica_id,
            } => shard
                .voter_on(*node_id)
                .is_some_and(|r| r.id == *replica_id && !shard.is_pending(r.id)),
            OpStep::AddLearner {
                node_id,
                replica_id,
            } => shard
                .replica_on(*node_id)
                .is_some_and(|r| r.id == *replica_id && !shard.is_pending(r.id)),
            OpStep::PromoteLearner {
                node_id,
                replica_id,
            } => shard
                .voter_on(*node_id)
                .is_some_and(|r| r.id == *replica_id),
            OpStep::RemovePeer { node_id } => shard.replica_on(*node_id).is_none(),
            OpStep::MergeRegion {
                is_passive,
                start_key,
                end_key,
                ..
            } => *is_passive && (shard.start_key != *start_key || shard.end_key != *end_key),
            OpStep::SplitRegion {
                start_key, end_key, ..
            } => shard.start_key != *start_key || shard.end_key != *end_key,
        }
    }

    /// Node that pays for this step in the per-node rate limit
    pub fn limited_node(&self) -> Option<NodeId> {
        match self {
            OpStep::AddPeer { node_id, .. } | OpStep::AddLearner { node_id, .. } => Some(*node_id),
            OpStep::RemovePeer { node_id } => Some(*node_id),
            _ => None,
        }
    }
}

impl fmt::Display for OpStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpStep::TransferLeader { from_node, to_node } => {
                write!(f, "transfer leader from node {} to node {}", from_node, to_node)
            }
            OpStep::AddPeer {
                node_id,
                replica_id,
            } => write!(f, "add peer {} on node {}", replica_id, node_id),
            OpStep::AddLearner {
                node_id,
                replica_id,
            } => write!(f, "add learner {} on node {}", replica_id, node_id),
            OpStep::PromoteLearner {
                node_id,
                replica_id,
            } => write!(f, "promote learner {} on node {}", replica_id, node_id),
            OpStep::RemovePeer { node_id } => write!(f, "remove peer on node {}", node_id),
            OpStep::MergeRegion {
                from_shard,
                to_shard,
                is_passive,
                ..
            } => {
                if *is_passive {
                    write!(f, "merge shard {} into shard {} (passive)", from_shard, to_shard)
                } else {
                    write!(f, "merge shard {} into shard {}", from_shard, to_shard)
                }
            }
            OpStep::SplitRegion { policy, .. } => write!(f, "split shard with policy {:?}", policy),
        }
    }
}

/// Terminal and non-terminal operator states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpStatus {
    #[default]
    Created,
    Running,
    Success,
    Cancelled,
    Replaced,
    Timeout,
}

impl OpStatus {
    pub fn is_end(&self) -> bool {
        !matches!(self, OpStatus::Created | OpStatus::Running)
    }
}

/// A finished move recorded for history queries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorHistory {
    pub finished_at: DateTime<Utc>,
    pub shard_id: ShardId,
    pub from_node: NodeId,
    pub to_node: NodeId,
    pub kind: ResourceKind,
}

/// Ordered steps moving a shard towards a desired placement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operator {
    desc: String,
    shard_id: ShardId,
    kind: OperatorKind,
    steps: Vec<OpStep>,
    current_step: usize,
    status: OpStatus,
    created_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl Operator {
    pub fn new(desc: impl Into<String>, shard_id: ShardId, kind: OperatorKind, steps: Vec<OpStep>) -> Self {
        Self {
            desc: desc.into(),
            shard_id,
            kind,
            steps,
            current_step: 0,
            status: OpStatus::Created,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn desc(&self) -> &str {
        &self.desc
    }

    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    pub fn kind(&self) -> OperatorKind {
        self.kind
    }

    pub fn attach_kind(&mut self, kind: OperatorKind) {
        self.kind |= kind;
    }

    pub fn steps(&self) -> &[OpStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step(&self, index: usize) -> Option<&OpStep> {
        self.steps.get(index)
    }

    pub fn current_step_index(&self) -> usize {
        self.current_step
    }

    pub fn status(&self) -> OpStatus {
        self.status
    }

    pub fn set_status(&mut self, status: OpStatus) {
        if status.is_end() && self.finished_at.is_none() {
            self.finished_at = Some(Utc::now());
        }
        self.status = status;
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    /// Advance past every step the shard already reflects and return the
    /// step still to be executed, or `None` once all steps are done.
    pub fn check(&mut self, shard: &Shard) -> Option<&OpStep> {
        while let Some(step) = self.steps.get(self.current_step) {
            if !step.is_finished(shard) {
                break;
            }
            self.current_step += 1;
        }
        self.steps.get(self.current_step)
    }

    pub fn is_finished(&self) -> bool {
        self.current_step >= self.steps.len()
    }

    pub fn is_timeout(&self, timeout: Duration, now: DateTime<Utc>) -> bool {
        let elapsed = now.signed_duration_since(self.created_at);
        elapsed.to_std().map(|d| d > timeout).unwrap_or(false)
    }

    /// Nodes charged by the per-node rate limit
    pub fn limited_nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.steps.iter().filter_map(OpStep::limited_node).collect();
        nodes.sort_unstable();
        nodes.dedup();
        nodes
    }

    /// Moves performed by this operator, pairing each added peer with a
    /// removed one
    pub fn history(&self, finished_at: DateTime<Utc>) -> Vec<OperatorHistory> {
        let mut histories = Vec::new();
        let mut added = Vec::new();
        let mut removed = Vec::new();
        for step in &self.steps {
            match step {
                OpStep::TransferLeader { from_node, to_node } => histories.push(OperatorHistory {
                    finished_at,
                    shard_id: self.shard_id,
                    from_node: *from_node,
                    to_node: *to_node,
                    kind: ResourceKind::Leader,
                }),
                OpStep::AddPeer { node_id, .. } | OpStep::AddLearner { node_id, .. } => {
                    added.push(*node_id)
                }
                OpStep::RemovePeer { node_id } => removed.push(*node_id),
                _ => {}
            }
        }
        for (from_node, to_node) in removed.into_iter().zip(added) {
            histories.push(OperatorHistory {
                finished_at,
                shard_id: self.shard_id,
                from_node,
                to_node,
                kind: ResourceKind::Region,
            });
        }
        histories
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let steps: Vec<String> = self.steps.iter().map(|s| s.to_string()).collect();
        write!(
            f,
            "\"{}\" (kind:{}, shard:{}, status:{:?}) [{}]",
            self.desc,
            self.kind,
            self.shard_id,
            self.status,
            steps.join(", ")
        )
    }
}
