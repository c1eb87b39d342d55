//! Cluster topology model
//!
//! Nodes (storage hosts), shards (key ranges) and replicas, as seen by a
//! single scheduling decision. Schedulers only read these values; the
//! cluster collaborator owns them.

use serde::{Deserialize, Serialize};
use std::fmt;

pub type NodeId = u64;
pub type ShardId = u64;
pub type ReplicaId = u64;

const MB: f64 = (1u64 << 20) as f64;
const MAX_SCORE: f64 = 1024.0 * 1024.0 * 1024.0;
const MIN_WEIGHT: f64 = 1e-6;

/// Key/value attribute attached to a node (e.g. `zone=z1`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Label {
    pub key: String,
    pub value: String,
}

impl Label {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Whether the node carries exactly this label
    pub fn matches(&self, node: &Node) -> bool {
        node.label_value(&self.key) == Some(self.value.as_str())
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// Node lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    #[default]
    Up,
    Offline,
    Tombstone,
}

/// What a balance decision tries to even out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Leader,
    Region,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Leader => write!(f, "leader"),
            ResourceKind::Region => write!(f, "region"),
        }
    }
}

/// A storage host and its load statistics
///
/// Sizes (`region_size`, `leader_size`) are in MB; `capacity`, `available`
/// and `used_size` are in bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Node {
    pub id: NodeId,
    pub address: String,
    pub labels: Vec<Label>,
    pub state: NodeState,
    /// Leader transfers from and to this node are paused
    pub blocked: bool,
    pub capacity: u64,
    pub available: u64,
    pub used_size: u64,
    pub region_count: u64,
    pub leader_count: u64,
    pub region_size: i64,
    pub leader_size: i64,
    pub region_weight: f64,
    pub leader_weight: f64,
    pub pending_peer_count: u64,
}

impl Default for Node {
    fn default() -> Self {
        Self {
            id: 0,
            address: String::new(),
            labels: Vec::new(),
            state: NodeState::Up,
            blocked: false,
            capacity: 0,
            available: 0,
            used_size: 0,
            region_count: 0,
            leader_count: 0,
            region_size: 0,
            leader_size: 0,
            region_weight: 1.0,
            leader_weight: 1.0,
            pending_peer_count: 0,
        }
    }
}

impl Node {
    pub fn new(id: NodeId, address: impl Into<String>) -> Self {
        Self {
            id,
            address: address.into(),
            ..Default::default()
        }
    }

    /// Builder-style label setter
    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.set_label(key, value);
        self
    }

    /// Set a label, replacing any existing value for the same key
    pub fn set_label(&mut self, key: &str, value: &str) {
        match self.labels.iter_mut().find(|l| l.key == key) {
            Some(label) => label.value = value.to_string(),
            None => self.labels.push(Label::new(key, value)),
        }
    }

    pub fn label_value(&self, key: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|l| l.key == key)
            .map(|l| l.value.as_str())
    }

    pub fn is_up(&self) -> bool {
        self.state == NodeState::Up
    }

    pub fn is_tombstone(&self) -> bool {
        self.state == NodeState::Tombstone
    }

    /// Free space ratio is below `1 - low_space_ratio`
    pub fn is_low_space(&self, low_space_ratio: f64) -> bool {
        if self.capacity == 0 {
            return false;
        }
        (self.available as f64) < (1.0 - low_space_ratio) * self.capacity as f64
    }

    /// Index of the first location label on which the two nodes differ,
    /// or `None` when they are indistinguishable. Missing values never
    /// count as a difference.
    pub fn compare_location(&self, other: &Node, location_labels: &[String]) -> Option<usize> {
        location_labels.iter().position(|key| {
            match (self.label_value(key), other.label_value(key)) {
                (Some(a), Some(b)) if !a.is_empty() && !b.is_empty() => {
                    !a.eq_ignore_ascii_case(b)
                }
                _ => false,
            }
        })
    }

    pub fn leader_score(&self, delta: i64) -> f64 {
        (self.leader_size + delta) as f64 / self.leader_weight.max(MIN_WEIGHT)
    }

    /// Region score grows with stored size and switches to a space-driven
    /// score as the node fills up between the high and low watermarks.
    /// Nodes that report no capacity are scored by size alone.
    pub fn region_score(&self, high_space_ratio: f64, low_space_ratio: f64, delta: i64) -> f64 {
        if self.capacity == 0 {
            return (self.region_size + delta) as f64 / self.region_weight.max(MIN_WEIGHT);
        }
        let region_size = self.region_size as f64;
        let delta = delta as f64;
        let available = self.available as f64 / MB;
        let used = self.used_size as f64 / MB;
        let capacity = self.capacity as f64 / MB;

        let amplification = if self.region_size == 0 || used == 0.0 {
            1.0
        } else {
            region_size / used
        };

        let high_space_bound = (1.0 - high_space_ratio) * capacity;
        let low_space_bound = (1.0 - low_space_ratio) * capacity;
        let remaining = available - delta / amplification;

        let score = if remaining >= high_space_bound {
            region_size + delta
        } else if remaining <= low_space_bound {
            MAX_SCORE - remaining
        } else {
            // linear between (x1, y1) and (x2, y2)
            let x1 = (capacity - high_space_bound) * amplification;
            let y1 = x1;
            let x2 = (capacity - low_space_bound) * amplification;
            let y2 = MAX_SCORE - low_space_bound;
            let k = (y2 - y1) / (x2 - x1);
            let b = y1 - k * x1;
            k * (region_size + delta) + b
        };

        score / self.region_weight.max(MIN_WEIGHT)
    }

    pub fn resource_score(
        &self,
        kind: ResourceKind,
        high_space_ratio: f64,
        low_space_ratio: f64,
        delta: i64,
    ) -> f64 {
        match kind {
            ResourceKind::Leader => self.leader_score(delta),
            ResourceKind::Region => self.region_score(high_space_ratio, low_space_ratio, delta),
        }
    }
}

/// Raft role of a replica
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicaRole {
    #[default]
    Voter,
    Learner,
}

/// One copy of a shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replica {
    pub id: ReplicaId,
    pub node_id: NodeId,
    #[serde(default)]
    pub role: ReplicaRole,
}

impl Replica {
    pub fn voter(id: ReplicaId, node_id: NodeId) -> Self {
        Self {
            id,
            node_id,
            role: ReplicaRole::Voter,
        }
    }

    pub fn learner(id: ReplicaId, node_id: NodeId) -> Self {
        Self {
            id,
            node_id,
            role: ReplicaRole::Learner,
        }
    }

    pub fn is_learner(&self) -> bool {
        self.role == ReplicaRole::Learner
    }
}

/// A key range `[start_key, end_key)` and its replicas
///
/// An empty `start_key` is unbounded below; an empty `end_key` is
/// unbounded above.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Shard {
    pub id: ShardId,
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
    pub replicas: Vec<Replica>,
    /// Replica id of the leader
    pub leader: Option<ReplicaId>,
    pub down_replicas: Vec<ReplicaId>,
    pub pending_replicas: Vec<ReplicaId>,
    /// Approximate size in MB
    pub approximate_size: i64,
    /// Write flow in bytes per second, used for hot spot detection
    pub written_bytes: u64,
}

impl Shard {
    pub fn new(id: ShardId, start_key: &[u8], end_key: &[u8]) -> Self {
        Self {
            id,
            start_key: start_key.to_vec(),
            end_key: end_key.to_vec(),
            ..Default::default()
        }
    }

    pub fn replica(&self, id: ReplicaId) -> Option<&Replica> {
        self.replicas.iter().find(|r| r.id == id)
    }

    pub fn replica_on(&self, node_id: NodeId) -> Option<&Replica> {
        self.replicas.iter().find(|r| r.node_id == node_id)
    }

    pub fn voter_on(&self, node_id: NodeId) -> Option<&Replica> {
        self.replica_on(node_id).filter(|r| !r.is_learner())
    }

    pub fn leader(&self) -> Option<&Replica> {
        self.leader.and_then(|id| self.replica(id))
    }

    pub fn leader_node(&self) -> Option<NodeId> {
        self.leader().map(|r| r.node_id)
    }

    pub fn voters(&self) -> impl Iterator<Item = &Replica> {
        self.replicas.iter().filter(|r| !r.is_learner())
    }

    /// Voters other than the leader
    pub fn followers(&self) -> impl Iterator<Item = &Replica> {
        let leader = self.leader;
        self.voters().filter(move |r| Some(r.id) != leader)
    }

    pub fn learners(&self) -> impl Iterator<Item = &Replica> {
        self.replicas.iter().filter(|r| r.is_learner())
    }

    /// Node ids in replica order
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.replicas.iter().map(|r| r.node_id).collect()
    }

    pub fn is_down(&self, replica: ReplicaId) -> bool {
        self.down_replicas.contains(&replica)
    }

    pub fn is_pending(&self, replica: ReplicaId) -> bool {
        self.pending_replicas.contains(&replica)
    }

    /// Down, pending or learner replicas present, or replica count differs
    /// from the configured replica count
    pub fn has_abnormal_peer(&self, max_replicas: usize) -> bool {
        !self.down_replicas.is_empty()
            || !self.pending_replicas.is_empty()
            || self.learners().next().is_some()
            || self.replicas.len() != max_replicas
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        key >= self.start_key.as_slice() && (self.end_key.is_empty() || key < self.end_key.as_slice())
    }

    /// Key ranges touch: one shard's bounded end is the other's start
    pub fn is_adjacent(&self, other: &Shard) -> bool {
        (!self.end_key.is_empty() && self.end_key == other.start_key)
            || (!other.end_key.is_empty() && other.end_key == self.start_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_shard(id: ShardId, start: &[u8], end: &[u8], nodes: &[NodeId]) -> Shard {
        let mut shard = Shard::new(id, start, end);
        for (i, node) in nodes.iter().enumerate() {
            shard.replicas.push(Replica::voter(id * 100 + i as u64, *node));
        }
        shard.leader = shard.replicas.first().map(|r| r.id);
        shard
    }

    #[test]
    fn test_label_keys_unique() {
        let mut node = Node::new(1, "n1:20160").with_label("zone", "z1");
        node.set_label("zone", "z2");
        node.set_label("rack", "r1");

        assert_eq!(node.labels.len(), 2);
        assert_eq!(node.label_value("zone"), Some("z2"));
        assert_eq!(node.label_value("host"), None);
        assert!(Label::new("rack", "r1").matches(&node));
    }

    #[test]
    fn test_compare_location() {
        let labels = vec!["zone".to_string(), "rack".to_string()];
        let a = Node::new(1, "").with_label("zone", "z1").with_label("rack", "r1");
        let b = Node::new(2, "").with_label("zone", "Z1").with_label("rack", "r2");
        let c = Node::new(3, "").with_label("zone", "z2");
        let d = Node::new(4, "");

        assert_eq!(a.compare_location(&b, &labels), Some(1));
        assert_eq!(a.compare_location(&c, &labels), Some(0));
        assert_eq!(a.compare_location(&d, &labels), None);
    }

    #[test]
    fn test_leader_score_uses_weight() {
        let node = Node {
            leader_size: 100,
            leader_weight: 2.0,
            ..Node::new(1, "")
        };
        assert_eq!(node.leader_score(0), 50.0);
        assert_eq!(node.leader_score(20), 60.0);
    }

    #[test]
    fn test_region_score_without_capacity() {
        let node = Node {
            region_size: 40,
            ..Default::default()
        };
        assert_eq!(node.region_score(0.6, 0.8, 0), 40.0);
        assert_eq!(node.region_score(0.6, 0.8, -10), 30.0);
    }

    #[test]
    fn test_region_score_plenty_of_space() {
        let node = Node {
            capacity: 100 * 1024 * 1024 * 1024,
            available: 90 * 1024 * 1024 * 1024,
            used_size: 10 * 1024 * 1024 * 1024,
            region_size: 10 * 1024,
            ..Node::new(1, "")
        };
        assert_eq!(node.region_score(0.6, 0.8, 0), 10240.0);
        assert_eq!(node.region_score(0.6, 0.8, 100), 10340.0);
    }

    #[test]
    fn test_region_score_low_space() {
        let node = Node {
            capacity: 100 * 1024 * 1024 * 1024,
            available: 10 * 1024 * 1024 * 1024,
            used_size: 90 * 1024 * 1024 * 1024,
            region_size: 90 * 1024,
            ..Node::new(1, "")
        };
        let score = node.region_score(0.6, 0.8, 0);
        assert_eq!(score, MAX_SCORE - 10.0 * 1024.0);
    }

    #[test]
    fn test_region_score_between_watermarks_is_monotonic() {
        let make = |avail_gb: u64| Node {
            capacity: 100 * 1024 * 1024 * 1024,
            available: avail_gb * 1024 * 1024 * 1024,
            used_size: (100 - avail_gb) * 1024 * 1024 * 1024,
            region_size: ((100 - avail_gb) * 1024) as i64,
            ..Node::new(1, "")
        };
        let emptier = make(35).region_score(0.6, 0.8, 0);
        let fuller = make(25).region_score(0.6, 0.8, 0);
        assert!(fuller > emptier);
        assert!(emptier > make(50).region_score(0.6, 0.8, 0));
    }

    #[test]
    fn test_shard_roles() {
        let mut shard = make_shard(1, b"a", b"c", &[1, 2, 3]);
        shard.replicas.push(Replica::learner(999, 4));

        assert_eq!(shard.leader_node(), Some(1));
        assert_eq!(shard.followers().count(), 2);
        assert_eq!(shard.learners().count(), 1);
        assert!(shard.voter_on(4).is_none());
        assert!(shard.replica_on(4).is_some());
        assert!(shard.has_abnormal_peer(3));
    }

    #[test]
    fn test_shard_contains_key() {
        let shard = make_shard(1, b"b", b"d", &[1]);
        assert!(shard.contains_key(b"b"));
        assert!(shard.contains_key(b"c"));
        assert!(!shard.contains_key(b"d"));

        let last = make_shard(2, b"d", b"", &[1]);
        assert!(last.contains_key(b"zzzz"));
    }

    #[test]
    fn test_adjacency() {
        let first = make_shard(1, b"", b"b", &[1]);
        let middle = make_shard(2, b"b", b"d", &[1]);
        let last = make_shard(3, b"d", b"", &[1]);

        assert!(first.is_adjacent(&middle));
        assert!(middle.is_adjacent(&first));
        assert!(middle.is_adjacent(&last));
        assert!(!first.is_adjacent(&last));
        // the unbounded ends never wrap around
        assert!(!last.is_adjacent(&first));
    }
}
