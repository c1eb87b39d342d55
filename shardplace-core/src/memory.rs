//! In-memory cluster
//!
//! A [`Cluster`] kept entirely in process memory. It also acts as a
//! [`StepSink`] by applying steps directly, which lets the daemon and the
//! tests run operators to completion without real storage nodes.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

use crate::cluster::{Cluster, StepSink};
use crate::config::ScheduleOptions;
use crate::error::{Result, ScheduleError};
use crate::model::{Node, NodeId, NodeState, Replica, ReplicaRole, Shard, ShardId};
use crate::operator::{OpStep, SplitPolicy};

/// Serialized topology accepted by [`MemoryCluster::from_topology`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Topology {
    pub options: Option<ScheduleOptions>,
    pub nodes: Vec<Node>,
    pub shards: Vec<Shard>,
}

#[derive(Default)]
struct ClusterState {
    nodes: BTreeMap<NodeId, Node>,
    shards: BTreeMap<ShardId, Shard>,
    /// start key -> shard id
    key_index: BTreeMap<Vec<u8>, ShardId>,
}

impl ClusterState {
    fn insert_shard(&mut self, shard: Shard) {
        if let Some(old) = self.shards.get(&shard.id) {
            if self.key_index.get(&old.start_key) == Some(&shard.id) {
                self.key_index.remove(&old.start_key);
            }
        }
        self.key_index.insert(shard.start_key.clone(), shard.id);
        self.shards.insert(shard.id, shard);
    }

    fn remove_shard(&mut self, id: ShardId) -> Option<Shard> {
        let shard = self.shards.remove(&id)?;
        if self.key_index.get(&shard.start_key) == Some(&id) {
            self.key_index.remove(&shard.start_key);
        }
        Some(shard)
    }

    fn ordered_shards(&self) -> impl Iterator<Item = &Shard> {
        self.key_index.values().filter_map(|id| self.shards.get(id))
    }

    /// Recompute per-node counters from shard placement
    fn refresh_stats(&mut self) {
        const MB: u64 = 1 << 20;

        for node in self.nodes.values_mut() {
            node.region_count = 0;
            node.leader_count = 0;
            node.region_size = 0;
            node.leader_size = 0;
            node.pending_peer_count = 0;
        }
        for shard in self.shards.values() {
            let leader = shard.leader_node();
            for replica in &shard.replicas {
                if let Some(node) = self.nodes.get_mut(&replica.node_id) {
                    node.region_count += 1;
                    node.region_size += shard.approximate_size;
                    if shard.is_pending(replica.id) {
                        node.pending_peer_count += 1;
                    }
                    if leader == Some(replica.node_id) {
                        node.leader_count += 1;
                        node.leader_size += shard.approximate_size;
                    }
                }
            }
        }
        for node in self.nodes.values_mut() {
            if node.capacity > 0 {
                node.used_size = node.region_size.max(0) as u64 * MB;
                node.available = node.capacity.saturating_sub(node.used_size);
            }
        }
    }
}

/// Process-local cluster state guarded by a read/write lock
pub struct MemoryCluster {
    state: RwLock<ClusterState>,
    options: RwLock<ScheduleOptions>,
    next_id: AtomicU64,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new(ScheduleOptions::default())
    }
}

impl MemoryCluster {
    pub fn new(options: ScheduleOptions) -> Self {
        Self {
            state: RwLock::new(ClusterState::default()),
            options: RwLock::new(options),
            next_id: AtomicU64::new(1000),
        }
    }

    /// Build a cluster from a topology description. Options embedded in
    /// the topology take precedence over `options`.
    pub fn from_topology(topology: Topology, options: ScheduleOptions) -> Result<Self> {
        let options = topology.options.unwrap_or(options);
        options.validate()?;
        let cluster = Self::new(options);
        for node in topology.nodes {
            cluster.put_node(node);
        }
        for shard in topology.shards {
            cluster.put_shard(shard)?;
        }
        Ok(cluster)
    }

    pub fn set_options(&self, options: ScheduleOptions) {
        *self.options.write() = options;
    }

    pub fn update_options(&self, f: impl FnOnce(&mut ScheduleOptions)) {
        f(&mut self.options.write());
    }

    pub fn put_node(&self, node: Node) {
        self.bump_id(node.id);
        let mut state = self.state.write();
        state.nodes.insert(node.id, node);
        state.refresh_stats();
    }

    /// Add an up node carrying the given labels
    pub fn add_labeled_node(&self, id: NodeId, labels: &[(&str, &str)]) {
        let mut node = Node::new(id, format!("127.0.0.1:{}", 20160 + id));
        for (key, value) in labels {
            node.set_label(key, value);
        }
        self.put_node(node);
    }

    pub fn set_node_state(&self, id: NodeId, node_state: NodeState) -> Result<()> {
        let mut state = self.state.write();
        let node = state
            .nodes
            .get_mut(&id)
            .ok_or(ScheduleError::NodeNotFound(id))?;
        node.state = node_state;
        Ok(())
    }

    pub fn update_node(&self, id: NodeId, f: impl FnOnce(&mut Node)) -> Result<()> {
        let mut state = self.state.write();
        let node = state
            .nodes
            .get_mut(&id)
            .ok_or(ScheduleError::NodeNotFound(id))?;
        f(node);
        Ok(())
    }

    /// Insert or replace a shard; replicas must sit on distinct nodes
    pub fn put_shard(&self, shard: Shard) -> Result<()> {
        let mut seen = Vec::with_capacity(shard.replicas.len());
        for replica in &shard.replicas {
            if seen.contains(&replica.node_id) {
                return Err(ScheduleError::DuplicateReplica {
                    shard_id: shard.id,
                    node_id: replica.node_id,
                });
            }
            seen.push(replica.node_id);
            self.bump_id(replica.id);
        }
        self.bump_id(shard.id);

        let mut state = self.state.write();
        state.insert_shard(shard);
        state.refresh_stats();
        Ok(())
    }

    /// Add a shard led by `leader` with voters on `followers`
    pub fn add_leader_shard(
        &self,
        id: ShardId,
        start_key: &[u8],
        end_key: &[u8],
        leader: NodeId,
        followers: &[NodeId],
    ) -> Result<()> {
        let mut shard = Shard::new(id, start_key, end_key);
        shard.approximate_size = 10;
        for node_id in std::iter::once(&leader).chain(followers) {
            shard
                .replicas
                .push(Replica::voter(self.next_id.fetch_add(1, Ordering::SeqCst), *node_id));
        }
        shard.leader = shard.replicas.first().map(|r| r.id);
        self.put_shard(shard)
    }

    pub fn update_shard(&self, id: ShardId, f: impl FnOnce(&mut Shard)) -> Result<()> {
        let mut state = self.state.write();
        let mut shard = state
            .shards
            .get(&id)
            .cloned()
            .ok_or(ScheduleError::ShardNotFound(id))?;
        f(&mut shard);
        state.insert_shard(shard);
        state.refresh_stats();
        Ok(())
    }

    pub fn remove_shard(&self, id: ShardId) -> Option<Shard> {
        let mut state = self.state.write();
        let removed = state.remove_shard(id);
        state.refresh_stats();
        removed
    }

    pub fn shard_count(&self) -> usize {
        self.state.read().shards.len()
    }

    /// Apply one step to the stored shard
    pub fn apply_step(&self, shard_id: ShardId, step: &OpStep) -> Result<()> {
        let mut state = self.state.write();
        let mut shard = state
            .shards
            .get(&shard_id)
            .cloned()
            .ok_or(ScheduleError::ShardNotFound(shard_id))?;

        match step {
            OpStep::TransferLeader { to_node, .. } => {
                let replica_id = shard
                    .voter_on(*to_node)
                    .map(|r| r.id)
                    .ok_or(ScheduleError::NoVoterOnNode {
                        shard_id,
                        node_id: *to_node,
                    })?;
                shard.leader = Some(replica_id);
            }
            OpStep::AddPeer {
                node_id,
                replica_id,
            } => {
                if shard.replica_on(*node_id).is_none() {
                    shard.replicas.push(Replica::voter(*replica_id, *node_id));
                }
            }
            OpStep::AddLearner {
                node_id,
                replica_id,
            } => {
                if shard.replica_on(*node_id).is_none() {
                    shard.replicas.push(Replica::learner(*replica_id, *node_id));
                }
            }
            OpStep::PromoteLearner { replica_id, .. } => {
                if let Some(replica) = shard.replicas.iter_mut().find(|r| r.id == *replica_id) {
                    replica.role = ReplicaRole::Voter;
                }
            }
            OpStep::RemovePeer { node_id } => {
                let was_leader = shard.leader_node() == Some(*node_id);
                shard.replicas.retain(|r| r.node_id != *node_id);
                if was_leader {
                    let next_leader = shard.voters().next().map(|r| r.id);
                    shard.leader = next_leader;
                }
            }
            OpStep::MergeRegion {
                from_shard,
                to_shard,
                is_passive,
                ..
            } => {
                if *is_passive {
                    return Ok(());
                }
                let mut target = state
                    .shards
                    .get(to_shard)
                    .cloned()
                    .ok_or(ScheduleError::ShardNotFound(*to_shard))?;
                if !shard.is_adjacent(&target) {
                    return Err(ScheduleError::NotAdjacent);
                }
                if target.start_key == shard.end_key {
                    target.start_key = shard.start_key.clone();
                } else {
                    target.end_key = shard.end_key.clone();
                }
                target.approximate_size += shard.approximate_size;
                state.remove_shard(*from_shard);
                state.insert_shard(target);
                state.refresh_stats();
                debug!(from = from_shard, to = to_shard, "Merged shards");
                return Ok(());
            }
            OpStep::SplitRegion {
                policy, split_keys, ..
            } => {
                let split_key = match policy {
                    SplitPolicy::Keys => split_keys
                        .iter()
                        .find(|k| shard.contains_key(k) && k.as_slice() != shard.start_key)
                        .cloned(),
                    SplitPolicy::Approximate | SplitPolicy::Scan => {
                        let mut key = shard.start_key.clone();
                        key.push(0x80);
                        Some(key).filter(|k| shard.contains_key(k))
                    }
                }
                .ok_or_else(|| {
                    ScheduleError::Internal(format!("no split key found for shard {}", shard_id))
                })?;

                let mut right = Shard::new(
                    self.next_id.fetch_add(1, Ordering::SeqCst),
                    &split_key,
                    &shard.end_key,
                );
                for replica in &shard.replicas {
                    let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                    right.replicas.push(Replica {
                        id,
                        node_id: replica.node_id,
                        role: replica.role,
                    });
                    if shard.leader == Some(replica.id) {
                        right.leader = Some(id);
                    }
                }
                right.approximate_size = shard.approximate_size / 2;
                shard.approximate_size -= right.approximate_size;
                shard.end_key = split_key;
                debug!(shard_id, new_shard = right.id, "Split shard");
                state.insert_shard(right);
            }
        }

        state.insert_shard(shard);
        state.refresh_stats();
        Ok(())
    }

    fn bump_id(&self, id: u64) {
        self.next_id.fetch_max(id + 1, Ordering::SeqCst);
    }
}

impl Cluster for MemoryCluster {
    fn get_node(&self, id: NodeId) -> Option<Node> {
        self.state.read().nodes.get(&id).cloned()
    }

    fn nodes(&self) -> Vec<Node> {
        self.state.read().nodes.values().cloned().collect()
    }

    fn get_shard(&self, id: ShardId) -> Option<Shard> {
        self.state.read().shards.get(&id).cloned()
    }

    fn shard_by_key(&self, key: &[u8]) -> Option<Shard> {
        let state = self.state.read();
        let (_, id) = state.key_index.range(..=key.to_vec()).next_back()?;
        state
            .shards
            .get(id)
            .filter(|s| s.contains_key(key))
            .cloned()
    }

    fn scan_shards(&self, start_key: &[u8], limit: usize) -> Vec<Shard> {
        let state = self.state.read();
        let iter = state
            .ordered_shards()
            .filter(|s| s.end_key.is_empty() || s.end_key.as_slice() > start_key)
            .cloned();
        if limit == 0 {
            iter.collect()
        } else {
            iter.take(limit).collect()
        }
    }

    fn shards(&self) -> Vec<Shard> {
        self.state.read().ordered_shards().cloned().collect()
    }

    fn shards_on_node(&self, node_id: NodeId) -> Vec<Shard> {
        self.state
            .read()
            .ordered_shards()
            .filter(|s| s.replica_on(node_id).is_some())
            .cloned()
            .collect()
    }

    fn adjacent_shards(&self, shard: &Shard) -> (Option<Shard>, Option<Shard>) {
        let state = self.state.read();
        let prev = if shard.start_key.is_empty() {
            None
        } else {
            state
                .key_index
                .range(..shard.start_key.clone())
                .next_back()
                .and_then(|(_, id)| state.shards.get(id))
                .filter(|s| s.end_key == shard.start_key)
                .cloned()
        };
        let next = if shard.end_key.is_empty() {
            None
        } else {
            state
                .key_index
                .get(&shard.end_key)
                .and_then(|id| state.shards.get(id))
                .cloned()
        };
        (prev, next)
    }

    fn alloc_replica(&self, node_id: NodeId) -> Result<Replica> {
        if !self.state.read().nodes.contains_key(&node_id) {
            return Err(ScheduleError::NodeNotFound(node_id));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(Replica::voter(id, node_id))
    }

    fn options(&self) -> ScheduleOptions {
        self.options.read().clone()
    }

    fn block_node(&self, node_id: NodeId) -> Result<()> {
        self.update_node(node_id, |node| node.blocked = true)
    }

    fn unblock_node(&self, node_id: NodeId) {
        if let Some(node) = self.state.write().nodes.get_mut(&node_id) {
            node.blocked = false;
        }
    }
}

impl StepSink for MemoryCluster {
    fn send_step(&self, shard: &Shard, step: &OpStep) {
        if let Err(e) = self.apply_step(shard.id, step) {
            warn!(shard_id = shard.id, step = %step, error = %e, "Failed to apply step");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_cluster() -> MemoryCluster {
        let cluster = MemoryCluster::default();
        for id in 1..=4 {
            cluster.add_labeled_node(id, &[("zone", &format!("z{}", id))]);
        }
        cluster.add_leader_shard(1, b"", b"b", 1, &[2, 3]).unwrap();
        cluster.add_leader_shard(2, b"b", b"d", 2, &[3, 4]).unwrap();
        cluster.add_leader_shard(3, b"d", b"", 3, &[1, 4]).unwrap();
        cluster
    }

    #[test]
    fn test_stats_refresh() {
        let cluster = make_cluster();
        let node = cluster.get_node(3).unwrap();
        assert_eq!(node.region_count, 3);
        assert_eq!(node.leader_count, 1);
        assert_eq!(node.region_size, 30);
        assert_eq!(node.leader_size, 10);
    }

    #[test]
    fn test_shard_by_key_and_scan() {
        let cluster = make_cluster();
        assert_eq!(cluster.shard_by_key(b"a").unwrap().id, 1);
        assert_eq!(cluster.shard_by_key(b"c").unwrap().id, 2);
        assert_eq!(cluster.shard_by_key(b"zz").unwrap().id, 3);

        let ids: Vec<_> = cluster.scan_shards(b"c", 0).iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![2, 3]);
        let ids: Vec<_> = cluster.scan_shards(b"", 2).iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_adjacent_shards() {
        let cluster = make_cluster();
        let middle = cluster.get_shard(2).unwrap();
        let (prev, next) = cluster.adjacent_shards(&middle);
        assert_eq!(prev.unwrap().id, 1);
        assert_eq!(next.unwrap().id, 3);

        let first = cluster.get_shard(1).unwrap();
        assert!(cluster.adjacent_shards(&first).0.is_none());
    }

    #[test]
    fn test_duplicate_replica_rejected() {
        let cluster = make_cluster();
        let mut shard = Shard::new(9, b"x", b"y");
        shard.replicas = vec![Replica::voter(1, 1), Replica::voter(2, 1)];
        assert!(matches!(
            cluster.put_shard(shard),
            Err(ScheduleError::DuplicateReplica { .. })
        ));
    }

    #[test]
    fn test_apply_move_steps() {
        let cluster = make_cluster();
        let replica = cluster.alloc_replica(4).unwrap();

        cluster
            .apply_step(
                1,
                &OpStep::AddLearner {
                    node_id: 4,
                    replica_id: replica.id,
                },
            )
            .unwrap();
        cluster
            .apply_step(
                1,
                &OpStep::PromoteLearner {
                    node_id: 4,
                    replica_id: replica.id,
                },
            )
            .unwrap();
        cluster
            .apply_step(
                1,
                &OpStep::TransferLeader {
                    from_node: 1,
                    to_node: 2,
                },
            )
            .unwrap();
        cluster.apply_step(1, &OpStep::RemovePeer { node_id: 1 }).unwrap();

        let shard = cluster.get_shard(1).unwrap();
        assert_eq!(shard.node_ids(), vec![2, 3, 4]);
        assert_eq!(shard.leader_node(), Some(2));
        assert!(shard.voter_on(4).is_some());
    }

    #[test]
    fn test_remove_leader_elects_next_voter() {
        let cluster = make_cluster();
        cluster.apply_step(2, &OpStep::RemovePeer { node_id: 2 }).unwrap();

        let shard = cluster.get_shard(2).unwrap();
        assert_eq!(shard.node_ids(), vec![3, 4]);
        assert_eq!(shard.leader_node(), Some(3));

        // the last voter leaves no leader behind
        cluster.apply_step(2, &OpStep::RemovePeer { node_id: 3 }).unwrap();
        cluster.apply_step(2, &OpStep::RemovePeer { node_id: 4 }).unwrap();
        assert_eq!(cluster.get_shard(2).unwrap().leader_node(), None);
    }

    #[test]
    fn test_apply_merge() {
        let cluster = make_cluster();
        cluster
            .apply_step(
                1,
                &OpStep::MergeRegion {
                    from_shard: 1,
                    to_shard: 2,
                    is_passive: false,
                    start_key: vec![],
                    end_key: b"b".to_vec(),
                },
            )
            .unwrap();

        assert!(cluster.get_shard(1).is_none());
        let merged = cluster.get_shard(2).unwrap();
        assert!(merged.start_key.is_empty());
        assert_eq!(merged.end_key, b"d".to_vec());
        assert_eq!(cluster.shard_by_key(b"a").unwrap().id, 2);
    }

    #[test]
    fn test_apply_split() {
        let cluster = make_cluster();
        cluster
            .apply_step(
                2,
                &OpStep::SplitRegion {
                    start_key: b"b".to_vec(),
                    end_key: b"d".to_vec(),
                    policy: SplitPolicy::Keys,
                    split_keys: vec![b"c".to_vec()],
                },
            )
            .unwrap();

        assert_eq!(cluster.shard_count(), 4);
        assert_eq!(cluster.get_shard(2).unwrap().end_key, b"c".to_vec());
        let right = cluster.shard_by_key(b"c").unwrap();
        assert_ne!(right.id, 2);
        assert_eq!(right.end_key, b"d".to_vec());
        assert_eq!(right.leader_node(), Some(2));
    }

    #[test]
    fn test_topology_roundtrip() {
        let json = r#"{
            "nodes": [{"id": 1, "labels": [{"key": "zone", "value": "z1"}]}],
            "shards": [{"id": 5, "replicas": [{"id": 6, "node_id": 1}], "leader": 6}]
        }"#;
        let topology: Topology = serde_json::from_str(json).unwrap();
        let cluster = MemoryCluster::from_topology(topology, ScheduleOptions::default()).unwrap();
        assert_eq!(cluster.get_node(1).unwrap().leader_count, 1);
        assert!(cluster.alloc_replica(1).unwrap().id > 6);
        assert!(cluster.alloc_replica(9).is_err());
    }
}
