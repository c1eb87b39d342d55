//! Change-operation synthesis
//!
//! Construction functions, one per operation kind. Each validates its
//! preconditions before emitting steps and reports failures as errors.
//! None of them mutates cluster state: allocating replica identities on
//! the target node is the only call that reaches the cluster.

use shardplace_core::{
    Cluster, NodeId, OpStep, Operator, OperatorKind, Result, ScheduleError, Shard, SplitPolicy,
};

/// Target must exist, be alive and not already hold a replica of the shard
fn check_target_node(cluster: &dyn Cluster, shard: &Shard, node_id: NodeId) -> Result<()> {
    let node = cluster
        .get_node(node_id)
        .ok_or(ScheduleError::NodeNotFound(node_id))?;
    if node.is_tombstone() {
        return Err(ScheduleError::NodeTombstoned(node_id));
    }
    if shard.replica_on(node_id).is_some() {
        return Err(ScheduleError::DuplicateReplica {
            shard_id: shard.id,
            node_id,
        });
    }
    Ok(())
}

/// Steps adding a voter on `node_id`: learner then promote when learners
/// are enabled, a plain voter otherwise
fn add_voter_steps(cluster: &dyn Cluster, node_id: NodeId) -> Result<Vec<OpStep>> {
    let replica = cluster.alloc_replica(node_id)?;
    if cluster.options().enable_learner {
        Ok(vec![
            OpStep::AddLearner {
                node_id,
                replica_id: replica.id,
            },
            OpStep::PromoteLearner {
                node_id,
                replica_id: replica.id,
            },
        ])
    } else {
        Ok(vec![OpStep::AddPeer {
            node_id,
            replica_id: replica.id,
        }])
    }
}

/// Hand leadership to a healthy follower other than `leaving`, falling
/// back to `fallback` (typically a freshly added voter)
fn leader_handoff(shard: &Shard, leaving: NodeId, fallback: Option<NodeId>) -> Option<OpStep> {
    let to_node = shard
        .followers()
        .find(|r| r.node_id != leaving && !shard.is_down(r.id))
        .map(|r| r.node_id)
        .or(fallback)?;
    Some(OpStep::TransferLeader {
        from_node: leaving,
        to_node,
    })
}

/// Move leadership to a node already holding a voter
pub fn create_transfer_leader_operator(
    desc: &str,
    shard: &Shard,
    target_node: NodeId,
    kind: OperatorKind,
) -> Result<Operator> {
    let source_node = shard.leader_node().ok_or(ScheduleError::NoLeader(shard.id))?;
    if source_node == target_node {
        return Err(ScheduleError::AlreadyLeader {
            shard_id: shard.id,
            node_id: target_node,
        });
    }
    if shard.voter_on(target_node).is_none() {
        return Err(ScheduleError::NoVoterOnNode {
            shard_id: shard.id,
            node_id: target_node,
        });
    }
    Ok(Operator::new(
        desc,
        shard.id,
        kind | OperatorKind::LEADER,
        vec![OpStep::TransferLeader {
            from_node: source_node,
            to_node: target_node,
        }],
    ))
}

/// Add a voter, keeping the voter count within the replica limit
pub fn create_add_peer_operator(
    desc: &str,
    cluster: &dyn Cluster,
    shard: &Shard,
    node_id: NodeId,
    kind: OperatorKind,
) -> Result<Operator> {
    check_target_node(cluster, shard, node_id)?;
    let max = cluster.options().max_replicas;
    let count = shard.voters().count() + 1;
    if count > max {
        return Err(ScheduleError::ReplicaLimitExceeded { count, max });
    }
    let steps = add_voter_steps(cluster, node_id)?;
    Ok(Operator::new(desc, shard.id, kind | OperatorKind::REGION, steps))
}

pub fn create_add_learner_operator(
    desc: &str,
    cluster: &dyn Cluster,
    shard: &Shard,
    node_id: NodeId,
    kind: OperatorKind,
) -> Result<Operator> {
    if !cluster.options().enable_learner {
        return Err(ScheduleError::LearnerDisabled);
    }
    check_target_node(cluster, shard, node_id)?;
    let replica = cluster.alloc_replica(node_id)?;
    Ok(Operator::new(
        desc,
        shard.id,
        kind | OperatorKind::REGION,
        vec![OpStep::AddLearner {
            node_id,
            replica_id: replica.id,
        }],
    ))
}

/// Remove the replica on `node_id`, handing leadership off first if needed
pub fn create_remove_peer_operator(
    desc: &str,
    shard: &Shard,
    node_id: NodeId,
    kind: OperatorKind,
) -> Result<Operator> {
    let replica = shard
        .replica_on(node_id)
        .ok_or(ScheduleError::NoReplicaOnNode {
            shard_id: shard.id,
            node_id,
        })?;

    let mut kind = kind | OperatorKind::REGION;
    let mut steps = Vec::with_capacity(2);
    if !replica.is_learner() && shard.voters().count() == 1 {
        return Err(ScheduleError::LastVoter(shard.id));
    }
    if shard.leader_node() == Some(node_id) {
        let handoff = leader_handoff(shard, node_id, None).ok_or(ScheduleError::LastVoter(shard.id))?;
        steps.push(handoff);
        kind |= OperatorKind::LEADER;
    }
    steps.push(OpStep::RemovePeer { node_id });
    Ok(Operator::new(desc, shard.id, kind, steps))
}

/// Replace the replica on `old_node` with a new one on `new_node`
pub fn create_move_peer_operator(
    desc: &str,
    cluster: &dyn Cluster,
    shard: &Shard,
    kind: OperatorKind,
    old_node: NodeId,
    new_node: NodeId,
) -> Result<Operator> {
    if cluster.get_shard(shard.id).is_none() {
        return Err(ScheduleError::ShardNotFound(shard.id));
    }
    if shard.replica_on(old_node).is_none() {
        return Err(ScheduleError::NoReplicaOnNode {
            shard_id: shard.id,
            node_id: old_node,
        });
    }
    check_target_node(cluster, shard, new_node)?;

    let mut kind = kind | OperatorKind::REGION;
    let mut steps = add_voter_steps(cluster, new_node)?;
    if shard.leader_node() == Some(old_node) {
        if let Some(handoff) = leader_handoff(shard, old_node, Some(new_node)) {
            steps.push(handoff);
            kind |= OperatorKind::LEADER;
        }
    }
    steps.push(OpStep::RemovePeer { node_id: old_node });
    Ok(Operator::new(desc, shard.id, kind, steps))
}

/// Move the shard onto exactly `target_nodes`
pub fn create_move_region_operator(
    desc: &str,
    cluster: &dyn Cluster,
    shard: &Shard,
    kind: OperatorKind,
    target_nodes: &[NodeId],
) -> Result<Operator> {
    let mut targets: Vec<NodeId> = Vec::with_capacity(target_nodes.len());
    for id in target_nodes {
        if !targets.contains(id) {
            targets.push(*id);
        }
    }
    if targets.is_empty() {
        return Err(ScheduleError::invalid_args("no target node given"));
    }
    let max = cluster.options().max_replicas;
    if targets.len() > max {
        return Err(ScheduleError::ReplicaLimitExceeded {
            count: targets.len(),
            max,
        });
    }
    for id in &targets {
        let node = cluster
            .get_node(*id)
            .ok_or(ScheduleError::NodeNotFound(*id))?;
        if node.is_tombstone() {
            return Err(ScheduleError::NodeTombstoned(*id));
        }
    }

    let mut kind = kind | OperatorKind::REGION;
    let mut steps = Vec::new();
    let mut added = Vec::new();
    for id in &targets {
        if shard.replica_on(*id).is_none() {
            steps.extend(add_voter_steps(cluster, *id)?);
            added.push(*id);
        }
    }

    if let Some(leader) = shard.leader_node() {
        if !targets.contains(&leader) {
            let to_node = targets
                .iter()
                .copied()
                .find(|id| shard.voter_on(*id).is_some())
                .or_else(|| added.first().copied());
            if let Some(to_node) = to_node {
                steps.push(OpStep::TransferLeader {
                    from_node: leader,
                    to_node,
                });
                kind |= OperatorKind::LEADER;
            }
        }
    }

    for replica in &shard.replicas {
        if !targets.contains(&replica.node_id) {
            steps.push(OpStep::RemovePeer {
                node_id: replica.node_id,
            });
        }
    }

    if steps.is_empty() {
        return Err(ScheduleError::invalid_args(format!(
            "shard {} is already placed on the given nodes",
            shard.id
        )));
    }
    Ok(Operator::new(desc, shard.id, kind, steps))
}

/// Merge `source` into the adjacent `target`. Returns the active operator
/// for the source followed by the passive one for the target.
pub fn create_merge_region_operator(
    desc: &str,
    cluster: &dyn Cluster,
    source: &Shard,
    target: &Shard,
    kind: OperatorKind,
) -> Result<Vec<Operator>> {
    if !source.is_adjacent(target) {
        return Err(ScheduleError::NotAdjacent);
    }
    let max = cluster.options().max_replicas;
    for shard in [source, target] {
        if shard.has_abnormal_peer(max) {
            return Err(ScheduleError::AbnormalPeer(shard.id));
        }
    }

    let mut kind = kind | OperatorKind::MERGE;
    let mut steps = Vec::new();

    let mut source_nodes = source.node_ids();
    let mut target_nodes = target.node_ids();
    source_nodes.sort_unstable();
    target_nodes.sort_unstable();
    if source_nodes != target_nodes {
        let align = create_move_region_operator(desc, cluster, source, kind, &target.node_ids())?;
        kind |= align.kind();
        steps.extend(align.steps().iter().cloned());
    }

    steps.push(OpStep::MergeRegion {
        from_shard: source.id,
        to_shard: target.id,
        is_passive: false,
        start_key: source.start_key.clone(),
        end_key: source.end_key.clone(),
    });

    let active = Operator::new(desc, source.id, kind, steps);
    let passive = Operator::new(
        desc,
        target.id,
        kind,
        vec![OpStep::MergeRegion {
            from_shard: source.id,
            to_shard: target.id,
            is_passive: true,
            start_key: target.start_key.clone(),
            end_key: target.end_key.clone(),
        }],
    );
    Ok(vec![active, passive])
}

/// Split a shard by policy; explicit keys must fall strictly inside it
pub fn create_split_region_operator(
    desc: &str,
    shard: &Shard,
    kind: OperatorKind,
    policy: SplitPolicy,
    split_keys: Vec<Vec<u8>>,
) -> Result<Operator> {
    if policy == SplitPolicy::Keys && split_keys.is_empty() {
        return Err(ScheduleError::invalid_args("split by keys needs at least one key"));
    }
    if let Some(key) = split_keys
        .iter()
        .find(|k| !shard.contains_key(k) || k.as_slice() == shard.start_key)
    {
        return Err(ScheduleError::invalid_args(format!(
            "split key {:?} is outside shard {}",
            key, shard.id
        )));
    }
    Ok(Operator::new(
        desc,
        shard.id,
        kind | OperatorKind::SPLIT,
        vec![OpStep::SplitRegion {
            start_key: shard.start_key.clone(),
            end_key: shard.end_key.clone(),
            policy,
            split_keys,
        }],
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardplace_core::{MemoryCluster, NodeState, Replica};

    fn make_cluster() -> MemoryCluster {
        let cluster = MemoryCluster::default();
        for id in 1..=5 {
            cluster.add_labeled_node(id, &[("rack", &format!("r{}", id))]);
        }
        cluster.add_leader_shard(1, b"", b"m", 1, &[2, 3]).unwrap();
        cluster.add_leader_shard(2, b"m", b"", 1, &[2, 3]).unwrap();
        cluster
    }

    /// Replay steps against a copy of the shard the way nodes would
    fn apply(shard: &Shard, op: &Operator) -> Shard {
        let mut shard = shard.clone();
        for step in op.steps() {
            match step {
                OpStep::AddPeer {
                    node_id,
                    replica_id,
                } => shard.replicas.push(Replica::voter(*replica_id, *node_id)),
                OpStep::AddLearner {
                    node_id,
                    replica_id,
                } => shard.replicas.push(Replica::learner(*replica_id, *node_id)),
                OpStep::PromoteLearner { replica_id, .. } => {
                    for r in shard.replicas.iter_mut().filter(|r| r.id == *replica_id) {
                        *r = Replica::voter(r.id, r.node_id);
                    }
                }
                OpStep::TransferLeader { to_node, .. } => {
                    shard.leader = shard.voter_on(*to_node).map(|r| r.id);
                }
                OpStep::RemovePeer { node_id } => shard.replicas.retain(|r| r.node_id != *node_id),
                _ => {}
            }
        }
        shard
    }

    #[test]
    fn test_move_peer_from_leader() {
        let cluster = make_cluster();
        let shard = cluster.get_shard(1).unwrap();
        let op = create_move_peer_operator("move", &cluster, &shard, OperatorKind::empty(), 1, 4).unwrap();

        assert!(op.kind().contains(OperatorKind::REGION | OperatorKind::LEADER));
        assert!(matches!(op.step(0), Some(OpStep::AddLearner { node_id: 4, .. })));
        assert!(matches!(op.step(1), Some(OpStep::PromoteLearner { node_id: 4, .. })));
        // leadership goes to an existing follower, not the new replica
        assert_eq!(
            op.step(2),
            Some(&OpStep::TransferLeader {
                from_node: 1,
                to_node: 2
            })
        );
        assert_eq!(op.step(3), Some(&OpStep::RemovePeer { node_id: 1 }));

        let after = apply(&shard, &op);
        assert_eq!(after.replicas.len(), shard.replicas.len());
        assert!(after.replica_on(1).is_none());
        assert!(after.voter_on(4).is_some());
        assert_eq!(after.leader_node(), Some(2));
    }

    #[test]
    fn test_move_peer_without_learner() {
        let cluster = make_cluster();
        cluster.update_options(|o| o.enable_learner = false);
        let shard = cluster.get_shard(1).unwrap();
        let op = create_move_peer_operator("move", &cluster, &shard, OperatorKind::ADMIN, 3, 5).unwrap();

        assert_eq!(op.len(), 2);
        assert!(matches!(op.step(0), Some(OpStep::AddPeer { node_id: 5, .. })));
        assert!(!op.kind().contains(OperatorKind::LEADER));
        assert!(op.kind().contains(OperatorKind::ADMIN));
    }

    #[test]
    fn test_move_peer_preconditions() {
        let cluster = make_cluster();
        let shard = cluster.get_shard(1).unwrap();

        assert!(matches!(
            create_move_peer_operator("m", &cluster, &shard, OperatorKind::empty(), 4, 5),
            Err(ScheduleError::NoReplicaOnNode { .. })
        ));
        assert!(matches!(
            create_move_peer_operator("m", &cluster, &shard, OperatorKind::empty(), 1, 2),
            Err(ScheduleError::DuplicateReplica { .. })
        ));
        assert!(matches!(
            create_move_peer_operator("m", &cluster, &shard, OperatorKind::empty(), 1, 9),
            Err(ScheduleError::NodeNotFound(9))
        ));

        cluster.set_node_state(5, NodeState::Tombstone).unwrap();
        assert!(matches!(
            create_move_peer_operator("m", &cluster, &shard, OperatorKind::empty(), 1, 5),
            Err(ScheduleError::NodeTombstoned(5))
        ));

        cluster.remove_shard(1);
        assert!(matches!(
            create_move_peer_operator("m", &cluster, &shard, OperatorKind::empty(), 1, 4),
            Err(ScheduleError::ShardNotFound(1))
        ));
    }

    #[test]
    fn test_move_region() {
        let cluster = make_cluster();
        let shard = cluster.get_shard(1).unwrap();

        let op = create_move_region_operator("mr", &cluster, &shard, OperatorKind::ADMIN, &[3, 4, 5]).unwrap();
        let after = apply(&shard, &op);
        let mut nodes = after.node_ids();
        nodes.sort_unstable();
        assert_eq!(nodes, vec![3, 4, 5]);
        assert_eq!(after.leader_node(), Some(3));

        assert!(matches!(
            create_move_region_operator("mr", &cluster, &shard, OperatorKind::ADMIN, &[1, 2, 3, 4]),
            Err(ScheduleError::ReplicaLimitExceeded { count: 4, max: 3 })
        ));

        cluster.set_node_state(4, NodeState::Tombstone).unwrap();
        assert!(matches!(
            create_move_region_operator("mr", &cluster, &shard, OperatorKind::ADMIN, &[2, 3, 4]),
            Err(ScheduleError::NodeTombstoned(4))
        ));
    }

    #[test]
    fn test_transfer_leader() {
        let cluster = make_cluster();
        let shard = cluster.get_shard(1).unwrap();

        let op = create_transfer_leader_operator("tl", &shard, 3, OperatorKind::ADMIN).unwrap();
        assert_eq!(op.len(), 1);
        assert!(op.kind().contains(OperatorKind::LEADER));

        assert!(matches!(
            create_transfer_leader_operator("tl", &shard, 1, OperatorKind::ADMIN),
            Err(ScheduleError::AlreadyLeader { .. })
        ));
        assert!(matches!(
            create_transfer_leader_operator("tl", &shard, 4, OperatorKind::ADMIN),
            Err(ScheduleError::NoVoterOnNode { .. })
        ));
    }

    #[test]
    fn test_add_and_remove_peer() {
        let cluster = make_cluster();
        let shard = cluster.get_shard(1).unwrap();

        // three voters already at the limit
        assert!(matches!(
            create_add_peer_operator("ap", &cluster, &shard, 4, OperatorKind::ADMIN),
            Err(ScheduleError::ReplicaLimitExceeded { count: 4, max: 3 })
        ));
        let learner = create_add_learner_operator("al", &cluster, &shard, 4, OperatorKind::ADMIN).unwrap();
        assert_eq!(learner.len(), 1);

        let remove = create_remove_peer_operator("rp", &shard, 1, OperatorKind::ADMIN).unwrap();
        assert_eq!(remove.len(), 2);
        assert!(matches!(remove.step(0), Some(OpStep::TransferLeader { .. })));

        cluster.update_options(|o| o.enable_learner = false);
        assert!(matches!(
            create_add_learner_operator("al", &cluster, &shard, 4, OperatorKind::ADMIN),
            Err(ScheduleError::LearnerDisabled)
        ));
    }

    #[test]
    fn test_remove_last_voter() {
        let cluster = make_cluster();
        cluster.add_leader_shard(3, b"zz", b"zzz", 4, &[]).unwrap();
        let shard = cluster.get_shard(3).unwrap();
        assert!(matches!(
            create_remove_peer_operator("rp", &shard, 4, OperatorKind::ADMIN),
            Err(ScheduleError::LastVoter(3))
        ));
    }

    #[test]
    fn test_merge_region() {
        let cluster = make_cluster();
        let left = cluster.get_shard(1).unwrap();
        let right = cluster.get_shard(2).unwrap();

        let ops = create_merge_region_operator("merge", &cluster, &left, &right, OperatorKind::ADMIN).unwrap();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].shard_id(), 1);
        assert_eq!(ops[1].shard_id(), 2);
        assert!(ops[0].kind().contains(OperatorKind::MERGE));
        // same node sets: only the merge step
        assert_eq!(ops[0].len(), 1);
    }

    #[test]
    fn test_merge_aligns_placement() {
        let cluster = make_cluster();
        cluster.add_leader_shard(3, b"a", b"b", 3, &[4, 5]).unwrap();
        cluster.add_leader_shard(4, b"b", b"c", 1, &[2, 3]).unwrap();
        let source = cluster.get_shard(3).unwrap();
        let target = cluster.get_shard(4).unwrap();

        let ops = create_merge_region_operator("merge", &cluster, &source, &target, OperatorKind::empty()).unwrap();
        assert!(ops[0].kind().contains(OperatorKind::REGION));
        assert!(matches!(ops[0].steps().last(), Some(OpStep::MergeRegion { is_passive: false, .. })));
        assert!(ops[0].len() > 1);
    }

    #[test]
    fn test_merge_rejects_abnormal_and_non_adjacent() {
        let cluster = make_cluster();
        cluster.add_leader_shard(3, b"x", b"y", 1, &[2, 3]).unwrap();
        let first = cluster.get_shard(1).unwrap();
        let far = cluster.get_shard(3).unwrap();
        assert!(matches!(
            create_merge_region_operator("merge", &cluster, &first, &far, OperatorKind::ADMIN),
            Err(ScheduleError::NotAdjacent)
        ));

        let mut pending = cluster.get_shard(2).unwrap();
        pending.pending_replicas.push(pending.replicas[1].id);
        assert!(matches!(
            create_merge_region_operator("merge", &cluster, &first, &pending, OperatorKind::ADMIN),
            Err(ScheduleError::AbnormalPeer(2))
        ));
    }

    #[test]
    fn test_split_region() {
        let cluster = make_cluster();
        let shard = cluster.get_shard(1).unwrap();

        let op = create_split_region_operator("split", &shard, OperatorKind::ADMIN, SplitPolicy::Keys, vec![b"c".to_vec()])
            .unwrap();
        assert!(op.kind().contains(OperatorKind::SPLIT));

        assert!(create_split_region_operator("split", &shard, OperatorKind::ADMIN, SplitPolicy::Keys, vec![]).is_err());
        assert!(create_split_region_operator(
            "split",
            &shard,
            OperatorKind::ADMIN,
            SplitPolicy::Keys,
            vec![b"z".to_vec()]
        )
        .is_err());
        assert!(create_split_region_operator("split", &shard, OperatorKind::ADMIN, SplitPolicy::Approximate, vec![]).is_ok());
    }
}
