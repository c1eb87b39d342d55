//! Administrative entry points
//!
//! Thin validation layer in front of the coordinator and the operator
//! controller. Every call validates its inputs against the live cluster
//! and returns a descriptive error; translating errors into user-visible
//! status is left to whatever transport sits on top.
//!
//! - Scheduler management and label migrations
//! - Operator listing, removal and admin operators
//! - Delayed leader transfer
//! - Node limits, history and key lookups

use chrono::{DateTime, SecondsFormat, Utc};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument};

use shardplace_core::{
    Label, Node, NodeId, Operator, OperatorHistory, OperatorKind, Result, ScheduleError, Shard,
    ShardId, SplitPolicy,
};

use crate::affinity::AffinityDirection;
use crate::builder::{
    create_add_learner_operator, create_add_peer_operator, create_merge_region_operator,
    create_move_peer_operator, create_move_region_operator, create_remove_peer_operator,
    create_split_region_operator, create_transfer_leader_operator,
};
use crate::coordinator::Coordinator;
use crate::persist::PersistedScheduler;
use crate::scatter::Scatterer;
use crate::schedulers::{
    evict_leader, grant_leader, label_affinity, transfer_leader, transfer_to_label,
    transfer_to_store,
};

/// Unit of a delayed leader transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayUnit {
    Minute,
    Hour,
    Day,
}

impl DelayUnit {
    pub fn duration(&self, amount: u64) -> Duration {
        let secs = match self {
            DelayUnit::Minute => 60,
            DelayUnit::Hour => 60 * 60,
            DelayUnit::Day => 24 * 60 * 60,
        };
        Duration::from_secs(amount.saturating_mul(secs))
    }
}

impl FromStr for DelayUnit {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "min" => Ok(DelayUnit::Minute),
            "hour" => Ok(DelayUnit::Hour),
            "day" => Ok(DelayUnit::Day),
            other => Err(ScheduleError::invalid_args(format!("unknown time unit: {}", other))),
        }
    }
}

pub struct Handler {
    coordinator: Arc<Coordinator>,
    scatterer: Scatterer,
}

impl Handler {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        let scatterer = Scatterer::new(coordinator.cluster().clone(), coordinator.affinity().clone());
        Self {
            coordinator,
            scatterer,
        }
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    fn shard(&self, shard_id: ShardId) -> Result<Shard> {
        self.coordinator
            .cluster()
            .get_shard(shard_id)
            .ok_or(ScheduleError::ShardNotFound(shard_id))
    }

    fn node(&self, node_id: NodeId) -> Result<Node> {
        self.coordinator
            .cluster()
            .get_node(node_id)
            .ok_or(ScheduleError::NodeNotFound(node_id))
    }

    /// Some node must carry `label`
    fn check_label(&self, label: &Label) -> Result<()> {
        if self.coordinator.cluster().nodes().iter().any(|n| label.matches(n)) {
            Ok(())
        } else {
            Err(ScheduleError::LabelNotFound {
                key: label.key.clone(),
                value: label.value.clone(),
            })
        }
    }

    // ===== Schedulers =====

    pub fn schedulers(&self) -> Vec<PersistedScheduler> {
        self.coordinator.scheduler_configs()
    }

    #[instrument(skip(self))]
    pub fn add_scheduler(&self, scheduler_type: &str, args: &[String]) -> Result<String> {
        self.coordinator.add_scheduler_by_type(scheduler_type, args)
    }

    pub fn remove_scheduler(&self, name: &str) -> Result<()> {
        self.coordinator.remove_scheduler(name)
    }

    pub fn add_evict_leader_scheduler(&self, node_id: NodeId) -> Result<String> {
        self.node(node_id)?;
        self.add_scheduler(evict_leader::TYPE, &[node_id.to_string()])
    }

    pub fn add_grant_leader_scheduler(&self, node_id: NodeId) -> Result<String> {
        self.node(node_id)?;
        self.add_scheduler(grant_leader::TYPE, &[node_id.to_string()])
    }

    pub fn add_transfer_to_store_scheduler(&self, shard_id: ShardId, node_id: NodeId) -> Result<String> {
        self.shard(shard_id)?;
        self.node(node_id)?;
        self.add_scheduler(transfer_to_store::TYPE, &[shard_id.to_string(), node_id.to_string()])
    }

    // ===== Label migration =====

    /// Start migrating one shard onto nodes labeled `key=value`
    pub fn add_shard_to_label_scheduler(&self, shard_id: ShardId, key: &str, value: &str) -> Result<String> {
        let label = Label::new(key, value);
        self.shard(shard_id)?;
        self.check_label(&label)?;
        self.add_scheduler(
            label_affinity::TYPE,
            &[shard_id.to_string(), label.key, label.value],
        )
    }

    /// Start migrating each listed shard; shards already migrating to the
    /// same label keep their scheduler
    pub fn add_shards_to_label_schedulers(
        &self,
        shard_ids: &[ShardId],
        key: &str,
        value: &str,
    ) -> Result<Vec<String>> {
        let label = Label::new(key, value);
        self.check_label(&label)?;
        for shard_id in shard_ids {
            self.shard(*shard_id)?;
        }

        let mut names = Vec::with_capacity(shard_ids.len());
        for shard_id in shard_ids {
            let args = [shard_id.to_string(), label.key.clone(), label.value.clone()];
            match self.add_scheduler(label_affinity::TYPE, &args) {
                Ok(name) | Err(ScheduleError::SchedulerExists(name)) => names.push(name),
                Err(e) => return Err(e),
            }
        }
        Ok(names)
    }

    /// Migrate up to `limit` shards starting at the one containing
    /// `start_key`
    pub fn add_range_to_label_schedulers(
        &self,
        start_key: &[u8],
        limit: usize,
        key: &str,
        value: &str,
    ) -> Result<Vec<String>> {
        let shard_ids = self.shards_by_range(start_key, limit);
        self.add_shards_to_label_schedulers(&shard_ids, key, value)
    }

    /// Migrate every shard on nodes labeled `from_key=from_value`
    pub fn add_label_to_label_scheduler(
        &self,
        from_key: &str,
        from_value: &str,
        key: &str,
        value: &str,
    ) -> Result<String> {
        self.add_scheduler(
            transfer_to_label::TYPE,
            &[
                from_key.to_string(),
                from_value.to_string(),
                key.to_string(),
                value.to_string(),
            ],
        )
    }

    /// Replace one side of the label-affinity preference; an empty key
    /// clears it
    pub fn set_label_affinity(&self, direction: &str, key: &str, value: &str) -> Result<()> {
        let direction: AffinityDirection = direction.parse()?;
        let labels = if key.is_empty() {
            Vec::new()
        } else {
            vec![Label::new(key, value)]
        };
        self.coordinator.set_label_affinity(direction, labels);
        Ok(())
    }

    // ===== Leader transfer =====

    /// Transfer leadership now, or after `amount` units when `delay` is
    /// given. A delayed transfer is validated immediately and then runs
    /// as a one-shot scheduler; returns that scheduler's name.
    #[instrument(skip(self))]
    pub fn transfer_leader(
        &self,
        shard_id: ShardId,
        node_id: NodeId,
        delay: Option<(u64, &str)>,
    ) -> Result<Option<String>> {
        let Some((amount, unit)) = delay else {
            self.add_transfer_leader_operator(shard_id, node_id)?;
            return Ok(None);
        };
        let unit: DelayUnit = unit.parse()?;
        self.shard(shard_id)?;
        self.node(node_id)?;

        let delay = chrono::Duration::from_std(unit.duration(amount))
            .map_err(|_| ScheduleError::invalid_args(format!("delay too large: {}", amount)))?;
        let run_at: DateTime<Utc> = Utc::now() + delay;
        let name = self.add_scheduler(
            transfer_leader::TYPE,
            &[
                shard_id.to_string(),
                node_id.to_string(),
                run_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            ],
        )?;
        info!(shard_id, node_id, run_at = %run_at, "Leader transfer scheduled");
        Ok(Some(name))
    }

    // ===== Operators =====

    /// Running operator of a shard, else its queued one
    pub fn get_operator(&self, shard_id: ShardId) -> Result<Operator> {
        let controller = self.coordinator.controller();
        controller
            .get_operator(shard_id)
            .or_else(|| {
                controller
                    .waiting_operators()
                    .into_iter()
                    .find(|op| op.shard_id() == shard_id)
            })
            .ok_or(ScheduleError::OperatorNotFound)
    }

    /// Operators filtered by kind names (`admin`, `leader`, `region`,
    /// `waiting`); no kinds means every running operator
    pub fn operators(&self, kinds: &[&str]) -> Result<Vec<Operator>> {
        let controller = self.coordinator.controller();
        if kinds.is_empty() {
            return Ok(controller.operators());
        }
        let mut results = Vec::new();
        for kind in kinds {
            match *kind {
                "admin" => results.extend(controller.operators_of_kind(OperatorKind::ADMIN)),
                "leader" => results.extend(controller.operators_of_kind(OperatorKind::LEADER)),
                "region" => results.extend(controller.operators_of_kind(OperatorKind::REGION)),
                "waiting" => results.extend(controller.waiting_operators()),
                other => {
                    return Err(ScheduleError::invalid_args(format!(
                        "unknown operator kind: {}",
                        other
                    )))
                }
            }
        }
        Ok(results)
    }

    pub fn remove_operator(&self, shard_id: ShardId) -> Result<()> {
        self.coordinator.controller().remove_operator(shard_id)?;
        Ok(())
    }

    fn add_operator(&self, op: Operator) -> Result<()> {
        info!(shard_id = op.shard_id(), operator = op.desc(), "Admin operator added");
        self.coordinator.controller().add_operator(op)
    }

    pub fn add_transfer_leader_operator(&self, shard_id: ShardId, node_id: NodeId) -> Result<()> {
        let shard = self.shard(shard_id)?;
        let op = create_transfer_leader_operator("admin-transfer-leader", &shard, node_id, OperatorKind::ADMIN)?;
        self.add_operator(op)
    }

    /// Move the shard onto exactly `node_ids`
    pub fn add_transfer_region_operator(&self, shard_id: ShardId, node_ids: &[NodeId]) -> Result<()> {
        let shard = self.shard(shard_id)?;
        let cluster = self.coordinator.cluster();
        let max = cluster.options().max_replicas;
        if node_ids.len() > max {
            return Err(ScheduleError::ReplicaLimitExceeded {
                count: node_ids.len(),
                max,
            });
        }
        for node_id in node_ids {
            if self.node(*node_id)?.is_tombstone() {
                return Err(ScheduleError::NodeTombstoned(*node_id));
            }
        }
        let op = create_move_region_operator(
            "admin-move-region",
            cluster.as_ref(),
            &shard,
            OperatorKind::ADMIN,
            node_ids,
        )?;
        self.add_operator(op)
    }

    pub fn add_transfer_peer_operator(&self, shard_id: ShardId, from_node: NodeId, to_node: NodeId) -> Result<()> {
        let shard = self.shard(shard_id)?;
        self.node(to_node)?;
        let op = create_move_peer_operator(
            "admin-move-peer",
            self.coordinator.cluster().as_ref(),
            &shard,
            OperatorKind::ADMIN,
            from_node,
            to_node,
        )?;
        self.add_operator(op)
    }

    pub fn add_add_peer_operator(&self, shard_id: ShardId, node_id: NodeId) -> Result<()> {
        let shard = self.shard(shard_id)?;
        let op = create_add_peer_operator(
            "admin-add-peer",
            self.coordinator.cluster().as_ref(),
            &shard,
            node_id,
            OperatorKind::ADMIN,
        )?;
        self.add_operator(op)
    }

    pub fn add_add_learner_operator(&self, shard_id: ShardId, node_id: NodeId) -> Result<()> {
        let shard = self.shard(shard_id)?;
        let op = create_add_learner_operator(
            "admin-add-learner",
            self.coordinator.cluster().as_ref(),
            &shard,
            node_id,
            OperatorKind::ADMIN,
        )?;
        self.add_operator(op)
    }

    pub fn add_remove_peer_operator(&self, shard_id: ShardId, node_id: NodeId) -> Result<()> {
        let shard = self.shard(shard_id)?;
        let op = create_remove_peer_operator("admin-remove-peer", &shard, node_id, OperatorKind::ADMIN)?;
        self.add_operator(op)
    }

    /// Merge `shard_id` into the adjacent `target_id`
    pub fn add_merge_region_operator(&self, shard_id: ShardId, target_id: ShardId) -> Result<()> {
        let shard = self.shard(shard_id)?;
        let target = self.shard(target_id)?;
        let ops = create_merge_region_operator(
            "admin-merge-region",
            self.coordinator.cluster().as_ref(),
            &shard,
            &target,
            OperatorKind::ADMIN,
        )?;
        info!(shard_id, target_id, "Admin merge added");
        self.coordinator.controller().add_operators(ops)
    }

    pub fn add_split_region_operator(&self, shard_id: ShardId, policy: &str, keys: Vec<Vec<u8>>) -> Result<()> {
        let shard = self.shard(shard_id)?;
        let policy = SplitPolicy::parse(policy)
            .ok_or_else(|| ScheduleError::invalid_args(format!("unknown split policy: {}", policy)))?;
        let op = create_split_region_operator("admin-split-region", &shard, OperatorKind::ADMIN, policy, keys)?;
        self.add_operator(op)
    }

    /// Scatter one shard; returns false when it is already spread out
    pub fn add_scatter_region_operator(&self, shard_id: ShardId) -> Result<bool> {
        let shard = self.shard(shard_id)?;
        match self.scatterer.scatter(&shard, OperatorKind::ADMIN)? {
            Some(op) => {
                self.add_operator(op)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // ===== History and limits =====

    pub fn history(&self, since: DateTime<Utc>) -> Vec<OperatorHistory> {
        self.coordinator.controller().history_since(since)
    }

    pub fn set_all_nodes_limit(&self, rate: f64) -> Result<()> {
        self.coordinator.controller().set_all_nodes_limit(rate)
    }

    pub fn set_node_limit(&self, node_id: NodeId, rate: f64) -> Result<()> {
        self.coordinator.controller().set_node_limit(node_id, rate)
    }

    pub fn node_limits(&self) -> std::collections::BTreeMap<NodeId, f64> {
        self.coordinator.controller().node_limits()
    }

    // ===== Lookups =====

    pub fn shard_by_key(&self, key: &[u8]) -> Result<ShardId> {
        self.coordinator
            .cluster()
            .shard_by_key(key)
            .map(|s| s.id)
            .ok_or_else(|| ScheduleError::KeyNotFound(key.to_vec()))
    }

    /// Ids of up to `limit` shards from the one containing `start_key`
    pub fn shards_by_range(&self, start_key: &[u8], limit: usize) -> Vec<ShardId> {
        self.coordinator
            .cluster()
            .scan_shards(start_key, limit)
            .into_iter()
            .map(|s| s.id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;
    use crate::persist::MemoryConfigStore;
    use shardplace_core::{ErrorKind, MemoryCluster};

    fn make_handler() -> (Arc<MemoryCluster>, Handler) {
        let cluster = Arc::new(MemoryCluster::default());
        for id in 1..=4 {
            cluster.add_labeled_node(id, &[("rack", &format!("r{}", id))]);
        }
        // keys g..m belong to no shard
        cluster.add_leader_shard(1, b"", b"g", 1, &[2, 3]).unwrap();
        cluster.add_leader_shard(2, b"m", b"", 1, &[2, 3]).unwrap();
        let config = ServiceConfig {
            initial_schedulers: Vec::new(),
            ..Default::default()
        };
        let coordinator = Arc::new(Coordinator::new(
            cluster.clone(),
            cluster.clone(),
            Arc::new(MemoryConfigStore::new()),
            config,
        ));
        (cluster, Handler::new(coordinator))
    }

    #[test]
    fn test_delay_unit() {
        assert_eq!("hour".parse::<DelayUnit>().unwrap().duration(2), Duration::from_secs(7200));
        assert_eq!("day".parse::<DelayUnit>().unwrap().duration(1), Duration::from_secs(86400));
        assert!("week".parse::<DelayUnit>().is_err());
    }

    #[test]
    fn test_shard_to_label_validation() {
        let (_, handler) = make_handler();
        let err = handler.add_shard_to_label_scheduler(1, "rack", "r9").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(matches!(err, ScheduleError::LabelNotFound { .. }));
        assert!(matches!(
            handler.add_shard_to_label_scheduler(7, "rack", "r4"),
            Err(ScheduleError::ShardNotFound(7))
        ));

        let name = handler.add_shard_to_label_scheduler(1, "rack", "r4").unwrap();
        assert_eq!(handler.schedulers()[0].name, name);
    }

    #[test]
    fn test_range_to_label() {
        let (_, handler) = make_handler();
        let names = handler.add_range_to_label_schedulers(b"", 10, "rack", "r4").unwrap();
        assert_eq!(names.len(), 2);
        // repeating keeps the existing schedulers
        let again = handler.add_range_to_label_schedulers(b"", 10, "rack", "r4").unwrap();
        assert_eq!(names, again);
        assert_eq!(handler.schedulers().len(), 2);
    }

    #[test]
    fn test_delayed_transfer_validates_first() {
        let (_, handler) = make_handler();
        assert!(handler.transfer_leader(1, 2, Some((5, "week"))).is_err());
        assert!(handler.transfer_leader(9, 2, Some((5, "min"))).is_err());
        assert!(handler.transfer_leader(1, 9, Some((5, "min"))).is_err());

        let name = handler.transfer_leader(1, 2, Some((5, "min"))).unwrap().unwrap();
        assert!(name.starts_with("transfer-leader-1-to-2"));
        assert!(handler.get_operator(1).is_err());

        assert_eq!(handler.transfer_leader(2, 3, None).unwrap(), None);
        assert!(handler.get_operator(2).unwrap().kind().contains(OperatorKind::ADMIN));
    }

    #[test]
    fn test_admin_operators() {
        let (_, handler) = make_handler();
        handler.add_transfer_peer_operator(1, 3, 4).unwrap();
        // one operator per shard
        assert!(handler.add_add_peer_operator(1, 4).is_err());

        let err = handler.add_transfer_region_operator(2, &[1, 2, 3, 4]).unwrap_err();
        assert!(matches!(err, ScheduleError::ReplicaLimitExceeded { count: 4, max: 3 }));

        assert_eq!(handler.operators(&["region"]).unwrap().len(), 1);
        assert_eq!(handler.operators(&["leader"]).unwrap().len(), 0);
        assert!(handler.operators(&["bogus"]).is_err());

        handler.remove_operator(1).unwrap();
        assert!(handler.operators(&[]).unwrap().is_empty());

        assert!(matches!(
            handler.add_merge_region_operator(1, 2),
            Err(ScheduleError::NotAdjacent)
        ));
        assert!(handler.add_split_region_operator(2, "sideways", Vec::new()).is_err());
        handler.add_split_region_operator(2, "scan", Vec::new()).unwrap();
    }

    #[test]
    fn test_lookups_and_limits() {
        let (_, handler) = make_handler();
        assert_eq!(handler.shard_by_key(b"q").unwrap(), 2);
        let err = handler.shard_by_key(b"h").unwrap_err();
        assert_eq!(err, ScheduleError::KeyNotFound(b"h".to_vec()));
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(handler.shards_by_range(b"", 1), vec![1]);

        handler.set_node_limit(2, 30.0).unwrap();
        assert_eq!(handler.node_limits().get(&2), Some(&30.0));
        assert!(handler.set_node_limit(9, 30.0).is_err());
        assert!(handler.set_all_nodes_limit(0.0).is_err());
    }

    #[test]
    fn test_set_label_affinity() {
        let (_, handler) = make_handler();
        handler.set_label_affinity("source", "rack", "r1").unwrap();
        let affinity = handler.coordinator().affinity();
        assert_eq!(affinity.preferred_source(), vec![Label::new("rack", "r1")]);
        handler.set_label_affinity("source", "", "").unwrap();
        assert!(affinity.preferred_source().is_empty());
        assert!(handler.set_label_affinity("sideways", "rack", "r1").is_err());
    }
}
