//! Operator Controller
//!
//! Owns in-flight operators and drives them to a terminal state:
//! - Admission (one operator per shard, per-node rate limits)
//! - Waiting queue for scheduler-proposed operators
//! - Step dispatch checked against the live shard
//! - Timeout, cancellation and finished-operator history

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

use shardplace_core::{
    Cluster, NodeId, OpStatus, OpStep, Operator, OperatorHistory, OperatorKind, Result,
    ScheduleError, ShardId, StepSink,
};

/// Controller configuration
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Operators still running after this long are abandoned
    pub operator_timeout: Duration,
    /// How long finished operators stay queryable
    pub history_retention: Duration,
    /// Default per-node budget in limited steps per minute
    pub node_limit_rate: f64,
    /// Track operators but never send steps
    pub dry_run: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            operator_timeout: Duration::from_secs(600), // 10 minutes
            history_retention: Duration::from_secs(30 * 60),
            node_limit_rate: 15.0,
            dry_run: false,
        }
    }
}

/// Outcome of one patrol pass
#[derive(Debug, Default)]
pub struct PatrolResult {
    /// Shards whose operator completed
    pub succeeded: Vec<ShardId>,
    /// Shards whose operator timed out
    pub timed_out: Vec<ShardId>,
    /// Shards whose operator was cancelled
    pub cancelled: Vec<ShardId>,
    /// Steps sent to nodes
    pub dispatched: usize,
    /// Waiting operators started
    pub promoted: usize,
    /// Patrol time
    pub duration: Duration,
}

impl PatrolResult {
    /// Summary string
    pub fn summary(&self) -> String {
        format!(
            "{} succeeded, {} timed out, {} cancelled, {} steps dispatched, {} promoted in {:?}",
            self.succeeded.len(),
            self.timed_out.len(),
            self.cancelled.len(),
            self.dispatched,
            self.promoted,
            self.duration
        )
    }

    pub fn is_idle(&self) -> bool {
        self.succeeded.is_empty()
            && self.timed_out.is_empty()
            && self.cancelled.is_empty()
            && self.dispatched == 0
            && self.promoted == 0
    }
}

/// Token bucket measured in steps per minute
#[derive(Debug, Clone)]
struct NodeLimiter {
    rate: f64,
    tokens: f64,
    last: Instant,
}

impl NodeLimiter {
    fn new(rate: f64) -> Self {
        Self {
            rate,
            tokens: rate,
            last: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate / 60.0).min(self.rate);
        self.last = now;
    }

    fn available(&mut self, now: Instant) -> bool {
        self.refill(now);
        self.tokens >= 1.0
    }

    fn take(&mut self, now: Instant) {
        self.refill(now);
        self.tokens -= 1.0;
    }
}

enum Admission {
    Accept { replaces: bool },
    /// Try again later
    Limited,
    Reject(ScheduleError),
}

/// In-flight operator registry
pub struct OperatorController {
    cluster: Arc<dyn Cluster>,
    sink: Arc<dyn StepSink>,
    config: ControllerConfig,
    operators: RwLock<HashMap<ShardId, Operator>>,
    waiting: Mutex<VecDeque<Operator>>,
    limiters: Mutex<HashMap<NodeId, NodeLimiter>>,
    default_rate: RwLock<f64>,
    history: Mutex<VecDeque<Operator>>,
}

impl OperatorController {
    /// Create a new controller
    pub fn new(cluster: Arc<dyn Cluster>, sink: Arc<dyn StepSink>, config: ControllerConfig) -> Self {
        let default_rate = config.node_limit_rate;
        Self {
            cluster,
            sink,
            config,
            operators: RwLock::new(HashMap::new()),
            waiting: Mutex::new(VecDeque::new()),
            limiters: Mutex::new(HashMap::new()),
            default_rate: RwLock::new(default_rate),
            history: Mutex::new(VecDeque::new()),
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    fn check_add(&self, op: &Operator, operators: &HashMap<ShardId, Operator>) -> Admission {
        if self.cluster.get_shard(op.shard_id()).is_none() {
            return Admission::Reject(ScheduleError::ShardNotFound(op.shard_id()));
        }
        if op.is_timeout(self.config.operator_timeout, Utc::now()) {
            return Admission::Reject(ScheduleError::AdmissionRejected(format!(
                "operator {} expired before start",
                op.desc()
            )));
        }
        let replaces = match operators.get(&op.shard_id()) {
            None => false,
            Some(old)
                if op.kind().contains(OperatorKind::ADMIN)
                    && !old.kind().contains(OperatorKind::ADMIN) =>
            {
                true
            }
            Some(old) => {
                return Admission::Reject(ScheduleError::AdmissionRejected(format!(
                    "shard {} already has operator {}",
                    op.shard_id(),
                    old.desc()
                )))
            }
        };

        let now = Instant::now();
        let rate = *self.default_rate.read();
        let mut limiters = self.limiters.lock();
        for node_id in op.limited_nodes() {
            let limiter = limiters
                .entry(node_id)
                .or_insert_with(|| NodeLimiter::new(rate));
            if !limiter.available(now) {
                return Admission::Limited;
            }
        }
        Admission::Accept { replaces }
    }

    /// Register and start an operator immediately
    #[instrument(skip(self, op), fields(shard_id = op.shard_id(), operator = op.desc()))]
    pub fn add_operator(&self, op: Operator) -> Result<()> {
        self.add_operators(vec![op])
    }

    /// Register several operators, all or none
    pub fn add_operators(&self, ops: Vec<Operator>) -> Result<()> {
        let mut operators = self.operators.write();
        let mut replaces = Vec::with_capacity(ops.len());
        for op in &ops {
            match self.check_add(op, &operators) {
                Admission::Accept { replaces: r } => replaces.push(r),
                Admission::Limited => {
                    return Err(ScheduleError::AdmissionRejected(format!(
                        "node limit reached for operator {}",
                        op.desc()
                    )))
                }
                Admission::Reject(e) => return Err(e),
            }
        }
        for (op, replaces) in ops.into_iter().zip(replaces) {
            self.start_operator(op, replaces, &mut operators);
        }
        Ok(())
    }

    /// Queue scheduler-proposed operators. Rejected when any of their
    /// shards already has an operator in flight or queued.
    pub fn add_waiting_operator(&self, ops: Vec<Operator>) -> Result<usize> {
        {
            let operators = self.operators.read();
            let mut waiting = self.waiting.lock();
            for op in &ops {
                let shard_id = op.shard_id();
                if operators.contains_key(&shard_id)
                    || waiting.iter().any(|w| w.shard_id() == shard_id)
                {
                    return Err(ScheduleError::AdmissionRejected(format!(
                        "shard {} already has an operator",
                        shard_id
                    )));
                }
            }
            let count = ops.len();
            waiting.extend(ops);
            debug!(count, waiting = waiting.len(), "Operators queued");
        }
        self.promote_waiting_operators();
        Ok(self.waiting.lock().len())
    }

    /// Start queued operators whose nodes have budget; drop stale ones
    pub fn promote_waiting_operators(&self) -> usize {
        let mut operators = self.operators.write();
        let mut waiting = self.waiting.lock();
        let mut promoted = 0;
        let mut still_waiting = VecDeque::with_capacity(waiting.len());

        while let Some(op) = waiting.pop_front() {
            match self.check_add(&op, &operators) {
                Admission::Accept { replaces } => {
                    self.start_operator(op, replaces, &mut operators);
                    promoted += 1;
                }
                Admission::Limited => still_waiting.push_back(op),
                Admission::Reject(e) => {
                    warn!(shard_id = op.shard_id(), operator = op.desc(), error = %e, "Dropping waiting operator");
                    self.finish(op, OpStatus::Cancelled);
                }
            }
        }
        *waiting = still_waiting;
        promoted
    }

    fn start_operator(&self, mut op: Operator, replaces: bool, operators: &mut HashMap<ShardId, Operator>) {
        if replaces {
            if let Some(old) = operators.remove(&op.shard_id()) {
                info!(shard_id = old.shard_id(), operator = old.desc(), "Operator replaced");
                self.finish(old, OpStatus::Replaced);
            }
        }

        let now = Instant::now();
        {
            let rate = *self.default_rate.read();
            let mut limiters = self.limiters.lock();
            for node_id in op.limited_nodes() {
                limiters
                    .entry(node_id)
                    .or_insert_with(|| NodeLimiter::new(rate))
                    .take(now);
            }
        }

        op.set_status(OpStatus::Running);
        info!(shard_id = op.shard_id(), operator = %op, "Operator started");
        if let Some(shard) = self.cluster.get_shard(op.shard_id()) {
            if let Some(step) = op.check(&shard).cloned() {
                self.send(&shard, &step);
            }
        }
        operators.insert(op.shard_id(), op);
    }

    fn send(&self, shard: &shardplace_core::Shard, step: &OpStep) {
        if self.config.dry_run {
            info!(shard_id = shard.id, step = %step, "Dry run, step not sent");
            return;
        }
        debug!(shard_id = shard.id, step = %step, "Sending step");
        self.sink.send_step(shard, step);
    }

    fn finish(&self, mut op: Operator, status: OpStatus) {
        op.set_status(status);
        self.history.lock().push_back(op);
    }

    /// Advance the shard's operator against the live shard
    pub fn dispatch(&self, shard_id: ShardId) -> Option<OpStatus> {
        let live = self.cluster.get_shard(shard_id);
        let mut operators = self.operators.write();
        let op = operators.get_mut(&shard_id)?;

        let (status, step) = match &live {
            None if op.kind().contains(OperatorKind::MERGE) => (OpStatus::Success, None),
            None => (OpStatus::Cancelled, None),
            Some(_) if op.is_timeout(self.config.operator_timeout, Utc::now()) => {
                (OpStatus::Timeout, None)
            }
            Some(shard) => match op.check(shard) {
                None => (OpStatus::Success, None),
                Some(step) => (OpStatus::Running, Some(step.clone())),
            },
        };

        if let (Some(shard), Some(step)) = (&live, &step) {
            self.send(shard, step);
            return Some(OpStatus::Running);
        }

        let op = operators.remove(&shard_id)?;
        match status {
            OpStatus::Success => info!(shard_id, operator = op.desc(), "Operator finished"),
            OpStatus::Timeout => warn!(shard_id, operator = op.desc(), "Operator timed out"),
            _ => info!(shard_id, operator = op.desc(), status = ?status, "Operator ended"),
        }
        self.finish(op, status);
        Some(status)
    }

    /// Dispatch every in-flight operator, promote waiting ones and prune
    /// expired history
    #[instrument(skip(self))]
    pub fn patrol(&self) -> PatrolResult {
        let start = Instant::now();
        let mut result = PatrolResult::default();

        let shard_ids: Vec<ShardId> = self.operators.read().keys().copied().collect();
        for shard_id in shard_ids {
            match self.dispatch(shard_id) {
                Some(OpStatus::Running) => result.dispatched += 1,
                Some(OpStatus::Success) => result.succeeded.push(shard_id),
                Some(OpStatus::Timeout) => result.timed_out.push(shard_id),
                Some(_) => result.cancelled.push(shard_id),
                None => {}
            }
        }

        result.promoted = self.promote_waiting_operators();
        self.prune_history(Utc::now());
        result.duration = start.elapsed();

        if !result.is_idle() {
            debug!(summary = %result.summary(), "Patrol complete");
        }
        result
    }

    /// Cancel the shard's operator
    pub fn remove_operator(&self, shard_id: ShardId) -> Result<Operator> {
        let removed = self.operators.write().remove(&shard_id);
        let op = match removed {
            Some(op) => op,
            None => {
                let mut waiting = self.waiting.lock();
                let index = waiting
                    .iter()
                    .position(|op| op.shard_id() == shard_id)
                    .ok_or(ScheduleError::OperatorNotFound)?;
                waiting.remove(index).ok_or(ScheduleError::OperatorNotFound)?
            }
        };
        info!(shard_id, operator = op.desc(), "Operator removed");
        let mut snapshot = op.clone();
        snapshot.set_status(OpStatus::Cancelled);
        self.finish(op, OpStatus::Cancelled);
        Ok(snapshot)
    }

    pub fn get_operator(&self, shard_id: ShardId) -> Option<Operator> {
        self.operators.read().get(&shard_id).cloned()
    }

    /// Running operators
    pub fn operators(&self) -> Vec<Operator> {
        let mut ops: Vec<Operator> = self.operators.read().values().cloned().collect();
        ops.sort_by_key(|op| op.shard_id());
        ops
    }

    pub fn operators_of_kind(&self, kind: OperatorKind) -> Vec<Operator> {
        self.operators()
            .into_iter()
            .filter(|op| op.kind().contains(kind))
            .collect()
    }

    pub fn waiting_operators(&self) -> Vec<Operator> {
        self.waiting.lock().iter().cloned().collect()
    }

    /// Running and queued operators of the given kind
    pub fn operator_count(&self, kind: OperatorKind) -> u64 {
        let running = self
            .operators
            .read()
            .values()
            .filter(|op| op.kind().contains(kind))
            .count();
        let queued = self
            .waiting
            .lock()
            .iter()
            .filter(|op| op.kind().contains(kind))
            .count();
        (running + queued) as u64
    }

    /// Moves finished at or after `since`
    pub fn history_since(&self, since: DateTime<Utc>) -> Vec<OperatorHistory> {
        self.history
            .lock()
            .iter()
            .filter(|op| op.status() == OpStatus::Success)
            .filter_map(|op| op.finished_at().map(|t| (op, t)))
            .filter(|(_, t)| *t >= since)
            .flat_map(|(op, t)| op.history(t))
            .collect()
    }

    /// Finished operators in completion order
    pub fn finished_operators(&self) -> Vec<Operator> {
        self.history.lock().iter().cloned().collect()
    }

    fn prune_history(&self, now: DateTime<Utc>) {
        let retention = chrono::Duration::from_std(self.config.history_retention)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let cutoff = now - retention;
        let mut history = self.history.lock();
        while history
            .front()
            .and_then(|op| op.finished_at())
            .is_some_and(|t| t < cutoff)
        {
            history.pop_front();
        }
    }

    /// Apply one rate to every node, replacing per-node overrides
    pub fn set_all_nodes_limit(&self, rate: f64) -> Result<()> {
        if rate <= 0.0 {
            return Err(ScheduleError::invalid_args(format!("invalid node limit rate {}", rate)));
        }
        *self.default_rate.write() = rate;
        let mut limiters = self.limiters.lock();
        limiters.clear();
        for node in self.cluster.nodes() {
            limiters.insert(node.id, NodeLimiter::new(rate));
        }
        info!(rate, "Node limits updated");
        Ok(())
    }

    pub fn set_node_limit(&self, node_id: NodeId, rate: f64) -> Result<()> {
        if rate <= 0.0 {
            return Err(ScheduleError::invalid_args(format!("invalid node limit rate {}", rate)));
        }
        if self.cluster.get_node(node_id).is_none() {
            return Err(ScheduleError::NodeNotFound(node_id));
        }
        self.limiters.lock().insert(node_id, NodeLimiter::new(rate));
        info!(node_id, rate, "Node limit updated");
        Ok(())
    }

    /// Configured rate per known node
    pub fn node_limits(&self) -> BTreeMap<NodeId, f64> {
        let default_rate = *self.default_rate.read();
        let limiters = self.limiters.lock();
        self.cluster
            .nodes()
            .into_iter()
            .map(|node| {
                let rate = limiters.get(&node.id).map_or(default_rate, |l| l.rate);
                (node.id, rate)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{create_move_peer_operator, create_transfer_leader_operator};
    use shardplace_core::{MemoryCluster, NoopSink};

    fn make_cluster() -> Arc<MemoryCluster> {
        let cluster = Arc::new(MemoryCluster::default());
        for id in 1..=4 {
            cluster.add_labeled_node(id, &[]);
        }
        cluster.add_leader_shard(1, b"", b"m", 1, &[2, 3]).unwrap();
        cluster.add_leader_shard(2, b"m", b"", 2, &[1, 3]).unwrap();
        cluster
    }

    fn applying_controller(cluster: &Arc<MemoryCluster>) -> OperatorController {
        OperatorController::new(cluster.clone(), cluster.clone(), ControllerConfig::default())
    }

    fn move_op(cluster: &MemoryCluster, shard_id: ShardId, from: NodeId, to: NodeId) -> Operator {
        let shard = cluster.get_shard(shard_id).unwrap();
        create_move_peer_operator("move", cluster, &shard, OperatorKind::REGION, from, to).unwrap()
    }

    #[test]
    fn test_controller_config_default() {
        let config = ControllerConfig::default();
        assert_eq!(config.operator_timeout, Duration::from_secs(600));
        assert_eq!(config.node_limit_rate, 15.0);
        assert!(!config.dry_run);
    }

    #[test]
    fn test_patrol_result_summary() {
        let result = PatrolResult {
            succeeded: vec![1, 2],
            dispatched: 3,
            ..Default::default()
        };
        assert!(result.summary().starts_with("2 succeeded, 0 timed out"));
        assert!(!result.is_idle());
        assert!(PatrolResult::default().is_idle());
    }

    #[test]
    fn test_operator_runs_to_completion() {
        let cluster = make_cluster();
        let controller = applying_controller(&cluster);

        controller.add_operator(move_op(&cluster, 1, 3, 4)).unwrap();
        assert_eq!(controller.operator_count(OperatorKind::REGION), 1);

        // each patrol applies one step through the in-memory sink
        for _ in 0..5 {
            controller.patrol();
        }
        assert!(controller.get_operator(1).is_none());
        let shard = cluster.get_shard(1).unwrap();
        assert!(shard.replica_on(3).is_none());
        assert!(shard.voter_on(4).is_some());

        let history = controller.history_since(Utc::now() - chrono::Duration::minutes(1));
        assert_eq!(history.len(), 1);
        assert_eq!((history[0].from_node, history[0].to_node), (3, 4));
    }

    #[test]
    fn test_one_operator_per_shard() {
        let cluster = make_cluster();
        let controller = OperatorController::new(cluster.clone(), Arc::new(NoopSink), ControllerConfig::default());

        controller.add_operator(move_op(&cluster, 1, 3, 4)).unwrap();
        let second = move_op(&cluster, 1, 2, 4);
        assert!(matches!(
            controller.add_operator(second.clone()),
            Err(ScheduleError::AdmissionRejected(_))
        ));
        assert!(controller.add_waiting_operator(vec![second]).is_err());

        // an admin operator replaces a scheduler one
        let shard = cluster.get_shard(1).unwrap();
        let admin = create_transfer_leader_operator("admin-tl", &shard, 2, OperatorKind::ADMIN).unwrap();
        controller.add_operator(admin).unwrap();
        assert_eq!(controller.get_operator(1).unwrap().desc(), "admin-tl");
        assert_eq!(controller.finished_operators()[0].status(), OpStatus::Replaced);
    }

    #[test]
    fn test_waiting_queue_and_kind_filters() {
        let cluster = make_cluster();
        let controller = OperatorController::new(cluster.clone(), Arc::new(NoopSink), ControllerConfig::default());

        let left = move_op(&cluster, 1, 3, 4);
        let shard = cluster.get_shard(2).unwrap();
        let leader = create_transfer_leader_operator("tl", &shard, 3, OperatorKind::empty()).unwrap();
        controller.add_waiting_operator(vec![left]).unwrap();
        controller.add_waiting_operator(vec![leader]).unwrap();

        assert!(controller.waiting_operators().is_empty());
        assert_eq!(controller.operators().len(), 2);
        assert_eq!(controller.operators_of_kind(OperatorKind::LEADER).len(), 1);
        assert_eq!(controller.operators_of_kind(OperatorKind::ADMIN).len(), 0);
    }

    #[test]
    fn test_node_limit_keeps_operator_waiting() {
        let cluster = make_cluster();
        let controller = OperatorController::new(cluster.clone(), Arc::new(NoopSink), ControllerConfig::default());
        controller.set_node_limit(4, 1.0).unwrap();

        controller.add_waiting_operator(vec![move_op(&cluster, 1, 3, 4)]).unwrap();
        let queued = controller
            .add_waiting_operator(vec![move_op(&cluster, 2, 3, 4)])
            .unwrap();
        assert_eq!(queued, 1);
        assert_eq!(controller.waiting_operators()[0].shard_id(), 2);
        assert_eq!(controller.operator_count(OperatorKind::REGION), 2);

        assert_eq!(controller.node_limits().get(&4), Some(&1.0));
        assert_eq!(controller.node_limits().get(&1), Some(&15.0));
        assert!(controller.set_node_limit(9, 1.0).is_err());
        assert!(controller.set_all_nodes_limit(0.0).is_err());
    }

    #[test]
    fn test_remove_operator() {
        let cluster = make_cluster();
        let controller = OperatorController::new(cluster.clone(), Arc::new(NoopSink), ControllerConfig::default());
        controller.add_operator(move_op(&cluster, 1, 3, 4)).unwrap();

        let removed = controller.remove_operator(1).unwrap();
        assert_eq!(removed.status(), OpStatus::Cancelled);
        assert!(matches!(controller.remove_operator(1), Err(ScheduleError::OperatorNotFound)));
        assert!(controller.history_since(Utc::now() - chrono::Duration::minutes(1)).is_empty());
    }

    #[test]
    fn test_operator_timeout() {
        let cluster = make_cluster();
        let controller = OperatorController::new(
            cluster.clone(),
            Arc::new(NoopSink),
            ControllerConfig {
                operator_timeout: Duration::ZERO,
                ..Default::default()
            },
        );
        let mut operators = controller.operators.write();
        let op = move_op(&cluster, 1, 3, 4);
        operators.insert(1, op);
        drop(operators);

        std::thread::sleep(Duration::from_millis(5));
        let result = controller.patrol();
        assert_eq!(result.timed_out, vec![1]);
    }

    #[test]
    fn test_vanished_shard_cancels() {
        let cluster = make_cluster();
        let controller = OperatorController::new(cluster.clone(), Arc::new(NoopSink), ControllerConfig::default());
        controller.add_operator(move_op(&cluster, 1, 3, 4)).unwrap();
        cluster.remove_shard(1);

        assert_eq!(controller.dispatch(1), Some(OpStatus::Cancelled));
        assert_eq!(controller.dispatch(1), None);
    }
}
