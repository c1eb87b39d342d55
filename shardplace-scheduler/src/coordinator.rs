//! Scheduling coordinator
//!
//! Owns the active schedulers and drives them:
//! - One task per scheduler, ticking at the scheduler's current interval
//! - A patrol task that dispatches operators and evicts stale state
//! - The operation throttle in front of the controller's waiting queue
//! - Persisting the scheduler list and restoring it on start

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use shardplace_core::{
    Cluster, Label, Operator, OperatorKind, Result, ScheduleError, StepSink,
};

use crate::affinity::{AffinityDirection, LabelAffinity};
use crate::config::ServiceConfig;
use crate::controller::{OperatorController, PatrolResult};
use crate::persist::{ConfigStore, PersistedScheduler};
use crate::schedulers::{Scheduler, SchedulerContext, SchedulerRegistry};
use crate::throttle::OperationThrottle;

/// What a single tick did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Run window closed or operator budget spent
    Skipped,
    /// Nothing to propose
    Idle,
    /// Operators were proposed; `dropped` were throttled or rejected
    Proposed { accepted: usize, dropped: usize },
    /// The scheduler finished and was removed
    Retired,
}

/// A scheduler plus its backoff state
struct ScheduleController {
    scheduler: Arc<dyn Scheduler>,
    interval: Mutex<Duration>,
}

impl ScheduleController {
    fn new(scheduler: Arc<dyn Scheduler>) -> Self {
        let interval = scheduler.min_interval();
        Self {
            scheduler,
            interval: Mutex::new(interval),
        }
    }

    fn interval(&self) -> Duration {
        *self.interval.lock()
    }
}

pub struct Coordinator {
    cluster: Arc<dyn Cluster>,
    controller: Arc<OperatorController>,
    affinity: Arc<LabelAffinity>,
    throttle: Arc<OperationThrottle>,
    registry: SchedulerRegistry,
    store: Arc<dyn ConfigStore>,
    schedulers: RwLock<HashMap<String, Arc<ScheduleController>>>,
    /// Serializes snapshot-and-save so the last write is the newest list
    persist_lock: Mutex<()>,
    config: ServiceConfig,
    running: AtomicBool,
    shutdown: watch::Sender<bool>,
}

/// Merge pairs must be admitted together; everything else one by one
fn admission_batches(ops: Vec<Operator>) -> Vec<Vec<Operator>> {
    let (merges, others): (Vec<Operator>, Vec<Operator>) = ops
        .into_iter()
        .partition(|op| op.kind().contains(OperatorKind::MERGE));
    let mut batches: Vec<Vec<Operator>> = others.into_iter().map(|op| vec![op]).collect();
    if !merges.is_empty() {
        batches.push(merges);
    }
    batches
}

impl Coordinator {
    pub fn new(
        cluster: Arc<dyn Cluster>,
        sink: Arc<dyn StepSink>,
        store: Arc<dyn ConfigStore>,
        config: ServiceConfig,
    ) -> Self {
        let controller = Arc::new(OperatorController::new(
            cluster.clone(),
            sink,
            config.controller_config(),
        ));
        let (shutdown, _) = watch::channel(false);
        Self {
            cluster,
            controller,
            affinity: Arc::new(LabelAffinity::new()),
            throttle: Arc::new(OperationThrottle::new(config.throttle_cooldown())),
            registry: SchedulerRegistry::with_builtin(),
            store,
            schedulers: RwLock::new(HashMap::new()),
            persist_lock: Mutex::new(()),
            config,
            running: AtomicBool::new(false),
            shutdown,
        }
    }

    pub fn cluster(&self) -> &Arc<dyn Cluster> {
        &self.cluster
    }

    pub fn controller(&self) -> &Arc<OperatorController> {
        &self.controller
    }

    pub fn affinity(&self) -> &Arc<LabelAffinity> {
        &self.affinity
    }

    pub fn throttle(&self) -> &Arc<OperationThrottle> {
        &self.throttle
    }

    pub fn context(&self) -> SchedulerContext {
        SchedulerContext {
            cluster: self.cluster.clone(),
            controller: self.controller.clone(),
            affinity: self.affinity.clone(),
        }
    }

    /// Build a scheduler of a registered type
    pub fn create_scheduler(&self, scheduler_type: &str, args: &[String]) -> Result<Arc<dyn Scheduler>> {
        self.registry.create(scheduler_type, &self.context(), args)
    }

    /// Prepare, register and persist a scheduler
    #[instrument(skip(self, scheduler), fields(scheduler = scheduler.name()))]
    pub fn add_scheduler(self: &Arc<Self>, scheduler: Arc<dyn Scheduler>) -> Result<()> {
        let name = scheduler.name().to_string();
        if self.schedulers.read().contains_key(&name) {
            return Err(ScheduleError::SchedulerExists(name));
        }
        scheduler.prepare(self.cluster.as_ref())?;

        let sc = Arc::new(ScheduleController::new(scheduler));
        {
            let mut schedulers = self.schedulers.write();
            if schedulers.contains_key(&name) {
                sc.scheduler.cleanup(self.cluster.as_ref());
                return Err(ScheduleError::SchedulerExists(name));
            }
            schedulers.insert(name.clone(), sc.clone());
        }
        if let Err(e) = self.persist() {
            self.schedulers.write().remove(&name);
            sc.scheduler.cleanup(self.cluster.as_ref());
            return Err(e);
        }

        info!(scheduler_type = sc.scheduler.scheduler_type(), "Scheduler added");
        if self.running.load(Ordering::SeqCst) {
            self.spawn_scheduler(sc);
        }
        Ok(())
    }

    /// Create a scheduler by type and add it; returns its name
    pub fn add_scheduler_by_type(self: &Arc<Self>, scheduler_type: &str, args: &[String]) -> Result<String> {
        let scheduler = self.create_scheduler(scheduler_type, args)?;
        let name = scheduler.name().to_string();
        self.add_scheduler(scheduler)?;
        Ok(name)
    }

    /// Unregister a scheduler, release what it reserved and persist
    #[instrument(skip(self))]
    pub fn remove_scheduler(&self, name: &str) -> Result<()> {
        let sc = self
            .schedulers
            .write()
            .remove(name)
            .ok_or_else(|| ScheduleError::SchedulerNotFound(name.to_string()))?;
        sc.scheduler.cleanup(self.cluster.as_ref());
        self.persist()?;
        info!("Scheduler removed");
        Ok(())
    }

    /// Active scheduler names, sorted
    pub fn scheduler_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.schedulers.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Active schedulers as persisted, sorted by name
    pub fn scheduler_configs(&self) -> Vec<PersistedScheduler> {
        let mut configs: Vec<PersistedScheduler> = self
            .schedulers
            .read()
            .values()
            .map(|sc| PersistedScheduler {
                name: sc.scheduler.name().to_string(),
                scheduler_type: sc.scheduler.scheduler_type().to_string(),
                args: sc.scheduler.args(),
            })
            .collect();
        configs.sort_by(|a, b| a.name.cmp(&b.name));
        configs
    }

    /// Current tick interval of a scheduler
    pub fn scheduler_interval(&self, name: &str) -> Option<Duration> {
        self.schedulers.read().get(name).map(|sc| sc.interval())
    }

    fn persist(&self) -> Result<()> {
        let _guard = self.persist_lock.lock();
        self.store.save_schedulers(&self.scheduler_configs())
    }

    /// Run one tick of the named scheduler
    pub fn tick(&self, name: &str) -> Result<TickOutcome> {
        let sc = self
            .schedulers
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ScheduleError::SchedulerNotFound(name.to_string()))?;
        Ok(self.tick_controller(&sc))
    }

    #[instrument(skip(self, sc), fields(scheduler = sc.scheduler.name()))]
    fn tick_controller(&self, sc: &ScheduleController) -> TickOutcome {
        let scheduler = &sc.scheduler;
        let mode = scheduler.mode();
        let now = Utc::now();
        if mode.is_expired(now) {
            self.retire(scheduler.name());
            return TickOutcome::Retired;
        }
        if !mode.is_active(now) || !scheduler.is_schedule_allowed(self.cluster.as_ref()) {
            return TickOutcome::Skipped;
        }

        let ops = scheduler.schedule(self.cluster.as_ref());
        if ops.is_empty() {
            let mut interval = sc.interval.lock();
            *interval = scheduler.next_interval(*interval);
            drop(interval);
            if mode.is_one_shot() {
                self.retire(scheduler.name());
                return TickOutcome::Retired;
            }
            return TickOutcome::Idle;
        }

        let (accepted, dropped) = self.submit(ops);
        {
            let mut interval = sc.interval.lock();
            *interval = if accepted > 0 {
                scheduler.min_interval()
            } else {
                scheduler.next_interval(*interval)
            };
        }
        if accepted > 0 && mode.is_one_shot() {
            self.retire(scheduler.name());
            return TickOutcome::Retired;
        }
        TickOutcome::Proposed { accepted, dropped }
    }

    /// Pass proposed operators through the throttle into the controller's
    /// waiting queue; returns (accepted, dropped). Admin operators skip the
    /// cooldown check but still leave a record.
    fn submit(&self, ops: Vec<Operator>) -> (usize, usize) {
        let mut accepted = 0;
        let mut dropped = 0;
        for batch in admission_batches(ops) {
            let now = Instant::now();
            let shard_ids: Vec<_> = batch.iter().map(|op| op.shard_id()).collect();
            let admin = batch.iter().all(|op| op.kind().contains(OperatorKind::ADMIN));
            let reservation = if admin {
                self.throttle.reserve(&shard_ids, now)
            } else {
                match self.throttle.try_schedule(&shard_ids, now) {
                    Ok(reservation) => reservation,
                    Err(shard_id) => {
                        debug!(shard_id, "Shard in cooldown");
                        dropped += batch.len();
                        continue;
                    }
                }
            };

            let count = batch.len();
            match self.controller.add_waiting_operator(batch) {
                Ok(_) => accepted += count,
                Err(e) => {
                    self.throttle.release(reservation);
                    warn!(shard_ids = ?shard_ids, error = %e, "Operator dropped");
                    dropped += count;
                }
            }
        }
        (accepted, dropped)
    }

    fn retire(&self, name: &str) {
        match self.remove_scheduler(name) {
            Ok(()) => info!(scheduler = name, "Scheduler retired"),
            Err(e) => warn!(scheduler = name, error = %e, "Failed to retire scheduler"),
        }
    }

    /// Replace one side of the label-affinity preference
    pub fn set_label_affinity(&self, direction: AffinityDirection, labels: Vec<Label>) {
        info!(%direction, labels = ?labels, "Label affinity updated");
        self.affinity.set(direction, labels);
    }

    /// One patrol pass: drive operators, then drop throttle records and
    /// label memos that can no longer matter
    pub fn patrol_once(&self) -> PatrolResult {
        let result = self.controller.patrol();
        let evicted = self.evict_stale_state();
        if evicted > 0 {
            debug!(evicted, "Stale shard state evicted");
        }
        result
    }

    /// Drop expired throttle records and any state for shards that no
    /// longer exist
    pub fn evict_stale_state(&self) -> usize {
        let cluster = &self.cluster;
        let mut evicted = self.throttle.evict_expired(Instant::now());
        evicted += self.throttle.retain_shards(|id| cluster.get_shard(id).is_some());
        evicted += self.affinity.retain_memo(|id| cluster.get_shard(id).is_some());
        evicted
    }

    /// Rebuild persisted schedulers. Initial schedulers are only added
    /// when nothing has been persisted yet.
    pub fn restore(self: &Arc<Self>) -> Result<usize> {
        let persisted = self.store.load_schedulers()?;
        let mut restored = 0;

        if persisted.is_empty() {
            for scheduler_type in self.config.initial_schedulers.clone() {
                match self.add_scheduler_by_type(&scheduler_type, &[]) {
                    Ok(name) => {
                        debug!(scheduler = %name, "Initial scheduler added");
                        restored += 1;
                    }
                    Err(e) => warn!(scheduler_type = %scheduler_type, error = %e, "Initial scheduler not added"),
                }
            }
            return Ok(restored);
        }

        for entry in persisted {
            if self.schedulers.read().contains_key(&entry.name) {
                continue;
            }
            match self.add_scheduler_by_type(&entry.scheduler_type, &entry.args) {
                Ok(_) => restored += 1,
                Err(e) => warn!(scheduler = %entry.name, error = %e, "Persisted scheduler not restored"),
            }
        }
        info!(restored, "Schedulers restored");
        Ok(restored)
    }

    fn spawn_scheduler(self: &Arc<Self>, sc: Arc<ScheduleController>) {
        let coordinator = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let name = sc.scheduler.name().to_string();
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(sc.interval()) => {}
                    _ = shutdown.changed() => break,
                }
                // stop once removed or replaced under the same name
                let current = coordinator.schedulers.read().get(&name).cloned();
                match current {
                    Some(current) if Arc::ptr_eq(&current, &sc) => {}
                    _ => break,
                }
                if coordinator.tick_controller(&sc) == TickOutcome::Retired {
                    break;
                }
            }
            debug!(scheduler = %name, "Scheduler task stopped");
        });
    }

    /// Restore schedulers, start their tasks and patrol until shutdown
    pub async fn run(self: Arc<Self>) -> Result<()> {
        self.restore()?;

        self.running.store(true, Ordering::SeqCst);
        let active: Vec<Arc<ScheduleController>> =
            self.schedulers.read().values().cloned().collect();
        for sc in active {
            self.spawn_scheduler(sc);
        }

        info!(
            schedulers = ?self.scheduler_names(),
            patrol_interval = ?self.config.patrol_interval(),
            dry_run = self.config.dry_run,
            "Coordinator started"
        );

        let mut shutdown = self.shutdown.subscribe();
        let mut patrol = tokio::time::interval(self.config.patrol_interval());
        patrol.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            tokio::select! {
                _ = patrol.tick() => {
                    self.patrol_once();
                }
                _ = shutdown.changed() => break,
            }
        }

        self.running.store(false, Ordering::SeqCst);
        info!("Coordinator stopped");
        Ok(())
    }

    /// Signal every task to stop
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}
