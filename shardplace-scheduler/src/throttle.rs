//! Operation throttle
//!
//! Per-shard cooldown: once an operator for a shard is accepted, no new
//! operator for that shard is accepted until the cooldown has elapsed,
//! whichever scheduler proposes it. This sits in front of the operator
//! controller's own one-operator-per-shard admission.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use shardplace_core::ShardId;

/// Default cooldown between two accepted operators on one shard
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(5 * 60);

/// Records written by one admission attempt, with what they replaced
#[derive(Debug)]
#[must_use]
pub struct Reservation {
    at: Instant,
    previous: Vec<(ShardId, Option<Instant>)>,
}

/// Last-scheduled timestamps keyed by shard
#[derive(Debug)]
pub struct OperationThrottle {
    cooldown: Duration,
    records: Mutex<HashMap<ShardId, Instant>>,
}

impl Default for OperationThrottle {
    fn default() -> Self {
        Self::new(DEFAULT_COOLDOWN)
    }
}

impl OperationThrottle {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// True if the shard has no record or its cooldown has elapsed
    pub fn should_schedule(&self, shard_id: ShardId, now: Instant) -> bool {
        match self.records.lock().get(&shard_id) {
            None => true,
            Some(last) => now.saturating_duration_since(*last) > self.cooldown,
        }
    }

    /// Overwrite the shard's record with `now`
    pub fn record_scheduled(&self, shard_id: ShardId, now: Instant) {
        self.records.lock().insert(shard_id, now);
    }

    /// Check every shard and, only if all are free, record them under one
    /// lock. On refusal returns the first shard still in cooldown.
    pub fn try_schedule(&self, shard_ids: &[ShardId], now: Instant) -> Result<Reservation, ShardId> {
        let mut records = self.records.lock();
        for id in shard_ids {
            if let Some(last) = records.get(id) {
                if now.saturating_duration_since(*last) <= self.cooldown {
                    return Err(*id);
                }
            }
        }
        Ok(Self::reserve_locked(&mut records, shard_ids, now))
    }

    /// Record every shard without checking the cooldown
    pub fn reserve(&self, shard_ids: &[ShardId], now: Instant) -> Reservation {
        Self::reserve_locked(&mut self.records.lock(), shard_ids, now)
    }

    /// Undo a reservation whose operators were not admitted. Records
    /// overwritten since the reservation are left alone.
    pub fn release(&self, reservation: Reservation) {
        let mut records = self.records.lock();
        for (id, previous) in reservation.previous {
            if records.get(&id) != Some(&reservation.at) {
                continue;
            }
            match previous {
                Some(last) => records.insert(id, last),
                None => records.remove(&id),
            };
        }
    }

    fn reserve_locked(
        records: &mut HashMap<ShardId, Instant>,
        shard_ids: &[ShardId],
        now: Instant,
    ) -> Reservation {
        let previous = shard_ids
            .iter()
            .map(|id| (*id, records.insert(*id, now)))
            .collect();
        Reservation { at: now, previous }
    }

    pub fn forget(&self, shard_id: ShardId) {
        self.records.lock().remove(&shard_id);
    }

    /// Drop records whose cooldown has elapsed; they no longer block anything
    pub fn evict_expired(&self, now: Instant) -> usize {
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|_, last| now.saturating_duration_since(*last) <= self.cooldown);
        before - records.len()
    }

    /// Drop records for shards that fail `keep`
    pub fn retain_shards(&self, mut keep: impl FnMut(ShardId) -> bool) -> usize {
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|id, _| keep(*id));
        before - records.len()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
