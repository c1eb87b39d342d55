//! Scheduler building blocks: interval backoff, run modes and the shared
//! admission check

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use shardplace_core::OperatorKind;

use crate::controller::OperatorController;

pub const MAX_SCHEDULE_INTERVAL: Duration = Duration::from_secs(5);
pub const MIN_SCHEDULE_INTERVAL: Duration = Duration::from_millis(10);
pub const MIN_SLOW_SCHEDULE_INTERVAL: Duration = Duration::from_secs(3);

pub const SCHEDULE_INTERVAL_FACTOR: f64 = 1.3;

/// How the interval grows after a tick that proposed nothing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalGrowth {
    Exponential,
    Linear,
    Zero,
}

/// Next interval after a quiet tick, capped at `max`
pub fn interval_grow(prev: Duration, max: Duration, growth: IntervalGrowth) -> Duration {
    match growth {
        IntervalGrowth::Exponential => prev.mul_f64(SCHEDULE_INTERVAL_FACTOR).min(max),
        IntervalGrowth::Linear => (prev + MIN_SLOW_SCHEDULE_INTERVAL).min(max),
        IntervalGrowth::Zero => prev,
    }
}

/// When a scheduler is allowed to run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleMode {
    /// Every tick until removed
    Periodic,
    /// Once, at or after `run_at`; retired after its operator is accepted
    /// or once it has nothing left to propose
    OneShotAt { run_at: DateTime<Utc> },
    /// Started by an administrator; runs from `start` until removed or
    /// until `end` passes
    UserTriggered {
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
    },
}

impl ScheduleMode {
    pub fn user_triggered() -> Self {
        ScheduleMode::UserTriggered {
            start: Utc::now(),
            end: None,
        }
    }

    /// Whether a tick at `now` may schedule
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        match self {
            ScheduleMode::Periodic => true,
            ScheduleMode::OneShotAt { run_at } => now >= *run_at,
            ScheduleMode::UserTriggered { start, end } => {
                now >= *start && end.map_or(true, |end| now <= end)
            }
        }
    }

    /// Whether the scheduler should be removed at `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self {
            ScheduleMode::UserTriggered { end: Some(end), .. } => now > *end,
            _ => false,
        }
    }

    pub fn is_one_shot(&self) -> bool {
        matches!(self, ScheduleMode::OneShotAt { .. })
    }

    pub fn is_user(&self) -> bool {
        !matches!(self, ScheduleMode::Periodic)
    }
}

/// State shared by every scheduler: the controller it consults for
/// admission
#[derive(Clone)]
pub struct BaseScheduler {
    pub controller: Arc<OperatorController>,
}

impl BaseScheduler {
    pub fn new(controller: Arc<OperatorController>) -> Self {
        Self { controller }
    }

    /// In-flight operators of `kind` are below `limit`
    pub fn allow(&self, kind: OperatorKind, limit: u64) -> bool {
        self.controller.operator_count(kind) < limit
    }
}
