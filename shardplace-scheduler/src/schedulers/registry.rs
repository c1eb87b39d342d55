//! Scheduler registry
//!
//! Maps a scheduler type name to the factory that builds it from string
//! arguments. Each scheduler module registers its own types.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use shardplace_core::{Cluster, Result, ScheduleError};

use crate::affinity::LabelAffinity;
use crate::controller::OperatorController;

use super::Scheduler;

/// Shared services handed to every factory
#[derive(Clone)]
pub struct SchedulerContext {
    pub cluster: Arc<dyn Cluster>,
    pub controller: Arc<OperatorController>,
    pub affinity: Arc<LabelAffinity>,
}

/// Builds a scheduler from its persisted arguments
pub type SchedulerFactory = fn(&SchedulerContext, &[String]) -> Result<Arc<dyn Scheduler>>;

#[derive(Default)]
pub struct SchedulerRegistry {
    factories: HashMap<&'static str, SchedulerFactory>,
}

impl SchedulerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry populated with every built-in scheduler type
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        super::register_all(&mut registry);
        registry
    }

    pub fn register(&mut self, scheduler_type: &'static str, factory: SchedulerFactory) {
        self.factories.insert(scheduler_type, factory);
    }

    pub fn create(
        &self,
        scheduler_type: &str,
        ctx: &SchedulerContext,
        args: &[String],
    ) -> Result<Arc<dyn Scheduler>> {
        let factory = self
            .factories
            .get(scheduler_type)
            .ok_or_else(|| ScheduleError::UnknownScheduler(scheduler_type.to_string()))?;
        factory(ctx, args)
    }

    /// Registered type names, sorted
    pub fn types(&self) -> Vec<&'static str> {
        let mut types: Vec<&'static str> = self.factories.keys().copied().collect();
        types.sort_unstable();
        types
    }
}

/// Require exactly `expected` arguments
pub(crate) fn expect_args(scheduler_type: &str, args: &[String], expected: usize) -> Result<()> {
    if args.len() != expected {
        return Err(ScheduleError::invalid_args(format!(
            "{} needs {} argument(s), got {}",
            scheduler_type,
            expected,
            args.len()
        )));
    }
    Ok(())
}

/// Parse argument `index` as `T`
pub(crate) fn parse_arg<T: FromStr>(args: &[String], index: usize, what: &str) -> Result<T> {
    let raw = args
        .get(index)
        .ok_or_else(|| ScheduleError::invalid_args(format!("missing {}", what)))?;
    raw.parse()
        .map_err(|_| ScheduleError::invalid_args(format!("invalid {}: {}", what, raw)))
}
