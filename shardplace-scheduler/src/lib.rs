//! Shardplace Scheduler Library
//!
//! Placement scheduling for shardplace clusters.
//!
//! The scheduler watches the cluster and keeps replicas and leaders where
//! they should be:
//! - Candidate selection with filters and label-affinity bias
//! - Change-operation synthesis (move, merge, split, scatter, ...)
//! - Pluggable schedulers driven by a coordinator with backoff
//! - Per-shard throttling and an operator controller with node limits
//! - Administrative entry points and persisted scheduler configuration

pub mod affinity;
pub mod builder;
pub mod config;
pub mod controller;
pub mod coordinator;
pub mod filter;
pub mod handler;
pub mod persist;
pub mod scatter;
pub mod schedulers;
pub mod selector;
pub mod throttle;

// Re-export main types
pub use affinity::{AffinityDirection, LabelAffinity};
pub use config::{ConfigError, ServiceConfig};
pub use controller::{ControllerConfig, OperatorController, PatrolResult};
pub use coordinator::{Coordinator, TickOutcome};
pub use filter::{Filter, Filters};
pub use handler::{DelayUnit, Handler};
pub use persist::{ConfigStore, FileConfigStore, MemoryConfigStore, PersistedScheduler};
pub use scatter::Scatterer;
pub use schedulers::{ScheduleMode, Scheduler, SchedulerContext, SchedulerRegistry};
pub use selector::{BalanceSelector, RandomSelector, ReplicaSelector};
pub use throttle::{OperationThrottle, Reservation};
