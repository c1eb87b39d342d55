//! Shardplace Core Library
//!
//! Shared vocabulary for the shardplace placement scheduler.
//! This crate provides:
//! - Topology model (nodes, shards, replicas, labels) and score functions
//! - Change operations (operators and their steps)
//! - Collaborator traits for cluster state and step delivery
//! - Schedule options and the unified error type
//! - An in-memory cluster for tests and local runs

pub mod cluster;
pub mod config;
pub mod error;
pub mod memory;
pub mod model;
pub mod operator;

pub use cluster::{Cluster, NoopSink, StepSink};
pub use config::ScheduleOptions;
pub use error::{ErrorKind, Result, ScheduleError};
pub use memory::{MemoryCluster, Topology};
pub use model::{
    Label, Node, NodeId, NodeState, Replica, ReplicaId, ReplicaRole, ResourceKind, Shard, ShardId,
};
pub use operator::{OpStatus, OpStep, Operator, OperatorHistory, OperatorKind, SplitPolicy};
