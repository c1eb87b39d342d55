//! Error types for shardplace
//!
//! Provides a unified error type for scheduling, operator synthesis and
//! administrative operations. Selectors never return errors: an empty
//! candidate set is reported as `None`.

use thiserror::Error;

/// Result type alias for shardplace operations
pub type Result<T> = std::result::Result<T, ScheduleError>;

/// Coarse classification used by the request layer to pick a status code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    PreconditionFailed,
    AdmissionRejected,
    ConfigurationInvalid,
    Internal,
}

/// Unified error type for shardplace
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScheduleError {
    // ===== Not Found =====
    #[error("shard {0} not found")]
    ShardNotFound(u64),

    #[error("node {0} not found")]
    NodeNotFound(u64),

    #[error("scheduler not found: {0}")]
    SchedulerNotFound(String),

    #[error("operator not found")]
    OperatorNotFound,

    #[error("label not found: {key}={value}")]
    LabelNotFound { key: String, value: String },

    #[error("no shard contains key {0:?}")]
    KeyNotFound(Vec<u8>),

    // ===== Precondition Failed =====
    #[error("the number of nodes is {count}, beyond the max replicas {max}")]
    ReplicaLimitExceeded { count: usize, max: usize },

    #[error("two shards are not adjacent")]
    NotAdjacent,

    #[error("shard {0} has abnormal peer")]
    AbnormalPeer(u64),

    #[error("node {0} is tombstoned")]
    NodeTombstoned(u64),

    #[error("shard {shard_id} already has replica on node {node_id}")]
    DuplicateReplica { shard_id: u64, node_id: u64 },

    #[error("shard {shard_id} has no replica on node {node_id}")]
    NoReplicaOnNode { shard_id: u64, node_id: u64 },

    #[error("shard {shard_id} has no voter on node {node_id}")]
    NoVoterOnNode { shard_id: u64, node_id: u64 },

    #[error("shard {0} has no leader")]
    NoLeader(u64),

    #[error("shard {shard_id} leader is already on node {node_id}")]
    AlreadyLeader { shard_id: u64, node_id: u64 },

    #[error("cannot remove the last voter of shard {0}")]
    LastVoter(u64),

    #[error("learner replicas are disabled")]
    LearnerDisabled,

    #[error("source label {key}={value} has no shard")]
    NoShardsForLabel { key: String, value: String },

    // ===== Admission =====
    #[error("failed to add operator, maybe already have one: {0}")]
    AdmissionRejected(String),

    #[error("scheduler already exists: {0}")]
    SchedulerExists(String),

    // ===== Configuration =====
    #[error("invalid scheduler arguments: {0}")]
    InvalidArgs(String),

    #[error("unknown scheduler type: {0}")]
    UnknownScheduler(String),

    #[error("invalid schedule option: {0}")]
    InvalidConfig(String),

    // ===== Collaborator =====
    #[error("replica id allocation failed: {0}")]
    Allocation(String),

    #[error("config store error: {0}")]
    Persist(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ScheduleError {
    /// Map this error to its taxonomy bucket
    pub fn kind(&self) -> ErrorKind {
        match self {
            ScheduleError::ShardNotFound(_)
            | ScheduleError::NodeNotFound(_)
            | ScheduleError::SchedulerNotFound(_)
            | ScheduleError::OperatorNotFound
            | ScheduleError::LabelNotFound { .. }
            | ScheduleError::KeyNotFound(_) => ErrorKind::NotFound,

            ScheduleError::ReplicaLimitExceeded { .. }
            | ScheduleError::NotAdjacent
            | ScheduleError::AbnormalPeer(_)
            | ScheduleError::NodeTombstoned(_)
            | ScheduleError::DuplicateReplica { .. }
            | ScheduleError::NoReplicaOnNode { .. }
            | ScheduleError::NoVoterOnNode { .. }
            | ScheduleError::NoLeader(_)
            | ScheduleError::AlreadyLeader { .. }
            | ScheduleError::LastVoter(_)
            | ScheduleError::LearnerDisabled
            | ScheduleError::NoShardsForLabel { .. } => ErrorKind::PreconditionFailed,

            ScheduleError::AdmissionRejected(_) | ScheduleError::SchedulerExists(_) => {
                ErrorKind::AdmissionRejected
            }

            ScheduleError::InvalidArgs(_)
            | ScheduleError::UnknownScheduler(_)
            | ScheduleError::InvalidConfig(_) => ErrorKind::ConfigurationInvalid,

            ScheduleError::Allocation(_)
            | ScheduleError::Persist(_)
            | ScheduleError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Shorthand for argument parsing failures
    pub fn invalid_args(msg: impl Into<String>) -> Self {
        ScheduleError::InvalidArgs(msg.into())
    }
}

impl From<serde_json::Error> for ScheduleError {
    fn from(err: serde_json::Error) -> Self {
        ScheduleError::Persist(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ScheduleError::ReplicaLimitExceeded { count: 4, max: 3 };
        assert_eq!(
            err.to_string(),
            "the number of nodes is 4, beyond the max replicas 3"
        );
        assert_eq!(ScheduleError::ShardNotFound(7).to_string(), "shard 7 not found");
    }

    #[test]
    fn test_error_kind() {
        assert_eq!(ScheduleError::NodeNotFound(1).kind(), ErrorKind::NotFound);
        assert_eq!(ScheduleError::KeyNotFound(b"k".to_vec()).kind(), ErrorKind::NotFound);
        assert_eq!(ScheduleError::NotAdjacent.kind(), ErrorKind::PreconditionFailed);
        assert_eq!(
            ScheduleError::AdmissionRejected("dup".into()).kind(),
            ErrorKind::AdmissionRejected
        );
        assert_eq!(
            ScheduleError::invalid_args("bad").kind(),
            ErrorKind::ConfigurationInvalid
        );
    }

    #[test]
    fn test_error_from_json() {
        let json_err = serde_json::from_str::<u64>("not json").unwrap_err();
        let err: ScheduleError = json_err.into();
        assert!(matches!(err, ScheduleError::Persist(_)));
    }
}
