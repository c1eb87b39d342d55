//! Schedule options
//!
//! Cluster-wide knobs read by schedulers and the operator synthesizer.
//! Loaded from `SHARDPLACE_*` environment variables with defaults.

use serde::{Deserialize, Serialize};

use crate::error::{Result, ScheduleError};

/// Options shared by every scheduling decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleOptions {
    /// Desired number of voters per shard
    pub max_replicas: usize,

    /// Label keys describing topology, most significant first
    pub location_labels: Vec<String>,

    /// Concurrency limits per operator kind
    pub leader_schedule_limit: u64,
    pub region_schedule_limit: u64,
    pub merge_schedule_limit: u64,
    pub hot_region_schedule_limit: u64,

    /// Above this used ratio the region score starts tracking free space
    pub high_space_ratio: f64,
    /// Above this used ratio a node is treated as out of space
    pub low_space_ratio: f64,

    /// Shard size multiple used as the balance tolerance
    pub tolerant_size_ratio: f64,

    /// Write flow in bytes/s from which a shard counts as hot
    pub hot_region_write_threshold: u64,

    /// Nodes with more pending replicas are skipped
    pub max_pending_peer_count: u64,

    /// Add replicas as learners first, then promote
    pub enable_learner: bool,

    /// Shards at most this large (MB) may be merged by random-merge
    pub max_merge_region_size: i64,

    /// Only merge a shard into its successor
    pub enable_one_way_merge: bool,
}

impl Default for ScheduleOptions {
    fn default() -> Self {
        Self {
            max_replicas: 3,
            location_labels: Vec::new(),
            leader_schedule_limit: 4,
            region_schedule_limit: 4,
            merge_schedule_limit: 8,
            hot_region_schedule_limit: 2,
            high_space_ratio: 0.6,
            low_space_ratio: 0.8,
            tolerant_size_ratio: 1.0,
            hot_region_write_threshold: 1024 * 1024, // 1 MB/s
            max_pending_peer_count: 16,
            enable_learner: true,
            max_merge_region_size: 20,
            enable_one_way_merge: false,
        }
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|v| v == "true" || v == "1")
        .unwrap_or(default)
}

impl ScheduleOptions {
    /// Create options from environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let location_labels = std::env::var("SHARDPLACE_LOCATION_LABELS")
            .ok()
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or(defaults.location_labels);

        let options = Self {
            max_replicas: env_or("SHARDPLACE_MAX_REPLICAS", defaults.max_replicas),
            location_labels,
            leader_schedule_limit: env_or(
                "SHARDPLACE_LEADER_SCHEDULE_LIMIT",
                defaults.leader_schedule_limit,
            ),
            region_schedule_limit: env_or(
                "SHARDPLACE_REGION_SCHEDULE_LIMIT",
                defaults.region_schedule_limit,
            ),
            merge_schedule_limit: env_or(
                "SHARDPLACE_MERGE_SCHEDULE_LIMIT",
                defaults.merge_schedule_limit,
            ),
            hot_region_schedule_limit: env_or(
                "SHARDPLACE_HOT_REGION_SCHEDULE_LIMIT",
                defaults.hot_region_schedule_limit,
            ),
            high_space_ratio: env_or("SHARDPLACE_HIGH_SPACE_RATIO", defaults.high_space_ratio),
            low_space_ratio: env_or("SHARDPLACE_LOW_SPACE_RATIO", defaults.low_space_ratio),
            tolerant_size_ratio: env_or(
                "SHARDPLACE_TOLERANT_SIZE_RATIO",
                defaults.tolerant_size_ratio,
            ),
            hot_region_write_threshold: env_or(
                "SHARDPLACE_HOT_REGION_WRITE_THRESHOLD",
                defaults.hot_region_write_threshold,
            ),
            max_pending_peer_count: env_or(
                "SHARDPLACE_MAX_PENDING_PEER_COUNT",
                defaults.max_pending_peer_count,
            ),
            enable_learner: env_flag("SHARDPLACE_ENABLE_LEARNER", defaults.enable_learner),
            max_merge_region_size: env_or(
                "SHARDPLACE_MAX_MERGE_REGION_SIZE",
                defaults.max_merge_region_size,
            ),
            enable_one_way_merge: env_flag(
                "SHARDPLACE_ENABLE_ONE_WAY_MERGE",
                defaults.enable_one_way_merge,
            ),
        };

        options.validate()?;
        Ok(options)
    }

    /// Reject option combinations the score functions cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.max_replicas == 0 {
            return Err(ScheduleError::InvalidConfig(
                "max-replicas must be at least 1".to_string(),
            ));
        }
        let in_range = |r: f64| r > 0.0 && r < 1.0;
        if !in_range(self.high_space_ratio) || !in_range(self.low_space_ratio) {
            return Err(ScheduleError::InvalidConfig(format!(
                "space ratios must be in (0, 1), got high={} low={}",
                self.high_space_ratio, self.low_space_ratio
            )));
        }
        if self.low_space_ratio <= self.high_space_ratio {
            return Err(ScheduleError::InvalidConfig(format!(
                "low-space-ratio {} must be greater than high-space-ratio {}",
                self.low_space_ratio, self.high_space_ratio
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let opts = ScheduleOptions::default();
        assert_eq!(opts.max_replicas, 3);
        assert_eq!(opts.leader_schedule_limit, 4);
        assert_eq!(opts.merge_schedule_limit, 8);
        assert_eq!(opts.high_space_ratio, 0.6);
        assert_eq!(opts.low_space_ratio, 0.8);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_validate_space_ratios() {
        let opts = ScheduleOptions {
            high_space_ratio: 0.9,
            low_space_ratio: 0.8,
            ..Default::default()
        };
        assert!(matches!(opts.validate(), Err(ScheduleError::InvalidConfig(_))));
    }

    #[test]
    fn test_deserialize_partial() {
        let opts: ScheduleOptions =
            serde_json::from_str(r#"{"max_replicas": 5, "location_labels": ["zone"]}"#).unwrap();
        assert_eq!(opts.max_replicas, 5);
        assert_eq!(opts.location_labels, vec!["zone".to_string()]);
        assert_eq!(opts.region_schedule_limit, 4);
    }
}
