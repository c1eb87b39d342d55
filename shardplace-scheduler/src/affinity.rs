//! Label-affinity override
//!
//! Administrator-set bias for balance decisions:
//! - a preferred-source label set: nodes carrying one of these labels are
//!   relieved first
//! - a preferred-target label set: nodes carrying one of these labels are
//!   never treated as nodes to relieve
//! - a per-shard memo of the label a shard was last migrated towards, so
//!   that replica rebalancing does not undo the migration
//!
//! One instance is shared by every selector and scheduler of a
//! coordinator. Both sets are replaced wholesale and never expire.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tracing::info;

use shardplace_core::{Label, Node, ScheduleError, ShardId};

/// Which preference set an update replaces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AffinityDirection {
    Source,
    Target,
}

impl FromStr for AffinityDirection {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "source" | "from" => Ok(AffinityDirection::Source),
            "target" | "to" => Ok(AffinityDirection::Target),
            other => Err(ScheduleError::invalid_args(format!(
                "unknown affinity direction: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for AffinityDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AffinityDirection::Source => write!(f, "source"),
            AffinityDirection::Target => write!(f, "target"),
        }
    }
}

#[derive(Debug, Default, Clone)]
struct Preference {
    source: Vec<Label>,
    target: Vec<Label>,
}

/// Shared label preference and per-shard migration memo
#[derive(Debug, Default)]
pub struct LabelAffinity {
    preference: RwLock<Preference>,
    memo: Mutex<HashMap<ShardId, Label>>,
}

impl LabelAffinity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_preferred_source(&self, labels: Vec<Label>) {
        info!(labels = ?labels, "Preferred source labels replaced");
        self.preference.write().source = labels;
    }

    pub fn set_preferred_target(&self, labels: Vec<Label>) {
        info!(labels = ?labels, "Preferred target labels replaced");
        self.preference.write().target = labels;
    }

    pub fn set(&self, direction: AffinityDirection, labels: Vec<Label>) {
        match direction {
            AffinityDirection::Source => self.set_preferred_source(labels),
            AffinityDirection::Target => self.set_preferred_target(labels),
        }
    }

    pub fn preferred_source(&self) -> Vec<Label> {
        self.preference.read().source.clone()
    }

    pub fn preferred_target(&self) -> Vec<Label> {
        self.preference.read().target.clone()
    }

    /// Node carries a preferred-source label and no preferred-target label
    pub fn should_move_from(&self, node: &Node) -> bool {
        let preference = self.preference.read();
        preference.source.iter().any(|l| l.matches(node))
            && !preference.target.iter().any(|l| l.matches(node))
    }

    /// Remember that `shard_id` was deliberately moved towards `label`
    pub fn record(&self, shard_id: ShardId, label: Label) {
        self.memo.lock().insert(shard_id, label);
    }

    pub fn memo_for(&self, shard_id: ShardId) -> Option<Label> {
        self.memo.lock().get(&shard_id).cloned()
    }

    pub fn forget(&self, shard_id: ShardId) -> Option<Label> {
        self.memo.lock().remove(&shard_id)
    }

    /// Drop memo entries whose shard fails `keep`; returns how many went
    pub fn retain_memo(&self, mut keep: impl FnMut(ShardId) -> bool) -> usize {
        let mut memo = self.memo.lock();
        let before = memo.len();
        memo.retain(|id, _| keep(*id));
        before - memo.len()
    }

    pub fn memo_len(&self) -> usize {
        self.memo.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_node(id: u64, zone: &str) -> Node {
        Node::new(id, "").with_label("zone", zone)
    }

    #[test]
    fn test_should_move_from() {
        let affinity = LabelAffinity::new();
        let z1 = make_node(1, "z1");
        assert!(!affinity.should_move_from(&z1));

        affinity.set_preferred_source(vec![Label::new("zone", "z1")]);
        assert!(affinity.should_move_from(&z1));
        assert!(!affinity.should_move_from(&make_node(2, "z2")));

        let both = make_node(3, "z1").with_label("disk", "ssd");
        affinity.set_preferred_target(vec![Label::new("disk", "ssd")]);
        assert!(!affinity.should_move_from(&both));
        assert!(affinity.should_move_from(&z1));
    }

    #[test]
    fn test_set_replaces() {
        let affinity = LabelAffinity::new();
        affinity.set(AffinityDirection::Source, vec![Label::new("zone", "z1")]);
        affinity.set(AffinityDirection::Source, vec![Label::new("zone", "z2")]);
        assert_eq!(affinity.preferred_source(), vec![Label::new("zone", "z2")]);
        assert!(affinity.preferred_target().is_empty());
    }

    #[test]
    fn test_direction_parse() {
        assert_eq!("source".parse::<AffinityDirection>().unwrap(), AffinityDirection::Source);
        assert_eq!("to".parse::<AffinityDirection>().unwrap(), AffinityDirection::Target);
        assert!("sideways".parse::<AffinityDirection>().is_err());
    }

    #[test]
    fn test_memo_lifecycle() {
        let affinity = LabelAffinity::new();
        affinity.record(1, Label::new("rack", "r2"));
        affinity.record(2, Label::new("rack", "r3"));
        assert_eq!(affinity.memo_for(1), Some(Label::new("rack", "r2")));

        let removed = affinity.retain_memo(|id| id != 2);
        assert_eq!(removed, 1);
        assert_eq!(affinity.memo_len(), 1);
        assert!(affinity.forget(1).is_some());
        assert!(affinity.memo_for(1).is_none());
    }
}
