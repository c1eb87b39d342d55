//! Shard scattering
//!
//! Spreads freshly split shards over the cluster: each replica is replaced
//! by a random node that was not picked recently, so consecutive shards
//! land on different node sets. The set of recently picked nodes resets
//! once every eligible node has been used. Shards migrated onto a label
//! only scatter among nodes carrying it.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

use shardplace_core::{Cluster, NodeId, Operator, OperatorKind, Result, ScheduleError, Shard};

use crate::affinity::LabelAffinity;
use crate::builder::create_move_region_operator;
use crate::filter::{
    filter_target, DistinctScoreFilter, ExcludedFilter, Filter, Filters, LabelMemoFilter, StateFilter,
};
use crate::selector::RandomSelector;

pub struct Scatterer {
    cluster: Arc<dyn Cluster>,
    affinity: Arc<LabelAffinity>,
    selected: Mutex<HashSet<NodeId>>,
}

impl Scatterer {
    pub fn new(cluster: Arc<dyn Cluster>, affinity: Arc<LabelAffinity>) -> Self {
        Self {
            cluster,
            affinity,
            selected: Mutex::new(HashSet::new()),
        }
    }

    /// Build an operator scattering `shard`, or `None` when its current
    /// placement is already as spread as the picks allow
    pub fn scatter(&self, shard: &Shard, kind: OperatorKind) -> Result<Option<Operator>> {
        let opts = self.cluster.options();
        if shard.replicas.len() != opts.max_replicas {
            return Err(ScheduleError::AbnormalPeer(shard.id));
        }
        if shard.leader().is_none() {
            return Err(ScheduleError::NoLeader(shard.id));
        }

        let nodes = self.cluster.nodes();
        let state: Box<dyn Filter> = Box::new(StateFilter {
            transfer_leader: false,
            move_region: true,
        });
        let available: Vec<NodeId> = nodes
            .iter()
            .filter(|n| !filter_target(&opts, n, [&state]))
            .map(|n| n.id)
            .collect();
        let shard_nodes: Vec<_> = nodes
            .iter()
            .filter(|n| shard.replica_on(n.id).is_some())
            .cloned()
            .collect();

        let mut selected = self.selected.lock();
        let mut targets: Vec<NodeId> = Vec::with_capacity(shard.replicas.len());

        for replica in &shard.replicas {
            if available.iter().all(|id| selected.contains(id)) {
                selected.clear();
            }
            if selected.insert(replica.node_id) {
                targets.push(replica.node_id);
                continue;
            }

            let source = nodes.iter().find(|n| n.id == replica.node_id);
            let mut filters: Filters = vec![
                Box::new(StateFilter {
                    transfer_leader: false,
                    move_region: true,
                }),
                Box::new(ExcludedFilter::new(
                    [],
                    shard
                        .node_ids()
                        .into_iter()
                        .chain(targets.iter().copied())
                        .chain(selected.iter().copied()),
                )),
                Box::new(LabelMemoFilter::new(&self.affinity, shard.id)),
            ];
            if let Some(source) = source {
                filters.push(Box::new(DistinctScoreFilter::new(
                    opts.location_labels.clone(),
                    shard_nodes.clone(),
                    source,
                )));
            }

            match RandomSelector::new(filters).select_target(&opts, &nodes, &[]) {
                Some(node) => {
                    selected.insert(node.id);
                    targets.push(node.id);
                }
                None => targets.push(replica.node_id),
            }
        }
        drop(selected);

        if targets == shard.node_ids() {
            debug!(shard_id = shard.id, "Shard placement unchanged by scatter");
            return Ok(None);
        }
        create_move_region_operator("scatter-region", self.cluster.as_ref(), shard, kind, &targets)
            .map(Some)
    }
}
