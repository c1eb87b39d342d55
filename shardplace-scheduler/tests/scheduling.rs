//! End-to-end scheduling tests
//!
//! Drives the handler and coordinator against an in-memory cluster that
//! applies every dispatched step, so operators run to completion.
//!
//! Run with: cargo test --test scheduling

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use shardplace_core::{Cluster, Label, MemoryCluster, OpStatus, OperatorKind, ScheduleError};
use shardplace_scheduler::{
    ConfigStore, Coordinator, FileConfigStore, Handler, MemoryConfigStore, ServiceConfig,
    TickOutcome,
};
use tempfile::TempDir;

fn make_rack_cluster() -> Arc<MemoryCluster> {
    let cluster = Arc::new(MemoryCluster::default());
    for id in 1..=4 {
        cluster.add_labeled_node(id, &[("rack", &format!("r{}", id))]);
    }
    cluster
}

fn quiet_config() -> ServiceConfig {
    ServiceConfig {
        initial_schedulers: Vec::new(),
        ..Default::default()
    }
}

fn make_handler(cluster: &Arc<MemoryCluster>, store: Arc<dyn ConfigStore>, config: ServiceConfig) -> Handler {
    let coordinator = Arc::new(Coordinator::new(cluster.clone(), cluster.clone(), store, config));
    Handler::new(coordinator)
}

/// Patrol until no operator is left in flight
fn drain(handler: &Handler) {
    let coordinator = handler.coordinator();
    for _ in 0..16 {
        coordinator.patrol_once();
        if coordinator.controller().operators().is_empty()
            && coordinator.controller().waiting_operators().is_empty()
        {
            return;
        }
    }
    panic!(
        "operators still running: {:?}",
        coordinator.controller().operators()
    );
}

#[test]
fn test_single_replica_moves_to_labeled_rack() {
    let cluster = make_rack_cluster();
    cluster.add_leader_shard(1, b"", b"", 1, &[]).unwrap();
    let handler = make_handler(&cluster, Arc::new(MemoryConfigStore::new()), quiet_config());
    let coordinator = handler.coordinator().clone();

    let name = handler.add_shard_to_label_scheduler(1, "rack", "r2").unwrap();
    let outcome = coordinator.tick(&name).unwrap();
    assert_eq!(outcome, TickOutcome::Proposed { accepted: 1, dropped: 0 });

    let op = handler.get_operator(1).unwrap();
    assert!(op.kind().contains(OperatorKind::REGION));
    drain(&handler);

    let shard = cluster.get_shard(1).unwrap();
    assert_eq!(shard.node_ids(), vec![2]);
    assert_eq!(shard.leader_node(), Some(2));
    assert_eq!(coordinator.affinity().memo_for(1), Some(Label::new("rack", "r2")));

    let finished = coordinator.controller().finished_operators();
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].status(), OpStatus::Success);

    // node 2 already hosts the shard
    assert_eq!(coordinator.tick(&name).unwrap(), TickOutcome::Idle);
    assert!(handler.operators(&[]).unwrap().is_empty());
}

#[test]
fn test_throttle_holds_back_second_migration() {
    let cluster = make_rack_cluster();
    cluster.add_leader_shard(1, b"", b"", 1, &[]).unwrap();
    let handler = make_handler(&cluster, Arc::new(MemoryConfigStore::new()), quiet_config());
    let coordinator = handler.coordinator().clone();

    let first = handler.add_shard_to_label_scheduler(1, "rack", "r2").unwrap();
    coordinator.tick(&first).unwrap();
    drain(&handler);

    // a different target is still inside the cooldown of the first move
    let second = handler.add_shard_to_label_scheduler(1, "rack", "r3").unwrap();
    assert_ne!(first, second);
    assert_eq!(
        coordinator.tick(&second).unwrap(),
        TickOutcome::Proposed { accepted: 0, dropped: 1 }
    );
    assert!(handler.get_operator(1).is_err());
    assert_eq!(cluster.get_shard(1).unwrap().node_ids(), vec![2]);

    // clearing the record lets the move through
    coordinator.throttle().forget(1);
    assert_eq!(
        coordinator.tick(&second).unwrap(),
        TickOutcome::Proposed { accepted: 1, dropped: 0 }
    );
}

#[test]
fn test_label_to_label_empties_source_nodes() {
    let cluster = Arc::new(MemoryCluster::default());
    cluster.add_labeled_node(1, &[("zone", "old")]);
    cluster.add_labeled_node(2, &[("zone", "old")]);
    cluster.add_labeled_node(3, &[("zone", "new")]);
    cluster.add_labeled_node(4, &[("zone", "new")]);
    cluster.add_leader_shard(1, b"", b"g", 1, &[]).unwrap();
    cluster.add_leader_shard(2, b"g", b"", 2, &[]).unwrap();
    let handler = make_handler(&cluster, Arc::new(MemoryConfigStore::new()), quiet_config());
    let coordinator = handler.coordinator().clone();

    let name = handler.add_label_to_label_scheduler("zone", "old", "zone", "new").unwrap();
    assert_eq!(
        coordinator.tick(&name).unwrap(),
        TickOutcome::Proposed { accepted: 2, dropped: 0 }
    );
    drain(&handler);

    for node_id in [1, 2] {
        assert!(cluster.shards_on_node(node_id).is_empty());
    }
    for shard_id in [1, 2] {
        let node = cluster.get_shard(shard_id).unwrap().node_ids()[0];
        assert!(node == 3 || node == 4);
    }
    assert_eq!(coordinator.tick(&name).unwrap(), TickOutcome::Idle);

    // no shard is left under the old label
    assert!(matches!(
        handler.add_label_to_label_scheduler("zone", "old", "zone", "new"),
        Err(ScheduleError::NoShardsForLabel { .. }) | Err(ScheduleError::SchedulerExists(_))
    ));
}

#[test]
fn test_merge_requires_adjacent_shards() {
    let cluster = make_rack_cluster();
    cluster.add_leader_shard(1, b"", b"g", 1, &[2, 3]).unwrap();
    cluster.add_leader_shard(2, b"g", b"m", 1, &[2, 3]).unwrap();
    cluster.add_leader_shard(3, b"p", b"", 1, &[2, 3]).unwrap();
    let handler = make_handler(&cluster, Arc::new(MemoryConfigStore::new()), quiet_config());

    // keys m..p belong to no shard
    assert!(matches!(
        handler.add_merge_region_operator(2, 3),
        Err(ScheduleError::NotAdjacent)
    ));
    assert!(matches!(
        handler.add_merge_region_operator(1, 3),
        Err(ScheduleError::NotAdjacent)
    ));
    assert!(handler.operators(&[]).unwrap().is_empty());

    handler.add_merge_region_operator(1, 2).unwrap();
    assert!(handler.get_operator(1).is_ok());
    assert!(handler.get_operator(2).is_ok());
    drain(&handler);

    assert!(cluster.get_shard(1).is_none());
    let merged = cluster.get_shard(2).unwrap();
    assert_eq!(merged.start_key, b"".to_vec());
    assert_eq!(merged.end_key, b"m".to_vec());
    assert_eq!(handler.shard_by_key(b"a").unwrap(), 2);
}

#[test]
fn test_admin_transfer_runs_to_completion() {
    let cluster = make_rack_cluster();
    cluster.add_leader_shard(1, b"", b"", 1, &[2, 3]).unwrap();
    let handler = make_handler(&cluster, Arc::new(MemoryConfigStore::new()), quiet_config());
    let since = Utc::now() - chrono::Duration::seconds(1);

    assert_eq!(handler.transfer_leader(1, 3, None).unwrap(), None);
    drain(&handler);
    assert_eq!(cluster.get_shard(1).unwrap().leader_node(), Some(3));

    handler.add_transfer_peer_operator(1, 2, 4).unwrap();
    drain(&handler);
    let mut nodes = cluster.get_shard(1).unwrap().node_ids();
    nodes.sort_unstable();
    assert_eq!(nodes, vec![1, 3, 4]);

    let history = handler.history(since);
    assert!(history.iter().any(|h| h.from_node == 1 && h.to_node == 3));
    assert!(history.iter().any(|h| h.from_node == 2 && h.to_node == 4));
}

#[test]
fn test_delayed_transfer_survives_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("schedulers.json");

    let cluster = make_rack_cluster();
    cluster.add_leader_shard(1, b"", b"", 1, &[2, 3]).unwrap();
    let handler = make_handler(&cluster, Arc::new(FileConfigStore::new(&path)), quiet_config());

    let name = handler.transfer_leader(1, 2, Some((30, "min"))).unwrap().unwrap();
    assert_eq!(handler.coordinator().tick(&name).unwrap(), TickOutcome::Skipped);
    assert!(handler.get_operator(1).is_err());
    let evict = handler.add_evict_leader_scheduler(3).unwrap();
    assert!(cluster.get_node(3).unwrap().blocked);
    drop(handler);

    // a fresh process sees the same schedulers
    let cluster = make_rack_cluster();
    cluster.add_leader_shard(1, b"", b"", 1, &[2, 3]).unwrap();
    let handler = make_handler(&cluster, Arc::new(FileConfigStore::new(&path)), ServiceConfig::default());
    let restored = handler.coordinator().restore().unwrap();
    assert_eq!(restored, 2);

    let mut names = handler.coordinator().scheduler_names();
    names.sort();
    let mut expected = vec![name.clone(), evict];
    expected.sort();
    assert_eq!(names, expected);
    assert!(cluster.get_node(3).unwrap().blocked);
    assert_eq!(handler.coordinator().tick(&name).unwrap(), TickOutcome::Skipped);
}

#[test]
fn test_initial_schedulers_on_empty_store() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(FileConfigStore::new(dir.path().join("schedulers.json")));
    let cluster = make_rack_cluster();
    let handler = make_handler(&cluster, store.clone(), ServiceConfig::default());

    assert_eq!(handler.coordinator().restore().unwrap(), 3);
    let persisted = store.load_schedulers().unwrap();
    assert_eq!(persisted.len(), 3);
    assert!(persisted.iter().any(|s| s.scheduler_type == "balance-leader"));
}

#[test]
fn test_unknown_scheduler_and_bad_args() {
    let cluster = make_rack_cluster();
    let handler = make_handler(&cluster, Arc::new(MemoryConfigStore::new()), quiet_config());

    assert!(handler.add_scheduler("no-such-scheduler", &[]).is_err());
    assert!(handler.add_scheduler("evict-leader", &["x".to_string()]).is_err());
    assert!(matches!(
        handler.add_evict_leader_scheduler(9),
        Err(ScheduleError::NodeNotFound(9))
    ));
    assert!(matches!(
        handler.remove_scheduler("evict-leader-scheduler-1"),
        Err(ScheduleError::SchedulerNotFound(_))
    ));
    assert!(handler.schedulers().is_empty());
}

#[tokio::test]
async fn test_run_migrates_and_stops() {
    let cluster = make_rack_cluster();
    cluster.add_leader_shard(1, b"", b"", 1, &[]).unwrap();
    let config = ServiceConfig {
        patrol_interval_ms: 5,
        ..quiet_config()
    };
    let handler = make_handler(&cluster, Arc::new(MemoryConfigStore::new()), config);
    let coordinator = handler.coordinator().clone();

    handler.add_shard_to_label_scheduler(1, "rack", "r4").unwrap();
    let task = tokio::spawn(coordinator.clone().run());

    let moved = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if cluster.get_shard(1).map(|s| s.node_ids()) == Some(vec![4]) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(moved.is_ok(), "shard never reached rack r4");

    coordinator.shutdown();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}
