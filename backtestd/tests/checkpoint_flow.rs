//! File-backed checkpoint store behavior, including survival across
//! process restarts (new store instance over the same directory).

use std::sync::Arc;

use backtestd::checkpoint::store::{CheckpointStore, JsonFileStore, StoreError};
use backtestd::checkpoint::{
    BrokerState, CheckpointConfig, CheckpointData, CheckpointManager, PositionState,
};

fn snapshot(task_id: &str, bar_index: u64) -> CheckpointData {
    CheckpointData::new(task_id, bar_index)
        .with_broker(BrokerState {
            cash: 90_000.0,
            value: 101_500.0,
            commission_paid: 12.5,
        })
        .with_positions(vec![PositionState {
            symbol: "EURUSD".to_string(),
            size: 1_000.0,
            price: 1.0842,
        }])
}

#[test]
fn checkpoints_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = CheckpointConfig {
        interval: 10,
        warmup_period: 50,
        cleanup_on_complete: false,
        ..CheckpointConfig::default()
    };

    {
        let store = Arc::new(JsonFileStore::new(dir.path()).unwrap());
        let manager = CheckpointManager::new(config.clone(), store);
        assert!(manager.save("task-restart", 120, snapshot("task-restart", 120), Some("v2")));
    }

    // Fresh store over the same directory, as after a crash.
    let store = Arc::new(JsonFileStore::new(dir.path()).unwrap());
    let manager = CheckpointManager::new(config, store);
    assert!(manager.has_checkpoint("task-restart").unwrap());
    assert_eq!(manager.get_resume_bar("task-restart").unwrap(), 70);

    let checkpoint = manager.load("task-restart").unwrap().unwrap();
    assert_eq!(checkpoint.bar_index, 120);
    assert_eq!(checkpoint.strategy_version.as_deref(), Some("v2"));
    let broker = checkpoint.broker.unwrap();
    assert_eq!(broker.cash, 90_000.0);
    assert_eq!(checkpoint.positions.len(), 1);
    assert_eq!(checkpoint.positions[0].symbol, "EURUSD");
}

#[test]
fn retention_trims_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(JsonFileStore::new(dir.path()).unwrap());
    let manager = CheckpointManager::new(
        CheckpointConfig {
            interval: 10,
            max_count: 5,
            cleanup_on_complete: true,
            ..CheckpointConfig::default()
        },
        store.clone(),
    );

    for bar in [10, 20, 30, 40, 50, 60] {
        assert!(manager.save("task-trim", bar, snapshot("task-trim", bar), None));
    }

    assert_eq!(store.count("task-trim").unwrap(), 5);
    let bars: Vec<u64> = manager
        .load_all("task-trim")
        .unwrap()
        .iter()
        .map(|c| c.bar_index)
        .collect();
    assert_eq!(bars, vec![60, 50, 40, 30, 20]);

    assert_eq!(manager.cleanup("task-trim").unwrap(), 5);
    assert!(!manager.has_checkpoint("task-trim").unwrap());
    assert_eq!(manager.get_resume_bar("task-trim").unwrap(), 0);
}

#[test]
fn tasks_are_isolated_from_each_other() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(JsonFileStore::new(dir.path()).unwrap());
    store.append("task-a", &snapshot("task-a", 10)).unwrap();
    store.append("task-a", &snapshot("task-a", 20)).unwrap();
    store.append("task-b", &snapshot("task-b", 99)).unwrap();

    assert_eq!(store.delete("task-a").unwrap(), 2);
    assert_eq!(store.count("task-a").unwrap(), 0);
    assert_eq!(store.load_latest("task-b").unwrap().unwrap().bar_index, 99);
    // Deleting an unknown task is a no-op, not an error.
    assert_eq!(store.delete("task-unknown").unwrap(), 0);
}

#[test]
fn path_like_task_ids_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonFileStore::new(dir.path()).unwrap();
    let err = store
        .append("../escape", &snapshot("../escape", 1))
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidTaskId(_)));
    assert!(matches!(
        store.count("a/b").unwrap_err(),
        StoreError::InvalidTaskId(_)
    ));
}

#[test]
fn store_outage_is_not_absence() {
    let manager = CheckpointManager::new(
        CheckpointConfig::default(),
        Arc::new(devkit::FailingCheckpointStore),
    );
    // An unreachable store is an error, not "nothing to resume".
    assert!(manager.load("task-out").is_err());
    assert!(manager.get_resume_bar("task-out").is_err());
    assert!(manager.has_checkpoint("task-out").is_err());
    // A failed save surfaces as `false`, never a panic.
    assert!(!manager.save("task-out", 50, snapshot("task-out", 50), None));
}

#[test]
fn corrupt_task_file_is_a_store_fault() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonFileStore::new(dir.path()).unwrap();
    store.append("task-bad", &snapshot("task-bad", 10)).unwrap();

    std::fs::write(dir.path().join("task-bad.json"), "{not json").unwrap();
    // A damaged file is an error, never silently "no checkpoint".
    assert!(matches!(
        store.load_latest("task-bad").unwrap_err(),
        StoreError::Corrupt(_)
    ));
}
