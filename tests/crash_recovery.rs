use std::time::Duration;

use chrono::Utc;
use termbbs::storage::{EngineOptions, LockRecord, StorageEngine, Store};
use uuid::Uuid;
mod common;

#[tokio::test]
async fn locks_from_a_crashed_run_are_released_at_open() {
    let tmp = tempfile::tempdir().unwrap();
    {
        let store = Store::open(tmp.path()).unwrap();
        store.set("users", "alice", b"record").unwrap();
        store
            .put_lock(
                "users",
                "alice",
                &LockRecord {
                    epoch: Uuid::new_v4(),
                    handle: 7,
                    acquired_at: Utc::now(),
                },
            )
            .unwrap();
        store.flush().unwrap();
    }

    let engine = StorageEngine::open(tmp.path(), EngineOptions::default()).unwrap();
    assert_eq!(engine.reconciled_locks(), 1);
    assert!(engine.store().load_locks().unwrap().is_empty());

    let proxy = engine.start();
    let h = proxy.connect().unwrap();
    h.acquire_lock("users", "alice", Duration::ZERO).await.unwrap();
    h.set("users", "alice", b"updated".to_vec()).await.unwrap();
    assert_eq!(
        h.get("users", "alice").await.unwrap(),
        Some(b"updated".to_vec())
    );
}

#[tokio::test]
async fn clean_shutdown_leaves_no_locks_behind() {
    let tmp = tempfile::tempdir().unwrap();
    {
        let proxy = StorageEngine::open(tmp.path(), common::fast_options())
            .unwrap()
            .start();
        let h = proxy.connect().unwrap();
        h.acquire_lock("boards", "general", Duration::ZERO)
            .await
            .unwrap();
        h.set("boards", "general", b"kept".to_vec()).await.unwrap();
        proxy.shutdown().await.unwrap();
    }
    // The engine task has dropped the store once shutdown is acknowledged and the
    // loop returns; give it a moment to let go of the directory.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let engine = StorageEngine::open(tmp.path(), EngineOptions::default()).unwrap();
    assert_eq!(engine.reconciled_locks(), 0);
    assert_eq!(
        engine.store().get("boards", "general").unwrap(),
        Some(b"kept".to_vec())
    );
}

#[tokio::test]
async fn data_dir_has_a_single_owner() {
    let (tmp, _proxy) = common::engine();
    assert!(StorageEngine::open(tmp.path(), EngineOptions::default()).is_err());
}
