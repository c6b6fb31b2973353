use std::sync::Arc;

use anyhow::Result;
use tempfile::TempDir;

use super::{is_store_in_use, state_machine, MigrationStateStore, ReadOnlyStateStore};
use crate::data_model::{MigrationLock, MigrationStatus};

pub struct TestStateStore {
    pub state: Arc<MigrationStateStore>,
    // keeping a reference to the temp dir to ensure it is not deleted
    pub temp_dir: TempDir,
}

impl TestStateStore {
    pub async fn new() -> Result<TestStateStore> {
        let temp_dir = tempfile::tempdir()?;
        let state = MigrationStateStore::new(temp_dir.path().join("state"), "test-instance").await?;
        Ok(TestStateStore { state, temp_dir })
    }
}

#[tokio::test]
async fn test_create_if_absent_is_idempotent() -> Result<()> {
    let store = TestStateStore::new().await?;
    assert!(store.state.create_if_absent("events_sample_by")?);
    assert!(!store.state.create_if_absent("events_sample_by")?);

    let record = store.state.get("events_sample_by")?.unwrap();
    assert_eq!(record.status, MigrationStatus::NotStarted);
    assert_eq!(record.current_operation_index, 0);
    assert_eq!(store.state.list()?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_lock_is_single_flight() -> Result<()> {
    let store = TestStateStore::new().await?;
    let guard = store.state.try_lock("m1")?.expect("lock should be free");
    assert!(store.state.try_lock("m1")?.is_none());

    // Locks are scoped per migration name.
    let other = store.state.try_lock("m2")?;
    assert!(other.is_some());

    store.state.unlock(guard)?;
    assert!(store.state.try_lock("m1")?.is_some());
    Ok(())
}

#[tokio::test]
async fn test_dropping_guard_releases_lock() -> Result<()> {
    let store = TestStateStore::new().await?;
    {
        let _guard = store.state.try_lock("m1")?.unwrap();
        assert_eq!(store.state.locks()?.len(), 1);
    }
    assert!(store.state.locks()?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_upsert_requires_live_lock() -> Result<()> {
    let store = TestStateStore::new().await?;
    store.state.create_if_absent("m1")?;
    let guard = store.state.try_lock("m1")?.unwrap();

    let mut record = store.state.get("m1")?.unwrap();
    record.transition(MigrationStatus::Starting)?;
    store.state.upsert(&guard, &record)?;
    assert_eq!(
        store.state.get("m1")?.unwrap().status,
        MigrationStatus::Starting
    );

    // A guard for another migration cannot write this record.
    let other = store.state.try_lock("m2")?.unwrap();
    assert!(store.state.upsert(&other, &record).is_err());

    // Once the lock is gone a stale guard is rejected.
    let txn = store.state.db.transaction();
    state_machine::release_lock(&store.state.db, &txn, &guard.lock)?;
    txn.commit()?;
    let err = store.state.upsert(&guard, &record).unwrap_err();
    assert!(err.to_string().contains("no longer held"));
    Ok(())
}

#[tokio::test]
async fn test_subscribe_sees_record_writes() -> Result<()> {
    let store = TestStateStore::new().await?;
    let mut updates = store.state.subscribe();
    store.state.create_if_absent("m1")?;
    let guard = store.state.try_lock("m1")?.unwrap();
    let mut record = store.state.get("m1")?.unwrap();
    record.transition(MigrationStatus::Starting)?;
    store.state.upsert(&guard, &record)?;

    assert_eq!(updates.recv().await?.status, MigrationStatus::NotStarted);
    assert_eq!(updates.recv().await?.status, MigrationStatus::Starting);
    Ok(())
}

#[tokio::test]
async fn test_reopen_releases_locks_from_previous_instance() -> Result<()> {
    let temp_dir = tempfile::tempdir()?;
    let path = temp_dir.path().join("state");
    {
        let store = MigrationStateStore::new(path.clone(), "crashed-instance").await?;
        // Simulate a process that died while holding the lock.
        let lock = MigrationLock::new("m1", "crashed-instance");
        let txn = store.db.transaction();
        let cf = state_machine::MigratorColumns::MigrationLocks.cf_db(&store.db)?;
        txn.put_cf(cf, "m1", serde_json::to_vec(&lock)?)?;
        txn.commit()?;
        assert_eq!(store.locks()?.len(), 1);
    }

    let store = MigrationStateStore::new(path, "new-instance").await?;
    assert!(store.locks()?.is_empty());
    assert!(store.try_lock("m1")?.is_some());
    Ok(())
}

#[tokio::test]
async fn test_reopen_with_same_instance_id_releases_crashed_lock() -> Result<()> {
    let temp_dir = tempfile::tempdir()?;
    let path = temp_dir.path().join("state");
    {
        let store = MigrationStateStore::new(path.clone(), "migrator-0").await?;
        let mut guard = store.try_lock("m1")?.unwrap();
        // The process dies before the guard can release its lock.
        guard.released = true;
        drop(guard);
        assert_eq!(store.locks()?.len(), 1);
    }

    let store = MigrationStateStore::new(path, "migrator-0").await?;
    assert!(store.locks()?.is_empty());
    assert!(store.try_lock("m1")?.is_some());
    Ok(())
}

#[tokio::test]
async fn test_second_writer_is_refused_as_in_use() -> Result<()> {
    let store = TestStateStore::new().await?;
    let err = MigrationStateStore::new(store.temp_dir.path().join("state"), "other")
        .await
        .err()
        .unwrap();
    assert!(is_store_in_use(&err));
    Ok(())
}

#[tokio::test]
async fn test_read_only_view_while_store_is_held() -> Result<()> {
    let store = TestStateStore::new().await?;
    store.state.create_if_absent("m1")?;
    let guard = store.state.try_lock("m1")?.unwrap();
    let mut record = store.state.get("m1")?.unwrap();
    record.transition(MigrationStatus::Starting)?;
    record.last_error = Some("disk full".to_string());
    store.state.upsert(&guard, &record)?;

    let view = ReadOnlyStateStore::open(&store.temp_dir.path().join("state"))?;
    let seen = view.get("m1")?.unwrap();
    assert_eq!(seen.status, MigrationStatus::Starting);
    assert_eq!(seen.last_error.as_deref(), Some("disk full"));
    assert_eq!(view.list()?.len(), 1);
    assert_eq!(view.locks()?.len(), 1);
    assert!(view.get("m2")?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_delete_under_lock() -> Result<()> {
    let store = TestStateStore::new().await?;
    store.state.create_if_absent("m1")?;
    let guard = store.state.try_lock("m1")?.unwrap();
    store.state.delete(&guard)?;
    assert!(store.state.get("m1")?.is_none());
    Ok(())
}
