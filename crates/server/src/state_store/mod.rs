use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{anyhow, Context, Result};
use opentelemetry::KeyValue;
use rocksdb::{
    ColumnFamilyDescriptor,
    ErrorKind,
    IteratorMode,
    Options,
    TransactionDB,
    TransactionDBOptions,
    DB,
};
use strum::IntoEnumIterator;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::{
    data_model::{MigrationLock, MigrationRecord},
    metrics::{StateStoreMetrics, Timer},
};

pub mod serializer;
pub mod state_machine;
#[cfg(test)]
pub mod test_state_store;

use serializer::{JsonEncode, JsonEncoder};
use state_machine::{LockAttempt, MigratorColumns};

const RECORD_UPDATES_CHANNEL_SIZE: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum StateStoreError {
    /// Another process has the store open for writing.
    #[error("migration state store at {path} is in use by another process")]
    InUse { path: String },
}

/// Whether `err` comes from opening a store another process holds.
pub fn is_store_in_use(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<StateStoreError>(),
            Some(StateStoreError::InUse { .. })
        )
    })
}

/// Durable store for migration records and single-flight locks.
///
/// RocksDB allows a single process to open the database for writing, so
/// every engine sharing this store shares one `MigrationStateStore`
/// instance. A lock found on open was therefore left behind by a process
/// that is gone, whatever instance id it was tagged with, and is dropped.
pub struct MigrationStateStore {
    pub(crate) db: Arc<TransactionDB>,
    instance_id: String,
    record_updates_tx: broadcast::Sender<MigrationRecord>,
    metrics: Arc<StateStoreMetrics>,
}

impl MigrationStateStore {
    pub async fn new(path: PathBuf, instance_id: &str) -> Result<Arc<Self>> {
        fs::create_dir_all(path.clone())
            .map_err(|e| anyhow!("failed to create state store dir: {}", e))?;

        let column_families = MigratorColumns::iter()
            .map(|cf| ColumnFamilyDescriptor::new(cf.to_string(), Options::default()));
        let mut db_opts = Options::default();
        db_opts.create_missing_column_families(true);
        db_opts.create_if_missing(true);
        let db = Arc::new(
            TransactionDB::open_cf_descriptors(
                &db_opts,
                &TransactionDBOptions::default(),
                &path,
                column_families,
            )
            .map_err(|e| open_error(&path, e))?,
        );

        let (record_updates_tx, _) = broadcast::channel(RECORD_UPDATES_CHANNEL_SIZE);
        let store = Arc::new(Self {
            db,
            instance_id: instance_id.to_string(),
            record_updates_tx,
            metrics: Arc::new(StateStoreMetrics::new()),
        });

        let released = store
            .release_abandoned_locks()
            .context("releasing stale migration locks")?;
        info!(
            path = %path.display(),
            instance_id = store.instance_id,
            stale_locks_released = released,
            "initialized migration state store"
        );

        Ok(store)
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn get(&self, name: &str) -> Result<Option<MigrationRecord>> {
        let _timer = Timer::start_with_labels(&self.metrics.state_read, &[]);
        state_machine::get_record(&self.db, name)
    }

    /// All records, ordered by migration name.
    pub fn list(&self) -> Result<Vec<MigrationRecord>> {
        let _timer = Timer::start_with_labels(&self.metrics.state_read, &[]);
        state_machine::all_records(&self.db)
    }

    pub fn locks(&self) -> Result<Vec<MigrationLock>> {
        state_machine::all_locks(&self.db)
    }

    /// Creates a `NotStarted` record for `name` unless one exists. Returns
    /// whether a record was created.
    pub fn create_if_absent(&self, name: &str) -> Result<bool> {
        let _timer = Timer::start_with_labels(&self.metrics.state_write, &[]);
        let record = MigrationRecord::new(name);
        let txn = self.db.transaction();
        let created = state_machine::create_record_if_absent(&self.db, &txn, &record)?;
        txn.commit()
            .with_context(|| format!("creating record for migration {name}"))?;
        if created {
            debug!(migration = name, "created migration record");
            let _ = self.record_updates_tx.send(record);
        }
        Ok(created)
    }

    /// Takes the single-flight lock for `name` without waiting. Returns
    /// `None` when another execution holds it.
    pub fn try_lock(&self, name: &str) -> Result<Option<MigrationLockGuard>> {
        let txn = self.db.transaction();
        let attempt = match state_machine::try_acquire_lock(&self.db, &txn, name, &self.instance_id)
        {
            Ok(attempt) => attempt,
            Err(err) if is_contention(&err) => {
                debug!(migration = name, "lock acquisition contended");
                return Ok(None);
            }
            Err(err) => return Err(err),
        };
        match attempt {
            LockAttempt::Held(existing) => {
                debug!(
                    migration = name,
                    holder = existing.holder,
                    acquired_at = existing.acquired_at,
                    "migration is locked"
                );
                Ok(None)
            }
            LockAttempt::Acquired(lock) => {
                if let Err(err) = txn.commit() {
                    if matches!(err.kind(), ErrorKind::Busy | ErrorKind::TimedOut) {
                        return Ok(None);
                    }
                    return Err(anyhow!("committing lock for migration {}: {}", name, err));
                }
                self.metrics
                    .lock_acquisitions
                    .add(1, &[KeyValue::new("migration", name.to_string())]);
                debug!(migration = name, token = lock.token, "acquired migration lock");
                Ok(Some(MigrationLockGuard {
                    db: self.db.clone(),
                    lock,
                    released: false,
                }))
            }
        }
    }

    /// Writes `record` while holding its lock. Fails if the lock is no longer
    /// held by `guard`.
    pub fn upsert(&self, guard: &MigrationLockGuard, record: &MigrationRecord) -> Result<()> {
        if guard.lock.name != record.name {
            return Err(anyhow!(
                "lock for migration {} cannot be used to write migration {}",
                guard.lock.name,
                record.name
            ));
        }
        let _timer = Timer::start_with_labels(&self.metrics.state_write, &[]);
        let txn = self.db.transaction();
        state_machine::verify_lock(&self.db, &txn, &guard.lock)?;
        state_machine::put_record(&self.db, &txn, record)?;
        txn.commit()
            .with_context(|| format!("writing record for migration {}", record.name))?;
        let _ = self.record_updates_tx.send(record.clone());
        Ok(())
    }

    /// Deletes the record for the locked migration. Used by operator resets.
    pub fn delete(&self, guard: &MigrationLockGuard) -> Result<()> {
        let _timer = Timer::start_with_labels(&self.metrics.state_write, &[]);
        let txn = self.db.transaction();
        state_machine::verify_lock(&self.db, &txn, &guard.lock)?;
        state_machine::delete_record(&self.db, &txn, &guard.lock.name)?;
        txn.commit()
            .with_context(|| format!("deleting record for migration {}", guard.lock.name))?;
        Ok(())
    }

    pub fn unlock(&self, guard: MigrationLockGuard) -> Result<()> {
        guard.release()
    }

    /// Stream of every record written to the store.
    pub fn subscribe(&self) -> broadcast::Receiver<MigrationRecord> {
        self.record_updates_tx.subscribe()
    }

    fn release_abandoned_locks(&self) -> Result<usize> {
        let mut released = 0;
        for lock in state_machine::all_locks(&self.db)? {
            warn!(
                migration = lock.name,
                holder = lock.holder,
                acquired_at = lock.acquired_at,
                "releasing lock left behind by a previous process"
            );
            let txn = self.db.transaction();
            if state_machine::release_lock(&self.db, &txn, &lock)? {
                released += 1;
            }
            txn.commit()?;
        }
        if released > 0 {
            self.metrics.stale_locks_released.add(released as u64, &[]);
        }
        Ok(released)
    }
}

fn open_error(path: &Path, err: rocksdb::Error) -> anyhow::Error {
    // RocksDB reports a held LOCK file as an IO error naming the file.
    if err.kind() == ErrorKind::IOError && err.to_string().contains("LOCK") {
        return StateStoreError::InUse {
            path: path.display().to_string(),
        }
        .into();
    }
    anyhow!("failed to open db: {}", err)
}

/// Read-only view of a store that may be open for writing in another
/// process. Sees the state as of when it was opened.
pub struct ReadOnlyStateStore {
    db: DB,
}

impl ReadOnlyStateStore {
    pub fn open(path: &Path) -> Result<Self> {
        let db = DB::open_cf_for_read_only(
            &Options::default(),
            path,
            MigratorColumns::iter().map(|cf| cf.to_string()),
            false,
        )
        .map_err(|e| anyhow!("failed to open db read-only at {}: {}", path.display(), e))?;
        Ok(Self { db })
    }

    pub fn get(&self, name: &str) -> Result<Option<MigrationRecord>> {
        let cf = MigratorColumns::MigrationRecords.cf_read_only(&self.db)?;
        self.db
            .get_cf(cf, name)?
            .map(|bytes| JsonEncoder::decode::<MigrationRecord>(&bytes))
            .transpose()
    }

    pub fn list(&self) -> Result<Vec<MigrationRecord>> {
        let cf = MigratorColumns::MigrationRecords.cf_read_only(&self.db)?;
        state_machine::decode_all(self.db.iterator_cf(cf, IteratorMode::Start))
    }

    pub fn locks(&self) -> Result<Vec<MigrationLock>> {
        let cf = MigratorColumns::MigrationLocks.cf_read_only(&self.db)?;
        state_machine::decode_all(self.db.iterator_cf(cf, IteratorMode::Start))
    }
}

fn is_contention(err: &anyhow::Error) -> bool {
    err.downcast_ref::<rocksdb::Error>()
        .map(|e| matches!(e.kind(), ErrorKind::Busy | ErrorKind::TimedOut))
        .unwrap_or(false)
}

/// Holds the single-flight lock of one migration. The lock is released on
/// `release` or when the guard is dropped.
pub struct MigrationLockGuard {
    db: Arc<TransactionDB>,
    lock: MigrationLock,
    released: bool,
}

impl MigrationLockGuard {
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        release(&self.db, &self.lock)
    }
}

impl Drop for MigrationLockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = release(&self.db, &self.lock) {
            error!(
                migration = self.lock.name,
                "failed to release migration lock: {:?}", err
            );
        }
    }
}

fn release(db: &TransactionDB, lock: &MigrationLock) -> Result<()> {
    let txn = db.transaction();
    let released = state_machine::release_lock(db, &txn, lock)?;
    txn.commit()
        .with_context(|| format!("releasing lock for migration {}", lock.name))?;
    if released {
        debug!(migration = lock.name, "released migration lock");
    }
    Ok(())
}
