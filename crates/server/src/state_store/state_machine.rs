use anyhow::{anyhow, Result};
use rocksdb::{ColumnFamily, IteratorMode, Transaction, TransactionDB, DB};
use serde::de::DeserializeOwned;
use strum::AsRefStr;

use super::serializer::{JsonEncode, JsonEncoder};
use crate::{
    data_model::{MigrationLock, MigrationRecord},
    utils::OptionInspectNone,
};

#[derive(AsRefStr, strum::Display, strum::EnumIter)]
pub enum MigratorColumns {
    MigrationRecords, //  MigrationName -> MigrationRecord
    MigrationLocks,   //  MigrationName -> MigrationLock
}

impl MigratorColumns {
    pub fn cf_db<'a>(&self, db: &'a TransactionDB) -> Result<&'a ColumnFamily> {
        db.cf_handle(self.as_ref())
            .inspect_none(|| {
                tracing::error!("failed to get column family handle for {}", self.as_ref());
            })
            .ok_or_else(|| anyhow!("column family {} not found", self.as_ref()))
    }

    pub fn cf_read_only<'a>(&self, db: &'a DB) -> Result<&'a ColumnFamily> {
        db.cf_handle(self.as_ref())
            .ok_or_else(|| anyhow!("column family {} not found", self.as_ref()))
    }
}

/// Outcome of an attempt to take the single-flight lock.
#[derive(Debug)]
pub enum LockAttempt {
    Acquired(MigrationLock),
    Held(MigrationLock),
}

pub(crate) fn get_record(db: &TransactionDB, name: &str) -> Result<Option<MigrationRecord>> {
    let cf = MigratorColumns::MigrationRecords.cf_db(db)?;
    db.get_cf(cf, name)?
        .map(|bytes| JsonEncoder::decode::<MigrationRecord>(&bytes))
        .transpose()
}

/// Decodes every value of a column family scan, in key order.
pub(crate) fn decode_all<T: DeserializeOwned>(
    iter: impl Iterator<Item = Result<(Box<[u8]>, Box<[u8]>), rocksdb::Error>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for kv in iter {
        let (_, value) = kv?;
        values.push(JsonEncoder::decode::<T>(&value)?);
    }
    Ok(values)
}

pub(crate) fn all_records(db: &TransactionDB) -> Result<Vec<MigrationRecord>> {
    let cf = MigratorColumns::MigrationRecords.cf_db(db)?;
    decode_all(db.iterator_cf(cf, IteratorMode::Start))
}

pub(crate) fn all_locks(db: &TransactionDB) -> Result<Vec<MigrationLock>> {
    let cf = MigratorColumns::MigrationLocks.cf_db(db)?;
    decode_all(db.iterator_cf(cf, IteratorMode::Start))
}

/// Inserts a fresh record unless one already exists. Returns whether a record
/// was created.
pub(crate) fn create_record_if_absent(
    db: &TransactionDB,
    txn: &Transaction<TransactionDB>,
    record: &MigrationRecord,
) -> Result<bool> {
    let cf = MigratorColumns::MigrationRecords.cf_db(db)?;
    if txn.get_for_update_cf(cf, record.key(), true)?.is_some() {
        return Ok(false);
    }
    txn.put_cf(cf, record.key(), JsonEncoder::encode(record)?)?;
    Ok(true)
}

pub(crate) fn try_acquire_lock(
    db: &TransactionDB,
    txn: &Transaction<TransactionDB>,
    name: &str,
    holder: &str,
) -> Result<LockAttempt> {
    let cf = MigratorColumns::MigrationLocks.cf_db(db)?;
    if let Some(existing) = txn.get_for_update_cf(cf, name, true)? {
        return Ok(LockAttempt::Held(JsonEncoder::decode(&existing)?));
    }
    let lock = MigrationLock::new(name, holder);
    txn.put_cf(cf, name, JsonEncoder::encode(&lock)?)?;
    Ok(LockAttempt::Acquired(lock))
}

/// Fails unless `lock` is still the live lock for its migration.
pub(crate) fn verify_lock(
    db: &TransactionDB,
    txn: &Transaction<TransactionDB>,
    lock: &MigrationLock,
) -> Result<()> {
    let cf = MigratorColumns::MigrationLocks.cf_db(db)?;
    let current = txn
        .get_for_update_cf(cf, &lock.name, true)?
        .map(|bytes| JsonEncoder::decode::<MigrationLock>(&bytes))
        .transpose()?;
    match current {
        Some(current) if current.token == lock.token => Ok(()),
        Some(current) => Err(anyhow!(
            "lock for migration {} is held by {}, not {}",
            lock.name,
            current.holder,
            lock.holder
        )),
        None => Err(anyhow!("lock for migration {} is no longer held", lock.name)),
    }
}

pub(crate) fn put_record(
    db: &TransactionDB,
    txn: &Transaction<TransactionDB>,
    record: &MigrationRecord,
) -> Result<()> {
    let cf = MigratorColumns::MigrationRecords.cf_db(db)?;
    txn.put_cf(cf, record.key(), JsonEncoder::encode(record)?)?;
    Ok(())
}

pub(crate) fn delete_record(
    db: &TransactionDB,
    txn: &Transaction<TransactionDB>,
    name: &str,
) -> Result<()> {
    let cf = MigratorColumns::MigrationRecords.cf_db(db)?;
    txn.delete_cf(cf, name)?;
    Ok(())
}

/// Deletes `lock` if it is still the live lock. Returns whether it was.
pub(crate) fn release_lock(
    db: &TransactionDB,
    txn: &Transaction<TransactionDB>,
    lock: &MigrationLock,
) -> Result<bool> {
    let cf = MigratorColumns::MigrationLocks.cf_db(db)?;
    let Some(current) = txn.get_for_update_cf(cf, &lock.name, true)? else {
        return Ok(false);
    };
    let current: MigrationLock = JsonEncoder::decode(&current)?;
    if current.token != lock.token {
        return Ok(false);
    }
    txn.delete_cf(cf, &lock.name)?;
    Ok(true)
}
