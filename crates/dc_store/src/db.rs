//! Partitioned record storage on SQLite.
//!
//! A partition is a named namespace with its own sequence counter. Records
//! are keyed by the big-endian encoding of their sequence number, so key
//! order is insertion order. Values are opaque bytes (JSON for the typed
//! helpers).
//!
//! Sequence allocation and the record write happen in one immediate
//! transaction: either both land or neither does.

use std::ops::ControlFlow;
use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{de::DeserializeOwned, Serialize};

use crate::error::{Result, StoreError};

const SCHEMA_VERSION: i32 = 1;

/// Encode a sequence number as a record key.
pub fn encode_key(id: u64) -> [u8; 8] {
    id.to_be_bytes()
}

fn decode_key(partition: &str, key: &[u8]) -> Result<u64> {
    let arr: [u8; 8] = key.try_into().map_err(|_| StoreError::CorruptKey {
        partition: partition.to_string(),
        len: key.len(),
    })?;
    Ok(u64::from_be_bytes(arr))
}

/// Store handle. Shared across sessions behind an `Arc`; the connection
/// mutex serialises every transaction.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database at `path` and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )?;
        let store = Self { conn: Mutex::new(conn) };
        store.migrate()?;
        tracing::debug!(target: "dc_store", path = %path.display(), "store opened");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn: Mutex::new(conn) };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
            [],
        )?;
        let current: i32 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )?;
        if current > SCHEMA_VERSION {
            return Err(StoreError::Migration(format!(
                "database schema v{current} is newer than supported v{SCHEMA_VERSION}"
            )));
        }
        if current < 1 {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS partitions (
                    name     TEXT PRIMARY KEY,
                    next_seq INTEGER NOT NULL DEFAULT 0
                 );
                 CREATE TABLE IF NOT EXISTS records (
                    partition TEXT NOT NULL REFERENCES partitions(name),
                    key       BLOB NOT NULL,
                    value     BLOB NOT NULL,
                    PRIMARY KEY (partition, key)
                 );
                 INSERT OR REPLACE INTO schema_version (version) VALUES (1);",
            )?;
        }
        Ok(())
    }

    /// Run `f` inside one immediate transaction. Any error rolls back
    /// everything `f` wrote, including allocated sequence numbers.
    pub fn with_transaction<T>(&self, f: impl FnOnce(&Txn<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&Txn { conn: &tx })?;
        tx.commit()?;
        Ok(out)
    }

    /// Read-only access without opening a write transaction.
    pub fn read<T>(&self, f: impl FnOnce(&Txn<'_>) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        f(&Txn { conn: &conn })
    }

    // ── Convenience wrappers ─────────────────────────────────────────────────

    /// Append raw bytes to `partition`, creating it if needed. Returns the
    /// allocated ID.
    pub fn put(&self, partition: &str, value: &[u8]) -> Result<u64> {
        self.with_transaction(|tx| tx.append(partition, value))
    }

    pub fn put_record<T: Serialize>(&self, partition: &str, record: &T) -> Result<u64> {
        let bytes = serde_json::to_vec(record)?;
        self.put(partition, &bytes)
    }

    pub fn get_record<T: DeserializeOwned>(&self, partition: &str, id: u64) -> Result<Option<T>> {
        self.read(|tx| tx.get_record(partition, id))
    }

    /// Load, modify and write back one record atomically.
    pub fn update_record<T, R>(
        &self,
        partition: &str,
        id: u64,
        f: impl FnOnce(&mut T) -> Result<R>,
    ) -> Result<R>
    where
        T: Serialize + DeserializeOwned,
    {
        self.with_transaction(|tx| tx.update_record(partition, id, f))
    }

    /// First record in `partition` (in key order) matching `pred`.
    ///
    /// Linear in the size of the partition.
    pub fn scan<T: DeserializeOwned>(
        &self,
        partition: &str,
        pred: impl FnMut(&T) -> bool,
    ) -> Result<Option<(u64, T)>> {
        self.read(|tx| tx.scan(partition, pred))
    }

    /// Every record in `partition` in key order.
    pub fn list<T: DeserializeOwned>(&self, partition: &str) -> Result<Vec<(u64, T)>> {
        self.read(|tx| {
            let mut out = Vec::new();
            tx.for_each(partition, |id, bytes| {
                out.push((id, serde_json::from_slice(bytes)?));
                Ok(ControlFlow::Continue(()))
            })?;
            Ok(out)
        })
    }

    pub fn partitions_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        self.read(|tx| tx.partitions_with_prefix(prefix))
    }
}

/// Operations available inside [`Store::with_transaction`] and
/// [`Store::read`].
pub struct Txn<'c> {
    conn: &'c Connection,
}

impl Txn<'_> {
    pub fn partition_exists(&self, name: &str) -> Result<bool> {
        let found = self
            .conn
            .query_row("SELECT 1 FROM partitions WHERE name = ?1", params![name], |_| Ok(()))
            .optional()?;
        Ok(found.is_some())
    }

    pub fn create_partition_if_absent(&self, name: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO partitions (name, next_seq) VALUES (?1, 0)",
            params![name],
        )?;
        Ok(())
    }

    /// Allocate the next ID in `partition`. IDs start at 1.
    pub fn next_sequence(&self, partition: &str) -> Result<u64> {
        let changed = self.conn.execute(
            "UPDATE partitions SET next_seq = next_seq + 1 WHERE name = ?1",
            params![partition],
        )?;
        if changed == 0 {
            return Err(StoreError::NoSuchPartition(partition.to_string()));
        }
        let seq: i64 = self.conn.query_row(
            "SELECT next_seq FROM partitions WHERE name = ?1",
            params![partition],
            |row| row.get(0),
        )?;
        Ok(seq as u64)
    }

    /// Write `value` under `key`, replacing any existing record.
    pub fn put(&self, partition: &str, key: u64, value: &[u8]) -> Result<()> {
        if !self.partition_exists(partition)? {
            return Err(StoreError::NoSuchPartition(partition.to_string()));
        }
        self.conn.execute(
            "INSERT OR REPLACE INTO records (partition, key, value) VALUES (?1, ?2, ?3)",
            params![partition, &encode_key(key)[..], value],
        )?;
        Ok(())
    }

    /// Create the partition if needed, allocate an ID and write `value`.
    pub fn append(&self, partition: &str, value: &[u8]) -> Result<u64> {
        self.create_partition_if_absent(partition)?;
        let id = self.next_sequence(partition)?;
        self.put(partition, id, value)?;
        Ok(id)
    }

    /// Remove the record under `key`. Returns whether one existed.
    pub fn delete(&self, partition: &str, key: u64) -> Result<bool> {
        let changed = self.conn.execute(
            "DELETE FROM records WHERE partition = ?1 AND key = ?2",
            params![partition, &encode_key(key)[..]],
        )?;
        Ok(changed > 0)
    }

    pub fn get(&self, partition: &str, key: u64) -> Result<Option<Vec<u8>>> {
        Ok(self
            .conn
            .query_row(
                "SELECT value FROM records WHERE partition = ?1 AND key = ?2",
                params![partition, &encode_key(key)[..]],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn get_record<T: DeserializeOwned>(&self, partition: &str, key: u64) -> Result<Option<T>> {
        match self.get(partition, key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn update_record<T, R>(
        &self,
        partition: &str,
        key: u64,
        f: impl FnOnce(&mut T) -> Result<R>,
    ) -> Result<R>
    where
        T: Serialize + DeserializeOwned,
    {
        let mut record: T = self
            .get_record(partition, key)?
            .ok_or_else(|| StoreError::NotFound(format!("{partition}/{key}")))?;
        let out = f(&mut record)?;
        self.put(partition, key, &serde_json::to_vec(&record)?)?;
        Ok(out)
    }

    /// Visit every record of `partition` in key order until `f` breaks.
    /// A missing partition is visited as empty.
    pub fn for_each(
        &self,
        partition: &str,
        mut f: impl FnMut(u64, &[u8]) -> Result<ControlFlow<()>>,
    ) -> Result<()> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT key, value FROM records WHERE partition = ?1 ORDER BY key")?;
        let mut rows = stmt.query(params![partition])?;
        while let Some(row) = rows.next()? {
            let key: Vec<u8> = row.get(0)?;
            let value: Vec<u8> = row.get(1)?;
            if f(decode_key(partition, &key)?, &value)?.is_break() {
                break;
            }
        }
        Ok(())
    }

    pub fn scan<T: DeserializeOwned>(
        &self,
        partition: &str,
        mut pred: impl FnMut(&T) -> bool,
    ) -> Result<Option<(u64, T)>> {
        let mut found = None;
        self.for_each(partition, |id, bytes| {
            let record: T = serde_json::from_slice(bytes)?;
            if pred(&record) {
                found = Some((id, record));
                return Ok(ControlFlow::Break(()));
            }
            Ok(ControlFlow::Continue(()))
        })?;
        Ok(found)
    }

    pub fn partitions_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT name FROM partitions ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(names.into_iter().filter(|n| n.starts_with(prefix)).collect())
    }
}
