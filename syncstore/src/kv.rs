//! Ordered key-value substrate with atomic batched writes.
//!
//! Everything the store persists goes through a single redb table mapping
//! string keys to raw bytes. A [`Write`] stages its changes inside a redb
//! write transaction: they are visible through the same [`Write`] at once,
//! become visible to new readers on [`Write::commit`], and are discarded if
//! the [`Write`] is dropped.

use std::{path::Path, sync::Arc};

use nested_enum_utils::common_fields;
use redb::{
    Database, ReadOnlyTable, ReadTransaction, ReadableTable, Table, TableDefinition,
    WriteTransaction, backends::InMemoryBackend,
};
use snafu::{Backtrace, ResultExt, Snafu};
use tracing::info;

/// Table: Key value pairs
/// Key:   `&str`   # see [`crate::dag::key`] for the key layout
/// Value: `&[u8]`  # chunk data, chunk refs, ref counts or head hashes
const KV_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("kv-1");

type KvTable<'tx> = Table<'tx, &'static str, &'static [u8]>;

/// Errors from the underlying database.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum StorageError {
    #[snafu(transparent)]
    Database { source: redb::DatabaseError },
    #[snafu(transparent)]
    Transaction { source: redb::TransactionError },
    #[snafu(transparent)]
    Table { source: redb::TableError },
    #[snafu(transparent)]
    Storage { source: redb::StorageError },
    #[snafu(transparent)]
    Commit { source: redb::CommitError },
    #[snafu(display("failed to create database directory"))]
    CreateDir { source: std::io::Error },
}

/// Read access shared by [`Read`] and [`Write`].
pub trait ReadKv {
    /// Returns the value stored under `key`.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Whether a value is stored under `key`.
    fn has(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.get(key)?.is_some())
    }

    /// All pairs whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError>;
}

/// Handle to the key-value database.
#[derive(Debug, Clone)]
pub struct Store {
    db: Arc<Database>,
}

impl Store {
    /// Opens or creates a database file at `path`.
    pub fn persistent(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        info!("loading kv database from {}", path.to_string_lossy());
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirSnafu)?;
        }
        let db = Database::builder().create(path)?;
        Self::open(db)
    }

    /// Creates a database that lives only in memory.
    pub fn in_memory() -> Result<Self, StorageError> {
        info!("using in-memory kv database");
        let db = Database::builder().create_with_backend(InMemoryBackend::new())?;
        Self::open(db)
    }

    fn open(db: Database) -> Result<Self, StorageError> {
        let write_tx = db.begin_write()?;
        {
            let _table = write_tx.open_table(KV_TABLE)?;
        }
        write_tx.commit()?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Starts a read transaction over the last committed state.
    pub fn read(&self) -> Result<Read, StorageError> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(KV_TABLE)?;
        Ok(Read { _tx: tx, table })
    }

    /// Starts a write transaction.
    ///
    /// Blocks while another write transaction is open.
    pub fn write(&self) -> Result<Write, StorageError> {
        let tx = self.db.begin_write()?;
        Ok(Write {
            inner: TransactionAndTable::try_new(tx, |tx| tx.open_table(KV_TABLE))?,
        })
    }
}

/// A consistent read-only view.
#[derive(derive_more::Debug)]
pub struct Read {
    #[debug("ReadTransaction")]
    _tx: ReadTransaction,
    #[debug("ReadOnlyTable")]
    table: ReadOnlyTable<&'static str, &'static [u8]>,
}

impl ReadKv for Read {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        get(&self.table, key)
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        scan_prefix(&self.table, prefix)
    }
}

self_cell::self_cell! {
    struct TransactionAndTable {
        owner: WriteTransaction,
        #[covariant]
        dependent: KvTable,
    }
}

/// Staged changes, applied atomically by [`Write::commit`].
#[derive(derive_more::Debug)]
pub struct Write {
    #[debug("TransactionAndTable")]
    inner: TransactionAndTable,
}

impl Write {
    /// Stores `value` under `key`.
    pub fn put(&mut self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.inner
            .with_dependent_mut(|_, table| table.insert(key, value).map(|_| ()))?;
        Ok(())
    }

    /// Removes `key`, if present.
    pub fn del(&mut self, key: &str) -> Result<(), StorageError> {
        self.inner
            .with_dependent_mut(|_, table| table.remove(key).map(|_| ()))?;
        Ok(())
    }

    /// Makes all staged changes visible to new readers.
    pub fn commit(self) -> Result<(), StorageError> {
        self.inner.into_owner().commit()?;
        Ok(())
    }
}

impl ReadKv for Write {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        get(self.inner.borrow_dependent(), key)
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        scan_prefix(self.inner.borrow_dependent(), prefix)
    }
}

fn get(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    key: &str,
) -> Result<Option<Vec<u8>>, StorageError> {
    let Some(value) = table.get(key)? else {
        return Ok(None);
    };
    Ok(Some(value.value().to_vec()))
}

fn scan_prefix(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    prefix: &str,
) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
    let mut res = Vec::new();
    for item in table.range(prefix..)? {
        let (key, value) = item?;
        let key = key.value();
        if !key.starts_with(prefix) {
            break;
        }
        res.push((key.to_string(), value.value().to_vec()));
    }
    Ok(res)
}
