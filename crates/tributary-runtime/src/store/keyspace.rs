//! Ordered key-value engines behind the persistent tuple store
//!
//! A table spreads its state over four keyspaces that are always mutated
//! together in one [`WriteBatch`]:
//!
//! | Keyspace | Key | Value |
//! |---|---|---|
//! | `Store` | composite key | serialized row |
//! | `HashKey` | serialized partition key | partition index |
//! | `HashIndex` | partition index | serialized partition key |
//! | `HashMeta` | partition index | live entry count |

use super::StoreError;
use std::collections::BTreeMap;
use std::ops::Bound;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Keyspace {
    Store,
    HashKey,
    HashIndex,
    HashMeta,
}

impl Keyspace {
    pub const ALL: [Keyspace; 4] = [
        Keyspace::Store,
        Keyspace::HashKey,
        Keyspace::HashIndex,
        Keyspace::HashMeta,
    ];

    /// Column family name in the RocksDB backend.
    pub fn name(&self) -> &'static str {
        match self {
            Keyspace::Store => "default",
            Keyspace::HashKey => "hash_key",
            Keyspace::HashIndex => "hash_index",
            Keyspace::HashMeta => "hash_meta",
        }
    }

    fn slot(&self) -> usize {
        match self {
            Keyspace::Store => 0,
            Keyspace::HashKey => 1,
            Keyspace::HashIndex => 2,
            Keyspace::HashMeta => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put(Keyspace, Vec<u8>, Vec<u8>),
    Delete(Keyspace, Vec<u8>),
}

/// Mutations applied atomically by [`KeyspaceEngine::write`].
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, ks: Keyspace, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Put(ks, key.into(), value.into()));
    }

    pub fn delete(&mut self, ks: Keyspace, key: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Delete(ks, key.into()));
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }
}

pub type Entry = (Vec<u8>, Vec<u8>);

pub trait KeyspaceEngine: Send {
    fn get(&self, ks: Keyspace, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    /// Entries with `lo <= key <= hi`, in key order.
    fn range(&self, ks: Keyspace, lo: &[u8], hi: &[u8]) -> Result<Vec<Entry>, StoreError>;

    /// Greatest entry with key `<= key`.
    fn floor(&self, ks: Keyspace, key: &[u8]) -> Result<Option<Entry>, StoreError>;

    /// Least entry with key `>= key`.
    fn ceiling(&self, ks: Keyspace, key: &[u8]) -> Result<Option<Entry>, StoreError>;

    /// Every entry of a keyspace, in key order.
    fn entries(&self, ks: Keyspace) -> Result<Vec<Entry>, StoreError>;

    fn write(&mut self, batch: WriteBatch) -> Result<(), StoreError>;

    fn close(&mut self) -> Result<(), StoreError>;

    fn is_open(&self) -> bool;
}

/// `BTreeMap`-backed keyspaces.
#[derive(Debug, Default)]
pub struct MemoryKeyspaces {
    maps: [BTreeMap<Vec<u8>, Vec<u8>>; 4],
    closed: bool,
}

impl MemoryKeyspaces {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self, ks: Keyspace) -> Result<&BTreeMap<Vec<u8>, Vec<u8>>, StoreError> {
        if self.closed {
            return Err(StoreError::Closed);
        }
        Ok(&self.maps[ks.slot()])
    }
}

impl KeyspaceEngine for MemoryKeyspaces {
    fn get(&self, ks: Keyspace, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.map(ks)?.get(key).cloned())
    }

    fn range(&self, ks: Keyspace, lo: &[u8], hi: &[u8]) -> Result<Vec<Entry>, StoreError> {
        if lo > hi {
            return Ok(Vec::new());
        }
        Ok(self
            .map(ks)?
            .range::<[u8], _>((Bound::Included(lo), Bound::Included(hi)))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn floor(&self, ks: Keyspace, key: &[u8]) -> Result<Option<Entry>, StoreError> {
        Ok(self
            .map(ks)?
            .range::<[u8], _>((Bound::Unbounded, Bound::Included(key)))
            .next_back()
            .map(|(k, v)| (k.clone(), v.clone())))
    }

    fn ceiling(&self, ks: Keyspace, key: &[u8]) -> Result<Option<Entry>, StoreError> {
        Ok(self
            .map(ks)?
            .range::<[u8], _>((Bound::Included(key), Bound::Unbounded))
            .next()
            .map(|(k, v)| (k.clone(), v.clone())))
    }

    fn entries(&self, ks: Keyspace) -> Result<Vec<Entry>, StoreError> {
        Ok(self
            .map(ks)?
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn write(&mut self, batch: WriteBatch) -> Result<(), StoreError> {
        if self.closed {
            return Err(StoreError::Closed);
        }
        for op in batch.into_ops() {
            match op {
                BatchOp::Put(ks, k, v) => {
                    self.maps[ks.slot()].insert(k, v);
                }
                BatchOp::Delete(ks, k) => {
                    self.maps[ks.slot()].remove(&k);
                }
            }
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), StoreError> {
        self.closed = true;
        Ok(())
    }

    fn is_open(&self) -> bool {
        !self.closed
    }
}

/// RocksDB keyspaces, one column family per [`Keyspace`].
#[cfg(feature = "persistence")]
pub struct RocksKeyspaces {
    db: Option<rocksdb::DB>,
}

#[cfg(feature = "persistence")]
impl RocksKeyspaces {
    /// Open or create the database at `path`, creating missing column families.
    pub fn open<P: AsRef<std::path::Path>>(path: P) -> Result<Self, StoreError> {
        let mut opts = rocksdb::Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let names = Keyspace::ALL.iter().map(|ks| ks.name());
        let db = rocksdb::DB::open_cf(&opts, path.as_ref(), names)
            .map_err(|e| StoreError::Io(e.to_string()))?;

        tracing::info!(path = %path.as_ref().display(), "opened RocksDB tuple store");
        Ok(Self { db: Some(db) })
    }

    fn db(&self) -> Result<&rocksdb::DB, StoreError> {
        self.db.as_ref().ok_or(StoreError::Closed)
    }

    fn cf<'a>(db: &'a rocksdb::DB, ks: Keyspace) -> Result<&'a rocksdb::ColumnFamily, StoreError> {
        db.cf_handle(ks.name())
            .ok_or_else(|| StoreError::Io(format!("missing column family {}", ks.name())))
    }

    fn collect<'a>(
        iter: impl Iterator<Item = Result<(Box<[u8]>, Box<[u8]>), rocksdb::Error>> + 'a,
        mut keep: impl FnMut(&[u8]) -> bool,
        limit: Option<usize>,
    ) -> Result<Vec<Entry>, StoreError> {
        let mut out = Vec::new();
        for item in iter {
            let (k, v) = item.map_err(|e| StoreError::Io(e.to_string()))?;
            if !keep(&k) {
                break;
            }
            out.push((k.into_vec(), v.into_vec()));
            if limit.is_some_and(|l| out.len() >= l) {
                break;
            }
        }
        Ok(out)
    }
}

#[cfg(feature = "persistence")]
impl KeyspaceEngine for RocksKeyspaces {
    fn get(&self, ks: Keyspace, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let db = self.db()?;
        db.get_cf(Self::cf(db, ks)?, key)
            .map_err(|e| StoreError::Io(e.to_string()))
    }

    fn range(&self, ks: Keyspace, lo: &[u8], hi: &[u8]) -> Result<Vec<Entry>, StoreError> {
        let db = self.db()?;
        let iter = db.iterator_cf(
            Self::cf(db, ks)?,
            rocksdb::IteratorMode::From(lo, rocksdb::Direction::Forward),
        );
        Self::collect(iter, |k| k <= hi, None)
    }

    fn floor(&self, ks: Keyspace, key: &[u8]) -> Result<Option<Entry>, StoreError> {
        let db = self.db()?;
        let iter = db.iterator_cf(
            Self::cf(db, ks)?,
            rocksdb::IteratorMode::From(key, rocksdb::Direction::Reverse),
        );
        Ok(Self::collect(iter, |_| true, Some(1))?.pop())
    }

    fn ceiling(&self, ks: Keyspace, key: &[u8]) -> Result<Option<Entry>, StoreError> {
        let db = self.db()?;
        let iter = db.iterator_cf(
            Self::cf(db, ks)?,
            rocksdb::IteratorMode::From(key, rocksdb::Direction::Forward),
        );
        Ok(Self::collect(iter, |_| true, Some(1))?.pop())
    }

    fn entries(&self, ks: Keyspace) -> Result<Vec<Entry>, StoreError> {
        let db = self.db()?;
        let iter = db.iterator_cf(Self::cf(db, ks)?, rocksdb::IteratorMode::Start);
        Self::collect(iter, |_| true, None)
    }

    fn write(&mut self, batch: WriteBatch) -> Result<(), StoreError> {
        let db = self.db()?;
        let mut wb = rocksdb::WriteBatch::default();
        for op in batch.into_ops() {
            match op {
                BatchOp::Put(ks, k, v) => wb.put_cf(Self::cf(db, ks)?, k, v),
                BatchOp::Delete(ks, k) => wb.delete_cf(Self::cf(db, ks)?, k),
            }
        }
        db.write(wb).map_err(|e| StoreError::Io(e.to_string()))
    }

    fn close(&mut self) -> Result<(), StoreError> {
        if let Some(db) = self.db.take() {
            db.flush().map_err(|e| StoreError::Io(e.to_string()))?;
            tracing::info!("closed RocksDB tuple store");
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.db.is_some()
    }
}
