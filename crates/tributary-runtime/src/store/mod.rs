//! Tuple Store Engine
//!
//! An ordered container keyed by `(partition key, time key, sequence)` that
//! every stateful operator keeps its window or join buffers in. Entries of
//! one partition are ordered by time key, then by insertion.
//!
//! Two backends implement [`TupleStore`]:
//! - [`InMemoryTupleStore`]: per-partition sorted vectors with binary search
//! - [`PersistentTupleStore`]: an [`OrderedTable`] over a [`KeyspaceEngine`]
//!   (RocksDB with the `persistence` feature)
//!
//! # Example
//! ```ignore
//! use tributary_runtime::store::{InMemoryTupleStore, Query, TimeCondition, TupleStore};
//!
//! let mut store = InMemoryTupleStore::new();
//! store.put(&key, 100, vec![Value::Int(1)])?;
//! let evicted = store.find_and_remove(
//!     &Query::builder(key).time_key(TimeCondition::Lt, 90).build(),
//! )?;
//! ```

pub mod codec;
pub mod keyspace;
pub mod memory;
pub mod table;

pub use codec::CompositeKey;
pub use keyspace::{Keyspace, KeyspaceEngine, MemoryKeyspaces, WriteBatch};
#[cfg(feature = "persistence")]
pub use keyspace::RocksKeyspaces;
pub use memory::InMemoryTupleStore;
pub use table::{OrderedTable, PersistentTupleStore};

use crate::config::{EngineConfig, StoreBackend};
use std::fmt;
use std::sync::Arc;
use tributary_core::{Clock, Value};

/// Stored value list.
pub type Row = Vec<Value>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("store is closed")]
    Closed,
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeCondition {
    Gt,
    Ge,
    Lt,
    Le,
}

impl fmt::Display for TimeCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TimeCondition::Gt => ">",
            TimeCondition::Ge => ">=",
            TimeCondition::Lt => "<",
            TimeCondition::Le => "<=",
        };
        write!(f, "{}", s)
    }
}

/// Selects a slice of one partition.
///
/// With a time condition, `offset`/`limit` apply within the matching time
/// range. Without one they select by position from the oldest entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub partition: Value,
    pub time_key: Option<(TimeCondition, i32)>,
    pub offset: Option<usize>,
    pub limit: Option<usize>,
}

impl Query {
    /// Whole partition.
    pub fn all(partition: Value) -> Self {
        Self {
            partition,
            time_key: None,
            offset: None,
            limit: None,
        }
    }

    pub fn builder(partition: Value) -> QueryBuilder {
        QueryBuilder {
            query: Self::all(partition),
        }
    }

    pub fn is_whole_partition(&self) -> bool {
        self.time_key.is_none() && self.offset.unwrap_or(0) == 0 && self.limit.is_none()
    }

    /// Narrows `[from, to)` (positions within the time-matched range) by offset and limit.
    pub(crate) fn window(&self, from: usize, to: usize) -> (usize, usize) {
        let from = from.saturating_add(self.offset.unwrap_or(0)).min(to);
        let to = match self.limit {
            Some(limit) => from.saturating_add(limit).min(to),
            None => to,
        };
        (from, to)
    }
}

pub struct QueryBuilder {
    query: Query,
}

impl QueryBuilder {
    pub fn time_key(mut self, condition: TimeCondition, time_key: i32) -> Self {
        self.query.time_key = Some((condition, time_key));
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.query.offset = Some(offset);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.query.limit = Some(limit);
        self
    }

    pub fn build(self) -> Query {
        self.query
    }
}

/// Ordered, partitioned container used by window and join operators.
///
/// Each instance is owned by exactly one operator instance.
pub trait TupleStore: Send {
    /// Appends `values` under `(partition, time_key)`.
    fn put(&mut self, partition: &Value, time_key: i32, values: Row) -> Result<(), StoreError>;

    fn count(&self, query: &Query) -> Result<usize, StoreError>;

    fn find(&self, query: &Query) -> Result<Vec<Row>, StoreError>;

    /// Removes and returns the matching entries in one step.
    fn find_and_remove(&mut self, query: &Query) -> Result<Vec<Row>, StoreError>;

    /// Removes the matching entries, returning how many were removed.
    fn remove(&mut self, query: &Query) -> Result<usize, StoreError> {
        Ok(self.find_and_remove(query)?.len())
    }

    /// Entries across all partitions.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn close(&mut self) -> Result<(), StoreError>;
}

/// Opens the tuple store backend selected by `config` for one operator instance.
pub fn open_tuple_store(
    config: &EngineConfig,
    name: &str,
    clock: Arc<dyn Clock>,
) -> Result<Box<dyn TupleStore>, StoreError> {
    match &config.store_backend {
        StoreBackend::Memory => Ok(Box::new(InMemoryTupleStore::new())),
        StoreBackend::Persistent { path } => {
            let engine = open_keyspaces(path, name)?;
            let table = OrderedTable::open(engine, None, clock, config.ttl_cache_seek_size)?;
            Ok(Box::new(PersistentTupleStore::new(table)))
        }
    }
}

#[cfg(feature = "persistence")]
pub(crate) type PersistentEngine = RocksKeyspaces;
#[cfg(not(feature = "persistence"))]
pub(crate) type PersistentEngine = MemoryKeyspaces;

#[cfg(feature = "persistence")]
pub(crate) fn open_keyspaces(
    root: &std::path::Path,
    name: &str,
) -> Result<PersistentEngine, StoreError> {
    RocksKeyspaces::open(root.join(name))
}

#[cfg(not(feature = "persistence"))]
pub(crate) fn open_keyspaces(
    _root: &std::path::Path,
    _name: &str,
) -> Result<PersistentEngine, StoreError> {
    Err(StoreError::Io(
        "persistent store backend requires the `persistence` feature".to_string(),
    ))
}
