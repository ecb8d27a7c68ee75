//! TTL-bounded per-key buffers for the join engine
//!
//! A value put at second `now` stays live until `now + ttl`. Expired values
//! are never returned: `take` drops them, and every `put` sweeps one
//! bounded batch of the table so keys that are never read again do not
//! accumulate.

use crate::config::{EngineConfig, StoreBackend};
use crate::store::{KeyspaceEngine, MemoryKeyspaces, OrderedTable, Row, StoreError};
use std::sync::Arc;
use tracing::trace;
use tributary_core::{Clock, Period, Value};

pub trait TtlCache: Send {
    fn put(&mut self, key: &Value, values: Row) -> Result<(), StoreError>;

    /// Values buffered for `key` that are live at second `now`.
    fn size(&self, key: &Value, now: i32) -> Result<usize, StoreError>;

    /// Removes everything buffered for `key`, returning the values live at
    /// second `now` in insertion order.
    fn take(&mut self, key: &Value, now: i32) -> Result<Vec<Row>, StoreError>;

    fn close(&mut self) -> Result<(), StoreError>;
}

pub struct TableTtlCache<E: KeyspaceEngine> {
    table: OrderedTable<E>,
    clock: Arc<dyn Clock>,
}

impl<E: KeyspaceEngine> TableTtlCache<E> {
    pub fn new(
        engine: E,
        ttl: Period,
        clock: Arc<dyn Clock>,
        seek_size: usize,
    ) -> Result<Self, StoreError> {
        let ttl = i32::try_from(ttl.secs()).unwrap_or(i32::MAX);
        let table = OrderedTable::open(engine, Some(ttl), clock.clone(), seek_size)?;
        Ok(Self { table, clock })
    }
}

impl<E: KeyspaceEngine> TtlCache for TableTtlCache<E> {
    fn put(&mut self, key: &Value, values: Row) -> Result<(), StoreError> {
        self.table.put(key, self.clock.now_secs(), values)?;
        let swept = self.table.compact_range()?;
        if !swept.is_empty() {
            trace!(swept = swept.len(), "expired cache entries");
        }
        Ok(())
    }

    fn size(&self, key: &Value, now: i32) -> Result<usize, StoreError> {
        self.table.size_at(key, now)
    }

    fn take(&mut self, key: &Value, now: i32) -> Result<Vec<Row>, StoreError> {
        self.table.take_at(key, now)
    }

    fn close(&mut self) -> Result<(), StoreError> {
        self.table.close()
    }
}

/// Opens the cache backend selected by `config`. `name` distinguishes the
/// caches of one operator on disk.
pub fn open_ttl_cache(
    config: &EngineConfig,
    name: &str,
    ttl: Period,
    clock: Arc<dyn Clock>,
) -> Result<Box<dyn TtlCache>, StoreError> {
    let seek = config.ttl_cache_seek_size;
    match &config.store_backend {
        StoreBackend::Memory => Ok(Box::new(TableTtlCache::new(
            MemoryKeyspaces::new(),
            ttl,
            clock,
            seek,
        )?)),
        StoreBackend::Persistent { path } => {
            let engine = crate::store::open_keyspaces(path, name)?;
            Ok(Box::new(TableTtlCache::new(engine, ttl, clock, seek)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tributary_core::ManualClock;

    fn cache(clock: &ManualClock, ttl: u32) -> TableTtlCache<MemoryKeyspaces> {
        TableTtlCache::new(
            MemoryKeyspaces::new(),
            Period::from_secs(ttl),
            Arc::new(clock.clone()),
            8,
        )
        .unwrap()
    }

    #[test]
    fn test_put_size_take() {
        let clock = ManualClock::at_secs(1_000);
        let mut c = cache(&clock, 10);
        let k = Value::from("k");
        c.put(&k, vec![Value::Int(1)]).unwrap();
        c.put(&k, vec![Value::Int(2)]).unwrap();
        assert_eq!(c.size(&k, 1_000).unwrap(), 2);
        assert_eq!(
            c.take(&k, 1_000).unwrap(),
            vec![vec![Value::Int(1)], vec![Value::Int(2)]]
        );
        assert_eq!(c.size(&k, 1_000).unwrap(), 0);
    }

    #[test]
    fn test_expired_values_are_not_returned() {
        let clock = ManualClock::at_secs(0);
        let mut c = cache(&clock, 10);
        let k = Value::Int(1);
        c.put(&k, vec![Value::from("old")]).unwrap();
        clock.set_secs(8);
        c.put(&k, vec![Value::from("new")]).unwrap();
        clock.set_secs(11);
        assert_eq!(c.size(&k, 11).unwrap(), 1);
        assert_eq!(c.take(&k, 11).unwrap(), vec![vec![Value::from("new")]]);
    }

    #[test]
    fn test_put_sweeps_other_keys() {
        let clock = ManualClock::at_secs(0);
        let mut c = cache(&clock, 1);
        c.put(&Value::Int(1), vec![Value::Int(1)]).unwrap();
        clock.set_secs(5);
        c.put(&Value::Int(2), vec![Value::Int(2)]).unwrap();
        assert_eq!(c.size(&Value::Int(1), 5).unwrap(), 0);
        assert_eq!(c.table.len(), 1);
    }
}
