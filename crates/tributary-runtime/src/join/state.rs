//! Per-side join buffers
//!
//! - [`CachedJoinState`]: one TTL cache per side; rows expire `ttl` after
//!   they were buffered
//! - [`GroupedJoinState`]: one tuple store per side, rows keyed by their
//!   expiry second; expired rows are dropped before each match attempt
//!
//! In both modes a row buffered at second `t` can still match at `t + ttl`
//! and is gone from `t + ttl + 1`. Each `put` reads the clock once, so all
//! sides are judged at the same second.

use crate::cache::{open_ttl_cache, TtlCache};
use crate::config::EngineConfig;
use crate::store::{open_tuple_store, Query, Row, StoreError, TimeCondition, TupleStore};
use std::fmt;
use std::sync::Arc;
use tributary_core::{Clock, Period, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JoinMode {
    #[default]
    Cached,
    Grouped,
}

impl fmt::Display for JoinMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinMode::Cached => write!(f, "cached"),
            JoinMode::Grouped => write!(f, "grouped"),
        }
    }
}

pub trait JoinState: Send {
    /// Buffers `row` for `side` and returns the rows of every side, in side
    /// order, when all sides now hold rows for `key`. Returned rows are
    /// removed from the buffers.
    fn put(&mut self, side: usize, key: &Value, row: Row) -> Result<Option<Vec<Vec<Row>>>, StoreError>;

    fn close(&mut self) -> Result<(), StoreError>;
}

pub struct CachedJoinState {
    caches: Vec<Box<dyn TtlCache>>,
    clock: Arc<dyn Clock>,
}

impl CachedJoinState {
    pub fn new(caches: Vec<Box<dyn TtlCache>>, clock: Arc<dyn Clock>) -> Self {
        Self { caches, clock }
    }
}

impl JoinState for CachedJoinState {
    fn put(&mut self, side: usize, key: &Value, row: Row) -> Result<Option<Vec<Vec<Row>>>, StoreError> {
        let Some(cache) = self.caches.get_mut(side) else {
            return Ok(None);
        };
        cache.put(key, row)?;

        let now = self.clock.now_secs();
        for cache in &self.caches {
            if cache.size(key, now)? == 0 {
                return Ok(None);
            }
        }
        let mut taken = Vec::with_capacity(self.caches.len());
        for cache in self.caches.iter_mut() {
            taken.push(cache.take(key, now)?);
        }
        Ok(Some(taken))
    }

    fn close(&mut self) -> Result<(), StoreError> {
        for cache in self.caches.iter_mut() {
            cache.close()?;
        }
        Ok(())
    }
}

pub struct GroupedJoinState {
    stores: Vec<Box<dyn TupleStore>>,
    ttl: Period,
    clock: Arc<dyn Clock>,
}

impl GroupedJoinState {
    pub fn new(stores: Vec<Box<dyn TupleStore>>, ttl: Period, clock: Arc<dyn Clock>) -> Self {
        Self { stores, ttl, clock }
    }
}

impl JoinState for GroupedJoinState {
    fn put(&mut self, side: usize, key: &Value, row: Row) -> Result<Option<Vec<Vec<Row>>>, StoreError> {
        let now = self.clock.now_secs();
        let ttl = i32::try_from(self.ttl.secs()).unwrap_or(i32::MAX);
        let Some(store) = self.stores.get_mut(side) else {
            return Ok(None);
        };
        store.put(key, now.saturating_add(ttl), row)?;

        let expired = Query::builder(key.clone())
            .time_key(TimeCondition::Lt, now)
            .build();
        for store in self.stores.iter_mut() {
            store.remove(&expired)?;
            if store.count(&Query::all(key.clone()))? == 0 {
                return Ok(None);
            }
        }

        let mut taken = Vec::with_capacity(self.stores.len());
        for store in self.stores.iter_mut() {
            taken.push(store.find_and_remove(&Query::all(key.clone()))?);
        }
        Ok(Some(taken))
    }

    fn close(&mut self) -> Result<(), StoreError> {
        for store in self.stores.iter_mut() {
            store.close()?;
        }
        Ok(())
    }
}

/// Opens the buffers of a join with `sides` inputs. `name` prefixes the
/// on-disk name of each side's buffer.
pub fn open_join_state(
    mode: JoinMode,
    config: &EngineConfig,
    name: &str,
    sides: &[&str],
    ttl: Period,
    clock: Arc<dyn Clock>,
) -> Result<Box<dyn JoinState>, StoreError> {
    match mode {
        JoinMode::Cached => {
            let caches = sides
                .iter()
                .map(|side| open_ttl_cache(config, &format!("{}-{}", name, side), ttl, clock.clone()))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Box::new(CachedJoinState::new(caches, clock)))
        }
        JoinMode::Grouped => {
            let stores = sides
                .iter()
                .map(|side| open_tuple_store(config, &format!("{}-{}", name, side), clock.clone()))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Box::new(GroupedJoinState::new(stores, ttl, clock)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TableTtlCache;
    use crate::store::MemoryKeyspaces;
    use tributary_core::ManualClock;

    fn open(mode: JoinMode, clock: &ManualClock) -> Box<dyn JoinState> {
        open_join_state(
            mode,
            &EngineConfig::default(),
            "TUPLE_JOIN_1-0",
            &["a", "b"],
            Period::from_secs(10),
            Arc::new(clock.clone()),
        )
        .unwrap()
    }

    fn row(v: i64) -> Row {
        vec![Value::Int(v)]
    }

    #[test]
    fn test_match_takes_all_sides() {
        for mode in [JoinMode::Cached, JoinMode::Grouped] {
            let clock = ManualClock::at_secs(100);
            let mut state = open(mode, &clock);
            let key = Value::Int(1);
            assert_eq!(state.put(0, &key, row(1)).unwrap(), None);
            assert_eq!(state.put(0, &key, row(2)).unwrap(), None);
            assert_eq!(state.put(1, &Value::Int(2), row(9)).unwrap(), None);

            let matched = state.put(1, &key, row(3)).unwrap().unwrap();
            assert_eq!(matched, vec![vec![row(1), row(2)], vec![row(3)]], "{}", mode);

            // Buffers were emptied by the match
            assert_eq!(state.put(1, &key, row(4)).unwrap(), None, "{}", mode);
            state.close().unwrap();
        }
    }

    #[test]
    fn test_expired_rows_do_not_match() {
        for mode in [JoinMode::Cached, JoinMode::Grouped] {
            let clock = ManualClock::at_secs(100);
            let mut state = open(mode, &clock);
            let key = Value::from("k");
            assert_eq!(state.put(0, &key, row(1)).unwrap(), None);
            clock.set_secs(111);
            assert_eq!(state.put(1, &key, row(2)).unwrap(), None, "{}", mode);
            // A fresh row on the first side matches the live one
            let matched = state.put(0, &key, row(3)).unwrap().unwrap();
            assert_eq!(matched, vec![vec![row(3)], vec![row(2)]], "{}", mode);
        }
    }

    #[test]
    fn test_rows_match_through_expiry_second() {
        for mode in [JoinMode::Cached, JoinMode::Grouped] {
            let clock = ManualClock::at_secs(100);
            let mut state = open(mode, &clock);
            let key = Value::Int(1);
            assert_eq!(state.put(0, &key, row(1)).unwrap(), None);
            clock.set_secs(110);
            let matched = state.put(1, &key, row(2)).unwrap();
            assert_eq!(matched, Some(vec![vec![row(1)], vec![row(2)]]), "{}", mode);

            assert_eq!(state.put(0, &key, row(3)).unwrap(), None);
            clock.set_secs(121);
            assert_eq!(state.put(1, &key, row(4)).unwrap(), None, "{}", mode);
        }
    }

    // ==========================================================================
    // Clock reads
    // ==========================================================================

    /// Moves the shared clock forward whenever it is drained.
    struct LateTake {
        inner: TableTtlCache<MemoryKeyspaces>,
        clock: ManualClock,
        advance_to: i64,
    }

    impl TtlCache for LateTake {
        fn put(&mut self, key: &Value, values: Row) -> Result<(), StoreError> {
            self.inner.put(key, values)
        }

        fn size(&self, key: &Value, now: i32) -> Result<usize, StoreError> {
            self.inner.size(key, now)
        }

        fn take(&mut self, key: &Value, now: i32) -> Result<Vec<Row>, StoreError> {
            self.clock.set_secs(self.advance_to);
            self.inner.take(key, now)
        }

        fn close(&mut self) -> Result<(), StoreError> {
            self.inner.close()
        }
    }

    fn ttl_cache(clock: &ManualClock) -> TableTtlCache<MemoryKeyspaces> {
        TableTtlCache::new(
            MemoryKeyspaces::new(),
            Period::from_secs(10),
            Arc::new(clock.clone()),
            8,
        )
        .unwrap()
    }

    #[test]
    fn test_match_is_judged_at_one_second() {
        let clock = ManualClock::at_secs(0);
        let left = LateTake {
            inner: ttl_cache(&clock),
            clock: clock.clone(),
            advance_to: 11,
        };
        let mut state = CachedJoinState::new(
            vec![Box::new(left), Box::new(ttl_cache(&clock))],
            Arc::new(clock.clone()),
        );
        let key = Value::from("k");

        assert_eq!(state.put(1, &key, row(1)).unwrap(), None);
        clock.set_secs(9);
        // Draining the left side moves the clock past the right row's expiry
        let matched = state.put(0, &key, row(2)).unwrap();
        assert_eq!(matched, Some(vec![vec![row(2)], vec![row(1)]]));
    }
}
