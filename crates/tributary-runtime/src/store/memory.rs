//! In-memory tuple store
//!
//! Each partition keeps a value list and a parallel, sorted time-key list.
//! Range lookups binary-search the time keys; removals slice the two lists
//! together and drop a partition once it is empty.

use super::{Query, Row, StoreError, TimeCondition, TupleStore};
use rustc_hash::FxHashMap;
use tracing::debug;
use tributary_core::Value;

#[derive(Debug, Default)]
struct Partition {
    time_keys: Vec<i32>,
    rows: Vec<Row>,
}

impl Partition {
    /// `[from, to)` positions matching `query`.
    fn range(&self, query: &Query) -> (usize, usize) {
        let len = self.time_keys.len();
        let (from, to) = match query.time_key {
            None => (0, len),
            Some((cond, v)) => {
                let first_gt = self.time_keys.partition_point(|t| *t <= v);
                let first_ge = self.time_keys.partition_point(|t| *t < v);
                match cond {
                    TimeCondition::Gt => (first_gt, len),
                    TimeCondition::Ge => (first_ge, len),
                    TimeCondition::Lt => (0, first_ge),
                    TimeCondition::Le => (0, first_gt),
                }
            }
        };
        query.window(from, to)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryTupleStore {
    partitions: FxHashMap<Value, Partition>,
    size: usize,
    closed: bool,
}

impl InMemoryTupleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    fn check_open(&self) -> Result<(), StoreError> {
        if self.closed {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }
}

impl TupleStore for InMemoryTupleStore {
    fn put(&mut self, partition: &Value, time_key: i32, values: Row) -> Result<(), StoreError> {
        self.check_open()?;
        let p = self.partitions.entry(partition.clone()).or_default();
        // Appends in the common case; out-of-order keys still land sorted,
        // after any entries with the same time key.
        let at = p.time_keys.partition_point(|t| *t <= time_key);
        p.time_keys.insert(at, time_key);
        p.rows.insert(at, values);
        self.size += 1;
        Ok(())
    }

    fn count(&self, query: &Query) -> Result<usize, StoreError> {
        self.check_open()?;
        Ok(match self.partitions.get(&query.partition) {
            Some(p) => {
                let (from, to) = p.range(query);
                to - from
            }
            None => 0,
        })
    }

    fn find(&self, query: &Query) -> Result<Vec<Row>, StoreError> {
        self.check_open()?;
        Ok(match self.partitions.get(&query.partition) {
            Some(p) => {
                let (from, to) = p.range(query);
                p.rows[from..to].to_vec()
            }
            None => Vec::new(),
        })
    }

    fn find_and_remove(&mut self, query: &Query) -> Result<Vec<Row>, StoreError> {
        self.check_open()?;
        let Some(p) = self.partitions.get_mut(&query.partition) else {
            return Ok(Vec::new());
        };
        let (from, to) = p.range(query);
        if from == to {
            return Ok(Vec::new());
        }

        let len = p.rows.len();
        let removed: Vec<Row> = if from == 0 && to == len {
            p.time_keys.clear();
            std::mem::take(&mut p.rows)
        } else if to == len {
            p.time_keys.truncate(from);
            p.rows.split_off(from)
        } else {
            p.time_keys.drain(from..to);
            p.rows.drain(from..to).collect()
        };

        self.size -= removed.len();
        if p.rows.is_empty() {
            self.partitions.remove(&query.partition);
            debug!(partition = %query.partition, "released empty partition");
        }
        Ok(removed)
    }

    fn len(&self) -> usize {
        self.size
    }

    fn close(&mut self) -> Result<(), StoreError> {
        self.partitions.clear();
        self.size = 0;
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(n: i64) -> Row {
        vec![Value::Int(n)]
    }

    fn store_with(key: &Value, times: &[i32]) -> InMemoryTupleStore {
        let mut store = InMemoryTupleStore::new();
        for (i, t) in times.iter().enumerate() {
            store.put(key, *t, row(i as i64)).unwrap();
        }
        store
    }

    fn q(key: &Value, cond: TimeCondition, t: i32) -> Query {
        Query::builder(key.clone()).time_key(cond, t).build()
    }

    // ==========================================================================
    // Time Condition Tests
    // ==========================================================================

    #[test]
    fn test_time_conditions_with_duplicates() {
        let k = Value::from("k");
        let store = store_with(&k, &[1, 2, 2, 3, 5]);
        assert_eq!(store.count(&q(&k, TimeCondition::Gt, 2)).unwrap(), 2);
        assert_eq!(store.count(&q(&k, TimeCondition::Ge, 2)).unwrap(), 4);
        assert_eq!(store.count(&q(&k, TimeCondition::Lt, 2)).unwrap(), 1);
        assert_eq!(store.count(&q(&k, TimeCondition::Le, 2)).unwrap(), 3);
        assert_eq!(store.count(&q(&k, TimeCondition::Gt, 5)).unwrap(), 0);
        assert_eq!(store.count(&q(&k, TimeCondition::Lt, 0)).unwrap(), 0);
    }

    #[test]
    fn test_same_time_keeps_insertion_order() {
        let k = Value::Int(1);
        let store = store_with(&k, &[7, 7, 7]);
        assert_eq!(store.find(&Query::all(k)).unwrap(), vec![row(0), row(1), row(2)]);
    }

    #[test]
    fn test_out_of_order_insert_stays_sorted() {
        let k = Value::Int(1);
        let store = store_with(&k, &[5, 3, 4]);
        assert_eq!(store.find(&Query::all(k)).unwrap(), vec![row(1), row(2), row(0)]);
    }

    // ==========================================================================
    // Offset / Limit Tests
    // ==========================================================================

    #[test]
    fn test_offset_limit_without_time() {
        let k = Value::Int(1);
        let store = store_with(&k, &[1, 2, 3, 4, 5]);
        let found = store
            .find(&Query::builder(k.clone()).offset(1).limit(2).build())
            .unwrap();
        assert_eq!(found, vec![row(1), row(2)]);
        let found = store.find(&Query::builder(k).offset(10).build()).unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn test_limit_applies_within_time_range() {
        let k = Value::Int(1);
        let store = store_with(&k, &[1, 2, 3, 4, 5]);
        let found = store
            .find(&Query::builder(k).time_key(TimeCondition::Ge, 3).limit(1).build())
            .unwrap();
        assert_eq!(found, vec![row(2)]);
    }

    // ==========================================================================
    // Removal Tests
    // ==========================================================================

    #[test]
    fn test_remove_head_tail_middle() {
        let k = Value::Int(1);
        let mut store = store_with(&k, &[1, 2, 3, 4, 5]);

        let head = store.find_and_remove(&q(&k, TimeCondition::Lt, 2)).unwrap();
        assert_eq!(head, vec![row(0)]);

        let tail = store.find_and_remove(&q(&k, TimeCondition::Gt, 4)).unwrap();
        assert_eq!(tail, vec![row(4)]);

        let middle = store
            .find_and_remove(&Query::builder(k.clone()).offset(1).limit(1).build())
            .unwrap();
        assert_eq!(middle, vec![row(2)]);

        assert_eq!(store.find(&Query::all(k)).unwrap(), vec![row(1), row(3)]);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_empty_partition_released() {
        let k = Value::Int(1);
        let mut store = store_with(&k, &[1, 2]);
        assert_eq!(store.remove(&Query::all(k.clone())).unwrap(), 2);
        assert_eq!(store.partition_count(), 0);
        assert!(store.is_empty());
    }

    #[test]
    fn test_missing_partition_is_empty() {
        let mut store = InMemoryTupleStore::new();
        let k = Value::from("nope");
        assert_eq!(store.count(&Query::all(k.clone())).unwrap(), 0);
        assert!(store.find_and_remove(&Query::all(k)).unwrap().is_empty());
    }

    #[test]
    fn test_closed_store_rejects_calls() {
        let mut store = InMemoryTupleStore::new();
        store.close().unwrap();
        assert_eq!(store.put(&Value::Null, 1, row(1)), Err(StoreError::Closed));
    }
}
