//! Tuple store contract tests.
//!
//! The in-memory store and the ordered-table store must answer every query
//! the same way, and `find_and_remove` must remove exactly what `count`
//! reported. With the `persistence` feature the ordered table also runs
//! over RocksDB and survives a reopen.

use proptest::prelude::*;
use std::sync::Arc;
use tributary_core::{ManualClock, Value};
use tributary_runtime::store::{
    InMemoryTupleStore, MemoryKeyspaces, OrderedTable, PersistentTupleStore, Query, Row,
    TimeCondition, TupleStore,
};

// ==========================================================================
// Helpers
// ==========================================================================

fn table_store() -> PersistentTupleStore<MemoryKeyspaces> {
    let table = OrderedTable::open(
        MemoryKeyspaces::new(),
        None,
        Arc::new(ManualClock::default()),
        16,
    )
    .unwrap();
    PersistentTupleStore::new(table)
}

fn backends() -> Vec<(&'static str, Box<dyn TupleStore>)> {
    vec![
        ("memory", Box::new(InMemoryTupleStore::new())),
        ("table", Box::new(table_store())),
    ]
}

fn row(n: i64) -> Row {
    vec![Value::Int(n), Value::from(format!("v{}", n))]
}

fn condition() -> impl Strategy<Value = Option<(TimeCondition, i32)>> {
    prop_oneof![
        Just(None),
        (
            prop_oneof![
                Just(TimeCondition::Gt),
                Just(TimeCondition::Ge),
                Just(TimeCondition::Lt),
                Just(TimeCondition::Le),
            ],
            0..40i32
        )
            .prop_map(Some),
    ]
}

fn query() -> impl Strategy<Value = Query> {
    (0..3i64, condition(), proptest::option::of(0..6usize), proptest::option::of(0..6usize))
        .prop_map(|(p, time_key, offset, limit)| Query {
            partition: Value::Int(p),
            time_key,
            offset,
            limit,
        })
}

// ==========================================================================
// Round Trip
// ==========================================================================

#[test]
fn test_put_then_find_until_removed() {
    for (name, mut store) in backends() {
        let p = Value::from("user-1");
        store.put(&p, 10, row(1)).unwrap();
        store.put(&p, 10, row(2)).unwrap();
        store.put(&p, 12, row(3)).unwrap();

        assert_eq!(store.find(&Query::all(p.clone())).unwrap(), vec![row(1), row(2), row(3)], "{}", name);
        let later = Query::builder(p.clone()).time_key(TimeCondition::Gt, 10).build();
        assert_eq!(store.find(&later).unwrap(), vec![row(3)], "{}", name);

        let oldest = Query::builder(p.clone()).limit(1).build();
        assert_eq!(store.remove(&oldest).unwrap(), 1, "{}", name);
        assert_eq!(store.find(&Query::all(p.clone())).unwrap(), vec![row(2), row(3)], "{}", name);
        assert_eq!(store.len(), 2, "{}", name);

        store.find_and_remove(&Query::all(p.clone())).unwrap();
        assert!(store.is_empty(), "{}", name);
        store.close().unwrap();
    }
}

#[test]
fn test_partitions_are_independent() {
    for (name, mut store) in backends() {
        store.put(&Value::Int(1), 5, row(1)).unwrap();
        store.put(&Value::Int(2), 5, row(2)).unwrap();
        let removed = store.find_and_remove(&Query::all(Value::Int(1))).unwrap();
        assert_eq!(removed, vec![row(1)], "{}", name);
        assert_eq!(store.count(&Query::all(Value::Int(2))).unwrap(), 1, "{}", name);
        assert_eq!(store.count(&Query::all(Value::Int(3))).unwrap(), 0, "{}", name);
    }
}

// ==========================================================================
// Properties
// ==========================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_count_matches_find_and_remove(
        puts in proptest::collection::vec((0..3i64, 0..40i32), 0..40),
        q in query(),
    ) {
        let mut results = Vec::new();
        for (name, mut store) in backends() {
            for (i, (p, t)) in puts.iter().enumerate() {
                store.put(&Value::Int(*p), *t, row(i as i64)).unwrap();
            }
            let counted = store.count(&q).unwrap();
            let found = store.find(&q).unwrap();
            let removed = store.find_and_remove(&q).unwrap();
            prop_assert_eq!(counted, removed.len(), "{}", name);
            prop_assert_eq!(&found, &removed, "{}", name);
            prop_assert_eq!(store.len(), puts.len() - removed.len(), "{}", name);
            results.push(removed);
        }
        prop_assert_eq!(&results[0], &results[1]);
    }
}

// ==========================================================================
// RocksDB Backend
// ==========================================================================

#[cfg(feature = "persistence")]
mod rocks {
    use super::*;
    use tributary_runtime::store::RocksKeyspaces;

    fn open(path: &std::path::Path) -> PersistentTupleStore<RocksKeyspaces> {
        let engine = RocksKeyspaces::open(path).unwrap();
        let table = OrderedTable::open(engine, None, Arc::new(ManualClock::default()), 16).unwrap();
        PersistentTupleStore::new(table)
    }

    #[test]
    fn test_reopen_restores_rows_and_counts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store");
        {
            let mut store = open(&path);
            for i in 0..5 {
                store.put(&Value::from("k"), -2 + i as i32, row(i)).unwrap();
            }
            store.put(&Value::from("j"), i32::MIN, row(9)).unwrap();
            store.close().unwrap();
        }

        let mut store = open(&path);
        assert_eq!(store.len(), 6);
        let negative = Query::builder(Value::from("k")).time_key(TimeCondition::Lt, 0).build();
        assert_eq!(store.find(&negative).unwrap(), vec![row(0), row(1)]);
        assert_eq!(store.count(&Query::all(Value::from("j"))).unwrap(), 1);
        assert_eq!(store.find_and_remove(&Query::all(Value::from("k"))).unwrap().len(), 5);
        assert_eq!(store.len(), 1);
    }
}
