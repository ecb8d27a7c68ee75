//! End-to-end pipeline tests.
//!
//! Topologies run on a [`LocalCluster`] from a [`MemorySource`] to a
//! [`CollectingSink`]; time-driven operators are driven directly with a
//! manual clock.

use proptest::prelude::*;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tributary_core::{FieldAccessor, ManualClock, Period, Schema, Tuple, TupleValues, Value};
use tributary_runtime::operator::{FilterGroupOperator, LimitOperator, TupleJoinOperator};
use tributary_runtime::{
    AggregateKind, AggregateSpec, CollectingSink, Collector, Condition, EmitSpec, ExecOperator,
    FilterGroupSpec, GroupFields, JoinKey, JoinMode, JoinSide, LimitInterval, LimitSpec,
    LocalCluster, MemorySource, OperatorContext, Projection, ProjectionItem, SlideSpec,
    SpoutSpec, Topology, TupleJoinSpec,
};

// ==========================================================================
// Helpers
// ==========================================================================

/// Engine logs for failing runs, e.g. `RUST_LOG=tributary_runtime=debug`.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn wait_for(sink: &CollectingSink, n: usize) -> Vec<TupleValues> {
    let deadline = Instant::now() + Duration::from_secs(10);
    while sink.written().len() < n && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    sink.written()
}

fn ints(values: &[i64]) -> Vec<Value> {
    values.iter().map(|&v| Value::Int(v)).collect()
}

// ==========================================================================
// Sliding Aggregation
// ==========================================================================

#[test]
fn test_grouped_count_slide_sums_per_key() {
    init_tracing();
    let source = MemorySource::new();
    let sink = CollectingSink::new();
    let mut t = Topology::new("slide");
    let s = t.from_source(SpoutSpec::new(
        vec![Schema::new("ev", vec!["id", "n"])],
        Arc::new(source.clone()),
    ));
    let g = t.group_by(&s, GroupFields::of(&["id"])).unwrap();
    let projection = Projection::new(vec![
        ProjectionItem::field("id"),
        AggregateSpec::new(AggregateKind::Sum, FieldAccessor::new("n"))
            .alias("total")
            .into(),
    ]);
    let w = t.slide(&g, SlideSpec::count(3, projection)).unwrap();
    t.emit(&w, EmitSpec::all(Arc::new(sink.clone()))).unwrap();

    let mut cluster = LocalCluster::new().unwrap();
    cluster.start(t.compile().unwrap()).unwrap();
    for n in 1..=5 {
        source.push("ev", ints(&[1, n]));
        source.push("ev", ints(&[2, n * 10]));
    }
    let written = wait_for(&sink, 10);
    cluster.shutdown();

    let totals = |id: i64| -> Vec<Value> {
        written
            .iter()
            .filter(|t| t.values[0] == Value::Int(id))
            .map(|t| t.values[1].clone())
            .collect()
    };
    assert_eq!(totals(1), ints(&[1, 3, 6, 9, 12]));
    assert_eq!(totals(2), ints(&[10, 30, 60, 90, 120]));
    assert_eq!(
        sink.output_fields().get("ev"),
        Some(&vec!["id".to_string(), "total".to_string()])
    );
}

// ==========================================================================
// Multi-Stream Join
// ==========================================================================

fn pair_join() -> TupleJoinSpec {
    TupleJoinSpec::new(
        vec![
            JoinSide::new(
                "c",
                JoinKey::Simple(FieldAccessor::new("k")),
                vec![FieldAccessor::new("a")],
            ),
            JoinSide::new(
                "d",
                JoinKey::Simple(FieldAccessor::new("k")),
                vec![FieldAccessor::new("b")],
            ),
        ],
        vec![
            FieldAccessor::qualified("c", "a"),
            FieldAccessor::qualified("d", "b"),
        ],
        Period::from_secs(60),
    )
    .to_tuple("j")
}

#[test]
fn test_two_way_join_emits_once_per_match() {
    init_tracing();
    let source = MemorySource::new();
    let sink = CollectingSink::new();
    let mut t = Topology::new("join");
    let s = t.from_source(SpoutSpec::new(
        vec![Schema::new("c", vec!["k", "a"]), Schema::new("d", vec!["k", "b"])],
        Arc::new(source.clone()),
    ));
    let j = t
        .join(
            &[s.select(&["c"]).unwrap(), s.select(&["d"]).unwrap()],
            pair_join(),
        )
        .unwrap();
    t.emit(&j, EmitSpec::all(Arc::new(sink.clone()))).unwrap();

    let mut cluster = LocalCluster::new().unwrap();
    cluster.start(t.compile().unwrap()).unwrap();
    source.push("c", vec![Value::from("k1"), Value::Int(1)]);
    source.push("d", vec![Value::from("k1"), Value::Int(2)]);
    // Left side only; nothing to pair with until the next right row
    source.push("c", vec![Value::from("k1"), Value::Int(3)]);
    source.push("d", vec![Value::from("k2"), Value::Int(9)]);
    source.push("d", vec![Value::from("k1"), Value::Int(4)]);
    let written = wait_for(&sink, 2);
    cluster.shutdown();

    assert_eq!(
        written,
        vec![
            TupleValues::new("j", ints(&[1, 2])),
            TupleValues::new("j", ints(&[3, 4])),
        ]
    );
    assert_eq!(source.acked().len(), 5);
}

// ==========================================================================
// Condition Groups
// ==========================================================================

#[test]
fn test_filter_group_lapses_after_expire() {
    let clock = ManualClock::at_secs(0);
    let mut op = FilterGroupOperator::new(FilterGroupSpec::new(
        Period::from_secs(10),
        vec![Condition::eq("kind", "A"), Condition::eq("kind", "B")],
    ));
    let ctx = OperatorContext::detached("FILTER_GROUP_1").with_clock(Arc::new(clock.clone()));
    op.prepare(&ctx).unwrap();
    let event = |kind: &str| Tuple::from_pairs("ev", vec![("kind", Value::from(kind))]);
    let mut out = Collector::new();

    op.execute(event("A"), &mut out).unwrap();
    clock.set_secs(5);
    op.execute(event("B"), &mut out).unwrap();
    assert_eq!(out.take().len(), 1);

    // B alone, then A past B's deadline
    op.execute(event("B"), &mut out).unwrap();
    clock.set_secs(16);
    op.execute(event("A"), &mut out).unwrap();
    assert!(out.is_empty());

    clock.set_secs(20);
    op.execute(event("B"), &mut out).unwrap();
    assert_eq!(out.take()[0].values, vec![Value::from("B")]);
    op.cleanup();
}

// ==========================================================================
// Properties
// ==========================================================================

fn limited(spec: LimitSpec, inputs: i64) -> usize {
    let mut op = LimitOperator::new(spec);
    op.prepare(&OperatorContext::detached("LIMIT_1")).unwrap();
    let mut out = Collector::new();
    for n in 0..inputs {
        op.execute(Tuple::from_pairs("t", vec![("n", Value::Int(n))]), &mut out)
            .unwrap();
    }
    out.len()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_limit_count_emits_once_per_interval(n in 1usize..8, inputs in 0i64..50) {
        let m = inputs as usize;
        prop_assert_eq!(limited(LimitSpec::first(LimitInterval::Count(n)), inputs), (m + n - 1) / n);
        prop_assert_eq!(limited(LimitSpec::last(LimitInterval::Count(n)), inputs), m / n);
    }

    #[test]
    fn prop_join_consumes_matched_rows(sides in proptest::collection::vec(any::<bool>(), 0..30)) {
        for mode in [JoinMode::Cached, JoinMode::Grouped] {
            let mut op = TupleJoinOperator::new(pair_join().mode(mode));
            op.prepare(&OperatorContext::detached("TUPLE_JOIN_1")).unwrap();
            let mut out = Collector::new();
            let (mut left, mut right, mut expected) = (0usize, 0usize, 0usize);

            for (i, &is_left) in sides.iter().enumerate() {
                let tuple = if is_left {
                    left += 1;
                    Tuple::from_pairs("c", vec![("k", Value::Int(7)), ("a", Value::Int(i as i64))])
                } else {
                    right += 1;
                    Tuple::from_pairs("d", vec![("k", Value::Int(7)), ("b", Value::Int(i as i64))])
                };
                op.execute(tuple, &mut out).unwrap();
                if left > 0 && right > 0 {
                    expected += left * right;
                    left = 0;
                    right = 0;
                }
            }
            prop_assert_eq!(out.len(), expected);
            op.cleanup();
        }
    }
}
