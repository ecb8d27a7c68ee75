//! Topology compiler tests.
//!
//! Builds topologies through the public builder and checks the physical
//! plan: repartition placement, unit split, links, field flow and the
//! explain output.

use std::sync::Arc;
use tributary_core::{FieldAccessor, Period, Schema};
use tributary_runtime::{
    CollectingSink, CompileError, EmitSpec, EngineConfig, GroupFields, Grouping, JoinKey,
    JoinSide, MemorySource, PhysicalPlan, Projection, SpoutSpec, Stream, Topology,
    TupleJoinSpec,
};
use tributary_runtime::topology::UnitRef;

// ==========================================================================
// Helpers
// ==========================================================================

fn source(schemas: Vec<Schema>) -> SpoutSpec {
    SpoutSpec::new(schemas, Arc::new(MemorySource::new()))
}

fn log_topology() -> (Topology, Stream) {
    let mut t = Topology::new("logs");
    let s = t.from_source(source(vec![Schema::new("log", vec!["id", "path"])]));
    (t, s)
}

fn grouped_plan() -> PhysicalPlan {
    let (mut t, s) = log_topology();
    let g = t.group_by(&s, GroupFields::of(&["id"])).unwrap();
    let e = t.each(&g, Projection::fields(&["path", "id"])).unwrap();
    t.emit(&e, EmitSpec::all(Arc::new(CollectingSink::new()))).unwrap();
    t.compile().unwrap()
}

fn operator(plan: &PhysicalPlan, prefix: &str) -> String {
    plan.operator_names()
        .into_iter()
        .find(|name| name.starts_with(prefix))
        .unwrap_or_else(|| panic!("no {} operator", prefix))
}

// ==========================================================================
// Unit Split
// ==========================================================================

#[test]
fn test_group_by_splits_at_partition() {
    let plan = grouped_plan();

    assert_eq!(plan.spout().name, "EXEC_SPOUT");
    assert_eq!(plan.spout().exits.len(), 1);
    assert_eq!(plan.units().len(), 1);
    assert_eq!(plan.units()[0].entries.len(), 1);

    let links = plan.links();
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].from, UnitRef::Spout);
    assert_eq!(links[0].to, 0);
    assert_eq!(links[0].grouping, Grouping::Fields(GroupFields::of(&["id"])));
    assert_eq!(plan.node(links[0].exit).id, plan.node(links[0].entry).id);

    let each = operator(&plan, "EACH");
    assert_eq!(
        plan.group_fields().get(&each).map(|g| g.to_string()),
        Some("id".to_string())
    );
}

#[test]
fn test_parallelism_changes_insert_repartitions() {
    let (mut t, s) = log_topology();
    let wide = t.each(&s, Projection::fields(&["id", "path"])).unwrap();
    let wide = t.set_parallelism(&wide, 4).unwrap();
    let narrow = t.each(&wide, Projection::fields(&["path"])).unwrap();
    let narrow = t.set_parallelism(&narrow, 1).unwrap();
    t.emit(&narrow, EmitSpec::all(Arc::new(CollectingSink::new()))).unwrap();
    let plan = t.compile().unwrap();

    let units = plan.units();
    assert_eq!(units.len(), 2);
    assert_eq!(units[0].grouping, Some(Grouping::Shuffle));
    assert_eq!(units[0].parallelism, 4);
    assert_eq!(units[1].grouping, Some(Grouping::Global));
    assert_eq!(units[1].parallelism, 1);

    let links = plan.links();
    assert_eq!(links.len(), 2);
    assert_eq!(links[1].from, UnitRef::Exec(0));
    assert_eq!(links[1].to, 1);
}

#[test]
fn test_default_parallelism_from_config() {
    let (t, s) = log_topology();
    let mut t = t.with_config(EngineConfig::default().with_default_parallelism(3));
    let e = t.each(&s, Projection::fields(&["id"])).unwrap();
    t.emit(&e, EmitSpec::all(Arc::new(CollectingSink::new()))).unwrap();
    let plan = t.compile().unwrap();

    assert_eq!(plan.units().len(), 1);
    assert_eq!(plan.units()[0].parallelism, 3);
    assert_eq!(plan.spout().parallelism, 1);
}

// ==========================================================================
// Field Flow
// ==========================================================================

#[test]
fn test_output_fields_follow_projection() {
    let plan = grouped_plan();
    let each = operator(&plan, "EACH");
    let fields = plan.fields_of(&each).unwrap();
    assert_eq!(fields.get("log"), Some(&vec!["path".to_string(), "id".to_string()]));
    assert_eq!(
        plan.layout(&each, "log").as_deref(),
        Some(&["path".to_string(), "id".to_string()][..])
    );
    assert!(plan.layout(&each, "other").is_none());
}

#[test]
fn test_duplicate_output_field_is_rejected() {
    let (mut t, s) = log_topology();
    t.each(&s, Projection::fields(&["id", "id"])).unwrap();
    match t.compile() {
        Err(CompileError::DuplicateField { field, .. }) => assert_eq!(field, "id"),
        other => panic!("unexpected: {:?}", other.map(|p| p.explain(false))),
    }
}

#[test]
fn test_join_outputs_single_tuple() {
    let mut t = Topology::new("orders");
    let s = t.from_source(source(vec![
        Schema::new("order", vec!["id", "item"]),
        Schema::new("payment", vec!["order_id", "amount"]),
    ]));
    let spec = TupleJoinSpec::new(
        vec![
            JoinSide::new(
                "order",
                JoinKey::Simple(FieldAccessor::new("id")),
                vec![FieldAccessor::new("item")],
            ),
            JoinSide::new(
                "payment",
                JoinKey::Simple(FieldAccessor::new("order_id")),
                vec![FieldAccessor::new("amount")],
            ),
        ],
        vec![
            FieldAccessor::qualified("order", "id"),
            FieldAccessor::qualified("order", "item"),
            FieldAccessor::qualified("payment", "amount"),
        ],
        Period::from_secs(60),
    )
    .to_tuple("paid");

    let joined = t
        .join(
            &[s.select(&["order"]).unwrap(), s.select(&["payment"]).unwrap()],
            spec,
        )
        .unwrap();
    assert_eq!(joined.selector(), Some(&["paid".to_string()][..]));
    t.emit(&joined, EmitSpec::all(Arc::new(CollectingSink::new()))).unwrap();
    let plan = t.compile().unwrap();

    let join = operator(&plan, "TUPLE_JOIN");
    let fields = plan.fields_of(&join).unwrap();
    assert_eq!(fields.len(), 1);
    assert_eq!(
        fields.get("paid"),
        Some(&vec!["id".to_string(), "item".to_string(), "amount".to_string()])
    );
    assert!(matches!(plan.links()[0].grouping, Grouping::Select(_)));
}

#[test]
fn test_join_needs_single_tuple_streams() {
    let mut t = Topology::new("orders");
    let s = t.from_source(source(vec![
        Schema::new("order", vec!["id"]),
        Schema::new("payment", vec!["id"]),
    ]));
    let spec = TupleJoinSpec::new(
        vec![
            JoinSide::new("order", JoinKey::Simple(FieldAccessor::new("id")), vec![]),
            JoinSide::new("payment", JoinKey::Simple(FieldAccessor::new("id")), vec![]),
        ],
        vec![],
        Period::from_secs(1),
    );
    assert!(matches!(
        t.join(&[s.clone()], spec),
        Err(CompileError::InvalidStream(_))
    ));
}

// ==========================================================================
// Explain
// ==========================================================================

#[test]
fn test_compile_is_deterministic() {
    let first = grouped_plan().explain(true);
    let second = grouped_plan().explain(true);
    assert_eq!(first, second);
}

#[test]
fn test_explain_sections() {
    let plan = grouped_plan();
    let short = plan.explain(false);
    assert!(short.starts_with("Explain:"));
    assert!(short.contains(" SPOUT_0(log) parallelism=1"));
    assert!(!short.contains("Components:"));

    let extended = plan.explain(true);
    assert!(extended.starts_with(&short));
    for header in [
        "Stream edges:",
        "Output fields:",
        "Group fields:",
        "Components:",
        "Topology:",
    ] {
        assert!(extended.contains(header), "missing {}", header);
    }
    assert!(extended.contains("\n EXEC_SPOUT\n  -PARTITION_"));
}

#[test]
fn test_two_sources_are_rejected() {
    let (mut t, _) = log_topology();
    t.from_source(source(vec![Schema::new("other", vec!["x"])]));
    assert!(matches!(t.compile(), Err(CompileError::InvalidGraph(_))));
}
