//! Logical graph to physical plan
//!
//! Runs on a copy of the logical graph:
//!
//! 1. default parallelism, repartition nodes at the source and between
//!    stages whose parallelism differs with one side singular, final ids
//! 2. every repartition node split into an exit (upstream side) and an
//!    entry (downstream side)
//! 3. units collected from every zero-indegree node up to the next exits,
//!    dispatchers wired; units with equal groupings are shared
//! 4. exits linked to the unit their grouping feeds
//!
//! Field flow and group fields are computed between passes 1 and 2.

use super::fields;
use super::graph::{merge_selector, Graph, NodeIndex, StreamEdge};
use super::plan::{PhysicalPlan, UnitLink, UnitRef, UnitSpec};
use super::CompileError;
use crate::config::EngineConfig;
use crate::dispatch::{Dispatcher, Target, TupleNameFilter};
use crate::grouping::Grouping;
use crate::operator::{OperatorKind, SpoutSpec};
use indexmap::IndexMap;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;
use tracing::{debug, info};
use tributary_core::Schema;

pub const SPOUT_UNIT_NAME: &str = "EXEC_SPOUT";

pub fn compile(
    topology: &str,
    logical: &Graph,
    config: &EngineConfig,
) -> Result<PhysicalPlan, CompileError> {
    if logical.is_empty() {
        return Err(CompileError::NotRegistered("Topology"));
    }
    let spouts = logical
        .node_indices()
        .filter(|&n| logical[n].kind.is_spout())
        .count();
    if spouts != 1 {
        return Err(CompileError::InvalidGraph(format!(
            "a topology reads from exactly one source, found {}",
            spouts
        )));
    }
    info!("Compiling topology '{}' ({} operators)", topology, logical.len());

    let mut graph = logical.clone();
    let operators = phase1(&mut graph, config.default_parallelism.max(1));
    let repartitioned = graph.clone();

    let output_fields = fields::output_fields(&graph, &operators)?;
    let group_fields = fields::group_fields(&graph, &operators);

    phase2(&mut graph, &operators);
    let (spout, units, dispatchers) = phase3(&graph, &operators)?;
    let links = phase4(&graph, &spout, &units);

    let plan = PhysicalPlan {
        topology: topology.to_string(),
        config: Arc::new(config.clone()),
        logical: repartitioned,
        graph,
        operators,
        layouts: PhysicalPlan::layouts(&output_fields),
        output_fields,
        group_fields,
        dispatchers,
        spout,
        units,
        links,
    };
    info!("{}", plan.explain_graph());
    debug!("{}", plan.explain_output_fields());
    debug!("{}", plan.explain_components());
    info!("{}", plan.explain_topology());
    Ok(plan)
}

fn select_schemas<'a>(spec: &'a SpoutSpec, selector: Option<&[String]>) -> Vec<&'a Schema> {
    match selector {
        Some(selector) => selector
            .iter()
            .filter_map(|name| spec.schema(name))
            .collect(),
        None => spec.schemas.iter().collect(),
    }
}

fn is_boundary(kind: &OperatorKind) -> bool {
    kind.is_partition() || kind.is_merge()
}

/// Parallelism defaults and repartition insertion, then final ids in
/// breadth-first order.
fn phase1(graph: &mut Graph, default_parallelism: u32) -> Vec<NodeIndex> {
    for op in graph.bfs() {
        if graph[op].parallelism == 0 && !graph[op].kind.is_partition() {
            graph[op].parallelism = default_parallelism;
        }

        if let OperatorKind::Spout(spec) = &graph[op].kind {
            let spec = spec.clone();
            let edges: Vec<StreamEdge> = graph.outgoing(op).cloned().collect();
            let mut partition: Option<NodeIndex> = None;

            for edge in edges {
                let target = edge.target;
                if is_boundary(&graph[target].kind) {
                    // Keep the direct edge behind the shared repartition edge
                    if partition.is_some() {
                        graph.remove_edge(op, target);
                        graph.add_edge(edge);
                    }
                    continue;
                }

                match partition {
                    None => {
                        let schemas = select_schemas(&spec, edge.selector.as_deref());
                        let grouping = Grouping::for_schemas(&schemas);
                        let p = graph.add_node(OperatorKind::Partition(grouping), 0);
                        graph.add_edge(edge.redirect(op, p));
                        graph.add_edge(edge.redirect(p, target));
                        graph.remove_edge(op, target);
                        partition = Some(p);
                    }
                    Some(p) => {
                        let selector = graph.find_edge(op, p).and_then(|shared| {
                            merge_selector(shared.selector.as_deref(), edge.selector.as_deref())
                        });
                        let schemas = select_schemas(&spec, selector.as_deref());
                        let grouping = Grouping::for_schemas(&schemas);
                        if let Some(shared) = graph.find_edge_mut(op, p) {
                            shared.selector = selector;
                        }
                        graph[p].kind = OperatorKind::Partition(grouping);
                        graph.add_edge(edge.redirect(p, target));
                        graph.remove_edge(op, target);
                    }
                }
            }
        } else if !graph[op].kind.is_partition() {
            let edges: Vec<StreamEdge> = graph.outgoing(op).cloned().collect();
            for edge in edges {
                let target = edge.target;
                if graph[target].parallelism == 0 && !graph[target].kind.is_partition() {
                    graph[target].parallelism = default_parallelism;
                }
                let (from, to) = (graph[op].parallelism, graph[target].parallelism);
                if edge.is_grouped() || is_boundary(&graph[target].kind) || from == to {
                    continue;
                }
                let grouping = if to == 1 {
                    Grouping::Global
                } else if from == 1 {
                    Grouping::Shuffle
                } else {
                    continue;
                };
                let p = graph.add_node(OperatorKind::Partition(grouping), 0);
                graph.add_edge(edge.redirect(op, p));
                graph.add_edge(edge.redirect(p, target));
                graph.remove_edge(op, target);
            }
        }
    }

    let operators = graph.bfs();
    for (id, &op) in operators.iter().enumerate() {
        graph[op].id = id as u32;
    }
    operators
}

/// Moves the incoming edges of every repartition node onto a copy of it.
/// The copy ends the upstream unit; the original starts the downstream one.
fn phase2(graph: &mut Graph, operators: &[NodeIndex]) {
    for &op in operators {
        if !graph[op].kind.is_partition() {
            continue;
        }
        let exit = graph.duplicate_node(op);
        let edges: Vec<StreamEdge> = graph.incoming(op).cloned().collect();
        for edge in edges {
            graph.add_edge(edge.redirect(edge.source, exit));
            graph.remove_edge(edge.source, op);
        }
    }
}

type Units = (UnitSpec, Vec<UnitSpec>, FxHashMap<NodeIndex, Dispatcher>);

fn phase3(graph: &Graph, operators: &[NodeIndex]) -> Result<Units, CompileError> {
    let mut spout: Option<UnitSpec> = None;
    let mut units: Vec<UnitSpec> = Vec::new();
    let mut by_grouping: IndexMap<Grouping, usize> = IndexMap::new();
    let mut dispatchers = FxHashMap::default();

    for &op in operators {
        if graph.in_degree(op) != 0 {
            continue;
        }
        let unit = match &graph[op].kind {
            OperatorKind::Spout(_) => spout.get_or_insert_with(|| UnitSpec::new(SPOUT_UNIT_NAME, None)),
            OperatorKind::Partition(grouping) => {
                let index = match by_grouping.get(grouping) {
                    Some(&index) => index,
                    None => {
                        let index = units.len();
                        units.push(UnitSpec::new(
                            &format!("EXEC_BOLT_{}", index + 1),
                            Some(grouping.clone()),
                        ));
                        by_grouping.insert(grouping.clone(), index);
                        index
                    }
                };
                &mut units[index]
            }
            _ => {
                return Err(CompileError::InvalidGraph(format!(
                    "{} has no input",
                    graph.name(op)
                )))
            }
        };
        unit.entries.push(op);

        for member in graph.bfs_from(op) {
            if graph.out_degree(member) == 0 {
                if graph[member].kind.is_partition() {
                    unit.exits.push(member);
                }
            } else {
                dispatchers.insert(member, edges_to_dispatcher(graph, member));
            }
            unit.parallelism = unit.parallelism.max(graph[member].parallelism);
            if !unit.members.contains(&member) {
                unit.members.push(member);
            }
        }
    }

    let mut spout =
        spout.ok_or_else(|| CompileError::InvalidGraph("source is not a root".to_string()))?;
    for unit in std::iter::once(&mut spout).chain(units.iter_mut()) {
        unit.parallelism = unit.parallelism.max(1);
    }
    Ok((spout, units, dispatchers))
}

fn edge_to_dispatcher(graph: &Graph, op: NodeIndex, edge: &StreamEdge) -> Dispatcher {
    let target = Target {
        node: edge.target,
        name: graph.name(edge.target),
    };
    let dispatcher = match &edge.group_fields {
        Some(group_fields) => Dispatcher::Grouping {
            target,
            group_fields: group_fields.clone(),
        },
        None => Dispatcher::Single(target),
    };

    let Some(selector) = &edge.selector else {
        return dispatcher;
    };
    // Tuples that can reach `op` at all
    let mut reachable: Vec<&String> = Vec::new();
    for incoming in graph.incoming(op) {
        for tuple in incoming.selector.iter().flatten() {
            if !reachable.contains(&tuple) {
                reachable.push(tuple);
            }
        }
    }
    let same = reachable.len() == selector.iter().collect::<FxHashSet<_>>().len()
        && selector.iter().all(|t| reachable.contains(&t));
    if same {
        dispatcher
    } else {
        Dispatcher::Filter {
            filter: TupleNameFilter::new(selector.clone()),
            inner: Box::new(dispatcher),
        }
    }
}

fn edges_to_dispatcher(graph: &Graph, op: NodeIndex) -> Dispatcher {
    let edges: Vec<&StreamEdge> = graph.outgoing(op).collect();
    match edges.as_slice() {
        [single] => edge_to_dispatcher(graph, op, single),
        many => Dispatcher::Multi(
            many.iter()
                .map(|edge| edge_to_dispatcher(graph, op, edge))
                .collect(),
        ),
    }
}

/// Links every exit to the entry with the same id in the unit its
/// grouping feeds.
fn phase4(graph: &Graph, spout: &UnitSpec, units: &[UnitSpec]) -> Vec<UnitLink> {
    let from_units = std::iter::once((UnitRef::Spout, spout))
        .chain(units.iter().enumerate().map(|(i, u)| (UnitRef::Exec(i), u)));

    let mut links = Vec::new();
    for (from, unit) in from_units {
        for &exit in &unit.exits {
            let Some(grouping) = graph[exit].kind.grouping() else {
                continue;
            };
            let target = units
                .iter()
                .position(|u| u.grouping.as_ref() == Some(grouping));
            let Some(to) = target else {
                continue;
            };
            let entry = units[to]
                .entries
                .iter()
                .copied()
                .find(|&e| graph[e].id == graph[exit].id);
            if let Some(entry) = entry {
                links.push(UnitLink {
                    from,
                    exit,
                    to,
                    entry,
                    grouping: grouping.clone(),
                });
            }
        }
    }
    links
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::MemorySource;
    use crate::projection::Projection;

    fn spout_kind(partitioned: bool) -> OperatorKind {
        let mut schema = Schema::new("log", vec!["id", "v"]);
        if partitioned {
            schema = schema.with_partition_fields(vec!["id"]);
        }
        OperatorKind::Spout(SpoutSpec::new(vec![schema], Arc::new(MemorySource::new())))
    }

    fn each() -> OperatorKind {
        OperatorKind::Each(Projection::fields(&["id", "v"]))
    }

    #[test]
    fn test_source_edges_share_one_repartition() {
        let mut g = Graph::new();
        let s = g.add_node(spout_kind(true), 0);
        let a = g.add_node(each(), 0);
        let b = g.add_node(each(), 0);
        g.add_edge(StreamEdge::new(s, a, None));
        g.add_edge(StreamEdge::new(s, b, None));

        let operators = phase1(&mut g, 2);
        let names: Vec<String> = operators.iter().map(|&n| g.name(n)).collect();
        assert_eq!(names, vec!["SPOUT_0", "PARTITION_1", "EACH_2", "EACH_3"]);
        assert_eq!(g.out_degree(s), 1);
        let p = operators[1];
        assert_eq!(g.out_degree(p), 2);
        assert_eq!(
            g[p].kind.grouping(),
            Some(&Grouping::Fields(crate::grouping::GroupFields::of(&["id"])))
        );
        assert_eq!(g[a].parallelism, 2);
        assert_eq!(g[p].parallelism, 0);
    }

    #[test]
    fn test_parallelism_change_inserts_repartition() {
        let mut g = Graph::new();
        let s = g.add_node(spout_kind(false), 0);
        let wide = g.add_node(each(), 4);
        let narrow = g.add_node(each(), 1);
        let wider = g.add_node(each(), 3);
        g.add_edge(StreamEdge::new(s, wide, None));
        g.add_edge(StreamEdge::new(wide, narrow, None));
        g.add_edge(StreamEdge::new(narrow, wider, None));

        let operators = phase1(&mut g, 1);
        let partitions: Vec<&Grouping> = operators
            .iter()
            .filter_map(|&n| g[n].kind.grouping())
            .collect();
        assert_eq!(
            partitions,
            vec![&Grouping::Shuffle, &Grouping::Global, &Grouping::Shuffle]
        );
        assert!(g.find_edge(wide, narrow).is_none());
    }

    #[test]
    fn test_equal_parallelism_stays_direct() {
        let mut g = Graph::new();
        let s = g.add_node(spout_kind(false), 0);
        let a = g.add_node(each(), 3);
        let b = g.add_node(each(), 3);
        let c = g.add_node(each(), 2);
        g.add_edge(StreamEdge::new(s, a, None));
        g.add_edge(StreamEdge::new(a, b, None));
        g.add_edge(StreamEdge::new(b, c, None));
        phase1(&mut g, 1);
        assert!(g.find_edge(a, b).is_some());
        // Neither side singular
        assert!(g.find_edge(b, c).is_some());
    }

    #[test]
    fn test_partition_split_and_units() {
        let mut g = Graph::new();
        let s = g.add_node(spout_kind(false), 0);
        let a = g.add_node(each(), 2);
        let b = g.add_node(each(), 1);
        g.add_edge(StreamEdge::new(s, a, None));
        g.add_edge(StreamEdge::new(a, b, None));

        let operators = phase1(&mut g, 1);
        phase2(&mut g, &operators);
        let (spout, units, dispatchers) = phase3(&g, &operators).unwrap();

        assert_eq!(spout.members.len(), 2);
        assert_eq!(spout.exits.len(), 1);
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].name, "EXEC_BOLT_1");
        assert_eq!(units[0].parallelism, 2);
        assert_eq!(units[1].grouping, Some(Grouping::Global));
        assert_eq!(units[1].parallelism, 1);
        assert!(dispatchers.contains_key(&s));
        assert!(!dispatchers.contains_key(&b));

        let links = phase4(&g, &spout, &units);
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].from, UnitRef::Spout);
        assert_eq!(links[0].to, 0);
        assert_eq!(links[1].from, UnitRef::Exec(0));
        assert_eq!(g[links[1].exit].id, g[links[1].entry].id);
    }

    #[test]
    fn test_partial_selector_gets_filter() {
        let mut g = Graph::new();
        let s = g.add_node(spout_kind(false), 0);
        let m = g.add_node(OperatorKind::Merge, 0);
        g.add_edge(StreamEdge::new(s, m, Some(vec!["log".to_string()])));
        let d = edge_to_dispatcher(&g, s, g.find_edge(s, m).unwrap());
        assert!(matches!(d, Dispatcher::Filter { .. }));

        let e = g.add_node(each(), 0);
        g.add_edge(StreamEdge::new(m, e, Some(vec!["log".to_string()])));
        let d = edge_to_dispatcher(&g, m, g.find_edge(m, e).unwrap());
        assert!(matches!(d, Dispatcher::Single(_)));
    }
}
