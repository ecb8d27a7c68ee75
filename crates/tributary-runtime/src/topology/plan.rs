//! Compiled plan handed to an execution substrate
//!
//! A plan has one source unit and any number of execution units. Each unit
//! is a set of operators that run together on one task; the substrate
//! starts `parallelism` tasks per unit and moves tuples between units
//! along the [`UnitLink`]s, choosing the receiving task with the link's
//! grouping.

use super::fields::{FieldFlow, TupleFields};
use super::graph::{Graph, Node, NodeIndex};
use crate::config::EngineConfig;
use crate::dispatch::Dispatcher;
use crate::grouping::{GroupFields, Grouping};
use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use std::fmt::Write;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitRef {
    Spout,
    Exec(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnitSpec {
    pub name: String,
    /// Grouping of the repartition stages feeding this unit. `None` for
    /// the source unit.
    pub grouping: Option<Grouping>,
    /// Where tuples enter: the source, or repartition entries.
    pub entries: Vec<NodeIndex>,
    /// Every operator of the unit, breadth-first from each entry.
    pub members: Vec<NodeIndex>,
    /// Repartition exits; tuples reaching one leave the unit.
    pub exits: Vec<NodeIndex>,
    pub parallelism: u32,
}

impl UnitSpec {
    pub(crate) fn new(name: &str, grouping: Option<Grouping>) -> Self {
        Self {
            name: name.to_string(),
            grouping,
            entries: Vec::new(),
            members: Vec::new(),
            exits: Vec::new(),
            parallelism: 0,
        }
    }
}

/// Unit-to-unit edge through one repartition stage.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitLink {
    pub from: UnitRef,
    pub exit: NodeIndex,
    /// Index into [`PhysicalPlan::units`].
    pub to: usize,
    pub entry: NodeIndex,
    pub grouping: Grouping,
}

#[derive(Debug, Clone)]
pub struct PhysicalPlan {
    pub(crate) topology: String,
    pub(crate) config: Arc<EngineConfig>,
    /// Graph after repartition insertion, before exits were split off.
    pub(crate) logical: Graph,
    pub(crate) graph: Graph,
    /// Every logical operator in id order.
    pub(crate) operators: Vec<NodeIndex>,
    pub(crate) output_fields: FieldFlow,
    pub(crate) layouts: FxHashMap<String, FxHashMap<String, Arc<[String]>>>,
    pub(crate) group_fields: IndexMap<String, GroupFields>,
    pub(crate) dispatchers: FxHashMap<NodeIndex, Dispatcher>,
    pub(crate) spout: UnitSpec,
    pub(crate) units: Vec<UnitSpec>,
    pub(crate) links: Vec<UnitLink>,
}

impl PhysicalPlan {
    pub(crate) fn layouts(flow: &FieldFlow) -> FxHashMap<String, FxHashMap<String, Arc<[String]>>> {
        flow.iter()
            .map(|(op, tuples)| {
                let shared = tuples
                    .iter()
                    .map(|(tuple, names)| (tuple.clone(), Arc::from(names.as_slice())))
                    .collect();
                (op.clone(), shared)
            })
            .collect()
    }

    pub fn topology(&self) -> &str {
        &self.topology
    }

    pub fn config(&self) -> &Arc<EngineConfig> {
        &self.config
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn node(&self, node: NodeIndex) -> &Node {
        &self.graph[node]
    }

    pub fn name_of(&self, node: NodeIndex) -> String {
        self.graph.name(node)
    }

    pub fn operators(&self) -> &[NodeIndex] {
        &self.operators
    }

    /// Operator names in id order.
    pub fn operator_names(&self) -> Vec<String> {
        self.operators.iter().map(|&n| self.graph.name(n)).collect()
    }

    pub fn output_fields(&self) -> &FieldFlow {
        &self.output_fields
    }

    pub fn fields_of(&self, operator: &str) -> Option<&TupleFields> {
        self.output_fields.get(operator)
    }

    /// Field names `operator` emits for `tuple_name`.
    pub fn layout(&self, operator: &str, tuple_name: &str) -> Option<Arc<[String]>> {
        self.layouts.get(operator)?.get(tuple_name).cloned()
    }

    pub fn group_fields(&self) -> &IndexMap<String, GroupFields> {
        &self.group_fields
    }

    pub fn dispatcher(&self, node: NodeIndex) -> Option<&Dispatcher> {
        self.dispatchers.get(&node)
    }

    pub fn spout(&self) -> &UnitSpec {
        &self.spout
    }

    pub fn units(&self) -> &[UnitSpec] {
        &self.units
    }

    pub fn unit(&self, unit: UnitRef) -> Option<&UnitSpec> {
        match unit {
            UnitRef::Spout => Some(&self.spout),
            UnitRef::Exec(i) => self.units.get(i),
        }
    }

    pub fn links(&self) -> &[UnitLink] {
        &self.links
    }

    pub fn link_from(&self, exit: NodeIndex) -> Option<&UnitLink> {
        self.links.iter().find(|l| l.exit == exit)
    }

    /// Operators and their edges after repartition insertion.
    pub fn explain_graph(&self) -> String {
        let mut out = String::from("Explain:");
        for &op in &self.operators {
            let node = &self.logical[op];
            let _ = write!(out, "\n {}", node);
            if !node.kind.is_partition() {
                let _ = write!(out, " parallelism={}", node.parallelism);
            }
            for edge in self.logical.outgoing(op) {
                let _ = write!(out, "\n  -{}-> {}", edge, self.logical.name(edge.target));
            }
        }
        out
    }

    pub fn explain_stream_edges(&self) -> String {
        let mut out = String::from("Stream edges:");
        let names = |nodes: Vec<NodeIndex>| {
            if nodes.is_empty() {
                "-".to_string()
            } else {
                nodes
                    .iter()
                    .map(|&n| self.logical.name(n))
                    .collect::<Vec<_>>()
                    .join(", ")
            }
        };
        for &op in &self.operators {
            let incoming = self.logical.incoming(op).map(|e| e.source).collect();
            let outgoing = self.logical.outgoing(op).map(|e| e.target).collect();
            let _ = write!(
                out,
                "\n {}\n  incoming: {}\n  outgoing: {}",
                self.logical.name(op),
                names(incoming),
                names(outgoing)
            );
        }
        out
    }

    pub fn explain_output_fields(&self) -> String {
        let mut out = String::from("Output fields:");
        for (op, tuples) in &self.output_fields {
            let entries: Vec<String> = tuples
                .iter()
                .map(|(tuple, names)| format!("{}=[{}]", tuple, names.join(", ")))
                .collect();
            let _ = write!(out, "\n {} {{{}}}", op, entries.join(", "));
        }
        out
    }

    pub fn explain_group_fields(&self) -> String {
        let mut out = String::from("Group fields:");
        for (op, fields) in &self.group_fields {
            let _ = write!(out, "\n {} {}", op, fields);
        }
        out
    }

    /// Units with the dispatcher of every member.
    pub fn explain_components(&self) -> String {
        let mut out = String::from("Components:");
        for unit in std::iter::once(&self.spout).chain(&self.units) {
            let _ = write!(out, "\n {} {{", unit.name);
            for &member in &unit.members {
                if let Some(dispatcher) = self.dispatchers.get(&member) {
                    let _ = write!(out, "\n  {} {}", self.graph.name(member), dispatcher);
                }
            }
            let _ = write!(out, "\n }} parallelism={}", unit.parallelism);
        }
        out
    }

    /// Unit-to-unit links.
    pub fn explain_topology(&self) -> String {
        let mut out = String::from("Topology:");
        let units = std::iter::once((UnitRef::Spout, &self.spout))
            .chain(self.units.iter().enumerate().map(|(i, u)| (UnitRef::Exec(i), u)));
        for (unit_ref, unit) in units {
            let _ = write!(out, "\n {}", unit.name);
            for link in self.links.iter().filter(|l| l.from == unit_ref) {
                let _ = write!(
                    out,
                    "\n  -{}-> {}",
                    self.graph.name(link.exit),
                    self.units[link.to].name
                );
            }
        }
        out
    }

    pub fn explain(&self, extended: bool) -> String {
        let mut out = self.explain_graph();
        if extended {
            for section in [
                self.explain_stream_edges(),
                self.explain_output_fields(),
                self.explain_group_fields(),
                self.explain_components(),
                self.explain_topology(),
            ] {
                out.push('\n');
                out.push_str(&section);
            }
        }
        out
    }
}
