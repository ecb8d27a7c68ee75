//! Field flow
//!
//! For every operator, the ordered output field names of each tuple name
//! it emits. Computed in topological order: an operator's input is the
//! union of its upstream outputs, narrowed by each edge's selector.
//!
//! - source: one entry per schema
//! - join: a single entry named after the joined tuple
//! - rename: the renamed tuple keeps its fields
//! - operators declaring output columns: those columns, per input tuple
//! - everything else passes its input through

use super::graph::{Graph, NodeIndex};
use super::CompileError;
use crate::grouping::GroupFields;
use crate::operator::{OperatorKind, TupleJoinSpec};
use crate::projection::OutputField;
use indexmap::IndexMap;
use tributary_core::FieldAccessor;

/// Tuple name to field names.
pub type TupleFields = IndexMap<String, Vec<String>>;

/// Operator name to its output fields.
pub type FieldFlow = IndexMap<String, TupleFields>;

pub fn output_fields(graph: &Graph, operators: &[NodeIndex]) -> Result<FieldFlow, CompileError> {
    let order = graph
        .topological_order()
        .ok_or_else(|| CompileError::InvalidGraph("operator graph has a cycle".to_string()))?;
    let mut flow = FieldFlow::new();

    for node in order {
        let name = graph.name(node);
        let out = match &graph[node].kind {
            OperatorKind::Spout(spec) => spec
                .schemas
                .iter()
                .map(|s| (s.name.clone(), s.fields.clone()))
                .collect(),
            OperatorKind::TupleJoin(spec) => {
                let input = input_fields(graph, node, &flow)?;
                join_fields(&name, spec, &input)?
            }
            OperatorKind::Rename(spec) => {
                let input = input_fields(graph, node, &flow)?;
                let fields = input.get(&spec.from).cloned().ok_or_else(|| {
                    CompileError::InvalidGraph(format!(
                        "{} renames unknown tuple '{}'",
                        name, spec.from
                    ))
                })?;
                let mut out = TupleFields::new();
                out.insert(spec.to.clone(), fields);
                out
            }
            kind => {
                let input = input_fields(graph, node, &flow)?;
                match kind.declared_fields() {
                    Some(declared) => declared_fields(&name, &declared, &input)?,
                    None => input,
                }
            }
        };
        flow.insert(name, out);
    }

    // Keep the compiler's operator order for display
    let mut ordered = FieldFlow::with_capacity(flow.len());
    for node in operators {
        let name = graph.name(*node);
        if let Some(fields) = flow.swap_remove(&name) {
            ordered.insert(name, fields);
        }
    }
    ordered.extend(flow);
    Ok(ordered)
}

/// Group fields of every operator fed by a grouped edge.
pub fn group_fields(graph: &Graph, operators: &[NodeIndex]) -> IndexMap<String, GroupFields> {
    operators
        .iter()
        .filter_map(|&node| {
            let edge = graph.incoming(node).next()?;
            let fields = edge.group_fields.clone()?;
            Some((graph.name(node), fields))
        })
        .collect()
}

fn input_fields(graph: &Graph, node: NodeIndex, flow: &FieldFlow) -> Result<TupleFields, CompileError> {
    let mut input = TupleFields::new();
    for edge in graph.incoming(node) {
        let source = graph.name(edge.source);
        let Some(upstream) = flow.get(&source) else {
            return Err(CompileError::InvalidGraph(format!(
                "{} has no field flow",
                source
            )));
        };
        match &edge.selector {
            Some(selector) => {
                for tuple in selector {
                    let fields = upstream.get(tuple).cloned().ok_or_else(|| {
                        CompileError::InvalidGraph(format!(
                            "tuple '{}' does not reach {} from {}",
                            tuple,
                            graph.name(node),
                            source
                        ))
                    })?;
                    input.insert(tuple.clone(), fields);
                }
            }
            None => input.extend(upstream.iter().map(|(k, v)| (k.clone(), v.clone()))),
        }
    }
    Ok(input)
}

fn push_unique(operator: &str, names: &mut Vec<String>, name: &str) -> Result<(), CompileError> {
    if names.iter().any(|n| n == name) {
        return Err(CompileError::DuplicateField {
            operator: operator.to_string(),
            field: name.to_string(),
        });
    }
    names.push(name.to_string());
    Ok(())
}

fn declared_fields(
    operator: &str,
    declared: &[OutputField],
    input: &TupleFields,
) -> Result<TupleFields, CompileError> {
    let mut out = TupleFields::new();
    for (tuple, input_names) in input {
        let mut names = Vec::new();
        for field in declared {
            match field {
                OutputField::Accessor(f) if f.is_wildcard() => {
                    // `t.*` only expands for tuples named `t`
                    if f.tuple_name().map_or(true, |t| t == tuple) {
                        for name in input_names {
                            push_unique(operator, &mut names, name)?;
                        }
                    }
                }
                OutputField::Accessor(f) if f.tuple_name().is_some() => {
                    return Err(CompileError::TupleAccessor {
                        operator: operator.to_string(),
                    });
                }
                other => push_unique(operator, &mut names, other.name())?,
            }
        }
        out.insert(tuple.clone(), names);
    }
    Ok(out)
}

fn join_fields(
    operator: &str,
    spec: &TupleJoinSpec,
    input: &TupleFields,
) -> Result<TupleFields, CompileError> {
    let selected: Vec<&FieldAccessor> = if spec.context.to_fields().is_empty() {
        spec.context
            .sides()
            .iter()
            .flat_map(|side| side.fields())
            .collect()
    } else {
        spec.context.to_fields().iter().collect()
    };

    let mut names = Vec::new();
    for field in selected {
        if field.is_wildcard() {
            let tuple = field.tuple_name().unwrap_or_default();
            let fields = input.get(tuple).ok_or_else(|| {
                CompileError::InvalidGraph(format!(
                    "{} joins unknown tuple '{}'",
                    operator, tuple
                ))
            })?;
            for name in fields {
                push_unique(operator, &mut names, name)?;
            }
        } else {
            push_unique(operator, &mut names, field.name())?;
        }
    }

    let mut out = TupleFields::new();
    out.insert(spec.output_tuple_name().to_string(), names);
    Ok(out)
}
