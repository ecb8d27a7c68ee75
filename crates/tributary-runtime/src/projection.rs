//! Output column lists shared by the map, window and sink operators

use crate::aggregate::{AggregateSpec, IncrementalAggregate};
use indexmap::IndexMap;
use std::fmt;
use tributary_core::{FieldAccessor, Tuple, Value};

/// One declared output column.
#[derive(Debug, Clone, PartialEq)]
pub enum ProjectionItem {
    /// A field read from the input tuple. `*` and `t.*` expand to every
    /// input value (the latter only for tuples named `t`).
    Field(FieldAccessor),
    Aggregate(AggregateSpec),
    Literal { value: Value, name: String },
}

impl ProjectionItem {
    pub fn field(name: &str) -> Self {
        ProjectionItem::Field(FieldAccessor::new(name))
    }

    pub fn literal(value: impl Into<Value>, name: impl Into<String>) -> Self {
        ProjectionItem::Literal {
            value: value.into(),
            name: name.into(),
        }
    }

    pub fn output_field(&self) -> OutputField {
        match self {
            ProjectionItem::Field(f) => OutputField::Accessor(f.clone()),
            ProjectionItem::Aggregate(a) => OutputField::Named(a.output_name()),
            ProjectionItem::Literal { name, .. } => OutputField::Named(name.clone()),
        }
    }
}

impl From<FieldAccessor> for ProjectionItem {
    fn from(f: FieldAccessor) -> Self {
        ProjectionItem::Field(f)
    }
}

impl From<AggregateSpec> for ProjectionItem {
    fn from(a: AggregateSpec) -> Self {
        ProjectionItem::Aggregate(a)
    }
}

impl fmt::Display for ProjectionItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProjectionItem::Field(field) => write!(f, "{}", field),
            ProjectionItem::Aggregate(agg) => write!(f, "{}", agg),
            ProjectionItem::Literal { value, name } => write!(f, "{} AS {}", value, name),
        }
    }
}

/// A declared output column as seen by the field-flow computation.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputField {
    Accessor(FieldAccessor),
    /// Computed column (aggregate or literal) known only by its name.
    Named(String),
}

impl OutputField {
    pub fn name(&self) -> &str {
        match self {
            OutputField::Accessor(f) => f.name(),
            OutputField::Named(n) => n,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Projection {
    items: Vec<ProjectionItem>,
}

impl Projection {
    pub fn new(items: Vec<ProjectionItem>) -> Self {
        Self { items }
    }

    pub fn fields(names: &[&str]) -> Self {
        Self::new(names.iter().map(|n| ProjectionItem::field(n)).collect())
    }

    pub fn items(&self) -> &[ProjectionItem] {
        &self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn aggregate_specs(&self) -> impl Iterator<Item = &AggregateSpec> {
        self.items.iter().filter_map(|item| match item {
            ProjectionItem::Aggregate(a) => Some(a),
            _ => None,
        })
    }

    pub fn has_aggregates(&self) -> bool {
        self.aggregate_specs().next().is_some()
    }

    /// Fresh state for every aggregate column, in declaration order.
    pub fn create_aggregates(&self) -> Vec<Box<dyn IncrementalAggregate>> {
        self.aggregate_specs().map(AggregateSpec::create).collect()
    }

    /// The input value of every aggregate column for `tuple`.
    pub fn aggregate_inputs(&self, tuple: &Tuple, context: &IndexMap<String, Value>) -> Vec<Value> {
        self.aggregate_specs()
            .map(|spec| match &spec.field {
                Some(field) => field.value_in(tuple, context),
                None => Value::Null,
            })
            .collect()
    }

    /// Builds the output row. `aggregates` holds the current value of each
    /// aggregate column in declaration order.
    pub fn project(
        &self,
        tuple: &Tuple,
        context: &IndexMap<String, Value>,
        aggregates: &[Value],
    ) -> Vec<Value> {
        let mut row = Vec::with_capacity(self.items.len());
        let mut next_aggregate = aggregates.iter();
        for item in &self.items {
            match item {
                ProjectionItem::Field(field) if field.is_wildcard() => {
                    let in_scope = field
                        .tuple_name()
                        .map_or(true, |t| t == tuple.tuple_name());
                    if in_scope {
                        row.extend_from_slice(tuple.values());
                    }
                }
                ProjectionItem::Field(field) => row.push(field.value_in(tuple, context)),
                ProjectionItem::Aggregate(_) => {
                    row.push(next_aggregate.next().cloned().unwrap_or(Value::Null))
                }
                ProjectionItem::Literal { value, .. } => row.push(value.clone()),
            }
        }
        row
    }

    pub fn output_fields(&self) -> Vec<OutputField> {
        self.items.iter().map(ProjectionItem::output_field).collect()
    }
}

impl fmt::Display for Projection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, item) in self.items.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", item)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::AggregateKind;

    fn tuple() -> Tuple {
        Tuple::from_pairs(
            "access",
            vec![("id", Value::Int(1)), ("path", Value::from("/"))],
        )
    }

    #[test]
    fn test_project_fields_and_aliases() {
        let p = Projection::new(vec![
            FieldAccessor::new("path").alias("p").into(),
            ProjectionItem::field("id"),
            ProjectionItem::literal(true, "flag"),
        ]);
        let row = p.project(&tuple(), &IndexMap::new(), &[]);
        assert_eq!(row, vec![Value::from("/"), Value::Int(1), Value::Bool(true)]);
        let names: Vec<String> = p.output_fields().iter().map(|f| f.name().to_string()).collect();
        assert_eq!(names, vec!["p", "id", "flag"]);
    }

    #[test]
    fn test_wildcards() {
        let p = Projection::new(vec![FieldAccessor::wildcard().into()]);
        assert_eq!(p.project(&tuple(), &IndexMap::new(), &[]).len(), 2);

        let scoped = Projection::new(vec![FieldAccessor::qualified("other", "*").into()]);
        assert!(scoped.project(&tuple(), &IndexMap::new(), &[]).is_empty());

        let scoped = Projection::new(vec![FieldAccessor::qualified("access", "*").into()]);
        assert_eq!(scoped.project(&tuple(), &IndexMap::new(), &[]).len(), 2);
    }

    #[test]
    fn test_context_and_aggregates() {
        let p = Projection::new(vec![
            FieldAccessor::context("task_index").into(),
            AggregateSpec::new(AggregateKind::Sum, FieldAccessor::new("id"))
                .alias("total")
                .into(),
        ]);
        let mut ctx = IndexMap::new();
        ctx.insert("task_index".to_string(), Value::Int(3));

        assert_eq!(p.aggregate_inputs(&tuple(), &ctx), vec![Value::Int(1)]);
        let row = p.project(&tuple(), &ctx, &[Value::Int(42)]);
        assert_eq!(row, vec![Value::Int(3), Value::Int(42)]);
        assert!(p.has_aggregates());
        assert_eq!(p.create_aggregates().len(), 1);
    }
}
