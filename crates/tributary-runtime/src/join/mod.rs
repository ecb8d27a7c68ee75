//! Multi-stream equi-join
//!
//! A join has two or more sides, one per input tuple name. Each side keeps
//! a subset of its tuple's fields (the key fields are always kept) and is
//! buffered per join key. When every side holds at least one row for a
//! key, all buffered rows of that key are taken at once and their cross
//! product is emitted in side order.
//!
//! ```text
//! sides:   a(id, x)   b(id, y)         key: id
//! slots:   a:id a:x   b:id b:y
//! output:  to_fields selected from the slots by name
//! ```
//!
//! Buffered rows expire after the join's TTL; see [`state`] for the two
//! buffering modes.

pub mod state;

pub use state::{open_join_state, CachedJoinState, GroupedJoinState, JoinMode, JoinState};

use crate::store::Row;
use std::fmt;
use tributary_core::{FieldAccessor, Tuple, Value};

/// Join key of one side.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum JoinKey {
    Simple(FieldAccessor),
    /// Several fields compared together; the key value is an array.
    Complex(Vec<FieldAccessor>),
}

impl JoinKey {
    pub fn fields(&self) -> Vec<&FieldAccessor> {
        match self {
            JoinKey::Simple(f) => vec![f],
            JoinKey::Complex(fs) => fs.iter().collect(),
        }
    }

    fn in_tuple(self, tuple: &str) -> Self {
        match self {
            JoinKey::Simple(f) => JoinKey::Simple(f.in_tuple(tuple)),
            JoinKey::Complex(fs) => {
                JoinKey::Complex(fs.into_iter().map(|f| f.in_tuple(tuple)).collect())
            }
        }
    }

    /// Key of `tuple`, or `None` when any key field is null.
    pub fn value(&self, tuple: &Tuple) -> Option<Value> {
        match self {
            JoinKey::Simple(f) => Some(f.value(tuple)).filter(|v| !v.is_null()),
            JoinKey::Complex(fs) => {
                let values: Vec<Value> = fs.iter().map(|f| f.value(tuple)).collect();
                if values.iter().any(Value::is_null) {
                    None
                } else {
                    Some(Value::Array(values))
                }
            }
        }
    }
}

impl fmt::Display for JoinKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinKey::Simple(field) => write!(f, "{}", field),
            JoinKey::Complex(fields) => {
                write!(f, "(")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", field)?;
                }
                write!(f, ")")
            }
        }
    }
}

/// One input of a join.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinSide {
    tuple_name: String,
    key: JoinKey,
    fields: Vec<FieldAccessor>,
}

impl JoinSide {
    /// Unqualified fields and key fields are taken from `tuple_name`. Key
    /// fields missing from `fields` are appended.
    pub fn new(tuple_name: impl Into<String>, key: JoinKey, fields: Vec<FieldAccessor>) -> Self {
        let tuple_name = tuple_name.into();
        let key = key.in_tuple(&tuple_name);
        let mut fields: Vec<FieldAccessor> =
            fields.into_iter().map(|f| f.in_tuple(&tuple_name)).collect();
        for key_field in key.fields() {
            let plain = key_field.unaliased();
            if !fields.iter().any(|f| f.unaliased() == plain) {
                fields.push(plain);
            }
        }
        Self {
            tuple_name,
            key,
            fields,
        }
    }

    pub fn tuple_name(&self) -> &str {
        &self.tuple_name
    }

    pub fn key(&self) -> &JoinKey {
        &self.key
    }

    pub fn fields(&self) -> &[FieldAccessor] {
        &self.fields
    }

    /// Retained values of `tuple`. A wildcard occupies one slot holding
    /// every value of the tuple as an array.
    pub fn values(&self, tuple: &Tuple) -> Row {
        self.fields
            .iter()
            .map(|f| {
                if f.is_wildcard() {
                    Value::Array(tuple.values().to_vec())
                } else {
                    f.value(tuple)
                }
            })
            .collect()
    }
}

impl fmt::Display for JoinSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.tuple_name)?;
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", field.name())?;
        }
        write!(f, ") ON {}", self.key)
    }
}

/// Position of one selected output column among the combined slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Selected {
    Slot(usize),
    /// A wildcard slot, spread into the output.
    Spread(usize),
    Missing,
}

/// The slots of all sides and the output selection over them.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinContext {
    sides: Vec<JoinSide>,
    to_fields: Vec<FieldAccessor>,
    selection: Vec<Selected>,
}

impl JoinContext {
    /// `to_fields` picks output columns by field; an empty list keeps
    /// every slot.
    pub fn new(sides: Vec<JoinSide>, to_fields: Vec<FieldAccessor>) -> Self {
        let slots: Vec<&FieldAccessor> = sides.iter().flat_map(|s| s.fields.iter()).collect();
        let selection = if to_fields.is_empty() {
            slots
                .iter()
                .enumerate()
                .map(|(i, f)| {
                    if f.is_wildcard() {
                        Selected::Spread(i)
                    } else {
                        Selected::Slot(i)
                    }
                })
                .collect()
        } else {
            to_fields
                .iter()
                .map(|to| {
                    let wanted = to.unaliased();
                    match slots.iter().position(|s| s.unaliased() == wanted) {
                        Some(i) if slots[i].is_wildcard() => Selected::Spread(i),
                        Some(i) => Selected::Slot(i),
                        None => Selected::Missing,
                    }
                })
                .collect()
        };
        Self {
            sides,
            to_fields,
            selection,
        }
    }

    pub fn sides(&self) -> &[JoinSide] {
        &self.sides
    }

    pub fn to_fields(&self) -> &[FieldAccessor] {
        &self.to_fields
    }

    pub fn side_of(&self, tuple_name: &str) -> Option<usize> {
        self.sides.iter().position(|s| s.tuple_name == tuple_name)
    }

    /// Every slot as `tuple:field`, in side order.
    pub fn slot_names(&self) -> Vec<String> {
        self.sides
            .iter()
            .flat_map(|s| {
                s.fields
                    .iter()
                    .map(move |f| format!("{}:{}", s.tuple_name, f.original_name()))
            })
            .collect()
    }

    /// Every combination of one row per side, concatenated in side order.
    pub fn cross_product(&self, per_side: &[Vec<Row>]) -> Vec<Row> {
        let mut combined = vec![Vec::new()];
        for rows in per_side {
            let mut next = Vec::with_capacity(combined.len() * rows.len());
            for prefix in &combined {
                for row in rows {
                    let mut joined = prefix.clone();
                    joined.extend(row.iter().cloned());
                    next.push(joined);
                }
            }
            combined = next;
        }
        combined
    }

    /// Output values of one combined row.
    pub fn select(&self, combined: &[Value]) -> Vec<Value> {
        let mut out = Vec::with_capacity(self.selection.len());
        for selected in &self.selection {
            match *selected {
                Selected::Slot(i) => out.push(combined.get(i).cloned().unwrap_or(Value::Null)),
                Selected::Spread(i) => match combined.get(i) {
                    Some(Value::Array(values)) => out.extend(values.iter().cloned()),
                    Some(other) => out.push(other.clone()),
                    None => {}
                },
                Selected::Missing => out.push(Value::Null),
            }
        }
        out
    }
}

impl fmt::Display for JoinContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, side) in self.sides.iter().enumerate() {
            if i > 0 {
                write!(f, " JOIN ")?;
            }
            write!(f, "{}", side)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(to: Vec<FieldAccessor>) -> JoinContext {
        JoinContext::new(
            vec![
                JoinSide::new(
                    "a",
                    JoinKey::Simple(FieldAccessor::new("id")),
                    vec![FieldAccessor::new("x")],
                ),
                JoinSide::new(
                    "b",
                    JoinKey::Simple(FieldAccessor::new("id")),
                    vec![FieldAccessor::new("id"), FieldAccessor::new("y")],
                ),
            ],
            to,
        )
    }

    #[test]
    fn test_key_fields_are_retained() {
        let ctx = context(vec![]);
        assert_eq!(ctx.slot_names(), vec!["a:x", "a:id", "b:id", "b:y"]);
        assert_eq!(ctx.to_string(), "a(x, id) ON a.id JOIN b(id, y) ON b.id");
    }

    #[test]
    fn test_side_values_and_key() {
        let ctx = context(vec![]);
        let a = Tuple::from_pairs("a", vec![("id", Value::Int(1)), ("x", Value::from("p"))]);
        let side = &ctx.sides()[ctx.side_of("a").unwrap()];
        assert_eq!(side.values(&a), vec![Value::from("p"), Value::Int(1)]);
        assert_eq!(side.key().value(&a), Some(Value::Int(1)));

        let no_key = Tuple::from_pairs("a", vec![("x", Value::from("p"))]);
        assert_eq!(side.key().value(&no_key), None);
        assert_eq!(ctx.side_of("c"), None);
    }

    #[test]
    fn test_cross_product_and_selection() {
        let ctx = context(vec![
            FieldAccessor::qualified("a", "id").alias("id"),
            FieldAccessor::qualified("a", "x"),
            FieldAccessor::qualified("b", "y"),
            FieldAccessor::qualified("b", "missing"),
        ]);
        let per_side = vec![
            vec![
                vec![Value::from("p"), Value::Int(1)],
                vec![Value::from("q"), Value::Int(1)],
            ],
            vec![vec![Value::Int(1), Value::Int(10)]],
        ];
        let rows: Vec<Vec<Value>> = ctx
            .cross_product(&per_side)
            .iter()
            .map(|r| ctx.select(r))
            .collect();
        assert_eq!(
            rows,
            vec![
                vec![Value::Int(1), Value::from("p"), Value::Int(10), Value::Null],
                vec![Value::Int(1), Value::from("q"), Value::Int(10), Value::Null],
            ]
        );
    }

    #[test]
    fn test_wildcard_slot_is_spread() {
        let ctx = JoinContext::new(
            vec![
                JoinSide::new(
                    "a",
                    JoinKey::Simple(FieldAccessor::new("id")),
                    vec![FieldAccessor::wildcard()],
                ),
                JoinSide::new(
                    "b",
                    JoinKey::Simple(FieldAccessor::new("id")),
                    vec![FieldAccessor::new("y")],
                ),
            ],
            vec![],
        );
        let a = Tuple::from_pairs("a", vec![("id", Value::Int(1)), ("x", Value::Int(2))]);
        let row_a = ctx.sides()[0].values(&a);
        assert_eq!(row_a.len(), 2);
        let combined = ctx.cross_product(&[vec![row_a], vec![vec![Value::Int(9), Value::Int(1)]]]);
        assert_eq!(
            ctx.select(&combined[0]),
            vec![Value::Int(1), Value::Int(2), Value::Int(1), Value::Int(9), Value::Int(1)]
        );
    }

    #[test]
    fn test_complex_key() {
        let key = JoinKey::Complex(vec![FieldAccessor::new("a"), FieldAccessor::new("b")]);
        let t = Tuple::from_pairs("t", vec![("a", Value::Int(1)), ("b", Value::Int(2))]);
        assert_eq!(
            key.value(&t),
            Some(Value::Array(vec![Value::Int(1), Value::Int(2)]))
        );
        assert_eq!(key.to_string(), "(a, b)");
    }
}
