//! Incremental aggregate functions
//!
//! Window operators keep one aggregate state per output column and feed it
//! values as they enter (`include`) and leave (`exclude`) the window, so a
//! sliding window never recomputes from scratch.
//!
//! | Function | Null input | Result |
//! |----------|------------|--------|
//! | `sum` | ignored | int while every input is int, else float |
//! | `count` | counted only for `count()` | int |
//! | `avg` | ignored | same numeric type as the running total |
//! | `min` / `max` | ignored | smallest / largest value in the window |
//! | `collect_list` | ignored | values in arrival order |
//! | `collect_set` | ignored | distinct values in first-arrival order |
//!
//! # Example
//!
//! ```ignore
//! let spec = AggregateSpec::new(AggregateKind::Sum, FieldAccessor::new("bytes")).alias("total");
//! let mut agg = spec.create();
//! agg.include(&Value::Int(10))?;
//! agg.include(&Value::Int(5))?;
//! agg.exclude(&Value::Int(10))?;
//! assert_eq!(agg.current(), Value::Int(5));
//! ```

use indexmap::IndexMap;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use tributary_core::{FieldAccessor, Value};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{function}: unsupported {value_type} value")]
pub struct AggregateError {
    pub function: &'static str,
    pub value_type: &'static str,
}

impl AggregateError {
    fn new(function: &'static str, value: &Value) -> Self {
        Self {
            function,
            value_type: value.type_name(),
        }
    }
}

/// Running aggregate state that supports removal.
pub trait IncrementalAggregate: Send + fmt::Debug {
    fn name(&self) -> &'static str;

    fn include(&mut self, value: &Value) -> Result<(), AggregateError>;

    fn exclude(&mut self, value: &Value) -> Result<(), AggregateError>;

    fn current(&self) -> Value;

    fn clear(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregateKind {
    Sum,
    Count,
    Avg,
    Min,
    Max,
    CollectList,
    CollectSet,
}

impl AggregateKind {
    pub fn name(&self) -> &'static str {
        match self {
            AggregateKind::Sum => "sum",
            AggregateKind::Count => "count",
            AggregateKind::Avg => "avg",
            AggregateKind::Min => "min",
            AggregateKind::Max => "max",
            AggregateKind::CollectList => "collect_list",
            AggregateKind::CollectSet => "collect_set",
        }
    }
}

impl fmt::Display for AggregateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Declared aggregate column: function, input field and output name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AggregateSpec {
    pub kind: AggregateKind,
    /// `None` only for `count()`, which counts every input.
    pub field: Option<FieldAccessor>,
    pub alias: Option<String>,
}

impl AggregateSpec {
    pub fn new(kind: AggregateKind, field: FieldAccessor) -> Self {
        Self {
            kind,
            field: Some(field),
            alias: None,
        }
    }

    /// `count()` over every input.
    pub fn count_all() -> Self {
        Self {
            kind: AggregateKind::Count,
            field: None,
            alias: None,
        }
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Output column name: the alias, else `kind(field)`.
    pub fn output_name(&self) -> String {
        match (&self.alias, &self.field) {
            (Some(alias), _) => alias.clone(),
            (None, Some(field)) => format!("{}({})", self.kind, field.name()),
            (None, None) => format!("{}()", self.kind),
        }
    }

    pub fn create(&self) -> Box<dyn IncrementalAggregate> {
        match self.kind {
            AggregateKind::Sum => Box::new(Sum::new()),
            AggregateKind::Count => Box::new(Count::new(self.field.is_none())),
            AggregateKind::Avg => Box::new(Avg::new()),
            AggregateKind::Min => Box::new(Extremum::min()),
            AggregateKind::Max => Box::new(Extremum::max()),
            AggregateKind::CollectList => Box::new(CollectList::default()),
            AggregateKind::CollectSet => Box::new(CollectSet::default()),
        }
    }
}

impl fmt::Display for AggregateSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.field {
            Some(field) => write!(f, "{}({})", self.kind, field)?,
            None => write!(f, "{}()", self.kind)?,
        }
        if let Some(alias) = &self.alias {
            write!(f, " AS {}", alias)?;
        }
        Ok(())
    }
}

fn is_numeric(value: &Value) -> bool {
    matches!(value, Value::Int(_) | Value::Float(_))
}

// =============================================================================
// Sum / Avg
// =============================================================================

#[derive(Debug, Clone)]
pub struct Sum {
    total: Value,
}

impl Sum {
    pub fn new() -> Self {
        Self {
            total: Value::Int(0),
        }
    }
}

impl Default for Sum {
    fn default() -> Self {
        Self::new()
    }
}

impl IncrementalAggregate for Sum {
    fn name(&self) -> &'static str {
        "sum"
    }

    fn include(&mut self, value: &Value) -> Result<(), AggregateError> {
        if value.is_null() {
            return Ok(());
        }
        if !is_numeric(value) {
            return Err(AggregateError::new(self.name(), value));
        }
        self.total = self
            .total
            .add(value)
            .ok_or_else(|| AggregateError::new("sum", value))?;
        Ok(())
    }

    fn exclude(&mut self, value: &Value) -> Result<(), AggregateError> {
        if value.is_null() {
            return Ok(());
        }
        if !is_numeric(value) {
            return Err(AggregateError::new(self.name(), value));
        }
        self.total = self
            .total
            .sub(value)
            .ok_or_else(|| AggregateError::new("sum", value))?;
        Ok(())
    }

    fn current(&self) -> Value {
        self.total.clone()
    }

    fn clear(&mut self) {
        self.total = Value::Int(0);
    }
}

#[derive(Debug, Clone)]
pub struct Avg {
    sum: Sum,
    count: i64,
}

impl Avg {
    pub fn new() -> Self {
        Self {
            sum: Sum::new(),
            count: 0,
        }
    }
}

impl Default for Avg {
    fn default() -> Self {
        Self::new()
    }
}

impl IncrementalAggregate for Avg {
    fn name(&self) -> &'static str {
        "avg"
    }

    fn include(&mut self, value: &Value) -> Result<(), AggregateError> {
        if value.is_null() {
            return Ok(());
        }
        self.sum
            .include(value)
            .map_err(|_| AggregateError::new("avg", value))?;
        self.count += 1;
        Ok(())
    }

    fn exclude(&mut self, value: &Value) -> Result<(), AggregateError> {
        if value.is_null() {
            return Ok(());
        }
        self.sum
            .exclude(value)
            .map_err(|_| AggregateError::new("avg", value))?;
        self.count -= 1;
        Ok(())
    }

    fn current(&self) -> Value {
        if self.count <= 0 {
            return Value::Null;
        }
        match self.sum.total {
            Value::Int(total) => Value::Int(total / self.count),
            Value::Float(total) => Value::Float(total / self.count as f64),
            _ => Value::Null,
        }
    }

    fn clear(&mut self) {
        self.sum.clear();
        self.count = 0;
    }
}

// =============================================================================
// Count
// =============================================================================

#[derive(Debug, Clone)]
pub struct Count {
    count: i64,
    count_nulls: bool,
}

impl Count {
    /// With `count_nulls` every input counts, else only non-null ones.
    pub fn new(count_nulls: bool) -> Self {
        Self {
            count: 0,
            count_nulls,
        }
    }

    fn counts(&self, value: &Value) -> bool {
        self.count_nulls || !value.is_null()
    }
}

impl IncrementalAggregate for Count {
    fn name(&self) -> &'static str {
        "count"
    }

    fn include(&mut self, value: &Value) -> Result<(), AggregateError> {
        if self.counts(value) {
            self.count += 1;
        }
        Ok(())
    }

    fn exclude(&mut self, value: &Value) -> Result<(), AggregateError> {
        if self.counts(value) {
            self.count -= 1;
        }
        Ok(())
    }

    fn current(&self) -> Value {
        Value::Int(self.count)
    }

    fn clear(&mut self) {
        self.count = 0;
    }
}

// =============================================================================
// Min / Max
// =============================================================================

/// Total order over values so they can key a `BTreeMap`. Values that
/// `Value::compare` cannot order fall back to ordering by type name.
#[derive(Debug, Clone)]
struct OrderedValue(Value);

impl PartialEq for OrderedValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for OrderedValue {}

impl PartialOrd for OrderedValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedValue {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .compare(&other.0)
            .unwrap_or_else(|| self.0.type_name().cmp(other.0.type_name()))
    }
}

/// Min or max tracker. Keeps a count per distinct value so an excluded
/// extreme is replaced by the next one in O(log n).
#[derive(Debug, Clone)]
pub struct Extremum {
    values: BTreeMap<OrderedValue, usize>,
    max: bool,
}

impl Extremum {
    pub fn min() -> Self {
        Self {
            values: BTreeMap::new(),
            max: false,
        }
    }

    pub fn max() -> Self {
        Self {
            values: BTreeMap::new(),
            max: true,
        }
    }
}

impl IncrementalAggregate for Extremum {
    fn name(&self) -> &'static str {
        if self.max {
            "max"
        } else {
            "min"
        }
    }

    fn include(&mut self, value: &Value) -> Result<(), AggregateError> {
        if value.is_null() {
            return Ok(());
        }
        if matches!(value, Value::Array(_) | Value::Map(_)) {
            return Err(AggregateError::new(self.name(), value));
        }
        *self.values.entry(OrderedValue(value.clone())).or_insert(0) += 1;
        Ok(())
    }

    fn exclude(&mut self, value: &Value) -> Result<(), AggregateError> {
        if value.is_null() {
            return Ok(());
        }
        let key = OrderedValue(value.clone());
        if let Some(count) = self.values.get_mut(&key) {
            if *count > 1 {
                *count -= 1;
            } else {
                self.values.remove(&key);
            }
        }
        Ok(())
    }

    fn current(&self) -> Value {
        let entry = if self.max {
            self.values.last_key_value()
        } else {
            self.values.first_key_value()
        };
        entry.map(|(k, _)| k.0.clone()).unwrap_or(Value::Null)
    }

    fn clear(&mut self) {
        self.values.clear();
    }
}

// =============================================================================
// Collections
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct CollectList {
    values: Vec<Value>,
}

impl IncrementalAggregate for CollectList {
    fn name(&self) -> &'static str {
        "collect_list"
    }

    fn include(&mut self, value: &Value) -> Result<(), AggregateError> {
        if !value.is_null() {
            self.values.push(value.clone());
        }
        Ok(())
    }

    fn exclude(&mut self, value: &Value) -> Result<(), AggregateError> {
        if let Some(pos) = self.values.iter().position(|v| v == value) {
            self.values.remove(pos);
        }
        Ok(())
    }

    fn current(&self) -> Value {
        Value::Array(self.values.clone())
    }

    fn clear(&mut self) {
        self.values.clear();
    }
}

#[derive(Debug, Clone, Default)]
pub struct CollectSet {
    counts: IndexMap<Value, usize>,
}

impl IncrementalAggregate for CollectSet {
    fn name(&self) -> &'static str {
        "collect_set"
    }

    fn include(&mut self, value: &Value) -> Result<(), AggregateError> {
        if !value.is_null() {
            *self.counts.entry(value.clone()).or_insert(0) += 1;
        }
        Ok(())
    }

    fn exclude(&mut self, value: &Value) -> Result<(), AggregateError> {
        if let Some(count) = self.counts.get_mut(value) {
            *count -= 1;
            if *count == 0 {
                self.counts.shift_remove(value);
            }
        }
        Ok(())
    }

    fn current(&self) -> Value {
        Value::Array(self.counts.keys().cloned().collect())
    }

    fn clear(&mut self) {
        self.counts.clear();
    }
}
