//! Tuple predicates
//!
//! Conditions are evaluated against one bound [`Tuple`]. Comparing a null
//! field is always false (use `IsNull`); comparing values of unrelated
//! types is an error that propagates to the operator.

use std::cmp::Ordering;
use std::fmt;
use tributary_core::{FieldAccessor, Tuple, Value};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot compare {left} with {right} in `{field}`")]
pub struct ConditionError {
    pub field: String,
    pub left: &'static str,
    pub right: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl CompareOp {
    fn holds(&self, ord: Ordering) -> bool {
        match self {
            CompareOp::Eq => ord == Ordering::Equal,
            CompareOp::Ne => ord != Ordering::Equal,
            CompareOp::Gt => ord == Ordering::Greater,
            CompareOp::Ge => ord != Ordering::Less,
            CompareOp::Lt => ord == Ordering::Less,
            CompareOp::Le => ord != Ordering::Greater,
        }
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "<>",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Compare {
        field: FieldAccessor,
        op: CompareOp,
        value: Value,
    },
    /// True when the field equals any of the values. A list field matches
    /// when any of its elements does.
    In {
        field: FieldAccessor,
        values: Vec<Value>,
    },
    IsNull(FieldAccessor),
    IsNotNull(FieldAccessor),
    And(Vec<Condition>),
    Or(Vec<Condition>),
    Not(Box<Condition>),
}

impl Condition {
    pub fn compare(field: FieldAccessor, op: CompareOp, value: impl Into<Value>) -> Self {
        Condition::Compare {
            field,
            op,
            value: value.into(),
        }
    }

    pub fn eq(field: &str, value: impl Into<Value>) -> Self {
        Self::compare(FieldAccessor::new(field), CompareOp::Eq, value)
    }

    pub fn evaluate(&self, tuple: &Tuple) -> Result<bool, ConditionError> {
        match self {
            Condition::Compare { field, op, value } => {
                let actual = field.value(tuple);
                if actual.is_null() {
                    return Ok(false);
                }
                let ord = compare(field, &actual, value)?;
                Ok(op.holds(ord))
            }
            Condition::In { field, values } => {
                let actual = field.value(tuple);
                let candidates: &[Value] = match &actual {
                    Value::Null => return Ok(false),
                    Value::Array(items) => items,
                    single => std::slice::from_ref(single),
                };
                for candidate in candidates {
                    for v in values {
                        if compare(field, candidate, v)? == Ordering::Equal {
                            return Ok(true);
                        }
                    }
                }
                Ok(false)
            }
            Condition::IsNull(field) => Ok(field.value(tuple).is_null()),
            Condition::IsNotNull(field) => Ok(!field.value(tuple).is_null()),
            Condition::And(conditions) => {
                for c in conditions {
                    if !c.evaluate(tuple)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Condition::Or(conditions) => {
                for c in conditions {
                    if c.evaluate(tuple)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Condition::Not(inner) => Ok(!inner.evaluate(tuple)?),
        }
    }
}

fn compare(field: &FieldAccessor, left: &Value, right: &Value) -> Result<Ordering, ConditionError> {
    left.compare(right).ok_or_else(|| ConditionError {
        field: field.to_string(),
        left: left.type_name(),
        right: right.type_name(),
    })
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Compare { field, op, value } => match value {
                Value::Str(s) => write!(f, "{} {} '{}'", field, op, s),
                other => write!(f, "{} {} {}", field, op, other),
            },
            Condition::In { field, values } => {
                write!(f, "{} IN {}", field, Value::Array(values.clone()))
            }
            Condition::IsNull(field) => write!(f, "{} IS NULL", field),
            Condition::IsNotNull(field) => write!(f, "{} IS NOT NULL", field),
            Condition::And(cs) | Condition::Or(cs) => {
                let sep = if matches!(self, Condition::And(_)) {
                    " AND "
                } else {
                    " OR "
                };
                write!(f, "(")?;
                for (i, c) in cs.iter().enumerate() {
                    if i > 0 {
                        write!(f, "{}", sep)?;
                    }
                    write!(f, "{}", c)?;
                }
                write!(f, ")")
            }
            Condition::Not(inner) => write!(f, "NOT {}", inner),
        }
    }
}
