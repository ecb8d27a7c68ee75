//! Tuples flowing between operators

use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// A named, ordered value vector.
///
/// This is what dispatchers move between operators. Field names are not
/// carried; they are resolved against the field-flow table of the
/// producing operator when the receiving operator binds a [`Tuple`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TupleValues {
    pub tuple_name: String,
    pub values: Vec<Value>,
}

impl TupleValues {
    pub fn new(tuple_name: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            tuple_name: tuple_name.into(),
            values,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Display for TupleValues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.tuple_name, Value::Array(self.values.clone()))
    }
}

/// A [`TupleValues`] bound to the field names it was produced with.
#[derive(Debug, Clone, PartialEq)]
pub struct Tuple {
    field_names: Arc<[String]>,
    values: TupleValues,
}

impl Tuple {
    pub fn new(field_names: Arc<[String]>, values: TupleValues) -> Self {
        Self {
            field_names,
            values,
        }
    }

    /// Convenience constructor for tests and adapters.
    pub fn from_pairs(tuple_name: &str, pairs: Vec<(&str, Value)>) -> Self {
        let (names, values): (Vec<String>, Vec<Value>) =
            pairs.into_iter().map(|(k, v)| (k.to_string(), v)).unzip();
        Self::new(names.into(), TupleValues::new(tuple_name, values))
    }

    pub fn tuple_name(&self) -> &str {
        &self.values.tuple_name
    }

    pub fn field_names(&self) -> &[String] {
        &self.field_names
    }

    pub fn shared_field_names(&self) -> Arc<[String]> {
        self.field_names.clone()
    }

    pub fn values(&self) -> &[Value] {
        &self.values.values
    }

    pub fn tuple_values(&self) -> &TupleValues {
        &self.values
    }

    pub fn into_tuple_values(self) -> TupleValues {
        self.values
    }

    pub fn index_of(&self, field: &str) -> Option<usize> {
        self.field_names.iter().position(|f| f == field)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.index_of(field).and_then(|i| self.values.values.get(i))
    }
}

/// Routing key extracted from a tuple's group fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct GroupKey(pub Vec<Value>);

impl GroupKey {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    pub fn values(&self) -> &[Value] {
        &self.0
    }

    /// The key as a single value: the bare value for one field, an array otherwise.
    pub fn to_value(&self) -> Value {
        match self.0.as_slice() {
            [single] => single.clone(),
            many => Value::Array(many.to_vec()),
        }
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Value::Array(self.0.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tuple_get_by_name() {
        let t = Tuple::from_pairs("log", vec![("a", Value::Int(1)), ("b", "x".into())]);
        assert_eq!(t.tuple_name(), "log");
        assert_eq!(t.get("b"), Some(&Value::from("x")));
        assert_eq!(t.get("c"), None);
        assert_eq!(t.index_of("a"), Some(0));
    }

    #[test]
    fn test_group_key_to_value() {
        assert_eq!(GroupKey::new(vec![Value::Int(3)]).to_value(), Value::Int(3));
        assert_eq!(
            GroupKey::new(vec![Value::Int(3), "a".into()]).to_value(),
            Value::Array(vec![Value::Int(3), "a".into()])
        );
    }

    #[test]
    fn test_tuple_values_display() {
        let tv = TupleValues::new("t", vec![Value::Int(1), Value::from("a")]);
        assert_eq!(tv.to_string(), "t[1, a]");
    }
}
