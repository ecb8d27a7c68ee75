//! Partitioning functions for repartition boundaries
//!
//! A [`Grouping`] decides which task of the next physical unit receives a
//! tuple. Groupings compare structurally: two repartition stages with equal
//! groupings feed the same unit.

use rand::Rng;
use rustc_hash::FxHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use tributary_core::{FieldAccessor, GroupKey, Schema, Tuple};

/// Key fields of a grouped stream. A stream grouped again inside a group
/// keeps the outer fields as its parent; keys list parent values first.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupFields {
    fields: Vec<FieldAccessor>,
    parent: Option<Box<GroupFields>>,
}

impl GroupFields {
    pub fn new(fields: Vec<FieldAccessor>) -> Self {
        Self {
            fields,
            parent: None,
        }
    }

    pub fn of(names: &[&str]) -> Self {
        Self::new(names.iter().map(|n| FieldAccessor::new(*n)).collect())
    }

    pub fn with_parent(mut self, parent: GroupFields) -> Self {
        self.parent = Some(Box::new(parent));
        self
    }

    /// Fields declared at this level only.
    pub fn fields(&self) -> &[FieldAccessor] {
        &self.fields
    }

    pub fn parent(&self) -> Option<&GroupFields> {
        self.parent.as_deref()
    }

    /// Every key field, parent fields first.
    pub fn all_fields(&self) -> Vec<&FieldAccessor> {
        let mut all = self.parent.as_ref().map(|p| p.all_fields()).unwrap_or_default();
        all.extend(self.fields.iter());
        all
    }

    pub fn key(&self, tuple: &Tuple) -> GroupKey {
        GroupKey::new(self.all_fields().iter().map(|f| f.value(tuple)).collect())
    }
}

impl fmt::Display for GroupFields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(parent) = &self.parent {
            write!(f, "{}, ", parent)?;
        }
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", field)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Grouping {
    /// Everything goes to the lowest task.
    Global,
    Shuffle,
    /// Hash of the level's own key fields.
    Fields(GroupFields),
    /// Per tuple name; names not listed are shuffled.
    Select(Vec<(String, Grouping)>),
}

impl Grouping {
    /// Grouping for tuples read from `schemas`: each schema is partitioned
    /// by its partition fields, or shuffled when it declares none.
    pub fn for_schemas(schemas: &[&Schema]) -> Grouping {
        fn for_schema(schema: &Schema) -> Grouping {
            match &schema.partition_fields {
                Some(fields) => Grouping::Fields(GroupFields::new(
                    fields.iter().map(FieldAccessor::new).collect(),
                )),
                None => Grouping::Shuffle,
            }
        }

        match schemas {
            [] => Grouping::Shuffle,
            [single] => for_schema(single),
            many => Grouping::Select(
                many.iter()
                    .map(|s| (s.name.clone(), for_schema(s)))
                    .collect(),
            ),
        }
    }

    /// Picks the receiving task in `0..n_tasks`.
    pub fn choose_task(&self, tuple: &Tuple, n_tasks: usize) -> usize {
        if n_tasks <= 1 {
            return 0;
        }
        match self {
            Grouping::Global => 0,
            Grouping::Shuffle => rand::thread_rng().gen_range(0..n_tasks),
            Grouping::Fields(group_fields) => {
                let mut hasher = FxHasher::default();
                for field in group_fields.fields() {
                    field.value(tuple).hash(&mut hasher);
                }
                (hasher.finish() % n_tasks as u64) as usize
            }
            Grouping::Select(groupings) => groupings
                .iter()
                .find(|(name, _)| name == tuple.tuple_name())
                .map(|(_, g)| g.choose_task(tuple, n_tasks))
                .unwrap_or_else(|| Grouping::Shuffle.choose_task(tuple, n_tasks)),
        }
    }
}

impl fmt::Display for Grouping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Grouping::Global => write!(f, "global grouping"),
            Grouping::Shuffle => write!(f, "shuffle grouping"),
            Grouping::Fields(fields) => write!(f, "fields grouping({})", fields),
            Grouping::Select(groupings) => {
                for (i, (name, grouping)) in groupings.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}({})", name, grouping)?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tributary_core::Value;

    fn tuple(name: &str, id: i64) -> Tuple {
        Tuple::from_pairs(name, vec![("id", Value::Int(id)), ("v", Value::Int(0))])
    }

    #[test]
    fn test_group_fields_key_and_display() {
        let inner = GroupFields::of(&["v"]).with_parent(GroupFields::of(&["id"]));
        assert_eq!(inner.to_string(), "id, v");
        assert_eq!(
            inner.key(&tuple("t", 3)),
            GroupKey::new(vec![Value::Int(3), Value::Int(0)])
        );
        assert_eq!(inner.fields().len(), 1);
    }

    #[test]
    fn test_fields_grouping_is_stable() {
        let g = Grouping::Fields(GroupFields::of(&["id"]));
        for id in 0..20 {
            let a = g.choose_task(&tuple("t", id), 4);
            let b = g.choose_task(&tuple("t", id), 4);
            assert_eq!(a, b);
            assert!(a < 4);
        }
    }

    #[test]
    fn test_global_and_shuffle() {
        assert_eq!(Grouping::Global.choose_task(&tuple("t", 1), 8), 0);
        for _ in 0..20 {
            assert!(Grouping::Shuffle.choose_task(&tuple("t", 1), 3) < 3);
        }
        assert_eq!(Grouping::Shuffle.choose_task(&tuple("t", 1), 1), 0);
    }

    #[test]
    fn test_for_schemas() {
        let a = Schema::new("a", vec!["id", "v"]).with_partition_fields(vec!["id"]);
        let b = Schema::new("b", vec!["x"]);
        assert_eq!(Grouping::for_schemas(&[]), Grouping::Shuffle);
        assert_eq!(Grouping::for_schemas(&[&b]), Grouping::Shuffle);
        assert_eq!(
            Grouping::for_schemas(&[&a]),
            Grouping::Fields(GroupFields::of(&["id"]))
        );
        let select = Grouping::for_schemas(&[&a, &b]);
        assert_eq!(
            select.to_string(),
            "a(fields grouping(id)), b(shuffle grouping)"
        );
        assert_eq!(
            select.choose_task(&tuple("a", 5), 4),
            Grouping::Fields(GroupFields::of(&["id"])).choose_task(&tuple("a", 5), 4)
        );
    }

    #[test]
    fn test_equal_groupings_compare_equal() {
        assert_eq!(Grouping::Shuffle, Grouping::Shuffle);
        assert_ne!(
            Grouping::Fields(GroupFields::of(&["a"])),
            Grouping::Fields(GroupFields::of(&["b"]))
        );
    }
}
