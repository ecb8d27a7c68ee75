//! Resolved field paths
//!
//! A [`FieldAccessor`] names a value inside a tuple: an optional tuple
//! qualifier, a top-level field, nested `.field` steps and `[idx]` / `['key']`
//! subscripts. Two special forms exist: the wildcard `*` (optionally scoped
//! to one tuple, `t.*`) and context fields (`_context.name`) which read from
//! the operator's execution context instead of the tuple.
//!
//! # Example
//!
//! ```ignore
//! let f = FieldAccessor::new("request").field("headers").key("host");
//! let host = f.value(&tuple);
//! ```

use crate::tuple::Tuple;
use crate::value::Value;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const WILDCARD: &str = "*";
pub const CONTEXT_FIELD: &str = "_context";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Subscript {
    Index(usize),
    Key(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldAccessor {
    tuple: Option<String>,
    /// Path from the top-level field down to this one.
    path: Vec<String>,
    subscripts: Vec<Subscript>,
    alias: Option<String>,
}

impl FieldAccessor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            tuple: None,
            path: vec![name.into()],
            subscripts: Vec::new(),
            alias: None,
        }
    }

    pub fn wildcard() -> Self {
        Self::new(WILDCARD)
    }

    /// `tuple.*` or `tuple.field`
    pub fn qualified(tuple: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            tuple: Some(tuple.into()),
            ..Self::new(name)
        }
    }

    /// Accessor for the tuple itself, used as the root of join outputs.
    pub fn tuple_root(tuple: impl Into<String>) -> Self {
        Self {
            tuple: Some(tuple.into()),
            path: Vec::new(),
            subscripts: Vec::new(),
            alias: None,
        }
    }

    pub fn context(name: impl Into<String>) -> Self {
        Self {
            tuple: None,
            path: vec![CONTEXT_FIELD.to_string(), name.into()],
            subscripts: Vec::new(),
            alias: None,
        }
    }

    /// Step into a nested field.
    pub fn field(mut self, name: impl Into<String>) -> Self {
        self.path.push(name.into());
        self
    }

    pub fn index(mut self, idx: usize) -> Self {
        self.subscripts.push(Subscript::Index(idx));
        self
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.subscripts.push(Subscript::Key(key.into()));
        self
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Qualifies an unqualified accessor with `tuple`.
    pub fn in_tuple(mut self, tuple: impl Into<String>) -> Self {
        if self.tuple.is_none() {
            self.tuple = Some(tuple.into());
        }
        self
    }

    /// The same reference with the alias dropped.
    pub fn unaliased(&self) -> Self {
        Self {
            alias: None,
            ..self.clone()
        }
    }

    /// Output name: the alias if set, else the last path element.
    pub fn name(&self) -> &str {
        self.alias
            .as_deref()
            .or_else(|| self.path.last().map(String::as_str))
            .or(self.tuple.as_deref())
            .unwrap_or(WILDCARD)
    }

    pub fn original_name(&self) -> &str {
        self.path.last().map(String::as_str).unwrap_or(WILDCARD)
    }

    /// Name of the top-level field read from the tuple.
    pub fn root_name(&self) -> Option<&str> {
        self.path.first().map(String::as_str)
    }

    pub fn tuple_name(&self) -> Option<&str> {
        self.tuple.as_deref()
    }

    pub fn alias_name(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    pub fn is_wildcard(&self) -> bool {
        self.path.len() == 1 && self.path[0] == WILDCARD
    }

    pub fn is_tuple_root(&self) -> bool {
        self.tuple.is_some() && self.path.is_empty()
    }

    pub fn is_context(&self) -> bool {
        self.path.len() >= 2 && self.path[0] == CONTEXT_FIELD
    }

    /// Reads this field from `tuple`. Missing fields and qualifier
    /// mismatches yield `Value::Null`.
    pub fn value(&self, tuple: &Tuple) -> Value {
        self.resolve(tuple, None)
    }

    /// Like [`value`](Self::value) but context fields are looked up in `context`.
    pub fn value_in(&self, tuple: &Tuple, context: &IndexMap<String, Value>) -> Value {
        self.resolve(tuple, Some(context))
    }

    fn resolve(&self, tuple: &Tuple, context: Option<&IndexMap<String, Value>>) -> Value {
        if let Some(t) = &self.tuple {
            if t != tuple.tuple_name() {
                return Value::Null;
            }
        }

        let base = if self.is_context() {
            match context.and_then(|c| c.get(&self.path[1])) {
                Some(v) => descend(v, &self.path[2..]),
                None => return Value::Null,
            }
        } else {
            let Some(root) = self.path.first() else {
                return Value::Array(tuple.values().to_vec());
            };
            match tuple.get(root) {
                Some(v) => descend(v, &self.path[1..]),
                None => return Value::Null,
            }
        };

        let mut current = match base {
            Some(v) => v,
            None => return Value::Null,
        };
        for sub in &self.subscripts {
            let next = match sub {
                Subscript::Index(i) => current.get_index(*i),
                Subscript::Key(k) => current.get(k),
            };
            match next {
                Some(v) => current = v,
                None => return Value::Null,
            }
        }
        current.clone()
    }
}

fn descend<'a>(value: &'a Value, path: &[String]) -> Option<&'a Value> {
    path.iter().try_fold(value, |v, name| v.get(name))
}

impl fmt::Display for FieldAccessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(t) = &self.tuple {
            write!(f, "{}", t)?;
            if !self.path.is_empty() {
                write!(f, ".")?;
            }
        }
        write!(f, "{}", self.path.join("."))?;
        for sub in &self.subscripts {
            match sub {
                Subscript::Index(i) => write!(f, "[{}]", i)?,
                Subscript::Key(k) => write!(f, "['{}']", k)?,
            }
        }
        if let Some(a) = &self.alias {
            write!(f, " AS {}", a)?;
        }
        Ok(())
    }
}
