//! Dispatch protocol
//!
//! Operators push their output through a [`Dispatch`] sink; they never know
//! who is downstream. The compiler wires a [`Dispatcher`] onto every
//! operator with outgoing edges, and the execution unit walks it to deliver
//! each [`TupleValues`] synchronously on the producing operator's thread.
//!
//! - `Single` forwards to one target
//! - `Grouping` forwards to the target instance owning the tuple's group key
//! - `Multi` forwards to each member in registration order
//! - `Filter` drops tuples whose name is outside its allow-set

use crate::grouping::GroupFields;
use crate::topology::NodeIndex;
use std::fmt;
use tributary_core::TupleValues;

/// Output side of an operator.
pub trait Dispatch {
    fn dispatch(&mut self, values: TupleValues);
}

/// Buffers dispatched tuples. Used where an operator's output is consumed
/// after `execute` returns, and by tests.
#[derive(Debug, Default)]
pub struct Collector {
    collected: Vec<TupleValues>,
}

impl Collector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn collected(&self) -> &[TupleValues] {
        &self.collected
    }

    pub fn take(&mut self) -> Vec<TupleValues> {
        std::mem::take(&mut self.collected)
    }

    pub fn len(&self) -> usize {
        self.collected.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collected.is_empty()
    }
}

impl Dispatch for Collector {
    fn dispatch(&mut self, values: TupleValues) {
        self.collected.push(values);
    }
}

/// Operator a dispatcher delivers to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub node: NodeIndex,
    pub name: String,
}

/// Allow-set of tuple names.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TupleNameFilter {
    tuple_names: Vec<String>,
}

impl TupleNameFilter {
    pub fn new(tuple_names: Vec<String>) -> Self {
        Self { tuple_names }
    }

    pub fn accepts(&self, tuple_name: &str) -> bool {
        self.tuple_names.iter().any(|n| n == tuple_name)
    }
}

impl fmt::Display for TupleNameFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TupleNameFilter(tupleName=[{}])", self.tuple_names.join(", "))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatcher {
    Single(Target),
    Grouping {
        target: Target,
        group_fields: GroupFields,
    },
    Multi(Vec<Dispatcher>),
    Filter {
        filter: TupleNameFilter,
        inner: Box<Dispatcher>,
    },
}

impl Dispatcher {
    /// Every operator this dispatcher can deliver to, in dispatch order.
    pub fn targets(&self) -> Vec<&Target> {
        match self {
            Dispatcher::Single(t) => vec![t],
            Dispatcher::Grouping { target, .. } => vec![target],
            Dispatcher::Multi(ds) => ds.iter().flat_map(Dispatcher::targets).collect(),
            Dispatcher::Filter { inner, .. } => inner.targets(),
        }
    }
}

impl fmt::Display for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dispatcher::Single(t) => write!(f, "-SingleDispatcher-> {}", t.name),
            Dispatcher::Grouping {
                target,
                group_fields,
            } => write!(f, "-GroupingDispatcher({})-> {}", group_fields, target.name),
            Dispatcher::Multi(ds) => {
                write!(f, "-MultiDispatcher[")?;
                for (i, d) in ds.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", d)?;
                }
                write!(f, "]")
            }
            Dispatcher::Filter { filter, inner } => write!(f, "{}{}", filter, inner),
        }
    }
}
