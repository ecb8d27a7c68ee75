use super::{ExecOperator, OperatorContext, OperatorError};
use crate::dispatch::Dispatch;
use std::fmt;
use tributary_core::{Tuple, TupleValues};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenameSpec {
    pub from: String,
    pub to: String,
}

impl RenameSpec {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

impl fmt::Display for RenameSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.from, self.to)
    }
}

/// Re-labels tuples with a new tuple name; values are untouched.
#[derive(Debug)]
pub struct RenameOperator {
    spec: RenameSpec,
}

impl RenameOperator {
    pub fn new(spec: RenameSpec) -> Self {
        Self { spec }
    }
}

impl ExecOperator for RenameOperator {
    fn prepare(&mut self, _ctx: &OperatorContext) -> Result<(), OperatorError> {
        Ok(())
    }

    fn execute(&mut self, tuple: Tuple, out: &mut dyn Dispatch) -> Result<(), OperatorError> {
        let values = tuple.into_tuple_values().values;
        out.dispatch(TupleValues::new(self.spec.to.clone(), values));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Collector;
    use tributary_core::Value;

    #[test]
    fn test_rename_keeps_values() {
        let mut op = RenameOperator::new(RenameSpec::new("access", "hits"));
        op.prepare(&OperatorContext::detached("RENAME_1")).unwrap();
        let mut out = Collector::new();
        op.execute(Tuple::from_pairs("access", vec![("n", Value::Int(1))]), &mut out)
            .unwrap();
        assert_eq!(out.take(), vec![TupleValues::new("hits", vec![Value::Int(1)])]);
        assert_eq!(RenameSpec::new("a", "b").to_string(), "a -> b");
    }
}
