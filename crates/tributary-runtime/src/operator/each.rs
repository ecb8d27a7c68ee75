//! Per-tuple projection

use super::{ExecOperator, OperatorContext, OperatorError};
use crate::aggregate::IncrementalAggregate;
use crate::dispatch::Dispatch;
use crate::projection::Projection;
use indexmap::IndexMap;
use tributary_core::{Tuple, TupleValues, Value};

/// Projects every input tuple onto the declared columns. Aggregate columns
/// are running totals over everything this instance has seen.
#[derive(Debug)]
pub struct EachOperator {
    projection: Projection,
    aggregates: Vec<Box<dyn IncrementalAggregate>>,
    context: IndexMap<String, Value>,
}

impl EachOperator {
    pub fn new(projection: Projection) -> Self {
        let aggregates = projection.create_aggregates();
        Self {
            projection,
            aggregates,
            context: IndexMap::new(),
        }
    }
}

impl ExecOperator for EachOperator {
    fn prepare(&mut self, ctx: &OperatorContext) -> Result<(), OperatorError> {
        self.context = ctx.context_fields();
        Ok(())
    }

    fn execute(&mut self, tuple: Tuple, out: &mut dyn Dispatch) -> Result<(), OperatorError> {
        let inputs = self.projection.aggregate_inputs(&tuple, &self.context);
        for (aggregate, input) in self.aggregates.iter_mut().zip(&inputs) {
            aggregate.include(input)?;
        }
        let current: Vec<Value> = self.aggregates.iter().map(|a| a.current()).collect();
        let row = self.projection.project(&tuple, &self.context, &current);
        out.dispatch(TupleValues::new(tuple.tuple_name(), row));
        Ok(())
    }
}
