//! Sliding window
//!
//! Every input enters the window, the aggregates are updated incrementally,
//! and one row is emitted per input. The window keeps the aggregate input
//! values of each entry in a [`TupleStore`] so evicted entries can be
//! excluded again.
//!
//! - `Count(n)`: at most the `n` most recent entries
//! - `Time { period, field }`: entries whose timestamp is no older than
//!   `period` before the newest one; the time comes from `field`

use super::{ExecOperator, OperatorContext, OperatorError};
use crate::aggregate::IncrementalAggregate;
use crate::dispatch::Dispatch;
use crate::projection::Projection;
use crate::store::{open_tuple_store, Query, Row, TimeCondition, TupleStore};
use indexmap::IndexMap;
use std::fmt;
use std::sync::Arc;
use tracing::warn;
use tributary_core::{Clock, FieldAccessor, Period, SystemClock, Tuple, TupleValues, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum SlideLength {
    Count(usize),
    Time {
        period: Period,
        time_field: FieldAccessor,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SlideSpec {
    pub length: SlideLength,
    pub projection: Projection,
}

impl SlideSpec {
    pub fn count(n: usize, projection: Projection) -> Self {
        Self {
            length: SlideLength::Count(n.max(1)),
            projection,
        }
    }

    pub fn time(period: Period, time_field: FieldAccessor, projection: Projection) -> Self {
        Self {
            length: SlideLength::Time { period, time_field },
            projection,
        }
    }
}

impl fmt::Display for SlideSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.length {
            SlideLength::Count(n) => write!(f, "length {}", n)?,
            SlideLength::Time { period, time_field } => {
                write!(f, "length {} BY {}", period, time_field)?
            }
        }
        write!(f, ", [{}]", self.projection)
    }
}

pub struct SlideOperator {
    spec: SlideSpec,
    aggregates: Vec<Box<dyn IncrementalAggregate>>,
    store: Option<Box<dyn TupleStore>>,
    partition: Value,
    context: IndexMap<String, Value>,
    clock: Arc<dyn Clock>,
    name: String,
}

impl SlideOperator {
    pub fn new(spec: SlideSpec) -> Self {
        let aggregates = spec.projection.create_aggregates();
        Self {
            spec,
            aggregates,
            store: None,
            partition: Value::Null,
            context: IndexMap::new(),
            clock: Arc::new(SystemClock),
            name: String::new(),
        }
    }

    /// Stores the entry and returns the entries it pushed out of the window.
    /// `None` means the tuple was dropped.
    fn slide(&mut self, tuple: &Tuple, inputs: Row) -> Result<Option<Vec<Row>>, OperatorError> {
        let store = self
            .store
            .as_mut()
            .ok_or_else(|| OperatorError::Field(format!("{} is not prepared", self.name)))?;

        match &self.spec.length {
            SlideLength::Count(n) => {
                store.put(&self.partition, self.clock.now_secs(), inputs)?;
                let count = store.count(&Query::all(self.partition.clone()))?;
                if count <= *n {
                    return Ok(Some(Vec::new()));
                }
                let query = Query::builder(self.partition.clone())
                    .limit(count - n)
                    .build();
                Ok(Some(store.find_and_remove(&query)?))
            }
            SlideLength::Time { period, time_field } => {
                let time = match time_field.value(tuple) {
                    Value::Timestamp(ms) => i32::try_from(ms.div_euclid(1000)).ok(),
                    _ => None,
                };
                let Some(time) = time else {
                    warn!(
                        "{}: `{}` is not a timestamp, tuple dropped",
                        self.name, time_field
                    );
                    return Ok(None);
                };
                store.put(&self.partition, time, inputs)?;
                let oldest = time.saturating_sub(period.secs() as i32);
                let query = Query::builder(self.partition.clone())
                    .time_key(TimeCondition::Lt, oldest)
                    .build();
                Ok(Some(store.find_and_remove(&query)?))
            }
        }
    }
}

impl ExecOperator for SlideOperator {
    fn prepare(&mut self, ctx: &OperatorContext) -> Result<(), OperatorError> {
        self.clock = ctx.clock.clone();
        self.context = ctx.context_fields();
        self.partition = ctx.state_key();
        self.name = ctx.name.clone();
        self.store = Some(open_tuple_store(
            &ctx.config,
            &ctx.instance_name(),
            ctx.clock.clone(),
        )?);
        Ok(())
    }

    fn execute(&mut self, tuple: Tuple, out: &mut dyn Dispatch) -> Result<(), OperatorError> {
        let inputs = self.spec.projection.aggregate_inputs(&tuple, &self.context);
        let Some(evicted) = self.slide(&tuple, inputs.clone())? else {
            return Ok(());
        };

        for (aggregate, input) in self.aggregates.iter_mut().zip(&inputs) {
            aggregate.include(input)?;
        }
        for row in &evicted {
            for (aggregate, input) in self.aggregates.iter_mut().zip(row) {
                aggregate.exclude(input)?;
            }
        }

        let current: Vec<Value> = self.aggregates.iter().map(|a| a.current()).collect();
        let row = self.spec.projection.project(&tuple, &self.context, &current);
        out.dispatch(TupleValues::new(tuple.tuple_name(), row));
        Ok(())
    }

    fn cleanup(&mut self) {
        if let Some(mut store) = self.store.take() {
            if let Err(e) = store.close() {
                warn!("{}: failed to close window store: {}", self.name, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{AggregateKind, AggregateSpec};
    use crate::dispatch::Collector;
    use crate::projection::ProjectionItem;

    fn sum_of(field: &str) -> Projection {
        Projection::new(vec![
            ProjectionItem::field("id"),
            AggregateSpec::new(AggregateKind::Sum, FieldAccessor::new(field))
                .alias("total")
                .into(),
        ])
    }

    fn sums(out: &mut Collector) -> Vec<Value> {
        out.take().into_iter().map(|t| t.values[1].clone()).collect()
    }

    #[test]
    fn test_count_window_sum() {
        let mut op = SlideOperator::new(SlideSpec::count(3, sum_of("n")));
        op.prepare(&OperatorContext::detached("SLIDE_1")).unwrap();
        let mut out = Collector::new();
        for n in 1..=5 {
            let t = Tuple::from_pairs("t", vec![("id", Value::Int(0)), ("n", Value::Int(n))]);
            op.execute(t, &mut out).unwrap();
        }
        assert_eq!(
            sums(&mut out),
            vec![
                Value::Int(1),
                Value::Int(3),
                Value::Int(6),
                Value::Int(9),
                Value::Int(12)
            ]
        );
        op.cleanup();
    }

    fn at(secs: i64, n: i64) -> Tuple {
        Tuple::from_pairs(
            "t",
            vec![
                ("id", Value::Int(0)),
                ("n", Value::Int(n)),
                ("ts", Value::Timestamp(secs * 1000)),
            ],
        )
    }

    #[test]
    fn test_time_window_evicts_older_than_period() {
        let spec = SlideSpec::time(Period::from_secs(10), FieldAccessor::new("ts"), sum_of("n"));
        let mut op = SlideOperator::new(spec);
        op.prepare(&OperatorContext::detached("SLIDE_1")).unwrap();
        let mut out = Collector::new();

        op.execute(at(100, 1), &mut out).unwrap();
        op.execute(at(105, 2), &mut out).unwrap();
        // 100 is exactly one period old and stays
        op.execute(at(110, 4), &mut out).unwrap();
        // 100 and 105 fall out
        op.execute(at(116, 8), &mut out).unwrap();

        assert_eq!(
            sums(&mut out),
            vec![Value::Int(1), Value::Int(3), Value::Int(7), Value::Int(12)]
        );
    }

    #[test]
    fn test_missing_time_field_drops_tuple() {
        let spec = SlideSpec::time(Period::from_secs(10), FieldAccessor::new("ts"), sum_of("n"));
        let mut op = SlideOperator::new(spec);
        op.prepare(&OperatorContext::detached("SLIDE_1")).unwrap();
        let mut out = Collector::new();
        let t = Tuple::from_pairs("t", vec![("id", Value::Int(0)), ("n", Value::Int(1))]);
        op.execute(t, &mut out).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_execute_before_prepare_fails() {
        let mut op = SlideOperator::new(SlideSpec::count(2, sum_of("n")));
        let t = Tuple::from_pairs("t", vec![("n", Value::Int(1))]);
        assert!(op.execute(t, &mut Collector::new()).is_err());
    }
}
