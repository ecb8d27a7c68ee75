use super::{ExecOperator, OperatorContext, OperatorError};
use crate::dispatch::Dispatch;
use crate::join::{open_join_state, JoinContext, JoinMode, JoinSide, JoinState};
use std::fmt;
use tracing::{debug, warn};
use tributary_core::{FieldAccessor, Period, Tuple, TupleValues};

/// Join of two or more streams on equal keys.
#[derive(Debug, Clone, PartialEq)]
pub struct TupleJoinSpec {
    pub context: JoinContext,
    /// Name of the joined tuples; the first side's name when unset.
    pub to_tuple: Option<String>,
    pub expire: Period,
    pub mode: JoinMode,
}

impl TupleJoinSpec {
    pub fn new(sides: Vec<JoinSide>, to_fields: Vec<FieldAccessor>, expire: Period) -> Self {
        Self {
            context: JoinContext::new(sides, to_fields),
            to_tuple: None,
            expire,
            mode: JoinMode::Cached,
        }
    }

    pub fn to_tuple(mut self, name: impl Into<String>) -> Self {
        self.to_tuple = Some(name.into());
        self
    }

    pub fn mode(mut self, mode: JoinMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn output_tuple_name(&self) -> &str {
        self.to_tuple
            .as_deref()
            .or_else(|| self.context.sides().first().map(JoinSide::tuple_name))
            .unwrap_or_default()
    }
}

impl fmt::Display for TupleJoinSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} TO {}, expire {}, {}",
            self.context,
            self.output_tuple_name(),
            self.expire,
            self.mode
        )
    }
}

pub struct TupleJoinOperator {
    spec: TupleJoinSpec,
    state: Option<Box<dyn JoinState>>,
    name: String,
}

impl TupleJoinOperator {
    pub fn new(spec: TupleJoinSpec) -> Self {
        Self {
            spec,
            state: None,
            name: String::new(),
        }
    }
}

impl ExecOperator for TupleJoinOperator {
    fn prepare(&mut self, ctx: &OperatorContext) -> Result<(), OperatorError> {
        self.name = ctx.name.clone();
        let sides: Vec<&str> = self
            .spec
            .context
            .sides()
            .iter()
            .map(JoinSide::tuple_name)
            .collect();
        self.state = Some(open_join_state(
            self.spec.mode,
            &ctx.config,
            &ctx.instance_name(),
            &sides,
            self.spec.expire,
            ctx.clock.clone(),
        )?);
        Ok(())
    }

    fn execute(&mut self, tuple: Tuple, out: &mut dyn Dispatch) -> Result<(), OperatorError> {
        let join = &self.spec.context;
        let Some(side_index) = join.side_of(tuple.tuple_name()) else {
            warn!("{}: no join side for tuple '{}'", self.name, tuple.tuple_name());
            return Ok(());
        };
        let side = &join.sides()[side_index];
        let Some(key) = side.key().value(&tuple) else {
            debug!("{}: null join key, tuple dropped", self.name);
            return Ok(());
        };
        let row = side.values(&tuple);

        let state = self
            .state
            .as_mut()
            .ok_or_else(|| OperatorError::Field(format!("{} is not prepared", self.name)))?;
        let matched = match state.put(side_index, &key, row) {
            Ok(matched) => matched,
            Err(e) => {
                warn!("{}: failed to buffer join row: {}", self.name, e);
                return Ok(());
            }
        };

        if let Some(per_side) = matched {
            let to_tuple = self.spec.output_tuple_name().to_string();
            for combined in join.cross_product(&per_side) {
                out.dispatch(TupleValues::new(to_tuple.clone(), join.select(&combined)));
            }
        }
        Ok(())
    }

    fn cleanup(&mut self) {
        if let Some(mut state) = self.state.take() {
            if let Err(e) = state.close() {
                warn!("{}: failed to close join buffers: {}", self.name, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Collector;
    use crate::join::JoinKey;
    use std::sync::Arc;
    use tributary_core::{ManualClock, Value};

    fn spec() -> TupleJoinSpec {
        TupleJoinSpec::new(
            vec![
                JoinSide::new(
                    "order",
                    JoinKey::Simple(FieldAccessor::new("id")),
                    vec![FieldAccessor::new("item")],
                ),
                JoinSide::new(
                    "payment",
                    JoinKey::Simple(FieldAccessor::new("order_id")),
                    vec![FieldAccessor::new("amount")],
                ),
            ],
            vec![
                FieldAccessor::qualified("order", "id"),
                FieldAccessor::qualified("order", "item"),
                FieldAccessor::qualified("payment", "amount"),
            ],
            Period::from_secs(60),
        )
        .to_tuple("paid")
    }

    fn order(id: i64, item: &str) -> Tuple {
        Tuple::from_pairs("order", vec![("id", Value::Int(id)), ("item", Value::from(item))])
    }

    fn payment(id: i64, amount: i64) -> Tuple {
        Tuple::from_pairs(
            "payment",
            vec![("order_id", Value::Int(id)), ("amount", Value::Int(amount))],
        )
    }

    #[test]
    fn test_join_emits_on_last_side() {
        for mode in [JoinMode::Cached, JoinMode::Grouped] {
            let clock = ManualClock::at_secs(0);
            let mut op = TupleJoinOperator::new(spec().mode(mode));
            let ctx = OperatorContext::detached("TUPLE_JOIN_1").with_clock(Arc::new(clock.clone()));
            op.prepare(&ctx).unwrap();
            let mut out = Collector::new();

            op.execute(order(1, "book"), &mut out).unwrap();
            op.execute(payment(2, 5), &mut out).unwrap();
            assert!(out.is_empty());
            op.execute(payment(1, 30), &mut out).unwrap();

            assert_eq!(
                out.take(),
                vec![TupleValues::new(
                    "paid",
                    vec![Value::Int(1), Value::from("book"), Value::Int(30)]
                )]
            );
            op.cleanup();
        }
    }

    #[test]
    fn test_unknown_tuple_and_null_key_are_ignored() {
        let mut op = TupleJoinOperator::new(spec());
        op.prepare(&OperatorContext::detached("TUPLE_JOIN_1")).unwrap();
        let mut out = Collector::new();
        op.execute(Tuple::from_pairs("other", vec![]), &mut out).unwrap();
        op.execute(
            Tuple::from_pairs("order", vec![("item", Value::from("x"))]),
            &mut out,
        )
        .unwrap();
        op.execute(payment(1, 1), &mut out).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_output_tuple_defaults_to_first_side() {
        let mut s = spec();
        s.to_tuple = None;
        assert_eq!(s.output_tuple_name(), "order");
        assert_eq!(
            s.to_string(),
            "order(item, id) ON order.id JOIN payment(amount, order_id) ON payment.order_id \
             TO order, expire 1min, cached"
        );
    }
}
