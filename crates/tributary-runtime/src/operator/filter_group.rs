//! Multi-condition temporal filter
//!
//! Each condition keeps a deadline of `match time + expire`. A tuple is
//! passed on once every condition holds a live deadline, after which all
//! deadlines reset, so the next pass needs every condition to match again.
//!
//! ```text
//! expire 10s, conditions [A, B]
//! t=0  A matches   keep = [10, 0]
//! t=5  B matches   keep = [10, 15]  -> dispatch, reset
//! t=11 B matches   keep = [0, 21]
//! t=12 A matches   keep = [22, 21]  -> dispatch, reset
//! ```

use super::{ExecOperator, OperatorContext, OperatorError};
use crate::condition::Condition;
use crate::dispatch::Dispatch;
use std::fmt;
use std::sync::Arc;
use tributary_core::{Clock, Period, SystemClock, Tuple, Value};

#[derive(Debug, Clone, PartialEq)]
pub struct FilterGroupSpec {
    pub expire: Period,
    pub conditions: Vec<Condition>,
    /// When set, the passed tuple gets one extra field holding the deadline
    /// of every condition.
    pub state_field: Option<String>,
}

impl FilterGroupSpec {
    pub fn new(expire: Period, conditions: Vec<Condition>) -> Self {
        Self {
            expire,
            conditions,
            state_field: None,
        }
    }

    pub fn with_state_field(mut self, name: impl Into<String>) -> Self {
        self.state_field = Some(name.into());
        self
    }
}

impl fmt::Display for FilterGroupSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "expire {}, [", self.expire)?;
        for (i, c) in self.conditions.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", c)?;
        }
        write!(f, "]")?;
        if let Some(state) = &self.state_field {
            write!(f, ", state {}", state)?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct FilterGroupOperator {
    spec: FilterGroupSpec,
    /// Deadline of each condition in epoch seconds; 0 when not matched.
    keep_times: Vec<i64>,
    clock: Arc<dyn Clock>,
}

impl FilterGroupOperator {
    pub fn new(spec: FilterGroupSpec) -> Self {
        let keep_times = vec![0; spec.conditions.len()];
        Self {
            spec,
            keep_times,
            clock: Arc::new(SystemClock),
        }
    }
}

impl ExecOperator for FilterGroupOperator {
    fn prepare(&mut self, ctx: &OperatorContext) -> Result<(), OperatorError> {
        self.clock = ctx.clock.clone();
        Ok(())
    }

    fn execute(&mut self, tuple: Tuple, out: &mut dyn Dispatch) -> Result<(), OperatorError> {
        if self.keep_times.is_empty() {
            return Ok(());
        }
        let now = self.clock.now_secs() as i64;

        for keep in self.keep_times.iter_mut() {
            if *keep > 0 && now > *keep {
                *keep = 0;
            }
        }

        for (i, condition) in self.spec.conditions.iter().enumerate() {
            if condition.evaluate(&tuple)? {
                self.keep_times[i] = now + self.spec.expire.secs() as i64;
            }
        }

        if self.keep_times.iter().all(|&keep| keep != 0) {
            let mut values = tuple.into_tuple_values();
            if self.spec.state_field.is_some() {
                let state = self
                    .keep_times
                    .iter()
                    .map(|&keep| Value::Timestamp(keep * 1000))
                    .collect();
                values.values.push(Value::Array(state));
            }
            out.dispatch(values);
            self.keep_times.iter_mut().for_each(|keep| *keep = 0);
        }
        Ok(())
    }
}
