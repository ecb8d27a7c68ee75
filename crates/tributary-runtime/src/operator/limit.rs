//! Rate limiting by count or time interval

use super::{ExecOperator, OperatorContext, OperatorError};
use crate::dispatch::Dispatch;
use std::fmt;
use std::sync::Arc;
use tributary_core::{Clock, Period, SystemClock, Tuple, TupleValues};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitKind {
    /// Pass the first tuple of each interval.
    First,
    /// Pass the last tuple of each interval.
    Last,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitInterval {
    Count(usize),
    Time(Period),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitSpec {
    pub kind: LimitKind,
    pub interval: LimitInterval,
}

impl LimitSpec {
    pub fn first(interval: LimitInterval) -> Self {
        Self {
            kind: LimitKind::First,
            interval,
        }
    }

    pub fn last(interval: LimitInterval) -> Self {
        Self {
            kind: LimitKind::Last,
            interval,
        }
    }
}

impl fmt::Display for LimitSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            LimitKind::First => "FIRST",
            LimitKind::Last => "LAST",
        };
        match self.interval {
            LimitInterval::Count(n) => write!(f, "{}, count {}", kind, n),
            LimitInterval::Time(p) => write!(f, "{}, every {}", kind, p),
        }
    }
}

#[derive(Debug)]
pub struct LimitOperator {
    spec: LimitSpec,
    counter: usize,
    /// End of the current time interval in epoch seconds; 0 before the first tuple.
    limit_time: i64,
    last: Option<TupleValues>,
    clock: Arc<dyn Clock>,
}

impl LimitOperator {
    pub fn new(spec: LimitSpec) -> Self {
        Self {
            spec,
            counter: 0,
            limit_time: 0,
            last: None,
            clock: Arc::new(SystemClock),
        }
    }

    fn execute_count(&mut self, n: usize, current: TupleValues, out: &mut dyn Dispatch) {
        if self.counter == 0 && self.spec.kind == LimitKind::First {
            out.dispatch(current.clone());
        }
        self.counter += 1;
        if self.counter >= n {
            if self.spec.kind == LimitKind::Last {
                out.dispatch(current);
            }
            self.counter = 0;
        }
    }

    fn execute_time(&mut self, period: Period, current: TupleValues, out: &mut dyn Dispatch) {
        let now = self.clock.now_secs() as i64;
        if self.limit_time == 0 {
            if self.spec.kind == LimitKind::First {
                out.dispatch(current.clone());
            }
            self.limit_time = now + period.secs() as i64;
        } else if now > self.limit_time {
            match self.spec.kind {
                LimitKind::First => out.dispatch(current.clone()),
                LimitKind::Last => {
                    if let Some(last) = self.last.take() {
                        out.dispatch(last);
                    }
                }
            }
            self.limit_time = now + period.secs() as i64;
        }
        self.last = Some(current);
    }
}

impl ExecOperator for LimitOperator {
    fn prepare(&mut self, ctx: &OperatorContext) -> Result<(), OperatorError> {
        self.clock = ctx.clock.clone();
        Ok(())
    }

    fn execute(&mut self, tuple: Tuple, out: &mut dyn Dispatch) -> Result<(), OperatorError> {
        let current = tuple.into_tuple_values();
        match self.spec.interval {
            LimitInterval::Count(n) => self.execute_count(n.max(1), current, out),
            LimitInterval::Time(period) => self.execute_time(period, current, out),
        }
        Ok(())
    }
}
