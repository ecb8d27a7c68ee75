//! Periodic snapshots of running aggregates
//!
//! - `Count(n)`: emit the current row after every `n` inputs, then reset
//! - `Time(period)` / `Cron(expr)`: keep the latest row and emit it when the
//!   timer fires; nothing is emitted for an interval without input
//!
//! Timed snapshots reset their aggregates when a new interval starts, or
//! only once the optional expire schedule has elapsed, so aggregates can
//! span several snapshots.

use super::{ExecOperator, OperatorContext, OperatorError};
use crate::aggregate::IncrementalAggregate;
use crate::cron::CronSchedule;
use crate::dispatch::Dispatch;
use crate::projection::Projection;
use crate::timer::TimerSchedule;
use chrono::{TimeZone, Utc};
use indexmap::IndexMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error};
use tributary_core::{Clock, Period, SystemClock, Tuple, TupleValues, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotInterval {
    Count(usize),
    Time(Period),
    Cron(CronSchedule),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExpireSpec {
    Time(Period),
    Cron(CronSchedule),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotSpec {
    pub interval: SnapshotInterval,
    pub projection: Projection,
    pub expire: Option<ExpireSpec>,
}

impl SnapshotSpec {
    pub fn new(interval: SnapshotInterval, projection: Projection) -> Self {
        Self {
            interval,
            projection,
            expire: None,
        }
    }

    pub fn with_expire(mut self, expire: ExpireSpec) -> Self {
        self.expire = Some(expire);
        self
    }
}

impl fmt::Display for SnapshotSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.interval {
            SnapshotInterval::Count(n) => write!(f, "every {}", n)?,
            SnapshotInterval::Time(p) => write!(f, "every {}", p)?,
            SnapshotInterval::Cron(c) => write!(f, "cron '{}'", c)?,
        }
        write!(f, ", [{}]", self.projection)?;
        match &self.expire {
            Some(ExpireSpec::Time(p)) => write!(f, ", expire {}", p),
            Some(ExpireSpec::Cron(c)) => write!(f, ", expire '{}'", c),
            None => Ok(()),
        }
    }
}

#[derive(Debug)]
pub struct SnapshotOperator {
    spec: SnapshotSpec,
    aggregates: Vec<Box<dyn IncrementalAggregate>>,
    counter: usize,
    pending: Option<TupleValues>,
    /// Next aggregate reset in epoch millis; 0 when unscheduled.
    expire_time: i64,
    context: IndexMap<String, Value>,
    clock: Arc<dyn Clock>,
    name: String,
}

impl SnapshotOperator {
    pub fn new(spec: SnapshotSpec) -> Self {
        let aggregates = spec.projection.create_aggregates();
        Self {
            spec,
            aggregates,
            counter: 0,
            pending: None,
            expire_time: 0,
            context: IndexMap::new(),
            clock: Arc::new(SystemClock),
            name: String::new(),
        }
    }

    fn next_cron_millis(cron: &CronSchedule, now_millis: i64) -> i64 {
        Utc.timestamp_millis_opt(now_millis)
            .single()
            .and_then(|now| cron.next_after(now))
            .map_or(0, |next| next.timestamp_millis())
    }

    fn row(&mut self, tuple: &Tuple) -> Result<TupleValues, OperatorError> {
        let inputs = self.spec.projection.aggregate_inputs(tuple, &self.context);
        for (aggregate, input) in self.aggregates.iter_mut().zip(&inputs) {
            aggregate.include(input)?;
        }
        let current: Vec<Value> = self.aggregates.iter().map(|a| a.current()).collect();
        let values = self.spec.projection.project(tuple, &self.context, &current);
        Ok(TupleValues::new(tuple.tuple_name(), values))
    }

    fn clear(&mut self) {
        self.aggregates.iter_mut().for_each(|a| a.clear());
    }

    /// Called when the first tuple of an interval arrives.
    fn expire(&mut self) {
        let now = self.clock.now_millis();
        match &self.spec.expire {
            None => self.clear(),
            Some(expire) => {
                if self.expire_time <= 0 || now < self.expire_time {
                    return;
                }
                debug!("{}: expire {} >= {}", self.name, now, self.expire_time);
                self.expire_time = match expire {
                    ExpireSpec::Cron(cron) => Self::next_cron_millis(cron, now),
                    ExpireSpec::Time(period) => {
                        let step = (period.secs().max(1) as i64) * 1000;
                        self.expire_time + ((now - self.expire_time) / step + 1) * step
                    }
                };
                self.clear();
            }
        }
    }
}

impl ExecOperator for SnapshotOperator {
    fn prepare(&mut self, ctx: &OperatorContext) -> Result<(), OperatorError> {
        self.clock = ctx.clock.clone();
        self.context = ctx.context_fields();
        self.name = ctx.name.clone();
        self.counter = 0;

        let schedule = match &self.spec.interval {
            SnapshotInterval::Count(_) => return Ok(()),
            SnapshotInterval::Time(p) => TimerSchedule::Every(*p),
            SnapshotInterval::Cron(c) => TimerSchedule::Cron(c.clone()),
        };
        match &ctx.timers {
            Some(timers) => {
                timers.register(ctx.id, schedule);
            }
            None => error!("{}: no timer service, snapshots will not be emitted", self.name),
        }

        let now = self.clock.now_millis();
        self.expire_time = match &self.spec.expire {
            None => 0,
            Some(ExpireSpec::Time(p)) => now + p.secs() as i64 * 1000,
            Some(ExpireSpec::Cron(c)) => Self::next_cron_millis(c, now),
        };
        Ok(())
    }

    fn execute(&mut self, tuple: Tuple, out: &mut dyn Dispatch) -> Result<(), OperatorError> {
        match self.spec.interval {
            SnapshotInterval::Count(n) => {
                let row = self.row(&tuple)?;
                self.counter += 1;
                if self.counter >= n {
                    out.dispatch(row);
                    self.clear();
                    self.counter = 0;
                }
            }
            SnapshotInterval::Time(_) | SnapshotInterval::Cron(_) => {
                if self.pending.is_none() {
                    self.expire();
                }
                self.pending = Some(self.row(&tuple)?);
            }
        }
        Ok(())
    }

    fn on_timer(&mut self, out: &mut dyn Dispatch) -> Result<(), OperatorError> {
        if let Some(row) = self.pending.take() {
            out.dispatch(row);
        }
        Ok(())
    }
}
