//! Execution operators
//!
//! An operator is described by an immutable [`OperatorKind`] held in the
//! logical graph. Every physical instance is built from it with
//! [`OperatorKind::create`], so instances never share mutable state.
//!
//! # Lifecycle
//!
//! ```text
//! create() -> prepare(ctx) -> execute(tuple)* / on_timer()* -> cleanup()
//! ```
//!
//! `prepare` reads configuration and opens stores; `cleanup` runs at most
//! once and releases them. Output goes through the [`Dispatch`] handed to
//! `execute`, never to a concrete downstream operator.

pub mod each;
pub mod emit;
pub mod filter_group;
pub mod limit;
pub mod rename;
pub mod slide;
pub mod snapshot;
pub mod source;
pub mod tuple_join;

pub use each::EachOperator;
pub use emit::{EmitOperator, EmitSpec};
pub use filter_group::{FilterGroupOperator, FilterGroupSpec};
pub use limit::{LimitInterval, LimitKind, LimitOperator, LimitSpec};
pub use rename::{RenameOperator, RenameSpec};
pub use slide::{SlideLength, SlideOperator, SlideSpec};
pub use snapshot::{ExpireSpec, SnapshotInterval, SnapshotOperator, SnapshotSpec};
pub use source::{SourceOperator, SpoutSpec};
pub use tuple_join::{TupleJoinOperator, TupleJoinSpec};

use crate::aggregate::AggregateError;
use crate::condition::ConditionError;
use crate::config::EngineConfig;
use crate::connector::ConnectorError;
use crate::dispatch::Dispatch;
use crate::grouping::{GroupFields, Grouping};
use crate::projection::{OutputField, Projection};
use crate::store::StoreError;
use crate::timer::TimerRegistry;
use indexmap::IndexMap;
use rustc_hash::FxHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::runtime::Handle;
use tributary_core::{Clock, FieldAccessor, GroupKey, SystemClock, Tuple, Value};

#[derive(Debug, thiserror::Error)]
pub enum OperatorError {
    #[error("field error: {0}")]
    Field(String),

    #[error("aggregate error: {0}")]
    Aggregate(#[from] AggregateError),

    #[error("condition error: {0}")]
    Condition(#[from] ConditionError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("connector error: {0}")]
    Connector(#[from] ConnectorError),

    #[error("{0} needs an async runtime")]
    NoRuntime(String),

    #[error("{0} is not executable")]
    NotExecutable(String),
}

/// One physical operator instance.
pub trait ExecOperator: Send {
    fn prepare(&mut self, ctx: &OperatorContext) -> Result<(), OperatorError>;

    fn execute(&mut self, tuple: Tuple, out: &mut dyn Dispatch) -> Result<(), OperatorError>;

    /// Scheduled flush delivered on the instance's own consumer loop.
    fn on_timer(&mut self, _out: &mut dyn Dispatch) -> Result<(), OperatorError> {
        Ok(())
    }

    fn cleanup(&mut self) {}
}

/// Where an instance runs and what it may use while running.
#[derive(Clone)]
pub struct OperatorContext {
    pub id: u32,
    pub name: String,
    pub topology: String,
    pub task_index: usize,
    pub parallelism: usize,
    /// Key of the group this instance serves, for per-key instances.
    pub group_key: Option<GroupKey>,
    pub group_fields: Option<GroupFields>,
    /// Field-flow output of this operator, tuple name to field names.
    pub output_fields: Arc<IndexMap<String, Vec<String>>>,
    pub config: Arc<EngineConfig>,
    pub clock: Arc<dyn Clock>,
    /// Runtime for operators with async boundaries (source, emit).
    pub runtime: Option<Handle>,
    pub timers: Option<TimerRegistry>,
}

impl OperatorContext {
    /// Context for an instance running outside any execution unit.
    pub fn detached(name: &str) -> Self {
        Self {
            id: 0,
            name: name.to_string(),
            topology: String::new(),
            task_index: 0,
            parallelism: 1,
            group_key: None,
            group_fields: None,
            output_fields: Arc::new(IndexMap::new()),
            config: Arc::new(EngineConfig::default()),
            clock: Arc::new(SystemClock),
            runtime: None,
            timers: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = Arc::new(config);
        self
    }

    pub fn with_group_key(mut self, key: GroupKey) -> Self {
        self.group_key = Some(key);
        self
    }

    pub fn with_output_fields(mut self, fields: IndexMap<String, Vec<String>>) -> Self {
        self.output_fields = Arc::new(fields);
        self
    }

    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn with_timers(mut self, timers: TimerRegistry) -> Self {
        self.timers = Some(timers);
        self
    }

    /// Values readable through `_context.<name>` fields.
    pub fn context_fields(&self) -> IndexMap<String, Value> {
        let mut fields = IndexMap::new();
        fields.insert("topology".to_string(), Value::from(self.topology.as_str()));
        fields.insert("operator".to_string(), Value::from(self.name.as_str()));
        fields.insert("operator_id".to_string(), Value::Int(self.id as i64));
        fields.insert("task_index".to_string(), Value::Int(self.task_index as i64));
        fields.insert("parallelism".to_string(), Value::Int(self.parallelism as i64));
        fields
    }

    /// Unique name of this instance, used to name its on-disk stores.
    pub fn instance_name(&self) -> String {
        match &self.group_key {
            None => format!("{}-{}", self.name, self.task_index),
            Some(key) => {
                let mut hasher = FxHasher::default();
                key.hash(&mut hasher);
                format!("{}-{}-{:016x}", self.name, self.task_index, hasher.finish())
            }
        }
    }

    /// Partition key for window state: the group key, or the task index
    /// when the stream is not grouped.
    pub fn state_key(&self) -> Value {
        match &self.group_key {
            Some(key) => key.to_value(),
            None => Value::Int(self.task_index as i64),
        }
    }

    pub fn runtime(&self) -> Result<Handle, OperatorError> {
        self.runtime
            .clone()
            .or_else(|| Handle::try_current().ok())
            .ok_or_else(|| OperatorError::NoRuntime(self.name.clone()))
    }
}

impl fmt::Debug for OperatorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperatorContext")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("task_index", &self.task_index)
            .field("group_key", &self.group_key)
            .finish()
    }
}

/// Forwards every tuple unchanged. Repartition and merge stages execute as this.
#[derive(Debug, Default)]
pub struct PassThrough;

impl ExecOperator for PassThrough {
    fn prepare(&mut self, _ctx: &OperatorContext) -> Result<(), OperatorError> {
        Ok(())
    }

    fn execute(&mut self, tuple: Tuple, out: &mut dyn Dispatch) -> Result<(), OperatorError> {
        out.dispatch(tuple.into_tuple_values());
        Ok(())
    }
}

/// Operator specification held by the logical graph.
#[derive(Debug, Clone)]
pub enum OperatorKind {
    Spout(SpoutSpec),
    /// Repartition stage. Dispatch across it leaves the current unit.
    Partition(Grouping),
    /// Union of several streams.
    Merge,
    Each(Projection),
    Rename(RenameSpec),
    Slide(SlideSpec),
    Snapshot(SnapshotSpec),
    Limit(LimitSpec),
    FilterGroup(FilterGroupSpec),
    TupleJoin(TupleJoinSpec),
    Emit(EmitSpec),
}

impl OperatorKind {
    /// Upper-case prefix of generated operator names.
    pub fn tag(&self) -> &'static str {
        match self {
            OperatorKind::Spout(_) => "SPOUT",
            OperatorKind::Partition(_) => "PARTITION",
            OperatorKind::Merge => "MERGE",
            OperatorKind::Each(_) => "EACH",
            OperatorKind::Rename(_) => "RENAME",
            OperatorKind::Slide(_) => "SLIDE",
            OperatorKind::Snapshot(_) => "SNAPSHOT",
            OperatorKind::Limit(_) => "LIMIT",
            OperatorKind::FilterGroup(_) => "FILTER_GROUP",
            OperatorKind::TupleJoin(_) => "TUPLE_JOIN",
            OperatorKind::Emit(_) => "EMIT",
        }
    }

    pub fn is_spout(&self) -> bool {
        matches!(self, OperatorKind::Spout(_))
    }

    pub fn is_partition(&self) -> bool {
        matches!(self, OperatorKind::Partition(_))
    }

    pub fn is_merge(&self) -> bool {
        matches!(self, OperatorKind::Merge)
    }

    pub fn grouping(&self) -> Option<&Grouping> {
        match self {
            OperatorKind::Partition(g) => Some(g),
            _ => None,
        }
    }

    /// Declared output columns, or `None` when the operator passes its
    /// input fields through. Join and rename outputs are derived by the
    /// field-flow pass instead.
    pub fn declared_fields(&self) -> Option<Vec<OutputField>> {
        match self {
            OperatorKind::Each(p) => Some(p.output_fields()),
            OperatorKind::Slide(s) => Some(s.projection.output_fields()),
            OperatorKind::Snapshot(s) => Some(s.projection.output_fields()),
            OperatorKind::FilterGroup(s) => s.state_field.as_ref().map(|state| {
                vec![
                    OutputField::Accessor(FieldAccessor::wildcard()),
                    OutputField::Named(state.clone()),
                ]
            }),
            _ => None,
        }
    }

    /// Whether a grouped edge into this operator gets one instance per key.
    /// Joins buffer across keys and sinks share one egress worker, so both
    /// keep a single instance per task.
    pub fn keyed_instances(&self) -> bool {
        !matches!(self, OperatorKind::TupleJoin(_) | OperatorKind::Emit(_))
    }

    pub fn create(&self) -> Result<Box<dyn ExecOperator>, OperatorError> {
        Ok(match self {
            OperatorKind::Spout(_) => {
                return Err(OperatorError::NotExecutable(self.tag().to_string()))
            }
            OperatorKind::Partition(_) | OperatorKind::Merge => Box::new(PassThrough),
            OperatorKind::Each(p) => Box::new(EachOperator::new(p.clone())),
            OperatorKind::Rename(s) => Box::new(RenameOperator::new(s.clone())),
            OperatorKind::Slide(s) => Box::new(SlideOperator::new(s.clone())),
            OperatorKind::Snapshot(s) => Box::new(SnapshotOperator::new(s.clone())),
            OperatorKind::Limit(s) => Box::new(LimitOperator::new(s.clone())),
            OperatorKind::FilterGroup(s) => Box::new(FilterGroupOperator::new(s.clone())),
            OperatorKind::TupleJoin(s) => Box::new(TupleJoinOperator::new(s.clone())),
            OperatorKind::Emit(s) => Box::new(EmitOperator::new(s.clone())),
        })
    }

    /// Parameter summary shown by `explain`.
    pub fn description(&self) -> String {
        match self {
            OperatorKind::Spout(s) => s.to_string(),
            OperatorKind::Partition(g) => g.to_string(),
            OperatorKind::Merge => String::new(),
            OperatorKind::Each(p) => format!("[{}]", p),
            OperatorKind::Rename(s) => s.to_string(),
            OperatorKind::Slide(s) => s.to_string(),
            OperatorKind::Snapshot(s) => s.to_string(),
            OperatorKind::Limit(s) => s.to_string(),
            OperatorKind::FilterGroup(s) => s.to_string(),
            OperatorKind::TupleJoin(s) => s.to_string(),
            OperatorKind::Emit(s) => s.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Collector;
    use tributary_core::TupleValues;

    #[test]
    fn test_pass_through() {
        let mut op = OperatorKind::Merge.create().unwrap();
        op.prepare(&OperatorContext::detached("MERGE_1")).unwrap();
        let mut out = Collector::new();
        let tuple = Tuple::from_pairs("t", vec![("a", Value::Int(1))]);
        op.execute(tuple, &mut out).unwrap();
        assert_eq!(out.collected(), &[TupleValues::new("t", vec![Value::Int(1)])]);
    }

    #[test]
    fn test_context_fields_and_state_key() {
        let mut ctx = OperatorContext::detached("SLIDE_2");
        ctx.task_index = 3;
        let fields = ctx.context_fields();
        assert_eq!(fields.get("operator"), Some(&Value::from("SLIDE_2")));
        assert_eq!(ctx.state_key(), Value::Int(3));
        assert_eq!(ctx.instance_name(), "SLIDE_2-3");

        let keyed = ctx.with_group_key(GroupKey::new(vec![Value::from("u1")]));
        assert_eq!(keyed.state_key(), Value::from("u1"));
        assert!(keyed.instance_name().starts_with("SLIDE_2-3-"));
    }

    #[test]
    fn test_declared_fields() {
        let each = OperatorKind::Each(Projection::fields(&["a", "b"]));
        let names: Vec<String> = each
            .declared_fields()
            .unwrap()
            .iter()
            .map(|f| f.name().to_string())
            .collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(OperatorKind::Merge.declared_fields().is_none());
        assert!(OperatorKind::Merge.keyed_instances());
    }

    #[test]
    fn test_spout_is_not_executable() {
        let spout = OperatorKind::Spout(SpoutSpec::new(
            vec![],
            Arc::new(crate::connector::MemorySource::new()),
        ));
        assert!(matches!(
            spout.create(),
            Err(OperatorError::NotExecutable(_))
        ));
    }
}
