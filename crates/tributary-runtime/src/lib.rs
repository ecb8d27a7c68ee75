//! Tributary Runtime - plan compiler and execution engine
//!
//! A [`Topology`] is compiled into a [`PhysicalPlan`] of parallel units
//! joined by repartition stages. Units are built from stateful operators
//! (sliding windows, snapshots, rate limits, condition groups, multi-way
//! joins) whose state lives in a [`TupleStore`], either in memory or in an
//! ordered on-disk keyspace. [`LocalCluster`] runs a plan in process.

pub mod aggregate;
pub mod cache;
pub mod condition;
pub mod config;
pub mod connector;
pub mod cron;
pub mod dispatch;
pub mod grouping;
pub mod join;
pub mod local;
pub mod operator;
pub mod projection;
pub mod store;
pub mod timer;
pub mod topology;
pub mod unit;

pub use aggregate::{AggregateError, AggregateKind, AggregateSpec, IncrementalAggregate};
pub use cache::{open_ttl_cache, TtlCache};
pub use condition::{CompareOp, Condition, ConditionError};
pub use config::{EngineConfig, StoreBackend};
pub use connector::{
    CollectingSink, ConnectorError, EgressAdapter, EgressAdapterFactory, IngestAdapter,
    IngestAdapterFactory, MemorySource, MessageId, SourceRecord,
};
pub use cron::{CronError, CronSchedule};
pub use dispatch::{Collector, Dispatch, Dispatcher};
pub use grouping::{GroupFields, Grouping};
pub use join::{JoinContext, JoinKey, JoinMode, JoinSide};
pub use local::LocalCluster;
pub use operator::{
    EmitSpec, ExecOperator, ExpireSpec, FilterGroupSpec, LimitInterval, LimitKind, LimitSpec,
    OperatorContext, OperatorError, OperatorKind, SlideLength, SlideSpec, SnapshotInterval,
    SnapshotSpec, SpoutSpec, TupleJoinSpec,
};
pub use projection::{OutputField, Projection, ProjectionItem};
pub use store::{open_tuple_store, InMemoryTupleStore, Query, StoreError, TimeCondition, TupleStore};
pub use timer::{spawn_timer, TimerRegistry, TimerSchedule};
pub use topology::{CompileError, PhysicalPlan, Stream, Topology};
pub use unit::{UnitMessage, UnitTask};
