//! Topology builder and compiler
//!
//! A [`Topology`] records a logical operator graph from a chain of stream
//! calls. [`Topology::compile`] rewrites it into a [`PhysicalPlan`]: the
//! units an execution substrate runs and how tuples move between them.
//!
//! ```ignore
//! let mut topology = Topology::new("errors");
//! let logs = topology.from_source(SpoutSpec::new(schemas, source));
//! let errors = topology.group_by(&logs.select(&["error"])?, GroupFields::of(&["host"]))?;
//! let counted = topology.slide(&errors, SlideSpec::count(100, projection))?;
//! topology.emit(&counted, EmitSpec::all(sink))?;
//! let plan = topology.compile()?;
//! ```

pub mod compiler;
pub mod fields;
pub mod graph;
pub mod plan;

pub use compiler::{compile, SPOUT_UNIT_NAME};
pub use fields::{FieldFlow, TupleFields};
pub use graph::{Graph, Node, NodeIndex, StreamEdge};
pub use plan::{PhysicalPlan, UnitLink, UnitRef, UnitSpec};

use crate::config::EngineConfig;
use crate::grouping::{GroupFields, Grouping};
use crate::operator::{
    EmitSpec, FilterGroupSpec, LimitSpec, OperatorKind, RenameSpec, SlideSpec, SnapshotSpec,
    SpoutSpec, TupleJoinSpec,
};
use crate::projection::Projection;
use graph::merge_selector;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("{0} is not registered")]
    NotRegistered(&'static str),

    #[error("{operator} has duplicate field '{field}'")]
    DuplicateField { operator: String, field: String },

    #[error("{operator} can't declare a tuple-qualified output field")]
    TupleAccessor { operator: String },

    #[error("Can't merge grouped and ungrouped streams")]
    MergeGroupedAndUngrouped,

    #[error("Duplicate path to the same tuple")]
    DuplicatePath,

    #[error("Can't merge streams with different group fields")]
    MergeDifferentGroups,

    #[error("unknown operator {0}")]
    UnknownOperator(String),

    #[error("invalid graph: {0}")]
    InvalidGraph(String),

    #[error("invalid stream: {0}")]
    InvalidStream(String),
}

/// Output of one operator as seen by the next: the producing node, the
/// tuple names selected from it and, for grouped streams, the key fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Stream {
    source: NodeIndex,
    selector: Option<Vec<String>>,
    group_fields: Option<GroupFields>,
}

impl Stream {
    fn new(source: NodeIndex) -> Self {
        Self {
            source,
            selector: None,
            group_fields: None,
        }
    }

    pub fn source(&self) -> NodeIndex {
        self.source
    }

    pub fn selector(&self) -> Option<&[String]> {
        self.selector.as_deref()
    }

    pub fn group_fields(&self) -> Option<&GroupFields> {
        self.group_fields.as_ref()
    }

    pub fn is_grouped(&self) -> bool {
        self.group_fields.is_some()
    }

    /// Narrows the stream to `tuple_names`, which must already be selected.
    pub fn select(&self, tuple_names: &[&str]) -> Result<Stream, CompileError> {
        if tuple_names.is_empty() {
            return Err(CompileError::InvalidStream("Nothing to select".to_string()));
        }
        if let Some(selector) = &self.selector {
            if !tuple_names.iter().all(|t| selector.iter().any(|s| s == t)) {
                return Err(CompileError::InvalidStream(format!(
                    "Can't select ({}) from ({}) on stream",
                    tuple_names.join(", "),
                    selector.join(", ")
                )));
            }
        }
        Ok(Stream {
            selector: Some(tuple_names.iter().map(|t| t.to_string()).collect()),
            ..self.clone()
        })
    }

    /// Leaves the innermost grouping.
    pub fn end_group(&self) -> Stream {
        Stream {
            group_fields: self
                .group_fields
                .as_ref()
                .and_then(|g| g.parent().cloned()),
            ..self.clone()
        }
    }

    /// The same tuples with no grouping at all.
    pub fn to_stream(&self) -> Stream {
        Stream {
            group_fields: None,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone)]
pub struct Topology {
    name: String,
    graph: Graph,
    config: EngineConfig,
}

impl Topology {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            graph: Graph::new(),
            config: EngineConfig::default(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Adds the single source of the topology.
    pub fn from_source(&mut self, spec: SpoutSpec) -> Stream {
        let node = self.graph.add_node(OperatorKind::Spout(spec), 1);
        Stream::new(node)
    }

    fn check(&self, stream: &Stream) -> Result<(), CompileError> {
        if self.graph.contains(stream.source) {
            Ok(())
        } else {
            Err(CompileError::UnknownOperator(stream.source.to_string()))
        }
    }

    /// Connects `stream` to `node`, merging selectors when they are
    /// already connected.
    fn connect(&mut self, stream: &Stream, node: NodeIndex) {
        let mut edge = StreamEdge::new(stream.source, node, stream.selector.clone());
        if let Some(group_fields) = &stream.group_fields {
            edge = edge.grouped(group_fields.clone());
        }
        if let Some(existing) = self.graph.find_edge_mut(stream.source, node) {
            existing.selector =
                merge_selector(existing.selector.as_deref(), stream.selector.as_deref());
            return;
        }
        self.graph.add_edge(edge);
    }

    fn add_operator(&mut self, stream: &Stream, kind: OperatorKind) -> Result<Stream, CompileError> {
        self.check(stream)?;
        let node = self.graph.add_node(kind, 0);
        self.connect(stream, node);
        debug!("{} <- {}", self.graph.name(node), self.graph.name(stream.source));
        Ok(Stream {
            source: node,
            selector: None,
            group_fields: stream.group_fields.clone(),
        })
    }

    pub fn each(&mut self, stream: &Stream, projection: Projection) -> Result<Stream, CompileError> {
        if projection.is_empty() {
            return Err(CompileError::InvalidStream("Each has no fields".to_string()));
        }
        self.add_operator(stream, OperatorKind::Each(projection))
    }

    pub fn slide(&mut self, stream: &Stream, spec: SlideSpec) -> Result<Stream, CompileError> {
        self.add_operator(stream, OperatorKind::Slide(spec))
    }

    pub fn snapshot(&mut self, stream: &Stream, spec: SnapshotSpec) -> Result<Stream, CompileError> {
        self.add_operator(stream, OperatorKind::Snapshot(spec))
    }

    pub fn limit(&mut self, stream: &Stream, spec: LimitSpec) -> Result<Stream, CompileError> {
        self.add_operator(stream, OperatorKind::Limit(spec))
    }

    pub fn filter_group(
        &mut self,
        stream: &Stream,
        spec: FilterGroupSpec,
    ) -> Result<Stream, CompileError> {
        if spec.conditions.is_empty() {
            return Err(CompileError::InvalidStream(
                "FilterGroup has no conditions".to_string(),
            ));
        }
        self.add_operator(stream, OperatorKind::FilterGroup(spec))
    }

    pub fn emit(&mut self, stream: &Stream, spec: EmitSpec) -> Result<Stream, CompileError> {
        self.add_operator(stream, OperatorKind::Emit(spec))
    }

    /// Renames the single selected tuple to `to`.
    pub fn alias(&mut self, stream: &Stream, to: &str) -> Result<Stream, CompileError> {
        let from = match stream.selector.as_deref() {
            Some([from]) => from.clone(),
            _ => {
                return Err(CompileError::InvalidStream(
                    "Alias needs a stream of exactly one tuple".to_string(),
                ))
            }
        };
        let renamed = self.add_operator(stream, OperatorKind::Rename(RenameSpec::new(from, to)))?;
        Ok(Stream {
            selector: Some(vec![to.to_string()]),
            ..renamed
        })
    }

    /// Explicit repartition stage.
    pub fn partition(&mut self, stream: &Stream, grouping: Grouping) -> Result<Stream, CompileError> {
        self.add_operator(&stream.to_stream(), OperatorKind::Partition(grouping))
    }

    /// Groups the stream by `group_fields`. An ungrouped stream is
    /// repartitioned on the fields; a grouped one nests inside its group.
    pub fn group_by(
        &mut self,
        stream: &Stream,
        group_fields: GroupFields,
    ) -> Result<Stream, CompileError> {
        self.check(stream)?;
        if group_fields.fields().is_empty() {
            return Err(CompileError::InvalidStream("Nothing to group by".to_string()));
        }
        match &stream.group_fields {
            Some(parent) => Ok(Stream {
                group_fields: Some(group_fields.with_parent(parent.clone())),
                ..stream.clone()
            }),
            None => {
                let partitioned =
                    self.partition(stream, Grouping::Fields(group_fields.clone()))?;
                Ok(Stream {
                    group_fields: Some(group_fields),
                    ..partitioned
                })
            }
        }
    }

    pub fn set_parallelism(&mut self, stream: &Stream, parallelism: u32) -> Result<Stream, CompileError> {
        self.check(stream)?;
        if parallelism == 0 {
            return Err(CompileError::InvalidStream(
                "Parallelism must be at least 1".to_string(),
            ));
        }
        self.graph[stream.source].parallelism = parallelism;
        Ok(stream.clone())
    }

    /// Union of several streams.
    ///
    /// Ungrouped streams of one producer only widen the selector. Anything
    /// else goes through a merge node. Streams may not select the same
    /// tuple twice.
    pub fn merge(&mut self, streams: &[Stream]) -> Result<Stream, CompileError> {
        let (first, rest) = streams
            .split_first()
            .ok_or_else(|| CompileError::InvalidStream("Streams is empty".to_string()))?;
        for stream in streams {
            self.check(stream)?;
        }
        if rest.is_empty() {
            return Ok(first.clone());
        }

        let grouped = streams.iter().filter(|s| s.is_grouped()).count();
        if grouped != 0 && grouped != streams.len() {
            return Err(CompileError::MergeGroupedAndUngrouped);
        }

        let mut seen: Vec<(NodeIndex, &str)> = Vec::new();
        for stream in streams {
            let selector = stream.selector.as_ref().ok_or(CompileError::DuplicatePath)?;
            for tuple in selector {
                if seen.contains(&(stream.source, tuple.as_str())) {
                    return Err(CompileError::DuplicatePath);
                }
                seen.push((stream.source, tuple.as_str()));
            }
        }

        if grouped == 0 {
            if rest.iter().all(|s| s.source == first.source) {
                let selector = rest.iter().fold(first.selector.clone(), |acc, s| {
                    merge_selector(acc.as_deref(), s.selector.as_deref())
                });
                return Ok(Stream {
                    source: first.source,
                    selector,
                    group_fields: None,
                });
            }
        } else if rest.iter().any(|s| s.group_fields != first.group_fields) {
            return Err(CompileError::MergeDifferentGroups);
        }

        let node = self.graph.add_node(OperatorKind::Merge, 0);
        for stream in streams {
            self.connect(stream, node);
        }
        Ok(Stream {
            source: node,
            selector: None,
            group_fields: first.group_fields.clone(),
        })
    }

    /// Joins streams that each select exactly one tuple named after a side
    /// of `spec`. Inputs are repartitioned on each side's key so equal
    /// keys meet in the same task.
    pub fn join(&mut self, streams: &[Stream], spec: TupleJoinSpec) -> Result<Stream, CompileError> {
        let sides = spec.context.sides();
        if sides.len() < 2 {
            return Err(CompileError::InvalidStream(
                "A join needs at least two sides".to_string(),
            ));
        }
        for stream in streams {
            match stream.selector.as_deref() {
                Some([tuple]) if spec.context.side_of(tuple).is_some() => {}
                Some([tuple]) => {
                    return Err(CompileError::InvalidStream(format!(
                        "Tuple '{}' is not a join side",
                        tuple
                    )))
                }
                _ => {
                    return Err(CompileError::InvalidStream(
                        "Each joined stream must select exactly one tuple".to_string(),
                    ))
                }
            }
        }

        let merged = self.merge(&streams.iter().map(Stream::to_stream).collect::<Vec<_>>())?;
        let grouping = Grouping::Select(
            sides
                .iter()
                .map(|side| {
                    let fields = side.key().fields().into_iter().cloned().collect();
                    (
                        side.tuple_name().to_string(),
                        Grouping::Fields(GroupFields::new(fields)),
                    )
                })
                .collect(),
        );
        let partitioned = self.partition(&merged, grouping)?;
        let output = spec.output_tuple_name().to_string();
        let joined = self.add_operator(&partitioned, OperatorKind::TupleJoin(spec))?;
        Ok(Stream {
            selector: Some(vec![output]),
            ..joined
        })
    }

    pub fn compile(&self) -> Result<PhysicalPlan, CompileError> {
        compile(&self.name, &self.graph, &self.config)
    }

    pub fn explain(&self, extended: bool) -> Result<String, CompileError> {
        Ok(self.compile()?.explain(extended))
    }
}
