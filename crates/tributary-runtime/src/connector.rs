//! Ingestion and egress adapter interfaces
//!
//! The engine talks to the outside world only through these two traits.
//! A source operator runs one [`IngestAdapter`] per declared schema on its
//! own task; an emit operator hands batches to one [`EgressAdapter`] from a
//! dedicated egress worker. Both are created through factories so every
//! operator instance gets a private adapter.
//!
//! [`MemorySource`] and [`CollectingSink`] are in-process adapters for
//! tests and embedding.

use crate::config::EngineConfig;
use crate::operator::OperatorContext;
use async_trait::async_trait;
use indexmap::IndexMap;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use tributary_core::{Schema, TupleValues, Value};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectorError {
    #[error("open failed: {0}")]
    Open(String),

    #[error("read failed: {0}")]
    Read(String),

    #[error("write failed: {0}")]
    Write(String),

    #[error("adapter is closed")]
    Closed,
}

/// Opaque identifier a source uses to acknowledge a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageId(pub String);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One record read from a source, in schema field order.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord {
    pub values: Vec<Value>,
    pub message_id: MessageId,
}

/// Reads records of one schema from an external system.
///
/// # Lifecycle
///
/// 1. [`open`](Self::open) once with the schema it serves
/// 2. [`read`](Self::read) repeatedly; an empty batch means nothing is
///    available right now
/// 3. [`ack`](Self::ack) each record after it has been queued
/// 4. [`close`](Self::close) once on shutdown
#[async_trait]
pub trait IngestAdapter: Send {
    async fn open(
        &mut self,
        config: &EngineConfig,
        context: &OperatorContext,
        schema: &Schema,
    ) -> Result<(), ConnectorError>;

    async fn read(&mut self) -> Result<Vec<SourceRecord>, ConnectorError>;

    async fn ack(&mut self, message_id: &MessageId) -> Result<(), ConnectorError>;

    async fn close(&mut self) -> Result<(), ConnectorError>;
}

/// Writes projected tuples to an external system.
#[async_trait]
pub trait EgressAdapter: Send {
    /// `output_fields` maps each tuple name the sink can receive to the
    /// field names of its projected values.
    async fn open(
        &mut self,
        config: &EngineConfig,
        context: &OperatorContext,
        output_fields: &IndexMap<String, Vec<String>>,
    ) -> Result<(), ConnectorError>;

    async fn write(&mut self, batch: Vec<TupleValues>) -> Result<(), ConnectorError>;

    async fn close(&mut self) -> Result<(), ConnectorError>;
}

pub trait IngestAdapterFactory: Send + Sync + fmt::Debug {
    fn create(&self) -> Box<dyn IngestAdapter>;
}

pub trait EgressAdapterFactory: Send + Sync + fmt::Debug {
    fn create(&self) -> Box<dyn EgressAdapter>;
}

// =============================================================================
// In-memory adapters
// =============================================================================

/// Source fed from shared in-memory queues, one per schema name.
///
/// Every adapter created by the same `MemorySource` drains the same queues,
/// so pushing after the pipeline started is visible to the running readers.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    queues: Arc<Mutex<IndexMap<String, VecDeque<Vec<Value>>>>>,
    acked: Arc<Mutex<Vec<MessageId>>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, schema: &str, values: Vec<Value>) {
        if let Ok(mut queues) = self.queues.lock() {
            queues.entry(schema.to_string()).or_default().push_back(values);
        }
    }

    pub fn pending(&self) -> usize {
        self.queues
            .lock()
            .map(|q| q.values().map(VecDeque::len).sum())
            .unwrap_or(0)
    }

    pub fn acked(&self) -> Vec<MessageId> {
        self.acked.lock().map(|a| a.clone()).unwrap_or_default()
    }
}

impl IngestAdapterFactory for MemorySource {
    fn create(&self) -> Box<dyn IngestAdapter> {
        Box::new(MemoryReader {
            source: self.clone(),
            schema: None,
            seq: 0,
        })
    }
}

struct MemoryReader {
    source: MemorySource,
    schema: Option<String>,
    seq: u64,
}

/// Records handed out per `read`.
const MEMORY_READ_BATCH: usize = 64;

#[async_trait]
impl IngestAdapter for MemoryReader {
    async fn open(
        &mut self,
        _config: &EngineConfig,
        _context: &OperatorContext,
        schema: &Schema,
    ) -> Result<(), ConnectorError> {
        self.schema = Some(schema.name.clone());
        Ok(())
    }

    async fn read(&mut self) -> Result<Vec<SourceRecord>, ConnectorError> {
        let schema = self.schema.as_ref().ok_or(ConnectorError::Closed)?;
        let mut queues = self
            .source
            .queues
            .lock()
            .map_err(|e| ConnectorError::Read(e.to_string()))?;
        let Some(queue) = queues.get_mut(schema) else {
            return Ok(Vec::new());
        };
        let n = queue.len().min(MEMORY_READ_BATCH);
        let mut records = Vec::with_capacity(n);
        for values in queue.drain(..n) {
            self.seq += 1;
            records.push(SourceRecord {
                values,
                message_id: MessageId(format!("{}-{}", schema, self.seq)),
            });
        }
        Ok(records)
    }

    async fn ack(&mut self, message_id: &MessageId) -> Result<(), ConnectorError> {
        self.source
            .acked
            .lock()
            .map_err(|e| ConnectorError::Read(e.to_string()))?
            .push(message_id.clone());
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ConnectorError> {
        self.schema = None;
        Ok(())
    }
}

/// Sink that appends every written tuple to a shared buffer.
#[derive(Debug, Clone, Default)]
pub struct CollectingSink {
    written: Arc<Mutex<Vec<TupleValues>>>,
    output_fields: Arc<Mutex<IndexMap<String, Vec<String>>>>,
    closed: Arc<Mutex<bool>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn written(&self) -> Vec<TupleValues> {
        self.written.lock().map(|w| w.clone()).unwrap_or_default()
    }

    /// Field names the sink was opened with.
    pub fn output_fields(&self) -> IndexMap<String, Vec<String>> {
        self.output_fields
            .lock()
            .map(|f| f.clone())
            .unwrap_or_default()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.lock().map(|c| *c).unwrap_or(false)
    }
}

impl EgressAdapterFactory for CollectingSink {
    fn create(&self) -> Box<dyn EgressAdapter> {
        Box::new(self.clone())
    }
}

#[async_trait]
impl EgressAdapter for CollectingSink {
    async fn open(
        &mut self,
        _config: &EngineConfig,
        _context: &OperatorContext,
        output_fields: &IndexMap<String, Vec<String>>,
    ) -> Result<(), ConnectorError> {
        *self
            .output_fields
            .lock()
            .map_err(|e| ConnectorError::Open(e.to_string()))? = output_fields.clone();
        Ok(())
    }

    async fn write(&mut self, batch: Vec<TupleValues>) -> Result<(), ConnectorError> {
        self.written
            .lock()
            .map_err(|e| ConnectorError::Write(e.to_string()))?
            .extend(batch);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ConnectorError> {
        if let Ok(mut closed) = self.closed.lock() {
            *closed = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_source_reads_and_acks() {
        let source = MemorySource::new();
        source.push("access", vec![Value::Int(1)]);
        source.push("access", vec![Value::Int(2)]);
        source.push("other", vec![Value::Int(3)]);

        let mut reader = source.create();
        let ctx = OperatorContext::detached("SPOUT_0");
        reader
            .open(&EngineConfig::default(), &ctx, &Schema::new("access", vec!["n"]))
            .await
            .unwrap();
        let records = reader.read().await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].values, vec![Value::Int(2)]);
        for r in &records {
            reader.ack(&r.message_id).await.unwrap();
        }
        assert_eq!(source.acked().len(), 2);
        assert!(reader.read().await.unwrap().is_empty());
        assert_eq!(source.pending(), 1);

        reader.close().await.unwrap();
        assert_eq!(reader.read().await, Err(ConnectorError::Closed));
    }

    #[tokio::test]
    async fn test_collecting_sink() {
        let sink = CollectingSink::new();
        let mut adapter = sink.create();
        let mut fields = IndexMap::new();
        fields.insert("access".to_string(), vec!["n".to_string()]);
        let ctx = OperatorContext::detached("EMIT_1");
        adapter
            .open(&EngineConfig::default(), &ctx, &fields)
            .await
            .unwrap();
        adapter
            .write(vec![TupleValues::new("access", vec![Value::Int(1)])])
            .await
            .unwrap();
        adapter.close().await.unwrap();
        assert_eq!(sink.written().len(), 1);
        assert_eq!(sink.output_fields(), fields);
        assert!(sink.is_closed());
    }
}
