//! Source operator
//!
//! One reader task per schema pulls records from its [`IngestAdapter`],
//! pushes them into the bounded spout queue and acknowledges each record
//! once it is queued. The spout loop drains the queue with
//! [`SourceOperator::next_batch`].
//!
//! [`IngestAdapter`]: crate::connector::IngestAdapter

use super::{OperatorContext, OperatorError};
use crate::connector::{ConnectorError, IngestAdapterFactory};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use tributary_core::{Schema, TupleValues};

#[derive(Debug, Clone)]
pub struct SpoutSpec {
    pub schemas: Vec<Schema>,
    pub factory: Arc<dyn IngestAdapterFactory>,
}

impl SpoutSpec {
    pub fn new(schemas: Vec<Schema>, factory: Arc<dyn IngestAdapterFactory>) -> Self {
        Self { schemas, factory }
    }

    pub fn schema(&self, name: &str) -> Option<&Schema> {
        self.schemas.iter().find(|s| s.name == name)
    }
}

impl fmt::Display for SpoutSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.schemas.iter().map(|s| s.name.as_str()).collect();
        write!(f, "{}", names.join(", "))
    }
}

pub struct SourceOperator {
    spec: SpoutSpec,
    receiver: Option<mpsc::Receiver<TupleValues>>,
    shutdown: Option<watch::Sender<bool>>,
    readers: Vec<JoinHandle<()>>,
    name: String,
}

impl SourceOperator {
    pub fn new(spec: SpoutSpec) -> Self {
        Self {
            spec,
            receiver: None,
            shutdown: None,
            readers: Vec::new(),
            name: String::new(),
        }
    }

    /// Starts one reader task per schema.
    pub fn open(&mut self, ctx: &OperatorContext) -> Result<(), OperatorError> {
        let runtime = ctx.runtime()?;
        let (tx, rx) = mpsc::channel(ctx.config.spout_queue_size.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.name = ctx.name.clone();

        for schema in &self.spec.schemas {
            let reader = spawn_reader(
                &runtime,
                self.spec.factory.clone(),
                schema.clone(),
                ctx.clone(),
                tx.clone(),
                shutdown_rx.clone(),
            );
            self.readers.push(reader);
        }
        info!("{}: started {} source readers", self.name, self.readers.len());

        self.receiver = Some(rx);
        self.shutdown = Some(shutdown_tx);
        Ok(())
    }

    /// Waits for the next queued tuples, returning at most `max`. `None`
    /// once every reader has stopped and the queue is empty.
    pub async fn next_batch(&mut self, max: usize) -> Option<Vec<TupleValues>> {
        let receiver = self.receiver.as_mut()?;
        let first = receiver.recv().await?;
        let mut batch = Vec::with_capacity(max.max(1));
        batch.push(first);
        while batch.len() < max {
            match receiver.try_recv() {
                Ok(values) => batch.push(values),
                Err(_) => break,
            }
        }
        Some(batch)
    }

    /// Stops the readers and waits for them to close their adapters.
    pub async fn close(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        self.receiver = None;
        for reader in self.readers.drain(..) {
            if let Err(e) = reader.await {
                warn!("{}: source reader failed: {}", self.name, e);
            }
        }
        debug!("{}: source closed", self.name);
    }
}

fn spawn_reader(
    runtime: &tokio::runtime::Handle,
    factory: Arc<dyn IngestAdapterFactory>,
    schema: Schema,
    ctx: OperatorContext,
    queue: mpsc::Sender<TupleValues>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    runtime.spawn(async move {
        let mut adapter = factory.create();
        if let Err(e) = adapter.open(&ctx.config, &ctx, &schema).await {
            error!("{}: failed to open source '{}': {}", ctx.name, schema.name, e);
            return;
        }
        let poll = ctx.config.source_poll_interval();

        'read: loop {
            if *shutdown.borrow() {
                break;
            }
            let read = tokio::select! {
                _ = shutdown.changed() => break,
                read = adapter.read() => read,
            };
            let records = match read {
                Ok(records) => records,
                Err(ConnectorError::Closed) => break,
                Err(e) => {
                    warn!("{}: read from '{}' failed: {}", ctx.name, schema.name, e);
                    Vec::new()
                }
            };
            if records.is_empty() {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(poll) => {}
                }
                continue;
            }
            for record in records {
                if record.values.len() != schema.fields.len() {
                    warn!(
                        "{}: record {} has {} values, schema '{}' has {} fields, dropped",
                        ctx.name,
                        record.message_id,
                        record.values.len(),
                        schema.name,
                        schema.fields.len()
                    );
                    continue;
                }
                let values = TupleValues::new(schema.name.clone(), record.values);
                if queue.send(values).await.is_err() {
                    break 'read;
                }
                if let Err(e) = adapter.ack(&record.message_id).await {
                    warn!("{}: ack of {} failed: {}", ctx.name, record.message_id, e);
                }
            }
        }

        if let Err(e) = adapter.close().await {
            warn!("{}: failed to close source '{}': {}", ctx.name, schema.name, e);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::MemorySource;
    use tokio::runtime::Handle;
    use tributary_core::Value;

    #[tokio::test]
    async fn test_readers_queue_and_ack() {
        let source = MemorySource::new();
        for i in 0..3 {
            source.push("access", vec![Value::Int(i), Value::from("/")]);
        }
        source.push("error", vec![Value::Int(500)]);
        source.push("error", vec![Value::Int(1), Value::Int(2)]);

        let spec = SpoutSpec::new(
            vec![
                Schema::new("access", vec!["id", "path"]),
                Schema::new("error", vec!["code"]),
            ],
            Arc::new(source.clone()),
        );
        let mut op = SourceOperator::new(spec);
        let ctx = OperatorContext::detached("SPOUT_0").with_runtime(Handle::current());
        op.open(&ctx).unwrap();

        let mut received = Vec::new();
        while received.len() < 4 {
            let batch = op.next_batch(16).await.unwrap();
            received.extend(batch);
        }
        let access = received.iter().filter(|t| t.tuple_name == "access").count();
        assert_eq!(access, 3);
        assert!(received.contains(&TupleValues::new("error", vec![Value::Int(500)])));

        op.close().await;
        assert_eq!(source.acked().len(), 4);
        assert_eq!(source.pending(), 0);
    }

    #[test]
    fn test_display() {
        let spec = SpoutSpec::new(
            vec![Schema::new("a", vec!["x"]), Schema::new("b", vec!["y"])],
            Arc::new(MemorySource::new()),
        );
        assert_eq!(spec.to_string(), "a, b");
        assert!(spec.schema("b").is_some());
    }
}
