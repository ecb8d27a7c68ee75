//! Sink operator
//!
//! `execute` projects the tuple, queues the projection for the egress
//! worker and passes the original tuple on unchanged. The worker runs on
//! the async runtime and hands queued tuples to the [`EgressAdapter`] in
//! batches of at most `emit_tuples_max`.
//!
//! On cleanup the queue is closed, the worker writes what is still queued
//! and closes the adapter. If that takes longer than the shutdown grace
//! period the worker is aborted.
//!
//! [`EgressAdapter`]: crate::connector::EgressAdapter

use super::{ExecOperator, OperatorContext, OperatorError};
use crate::connector::{ConnectorError, EgressAdapterFactory};
use crate::dispatch::Dispatch;
use indexmap::IndexMap;
use std::fmt;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use tributary_core::{FieldAccessor, Tuple, TupleValues, Value};

#[derive(Debug, Clone)]
pub struct EmitSpec {
    pub fields: Vec<FieldAccessor>,
    pub factory: Arc<dyn EgressAdapterFactory>,
}

impl EmitSpec {
    pub fn new(fields: Vec<FieldAccessor>, factory: Arc<dyn EgressAdapterFactory>) -> Self {
        Self { fields, factory }
    }

    /// Emits every field of every tuple.
    pub fn all(factory: Arc<dyn EgressAdapterFactory>) -> Self {
        Self::new(vec![FieldAccessor::wildcard()], factory)
    }

    /// Field names of the projection for each tuple name in `input`.
    pub fn egress_fields(
        &self,
        input: &IndexMap<String, Vec<String>>,
    ) -> IndexMap<String, Vec<String>> {
        input
            .iter()
            .map(|(tuple, names)| {
                let mut out = Vec::new();
                for field in &self.fields {
                    if field.tuple_name().map_or(false, |t| t != tuple) {
                        continue;
                    }
                    if field.is_wildcard() {
                        out.extend(names.iter().cloned());
                    } else {
                        out.push(field.name().to_string());
                    }
                }
                (tuple.clone(), out)
            })
            .collect()
    }

    fn project(&self, tuple: &Tuple, context: &IndexMap<String, Value>) -> Vec<Value> {
        let mut out = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            if field.is_wildcard() {
                if field.tuple_name().map_or(true, |t| t == tuple.tuple_name()) {
                    out.extend_from_slice(tuple.values());
                }
            } else {
                out.push(field.value_in(tuple, context));
            }
        }
        out
    }
}

impl fmt::Display for EmitSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", field)?;
        }
        write!(f, "]")
    }
}

struct EgressWorker {
    sender: Option<mpsc::Sender<TupleValues>>,
    handle: JoinHandle<()>,
    runtime: Handle,
}

impl EgressWorker {
    fn spawn(spec: &EmitSpec, ctx: &OperatorContext, runtime: Handle) -> Self {
        let queue_size = ctx.config.emit_queue_size_for(ctx.id);
        let batch_max = ctx.config.emit_tuples_max_for(ctx.id);
        let (tx, mut rx) = mpsc::channel::<TupleValues>(queue_size);
        let mut adapter = spec.factory.create();
        let fields = spec.egress_fields(&ctx.output_fields);
        let ctx = ctx.clone();

        let handle = runtime.spawn(async move {
            if let Err(e) = adapter.open(&ctx.config, &ctx, &fields).await {
                error!("{}: failed to open egress adapter: {}", ctx.name, e);
                while rx.recv().await.is_some() {}
                return;
            }
            debug!("{}: egress worker started", ctx.name);

            while let Some(first) = rx.recv().await {
                let mut batch = Vec::with_capacity(batch_max);
                batch.push(first);
                while batch.len() < batch_max {
                    match rx.try_recv() {
                        Ok(values) => batch.push(values),
                        Err(_) => break,
                    }
                }
                let n = batch.len();
                if let Err(e) = adapter.write(batch).await {
                    error!("{}: failed to write {} tuples: {}", ctx.name, n, e);
                }
            }

            if let Err(e) = adapter.close().await {
                warn!("{}: failed to close egress adapter: {}", ctx.name, e);
            }
            debug!("{}: egress worker stopped", ctx.name);
        });

        Self {
            sender: Some(tx),
            handle,
            runtime,
        }
    }

    fn send(&self, values: TupleValues) -> Result<(), ConnectorError> {
        let sender = self.sender.as_ref().ok_or(ConnectorError::Closed)?;
        sender.blocking_send(values).map_err(|_| ConnectorError::Closed)
    }

    fn pending(&self) -> usize {
        self.sender
            .as_ref()
            .map_or(0, |s| s.max_capacity() - s.capacity())
    }

    /// Closes the queue and waits for the worker to drain it.
    fn shutdown(mut self, name: &str, grace: std::time::Duration) {
        drop(self.sender.take());
        let handle = self.handle;
        let abort = handle.abort_handle();
        let finished = self
            .runtime
            .block_on(async { tokio::time::timeout(grace, handle).await });
        match finished {
            Ok(_) => debug!("{}: egress worker drained", name),
            Err(_) => {
                abort.abort();
                warn!("{}: egress worker did not finish within {:?}, forced shutdown", name, grace);
            }
        }
    }
}

pub struct EmitOperator {
    spec: EmitSpec,
    worker: Option<EgressWorker>,
    context: IndexMap<String, Value>,
    ctx: Option<OperatorContext>,
}

impl EmitOperator {
    pub fn new(spec: EmitSpec) -> Self {
        Self {
            spec,
            worker: None,
            context: IndexMap::new(),
            ctx: None,
        }
    }
}

impl ExecOperator for EmitOperator {
    fn prepare(&mut self, ctx: &OperatorContext) -> Result<(), OperatorError> {
        let runtime = ctx.runtime()?;
        self.context = ctx.context_fields();
        self.worker = Some(EgressWorker::spawn(&self.spec, ctx, runtime));
        self.ctx = Some(ctx.clone());
        Ok(())
    }

    fn execute(&mut self, tuple: Tuple, out: &mut dyn Dispatch) -> Result<(), OperatorError> {
        let worker = self.worker.as_ref().ok_or(ConnectorError::Closed)?;
        let projected = TupleValues::new(tuple.tuple_name(), self.spec.project(&tuple, &self.context));
        worker.send(projected)?;
        out.dispatch(tuple.into_tuple_values());
        Ok(())
    }

    fn cleanup(&mut self) {
        let (Some(worker), Some(ctx)) = (self.worker.take(), self.ctx.as_ref()) else {
            return;
        };
        let pending = worker.pending();
        let grace = ctx.config.shutdown_grace(pending);
        info!("{}: shutting down egress worker, {} queued", ctx.name, pending);
        worker.shutdown(&ctx.name, grace);
    }
}
