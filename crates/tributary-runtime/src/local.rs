//! In-process execution substrate
//!
//! [`LocalCluster`] runs a [`PhysicalPlan`] inside one process. Each task
//! of each unit gets a named thread and an unbounded mailbox; source
//! readers, egress workers and timers share one multi-threaded tokio
//! runtime owned by the cluster.
//!
//! ```ignore
//! let mut cluster = LocalCluster::new()?;
//! cluster.start(topology.compile()?)?;
//! // ...
//! cluster.shutdown();
//! ```

use crate::topology::{PhysicalPlan, UnitRef};
use crate::unit::{Mailboxes, UnitMessage, UnitTask};
use anyhow::{bail, Context as _};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tributary_core::{Clock, SystemClock};

struct TaskHandle {
    name: String,
    mailbox: mpsc::UnboundedSender<UnitMessage>,
    thread: JoinHandle<()>,
}

impl TaskHandle {
    fn stop(self) {
        // A task that already exited has dropped its receiver
        let _ = self.mailbox.send(UnitMessage::Shutdown);
        if self.thread.join().is_err() {
            error!("Task {} panicked", self.name);
        }
    }
}

pub struct LocalCluster {
    runtime: Option<Runtime>,
    clock: Arc<dyn Clock>,
    topology: Option<String>,
    spout: Vec<TaskHandle>,
    units: Vec<Vec<TaskHandle>>,
}

impl LocalCluster {
    pub fn new() -> anyhow::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .thread_name("tributary-io")
            .enable_all()
            .build()
            .context("failed to build the I/O runtime")?;
        Ok(Self {
            runtime: Some(runtime),
            clock: Arc::new(SystemClock),
            topology: None,
            spout: Vec::new(),
            units: Vec::new(),
        })
    }

    /// Clock handed to every operator instance.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn is_running(&self) -> bool {
        self.topology.is_some()
    }

    /// Starts every task of every unit, execution units first so the
    /// source never posts to a unit that is not consuming yet.
    pub fn start(&mut self, plan: PhysicalPlan) -> anyhow::Result<()> {
        if let Some(running) = &self.topology {
            bail!("topology '{}' is already running", running);
        }
        let handle = self
            .runtime
            .as_ref()
            .context("cluster was shut down")?
            .handle()
            .clone();
        let plan = Arc::new(plan);

        let mut senders = Vec::with_capacity(plan.units().len());
        let mut receivers = Vec::with_capacity(plan.units().len());
        for unit in plan.units() {
            let (tx, rx): (Vec<_>, Vec<_>) = (0..unit.parallelism)
                .map(|_| mpsc::unbounded_channel())
                .unzip();
            senders.push(tx);
            receivers.push(rx);
        }
        let mailboxes = Arc::new(Mailboxes::new(senders.clone()));
        self.topology = Some(plan.topology().to_string());

        for (index, unit_receivers) in receivers.into_iter().enumerate() {
            let mut tasks = Vec::with_capacity(unit_receivers.len());
            for (task_index, rx) in unit_receivers.into_iter().enumerate() {
                let own = senders[index][task_index].clone();
                let task = UnitTask::new(
                    plan.clone(),
                    UnitRef::Exec(index),
                    task_index,
                    mailboxes.clone(),
                    own.clone(),
                    self.clock.clone(),
                    handle.clone(),
                );
                let name = task.name().to_string();
                let thread = std::thread::Builder::new()
                    .name(format!("tributary-{}", name.to_lowercase()))
                    .spawn(move || task.run(rx))
                    .with_context(|| format!("failed to spawn task {}", name))?;
                tasks.push(TaskHandle {
                    name,
                    mailbox: own,
                    thread,
                });
            }
            self.units.push(tasks);
        }

        for task_index in 0..plan.spout().parallelism as usize {
            let (own, rx) = mpsc::unbounded_channel();
            let task = UnitTask::new(
                plan.clone(),
                UnitRef::Spout,
                task_index,
                mailboxes.clone(),
                own.clone(),
                self.clock.clone(),
                handle.clone(),
            );
            let name = task.name().to_string();
            let thread = std::thread::Builder::new()
                .name(format!("tributary-{}", name.to_lowercase()))
                .spawn(move || task.run_spout(rx))
                .with_context(|| format!("failed to spawn task {}", name))?;
            self.spout.push(TaskHandle {
                name,
                mailbox: own,
                thread,
            });
        }

        info!(
            "Started topology '{}': {} source task(s), {} unit(s)",
            plan.topology(),
            self.spout.len(),
            self.units.len()
        );
        Ok(())
    }

    /// Stops the source first, then every unit in plan order. Each task
    /// drains the messages queued before its shutdown.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(topology) = self.topology.take() {
            info!("Stopping topology '{}'", topology);
        }
        for task in self.spout.drain(..) {
            task.stop();
        }
        for tasks in self.units.drain(..) {
            for task in tasks {
                task.stop();
            }
        }
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(Duration::from_secs(1));
        }
    }
}

impl Drop for LocalCluster {
    fn drop(&mut self) {
        if self.is_running() {
            warn!("LocalCluster dropped while running, stopping");
        }
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{CollectingSink, MemorySource};
    use crate::operator::{EmitSpec, SpoutSpec};
    use crate::topology::Topology;
    use std::time::Instant;
    use tributary_core::{Schema, TupleValues, Value};

    fn wait_for(sink: &CollectingSink, n: usize) -> Vec<TupleValues> {
        let deadline = Instant::now() + Duration::from_secs(10);
        while sink.written().len() < n && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        sink.written()
    }

    #[test]
    fn test_passes_tuples_from_source_to_sink() {
        let source = MemorySource::new();
        let sink = CollectingSink::new();
        let mut t = Topology::new("local");
        let s = t.from_source(SpoutSpec::new(
            vec![Schema::new("log", vec!["id", "path"])],
            Arc::new(source.clone()),
        ));
        t.emit(&s, EmitSpec::all(Arc::new(sink.clone()))).unwrap();

        let mut cluster = LocalCluster::new().unwrap();
        cluster.start(t.compile().unwrap()).unwrap();
        assert!(cluster.is_running());
        assert!(cluster.start(t.compile().unwrap()).is_err());

        for i in 0..5 {
            source.push("log", vec![Value::Int(i), Value::from("/")]);
        }
        let written = wait_for(&sink, 5);
        assert_eq!(written.len(), 5);
        assert_eq!(written[4].values, vec![Value::Int(4), Value::from("/")]);

        cluster.shutdown();
        assert!(sink.is_closed());
        assert_eq!(source.acked().len(), 5);
    }
}
