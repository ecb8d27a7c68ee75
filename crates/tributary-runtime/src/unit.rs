//! Execution unit tasks
//!
//! A [`UnitTask`] is one of the `parallelism` copies of a [`UnitSpec`]. It
//! owns every operator instance of its unit and is the only consumer of
//! its mailbox, so instances are never touched from two threads. Tuples
//! produced by an instance are routed through the compiled dispatchers on
//! the same thread; a tuple reaching a repartition exit is posted to the
//! mailbox of the task its link's grouping picks.
//!
//! Grouped edges deliver into one instance per group key, created lazily
//! on first sight of the key.
//!
//! [`UnitSpec`]: crate::topology::UnitSpec

use crate::dispatch::{Collector, Dispatcher};
use crate::operator::{ExecOperator, OperatorContext, OperatorKind, SourceOperator};
use crate::timer::TimerRegistry;
use crate::topology::{NodeIndex, PhysicalPlan, UnitRef};
use indexmap::IndexMap;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};
use tributary_core::{Clock, GroupKey, Tuple, TupleValues};

#[derive(Debug)]
pub enum UnitMessage {
    /// Tuple crossing a repartition boundary into `entry`.
    Tuple {
        entry: NodeIndex,
        values: TupleValues,
    },
    /// Scheduled flush for every instance of an operator.
    Timer { operator_id: u32 },
    Shutdown,
}

/// Senders of every task of every execution unit, indexed `[unit][task]`.
#[derive(Debug, Clone, Default)]
pub struct Mailboxes {
    units: Vec<Vec<mpsc::UnboundedSender<UnitMessage>>>,
}

impl Mailboxes {
    pub fn new(units: Vec<Vec<mpsc::UnboundedSender<UnitMessage>>>) -> Self {
        Self { units }
    }

    pub fn tasks(&self, unit: usize) -> usize {
        self.units.get(unit).map_or(0, Vec::len)
    }

    /// Returns whether the message was queued.
    pub fn send(&self, unit: usize, task: usize, message: UnitMessage) -> bool {
        self.units
            .get(unit)
            .and_then(|tasks| tasks.get(task))
            .is_some_and(|mailbox| mailbox.send(message).is_ok())
    }
}

struct Instance {
    operator: Box<dyn ExecOperator>,
    context: OperatorContext,
}

enum SpoutEvent {
    Batch(Option<Vec<TupleValues>>),
    Message(Option<UnitMessage>),
}

pub struct UnitTask {
    plan: Arc<PhysicalPlan>,
    unit: UnitRef,
    task_index: usize,
    parallelism: usize,
    name: String,
    mailboxes: Arc<Mailboxes>,
    clock: Arc<dyn Clock>,
    runtime: Handle,
    timers: TimerRegistry,
    /// One operator instance per node and group key. Instances are never
    /// evicted; they live as long as the topology runs.
    instances: IndexMap<(NodeIndex, Option<GroupKey>), Instance>,
}

impl UnitTask {
    /// `own` is this task's mailbox; timers post their flushes to it.
    pub fn new(
        plan: Arc<PhysicalPlan>,
        unit: UnitRef,
        task_index: usize,
        mailboxes: Arc<Mailboxes>,
        own: mpsc::UnboundedSender<UnitMessage>,
        clock: Arc<dyn Clock>,
        runtime: Handle,
    ) -> Self {
        let (name, parallelism) = plan
            .unit(unit)
            .map_or((String::from("EXEC_UNKNOWN"), 1), |u| {
                (u.name.clone(), u.parallelism as usize)
            });
        Self {
            name: format!("{}-{}", name, task_index),
            timers: TimerRegistry::new(runtime.clone(), own),
            plan,
            unit,
            task_index,
            parallelism,
            mailboxes,
            clock,
            runtime,
            instances: IndexMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Live operator instances of this task.
    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    fn is_exit(&self, node: NodeIndex) -> bool {
        self.plan
            .unit(self.unit)
            .is_some_and(|u| u.exits.contains(&node))
    }

    fn context(&self, node: NodeIndex, group_key: Option<GroupKey>) -> OperatorContext {
        let plan = &self.plan;
        let spec = plan.node(node);
        let name = spec.name();
        OperatorContext {
            id: spec.id,
            topology: plan.topology().to_string(),
            task_index: self.task_index,
            parallelism: self.parallelism,
            group_key,
            group_fields: plan.group_fields().get(&name).cloned(),
            output_fields: Arc::new(plan.fields_of(&name).cloned().unwrap_or_default()),
            config: plan.config().clone(),
            clock: self.clock.clone(),
            runtime: Some(self.runtime.clone()),
            timers: Some(self.timers.clone()),
            name,
        }
    }

    fn create_instance(&self, node: NodeIndex, group_key: Option<GroupKey>) -> Option<Instance> {
        let context = self.context(node, group_key);
        let mut operator = match self.plan.node(node).kind.create() {
            Ok(operator) => operator,
            Err(e) => {
                error!("{}: failed to create {}: {}", self.name, context.name, e);
                return None;
            }
        };
        if let Err(e) = operator.prepare(&context) {
            error!("{}: failed to prepare {}: {}", self.name, context.name, e);
            return None;
        }
        info!("{}: prepared {}", self.name, context.instance_name());
        Some(Instance { operator, context })
    }

    fn instance(&mut self, node: NodeIndex, group_key: Option<GroupKey>) -> Option<&mut Instance> {
        let slot = (node, group_key);
        if !self.instances.contains_key(&slot) {
            let instance = self.create_instance(node, slot.1.clone())?;
            self.instances.insert(slot.clone(), instance);
        }
        self.instances.get_mut(&slot)
    }

    /// Binds `values` produced by `from` to the field names `from` emits.
    fn bind(&self, from: NodeIndex, values: TupleValues) -> Option<Tuple> {
        let producer = self.plan.name_of(from);
        match self.plan.layout(&producer, &values.tuple_name) {
            Some(names) => Some(Tuple::new(names, values)),
            None => {
                warn!(
                    "{}: {} has no fields for tuple '{}', dropped",
                    self.name, producer, values.tuple_name
                );
                None
            }
        }
    }

    fn deliver(&mut self, node: NodeIndex, group_key: Option<GroupKey>, tuple: Tuple) {
        if self.is_exit(node) {
            self.forward(node, tuple);
            return;
        }
        let keyed = self.plan.node(node).kind.keyed_instances();
        let group_key = if keyed { group_key } else { None };

        let mut out = Collector::new();
        let Some(instance) = self.instance(node, group_key) else {
            return;
        };
        trace!("{} <- {:?}", instance.context.name, tuple.values());
        if let Err(e) = instance.operator.execute(tuple, &mut out) {
            warn!("{}: tuple dropped: {}", instance.context.name, e);
        }
        self.route(node, out.take());
    }

    fn route(&mut self, from: NodeIndex, outputs: Vec<TupleValues>) {
        if outputs.is_empty() {
            return;
        }
        let plan = self.plan.clone();
        let Some(dispatcher) = plan.dispatcher(from) else {
            return;
        };
        for values in outputs {
            if let Some(tuple) = self.bind(from, values) {
                self.dispatch(dispatcher, tuple);
            }
        }
    }

    fn dispatch(&mut self, dispatcher: &Dispatcher, tuple: Tuple) {
        match dispatcher {
            Dispatcher::Single(target) => self.deliver(target.node, None, tuple),
            Dispatcher::Grouping {
                target,
                group_fields,
            } => {
                let key = group_fields.key(&tuple);
                self.deliver(target.node, Some(key), tuple);
            }
            Dispatcher::Multi(dispatchers) => {
                for dispatcher in dispatchers {
                    self.dispatch(dispatcher, tuple.clone());
                }
            }
            Dispatcher::Filter { filter, inner } => {
                if filter.accepts(tuple.tuple_name()) {
                    self.dispatch(inner, tuple);
                }
            }
        }
    }

    /// Posts a tuple that reached `exit` to the task its link picks.
    fn forward(&self, exit: NodeIndex, tuple: Tuple) {
        let Some(link) = self.plan.link_from(exit) else {
            warn!("{}: {} leads nowhere", self.name, self.plan.name_of(exit));
            return;
        };
        let task = link.grouping.choose_task(&tuple, self.mailboxes.tasks(link.to));
        let message = UnitMessage::Tuple {
            entry: link.entry,
            values: tuple.into_tuple_values(),
        };
        if !self.mailboxes.send(link.to, task, message) {
            debug!("{}: unit {} task {} is closed, tuple dropped", self.name, link.to, task);
        }
    }

    fn on_timer(&mut self, operator_id: u32) {
        let slots: Vec<(NodeIndex, Option<GroupKey>)> = self
            .instances
            .iter()
            .filter(|(_, instance)| instance.context.id == operator_id)
            .map(|(slot, _)| slot.clone())
            .collect();
        for slot in slots {
            let mut out = Collector::new();
            if let Some(instance) = self.instances.get_mut(&slot) {
                if let Err(e) = instance.operator.on_timer(&mut out) {
                    warn!("{}: timer flush failed: {}", instance.context.name, e);
                }
            }
            self.route(slot.0, out.take());
        }
    }

    /// Handles one message. Returns `false` on shutdown.
    pub fn handle(&mut self, message: UnitMessage) -> bool {
        match message {
            UnitMessage::Tuple { entry, values } => {
                if let Some(tuple) = self.bind(entry, values) {
                    self.deliver(entry, None, tuple);
                }
                true
            }
            UnitMessage::Timer { operator_id } => {
                self.on_timer(operator_id);
                true
            }
            UnitMessage::Shutdown => false,
        }
    }

    /// Consumes the mailbox until shutdown, then cleans up.
    pub fn run(mut self, mut mailbox: mpsc::UnboundedReceiver<UnitMessage>) {
        info!("{}: started", self.name);
        while let Some(message) = mailbox.blocking_recv() {
            if !self.handle(message) {
                break;
            }
        }
        self.cleanup();
    }

    /// Source unit loop: reads batches from the source and handles mailbox
    /// messages until shutdown, then closes the source and cleans up.
    pub fn run_spout(mut self, mut mailbox: mpsc::UnboundedReceiver<UnitMessage>) {
        let plan = self.plan.clone();
        let spout = plan
            .spout()
            .entries
            .iter()
            .copied()
            .find(|&n| plan.node(n).kind.is_spout());
        let (Some(spout), Some(OperatorKind::Spout(spec))) =
            (spout, spout.map(|n| &plan.node(n).kind))
        else {
            error!("{}: plan has no source", self.name);
            return;
        };

        let mut source = SourceOperator::new(spec.clone());
        let mut reading = match source.open(&self.context(spout, None)) {
            Ok(()) => true,
            Err(e) => {
                error!("{}: failed to open source: {}", self.name, e);
                false
            }
        };
        let batch_max = plan.config().spout_queue_size.max(1);
        info!("{}: started", self.name);

        loop {
            let event = self.runtime.block_on(async {
                tokio::select! {
                    biased;
                    message = mailbox.recv() => SpoutEvent::Message(message),
                    batch = source.next_batch(batch_max), if reading => SpoutEvent::Batch(batch),
                }
            });
            match event {
                SpoutEvent::Batch(Some(batch)) => self.route(spout, batch),
                SpoutEvent::Batch(None) => {
                    info!("{}: source exhausted", self.name);
                    reading = false;
                }
                SpoutEvent::Message(Some(message)) => {
                    if !self.handle(message) {
                        break;
                    }
                }
                SpoutEvent::Message(None) => break,
            }
        }

        self.runtime.block_on(source.close());
        self.cleanup();
    }

    /// Stops timers and cleans up every instance, downstream operators first.
    pub fn cleanup(&mut self) {
        self.timers.stop_all();
        let mut instances: Vec<Instance> = self.instances.drain(..).map(|(_, i)| i).collect();
        instances.sort_by(|a, b| b.context.id.cmp(&a.context.id));
        for mut instance in instances {
            instance.operator.cleanup();
            debug!("{}: cleaned up {}", self.name, instance.context.instance_name());
        }
        info!("{}: stopped", self.name);
    }
}
