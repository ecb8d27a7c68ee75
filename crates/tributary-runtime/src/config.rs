//! Engine configuration
//!
//! Read once by each operator at `prepare()`. Every field has a default so a
//! partial JSON document is enough:
//!
//! ```ignore
//! let config = EngineConfig::from_json(r#"{"default_parallelism": 4}"#)?;
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Which tuple store backend stateful operators open.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Memory,
    /// Ordered key-value backend rooted at `path`; each store gets its own subdirectory.
    Persistent { path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Parallelism given to operators that do not declare one
    pub default_parallelism: u32,
    /// Bound of the queue between source readers and the spout loop
    pub spout_queue_size: usize,
    /// Bound of the queue between an emit operator and its egress worker
    pub emit_queue_size: usize,
    /// Largest batch handed to an egress adapter in one `write`
    pub emit_tuples_max: usize,
    /// Entries visited per TTL cache compaction step
    pub ttl_cache_seek_size: usize,
    /// Base grace period for background workers on shutdown, in milliseconds
    pub termination_wait_ms: u64,
    /// Extra grace per still-queued item on shutdown, in milliseconds
    pub per_item_grace_ms: u64,
    /// Pause of a source reader after an empty read, in milliseconds
    pub source_poll_interval_ms: u64,
    pub store_backend: StoreBackend,
    /// Per-operator `emit_queue_size`, keyed by operator id
    pub emit_queue_size_overrides: HashMap<u32, usize>,
    /// Per-operator `emit_tuples_max`, keyed by operator id
    pub emit_tuples_max_overrides: HashMap<u32, usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_parallelism: 1,
            spout_queue_size: 1024,
            emit_queue_size: 1024,
            emit_tuples_max: 256,
            ttl_cache_seek_size: 64,
            termination_wait_ms: 5000,
            per_item_grace_ms: 100,
            source_poll_interval_ms: 10,
            store_backend: StoreBackend::Memory,
            emit_queue_size_overrides: HashMap::new(),
            emit_tuples_max_overrides: HashMap::new(),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn with_default_parallelism(mut self, parallelism: u32) -> Self {
        self.default_parallelism = parallelism.max(1);
        self
    }

    pub fn with_spout_queue_size(mut self, size: usize) -> Self {
        self.spout_queue_size = size.max(1);
        self
    }

    pub fn with_emit_queue_size(mut self, size: usize) -> Self {
        self.emit_queue_size = size.max(1);
        self
    }

    pub fn with_emit_tuples_max(mut self, max: usize) -> Self {
        self.emit_tuples_max = max.max(1);
        self
    }

    pub fn with_ttl_cache_seek_size(mut self, size: usize) -> Self {
        self.ttl_cache_seek_size = size;
        self
    }

    pub fn with_termination_wait(mut self, wait: Duration) -> Self {
        self.termination_wait_ms = wait.as_millis() as u64;
        self
    }

    pub fn with_per_item_grace(mut self, grace: Duration) -> Self {
        self.per_item_grace_ms = grace.as_millis() as u64;
        self
    }

    pub fn with_source_poll_interval(mut self, interval: Duration) -> Self {
        self.source_poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_store_backend(mut self, backend: StoreBackend) -> Self {
        self.store_backend = backend;
        self
    }

    pub fn with_emit_queue_size_override(mut self, operator_id: u32, size: usize) -> Self {
        self.emit_queue_size_overrides.insert(operator_id, size.max(1));
        self
    }

    pub fn with_emit_tuples_max_override(mut self, operator_id: u32, max: usize) -> Self {
        self.emit_tuples_max_overrides.insert(operator_id, max.max(1));
        self
    }

    pub fn emit_queue_size_for(&self, operator_id: u32) -> usize {
        self.emit_queue_size_overrides
            .get(&operator_id)
            .copied()
            .unwrap_or(self.emit_queue_size)
            .max(1)
    }

    pub fn emit_tuples_max_for(&self, operator_id: u32) -> usize {
        self.emit_tuples_max_overrides
            .get(&operator_id)
            .copied()
            .unwrap_or(self.emit_tuples_max)
            .max(1)
    }

    pub fn termination_wait(&self) -> Duration {
        Duration::from_millis(self.termination_wait_ms)
    }

    pub fn source_poll_interval(&self) -> Duration {
        Duration::from_millis(self.source_poll_interval_ms.max(1))
    }

    /// Grace period for a worker that still has `pending` queued items.
    pub fn shutdown_grace(&self, pending: usize) -> Duration {
        Duration::from_millis(self.per_item_grace_ms.saturating_mul(pending as u64))
            + self.termination_wait()
    }
}
