//! Ordered table over a [`KeyspaceEngine`]
//!
//! Rows live under `(partition index, stored time, seq)` composite keys.
//! A partition key gets a small integer index the first time it is seen;
//! forward and reverse mappings and a live row count are kept in side
//! keyspaces and rewritten in the same batch as every row mutation, so a
//! partition's size never needs a scan.
//!
//! With a TTL, the stored time is `time_key + ttl` and a row is live while
//! its stored time is not below the current second. Expired rows of a
//! partition are deleted whenever that partition is written, and
//! [`compact_range`](OrderedTable::compact_range) sweeps the rest a bounded
//! batch at a time.
//!
//! Counter rows written by [`incr`](OrderedTable::incr) use `seq == -1` and
//! weigh as their value in the partition count.

use super::codec::CompositeKey;
use super::keyspace::{Keyspace, KeyspaceEngine, WriteBatch};
use super::{Query, Row, StoreError, TimeCondition, TupleStore};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tracing::{debug, info, trace};
use tributary_core::{Clock, Value};

/// Index of the `Null` partition key. It has no key mappings.
const NULL_INDEX: i32 = -1;
const COUNTER_SEQ: i32 = -1;

type KeyedEntry = (CompositeKey, Vec<u8>);

fn encode_count(n: i64) -> Vec<u8> {
    n.to_be_bytes().to_vec()
}

fn decode_count(bytes: &[u8]) -> Result<i64, StoreError> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StoreError::Serialization(format!("bad count of {} bytes", bytes.len())))?;
    Ok(i64::from_be_bytes(arr))
}

fn decode_row(bytes: &[u8]) -> Result<Row, StoreError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Position right after `key` in composite order.
fn successor(key: CompositeKey) -> Option<CompositeKey> {
    if key.seq < i32::MAX {
        Some(CompositeKey::new(key.partition, key.time, key.seq + 1))
    } else if key.time < i32::MAX {
        Some(CompositeKey::new(key.partition, key.time + 1, i32::MIN))
    } else if key.partition < i32::MAX {
        Some(CompositeKey::first_of(key.partition + 1))
    } else {
        None
    }
}

pub struct OrderedTable<E: KeyspaceEngine> {
    engine: E,
    ttl: Option<i32>,
    clock: Arc<dyn Clock>,
    seek_size: usize,
    next_index: i32,
    total: i64,
    cursor: Option<CompositeKey>,
}

impl<E: KeyspaceEngine> OrderedTable<E> {
    /// Opens a table on `engine`, restoring index allocation and sizes from
    /// its metadata keyspaces. `ttl` is in seconds; `None` disables expiry.
    pub fn open(
        engine: E,
        ttl: Option<i32>,
        clock: Arc<dyn Clock>,
        seek_size: usize,
    ) -> Result<Self, StoreError> {
        let mut table = Self {
            engine,
            ttl,
            clock,
            seek_size,
            next_index: 0,
            total: 0,
            cursor: None,
        };
        table.load_meta()?;
        Ok(table)
    }

    fn load_meta(&mut self) -> Result<(), StoreError> {
        let mut max_index = None;
        for (k, _) in self.engine.entries(Keyspace::HashIndex)? {
            let idx = super::codec::read_i32(&k)?;
            max_index = Some(max_index.map_or(idx, |m: i32| m.max(idx)));
        }
        self.next_index = max_index.map_or(0, |m| m.saturating_add(1));

        let mut total = 0;
        for (_, v) in self.engine.entries(Keyspace::HashMeta)? {
            total += decode_count(&v)?;
        }
        self.total = total;

        if self.total > 0 {
            info!(
                entries = self.total,
                next_index = self.next_index,
                "restored ordered table metadata"
            );
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.total.max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.total <= 0
    }

    pub fn is_open(&self) -> bool {
        self.engine.is_open()
    }

    pub fn close(&mut self) -> Result<(), StoreError> {
        self.engine.close()
    }

    fn now(&self) -> i32 {
        self.clock.now_secs()
    }

    fn stored_time(&self, time_key: i32) -> i32 {
        time_key.saturating_add(self.ttl.unwrap_or(0))
    }

    fn key_bytes(key: &Value) -> Result<Vec<u8>, StoreError> {
        Ok(serde_json::to_vec(key)?)
    }

    /// Index of an already-known partition key.
    pub fn index_of(&self, key: &Value) -> Result<Option<i32>, StoreError> {
        if key.is_null() {
            return Ok(Some(NULL_INDEX));
        }
        match self.engine.get(Keyspace::HashKey, &Self::key_bytes(key)?)? {
            Some(bytes) => Ok(Some(super::codec::read_i32(&bytes)?)),
            None => Ok(None),
        }
    }

    fn assign_index(&mut self, key: &Value, batch: &mut WriteBatch) -> Result<i32, StoreError> {
        if let Some(idx) = self.index_of(key)? {
            return Ok(idx);
        }
        let idx = self.next_index;
        self.next_index = self.next_index.saturating_add(1);
        let kb = Self::key_bytes(key)?;
        let ib = super::codec::encode_i32(idx);
        batch.put(Keyspace::HashKey, kb.clone(), ib.to_vec());
        batch.put(Keyspace::HashIndex, ib.to_vec(), kb);
        trace!(partition = %key, index = idx, "assigned partition index");
        Ok(idx)
    }

    fn meta_count(&self, idx: i32) -> Result<i64, StoreError> {
        match self
            .engine
            .get(Keyspace::HashMeta, &super::codec::encode_i32(idx))?
        {
            Some(bytes) => decode_count(&bytes),
            None => Ok(0),
        }
    }

    /// Stages a change of `delta` to the partition count. An emptied
    /// partition loses its count and key mappings.
    fn stage_meta(&self, idx: i32, delta: i64, batch: &mut WriteBatch) -> Result<(), StoreError> {
        let count = self.meta_count(idx)? + delta;
        let ib = super::codec::encode_i32(idx);
        if count > 0 {
            batch.put(Keyspace::HashMeta, ib.to_vec(), encode_count(count));
            return Ok(());
        }
        batch.delete(Keyspace::HashMeta, ib.to_vec());
        if idx != NULL_INDEX {
            if let Some(kb) = self.engine.get(Keyspace::HashIndex, &ib)? {
                batch.delete(Keyspace::HashKey, kb);
            }
            batch.delete(Keyspace::HashIndex, ib.to_vec());
        }
        debug!(index = idx, "released partition index");
        Ok(())
    }

    fn commit(&mut self, batch: WriteBatch, delta: i64) -> Result<(), StoreError> {
        self.engine.write(batch)?;
        self.total += delta;
        Ok(())
    }

    fn entries_between(
        &self,
        lo: CompositeKey,
        hi: CompositeKey,
    ) -> Result<Vec<KeyedEntry>, StoreError> {
        if lo > hi {
            return Ok(Vec::new());
        }
        self.engine
            .range(Keyspace::Store, &lo.encode(), &hi.encode())?
            .into_iter()
            .map(|(k, v)| Ok((CompositeKey::decode(&k)?, v)))
            .collect()
    }

    fn weight(key: &CompositeKey, value: &[u8]) -> Result<i64, StoreError> {
        if key.seq == COUNTER_SEQ {
            decode_count(value)
        } else {
            Ok(1)
        }
    }

    /// Rows of partition `idx` whose stored time is before `now`.
    fn expired_entries(&self, idx: i32, now: i32) -> Result<Vec<KeyedEntry>, StoreError> {
        if self.ttl.is_none() {
            return Ok(Vec::new());
        }
        if now == i32::MIN {
            return Ok(Vec::new());
        }
        self.entries_between(
            CompositeKey::first_of(idx),
            CompositeKey::new(idx, now - 1, i32::MAX),
        )
    }

    /// Rows of partition `idx` that are still live.
    fn live_entries(&self, idx: i32) -> Result<Vec<KeyedEntry>, StoreError> {
        let lo = match self.ttl {
            Some(_) => CompositeKey::new(idx, self.now(), i32::MIN),
            None => CompositeKey::first_of(idx),
        };
        self.entries_between(lo, CompositeKey::last_of(idx))
    }

    /// Stages deletion of expired rows of `idx`, returning their weight.
    fn stage_expire(&self, idx: i32, batch: &mut WriteBatch) -> Result<i64, StoreError> {
        let mut weight = 0;
        for (key, value) in self.expired_entries(idx, self.now())? {
            weight += Self::weight(&key, &value)?;
            batch.delete(Keyspace::Store, key.encode().to_vec());
        }
        Ok(weight)
    }

    fn next_seq(&self, idx: i32, time: i32) -> Result<i32, StoreError> {
        let probe = CompositeKey::new(idx, time, i32::MAX).encode();
        Ok(match self.engine.floor(Keyspace::Store, &probe)? {
            Some((k, _)) => {
                let prev = CompositeKey::decode(&k)?;
                if prev.partition == idx && prev.time == time {
                    prev.seq.saturating_add(1)
                } else {
                    0
                }
            }
            None => 0,
        })
    }

    /// Appends a row under `(key, time_key)`.
    pub fn put(&mut self, key: &Value, time_key: i32, row: Row) -> Result<(), StoreError> {
        let mut batch = WriteBatch::new();
        let idx = self.assign_index(key, &mut batch)?;
        let time = self.stored_time(time_key);
        let seq = self.next_seq(idx, time)?;
        batch.put(
            Keyspace::Store,
            CompositeKey::new(idx, time, seq).encode().to_vec(),
            serde_json::to_vec(&row)?,
        );
        let expired = self.stage_expire(idx, &mut batch)?;
        let delta = 1 - expired;
        self.stage_meta(idx, delta, &mut batch)?;
        self.commit(batch, delta)
    }

    /// Adds `n` to the counter row at `(key, time_key)`, returning its new value.
    pub fn incr(&mut self, key: &Value, time_key: i32, n: i64) -> Result<i64, StoreError> {
        let mut batch = WriteBatch::new();
        let idx = self.assign_index(key, &mut batch)?;
        let ck = CompositeKey::new(idx, self.stored_time(time_key), COUNTER_SEQ).encode();
        let current = match self.engine.get(Keyspace::Store, &ck)? {
            Some(bytes) => decode_count(&bytes)?,
            None => 0,
        };
        let value = current + n;
        batch.put(Keyspace::Store, ck.to_vec(), encode_count(value));
        let expired = self.stage_expire(idx, &mut batch)?;
        let delta = n - expired;
        self.stage_meta(idx, delta, &mut batch)?;
        self.commit(batch, delta)?;
        Ok(value)
    }

    /// Live weight of a partition: its count net of rows that expired but
    /// have not been swept yet.
    pub fn size(&self, key: &Value) -> Result<usize, StoreError> {
        self.size_at(key, self.now())
    }

    /// [`size`](Self::size) as seen at second `now`.
    pub fn size_at(&self, key: &Value, now: i32) -> Result<usize, StoreError> {
        let Some(idx) = self.index_of(key)? else {
            return Ok(0);
        };
        let mut count = self.meta_count(idx)?;
        for (k, v) in self.expired_entries(idx, now)? {
            count -= Self::weight(&k, &v)?;
        }
        Ok(count.max(0) as usize)
    }

    /// Live data rows of a partition in key order.
    pub fn entries(&self, key: &Value) -> Result<Vec<(CompositeKey, Row)>, StoreError> {
        let Some(idx) = self.index_of(key)? else {
            return Ok(Vec::new());
        };
        self.live_entries(idx)?
            .into_iter()
            .filter(|(k, _)| k.seq != COUNTER_SEQ)
            .map(|(k, v)| Ok((k, decode_row(&v)?)))
            .collect()
    }

    /// Removes every row of a partition, returning the live data rows.
    pub fn take(&mut self, key: &Value) -> Result<Vec<Row>, StoreError> {
        self.take_at(key, self.now())
    }

    /// [`take`](Self::take) with liveness judged at second `now`.
    pub fn take_at(&mut self, key: &Value, now: i32) -> Result<Vec<Row>, StoreError> {
        let Some(idx) = self.index_of(key)? else {
            return Ok(Vec::new());
        };
        let mut batch = WriteBatch::new();
        let mut weight = 0;
        let mut rows = Vec::new();
        for (k, v) in self.entries_between(CompositeKey::first_of(idx), CompositeKey::last_of(idx))? {
            weight += Self::weight(&k, &v)?;
            batch.delete(Keyspace::Store, k.encode().to_vec());
            let live = self.ttl.is_none() || k.time >= now;
            if live && k.seq != COUNTER_SEQ {
                rows.push(decode_row(&v)?);
            }
        }
        if weight == 0 && batch.is_empty() {
            return Ok(rows);
        }
        self.stage_meta(idx, -weight, &mut batch)?;
        self.commit(batch, -weight)?;
        Ok(rows)
    }

    /// Removes and returns the oldest live data row of a partition.
    pub fn remove_first(&mut self, key: &Value) -> Result<Option<Row>, StoreError> {
        let Some(idx) = self.index_of(key)? else {
            return Ok(None);
        };
        let first = self
            .live_entries(idx)?
            .into_iter()
            .find(|(k, _)| k.seq != COUNTER_SEQ);
        let Some((k, v)) = first else {
            return Ok(None);
        };
        let mut batch = WriteBatch::new();
        batch.delete(Keyspace::Store, k.encode().to_vec());
        let delta = -1 - self.stage_expire(idx, &mut batch)?;
        self.stage_meta(idx, delta, &mut batch)?;
        self.commit(batch, delta)?;
        Ok(Some(decode_row(&v)?))
    }

    /// Walks at most `seek_size` rows from the saved cursor, deleting
    /// expired ones. A partition is skipped at its first live row. Running
    /// off the end resets the cursor so the next call starts over.
    ///
    /// Returns the expired data rows that were deleted.
    pub fn compact_range(&mut self) -> Result<Vec<Row>, StoreError> {
        if self.ttl.is_none() || self.seek_size == 0 {
            return Ok(Vec::new());
        }
        let now = self.now();
        let start = CompositeKey::new(i32::MIN, i32::MIN, i32::MIN);
        let mut pos = self.cursor.unwrap_or(start);
        let mut batch = WriteBatch::new();
        let mut deltas: FxHashMap<i32, i64> = FxHashMap::default();
        let mut removed = Vec::new();

        for _ in 0..self.seek_size {
            let Some((k, v)) = self.engine.ceiling(Keyspace::Store, &pos.encode())? else {
                pos = start;
                break;
            };
            let key = CompositeKey::decode(&k)?;
            let next = if key.time < now {
                *deltas.entry(key.partition).or_default() -= Self::weight(&key, &v)?;
                batch.delete(Keyspace::Store, k);
                if key.seq != COUNTER_SEQ {
                    removed.push(decode_row(&v)?);
                }
                successor(key)
            } else {
                successor(CompositeKey::last_of(key.partition))
            };
            match next {
                Some(n) => pos = n,
                None => {
                    pos = start;
                    break;
                }
            }
        }
        self.cursor = Some(pos);

        if batch.is_empty() {
            return Ok(removed);
        }
        let mut total_delta = 0;
        for (idx, delta) in deltas {
            self.stage_meta(idx, delta, &mut batch)?;
            total_delta += delta;
        }
        self.commit(batch, total_delta)?;
        if !removed.is_empty() {
            debug!(removed = removed.len(), "compacted expired rows");
        }
        Ok(removed)
    }

    /// Entries of `query`'s partition within its time bounds, then narrowed
    /// by offset and limit.
    fn query_entries(&self, query: &Query) -> Result<Option<(i32, Vec<KeyedEntry>)>, StoreError> {
        let Some(idx) = self.index_of(&query.partition)? else {
            return Ok(None);
        };
        let mut lo = CompositeKey::first_of(idx);
        let mut hi = CompositeKey::last_of(idx);
        if let Some((cond, v)) = query.time_key {
            let v = self.stored_time(v);
            match cond {
                TimeCondition::Gt if v == i32::MAX => return Ok(Some((idx, Vec::new()))),
                TimeCondition::Gt => lo = CompositeKey::new(idx, v + 1, i32::MIN),
                TimeCondition::Ge => lo = CompositeKey::new(idx, v, i32::MIN),
                TimeCondition::Lt if v == i32::MIN => return Ok(Some((idx, Vec::new()))),
                TimeCondition::Lt => hi = CompositeKey::new(idx, v - 1, i32::MAX),
                TimeCondition::Le => hi = CompositeKey::new(idx, v, i32::MAX),
            }
        }
        let entries: Vec<KeyedEntry> = self
            .entries_between(lo, hi)?
            .into_iter()
            .filter(|(k, _)| k.seq != COUNTER_SEQ)
            .collect();
        let (from, to) = query.window(0, entries.len());
        Ok(Some((idx, entries[from..to].to_vec())))
    }
}

/// [`TupleStore`] over an [`OrderedTable`] without expiry.
pub struct PersistentTupleStore<E: KeyspaceEngine> {
    table: OrderedTable<E>,
}

impl<E: KeyspaceEngine> PersistentTupleStore<E> {
    pub fn new(table: OrderedTable<E>) -> Self {
        Self { table }
    }
}

impl<E: KeyspaceEngine> TupleStore for PersistentTupleStore<E> {
    fn put(&mut self, partition: &Value, time_key: i32, values: Row) -> Result<(), StoreError> {
        self.table.put(partition, time_key, values)
    }

    fn count(&self, query: &Query) -> Result<usize, StoreError> {
        if query.is_whole_partition() {
            return self.table.size(&query.partition);
        }
        Ok(self
            .table
            .query_entries(query)?
            .map_or(0, |(_, entries)| entries.len()))
    }

    fn find(&self, query: &Query) -> Result<Vec<Row>, StoreError> {
        match self.table.query_entries(query)? {
            Some((_, entries)) => entries.iter().map(|(_, v)| decode_row(v)).collect(),
            None => Ok(Vec::new()),
        }
    }

    fn find_and_remove(&mut self, query: &Query) -> Result<Vec<Row>, StoreError> {
        let Some((idx, entries)) = self.table.query_entries(query)? else {
            return Ok(Vec::new());
        };
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        let mut batch = WriteBatch::new();
        let mut rows = Vec::with_capacity(entries.len());
        for (k, v) in &entries {
            batch.delete(Keyspace::Store, k.encode().to_vec());
            rows.push(decode_row(v)?);
        }
        let delta = -(rows.len() as i64);
        self.table.stage_meta(idx, delta, &mut batch)?;
        self.table.commit(batch, delta)?;
        Ok(rows)
    }

    fn len(&self) -> usize {
        self.table.len()
    }

    fn close(&mut self) -> Result<(), StoreError> {
        self.table.close()
    }
}
