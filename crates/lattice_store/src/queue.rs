//! Two-tier, time-tagged queues bridging event producers to the
//! store.
//!
//! Producers (network handlers, input) stage entries keyed by entity;
//! once per tick the owning system drains the staging tier into the
//! long-lived multimap under the tick's timestamp and applies the
//! range. Staging merges last-write-wins per entity; the main map
//! keeps every entry.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::error::StoreError;
use crate::{EntityId, Timestamp};

/// A staged, timestamp-tagged queue of per-entity payloads.
pub struct StagedQueue<C> {
    staging: Mutex<BTreeMap<EntityId, C>>,
    queue: Mutex<BTreeMap<Timestamp, Vec<(EntityId, C)>>>,
    closed: AtomicBool,
}

impl<C> Default for StagedQueue<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> StagedQueue<C> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            staging: Mutex::new(BTreeMap::new()),
            queue: Mutex::new(BTreeMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Stages an entry. Concurrent and thread-safe; a later entry for
    /// the same entity replaces the staged one.
    pub fn add(&self, entity: EntityId, payload: C) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::QueueClosed);
        }
        self.staging.lock().insert(entity, payload);
        Ok(())
    }

    /// Moves everything staged into the main map under `timestamp`
    /// and returns the entries tagged exactly `timestamp` (including
    /// entries from earlier `tag_from` calls at the same tick).
    pub fn tag_from(&self, timestamp: Timestamp) -> Vec<(EntityId, C)>
    where
        C: Clone,
    {
        let staged = std::mem::take(&mut *self.staging.lock());
        let mut queue = self.queue.lock();
        let slot = queue.entry(timestamp).or_default();
        slot.extend(staged);
        slot.clone()
    }

    /// Entries in the half-open range `[from, to)`, oldest first.
    pub fn between(&self, from: Timestamp, to: Timestamp) -> Vec<(Timestamp, EntityId, C)>
    where
        C: Clone,
    {
        let queue = self.queue.lock();
        queue
            .range(from..to)
            .flat_map(|(&ts, entries)| {
                entries.iter().map(move |(e, c)| (ts, *e, c.clone()))
            })
            .collect()
    }

    /// Drops every entry with a timestamp at or before `until`.
    pub fn clean_until(&self, until: Timestamp) {
        let mut queue = self.queue.lock();
        if let Some(next) = until.checked_add(1) {
            *queue = queue.split_off(&next);
        } else {
            queue.clear();
        }
    }

    /// Refuses further staging; the process is draining.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
