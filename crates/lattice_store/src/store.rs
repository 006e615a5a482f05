//! The typed store façade: one container per component kind.
//!
//! Containers are grouped by storage class. Shared kinds sit behind a
//! [`SharedComponent`] whose writer side is mutex-guarded while pulls
//! go straight to the commit ring; value kinds live in flat
//! [`Table`]s with presence bitmaps; boolean kinds collapse into a
//! [`FlagTable`] where the bitmap *is* the container.

use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::bitmap::BitMap;
use crate::component::{Collidable, ComponentKind, ComponentValue, Transform, Velocity};
use crate::error::StoreError;
use crate::versioned::{History, HistoryReader, VersionedMap};
use crate::{EntityId, Timestamp};

/// A shared, versioned component container.
///
/// The writer side (one simulation system per kind) goes through the
/// mutex; consumers pull history through the [`HistoryReader`], which
/// never touches the writer lock.
pub struct SharedComponent<V> {
    map: Mutex<VersionedMap<V>>,
    reader: HistoryReader<V>,
}

impl<V: Clone> Default for SharedComponent<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone> SharedComponent<V> {
    #[must_use]
    pub fn new() -> Self {
        let map = VersionedMap::new();
        let reader = map.reader();
        Self {
            map: Mutex::new(map),
            reader,
        }
    }

    pub fn insert(&self, entity: EntityId, value: V) -> Result<(), StoreError> {
        self.map.lock().insert(entity, value)
    }

    pub fn update(&self, entity: EntityId, value: V) -> Result<(), StoreError> {
        self.map.lock().update(entity, value)
    }

    pub fn remove(&self, entity: EntityId) -> Result<(), StoreError> {
        self.map.lock().remove(entity)
    }

    #[must_use]
    pub fn get(&self, entity: EntityId) -> Option<V> {
        self.map.lock().get(entity).cloned()
    }

    #[must_use]
    pub fn contains(&self, entity: EntityId) -> bool {
        self.map.lock().contains(entity)
    }

    /// Snapshot of the presence bits at `head`.
    #[must_use]
    pub fn bitmap(&self) -> BitMap {
        self.map.lock().bitmap().clone()
    }

    pub fn commit(&self, timestamp: Timestamp) -> Result<Timestamp, StoreError> {
        self.map.lock().commit(timestamp)
    }

    pub fn checkout(&self, timestamp: Timestamp) -> Result<Timestamp, StoreError> {
        self.map.lock().checkout(timestamp)
    }

    pub fn push(&self, history: History<V>) -> Result<Timestamp, StoreError> {
        self.map.lock().push(history)
    }

    #[must_use]
    pub fn head(&self) -> Timestamp {
        self.map.lock().head()
    }

    /// Thread-safe; see [`HistoryReader::pull`].
    pub fn pull(&self, requested: Timestamp, cursor: &mut Timestamp) -> History<V> {
        self.reader.pull(requested, cursor)
    }

    /// Thread-safe; see [`HistoryReader::pull_with_rebase`].
    pub fn pull_with_rebase(
        &self,
        requested: Timestamp,
        cursor: &mut Timestamp,
        rebase: &mut Option<Timestamp>,
    ) -> History<V> {
        self.reader.pull_with_rebase(requested, cursor, rebase)
    }

    /// A cloneable reader handle for long-lived consumers.
    #[must_use]
    pub fn reader(&self) -> HistoryReader<V> {
        self.reader.clone()
    }

    /// Runs `f` with the writer lock held, for multi-step mutations
    /// that must not interleave.
    pub fn with<R>(&self, f: impl FnOnce(&mut VersionedMap<V>) -> R) -> R {
        f(&mut self.map.lock())
    }
}

struct TableInner<T> {
    map: BTreeMap<EntityId, T>,
    presence: BitMap,
}

/// A flat entity/value table with a presence bitmap, used for both
/// value-class and per-system component kinds.
pub struct Table<T> {
    inner: Mutex<TableInner<T>>,
}

impl<T> Default for Table<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Table<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TableInner {
                map: BTreeMap::new(),
                presence: BitMap::new(),
            }),
        }
    }

    pub fn insert(&self, entity: EntityId, value: T) {
        let mut inner = self.inner.lock();
        inner.map.insert(entity, value);
        inner.presence.set(entity as usize, true);
    }

    pub fn remove(&self, entity: EntityId) -> Option<T> {
        let mut inner = self.inner.lock();
        inner.presence.erase(entity as usize);
        inner.map.remove(&entity)
    }

    #[must_use]
    pub fn contains(&self, entity: EntityId) -> bool {
        self.inner.lock().presence.get(entity as usize)
    }

    #[must_use]
    pub fn bitmap(&self) -> BitMap {
        self.inner.lock().presence.clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().map.is_empty()
    }

    /// Builds a bitmap of the entities whose value satisfies `f`.
    pub fn matching(&self, mut f: impl FnMut(&T) -> bool) -> BitMap {
        let inner = self.inner.lock();
        let mut out = BitMap::with_len(inner.presence.len());
        for (&entity, value) in &inner.map {
            if f(value) {
                out.set(entity as usize, true);
            }
        }
        out
    }
}

impl<T: Clone> Table<T> {
    #[must_use]
    pub fn get(&self, entity: EntityId) -> Option<T> {
        self.inner.lock().map.get(&entity).cloned()
    }

    /// Replaces the value of an existing entity, or inserts it.
    pub fn update(&self, entity: EntityId, value: T) {
        self.insert(entity, value);
    }
}

impl<T: Copy + PartialOrd> Table<T> {
    pub fn equal(&self, value: T) -> BitMap {
        self.matching(|v| *v == value)
    }

    pub fn less(&self, value: T) -> BitMap {
        self.matching(|v| *v < value)
    }

    pub fn greater(&self, value: T) -> BitMap {
        self.matching(|v| *v > value)
    }
}

/// A boolean component kind: the presence bitmap is the container, so
/// a `false` value and an absent entity are the same thing.
#[derive(Default)]
pub struct FlagTable {
    bits: Mutex<BitMap>,
}

impl FlagTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, entity: EntityId, value: bool) {
        self.bits.lock().set(entity as usize, value);
    }

    pub fn remove(&self, entity: EntityId) {
        self.bits.lock().erase(entity as usize);
    }

    #[must_use]
    pub fn contains(&self, entity: EntityId) -> bool {
        self.bits.lock().get(entity as usize)
    }

    #[must_use]
    pub fn bitmap(&self) -> BitMap {
        self.bits.lock().clone()
    }
}

/// All component containers of one world, grouped by storage class.
///
/// There is exactly one `Store` per process, owned by the entry point
/// and handed to systems by reference; there are no global
/// registries.
#[derive(Default)]
pub struct Store {
    // Shared, versioned kinds.
    pub velocity: SharedComponent<Velocity>,
    pub velocity_max: SharedComponent<Velocity>,
    pub graphic_transform: SharedComponent<Transform>,
    pub game_transform: SharedComponent<Transform>,
    // Value kinds, single writer.
    pub reference_frame: Table<EntityId>,
    pub oxygen_rate: Table<f32>,
    pub health: Table<u32>,
    pub is_reference_frame: FlagTable,
    pub immune: FlagTable,
    // Per-system kinds, opaque to everyone but their owner.
    pub combined_velocity: Table<Velocity>,
    pub collidable: Table<Collidable>,
}

impl Store {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a dynamically tagged value to the container of its
    /// kind. Shared kinds go through the versioned update path and
    /// surface its errors; value and per-system kinds are plain
    /// writes.
    pub fn apply(&self, entity: EntityId, value: ComponentValue) -> Result<(), StoreError> {
        match value {
            ComponentValue::Velocity(v) => self.velocity.update(entity, v),
            ComponentValue::VelocityMax(v) => self.velocity_max.update(entity, v),
            ComponentValue::GraphicTransform(t) => self.graphic_transform.update(entity, t),
            ComponentValue::GameTransform(t) => self.game_transform.update(entity, t),
            ComponentValue::ReferenceFrame(frame) => {
                self.reference_frame.update(entity, frame);
                Ok(())
            }
            ComponentValue::IsReferenceFrame(flag) => {
                self.is_reference_frame.set(entity, flag);
                Ok(())
            }
            ComponentValue::CombinedVelocity(v) => {
                self.combined_velocity.update(entity, v);
                Ok(())
            }
            ComponentValue::Collidable(c) => {
                self.collidable.update(entity, c);
                Ok(())
            }
            ComponentValue::OxygenRate(rate) => {
                self.oxygen_rate.update(entity, rate);
                Ok(())
            }
            ComponentValue::Health(health) => {
                self.health.update(entity, health);
                Ok(())
            }
            ComponentValue::Immune(flag) => {
                self.immune.set(entity, flag);
                Ok(())
            }
        }
    }

    /// Whether `entity` holds a value of `kind`, per the kind's
    /// presence bitmap.
    #[must_use]
    pub fn contains(&self, kind: ComponentKind, entity: EntityId) -> bool {
        self.bitmap_of(kind).get(entity as usize)
    }

    /// Snapshot of the presence bitmap of any kind.
    #[must_use]
    pub fn bitmap_of(&self, kind: ComponentKind) -> BitMap {
        match kind {
            ComponentKind::Velocity => self.velocity.bitmap(),
            ComponentKind::VelocityMax => self.velocity_max.bitmap(),
            ComponentKind::GraphicTransform => self.graphic_transform.bitmap(),
            ComponentKind::GameTransform => self.game_transform.bitmap(),
            ComponentKind::ReferenceFrame => self.reference_frame.bitmap(),
            ComponentKind::IsReferenceFrame => self.is_reference_frame.bitmap(),
            ComponentKind::CombinedVelocity => self.combined_velocity.bitmap(),
            ComponentKind::Collidable => self.collidable.bitmap(),
            ComponentKind::OxygenRate => self.oxygen_rate.bitmap(),
            ComponentKind::Health => self.health.bitmap(),
            ComponentKind::Immune => self.immune.bitmap(),
        }
    }

    /// Commits every shared kind at `timestamp`. Kinds with no
    /// pending changes publish an empty commit so that all shared
    /// histories advance in lockstep. Every kind is attempted even if
    /// one refuses; the first error is returned afterwards.
    pub fn commit_shared(&self, timestamp: Timestamp) -> Result<(), StoreError> {
        let failures = [
            self.velocity.commit(timestamp).err(),
            self.velocity_max.commit(timestamp).err(),
            self.graphic_transform.commit(timestamp).err(),
            self.game_transform.commit(timestamp).err(),
        ];
        match failures.into_iter().flatten().next() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::on_true;

    #[test]
    fn shared_component_commit_and_pull() {
        let store = Store::new();
        store
            .graphic_transform
            .insert(1, Transform::default())
            .unwrap();
        store.commit_shared(0).unwrap();

        let mut cursor = -1;
        let history = store.graphic_transform.pull(0, &mut cursor);
        assert_eq!(cursor, 0);
        assert_eq!(history.additions[&0].entries.len(), 1);

        // Other shared kinds advanced too, with empty commits.
        let mut velocity_cursor = -1;
        let history = store.velocity.pull(0, &mut velocity_cursor);
        assert_eq!(velocity_cursor, 0);
        assert!(history.additions[&0].entries.is_empty());
    }

    #[test]
    fn value_table_predicates() {
        let store = Store::new();
        store.health.insert(1, 50);
        store.health.insert(2, 100);
        store.health.insert(3, 100);
        store.health.insert(7, 10);

        let full: Vec<EntityId> = store.health.equal(100).iter_ones().map(|i| i as EntityId).collect();
        assert_eq!(full, vec![2, 3]);

        let hurt = store.health.less(100);
        let mut seen = Vec::new();
        on_true(&hurt, |e| seen.push(e));
        assert_eq!(seen, vec![1, 7]);

        assert!(store.health.greater(99).get(2));
        assert!(!store.health.greater(99).get(1));
    }

    #[test]
    fn flag_table_is_its_own_bitmap() {
        let store = Store::new();
        store.immune.set(4, true);
        assert!(store.immune.contains(4));
        assert!(!store.immune.contains(5));

        store.immune.remove(4);
        assert!(!store.immune.contains(4));
    }

    #[test]
    fn tagged_values_reach_their_containers() {
        let store = Store::new();
        store
            .apply(3, ComponentValue::Health(20))
            .and_then(|()| store.apply(3, ComponentValue::Immune(true)))
            .and_then(|()| store.apply(3, ComponentValue::Velocity(Velocity::linear(1.0, 0.0, 0.0))))
            .unwrap();

        assert!(store.contains(ComponentKind::Health, 3));
        assert!(store.contains(ComponentKind::Immune, 3));
        assert!(store.contains(ComponentKind::Velocity, 3));
        assert!(!store.contains(ComponentKind::Collidable, 3));
        assert_eq!(store.health.get(3), Some(20));

        // Shared kinds surface versioned-store errors.
        store.commit_shared(0).unwrap();
        store
            .apply(4, ComponentValue::Velocity(Velocity::default()))
            .unwrap();
        store.commit_shared(1).unwrap();
        store.velocity.checkout(0).unwrap();
        assert!(store
            .apply(5, ComponentValue::Velocity(Velocity::default()))
            .is_err());
    }

    #[test]
    fn reference_frames_are_ids_not_pointers() {
        let store = Store::new();
        // 3 -> 2 -> 1 -> 1: chains terminate at a self-reference.
        store.reference_frame.insert(1, 1);
        store.reference_frame.insert(2, 1);
        store.reference_frame.insert(3, 2);
        store.is_reference_frame.set(1, true);
        store.is_reference_frame.set(2, true);

        let mut frame = 3;
        let mut hops = 0;
        while let Some(parent) = store.reference_frame.get(frame) {
            if parent == frame {
                break;
            }
            frame = parent;
            hops += 1;
            assert!(hops < 10, "reference frame chain must not cycle");
        }
        assert_eq!(frame, 1);
    }
}
