//! A navigable map that mimics the behaviour of a git repository.
//!
//! [`VersionedMap`] keeps a workspace of entity/value pairs plus the
//! last [`HISTORY_LEN`] commits. The single writer mutates the
//! workspace and publishes the accumulated changes with
//! [`commit`](VersionedMap::commit); any number of consumers follow
//! the history concurrently through a [`HistoryReader`], and histories
//! pulled from one map can be [`push`](VersionedMap::push)ed into
//! another, rebasing the destination onto the incoming commits.
//!
//! Only [`HistoryReader`] operations are thread-safe; everything on
//! `VersionedMap` itself assumes the single writer.

use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Included};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, warn};

use crate::bitmap::BitMap;
use crate::error::StoreError;
use crate::{EntityId, Timestamp, NEVER};

/// Number of commits retained per map.
pub const HISTORY_LEN: usize = 30;

/// How long a puller waits for a commit that has not been published
/// yet before giving up with an empty history.
pub const PULL_TIMEOUT: Duration = Duration::from_millis(500);

/// One side of a commit: the touched entries and their presence bits.
#[derive(Clone, Debug)]
pub struct CommitSet<V> {
    pub entries: BTreeMap<EntityId, V>,
    pub bitmap: BitMap,
}

impl<V> Default for CommitSet<V> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            bitmap: BitMap::default(),
        }
    }
}

/// A span of history as returned by [`HistoryReader::pull`]: removal
/// sets and addition sets keyed by commit timestamp. The sets are
/// refcounted views of the published commits and never copied.
#[derive(Clone, Debug)]
pub struct History<V> {
    pub removals: BTreeMap<Timestamp, Arc<CommitSet<V>>>,
    pub additions: BTreeMap<Timestamp, Arc<CommitSet<V>>>,
}

impl<V> Default for History<V> {
    fn default() -> Self {
        Self {
            removals: BTreeMap::new(),
            additions: BTreeMap::new(),
        }
    }
}

impl<V> History<V> {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.additions.is_empty()
    }

    /// Timestamp of the earliest commit carried, if any.
    #[must_use]
    pub fn earliest(&self) -> Option<Timestamp> {
        self.additions.keys().next().copied()
    }

    /// Timestamp of the latest commit carried, if any.
    #[must_use]
    pub fn latest(&self) -> Option<Timestamp> {
        self.additions.keys().next_back().copied()
    }
}

struct RingEntry<V> {
    additions: Arc<CommitSet<V>>,
    removals: Arc<CommitSet<V>>,
}

impl<V> Clone for RingEntry<V> {
    fn clone(&self) -> Self {
        Self {
            additions: self.additions.clone(),
            removals: self.removals.clone(),
        }
    }
}

/// The published side of a map, shared between the writer and all
/// readers. Commits are immutable once they land here.
struct Ring<V> {
    commits: RwLock<BTreeMap<Timestamp, RingEntry<V>>>,
    /// Latest published timestamp, guarded separately so pullers can
    /// wait on it without touching the commit ring.
    latest: Mutex<Timestamp>,
    published: Condvar,
    /// `operation timestamp -> earliest source timestamp changed` for
    /// every rebase that rewrote already-published history.
    rebase_log: Mutex<BTreeMap<Timestamp, Timestamp>>,
}

impl<V> Ring<V> {
    fn new() -> Self {
        Self {
            commits: RwLock::new(BTreeMap::new()),
            latest: Mutex::new(NEVER),
            published: Condvar::new(),
            rebase_log: Mutex::new(BTreeMap::new()),
        }
    }

    fn publish(&self, timestamp: Timestamp, entry: RingEntry<V>) {
        {
            let mut commits = self.commits.write();
            commits.insert(timestamp, entry);
            while commits.len() > HISTORY_LEN {
                commits.pop_first();
            }
        }
        {
            let mut latest = self.latest.lock();
            if *latest < timestamp {
                *latest = timestamp;
            }
        }
        self.published.notify_all();
    }

    /// First rebase marker past `cursor` that invalidated data the
    /// consumer already received, if it happened at or before
    /// `requested`.
    fn rebase_point(
        &self,
        requested: Timestamp,
        cursor: Timestamp,
    ) -> Option<(Timestamp, Timestamp)> {
        let log = self.rebase_log.lock();
        let (&op, &src) = log.range((Excluded(cursor), Included(Timestamp::MAX))).next()?;
        (src < cursor && op <= requested).then_some((op, src))
    }
}

/// Concurrent read access to the history of one [`VersionedMap`].
/// Cheap to clone; every clone follows the same ring.
pub struct HistoryReader<V> {
    ring: Arc<Ring<V>>,
}

impl<V> Clone for HistoryReader<V> {
    fn clone(&self) -> Self {
        Self {
            ring: self.ring.clone(),
        }
    }
}

impl<V> HistoryReader<V> {
    /// Returns every commit in `(cursor, requested]` and advances
    /// `cursor` to the newest timestamp returned.
    ///
    /// Blocks up to [`PULL_TIMEOUT`] if nothing at or after
    /// `requested` has been published yet, then returns an empty
    /// history with `cursor` untouched. A `cursor` ahead of the
    /// published history is snapped back to it.
    pub fn pull(&self, requested: Timestamp, cursor: &mut Timestamp) -> History<V> {
        self.pull_inner(requested, cursor, None)
    }

    /// As [`pull`](Self::pull), but additionally reports rewritten
    /// history: if a rebase modified commits the consumer had already
    /// received, `rebase` is set to the earliest affected timestamp
    /// and the cursor is moved back so the returned span covers the
    /// invalidated region.
    pub fn pull_with_rebase(
        &self,
        requested: Timestamp,
        cursor: &mut Timestamp,
        rebase: &mut Option<Timestamp>,
    ) -> History<V> {
        self.pull_inner(requested, cursor, Some(rebase))
    }

    fn pull_inner(
        &self,
        requested: Timestamp,
        cursor: &mut Timestamp,
        rebase: Option<&mut Option<Timestamp>>,
    ) -> History<V> {
        let published = *self.ring.latest.lock();
        if *cursor > published {
            warn!(
                cursor = *cursor,
                published,
                "consumer claims more frames than were published; snapping back"
            );
            *cursor = published;
            if let Some(rebase) = rebase {
                *rebase = None;
            }
        } else if let Some(rebase) = rebase {
            match self.ring.rebase_point(requested, *cursor) {
                Some((_, source)) => {
                    *cursor = source;
                    *rebase = Some(source);
                }
                None => *rebase = None,
            }
        }

        // Wait for the requested frame to be published.
        {
            let mut latest = self.ring.latest.lock();
            if *latest < requested {
                let timed_out = self
                    .ring
                    .published
                    .wait_while_for(&mut latest, |l| *l < requested, PULL_TIMEOUT)
                    .timed_out();
                if timed_out {
                    warn!(requested, "pull is ahead of the publisher; returning empty");
                    return History::default();
                }
            }
        }

        let commits = self.ring.commits.read();
        let mut history = History::default();
        let mut newest = None;
        for (&ts, entry) in commits.range((Excluded(*cursor), Included(requested))) {
            history.removals.insert(ts, entry.removals.clone());
            history.additions.insert(ts, entry.additions.clone());
            newest = Some(ts);
        }
        if let Some(ts) = newest {
            *cursor = ts;
        }
        history
    }
}

/// A per-kind entity/value map with bounded, navigable history.
pub struct VersionedMap<V> {
    workspace: BTreeMap<EntityId, V>,
    presence: BitMap,
    pending_additions: BTreeMap<EntityId, V>,
    pending_removals: BTreeMap<EntityId, V>,
    pending_add_bits: BitMap,
    pending_rem_bits: BitMap,
    /// Currently checked-out timestamp.
    head: Timestamp,
    /// Maximum timestamp ever committed; `head < highest` means the
    /// map is rewound and refuses local mutation.
    highest: Timestamp,
    ring: Arc<Ring<V>>,
}

impl<V: Clone> Default for VersionedMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone> VersionedMap<V> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            workspace: BTreeMap::new(),
            presence: BitMap::new(),
            pending_additions: BTreeMap::new(),
            pending_removals: BTreeMap::new(),
            pending_add_bits: BitMap::new(),
            pending_rem_bits: BitMap::new(),
            head: NEVER,
            highest: NEVER,
            ring: Arc::new(Ring::new()),
        }
    }

    /// A handle for concurrent consumers of this map's history.
    #[must_use]
    pub fn reader(&self) -> HistoryReader<V> {
        HistoryReader {
            ring: self.ring.clone(),
        }
    }

    /// The currently checked-out timestamp.
    #[must_use]
    pub fn head(&self) -> Timestamp {
        self.head
    }

    /// The maximum timestamp ever committed.
    #[must_use]
    pub fn highest(&self) -> Timestamp {
        self.highest
    }

    /// Whether the map currently refuses local mutation.
    #[must_use]
    pub fn is_rewound(&self) -> bool {
        self.head < self.highest
    }

    /// The workspace as of `head`.
    #[must_use]
    pub fn map(&self) -> &BTreeMap<EntityId, V> {
        &self.workspace
    }

    #[must_use]
    pub fn get(&self, entity: EntityId) -> Option<&V> {
        self.workspace.get(&entity)
    }

    #[must_use]
    pub fn contains(&self, entity: EntityId) -> bool {
        self.workspace.contains_key(&entity)
    }

    /// Presence bits for the workspace at `head`.
    #[must_use]
    pub fn bitmap(&self) -> &BitMap {
        &self.presence
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.is_rewound() {
            return Err(StoreError::Rewound {
                head: self.head,
                highest: self.highest,
            });
        }
        Ok(())
    }

    /// Inserts a new pair into the workspace. Inserting over an
    /// existing key is a no-op; use [`update`](Self::update) to
    /// replace. [`commit`](Self::commit) records the change in
    /// history.
    pub fn insert(&mut self, entity: EntityId, value: V) -> Result<(), StoreError> {
        self.check_writable()?;
        if self.workspace.contains_key(&entity) {
            return Ok(());
        }
        self.presence.set(entity as usize, true);
        self.pending_add_bits.set(entity as usize, true);
        self.workspace.insert(entity, value.clone());
        self.pending_additions.insert(entity, value);
        Ok(())
    }

    /// Replaces the value of an entity; internally a remove followed
    /// by an insert. Updating an absent entity records only an
    /// addition.
    pub fn update(&mut self, entity: EntityId, value: V) -> Result<(), StoreError> {
        self.remove(entity)?;
        self.insert(entity, value)
    }

    /// Removes an entity from the workspace, recording its old value
    /// for reversal. Removing an absent entity is a no-op.
    pub fn remove(&mut self, entity: EntityId) -> Result<(), StoreError> {
        self.check_writable()?;
        let Some(old) = self.workspace.remove(&entity) else {
            return Ok(());
        };
        self.presence.erase(entity as usize);

        if self.pending_additions.remove(&entity).is_some()
            && !self.pending_removals.contains_key(&entity)
        {
            // Inserted earlier in this same round; the two cancel out.
            self.pending_add_bits.erase(entity as usize);
            return Ok(());
        }
        self.pending_rem_bits.set(entity as usize, true);
        self.pending_removals.entry(entity).or_insert(old);
        Ok(())
    }

    /// Publishes the pending changes as a new commit tagged
    /// `timestamp` and returns the new head. The timestamp must be
    /// strictly greater than every prior commit.
    pub fn commit(&mut self, timestamp: Timestamp) -> Result<Timestamp, StoreError> {
        self.check_writable()?;
        if timestamp <= self.highest {
            return Err(StoreError::OutOfOrderCommit {
                requested: timestamp,
                highest: self.highest,
            });
        }
        let entry = RingEntry {
            additions: Arc::new(CommitSet {
                entries: std::mem::take(&mut self.pending_additions),
                bitmap: std::mem::take(&mut self.pending_add_bits),
            }),
            removals: Arc::new(CommitSet {
                entries: std::mem::take(&mut self.pending_removals),
                bitmap: std::mem::take(&mut self.pending_rem_bits),
            }),
        };
        self.ring.publish(timestamp, entry);
        self.head = timestamp;
        self.highest = timestamp;
        Ok(self.head)
    }

    /// Resets the workspace to its state at `timestamp`, walking the
    /// history backward or forward as needed. While `head < highest`
    /// the map refuses local mutation.
    pub fn checkout(&mut self, timestamp: Timestamp) -> Result<Timestamp, StoreError> {
        if timestamp > self.highest {
            return Err(StoreError::FutureCheckout {
                requested: timestamp,
                highest: self.highest,
            });
        }
        if timestamp < self.head {
            let span: Vec<RingEntry<V>> = {
                let commits = self.ring.commits.read();
                commits
                    .range((Excluded(timestamp), Included(self.head)))
                    .rev()
                    .map(|(_, e)| e.clone())
                    .collect()
            };
            for entry in &span {
                for entity in entry.additions.entries.keys() {
                    self.workspace.remove(entity);
                    self.presence.erase(*entity as usize);
                }
                for (entity, value) in &entry.removals.entries {
                    self.workspace.insert(*entity, value.clone());
                    self.presence.set(*entity as usize, true);
                }
            }
            self.head = timestamp;
        } else if timestamp > self.head {
            let span: Vec<RingEntry<V>> = {
                let commits = self.ring.commits.read();
                commits
                    .range((Excluded(self.head), Included(timestamp)))
                    .map(|(_, e)| e.clone())
                    .collect()
            };
            for entry in &span {
                for entity in entry.removals.entries.keys() {
                    self.workspace.remove(entity);
                    self.presence.erase(*entity as usize);
                }
                for (entity, value) in &entry.additions.entries {
                    self.workspace.insert(*entity, value.clone());
                    self.presence.set(*entity as usize, true);
                }
            }
            self.head = timestamp;
        }
        Ok(self.head)
    }

    /// Merges an externally pulled history into this map, like a
    /// rebase onto the incoming commits. Incoming commits whose
    /// timestamps already exist in the ring overwrite them; a commit
    /// earlier than `head` first rewinds the map to just before it
    /// and leaves a rebase marker so consumers learn their data was
    /// rewritten. Finishes checked out at the merged tip.
    pub fn push(&mut self, history: History<V>) -> Result<Timestamp, StoreError> {
        self.check_writable()?;
        let (Some(earliest), Some(latest)) = (history.earliest(), history.latest()) else {
            return Ok(self.head);
        };
        if history.removals.keys().next() != history.additions.keys().next()
            || history.removals.keys().next_back() != history.additions.keys().next_back()
        {
            warn!("push with mismatched removal/addition spans; ignoring");
            return Ok(self.head);
        }

        if earliest <= self.head {
            // A later rebase already rewrote this span; old alternate
            // histories lose to it.
            {
                let log = self.ring.rebase_log.lock();
                for (_, &source) in log.range(earliest..) {
                    if source > earliest {
                        debug!(earliest, "push suppressed by a later rebase");
                        return Ok(self.head);
                    }
                }
            }
            self.checkout(earliest - 1)?;
            let new_head = self.highest.max(latest);
            let mut log = self.ring.rebase_log.lock();
            log.insert(new_head, earliest - 1);
            while log.len() > HISTORY_LEN {
                log.pop_first();
            }
        }

        {
            let mut commits = self.ring.commits.write();
            for (ts, additions) in history.additions {
                let removals = history
                    .removals
                    .get(&ts)
                    .cloned()
                    .unwrap_or_else(|| Arc::new(CommitSet::default()));
                commits.insert(ts, RingEntry {
                    additions,
                    removals,
                });
            }
            while commits.len() > HISTORY_LEN {
                commits.pop_first();
            }
        }

        self.highest = self.highest.max(latest);
        {
            let mut published = self.ring.latest.lock();
            if *published < self.highest {
                *published = self.highest;
            }
        }
        self.ring.published.notify_all();
        self.checkout(self.highest)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use pretty_assertions::assert_eq;

    use super::*;

    fn reference(pairs: &[(EntityId, &str)]) -> BTreeMap<EntityId, String> {
        pairs.iter().map(|(e, v)| (*e, (*v).to_owned())).collect()
    }

    fn refmap0() -> BTreeMap<EntityId, String> {
        reference(&[(1, "one"), (2, "two"), (3, "three"), (4, "four"), (5, "five")])
    }

    fn refmap100() -> BTreeMap<EntityId, String> {
        reference(&[(1, "two"), (2, "one"), (3, "three"), (5, "three")])
    }

    fn refmap200() -> BTreeMap<EntityId, String> {
        reference(&[(1, "two"), (2, "three"), (3, "two"), (4, "six"), (5, "one")])
    }

    fn seeded() -> VersionedMap<String> {
        let mut map = VersionedMap::new();
        for (entity, value) in refmap0() {
            map.insert(entity, value).unwrap();
        }
        map
    }

    fn modify(map: &mut VersionedMap<String>) {
        map.update(2, "one".to_owned()).unwrap();
        map.update(1, "two".to_owned()).unwrap();
        map.update(5, "three".to_owned()).unwrap();
    }

    fn modify2(map: &mut VersionedMap<String>) {
        map.update(2, "three".to_owned()).unwrap();
        map.update(3, "two".to_owned()).unwrap();
        map.update(5, "one".to_owned()).unwrap();
    }

    /// Scenario shared by most tests: commits at 0, 100 and 200.
    fn committed() -> VersionedMap<String> {
        let mut map = seeded();
        map.commit(0).unwrap();
        modify(&mut map);
        map.remove(4).unwrap();
        map.commit(100).unwrap();
        modify2(&mut map);
        map.insert(4, "six".to_owned()).unwrap();
        map.commit(200).unwrap();
        map
    }

    #[test]
    fn insert_and_read_back() {
        let map = seeded();
        assert_eq!(*map.map(), refmap0());
    }

    #[test]
    fn insert_over_existing_is_a_noop() {
        let mut map = seeded();
        map.insert(1, "six".to_owned()).unwrap();
        assert_eq!(map.get(1).unwrap(), "one");
    }

    #[test]
    fn update_replaces() {
        let mut map = seeded();
        modify(&mut map);
        assert_eq!(map.get(2).unwrap(), "one");
    }

    #[test]
    fn remove_clears_entry_and_bit() {
        let mut map = seeded();
        map.remove(4).unwrap();
        assert_eq!(map.get(4), None);
        assert!(!map.bitmap().get(4));
    }

    #[test]
    fn commit_and_read_back() {
        let map = committed();
        assert_eq!(*map.map(), refmap200());
        assert_eq!(map.head(), 200);
        assert_eq!(map.highest(), 200);
    }

    #[test]
    fn commits_must_be_in_order() {
        let mut map = committed();
        assert_eq!(
            map.commit(200),
            Err(StoreError::OutOfOrderCommit {
                requested: 200,
                highest: 200
            })
        );
        assert_eq!(
            map.commit(150),
            Err(StoreError::OutOfOrderCommit {
                requested: 150,
                highest: 200
            })
        );
        map.insert(9, "nine".to_owned()).unwrap();
        assert_eq!(map.commit(201), Ok(201));
    }

    #[test]
    fn presence_matches_workspace_keys() {
        let map = committed();
        let from_bits: Vec<EntityId> =
            map.bitmap().iter_ones().map(|i| i as EntityId).collect();
        let from_keys: Vec<EntityId> = map.map().keys().copied().collect();
        assert_eq!(from_bits, from_keys);
    }

    #[test]
    fn pure_inserts_and_removes_are_disjoint() {
        let mut map = committed();
        map.insert(6, "seven".to_owned()).unwrap();
        map.insert(7, "eight".to_owned()).unwrap();
        map.remove(4).unwrap();
        map.commit(300).unwrap();

        let mut cursor = 200;
        let history = map.reader().pull(300, &mut cursor);
        let additions = &history.additions[&300];
        let removals = &history.removals[&300];
        assert!(additions
            .entries
            .keys()
            .all(|e| !removals.entries.contains_key(e)));
        assert_eq!(additions.entries.len(), 2);
        assert_eq!(removals.entries.len(), 1);
    }

    #[test]
    fn insert_then_remove_in_one_round_cancels() {
        let mut map = committed();
        map.insert(6, "six".to_owned()).unwrap();
        map.remove(6).unwrap();
        map.commit(300).unwrap();

        let mut cursor = 200;
        let history = map.reader().pull(300, &mut cursor);
        assert!(history.additions[&300].entries.is_empty());
        assert!(history.removals[&300].entries.is_empty());
    }

    #[test]
    fn rewind_restores_previous_state() {
        let mut map = committed();
        assert_eq!(map.checkout(100), Ok(100));
        assert_eq!(*map.map(), refmap100());
        assert_eq!(map.get(4), None);
        assert!(!map.bitmap().get(4));
        assert!(map.is_rewound());
    }

    #[test]
    fn rewind_to_first_commit() {
        let mut map = committed();
        assert_eq!(map.checkout(0), Ok(0));
        assert_eq!(*map.map(), refmap0());
    }

    #[test]
    fn mutation_rejected_while_rewound() {
        let mut map = committed();
        map.checkout(0).unwrap();

        assert!(matches!(
            map.insert(6, "six".to_owned()),
            Err(StoreError::Rewound { .. })
        ));
        assert_eq!(map.get(6), None);

        assert!(matches!(
            map.update(1, "six".to_owned()),
            Err(StoreError::Rewound { .. })
        ));
        assert_eq!(map.get(1).unwrap(), "one");

        assert!(matches!(map.remove(1), Err(StoreError::Rewound { .. })));
        assert_eq!(map.get(1).unwrap(), "one");

        assert!(matches!(map.commit(300), Err(StoreError::Rewound { .. })));
    }

    #[test]
    fn forward_replays_through_intermediate_states() {
        let mut map = committed();
        map.checkout(0).unwrap();

        assert_eq!(map.checkout(100), Ok(100));
        assert_eq!(*map.map(), refmap100());
        assert_eq!(map.get(4), None);

        assert_eq!(map.checkout(200), Ok(200));
        assert_eq!(*map.map(), refmap200());
        assert!(!map.is_rewound());
    }

    #[test]
    fn forward_straight_to_head() {
        let mut map = committed();
        map.checkout(0).unwrap();
        map.checkout(200).unwrap();
        assert_eq!(*map.map(), refmap200());
    }

    #[test]
    fn rewind_then_restore_is_identity() {
        let mut map = committed();
        let before = map.map().clone();
        map.checkout(0).unwrap();
        map.checkout(map.highest()).unwrap();
        assert_eq!(*map.map(), before);
        assert!(!map.is_rewound());
    }

    #[test]
    fn future_checkout_is_rejected() {
        let mut map = committed();
        assert_eq!(
            map.checkout(300),
            Err(StoreError::FutureCheckout {
                requested: 300,
                highest: 200
            })
        );
    }

    #[test]
    fn pull_advances_cursor() {
        let map = committed();
        let reader = map.reader();

        let mut cursor = 0;
        let mut rebase = None;
        let history = reader.pull_with_rebase(100, &mut cursor, &mut rebase);
        assert_eq!(cursor, 100);
        assert_eq!(rebase, None);
        assert_eq!(history.additions.len(), 1);

        let history = reader.pull_with_rebase(200, &mut cursor, &mut rebase);
        assert_eq!(cursor, 200);
        assert_eq!(rebase, None);
        assert_eq!(history.additions.len(), 1);
    }

    #[test]
    fn pull_times_out_empty_when_ahead() {
        let map = committed();
        let mut cursor = 200;
        let history = map.reader().pull(300, &mut cursor);
        assert!(history.is_empty());
        assert_eq!(cursor, 200);
    }

    #[test]
    fn pull_snaps_back_a_cursor_from_the_future() {
        let map = committed();
        let mut cursor = 999;
        let history = map.reader().pull(200, &mut cursor);
        assert!(history.is_empty());
        assert_eq!(cursor, 200);
    }

    #[test]
    fn pull_unblocks_on_commit() {
        let mut map = committed();
        let reader = map.reader();
        let waiter = std::thread::spawn(move || {
            let mut cursor = 200;
            let history = reader.pull(300, &mut cursor);
            (cursor, history.additions.len())
        });
        std::thread::sleep(Duration::from_millis(50));
        map.insert(8, "eight".to_owned()).unwrap();
        map.commit(300).unwrap();
        let (cursor, commits) = waiter.join().unwrap();
        assert_eq!(cursor, 300);
        assert_eq!(commits, 1);
    }

    #[test]
    fn pull_then_push_reproduces_the_source() {
        let map = committed();
        let mut cursor = NEVER;
        let mut rebase = None;
        let history = map.reader().pull_with_rebase(200, &mut cursor, &mut rebase);
        assert_eq!(cursor, 200);
        assert_eq!(rebase, None);

        let mut dest: VersionedMap<String> = VersionedMap::new();
        assert_eq!(dest.push(history), Ok(200));
        assert_eq!(*dest.map(), refmap200());
        assert_eq!(dest.head(), 200);
    }

    #[test]
    fn push_over_local_history_rebases_and_notifies() {
        let map = committed();
        let mut cursor = NEVER;
        let mut rebase = None;
        let history = map.reader().pull_with_rebase(200, &mut cursor, &mut rebase);

        let mut dest: VersionedMap<String> = VersionedMap::new();
        dest.insert(1, "one from origin".to_owned()).unwrap();
        dest.commit(0).unwrap();

        // A consumer of `dest` catches up before the rebase.
        let mut cursor2 = NEVER;
        let dest_reader = dest.reader();
        dest_reader.pull_with_rebase(0, &mut cursor2, &mut rebase);
        assert_eq!(cursor2, 0);

        assert_eq!(dest.push(history), Ok(200));
        assert_eq!(*dest.map(), refmap200());

        // The rewrite is reported to consumers that were past it.
        let mut cursor3 = 100;
        let history2 = dest_reader.pull_with_rebase(200, &mut cursor3, &mut rebase);
        assert_eq!(rebase, Some(NEVER));
        assert_eq!(cursor3, 200);
        assert_eq!(history2.additions.len(), 3);
    }

    #[test]
    fn rebased_history_propagates_to_a_third_store() {
        let map = committed();
        let mut cursor = NEVER;
        let mut rebase = None;
        let history = map.reader().pull_with_rebase(200, &mut cursor, &mut rebase);

        let mut dest: VersionedMap<String> = VersionedMap::new();
        dest.commit(0).unwrap();
        dest.insert(1, "one from origin".to_owned()).unwrap();
        dest.commit(100).unwrap();

        let dest_reader = dest.reader();
        let mut cursor2 = NEVER;
        dest_reader.pull_with_rebase(100, &mut cursor2, &mut rebase);
        assert_eq!(cursor2, 100);
        assert_eq!(rebase, None);

        assert_eq!(dest.push(history), Ok(200));
        assert_eq!(*dest.map(), refmap200());

        let history2 = dest_reader.pull_with_rebase(200, &mut cursor2, &mut rebase);
        assert_eq!(cursor2, 200);
        assert_eq!(rebase, Some(NEVER));

        let mut third: VersionedMap<String> = VersionedMap::new();
        assert_eq!(third.push(history2), Ok(200));
        assert_eq!(*third.map(), refmap200());
    }

    #[test]
    fn later_local_commits_survive_a_push_behind_them() {
        let map = committed();
        let mut cursor = NEVER;
        let mut rebase = None;
        let history = map.reader().pull_with_rebase(200, &mut cursor, &mut rebase);

        let mut dest: VersionedMap<String> = VersionedMap::new();
        dest.commit(0).unwrap();
        dest.insert(1, "one from origin".to_owned()).unwrap();
        dest.commit(100).unwrap();
        dest.insert(2, "two from origin".to_owned()).unwrap();
        dest.commit(200).unwrap();
        dest.update(1, "three from origin".to_owned()).unwrap();
        dest.commit(300).unwrap();

        assert_eq!(dest.push(history), Ok(300));
        // The local commit at 300 replays on top of the pushed span.
        assert_eq!(dest.get(1).unwrap(), "three from origin");
        for (entity, value) in refmap200() {
            if entity != 1 {
                assert_eq!(dest.get(entity).unwrap(), &value);
            }
        }
    }

    #[test]
    fn rebase_markers_cover_later_spans() {
        let map = committed();
        let mut cursor = NEVER;
        let mut rebase = None;
        let history = map.reader().pull_with_rebase(200, &mut cursor, &mut rebase);

        let mut dest: VersionedMap<String> = VersionedMap::new();
        dest.commit(0).unwrap();
        dest.insert(1, "one from origin".to_owned()).unwrap();
        dest.commit(100).unwrap();
        dest.insert(2, "two from origin".to_owned()).unwrap();
        dest.commit(200).unwrap();
        dest.update(1, "three from origin".to_owned()).unwrap();
        dest.commit(300).unwrap();

        let dest_reader = dest.reader();
        let mut cursor2 = NEVER;
        dest_reader.pull_with_rebase(200, &mut cursor2, &mut rebase);
        assert_eq!(cursor2, 200);

        dest.push(history).unwrap();

        // The consumer at 200 is told everything from -1 on changed.
        let history2 = dest_reader.pull_with_rebase(300, &mut cursor2, &mut rebase);
        assert_eq!(rebase, Some(NEVER));
        assert_eq!(cursor2, 300);
        assert_eq!(history2.earliest(), Some(0));

        // Source advances twice more; push only the new span.
        let mut source = map;
        source.checkout(200).unwrap();
        modify(&mut source);
        source.commit(300).unwrap();
        modify2(&mut source);
        source.commit(400).unwrap();
        let mut src_cursor = 200;
        let tail = source
            .reader()
            .pull_with_rebase(400, &mut src_cursor, &mut rebase);
        assert_eq!(tail.earliest(), Some(300));

        assert_eq!(dest.push(tail), Ok(400));
        assert_eq!(dest.get(1), source.get(1));

        // The second rebase lands at 400 with source 299; a consumer
        // at 300 rewinds to 299 and receives 300 and 400.
        let history3 = dest_reader.pull_with_rebase(400, &mut cursor2, &mut rebase);
        assert_eq!(rebase, Some(299));
        assert_eq!(cursor2, 400);
        assert_eq!(history3.earliest(), Some(300));
        assert_eq!(history3.latest(), Some(400));
    }

    #[test]
    fn push_of_empty_history_is_a_noop() {
        let mut map = committed();
        assert_eq!(map.push(History::default()), Ok(200));
        assert_eq!(*map.map(), refmap200());
    }

    #[test]
    fn push_while_rewound_is_rejected() {
        let source = committed();
        let mut cursor = NEVER;
        let history = source.reader().pull(200, &mut cursor);

        let mut dest = committed();
        dest.checkout(100).unwrap();
        assert!(matches!(dest.push(history), Err(StoreError::Rewound { .. })));
    }

    #[test]
    fn ring_is_bounded() {
        let mut map: VersionedMap<u32> = VersionedMap::new();
        for i in 0..(HISTORY_LEN as Timestamp + 10) {
            map.update(0, i as u32).unwrap();
            map.commit(i).unwrap();
        }
        let mut cursor = NEVER;
        let history = map.reader().pull(map.highest(), &mut cursor);
        assert_eq!(history.additions.len(), HISTORY_LEN);
    }
}
