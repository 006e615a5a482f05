//! Network egress: pulls committed transform diffs out of the store
//! and fans them out to every authenticated session.
//!
//! This is the same consumer position a renderer occupies — a cursor
//! over the graphic-transform history — except the diff goes onto the
//! wire instead of the screen. The system only ever pulls up to the
//! published head, so it never waits on the publisher.

use std::sync::Arc;

use lattice_protocol::packets::TransformUpdate;
use lattice_protocol::{Encode, Major};
use lattice_sched::System;
use lattice_store::{Store, Timestamp, NEVER};
use tracing::debug;

use crate::network::NetworkServer;

/// Minor code of transform updates under [`Major::World`].
pub const TRANSFORM_MINOR: u8 = 0;

/// Entities per update frame, sized so one update stays well inside
/// the wire message bound.
const MAX_UPDATES_PER_FRAME: usize = 1500;
const MAX_REMOVALS_PER_FRAME: usize = 4000;

/// The egress system: one history cursor, shared by all sessions.
pub struct ReplicationSystem {
    store: Arc<Store>,
    network: NetworkServer,
    cursor: Timestamp,
}

impl ReplicationSystem {
    #[must_use]
    pub fn new(store: Arc<Store>, network: NetworkServer) -> Self {
        Self {
            store,
            network,
            cursor: NEVER,
        }
    }

    fn broadcast(&self, update: &TransformUpdate) {
        let mut body = Vec::new();
        update
            .encode(&mut body)
            .expect("encoding into a Vec cannot fail");
        for entity in self.network.sessions() {
            if let Err(e) = self
                .network
                .send(entity, Major::World.code(), TRANSFORM_MINOR, &body)
            {
                debug!(entity, "transform update not delivered: {e}");
            }
        }
    }
}

impl System for ReplicationSystem {
    fn name(&self) -> &'static str {
        "replication-system"
    }

    fn handle_events(&mut self, _tick: Timestamp) {
        let head = self.store.graphic_transform.head();
        if head <= self.cursor {
            return;
        }

        let mut rebase = None;
        let history = self
            .store
            .graphic_transform
            .pull_with_rebase(head, &mut self.cursor, &mut rebase);
        if let Some(source) = rebase {
            // History behind the cursor was rewritten; the pulled span
            // already covers it, clients just replay from there.
            debug!(source, "transform history was rebased");
        }

        for (&tick, additions) in &history.additions {
            let removals = history.removals.get(&tick);

            let updates: Vec<_> = additions
                .entries
                .iter()
                .map(|(&entity, &transform)| (entity, transform))
                .collect();
            let removed: Vec<_> = removals
                .map(|set| set.entries.keys().copied().collect())
                .unwrap_or_default();
            if updates.is_empty() && removed.is_empty() {
                continue;
            }

            // Split oversized commits across several wire messages.
            let mut updates = updates.as_slice();
            let mut removed = removed.as_slice();
            loop {
                let (head_updates, rest_updates) =
                    updates.split_at(updates.len().min(MAX_UPDATES_PER_FRAME));
                let (head_removed, rest_removed) =
                    removed.split_at(removed.len().min(MAX_REMOVALS_PER_FRAME));
                self.broadcast(&TransformUpdate {
                    tick,
                    updates: head_updates.to_vec(),
                    removals: head_removed.to_vec(),
                });
                updates = rest_updates;
                removed = rest_removed;
                if updates.is_empty() && removed.is_empty() {
                    break;
                }
            }
        }
    }
}
