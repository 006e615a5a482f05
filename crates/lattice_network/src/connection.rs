//! Per-connection state: the authentication phase machine and the
//! session identity.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use lattice_store::EntityId;

/// Authentication phase of one connection. Transitions move strictly
/// through the sequence; only a reset to `None` may skip.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum AuthPhase {
    None = 0,
    Init = 1,
    KeyExchange = 2,
    ShareKey = 3,
    Authenticated = 4,
}

impl AuthPhase {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Init,
            2 => Self::KeyExchange,
            3 => Self::ShareKey,
            4 => Self::Authenticated,
            _ => Self::None,
        }
    }
}

/// State attached to each socket. Phase transitions are atomic: for a
/// replayed handshake message, exactly one task wins the transition
/// and every other observer sees a no-op.
#[derive(Debug)]
pub struct ConnectionData {
    phase: AtomicU8,
    entity: AtomicU32,
}

impl ConnectionData {
    #[must_use]
    pub fn new() -> Self {
        Self {
            phase: AtomicU8::new(AuthPhase::None as u8),
            entity: AtomicU32::new(0),
        }
    }

    #[must_use]
    pub fn phase(&self) -> AuthPhase {
        AuthPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn is(&self, phase: AuthPhase) -> bool {
        self.phase() == phase
    }

    /// Attempts the transition into `to` from its predecessor phase.
    /// Returns true only for the first caller; a reset to
    /// [`AuthPhase::None`] is always allowed and returns false.
    pub fn advance(&self, to: AuthPhase) -> bool {
        if to == AuthPhase::None {
            self.phase.store(AuthPhase::None as u8, Ordering::Release);
            return false;
        }
        let from = to as u8 - 1;
        self.phase
            .compare_exchange(from, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Drops the connection back to the unauthenticated phase.
    pub fn reset(&self) {
        self.advance(AuthPhase::None);
    }

    /// The entity bound to this session; 0 until the key exchange
    /// succeeds.
    #[must_use]
    pub fn entity(&self) -> EntityId {
        self.entity.load(Ordering::Acquire)
    }

    pub fn bind_entity(&self, entity: EntityId) {
        self.entity.store(entity, Ordering::Release);
    }
}

impl Default for ConnectionData {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_walk_the_sequence() {
        let conn = ConnectionData::new();
        assert_eq!(conn.phase(), AuthPhase::None);
        assert!(conn.advance(AuthPhase::Init));
        assert!(conn.advance(AuthPhase::KeyExchange));
        assert!(conn.advance(AuthPhase::ShareKey));
        assert!(conn.advance(AuthPhase::Authenticated));
        assert!(conn.is(AuthPhase::Authenticated));
    }

    #[test]
    fn replayed_transitions_are_noops() {
        let conn = ConnectionData::new();
        assert!(conn.advance(AuthPhase::Init));
        assert!(!conn.advance(AuthPhase::Init), "replay must lose");
        assert_eq!(conn.phase(), AuthPhase::Init);
    }

    #[test]
    fn skipping_a_phase_is_rejected() {
        let conn = ConnectionData::new();
        assert!(conn.advance(AuthPhase::Init));
        assert!(!conn.advance(AuthPhase::ShareKey));
        assert_eq!(conn.phase(), AuthPhase::Init);
    }

    #[test]
    fn reset_is_always_allowed() {
        let conn = ConnectionData::new();
        conn.advance(AuthPhase::Init);
        conn.advance(AuthPhase::KeyExchange);
        assert!(!conn.advance(AuthPhase::None));
        assert_eq!(conn.phase(), AuthPhase::None);
    }

    #[test]
    fn only_one_thread_wins_a_transition() {
        let conn = std::sync::Arc::new(ConnectionData::new());
        conn.advance(AuthPhase::Init);
        let winners: usize = std::thread::scope(|s| {
            (0..8)
                .map(|_| {
                    let conn = conn.clone();
                    s.spawn(move || usize::from(conn.advance(AuthPhase::KeyExchange)))
                })
                .collect::<Vec<_>>()
                .into_iter()
                .map(|h| h.join().unwrap())
                .sum()
        });
        assert_eq!(winners, 1);
    }
}
