use crate::Timestamp;

/// Errors returned by store mutation and playback operations.
///
/// Callers are simulation systems running on a scheduler worker; the
/// expected reaction to every variant is to log and skip the offending
/// operation, never to unwind.
#[derive(thiserror::Error, Copy, Clone, PartialEq, Eq, Debug)]
pub enum StoreError {
    /// The map is rewound (`head < highest`); local mutation is
    /// forbidden until it is checked out back to `highest`.
    #[error("map is rewound at {head}, highest commit is {highest}")]
    Rewound { head: Timestamp, highest: Timestamp },

    /// A commit timestamp must be strictly greater than every commit
    /// before it.
    #[error("commit at {requested} is not after the latest commit {highest}")]
    OutOfOrderCommit {
        requested: Timestamp,
        highest: Timestamp,
    },

    /// Checkout of a timestamp that has not been committed yet.
    #[error("checkout of {requested} is ahead of the latest commit {highest}")]
    FutureCheckout {
        requested: Timestamp,
        highest: Timestamp,
    },

    /// A consumer claimed to have received more history than was ever
    /// published. Its cursor is snapped back to `highest`.
    #[error("consumer cursor {cursor} is ahead of the latest commit {highest}")]
    ConsumerAhead {
        cursor: Timestamp,
        highest: Timestamp,
    },

    /// The queue no longer accepts entries; the process is draining.
    #[error("queue is closed")]
    QueueClosed,
}
