#![doc = include_str!("../README.md")]

pub mod bitmap;
mod component;
mod error;
mod queue;
mod store;
mod versioned;

pub use bitmap::{on_true, BitMap};
pub use component::{
    Collidable, ComponentKind, ComponentValue, StorageClass, Transform, Velocity,
};
pub use error::StoreError;
pub use queue::StagedQueue;
pub use store::{FlagTable, SharedComponent, Store, Table};
pub use versioned::{
    CommitSet, History, HistoryReader, VersionedMap, HISTORY_LEN, PULL_TIMEOUT,
};

/// A dense, reused entity identifier. Carries no payload; `0` means
/// "not yet assigned".
pub type EntityId = u32;

/// Logical simulation time in nanoseconds. Strictly increasing across
/// commits in normal operation.
pub type Timestamp = i64;

/// Sentinel timestamp for "never received"; predates every commit.
pub const NEVER: Timestamp = -1;
