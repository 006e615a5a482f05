#![doc = include_str!("../README.md")]
#![deny(
    rustdoc::broken_intra_doc_links,
    rustdoc::private_intra_doc_links,
    rustdoc::missing_crate_level_docs,
    rustdoc::invalid_codeblock_attributes,
    rustdoc::invalid_rust_codeblocks,
    rustdoc::bare_urls,
    rustdoc::invalid_html_tags
)]

pub use lattice_network as network;
pub use lattice_protocol as protocol;
pub use lattice_sched as sched;
pub use lattice_store as store;

mod app;
mod command;
mod config;
mod replication;

pub use app::{App, COMMAND_MINOR};
pub use command::{CommandSystem, UserCommand};
pub use config::Config;
pub use replication::{ReplicationSystem, TRANSFORM_MINOR};

/// Most commonly used items, for glob import.
pub mod prelude {
    pub use crate::app::App;
    pub use crate::command::UserCommand;
    pub use crate::config::Config;
    pub use crate::network::{NetworkClient, NetworkServer, ServerCallbacks};
    pub use crate::protocol::Major;
    pub use crate::sched::{Scheduler, System, TICK};
    pub use crate::store::{EntityId, Store, Timestamp};
}
