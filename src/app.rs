//! Process lifecycle: configuration → store → scheduler → network.
//!
//! The [`App`] value *is* the process context. Everything that used
//! to be reachable globally — the store, the scheduler, the network —
//! is owned here and handed to systems by reference at construction
//! time; binding happens once, in the entry point.

use std::sync::Arc;

use lattice_sched::{Scheduler, System, WorkerPool};
use tracing::info;

use crate::command::{CommandSystem, UserCommand};
use crate::config::{Config, ConfigAccounts};
use crate::network::{NetworkServer, NetworkSettings};
use crate::protocol::Major;
use crate::replication::ReplicationSystem;
use crate::store::{StagedQueue, Store};

/// Minor code of command frames under [`Major::Game`].
pub const COMMAND_MINOR: u8 = 0;

/// One running server process.
pub struct App {
    store: Arc<Store>,
    scheduler: Scheduler,
    network: NetworkServer,
    user_commands: Arc<StagedQueue<UserCommand>>,
    orders: Arc<StagedQueue<UserCommand>>,
    pool: WorkerPool,
}

impl App {
    /// Brings the process up in the canonical order: store first,
    /// then the network (a bind failure aborts before any worker
    /// thread exists), then the scheduler workers with their bound
    /// systems.
    pub async fn bind(config: Config) -> anyhow::Result<Self> {
        Self::bind_with(config, Vec::new()).await
    }

    /// As [`bind`](Self::bind), with additional simulation systems
    /// bound to their own workers after the command system.
    pub async fn bind_with(
        config: Config,
        extra_systems: Vec<Box<dyn System>>,
    ) -> anyhow::Result<Self> {
        let store = Arc::new(Store::new());
        let user_commands = Arc::new(StagedQueue::new());
        let orders = Arc::new(StagedQueue::new());

        let network = NetworkServer::bind(NetworkSettings {
            address: config.address,
            max_connections: config.max_connections,
            callbacks: Arc::new(ConfigAccounts::new(config.accounts.clone())),
        })
        .await?;
        info!(address = %network.local_addr(), "listening");

        let incoming = network.router().register(Major::Game.code(), COMMAND_MINOR);
        let mut systems: Vec<Box<dyn System>> = vec![
            Box::new(CommandSystem::new(
                store.clone(),
                user_commands.clone(),
                orders.clone(),
                incoming,
            )),
            Box::new(ReplicationSystem::new(store.clone(), network.clone())),
        ];
        systems.extend(extra_systems);

        let scheduler = Scheduler::new();
        let pool = scheduler.start(systems, config.workers);

        Ok(Self {
            store,
            scheduler,
            network,
            user_commands,
            orders,
            pool,
        })
    }

    #[must_use]
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    #[must_use]
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    #[must_use]
    pub fn network(&self) -> &NetworkServer {
        &self.network
    }

    /// The order queue, for server-side command sources (AI,
    /// scripting, an admin console).
    #[must_use]
    pub fn orders(&self) -> &Arc<StagedQueue<UserCommand>> {
        &self.orders
    }

    #[must_use]
    pub fn user_commands(&self) -> &Arc<StagedQueue<UserCommand>> {
        &self.user_commands
    }

    /// Stops the process: terminate flag, worker drain, sockets, then
    /// the store drops with the context.
    pub fn shutdown(self) {
        info!("shutting down");
        self.scheduler.request_terminate();
        self.pool.shutdown();
        self.network.shutdown();
    }
}
