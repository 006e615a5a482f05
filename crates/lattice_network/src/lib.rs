#![doc = include_str!("../README.md")]

mod connect;
mod connection;
mod packet_io;

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
pub use connection::{AuthPhase, ConnectionData};
use lattice_protocol::crypto::SignatureSigner;
use lattice_protocol::{EntityId, FrameBuilder, PUBLIC_KEY_LEN};
pub use packet_io::{MAX_AUTHENTICATED_READ, MAX_UNAUTHENTICATED_READ, REASSEMBLY_TIMEOUT};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::net::TcpListener;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub use crate::connect::{NetworkClient, CONNECT_TIMEOUT};

/// Bound of each handler queue; frames past it are dropped, never
/// blocked on.
pub const HANDLER_QUEUE_LEN: usize = 256;

/// Bound of each connection's outgoing byte queue.
pub const OUTGOING_QUEUE_LEN: usize = 64;

/// A verified frame on its way to a simulation system.
#[derive(Clone, Debug)]
pub struct RoutedFrame {
    /// Entity bound to the sending session; 0 for unauthenticated
    /// traffic.
    pub entity: EntityId,
    pub major: u8,
    pub minor: u8,
    pub body: Bytes,
}

/// Routes completed frames by `(major, minor)` into bounded channels
/// drained by simulation systems. Socket tasks never block here: a
/// full or closed queue drops the frame.
#[derive(Default)]
pub struct PacketRouter {
    handlers: Mutex<FxHashMap<(u8, u8), flume::Sender<RoutedFrame>>>,
}

impl PacketRouter {
    /// Registers the handler queue for one `(major, minor)` pair,
    /// replacing any previous one, and returns its receiving end.
    pub fn register(&self, major: u8, minor: u8) -> flume::Receiver<RoutedFrame> {
        let (tx, rx) = flume::bounded(HANDLER_QUEUE_LEN);
        self.handlers.lock().insert((major, minor), tx);
        rx
    }

    pub(crate) fn route(&self, frame: RoutedFrame) {
        let key = (frame.major, frame.minor);
        let Some(tx) = self.handlers.lock().get(&key).cloned() else {
            debug!(major = key.0, minor = key.1, "frame with no registered handler; dropped");
            return;
        };
        if let Err(e) = tx.try_send(frame) {
            warn!(
                major = key.0,
                minor = key.1,
                "handler queue rejected frame: {e}"
            );
        }
    }
}

/// Server-side hooks: credentials and session lifecycle.
pub trait ServerCallbacks: Send + Sync + 'static {
    /// The password stored for a login, or `None` for an unknown
    /// account (which closes the connection).
    fn password_for(&self, login: &str) -> Option<String>;

    /// Called when a session reaches the authenticated phase.
    fn session_opened(&self, login: &str, entity: EntityId) {
        let _ = (login, entity);
    }

    /// Called when an authenticated session ends, however it ends.
    fn session_closed(&self, entity: EntityId) {
        let _ = entity;
    }
}

/// The default callbacks reject every login. Useful as a placeholder.
impl ServerCallbacks for () {
    fn password_for(&self, _login: &str) -> Option<String> {
        None
    }
}

/// Settings for [`NetworkServer::bind`]. Mutations after binding have
/// no effect.
#[derive(Clone)]
pub struct NetworkSettings {
    /// The socket address the server will be bound to.
    pub address: SocketAddr,
    /// Maximum simultaneous connections, authenticated or not.
    pub max_connections: usize,
    pub callbacks: Arc<dyn ServerCallbacks>,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            address: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 7777).into(),
            max_connections: 1024,
            callbacks: Arc::new(()),
        }
    }
}

pub(crate) struct ServerInner {
    local_addr: SocketAddr,
    pub(crate) callbacks: Arc<dyn ServerCallbacks>,
    pub(crate) signer: SignatureSigner,
    pub(crate) router: PacketRouter,
    /// Limits simultaneous connections; closing it stops the accept
    /// loop.
    pub(crate) connection_sema: Arc<Semaphore>,
    pub(crate) next_entity: AtomicU32,
    pub(crate) connections: Mutex<FxHashMap<EntityId, flume::Sender<Bytes>>>,
    /// Flipped to true exactly once; session tasks watch it.
    pub(crate) shutdown: watch::Sender<bool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

/// The listening side of the framing layer. Internally refcounted;
/// clones share the same server.
#[derive(Clone)]
pub struct NetworkServer(pub(crate) Arc<ServerInner>);

impl NetworkServer {
    /// Binds the listen address and starts accepting connections. A
    /// bind failure is returned before any simulation state is
    /// touched, so the process can exit cleanly.
    pub async fn bind(settings: NetworkSettings) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(settings.address)
            .await
            .with_context(|| format!("failed to bind listen address {}", settings.address))?;
        let local_addr = listener.local_addr()?;

        let server = Self(Arc::new(ServerInner {
            local_addr,
            callbacks: settings.callbacks,
            signer: SignatureSigner::generate(),
            router: PacketRouter::default(),
            connection_sema: Arc::new(Semaphore::new(
                settings.max_connections.min(Semaphore::MAX_PERMITS),
            )),
            next_entity: AtomicU32::new(1),
            connections: Mutex::new(FxHashMap::default()),
            shutdown: watch::channel(false).0,
            accept_task: Mutex::new(None),
        }));

        let task = tokio::spawn(connect::do_accept_loop(server.clone(), listener));
        *server.0.accept_task.lock() = Some(task);
        Ok(server)
    }

    /// The address actually bound, with the ephemeral port resolved.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.0.local_addr
    }

    /// The key clients must be configured with to verify this
    /// server's signatures.
    #[must_use]
    pub fn verifying_key(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.0.signer.verifying_key()
    }

    #[must_use]
    pub fn router(&self) -> &PacketRouter {
        &self.0.router
    }

    /// Number of authenticated sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.0.connections.lock().len()
    }

    /// The entities of every authenticated session, in no particular
    /// order.
    #[must_use]
    pub fn sessions(&self) -> Vec<EntityId> {
        self.0.connections.lock().keys().copied().collect()
    }

    /// Queues a signed frame for the session bound to `entity`.
    /// Never blocks; a full outgoing queue is an error.
    pub fn send(&self, entity: EntityId, major: u8, minor: u8, body: &[u8]) -> anyhow::Result<()> {
        let tx = self
            .0
            .connections
            .lock()
            .get(&entity)
            .cloned()
            .with_context(|| format!("no session bound to entity {entity}"))?;
        let wire = FrameBuilder::new(major, minor)
            .body(body)
            .finish_signed(&self.0.signer, entity);
        tx.try_send(wire)
            .map_err(|e| anyhow::anyhow!("outgoing queue refused frame for entity {entity}: {e}"))
    }

    /// Stops accepting connections and tears every session down.
    pub fn shutdown(&self) {
        self.0.connection_sema.close();
        if let Some(task) = self.0.accept_task.lock().take() {
            task.abort();
        }
        let _ = self.0.shutdown.send(true);
        self.0.connections.lock().clear();
    }
}
