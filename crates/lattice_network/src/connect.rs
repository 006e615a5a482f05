//! Connection acceptance and the five-message session handshake.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, ensure, Context};
use lattice_protocol::crypto::{derive_password_key, SessionHasher, SignatureVerifier};
use lattice_protocol::packets::{
    decode_body, AuthInit, AuthKeyExchange, AuthKeyReply, AuthSendSalt,
};
use lattice_protocol::{
    auth, is_restricted, EntityId, Frame, FrameBuilder, Major, TrailerKind, PUBLIC_KEY_LEN,
    SALT_LEN, SESSION_KEY_LEN,
};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, trace, warn};

use crate::connection::{AuthPhase, ConnectionData};
use crate::packet_io::FrameIo;
use crate::{NetworkServer, RoutedFrame, OUTGOING_QUEUE_LEN};

/// How long a client waits for the whole handshake before giving up.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Accepts new connections to the server as they occur.
pub(super) async fn do_accept_loop(server: NetworkServer, listener: TcpListener) {
    loop {
        match server.0.connection_sema.clone().acquire_owned().await {
            Ok(permit) => match listener.accept().await {
                Ok((stream, remote)) => {
                    let server = server.clone();
                    tokio::spawn(async move {
                        handle_connection(server, stream, remote).await;
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!("failed to accept incoming connection: {e}");
                }
            },
            // Closed semaphore indicates server shutdown.
            Err(_) => return,
        }
    }
}

fn is_quiet_eof(e: &anyhow::Error) -> bool {
    e.downcast_ref::<io::Error>()
        .is_some_and(|e| e.kind() == io::ErrorKind::UnexpectedEof)
}

async fn handle_connection(server: NetworkServer, stream: TcpStream, remote: SocketAddr) {
    trace!(%remote, "handling connection");

    if let Err(e) = stream.set_nodelay(true) {
        error!("failed to set TCP_NODELAY: {e}");
    }

    let conn = ConnectionData::new();
    conn.advance(AuthPhase::Init);
    let mut io = FrameIo::new(stream);

    match serve_handshake(&server, &mut io, &conn, remote).await {
        Ok(Some(session)) => {
            if let Err(e) = serve_session(&server, io, session).await {
                if !is_quiet_eof(&e) {
                    debug!(%remote, "session ended with error: {e:#}");
                }
            }
        }
        // Rejected cleanly: unknown user or wrong password.
        Ok(None) => conn.reset(),
        Err(e) => {
            // Disconnecting mid-handshake is not very erroneous.
            if !is_quiet_eof(&e) {
                warn!(%remote, "connection ended with error: {e:#}");
            }
        }
    }
}

struct Session {
    entity: EntityId,
    login: String,
    hasher: Arc<SessionHasher>,
}

struct PendingAuth {
    login: String,
    salt: [u8; SALT_LEN],
    password_key: [u8; SESSION_KEY_LEN],
}

/// Drives the server side of the handshake. Returns `Ok(None)` when
/// the peer was rejected cleanly (unknown account, bad password);
/// errors tear the connection down.
async fn serve_handshake(
    server: &NetworkServer,
    io: &mut FrameIo<TcpStream>,
    conn: &ConnectionData,
    remote: SocketAddr,
) -> anyhow::Result<Option<Session>> {
    let mut pending: Option<PendingAuth> = None;

    loop {
        let frame = io.recv_frame().await?;

        if frame.major != Major::Auth.code() {
            ensure!(
                !is_restricted(frame.major),
                "restricted frame (major {}) before authentication",
                frame.major
            );
            // Public traffic is allowed before authentication, with
            // no session identity attached.
            server.0.router.route(RoutedFrame {
                entity: 0,
                major: frame.major,
                minor: frame.minor,
                body: frame.body,
            });
            continue;
        }

        match frame.minor {
            auth::INIT => {
                if !conn.advance(AuthPhase::KeyExchange) {
                    debug!(%remote, "replayed auth init; ignoring");
                    continue;
                }
                let init: AuthInit = decode_body(&frame.body)?;
                let login = init.login_str().to_owned();
                let Some(password) = server.0.callbacks.password_for(&login) else {
                    info!(%login, %remote, "authentication failed: user unknown");
                    return Ok(None);
                };
                let salt: [u8; SALT_LEN] = rand::random();
                let password_key = derive_password_key(password.as_bytes(), &salt);
                pending = Some(PendingAuth {
                    login,
                    salt,
                    password_key,
                });

                let wire = FrameBuilder::new(Major::Auth.code(), auth::SEND_SALT)
                    .encode(&AuthSendSalt { salt })
                    .finish_plain();
                io.send_bytes(&wire).await?;
            }
            auth::KEY_EXCHANGE => {
                let Some(pending) = pending.as_ref() else {
                    bail!("key exchange before auth init");
                };
                ensure!(
                    conn.is(AuthPhase::KeyExchange),
                    "key exchange in phase {:?}",
                    conn.phase()
                );
                let packet: AuthKeyExchange = decode_body(&frame.body)?;
                ensure!(packet.salt == pending.salt, "salt mismatch in key exchange");
                if !packet.verify(&pending.password_key) {
                    info!(login = %pending.login, %remote, "authentication failed: bad password");
                    return Ok(None);
                }
                ensure!(
                    conn.advance(AuthPhase::ShareKey),
                    "concurrent key exchange lost the transition"
                );

                let hasher = Arc::new(packet.build_hasher(&pending.password_key));
                let entity = server.0.next_entity.fetch_add(1, Ordering::Relaxed);
                conn.bind_entity(entity);
                io.authenticate(TrailerKind::Mac);

                let reply = FrameBuilder::new(Major::Auth.code(), auth::KEY_REPLY)
                    .encode(&AuthKeyReply {
                        pubkey: server.0.signer.verifying_key(),
                        entity,
                    })
                    .finish_signed(&server.0.signer, entity);
                io.send_bytes(&reply).await?;

                conn.advance(AuthPhase::Authenticated);
                info!(login = %pending.login, entity, %remote, "session authenticated");
                return Ok(Some(Session {
                    entity,
                    login: pending.login.clone(),
                    hasher,
                }));
            }
            other => bail!("unexpected auth message {other} during handshake"),
        }
    }
}

/// Runs one authenticated session until EOF, an I/O error or the
/// reassembly timeout ends it.
async fn serve_session(
    server: &NetworkServer,
    io: FrameIo<TcpStream>,
    session: Session,
) -> anyhow::Result<()> {
    let (outgoing_send, outgoing_recv) = flume::bounded(OUTGOING_QUEUE_LEN);
    server
        .0
        .connections
        .lock()
        .insert(session.entity, outgoing_send);
    server
        .0
        .callbacks
        .session_opened(&session.login, session.entity);

    let (stream, decoder) = io.into_parts();
    let (read_half, mut write_half) = stream.into_split();

    let writer_task = tokio::spawn(async move {
        while let Ok(bytes) = outgoing_recv.recv_async().await {
            if let Err(e) = write_half.write_all(&bytes).await {
                debug!("error writing data to stream: {e}");
                break;
            }
        }
    });

    let mut reader = FrameIo::from_parts(read_half, decoder);
    let mut shutdown = server.0.shutdown.subscribe();
    let result = loop {
        let received = tokio::select! {
            received = reader.recv_frame() => received,
            _ = shutdown.changed() => break Ok(()),
        };
        let frame = match received {
            Ok(frame) => frame,
            Err(e) => break Err(e),
        };
        if !frame.verify_mac(&session.hasher) {
            // A single bad MAC may be replay or corruption; drop the
            // frame, keep the session.
            debug!(entity = session.entity, "bad MAC on authenticated frame; dropped");
            continue;
        }
        server.0.router.route(RoutedFrame {
            entity: session.entity,
            major: frame.major,
            minor: frame.minor,
            body: frame.body,
        });
    };

    server.0.connections.lock().remove(&session.entity);
    server.0.callbacks.session_closed(session.entity);
    writer_task.abort();
    result
}

/// The connecting side of a session.
///
/// `connect` drives the client half of the handshake and resolves
/// once the session is authenticated; afterwards every outgoing frame
/// is MACed under the session key and every incoming frame must carry
/// a valid server signature addressed to this entity.
pub struct NetworkClient {
    io: FrameIo<TcpStream>,
    conn: ConnectionData,
    hasher: Arc<SessionHasher>,
    verifier: SignatureVerifier,
    entity: EntityId,
}

impl NetworkClient {
    /// Connects and authenticates, or fails within
    /// [`CONNECT_TIMEOUT`]. `server_key` is the out-of-band
    /// verification key for this server.
    pub async fn connect(
        addr: SocketAddr,
        login: &str,
        password: &str,
        server_key: [u8; PUBLIC_KEY_LEN],
    ) -> anyhow::Result<Self> {
        tokio::time::timeout(
            CONNECT_TIMEOUT,
            Self::connect_inner(addr, login, password, server_key),
        )
        .await
        .context("connection attempt timed out")?
    }

    async fn connect_inner(
        addr: SocketAddr,
        login: &str,
        password: &str,
        server_key: [u8; PUBLIC_KEY_LEN],
    ) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("failed to connect to {addr}"))?;
        if let Err(e) = stream.set_nodelay(true) {
            error!("failed to set TCP_NODELAY: {e}");
        }

        let conn = ConnectionData::new();
        let mut io = FrameIo::new(stream);

        let wire = FrameBuilder::new(Major::Auth.code(), auth::INIT)
            .encode(&AuthInit::from_login(login))
            .finish_plain();
        io.send_bytes(&wire).await?;
        conn.advance(AuthPhase::Init);

        let frame = io.recv_frame().await?;
        ensure!(
            frame.major == Major::Auth.code() && frame.minor == auth::SEND_SALT,
            "expected the salt, got frame ({}, {})",
            frame.major,
            frame.minor
        );
        ensure!(
            conn.advance(AuthPhase::KeyExchange),
            "salt received in phase {:?}",
            conn.phase()
        );
        let salt: AuthSendSalt = decode_body(&frame.body)?;

        let password_key = derive_password_key(password.as_bytes(), &salt.salt);
        let packet = AuthKeyExchange::new(salt.salt, &password_key);
        let hasher = Arc::new(packet.build_hasher(&password_key));
        let wire = FrameBuilder::new(Major::Auth.code(), auth::KEY_EXCHANGE)
            .encode(&packet)
            .finish_plain();
        io.send_bytes(&wire).await?;

        // Everything from the server is signed from here on.
        io.authenticate(TrailerKind::Signed);
        let reply_frame = io.recv_frame().await.context("server closed during key exchange")?;
        ensure!(
            reply_frame.major == Major::Auth.code() && reply_frame.minor == auth::KEY_REPLY,
            "expected the key reply, got frame ({}, {})",
            reply_frame.major,
            reply_frame.minor
        );
        let reply: AuthKeyReply = decode_body(&reply_frame.body)?;

        let verifier = SignatureVerifier::new(server_key);
        ensure!(
            reply_frame.verify_signature(&verifier, reply.entity),
            "server signature rejected; refusing the session"
        );
        ensure!(
            reply.pubkey == server_key,
            "server announced a different key than the configured one"
        );

        conn.advance(AuthPhase::ShareKey);
        conn.advance(AuthPhase::Authenticated);
        conn.bind_entity(reply.entity);
        debug!(entity = reply.entity, "session authenticated");

        Ok(Self {
            io,
            conn,
            hasher,
            verifier,
            entity: reply.entity,
        })
    }

    /// The entity id the server bound to this session.
    #[must_use]
    pub fn entity(&self) -> EntityId {
        self.entity
    }

    #[must_use]
    pub fn phase(&self) -> AuthPhase {
        self.conn.phase()
    }

    /// Sends one MACed frame.
    pub async fn send(&mut self, major: u8, minor: u8, body: &[u8]) -> anyhow::Result<()> {
        let wire = FrameBuilder::new(major, minor)
            .body(body)
            .finish_mac(&self.hasher);
        self.io.send_bytes(&wire).await
    }

    /// Receives the next server frame, verifying its signature and
    /// that it is addressed to this session. A forged or misdirected
    /// frame is an error; callers drop the connection.
    pub async fn recv(&mut self) -> anyhow::Result<Frame> {
        let frame = self.io.recv_frame().await?;
        ensure!(
            frame.verify_signature(&self.verifier, self.entity),
            "bad server signature on frame ({}, {})",
            frame.major,
            frame.minor
        );
        Ok(frame)
    }
}
