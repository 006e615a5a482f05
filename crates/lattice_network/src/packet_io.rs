//! Socket-side frame reassembly with flow bounds and the reassembly
//! deadline.

use std::time::Duration;

use anyhow::{bail, Context};
use bytes::Bytes;
use lattice_protocol::{Frame, FrameDecoder, TrailerKind};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

/// Read budget per cycle from a socket that has not authenticated.
pub const MAX_UNAUTHENTICATED_READ: usize = 128;

/// Read budget per cycle from an authenticated socket.
pub const MAX_AUTHENTICATED_READ: usize = 1460;

/// A logical message not completed within this window aborts the
/// connection.
pub const REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(3);

/// A socket paired with a [`FrameDecoder`].
///
/// `recv_frame` enforces the per-cycle read budget and the
/// three-second reassembly deadline; the deadline starts when the
/// first byte of a message is buffered, not when the caller begins
/// waiting, so a slow trickle is cut off no matter how the reads are
/// spread out.
pub(crate) struct FrameIo<S> {
    stream: S,
    decoder: FrameDecoder,
    read_budget: usize,
    /// Deadline for the partially reassembled message, if any.
    deadline: Option<Instant>,
}

impl<S> FrameIo<S> {
    pub(crate) fn new(stream: S) -> Self {
        Self {
            stream,
            decoder: FrameDecoder::new(),
            read_budget: MAX_UNAUTHENTICATED_READ,
            deadline: None,
        }
    }

    /// Rebuilds an authenticated `FrameIo` around one half of a split
    /// stream, keeping the decoder state.
    pub(crate) fn from_parts(stream: S, decoder: FrameDecoder) -> Self {
        Self {
            stream,
            decoder,
            read_budget: MAX_AUTHENTICATED_READ,
            deadline: None,
        }
    }

    /// Switches the socket to authenticated mode: bigger read budget
    /// and the given trailer on incoming frames.
    pub(crate) fn authenticate(&mut self, trailer: TrailerKind) {
        self.read_budget = MAX_AUTHENTICATED_READ;
        self.decoder.set_trailer(trailer);
    }

    pub(crate) fn into_parts(self) -> (S, FrameDecoder) {
        (self.stream, self.decoder)
    }
}

impl<S: AsyncRead + Unpin> FrameIo<S> {
    /// Receives the next complete frame.
    ///
    /// Errors on EOF, I/O failure, oversize frames and the reassembly
    /// timeout; every one of them tears the connection down.
    pub(crate) async fn recv_frame(&mut self) -> anyhow::Result<Frame> {
        let mut buf = vec![0u8; self.read_budget];
        loop {
            if let Some(frame) = self.decoder.try_next_frame()? {
                if self.decoder.pending() == 0 {
                    self.deadline = None;
                } else {
                    // The buffered excess already starts the next
                    // message; restart its clock.
                    self.deadline = Some(Instant::now() + REASSEMBLY_TIMEOUT);
                }
                return Ok(frame);
            }

            let read = self.stream.read(&mut buf);
            let n = match self.deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, read)
                    .await
                    .context("reassembly timed out")??,
                None => read.await?,
            };
            if n == 0 {
                bail!(std::io::Error::from(std::io::ErrorKind::UnexpectedEof));
            }
            self.decoder.queue_bytes(&buf[..n]);
            if self.deadline.is_none() {
                self.deadline = Some(Instant::now() + REASSEMBLY_TIMEOUT);
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> FrameIo<S> {
    pub(crate) async fn send_bytes(&mut self, bytes: &Bytes) -> anyhow::Result<()> {
        self.stream.write_all(bytes).await?;
        Ok(())
    }
}
