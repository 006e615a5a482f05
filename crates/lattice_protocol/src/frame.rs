//! Frame layout, building and stream reassembly.

use anyhow::{bail, ensure};
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::crypto::{SessionHasher, SignatureSigner, SignatureVerifier};
use crate::{
    EntityId, HEADER_LEN, HEADER_TAIL_LEN, MAC_LEN, MAX_MESSAGE_SIZE, SIG_LEN,
};

/// What kind of trailer the peer is expected to append. Changes as
/// the session authenticates.
#[derive(Copy, Clone, PartialEq, Eq, Default, Debug)]
pub enum TrailerKind {
    /// Handshake traffic carries no trailer.
    #[default]
    None,
    /// Client-to-server: 8-byte session MAC.
    Mac,
    /// Server-to-client: 24-byte signature plus the entity id.
    Signed,
}

impl TrailerKind {
    #[must_use]
    pub fn len(self) -> usize {
        match self {
            Self::None => 0,
            Self::Mac => MAC_LEN,
            Self::Signed => SIG_LEN + 4,
        }
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self == Self::None
    }
}

/// A decoded trailer.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Trailer {
    None,
    Mac([u8; MAC_LEN]),
    Signed {
        sig: [u8; SIG_LEN],
        entity: EntityId,
    },
}

/// One reassembled frame.
///
/// `signed` is the region the trailer protects: every byte from the
/// length field through the end of the body. `body` is a zero-copy
/// slice of it.
#[derive(Clone, Debug)]
pub struct Frame {
    pub major: u8,
    pub minor: u8,
    pub body: Bytes,
    pub trailer: Trailer,
    pub signed: Bytes,
}

impl Frame {
    /// Verifies the MAC trailer against a session hasher. Frames with
    /// another trailer kind fail.
    #[must_use]
    pub fn verify_mac(&self, hasher: &SessionHasher) -> bool {
        match &self.trailer {
            Trailer::Mac(tag) => hasher.verify(tag, &self.signed),
            _ => false,
        }
    }

    /// Verifies the signature trailer against the preconfigured
    /// server key and the receiver's entity id.
    #[must_use]
    pub fn verify_signature(&self, verifier: &SignatureVerifier, entity: EntityId) -> bool {
        match &self.trailer {
            Trailer::Signed {
                sig,
                entity: target,
            } => *target == entity && verifier.verify(sig, &self.signed),
            _ => false,
        }
    }
}

/// Builds one outgoing frame. The length field is patched in when the
/// trailer is applied.
pub struct FrameBuilder {
    buf: BytesMut,
}

impl FrameBuilder {
    #[must_use]
    pub fn new(major: u8, minor: u8) -> Self {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u32_le(0); // patched by finish_*
        buf.put_u8(major);
        buf.put_u8(minor);
        buf.put_bytes(0, 6);
        Self { buf }
    }

    /// Appends raw bytes to the body.
    #[must_use]
    pub fn body(mut self, bytes: &[u8]) -> Self {
        self.buf.put_slice(bytes);
        self
    }

    /// Appends an [`Encode`](crate::Encode) value to the body.
    #[must_use]
    pub fn encode(mut self, value: &impl crate::Encode) -> Self {
        let mut w = (&mut self.buf).writer();
        value
            .encode(&mut w)
            .expect("encoding into a BytesMut cannot fail");
        self
    }

    fn patch_length(&mut self, trailer_len: usize) {
        let length = (self.buf.len() - 4 + trailer_len) as u32;
        self.buf[..4].copy_from_slice(&length.to_le_bytes());
    }

    /// Finishes an unauthenticated handshake frame.
    #[must_use]
    pub fn finish_plain(mut self) -> Bytes {
        self.patch_length(0);
        self.buf.freeze()
    }

    /// Finishes a client frame, appending the session MAC over the
    /// header and body.
    #[must_use]
    pub fn finish_mac(mut self, hasher: &SessionHasher) -> Bytes {
        self.patch_length(MAC_LEN);
        let tag = hasher.sign(&self.buf);
        self.buf.put_slice(&tag);
        self.buf.freeze()
    }

    /// Finishes a server frame, appending the signature and the
    /// recipient's entity id.
    #[must_use]
    pub fn finish_signed(mut self, signer: &SignatureSigner, entity: EntityId) -> Bytes {
        self.patch_length(SIG_LEN + 4);
        let sig = signer.sign(&self.buf);
        self.buf.put_slice(&sig);
        self.buf.put_u32_le(entity);
        self.buf.freeze()
    }
}

/// Reassembles frames from a byte stream.
///
/// Bytes are queued as they arrive; [`try_next_frame`]
/// (FrameDecoder::try_next_frame) yields a frame as soon as one is
/// complete, and any excess begins the next one. The expected trailer
/// kind is owned by the decoder because it changes exactly once, when
/// the session authenticates.
#[derive(Default)]
pub struct FrameDecoder {
    buf: BytesMut,
    trailer: TrailerKind,
}

impl FrameDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Switches the expected trailer for frames decoded from now on.
    pub fn set_trailer(&mut self, trailer: TrailerKind) {
        self.trailer = trailer;
    }

    #[must_use]
    pub fn trailer(&self) -> TrailerKind {
        self.trailer
    }

    /// Queues raw bytes received from the socket.
    pub fn queue_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes queued but not yet consumed by a complete frame.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Attempts to decode the next complete frame.
    ///
    /// Returns `Ok(None)` while more bytes are needed. Fails on an
    /// oversize length or a length too small to hold the header and
    /// trailer; both close the connection.
    pub fn try_next_frame(&mut self) -> anyhow::Result<Option<Frame>> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let length = u32::from_le_bytes(self.buf[..4].try_into()?) as usize;
        let total = 4 + length;
        ensure!(
            total <= MAX_MESSAGE_SIZE,
            "frame of {total} bytes exceeds the {MAX_MESSAGE_SIZE}-byte message bound"
        );
        let trailer_len = self.trailer.len();
        if length < HEADER_TAIL_LEN + trailer_len {
            bail!(
                "frame length {length} cannot hold the header and a {trailer_len}-byte trailer"
            );
        }
        if self.buf.len() < total {
            // Not enough data arrived yet.
            return Ok(None);
        }

        let mut raw = self.buf.split_to(total).freeze();
        let signed = raw.slice(..total - trailer_len);
        let body = raw.slice(HEADER_LEN..total - trailer_len);
        let major = raw[4];
        let minor = raw[5];

        raw.advance(total - trailer_len);
        let trailer = match self.trailer {
            TrailerKind::None => Trailer::None,
            TrailerKind::Mac => {
                let mut tag = [0u8; MAC_LEN];
                raw.copy_to_slice(&mut tag);
                Trailer::Mac(tag)
            }
            TrailerKind::Signed => {
                let mut sig = [0u8; SIG_LEN];
                raw.copy_to_slice(&mut sig);
                let entity = raw.get_u32_le();
                Trailer::Signed { sig, entity }
            }
        };

        Ok(Some(Frame {
            major,
            minor,
            body,
            trailer,
            signed,
        }))
    }
}
