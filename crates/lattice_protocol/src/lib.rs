#![doc = include_str!("../README.md")]

pub mod crypto;
pub mod frame;
pub mod packets;

use std::io::Write;

use anyhow::ensure;
pub use frame::{Frame, FrameBuilder, FrameDecoder, Trailer, TrailerKind};
pub use lattice_store::EntityId;

/// Maximum size of one wire message, length field included. Anything
/// larger closes the connection.
pub const MAX_MESSAGE_SIZE: usize = 65535;

/// Bytes of header following the length field: major, minor and six
/// bytes of padding.
pub const HEADER_TAIL_LEN: usize = 8;

/// Full header: length field plus [`HEADER_TAIL_LEN`].
pub const HEADER_LEN: usize = 4 + HEADER_TAIL_LEN;

/// Size of the session MAC trailer.
pub const MAC_LEN: usize = 8;

/// Size of the server signature trailer, excluding the entity id.
pub const SIG_LEN: usize = 24;

/// Majors at or above this value are only valid on authenticated
/// sessions.
pub const RESTRICTED_MAJOR: u8 = 8;

/// Fixed field widths of the handshake bodies.
pub const LOGIN_LEN: usize = 16;
pub const SALT_LEN: usize = 8;
pub const ALEA_LEN: usize = 16;
pub const NONCE2_LEN: usize = 16;
pub const NONCE_LEN: usize = 8;
pub const PUBLIC_KEY_LEN: usize = 32;
pub const SESSION_KEY_LEN: usize = 16;

/// Well-known major codes. Raw codes outside this table still route;
/// the enum only names the ones the engine itself speaks.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
#[repr(u8)]
pub enum Major {
    /// Reserved for loopback and conformance testing.
    Test = 0,
    /// Low-level session control: authentication, disconnect.
    Auth = 1,
    /// Server public information.
    ServerInfo = 2,
    /// Player public profile.
    PlayerInfo = 3,
    /// Binary download.
    Binary = 4,
    /// Public asset download.
    Assets = 5,
    /// Player private profile. Restricted.
    Profile = 8,
    /// World data. Restricted.
    World = 9,
    /// Game data. Restricted.
    Game = 10,
    /// Chat and mail. Restricted.
    Social = 11,
    /// Embedded computer traffic. Restricted.
    Computer = 12,
}

impl Major {
    #[must_use]
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Whether a raw major code requires an authenticated session.
#[must_use]
pub fn is_restricted(major: u8) -> bool {
    major >= RESTRICTED_MAJOR
}

/// Minor codes under [`Major::Auth`].
pub mod auth {
    pub const INIT: u8 = 1;
    pub const KEY_EXCHANGE: u8 = 2;
    pub const SHARE_KEY: u8 = 3;
    pub const AUTHENTICATED: u8 = 4;
    pub const SEND_SALT: u8 = 5;
    pub const KEY_REPLY: u8 = 6;
}

/// Writes a value to the little-endian wire encoding.
pub trait Encode {
    fn encode(&self, w: impl Write) -> anyhow::Result<()>;
}

/// Reads a value from the little-endian wire encoding. `r` advances
/// past the consumed bytes.
pub trait Decode<'a>: Sized {
    fn decode(r: &mut &'a [u8]) -> anyhow::Result<Self>;
}

impl Encode for u8 {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        Ok(w.write_all(&[*self])?)
    }
}

impl Decode<'_> for u8 {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        ensure!(!r.is_empty(), "unexpected end of input while decoding u8");
        let value = r[0];
        *r = &r[1..];
        Ok(value)
    }
}

impl Encode for u32 {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        Ok(w.write_all(&self.to_le_bytes())?)
    }
}

impl Decode<'_> for u32 {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        ensure!(
            r.len() >= 4,
            "unexpected end of input while decoding u32: {} bytes left",
            r.len()
        );
        let (head, rest) = r.split_at(4);
        *r = rest;
        Ok(u32::from_le_bytes(head.try_into()?))
    }
}

impl Encode for i64 {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        Ok(w.write_all(&self.to_le_bytes())?)
    }
}

impl Decode<'_> for i64 {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        ensure!(
            r.len() >= 8,
            "unexpected end of input while decoding i64: {} bytes left",
            r.len()
        );
        let (head, rest) = r.split_at(8);
        *r = rest;
        Ok(i64::from_le_bytes(head.try_into()?))
    }
}

impl Encode for f32 {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        Ok(w.write_all(&self.to_le_bytes())?)
    }
}

impl Decode<'_> for f32 {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        ensure!(
            r.len() >= 4,
            "unexpected end of input while decoding f32: {} bytes left",
            r.len()
        );
        let (head, rest) = r.split_at(4);
        *r = rest;
        Ok(f32::from_le_bytes(head.try_into()?))
    }
}

impl<const N: usize> Encode for [u8; N] {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        Ok(w.write_all(self)?)
    }
}

impl<const N: usize> Decode<'_> for [u8; N] {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        ensure!(
            r.len() >= N,
            "unexpected end of input while decoding [u8; {N}]: {} bytes left",
            r.len()
        );
        let (head, rest) = r.split_at(N);
        *r = rest;
        Ok(head.try_into()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalars_are_little_endian() {
        let mut buf = Vec::new();
        0x0403_0201_u32.encode(&mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);

        let mut r = &buf[..];
        assert_eq!(u32::decode(&mut r).unwrap(), 0x0403_0201);
        assert!(r.is_empty());
    }

    #[test]
    fn arrays_round_trip() {
        let salt = [9u8; 8];
        let mut buf = Vec::new();
        salt.encode(&mut buf).unwrap();
        let mut r = &buf[..];
        assert_eq!(<[u8; 8]>::decode(&mut r).unwrap(), salt);
    }

    #[test]
    fn short_input_is_rejected() {
        let mut r = &[1u8, 2][..];
        assert!(u32::decode(&mut r).is_err());
    }

    #[test]
    fn restricted_threshold() {
        assert!(!is_restricted(Major::Test.code()));
        assert!(!is_restricted(Major::Assets.code()));
        assert!(is_restricted(Major::Profile.code()));
        assert!(is_restricted(Major::Computer.code()));
        assert!(is_restricted(255));
    }
}
