//! Handshake message bodies.
//!
//! Five messages establish a session; all of them travel under
//! [`Major::Auth`](crate::Major::Auth) with the minors in
//! [`auth`](crate::auth). Only the key reply carries a trailer (the
//! server signature); everything earlier is necessarily
//! unauthenticated.

use std::io::Write;

use anyhow::ensure;
use lattice_store::{Timestamp, Transform};

use crate::crypto::{self, SessionHasher};
use crate::{
    Decode, Encode, EntityId, ALEA_LEN, LOGIN_LEN, MAC_LEN, NONCE2_LEN, NONCE_LEN,
    PUBLIC_KEY_LEN, SALT_LEN, SESSION_KEY_LEN,
};

/// Client → server: requests a salt for the named account.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct AuthInit {
    pub login: [u8; LOGIN_LEN],
}

impl AuthInit {
    /// Builds the packet from a login string, truncated to the field
    /// width and zero-padded.
    #[must_use]
    pub fn from_login(login: &str) -> Self {
        let mut field = [0u8; LOGIN_LEN];
        let bytes = login.as_bytes();
        let n = bytes.len().min(LOGIN_LEN - 1);
        field[..n].copy_from_slice(&bytes[..n]);
        Self { login: field }
    }

    /// The login as a string, stopping at the first NUL.
    #[must_use]
    pub fn login_str(&self) -> &str {
        let end = self
            .login
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(LOGIN_LEN);
        std::str::from_utf8(&self.login[..end]).unwrap_or("")
    }
}

impl Encode for AuthInit {
    fn encode(&self, w: impl Write) -> anyhow::Result<()> {
        self.login.encode(w)
    }
}

impl Decode<'_> for AuthInit {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            login: Decode::decode(r)?,
        })
    }
}

/// Server → client: the salt stored for the account.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct AuthSendSalt {
    pub salt: [u8; SALT_LEN],
}

impl Encode for AuthSendSalt {
    fn encode(&self, w: impl Write) -> anyhow::Result<()> {
        self.salt.encode(w)
    }
}

impl Decode<'_> for AuthSendSalt {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            salt: Decode::decode(r)?,
        })
    }
}

/// Client → server: random session material, authenticated under the
/// password-derived key.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct AuthKeyExchange {
    pub salt: [u8; SALT_LEN],
    /// Random number the session key is derived from.
    pub alea: [u8; ALEA_LEN],
    /// Nonce for the session-key derivation; also seeds the session
    /// MAC counter.
    pub nonce2: [u8; NONCE2_LEN],
    /// Nonce for this packet's own MAC.
    pub nonce: [u8; NONCE_LEN],
    pub mac: [u8; MAC_LEN],
}

impl AuthKeyExchange {
    /// Builds the packet from fresh randomness and the password key,
    /// MACing `salt || alea || nonce2` under it.
    #[must_use]
    pub fn new(salt: [u8; SALT_LEN], password_key: &[u8; SESSION_KEY_LEN]) -> Self {
        let alea: [u8; ALEA_LEN] = rand::random();
        let nonce2: [u8; NONCE2_LEN] = rand::random();
        let nonce: [u8; NONCE_LEN] = rand::random();
        let mut packet = Self {
            salt,
            alea,
            nonce2,
            nonce,
            mac: [0; MAC_LEN],
        };
        packet.mac = crypto::mac64(password_key, &nonce, &packet.signed_region());
        packet
    }

    /// The bytes the key-exchange MAC covers.
    #[must_use]
    pub fn signed_region(&self) -> [u8; SALT_LEN + ALEA_LEN + NONCE2_LEN] {
        let mut region = [0u8; SALT_LEN + ALEA_LEN + NONCE2_LEN];
        region[..SALT_LEN].copy_from_slice(&self.salt);
        region[SALT_LEN..SALT_LEN + ALEA_LEN].copy_from_slice(&self.alea);
        region[SALT_LEN + ALEA_LEN..].copy_from_slice(&self.nonce2);
        region
    }

    /// Server-side check of the MAC under its own derived key.
    #[must_use]
    pub fn verify(&self, password_key: &[u8; SESSION_KEY_LEN]) -> bool {
        self.mac == crypto::mac64(password_key, &self.nonce, &self.signed_region())
    }

    /// Derives the session hasher both ends will share.
    #[must_use]
    pub fn build_hasher(&self, password_key: &[u8; SESSION_KEY_LEN]) -> SessionHasher {
        let session_key = crypto::derive_session_key(password_key, &self.alea, &self.nonce2);
        SessionHasher::new(session_key, &self.nonce2)
    }
}

impl Encode for AuthKeyExchange {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        self.salt.encode(&mut w)?;
        self.alea.encode(&mut w)?;
        self.nonce2.encode(&mut w)?;
        self.nonce.encode(&mut w)?;
        self.mac.encode(&mut w)
    }
}

impl Decode<'_> for AuthKeyExchange {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            salt: Decode::decode(r)?,
            alea: Decode::decode(r)?,
            nonce2: Decode::decode(r)?,
            nonce: Decode::decode(r)?,
            mac: Decode::decode(r)?,
        })
    }
}

/// Server → client: the server's verification key and the entity id
/// now bound to this session. Signed with the server signature key.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct AuthKeyReply {
    pub pubkey: [u8; PUBLIC_KEY_LEN],
    pub entity: EntityId,
}

impl Encode for AuthKeyReply {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        self.pubkey.encode(&mut w)?;
        self.entity.encode(&mut w)
    }
}

impl Decode<'_> for AuthKeyReply {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            pubkey: Decode::decode(r)?,
            entity: Decode::decode(r)?,
        })
    }
}

impl Encode for Transform {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        for c in [
            self.translation.x,
            self.translation.y,
            self.translation.z,
            self.orientation.x,
            self.orientation.y,
            self.orientation.z,
            self.orientation.w,
            self.scale,
        ] {
            c.encode(&mut w)?;
        }
        Ok(())
    }
}

impl Decode<'_> for Transform {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        let mut c = [0f32; 8];
        for slot in &mut c {
            *slot = f32::decode(r)?;
        }
        Ok(Self {
            translation: [c[0], c[1], c[2]].into(),
            orientation: glam::Quat::from_xyzw(c[3], c[4], c[5], c[6]),
            scale: c[7],
        })
    }
}

/// Server → client: one commit's worth of transform changes, as
/// pulled from the store by the egress system.
///
/// The per-frame size cap in the egress path keeps one update inside
/// a single wire message; a commit touching more entities than fits
/// is split across several updates with the same tick.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct TransformUpdate {
    /// Commit timestamp the changes were published under.
    pub tick: Timestamp,
    pub updates: Vec<(EntityId, Transform)>,
    pub removals: Vec<EntityId>,
}

impl Encode for TransformUpdate {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        self.tick.encode(&mut w)?;
        (self.updates.len() as u32).encode(&mut w)?;
        for (entity, transform) in &self.updates {
            entity.encode(&mut w)?;
            transform.encode(&mut w)?;
        }
        (self.removals.len() as u32).encode(&mut w)?;
        for entity in &self.removals {
            entity.encode(&mut w)?;
        }
        Ok(())
    }
}

impl Decode<'_> for TransformUpdate {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        let tick = Timestamp::decode(r)?;

        let update_count = u32::decode(r)? as usize;
        ensure!(
            update_count <= r.len() / 36,
            "transform update claims {update_count} entries with {} bytes left",
            r.len()
        );
        let mut updates = Vec::with_capacity(update_count);
        for _ in 0..update_count {
            updates.push((EntityId::decode(r)?, Transform::decode(r)?));
        }

        let removal_count = u32::decode(r)? as usize;
        ensure!(
            removal_count <= r.len() / 4,
            "transform update claims {removal_count} removals with {} bytes left",
            r.len()
        );
        let mut removals = Vec::with_capacity(removal_count);
        for _ in 0..removal_count {
            removals.push(EntityId::decode(r)?);
        }

        Ok(Self {
            tick,
            updates,
            removals,
        })
    }
}

/// Decodes a body, requiring that every byte is consumed.
pub fn decode_body<'a, P: Decode<'a>>(mut body: &'a [u8]) -> anyhow::Result<P> {
    let packet = P::decode(&mut body)?;
    ensure!(
        body.is_empty(),
        "trailing garbage after packet body: {} bytes",
        body.len()
    );
    Ok(packet)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::derive_password_key;

    fn round_trip<P>(packet: &P) -> P
    where
        P: for<'a> Decode<'a> + Encode,
    {
        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();
        decode_body(&buf).unwrap()
    }

    #[test]
    fn auth_init_round_trip() {
        let packet = AuthInit::from_login("my_login");
        assert_eq!(round_trip(&packet), packet);
        assert_eq!(packet.login_str(), "my_login");
    }

    #[test]
    fn login_field_truncates_and_pads() {
        let packet = AuthInit::from_login("a_very_long_login_name_indeed");
        assert_eq!(packet.login_str().len(), LOGIN_LEN - 1);
        assert_eq!(packet.login[LOGIN_LEN - 1], 0);
    }

    #[test]
    fn key_exchange_round_trip_and_verify() {
        let salt = *b"abcdefgh";
        let key = derive_password_key(b"secret password", &salt);
        let packet = AuthKeyExchange::new(salt, &key);

        let decoded = round_trip(&packet);
        assert!(decoded.verify(&key));

        let wrong = derive_password_key(b"bad password", &salt);
        assert!(!decoded.verify(&wrong));
    }

    #[test]
    fn key_exchange_hashers_agree() {
        let salt = *b"abcdefgh";
        let key = derive_password_key(b"secret password", &salt);
        let packet = AuthKeyExchange::new(salt, &key);

        let client = packet.build_hasher(&key);
        let server = packet.build_hasher(&key);
        let tag = client.sign(b"hello");
        assert!(server.verify(&tag, b"hello"));
    }

    #[test]
    fn key_reply_round_trip() {
        let packet = AuthKeyReply {
            pubkey: [7; PUBLIC_KEY_LEN],
            entity: 42,
        };
        let decoded = round_trip(&packet);
        assert_eq!(decoded, packet);
    }

    #[test]
    fn transform_update_round_trip() {
        let update = TransformUpdate {
            tick: 1_666_666_600,
            updates: vec![
                (3, Transform::from_translation([1.0, 2.0, 3.0].into())),
                (9, Transform::default()),
            ],
            removals: vec![4, 17],
        };
        assert_eq!(round_trip(&update), update);
    }

    #[test]
    fn transform_update_rejects_absurd_counts() {
        let mut buf = Vec::new();
        0i64.encode(&mut buf).unwrap();
        u32::MAX.encode(&mut buf).unwrap();
        assert!(decode_body::<TransformUpdate>(&buf).is_err());
    }

    #[test]
    fn trailing_garbage_is_rejected() {
        let mut buf = Vec::new();
        AuthSendSalt { salt: [1; 8] }.encode(&mut buf).unwrap();
        buf.push(0xFF);
        assert!(decode_body::<AuthSendSalt>(&buf).is_err());
    }
}
