//! Key derivation, per-session MACs and the server signature.
//!
//! All tags are computed over the little-endian wire bytes. The
//! session MAC is an AES-keyed MAC whose nonce is a monotonic 128-bit
//! counter kept in lockstep by both ends: it is incremented *before*
//! every sign and every verify, and a failed verify rolls it back by
//! one so that a duplicated frame does not desynchronize the session.

use aes::Aes128;
use cmac::{Cmac, Mac};
use hmac::Hmac;
use parking_lot::Mutex;
use sha2::Sha256;

use crate::{MAC_LEN, NONCE2_LEN, NONCE_LEN, PUBLIC_KEY_LEN, SALT_LEN, SESSION_KEY_LEN, SIG_LEN};

/// PBKDF2 iteration count for the password key.
pub const PBKDF_ROUNDS: u32 = 1024;

/// Derives the 16-byte password key shared by client and server:
/// `PBKDF2-HMAC-SHA256(password, salt, 1024)`.
#[must_use]
pub fn derive_password_key(password: &[u8], salt: &[u8; SALT_LEN]) -> [u8; SESSION_KEY_LEN] {
    let mut key = [0u8; SESSION_KEY_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(password, salt, PBKDF_ROUNDS, &mut key);
    key
}

fn keyed_mac(key: &[u8; SESSION_KEY_LEN], nonce: &[u8], message: &[u8]) -> [u8; 16] {
    let mut mac = <Cmac<Aes128> as Mac>::new_from_slice(key)
        .expect("AES-128 CMAC accepts a 16-byte key");
    mac.update(nonce);
    mac.update(message);
    mac.finalize().into_bytes().into()
}

/// 8-byte AES-keyed MAC with an 8-byte nonce, as used inside the key
/// exchange.
#[must_use]
pub fn mac64(
    key: &[u8; SESSION_KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    message: &[u8],
) -> [u8; MAC_LEN] {
    let tag = keyed_mac(key, nonce, message);
    tag[..MAC_LEN].try_into().expect("tag is longer than 8 bytes")
}

/// 16-byte AES-keyed MAC with a 16-byte nonce, as used to derive the
/// session key.
#[must_use]
pub fn mac128(
    key: &[u8; SESSION_KEY_LEN],
    nonce: &[u8; NONCE2_LEN],
    message: &[u8],
) -> [u8; SESSION_KEY_LEN] {
    keyed_mac(key, nonce, message)
}

/// Derives the per-session MAC key from the client's random `alea`
/// under the password key; both sides compute the identical value.
#[must_use]
pub fn derive_session_key(
    password_key: &[u8; SESSION_KEY_LEN],
    alea: &[u8; 16],
    nonce2: &[u8; NONCE2_LEN],
) -> [u8; SESSION_KEY_LEN] {
    mac128(password_key, nonce2, alea)
}

/// The stateful per-session MAC: one shared key, one shared counter.
pub struct SessionHasher {
    key: [u8; SESSION_KEY_LEN],
    counter: Mutex<u128>,
}

impl SessionHasher {
    /// Builds the hasher from the session key and the handshake's
    /// `nonce2`, which seeds the counter on both sides.
    #[must_use]
    pub fn new(key: [u8; SESSION_KEY_LEN], nonce2: &[u8; NONCE2_LEN]) -> Self {
        Self {
            key,
            counter: Mutex::new(u128::from_le_bytes(*nonce2)),
        }
    }

    /// Computes the tag for an outgoing frame, advancing the counter.
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> [u8; MAC_LEN] {
        let mut counter = self.counter.lock();
        *counter = counter.wrapping_add(1);
        let tag = keyed_mac(&self.key, &counter.to_le_bytes(), message);
        tag[..MAC_LEN].try_into().expect("tag is longer than 8 bytes")
    }

    /// Verifies the tag of an incoming frame, advancing the counter.
    /// On failure the counter rolls back by one, so a duplicate of
    /// the last frame is tolerated without desynchronizing.
    #[must_use]
    pub fn verify(&self, tag: &[u8; MAC_LEN], message: &[u8]) -> bool {
        let mut counter = self.counter.lock();
        *counter = counter.wrapping_add(1);
        let mut mac = <Cmac<Aes128> as Mac>::new_from_slice(&self.key)
            .expect("AES-128 CMAC accepts a 16-byte key");
        mac.update(&counter.to_le_bytes());
        mac.update(message);
        if mac.verify_truncated_left(tag).is_ok() {
            return true;
        }
        *counter = counter.wrapping_sub(1);
        false
    }
}

/// Signs server-to-client frames with a deterministic 24-byte tag.
///
/// The verification key is distributed to clients out of band; a
/// client refuses any server whose replies do not verify against its
/// preconfigured key.
pub struct SignatureSigner {
    key: [u8; PUBLIC_KEY_LEN],
}

impl SignatureSigner {
    /// Generates a fresh signature key.
    #[must_use]
    pub fn generate() -> Self {
        Self {
            key: rand::random(),
        }
    }

    #[must_use]
    pub fn from_key(key: [u8; PUBLIC_KEY_LEN]) -> Self {
        Self { key }
    }

    /// The 32-byte verification key to preconfigure on clients; sent
    /// in the key reply as well.
    #[must_use]
    pub fn verifying_key(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.key
    }

    #[must_use]
    pub fn sign(&self, message: &[u8]) -> [u8; SIG_LEN] {
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&self.key)
            .expect("HMAC accepts any key length");
        mac.update(message);
        let tag = mac.finalize().into_bytes();
        tag[..SIG_LEN].try_into().expect("SHA-256 output is longer")
    }
}

/// Verifies server signatures against the preconfigured key.
#[derive(Clone)]
pub struct SignatureVerifier {
    key: [u8; PUBLIC_KEY_LEN],
}

impl SignatureVerifier {
    #[must_use]
    pub fn new(key: [u8; PUBLIC_KEY_LEN]) -> Self {
        Self { key }
    }

    #[must_use]
    pub fn verify(&self, sig: &[u8; SIG_LEN], message: &[u8]) -> bool {
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&self.key)
            .expect("HMAC accepts any key length");
        mac.update(message);
        mac.verify_truncated_left(sig).is_ok()
    }
}
