//! Control-plane authentication and the encrypted session framing.
//!
//! The scheme is a pre-shared-password handshake followed by a framed
//! ChaCha20-Poly1305 stream:
//!
//! 1. `key = PBKDF2-HMAC-SHA256(password, "VIIPER-Key-v1", 100000, 32)`.
//! 2. Client opens with `"eVI1\x00" | clientNonce[32] | clientAuth[32]`,
//!    `clientAuth = HMAC-SHA256(key, "VIIPER-Auth-v1" | clientNonce)`.
//! 3. Server verifies in constant time and answers
//!    `"OK\x00" | serverNonce[32]` (or a plaintext problem body written by
//!    the caller on mismatch).
//! 4. Both sides derive
//!    `sessionKey = SHA-256(key | serverNonce | clientNonce | "VIIPER-Session-v1")`
//!    and switch to framed records, one per logical write.

mod channel;
mod handshake;

pub use channel::{open_frame, seal_frame, ChannelError, SecureReader, SecureWriter};
pub use handshake::{client_handshake, server_handshake, HandshakeError, CLIENT_HELLO_LEN};

use ring::{digest, hmac, pbkdf2, rand, rand::SecureRandom};
use std::num::NonZeroU32;
use thiserror::Error;

/// Five-byte literal opening an authenticated session.
pub const MAGIC: &[u8; 5] = b"eVI1\x00";
/// Server acknowledgement preceding its nonce.
pub const HANDSHAKE_OK: &[u8; 3] = b"OK\x00";
pub const NONCE_LEN: usize = 32;
pub const KEY_LEN: usize = 32;
pub const AUTH_PROOF_LEN: usize = 32;

const KEY_SALT: &[u8] = b"VIIPER-Key-v1";
const AUTH_LABEL: &[u8] = b"VIIPER-Auth-v1";
const SESSION_LABEL: &[u8] = b"VIIPER-Session-v1";
const PBKDF2_ITERATIONS: u32 = 100_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("password must not be empty")]
    EmptyPassword,
}

/// The long-term key derived from the shared password.
#[derive(Clone)]
pub struct AuthKey([u8; KEY_LEN]);

impl AuthKey {
    pub fn derive(password: &str) -> Result<AuthKey, AuthError> {
        if password.is_empty() {
            return Err(AuthError::EmptyPassword);
        }
        let mut key = [0u8; KEY_LEN];
        pbkdf2::derive(
            pbkdf2::PBKDF2_HMAC_SHA256,
            NonZeroU32::new(PBKDF2_ITERATIONS).expect("nonzero iterations"),
            KEY_SALT,
            password.as_bytes(),
            &mut key,
        );
        Ok(AuthKey(key))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for AuthKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("AuthKey").field(&"<redacted>").finish()
    }
}

impl PartialEq for AuthKey {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

/// The per-connection session key both framing directions encrypt under.
#[derive(Clone)]
pub struct SessionKey([u8; KEY_LEN]);

impl SessionKey {
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    #[cfg(test)]
    pub(crate) fn from_bytes(bytes: [u8; KEY_LEN]) -> SessionKey {
        SessionKey(bytes)
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SessionKey").field(&"<redacted>").finish()
    }
}

/// `HMAC-SHA256(key, "VIIPER-Auth-v1" | clientNonce)`.
pub fn client_auth_proof(key: &AuthKey, client_nonce: &[u8; NONCE_LEN]) -> [u8; AUTH_PROOF_LEN] {
    let mac_key = hmac::Key::new(hmac::HMAC_SHA256, &key.0);
    let mut message = Vec::with_capacity(AUTH_LABEL.len() + NONCE_LEN);
    message.extend_from_slice(AUTH_LABEL);
    message.extend_from_slice(client_nonce);
    let tag = hmac::sign(&mac_key, &message);
    let mut proof = [0u8; AUTH_PROOF_LEN];
    proof.copy_from_slice(tag.as_ref());
    proof
}

/// Constant-time proof check.
pub fn verify_client_auth(key: &AuthKey, client_nonce: &[u8; NONCE_LEN], proof: &[u8]) -> bool {
    let mac_key = hmac::Key::new(hmac::HMAC_SHA256, &key.0);
    let mut message = Vec::with_capacity(AUTH_LABEL.len() + NONCE_LEN);
    message.extend_from_slice(AUTH_LABEL);
    message.extend_from_slice(client_nonce);
    hmac::verify(&mac_key, &message, proof).is_ok()
}

/// Derive the session key from the long-term key and both nonces.
pub fn session_key(
    key: &AuthKey,
    server_nonce: &[u8; NONCE_LEN],
    client_nonce: &[u8; NONCE_LEN],
) -> SessionKey {
    let mut message = Vec::with_capacity(KEY_LEN + NONCE_LEN * 2 + SESSION_LABEL.len());
    message.extend_from_slice(&key.0);
    message.extend_from_slice(server_nonce);
    message.extend_from_slice(client_nonce);
    message.extend_from_slice(SESSION_LABEL);
    let hash = digest::digest(&digest::SHA256, &message);
    let mut out = [0u8; KEY_LEN];
    out.copy_from_slice(hash.as_ref());
    SessionKey(out)
}

pub(crate) fn random_nonce() -> std::io::Result<[u8; NONCE_LEN]> {
    let rng = rand::SystemRandom::new();
    let mut nonce = [0u8; NONCE_LEN];
    rng.fill(&mut nonce)
        .map_err(|_| std::io::Error::other("system rng failure"))?;
    Ok(nonce)
}
