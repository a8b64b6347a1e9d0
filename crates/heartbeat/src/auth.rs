//! Heartbeat packet authentication.
//!
//! Two keyed constructions are supported:
//!
//! - **Keyed MD5**: the shared key is split in two halves used as a
//!   "username" and "password". `md5hex(password || username)` gives an
//!   intermediate hex string, and the final hash is
//!   `md5hex(intermediate || payload)`.
//! - **HMAC-SHA256**: `hex(HMAC-SHA256(key, payload))`.
//!
//! An empty key turns authentication off: every packet verifies. This is
//! fail-open and is logged loudly at construction.
//!
//! Hash comparison is a plain string comparison and is not constant-time.

use crate::types::AuthMethod;
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use sha2::Sha256;
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

/// Computes and verifies heartbeat hashes with a shared key.
#[derive(Clone)]
pub struct PacketAuthenticator {
    key: Vec<u8>,
    method: AuthMethod,
}

impl std::fmt::Debug for PacketAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketAuthenticator")
            .field("method", &self.method)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl PacketAuthenticator {
    /// Create an authenticator for the given key and method.
    pub fn new(key: impl AsRef<[u8]>, method: AuthMethod) -> Self {
        let key = key.as_ref().to_vec();
        if key.is_empty() {
            warn!("heartbeat authentication key is empty, all heartbeat packets will be accepted");
        }
        Self { key, method }
    }

    /// Whether a key is configured.
    pub fn is_enabled(&self) -> bool {
        !self.key.is_empty()
    }

    pub fn method(&self) -> AuthMethod {
        self.method
    }

    /// Hash `bytes` with the shared key, as lowercase hex.
    ///
    /// Returns an empty string when no key is configured.
    pub fn compute(&self, bytes: &[u8]) -> String {
        if !self.is_enabled() {
            return String::new();
        }

        match self.method {
            AuthMethod::Md5 => self.keyed_md5(bytes),
            AuthMethod::HmacSha256 => self.hmac_sha256(bytes),
        }
    }

    /// Check `hash` against the hash of `bytes`.
    ///
    /// Always true when no key is configured.
    pub fn verify(&self, bytes: &[u8], hash: &str) -> bool {
        if !self.is_enabled() {
            return true;
        }

        let expected = self.compute(bytes);
        if expected.is_empty() {
            warn!("failed to calculate heartbeat hash from a received packet");
            return false;
        }
        expected == hash
    }

    fn keyed_md5(&self, bytes: &[u8]) -> String {
        // first half of the key is the username, the rest the password
        let (username, password) = self.key.split_at(self.key.len() / 2);

        let intermediate = md5_hex(&[password, username]);
        md5_hex(&[intermediate.as_bytes(), bytes])
    }

    fn hmac_sha256(&self, bytes: &[u8]) -> String {
        match HmacSha256::new_from_slice(&self.key) {
            Ok(mut mac) => {
                mac.update(bytes);
                hex::encode(mac.finalize().into_bytes())
            }
            Err(e) => {
                warn!(error = %e, "failed to initialise HMAC-SHA256");
                String::new()
            }
        }
    }
}

fn md5_hex(parts: &[&[u8]]) -> String {
    let mut hasher = Md5::new();
    for part in parts {
        hasher.update(part);
    }
    hex::encode(hasher.finalize())
}
