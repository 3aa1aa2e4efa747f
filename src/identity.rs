//! # Identity and Ephemeral Key Material
//!
//! This module defines the identity types used throughout Causeway:
//!
//! - [`Keypair`]: long-term Ed25519 signing keypair for the local node
//! - [`Identity`]: 32-byte blake3 digest of a signing public key, the
//!   canonical lookup key for the node registry
//! - [`KxCache`]: short-lived cache of in-flight X25519 key-exchange
//!   keypairs, keyed by the peer the handshake targets
//!
//! ## Identity Model
//!
//! A node is identified by the digest of its signing key, not the key
//! itself. The digest is computed once and cached; the signing key only
//! leaves the node inside handshake packets, where it authenticates a
//! freshly generated key-exchange value.
//!
//! ## Ephemeral Key Lifecycle
//!
//! Key-exchange secrets are single-purpose: one is created when a
//! handshake is initiated (or when a simultaneous inbound request is
//! observed with no entry yet) and removed unconditionally a fixed delay
//! after creation, whether or not the handshake completed. A response
//! arriving after removal can no longer be processed.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::RwLock;
use x25519_dalek::{PublicKey as KxPublic, StaticSecret};

/// Width of signing and key-exchange public values on the wire.
pub const KEY_LEN: usize = 32;

/// How long a cached key-exchange keypair survives after creation.
/// Removal is time-based, not completion-based: a handshake response
/// arriving later than this is dropped.
pub const EPHEMERAL_TTL: Duration = Duration::from_secs(30);

/// Long-term Ed25519 signing keypair with its cached identity digest.
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
    identity: Identity,
}

impl Keypair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let identity = Identity::of(&signing_key.verifying_key());
        Self {
            signing_key,
            identity,
        }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        let identity = Identity::of(&signing_key.verifying_key());
        Self {
            signing_key,
            identity,
        }
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.signing_key
            .verifying_key()
            .verify(message, signature)
            .is_ok()
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("identity", &self.identity.to_hex())
            .finish_non_exhaustive()
    }
}

/// Canonical node identifier: `blake3(signing public key)`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identity([u8; 32]);

impl Identity {
    /// Derive the identity of a signing public key.
    pub fn of(key: &VerifyingKey) -> Self {
        Self(*blake3::hash(key.as_bytes()).as_bytes())
    }

    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // First 8 bytes are plenty for log correlation.
        write!(f, "Identity({}..)", &hex::encode(self.0)[..16])
    }
}

/// Cache of in-flight key-exchange keypairs, keyed by target peer.
///
/// Insertion is idempotent so that two nodes requesting a handshake from
/// each other at the same time converge on a single keypair per side.
#[derive(Default)]
pub struct KxCache {
    pairs: RwLock<HashMap<Identity, StaticSecret>>,
}

impl KxCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the public value for the pending exchange with `peer`,
    /// generating and caching a fresh secret if none is in flight.
    /// The boolean is true when a new entry was created (the caller is
    /// then responsible for scheduling its removal).
    pub async fn ensure(&self, peer: Identity) -> (KxPublic, bool) {
        let mut pairs = self.pairs.write().await;
        if let Some(secret) = pairs.get(&peer) {
            return (KxPublic::from(secret), false);
        }
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = KxPublic::from(&secret);
        pairs.insert(peer, secret);
        (public, true)
    }

    /// The pending secret for `peer`, if the handshake is still in flight.
    pub async fn secret_for(&self, peer: &Identity) -> Option<StaticSecret> {
        self.pairs.read().await.get(peer).cloned()
    }

    pub async fn remove(&self, peer: &Identity) {
        self.pairs.write().await.remove(peer);
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.pairs.read().await.len()
    }
}
