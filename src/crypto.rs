//! # Cryptographic Infrastructure
//!
//! This module provides the cryptographic operations for Causeway:
//!
//! - **Signatures**: domain-separated Ed25519 signing and verification
//! - **Key Agreement**: X25519 exchange of ephemeral values, expanded to
//!   a symmetric session key with HKDF-SHA256
//! - **Packet Encryption**: ChaCha20-Poly1305 with a random nonce
//!   prepended to each ciphertext
//!
//! ## Session Model
//!
//! Each peer pair derives one symmetric key per handshake. Both sides
//! compute the same X25519 shared secret from (local ephemeral secret,
//! remote ephemeral public) and expand it under a fixed protocol label,
//! so the derivation is symmetric by construction.
//!
//! ## SECURITY
//!
//! Domain separation prevents a handshake signature from being replayed
//! in any other signed context. Decryption failures are indistinguishable
//! to the caller (one error variant) so padding/oracle distinctions never
//! leave this module.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::{PublicKey as KxPublic, StaticSecret};

use crate::identity::Keypair;

/// Domain separation prefix for handshake packet signatures.
pub const HANDSHAKE_SIGNATURE_DOMAIN: &[u8] = b"causeway-handshake-v1:";

/// HKDF info label for session key expansion.
const SESSION_KEY_LABEL: &[u8] = b"causeway-session-v1";

/// ChaCha20-Poly1305 nonce width.
const NONCE_LEN: usize = 12;

/// Poly1305 authentication tag width.
const TAG_LEN: usize = 16;

/// Error type for signature verification failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    /// Signature has invalid length (expected 64 bytes for Ed25519).
    InvalidLength,
    /// Cryptographic verification failed.
    VerificationFailed,
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureError::InvalidLength => write!(f, "signature has invalid length"),
            SignatureError::VerificationFailed => write!(f, "signature verification failed"),
        }
    }
}

impl std::error::Error for SignatureError {}

/// Error type for authenticated decryption failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SealError {
    /// Ciphertext shorter than nonce + tag.
    Truncated,
    /// Authentication or decryption failed.
    OpenFailed,
}

impl std::fmt::Display for SealError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SealError::Truncated => write!(f, "ciphertext is truncated"),
            SealError::OpenFailed => write!(f, "decryption failed"),
        }
    }
}

impl std::error::Error for SealError {}

/// Sign data with domain separation.
///
/// Prepends the domain prefix to the data before signing, preventing
/// cross-protocol signature replay.
pub fn sign_with_domain(keypair: &Keypair, domain: &[u8], data: &[u8]) -> Signature {
    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);
    keypair.sign(&prefixed)
}

/// Verify a signature with domain separation.
pub fn verify_with_domain(
    key: &VerifyingKey,
    domain: &[u8],
    data: &[u8],
    signature: &[u8],
) -> Result<(), SignatureError> {
    let signature =
        Signature::from_slice(signature).map_err(|_| SignatureError::InvalidLength)?;
    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);
    key.verify(&prefixed, &signature)
        .map_err(|_| SignatureError::VerificationFailed)
}

/// Symmetric session key negotiated by a handshake.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey([u8; 32]);

impl SessionKey {
    #[cfg(test)]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never log key material.
        write!(f, "SessionKey(..)")
    }
}

/// Derive the symmetric session key from the local ephemeral secret and
/// the peer's ephemeral public value.
pub fn derive_session_key(local: &StaticSecret, remote: &KxPublic) -> SessionKey {
    let shared = local.diffie_hellman(remote);
    let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
    let mut key = [0u8; 32];
    hk.expand(SESSION_KEY_LABEL, &mut key)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    SessionKey(key)
}

/// Encrypt `plaintext` under `key`. Output is `nonce || ciphertext`.
pub fn seal(key: &SessionKey, plaintext: &[u8]) -> Vec<u8> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key.0));
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .expect("ChaCha20-Poly1305 encryption is infallible for in-memory buffers");
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    out
}

/// Decrypt a `nonce || ciphertext` buffer produced by [`seal`].
pub fn open(key: &SessionKey, sealed: &[u8]) -> Result<Vec<u8>, SealError> {
    if sealed.len() < NONCE_LEN + TAG_LEN {
        return Err(SealError::Truncated);
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key.0));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| SealError::OpenFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_sides_derive_the_same_session_key() {
        let a = StaticSecret::random_from_rng(OsRng);
        let b = StaticSecret::random_from_rng(OsRng);
        let a_pub = KxPublic::from(&a);
        let b_pub = KxPublic::from(&b);

        let key_a = derive_session_key(&a, &b_pub);
        let key_b = derive_session_key(&b, &a_pub);
        assert_eq!(key_a, key_b);
    }

    #[test]
    fn seal_open_round_trip() {
        let secret = StaticSecret::random_from_rng(OsRng);
        let key = derive_session_key(&secret, &KxPublic::from(&StaticSecret::random_from_rng(OsRng)));
        let sealed = seal(&key, b"over the causeway");
        assert_eq!(open(&key, &sealed).unwrap(), b"over the causeway");
    }

    #[test]
    fn open_rejects_wrong_key() {
        let s = StaticSecret::random_from_rng(OsRng);
        let p = KxPublic::from(&StaticSecret::random_from_rng(OsRng));
        let key = derive_session_key(&s, &p);
        let other = derive_session_key(&StaticSecret::random_from_rng(OsRng), &p);
        let sealed = seal(&key, b"payload");
        assert_eq!(open(&other, &sealed), Err(SealError::OpenFailed));
    }

    #[test]
    fn open_rejects_truncated_input() {
        let key = SessionKey::from_bytes([7u8; 32]);
        assert_eq!(open(&key, &[0u8; 10]), Err(SealError::Truncated));
    }

    #[test]
    fn signature_domain_separation() {
        let kp = Keypair::generate();
        let sig = sign_with_domain(&kp, HANDSHAKE_SIGNATURE_DOMAIN, b"data");
        assert!(verify_with_domain(
            &kp.verifying_key(),
            HANDSHAKE_SIGNATURE_DOMAIN,
            b"data",
            &sig.to_bytes()
        )
        .is_ok());
        // Same bytes under a different domain must not verify.
        assert_eq!(
            verify_with_domain(&kp.verifying_key(), b"other-domain:", b"data", &sig.to_bytes()),
            Err(SignatureError::VerificationFailed)
        );
    }
}
