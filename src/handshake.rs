//! # Handshake Protocol
//!
//! Mutually authenticates two nodes and agrees a symmetric session key.
//! A long-term Ed25519 identity signs a freshly generated, single-use
//! X25519 key-exchange value; the two ephemeral values are combined into
//! the session key.
//!
//! ## Packet Layout
//!
//! Request and response share one 129-byte structure, distinguished by
//! the leading kind tag (which doubles as the dispatcher's wire tag):
//!
//! ```text
//! byte 0        : kind (0 = request, 1 = response)
//! bytes 1..33   : sender's ephemeral X25519 public value
//! bytes 33..65  : sender's Ed25519 signing public key
//! bytes 65..129 : signature over bytes 0..65
//! ```
//!
//! ## Session Data
//!
//! Completing the key exchange is not the end of the handshake: the
//! initiator immediately issues an in-band query over the fresh session
//! proposing a session TTL. Both sides clamp the value to
//! [`MAX_SESSION_TTL`](crate::registry::MAX_SESSION_TTL) and only then
//! is the stored completion callback fired.

use anyhow::{Context, Result};
use ed25519_dalek::VerifyingKey;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};
use x25519_dalek::PublicKey as KxPublic;

use crate::crypto::{
    derive_session_key, sign_with_domain, verify_with_domain, HANDSHAKE_SIGNATURE_DOMAIN,
};
use crate::identity::{Identity, Keypair, EPHEMERAL_TTL, KEY_LEN};
use crate::messages::{Header, MsgType};
use crate::registry::{HandshakeCallback, Node, NodeRef, MAX_SESSION_TTL};
use crate::server::{OverlayServer, TAG_HANDSHAKE_REQUEST, TAG_HANDSHAKE_RESPONSE};

/// Ed25519 signature width.
const SIGNATURE_LEN: usize = 64;

/// Fixed length of a handshake packet.
pub const HANDSHAKE_LEN: usize = 1 + 2 * KEY_LEN + SIGNATURE_LEN;

/// Session TTL the initiator proposes during session-data negotiation.
pub const PROPOSED_SESSION_TTL: Duration = Duration::from_secs(600);

/// Error type for handshake packet validation failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeError {
    /// Shorter than the fixed packet length.
    Truncated,
    /// Embedded signing key is not a valid Ed25519 point.
    InvalidKey,
    /// Embedded signing key does not match the expected signer.
    UnexpectedSigner,
    /// Signature does not verify over the signed prefix.
    BadSignature,
}

impl std::fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandshakeError::Truncated => write!(f, "handshake packet is truncated"),
            HandshakeError::InvalidKey => write!(f, "handshake signing key is invalid"),
            HandshakeError::UnexpectedSigner => write!(f, "handshake signed by unexpected key"),
            HandshakeError::BadSignature => write!(f, "handshake signature is invalid"),
        }
    }
}

impl std::error::Error for HandshakeError {}

/// Build a signed handshake packet of the given kind carrying our
/// ephemeral public value.
pub fn build_handshake(kind: u8, ephemeral: &KxPublic, keypair: &Keypair) -> Vec<u8> {
    let mut pkt = Vec::with_capacity(HANDSHAKE_LEN);
    pkt.push(kind);
    pkt.extend_from_slice(ephemeral.as_bytes());
    pkt.extend_from_slice(&keypair.public_key_bytes());
    let sig = sign_with_domain(keypair, HANDSHAKE_SIGNATURE_DOMAIN, &pkt);
    pkt.extend_from_slice(&sig.to_bytes());
    pkt
}

/// Validate a handshake packet.
///
/// When `expected` is given, the embedded signing key must match it.
/// On success returns the sender's signing key and ephemeral value; no
/// state is touched on failure.
pub fn validate_handshake(
    pkt: &[u8],
    expected: Option<&VerifyingKey>,
) -> Result<(VerifyingKey, KxPublic), HandshakeError> {
    if pkt.len() < HANDSHAKE_LEN {
        return Err(HandshakeError::Truncated);
    }
    let signed = &pkt[..1 + 2 * KEY_LEN];
    let eph_bytes: [u8; 32] = pkt[1..1 + KEY_LEN].try_into().unwrap();
    let sign_bytes: [u8; 32] = pkt[1 + KEY_LEN..1 + 2 * KEY_LEN].try_into().unwrap();

    let sign_pub =
        VerifyingKey::from_bytes(&sign_bytes).map_err(|_| HandshakeError::InvalidKey)?;
    if let Some(expected) = expected {
        if expected.as_bytes() != &sign_bytes {
            return Err(HandshakeError::UnexpectedSigner);
        }
    }
    verify_with_domain(
        &sign_pub,
        HANDSHAKE_SIGNATURE_DOMAIN,
        signed,
        &pkt[1 + 2 * KEY_LEN..HANDSHAKE_LEN],
    )
    .map_err(|_| HandshakeError::BadSignature)?;

    Ok((sign_pub, KxPublic::from(eph_bytes)))
}

impl OverlayServer {
    /// Initiate a handshake with `node`, optionally storing a one-shot
    /// completion callback on its record.
    ///
    /// The ephemeral keypair is cached per target identity, so a second
    /// request to the same peer while one is outstanding reuses it.
    /// Transmission failure is reported to the caller; this layer never
    /// retries.
    pub async fn send_handshake_request(
        self: &Arc<Self>,
        node: &NodeRef,
        callback: Option<HandshakeCallback>,
    ) -> Result<()> {
        let (peer, to_addr) = {
            let mut n = node.write().await;
            if let Some(cb) = callback {
                n.hs_callback = Some(cb);
            }
            (n.identity, n.to_addr)
        };

        let (ephemeral, created) = self.kx_cache.ensure(peer).await;
        if created {
            self.schedule_kx_removal(peer);
        }

        let pkt = {
            let keypair = self.keypair.read().await;
            build_handshake(TAG_HANDSHAKE_REQUEST, &ephemeral, &keypair)
        };
        debug!(%peer, %to_addr, "sending handshake request");
        self.socket
            .send_to(&pkt, to_addr)
            .await
            .context("handshake request transmission failed")?;
        Ok(())
    }

    /// Handle an inbound handshake request. Unknown peers may initiate,
    /// so validation runs with no expected-signer constraint.
    pub(crate) async fn handle_handshake_request(self: &Arc<Self>, pkt: &[u8], addr: SocketAddr) {
        let (sign_pub, their_ephemeral) = match validate_handshake(pkt, None) {
            Ok(parts) => parts,
            Err(err) => {
                info!(%addr, %err, "invalid handshake request");
                return;
            }
        };
        let peer = Identity::of(&sign_pub);

        // Reuse a pending keypair if both sides requested simultaneously.
        let (our_ephemeral, created) = self.kx_cache.ensure(peer).await;
        if created {
            self.schedule_kx_removal(peer);
        }
        let secret = match self.kx_cache.secret_for(&peer).await {
            Some(secret) => secret,
            None => {
                // Entry expired between ensure and here; treat as lost.
                info!(%peer, "ephemeral keypair vanished during handshake");
                return;
            }
        };
        let session_key = derive_session_key(&secret, &their_ephemeral);

        let existing = match self.nodes.by_addr(&addr).await {
            Some(node) => Some(node),
            None => self.nodes.by_identity(&peer).await,
        };
        match existing {
            Some(node) => {
                let mut n = node.write().await;
                if n.sign_pub != sign_pub {
                    error!(%addr, %peer, "handshake signing key conflicts with known node");
                    return;
                }
                n.session_key = Some(session_key);
                n.from_addr = Some(addr);
                n.refresh();
                drop(n);
                self.nodes.index_addr(addr, node).await;
            }
            None => {
                let mut node = Node::new(sign_pub, addr).with_from_addr(addr);
                node.session_key = Some(session_key);
                node.refresh();
                self.nodes.insert(node).await;
                info!(%peer, %addr, "added node from handshake request");
            }
        }

        let reply = {
            let keypair = self.keypair.read().await;
            build_handshake(TAG_HANDSHAKE_RESPONSE, &our_ephemeral, &keypair)
        };
        if let Err(err) = self.socket.send_to(&reply, addr).await {
            error!(%addr, %err, "handshake response transmission failed");
        }
    }

    /// Handle an inbound handshake response, completing a handshake we
    /// initiated: derive the session key, then negotiate session data
    /// over the fresh channel.
    pub(crate) async fn handle_handshake_response(self: &Arc<Self>, pkt: &[u8], addr: SocketAddr) {
        let (sign_pub, their_ephemeral) = match validate_handshake(pkt, None) {
            Ok(parts) => parts,
            Err(err) => {
                info!(%addr, %err, "invalid handshake response");
                return;
            }
        };
        let peer = Identity::of(&sign_pub);

        let secret = self.kx_cache.secret_for(&peer).await;
        if secret.is_none() {
            info!(%peer, %addr, "unsolicited handshake response");
        }
        let node = self.nodes.by_identity(&peer).await;
        if node.is_none() {
            info!(%peer, %addr, "handshake response for unknown node");
        }
        let (secret, node) = match (secret, node) {
            (Some(secret), Some(node)) => (secret, node),
            _ => return,
        };

        {
            let mut n = node.write().await;
            n.session_key = Some(derive_session_key(&secret, &their_ephemeral));
            n.from_addr = Some(addr);
            n.refresh();
        }
        self.nodes.index_addr(addr, node.clone()).await;
        debug!(%peer, %addr, "handshake complete, negotiating session data");

        // Propose a session TTL over the now-usable encrypted channel.
        // The completion callback fires once the peer's answer arrives.
        let id = self.bus.next_query_id();
        let mut proposal = Header::query(
            MsgType::SessionData,
            id,
            (PROPOSED_SESSION_TTL.as_secs() as u32).to_le_bytes().to_vec(),
        );
        proposal.service = crate::server::OVERLAY_SERVICE_ID;
        if let Err(err) = self
            .net_send(proposal, node, false, self.bus_port)
            .await
        {
            error!(%peer, %err, "session data proposal failed");
        }
    }

    /// Answer a peer's session-data proposal: clamp the requested TTL,
    /// apply it, and reply with the value actually applied.
    pub(crate) async fn handle_session_data_query(self: &Arc<Self>, header: Header) {
        let peer = match header.node_id {
            Some(peer) => peer,
            None => return,
        };
        let node = match self.nodes.by_identity(&peer).await {
            Some(node) => node,
            None => {
                info!(%peer, "session data from unknown node");
                return;
            }
        };
        let requested = header.body_to_u32().unwrap_or(0);
        let applied = Duration::from_secs(requested as u64).min(MAX_SESSION_TTL);
        {
            let mut n = node.write().await;
            n.ttl = applied;
            n.refresh();
        }

        let reply = header.respond((applied.as_secs() as u32).to_le_bytes().to_vec());
        if let Err(err) = self
            .net_send(reply, node, false, self.bus_port)
            .await
        {
            error!(%peer, %err, "session data reply failed");
        }
    }

    /// Apply the TTL our peer actually granted, then fire the pending
    /// handshake completion callback exactly once.
    pub(crate) async fn handle_session_data_response(self: &Arc<Self>, header: Header) {
        let peer = match header.node_id {
            Some(peer) => peer,
            None => return,
        };
        let node = match self.nodes.by_identity(&peer).await {
            Some(node) => node,
            None => {
                info!(%peer, "session data response from unknown node");
                return;
            }
        };
        let granted = header.body_to_u32().unwrap_or(0);
        let applied = Duration::from_secs(granted as u64).min(MAX_SESSION_TTL);
        let callback = {
            let mut n = node.write().await;
            n.ttl = applied;
            n.refresh();
            n.take_callback()
        };
        if let Some(callback) = callback {
            callback();
        }
    }

    /// Schedule the unconditional removal of the pending key-exchange
    /// entry for `peer`. Removal is independent of handshake completion;
    /// a response arriving after it is dropped as unsolicited.
    fn schedule_kx_removal(self: &Arc<Self>, peer: Identity) {
        let server = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(EPHEMERAL_TTL).await;
            server.kx_cache.remove(&peer).await;
        });
    }
}
