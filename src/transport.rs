//! # Secure Packet Transport
//!
//! Frames, compresses, fragments, and encrypts outbound application
//! messages, and reverses the process on receipt.
//!
//! ## Outbound Pipeline
//!
//! ```text
//! Header ──serialize──► [compression tag | bytes]
//!        ──fragment───► size-bounded fragments carrying the correlation id
//!        ──encrypt────► [wire tag 2 | nonce | ciphertext] per fragment
//!        ──send───────► target's "to" address
//! ```
//!
//! Compression is opportunistic: when requested, a gzip variant is
//! produced and the smaller encoding wins.
//!
//! ## Deferred Sends
//!
//! A send toward a peer with no live session does not fail: it parks the
//! message, initiates a handshake, and re-enters itself as the
//! handshake's one-shot completion callback. The per-message state is
//! explicit ([`SendState`]) so the single retry is observable; the
//! retry runs on a fresh task, never on the stack (or under the locks)
//! of the original call.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::crypto;
use crate::messages::{deserialize_bounded, serialize, Header, FLAG_FROM_NET};
use crate::packeter::{self, Completed, DEFAULT_MTU};
use crate::registry::NodeRef;
use crate::server::{OverlayServer, TAG_ENCRYPTED};

// Compression tags, the first byte of every serialized message.
pub const NO_COMPRESSION: u8 = 0;
pub const GZIPPED: u8 = 1;

/// Error type for outbound send failures reported to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// The message's correlation id is zero; something upstream failed
    /// to assign one.
    ZeroId,
    /// The message could not be serialized.
    Encode,
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendError::ZeroId => write!(f, "message correlation id cannot be 0"),
            SendError::Encode => write!(f, "message serialization failed"),
        }
    }
}

impl std::error::Error for SendError {}

/// Terminal state of one send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    /// No live session; a handshake was initiated and the message will
    /// be retried once, as the handshake's completion callback.
    AwaitingSession,
    /// At least one fragment was handed to the network.
    Sent,
    /// Every fragment failed to transmit.
    Failed,
}

/// Gzip `bytes`, prefixing the result with the [`GZIPPED`] tag.
pub fn compress(bytes: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(vec![GZIPPED], Compression::default());
    encoder
        .write_all(bytes)
        .expect("writing to an in-memory gzip encoder cannot fail");
    encoder
        .finish()
        .expect("finishing an in-memory gzip encoder cannot fail")
}

/// Inverse of [`compress`], minus the tag byte (the caller strips it).
/// SECURITY: output is capped so a compression bomb cannot exhaust
/// memory; anything larger than the deserialization limit is unusable
/// downstream anyway.
pub fn decompress(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(bytes)
        .take(crate::messages::MAX_DESERIALIZE_SIZE)
        .read_to_end(&mut out)?;
    Ok(out)
}

/// Task body for a deferred send retried as a handshake-completion
/// callback. Kept as a free function so the `Send` obligation on
/// [`OverlayServer::net_send`]'s future is discharged here rather than
/// recursively inside `net_send`, which the auto-trait solver would
/// otherwise reject as a self-referential cycle.
async fn run_deferred_send(
    server: Arc<OverlayServer>,
    msg: Header,
    node: NodeRef,
    compression: bool,
    origin: crate::bus::LocalPort,
) {
    match server.net_send(msg, node, compression, origin).await {
        Ok(state) => debug!(?state, "deferred send finished"),
        Err(err) => error!(%err, "deferred send failed"),
    }
}

/// Build the one-shot handshake-completion callback that retries a
/// deferred send. Kept as a free function (rather than an inline closure
/// in `net_send`) so the `net_send: Send` obligation raised by its
/// `tokio::spawn` is discharged here instead of recursively inside
/// `net_send`, where the auto-trait solver rejects it as a cycle.
fn make_retry_callback(
    server: Arc<OverlayServer>,
    msg: Header,
    node: NodeRef,
    compression: bool,
    origin: crate::bus::LocalPort,
) -> crate::registry::HandshakeCallback {
    Box::new(move || {
        // AwaitingSession -> Sending: runs on whichever worker completed
        // the handshake, on its own task.
        tokio::spawn(run_deferred_send(server, msg, node, compression, origin));
    })
}

impl OverlayServer {
    /// Send an application message to `node`.
    ///
    /// The node is registered if it was not already (idempotent). With
    /// no live session the send is transparently deferred behind a
    /// handshake and this returns [`SendState::AwaitingSession`]; the
    /// caller is never blocked on the network. Per-fragment transmit
    /// errors are logged individually and do not roll back fragments
    /// already sent.
    pub async fn net_send(
        self: &Arc<Self>,
        mut msg: Header,
        node: NodeRef,
        compression: bool,
        origin: crate::bus::LocalPort,
    ) -> Result<SendState, SendError> {
        let node = self.nodes.adopt(node).await;

        let (ready, to_addr, session_key) = {
            let n = node.read().await;
            let ready = n.session_key.is_some() && n.live();
            (ready, n.to_addr, n.session_key.clone())
        };
        if !ready {
            info!(%to_addr, "deferring send until handshake completes");
            // The callback is built in a free function so the `tokio::spawn`
            // it performs — and the `net_send: Send` obligation that spawn
            // raises — is discharged outside `net_send`'s own body; raising
            // it inside `net_send` makes the auto-trait solver treat the
            // recursion as a self-referential cycle and reject it.
            let retry = make_retry_callback(self.clone(), msg, node.clone(), compression, origin);
            if let Err(err) = self.send_handshake_request(&node, Some(retry)).await {
                error!(%err, "handshake request for deferred send failed");
            }
            return Ok(SendState::AwaitingSession);
        }
        let session_key = session_key.expect("checked above");

        let id = msg.id;
        if id == 0 {
            return Err(SendError::ZeroId);
        }
        let is_query = msg.is_query();
        // The correlation id travels with the fragments, not the header.
        msg.id = 0;

        let mut bytes = vec![NO_COMPRESSION];
        bytes.extend(serialize(&msg).map_err(|_| SendError::Encode)?);
        if compression {
            let zipped = compress(&bytes[1..]);
            if zipped.len() < bytes.len() {
                bytes = zipped;
            }
        }

        let fragments = packeter::split(id, &bytes, DEFAULT_MTU);
        let sealed: Vec<Vec<u8>> = fragments
            .iter()
            .map(|frag| {
                let mut pkt = vec![TAG_ENCRYPTED];
                pkt.extend(crypto::seal(&session_key, frag));
                pkt
            })
            .collect();

        if is_query {
            self.callbacks.write().await.insert(id, origin);
        }

        let mut sent = 0usize;
        for pkt in &sealed {
            if let Err(err) = self.socket.send_to(pkt, to_addr).await {
                error!(%to_addr, %err, "fragment transmission failed");
            } else {
                sent += 1;
            }
        }
        if sent == 0 {
            return Ok(SendState::Failed);
        }
        Ok(SendState::Sent)
    }

    /// Handle an inbound encrypted-transport datagram: resolve the
    /// sender by address, decrypt, and feed the fragment to reassembly.
    pub(crate) async fn handle_net_packet(self: &Arc<Self>, pkt: &[u8], addr: SocketAddr) {
        let node = match self.nodes.by_addr(&addr).await {
            Some(node) => node,
            None => {
                // An unknown address cannot have produced a validly
                // encrypted fragment; this is an unexpected failure.
                warn!(%addr, "encrypted packet from unknown address");
                return;
            }
        };
        let session_key = match node.read().await.session_key.clone() {
            Some(key) => key,
            None => {
                info!(%addr, "encrypted packet but no session established");
                return;
            }
        };
        let plain = match crypto::open(&session_key, &pkt[1..]) {
            Ok(plain) => plain,
            Err(err) => {
                info!(%addr, %err, "dropping undecryptable packet");
                return;
            }
        };

        let completed = match self.reassembler.lock().await.receive(&plain) {
            Ok(completed) => completed,
            Err(err) => {
                info!(%addr, %err, "dropping malformed fragment");
                return;
            }
        };
        if let Some(completed) = completed {
            self.handle_reassembled(completed, addr, node).await;
        }
    }

    /// A full message has been reassembled: undo compression, restore
    /// the header, stamp provenance, refresh the sender's expiry, and
    /// hand off to the router.
    async fn handle_reassembled(self: &Arc<Self>, completed: Completed, addr: SocketAddr, node: NodeRef) {
        let body = completed.body;
        if body.is_empty() {
            info!(%addr, "reassembled message has no body");
            return;
        }
        let decoded = if body[0] == GZIPPED {
            match decompress(&body[1..]) {
                Ok(decoded) => decoded,
                Err(err) => {
                    info!(%addr, %err, "dropping message with bad compression");
                    return;
                }
            }
        } else {
            body[1..].to_vec()
        };

        let mut header: Header = match deserialize_bounded(&decoded) {
            Ok(header) => header,
            Err(err) => {
                info!(%addr, %err, "dropping undecodable message");
                return;
            }
        };

        let identity = {
            let mut n = node.write().await;
            if n.ttl > Duration::ZERO {
                n.refresh();
            }
            n.identity
        };
        header.flags |= FLAG_FROM_NET;
        header.id = completed.id;
        header.node_id = Some(identity);
        header.addr = Some(addr);

        self.route_inbound(header).await;
    }
}
