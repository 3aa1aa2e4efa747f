//! # Node Registry
//!
//! Tracks known peers by identity and by the network address they were
//! last observed from. Records hold the peer's signing key, the
//! negotiated session key once a handshake completes, and advisory
//! liveness: an expiry instant extended on handshake completion, on
//! session-data negotiation, and on inbound activity when the peer has a
//! non-zero TTL.
//!
//! The registry never evicts. Liveness is checked lazily by the
//! transport before sending; there is no background reaper.

use ed25519_dalek::VerifyingKey;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::crypto::SessionKey;
use crate::identity::Identity;

/// Expiry window applied when a session is established, before a TTL has
/// been negotiated.
pub const DEFAULT_SESSION_WINDOW: Duration = Duration::from_secs(600);

/// Upper bound on a negotiated session TTL; both sides clamp to this.
pub const MAX_SESSION_TTL: Duration = Duration::from_secs(3600);

/// One-shot continuation invoked when a pending handshake completes.
/// Fires on whichever worker processes the handshake response, not on
/// the stack that initiated the handshake.
pub type HandshakeCallback = Box<dyn FnOnce() + Send + Sync + 'static>;

/// A remote peer's registry record.
pub struct Node {
    pub sign_pub: VerifyingKey,
    pub identity: Identity,
    pub session_key: Option<SessionKey>,
    /// Address used to reach the peer.
    pub to_addr: SocketAddr,
    /// Address the peer was last observed from.
    pub from_addr: Option<SocketAddr>,
    /// Negotiated session TTL; zero until session data has been agreed.
    pub ttl: Duration,
    pub live_until: Instant,
    pub hs_callback: Option<HandshakeCallback>,
}

impl Node {
    pub fn new(sign_pub: VerifyingKey, to_addr: SocketAddr) -> Self {
        Self {
            sign_pub,
            identity: Identity::of(&sign_pub),
            session_key: None,
            to_addr,
            from_addr: None,
            ttl: Duration::ZERO,
            live_until: Instant::now(),
            hs_callback: None,
        }
    }

    pub fn with_from_addr(mut self, addr: SocketAddr) -> Self {
        self.from_addr = Some(addr);
        self
    }

    /// Advisory liveness: true while the expiry instant is in the future.
    pub fn live(&self) -> bool {
        self.live_until > Instant::now()
    }

    /// Push the expiry forward by the negotiated TTL, or by the default
    /// window when no TTL has been agreed yet.
    pub fn refresh(&mut self) {
        let window = if self.ttl > Duration::ZERO {
            self.ttl
        } else {
            DEFAULT_SESSION_WINDOW
        };
        self.live_until = Instant::now() + window;
    }

    /// Take the pending handshake continuation, guaranteeing it can fire
    /// at most once.
    pub fn take_callback(&mut self) -> Option<HandshakeCallback> {
        self.hs_callback.take()
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("identity", &self.identity)
            .field("to_addr", &self.to_addr)
            .field("from_addr", &self.from_addr)
            .field("session", &self.session_key.is_some())
            .field("ttl", &self.ttl)
            .finish()
    }
}

/// Shared handle to a registry record.
pub type NodeRef = Arc<RwLock<Node>>;

/// Registry of known peers, indexed by identity and by observed address.
#[derive(Default)]
pub struct NodeTable {
    by_id: RwLock<HashMap<Identity, NodeRef>>,
    by_addr: RwLock<HashMap<SocketAddr, NodeRef>>,
    beacons: RwLock<Vec<Identity>>,
}

impl NodeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record. Idempotent: if the identity is already present
    /// the existing record (and any session key it holds) is preserved
    /// and returned.
    pub async fn insert(&self, node: Node) -> NodeRef {
        let id = node.identity;
        let mut by_id = self.by_id.write().await;
        if let Some(existing) = by_id.get(&id) {
            return existing.clone();
        }
        let from_addr = node.from_addr;
        let node = Arc::new(RwLock::new(node));
        by_id.insert(id, node.clone());
        drop(by_id);
        if let Some(addr) = from_addr {
            self.by_addr.write().await.insert(addr, node.clone());
        }
        node
    }

    /// Like [`insert`](Self::insert) for a record that is already
    /// shared: registers it if its identity is new, otherwise returns
    /// the record already in the table.
    pub async fn adopt(&self, node: NodeRef) -> NodeRef {
        let (id, from_addr) = {
            let n = node.read().await;
            (n.identity, n.from_addr)
        };
        let mut by_id = self.by_id.write().await;
        if let Some(existing) = by_id.get(&id) {
            return existing.clone();
        }
        by_id.insert(id, node.clone());
        drop(by_id);
        if let Some(addr) = from_addr {
            self.by_addr.write().await.insert(addr, node.clone());
        }
        node
    }

    pub async fn by_identity(&self, id: &Identity) -> Option<NodeRef> {
        self.by_id.read().await.get(id).cloned()
    }

    pub async fn by_addr(&self, addr: &SocketAddr) -> Option<NodeRef> {
        self.by_addr.read().await.get(addr).cloned()
    }

    /// Register the address a node was observed from, making the record
    /// addressable by that address.
    pub async fn index_addr(&self, addr: SocketAddr, node: NodeRef) {
        self.by_addr.write().await.insert(addr, node);
    }

    pub async fn mark_beacon(&self, id: Identity) {
        let mut beacons = self.beacons.write().await;
        if !beacons.contains(&id) {
            beacons.push(id);
        }
    }

    pub async fn beacons(&self) -> Vec<Identity> {
        self.beacons.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.by_id.read().await.len()
    }
}
