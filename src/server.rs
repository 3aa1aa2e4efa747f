//! # Overlay Server
//!
//! The public-facing node of the overlay. An [`OverlayServer`] owns all
//! component state — identity keypair, ephemeral key cache, node
//! registry, service registry, query-correlation table, reassembler —
//! each behind its own synchronization primitive, and hands itself by
//! `Arc` to every handler.
//!
//! ## Workers
//!
//! `bind` spawns two workers: one drains the UDP socket and dispatches
//! each datagram by its leading tag byte, one drains the local bus and
//! handles commands and queries addressed to the overlay. Handlers run
//! concurrently; no lock is held across a network call.
//!
//! ## Packet Dispatch
//!
//! The first byte of every raw datagram selects exactly one handler:
//!
//! | tag | handler |
//! |-----|---------|
//! | 0   | handshake request |
//! | 1   | handshake response |
//! | 2   | encrypted transport payload |
//!
//! Empty datagrams and unknown tags are dropped and logged; no handler
//! ever sees a zero-length payload.

use anyhow::{anyhow, Context, Result};
use ed25519_dalek::VerifyingKey;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{debug, error, info, warn};

use crate::bus::{BusPacket, LocalBus, LocalPort};
use crate::identity::{Identity, Keypair, KxCache};
use crate::messages::{Header, MsgType};
use crate::packeter::Reassembler;
use crate::registry::{Node, NodeRef, NodeTable};
use crate::store::{
    BucketStore, BEACON_BUCKET, CONFIG_BUCKET, IDENTITY_KEY, STATIC_KEY_FLAG,
};

// Wire tags: the first byte of every raw datagram.
pub const TAG_HANDSHAKE_REQUEST: u8 = 0;
pub const TAG_HANDSHAKE_RESPONSE: u8 = 1;
pub const TAG_ENCRYPTED: u8 = 2;

/// Service identifier the overlay answers under; pre-registered to the
/// overlay's own bus port.
pub const OVERLAY_SERVICE_ID: u32 = 6_510_457;

/// Receive buffer size for the UDP worker.
const RECV_BUF_LEN: usize = 65_536;

pub struct OverlayServer {
    pub(crate) keypair: RwLock<Keypair>,
    pub(crate) kx_cache: KxCache,
    pub(crate) nodes: NodeTable,
    pub(crate) services: RwLock<HashMap<u32, LocalPort>>,
    /// Query correlation: id of an outbound query -> local origin port.
    /// Entries are never removed after delivery.
    pub(crate) callbacks: RwLock<HashMap<u32, LocalPort>>,
    pub(crate) reassembler: Mutex<Reassembler>,
    pub(crate) socket: UdpSocket,
    pub(crate) bus: Arc<LocalBus>,
    pub(crate) bus_port: LocalPort,
    pub(crate) store: Arc<dyn BucketStore>,
    local_addr: SocketAddr,
    shutdown: Notify,
}

impl OverlayServer {
    /// Bind the overlay on `addr`, attach it to the bus under
    /// `bus_port`, reload persisted beacons, and start the network and
    /// bus workers.
    pub async fn bind(
        addr: &str,
        bus: Arc<LocalBus>,
        bus_port: LocalPort,
        store: Arc<dyn BucketStore>,
    ) -> Result<Arc<Self>> {
        let addr: SocketAddr = addr.parse().context("invalid socket address")?;
        let socket = UdpSocket::bind(addr)
            .await
            .context("failed to bind overlay socket")?;
        let local_addr = socket.local_addr()?;

        let bus_rx = bus.attach(bus_port).await;

        let server = Arc::new(Self {
            keypair: RwLock::new(Keypair::generate()),
            kx_cache: KxCache::new(),
            nodes: NodeTable::new(),
            services: RwLock::new(HashMap::new()),
            callbacks: RwLock::new(HashMap::new()),
            reassembler: Mutex::new(Reassembler::new()),
            socket,
            bus,
            bus_port,
            store,
            local_addr,
            shutdown: Notify::new(),
        });

        // The overlay's own service id routes back to itself.
        server
            .services
            .write()
            .await
            .insert(OVERLAY_SERVICE_ID, bus_port);

        if let Err(err) = server.load_beacons().await {
            warn!(%err, "failed to reload beacons");
        }

        // Network worker: one reader, one spawned handler per datagram.
        {
            let server = server.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; RECV_BUF_LEN];
                loop {
                    match server.socket.recv_from(&mut buf).await {
                        Ok((len, from)) => {
                            let pkt = buf[..len].to_vec();
                            let server = server.clone();
                            tokio::spawn(async move {
                                server.dispatch(&pkt, from).await;
                            });
                        }
                        Err(err) => {
                            error!(%err, "socket receive failed");
                        }
                    }
                }
            });
        }

        // Bus worker.
        {
            let server = server.clone();
            let mut bus_rx = bus_rx;
            tokio::spawn(async move {
                while let Some(pkt) = bus_rx.recv().await {
                    server.handle_bus_packet(pkt).await;
                }
            });
        }

        let identity = server.identity().await;
        info!(%identity, %local_addr, "overlay node up");
        Ok(server)
    }

    pub async fn identity(&self) -> Identity {
        self.keypair.read().await.identity()
    }

    pub async fn verifying_key(&self) -> VerifyingKey {
        self.keypair.read().await.verifying_key()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn bus_port(&self) -> LocalPort {
        self.bus_port
    }

    /// Register a peer reachable at `addr`. Idempotent.
    pub async fn add_node(&self, sign_pub: VerifyingKey, addr: SocketAddr) -> NodeRef {
        self.nodes
            .insert(Node::new(sign_pub, addr).with_from_addr(addr))
            .await
    }

    pub async fn node_by_identity(&self, id: &Identity) -> Option<NodeRef> {
        self.nodes.by_identity(id).await
    }

    pub async fn node_by_addr(&self, addr: &SocketAddr) -> Option<NodeRef> {
        self.nodes.by_addr(addr).await
    }

    /// Resolves when a terminate command arrives over the bus.
    pub async fn wait_shutdown(&self) {
        self.shutdown.notified().await;
    }

    // ------------------------------------------------------------------
    // Packet dispatch
    // ------------------------------------------------------------------

    /// Route one raw datagram by its leading tag byte.
    pub(crate) async fn dispatch(self: &Arc<Self>, pkt: &[u8], from: SocketAddr) {
        if pkt.is_empty() {
            info!(%from, "empty packet");
            return;
        }
        match pkt[0] {
            TAG_HANDSHAKE_REQUEST => self.handle_handshake_request(pkt, from).await,
            TAG_HANDSHAKE_RESPONSE => self.handle_handshake_response(pkt, from).await,
            TAG_ENCRYPTED => self.handle_net_packet(pkt, from).await,
            tag => info!(tag, %from, "unknown packet type"),
        }
    }

    // ------------------------------------------------------------------
    // Service/query routing
    // ------------------------------------------------------------------

    /// Deliver a reassembled inbound message to its local consumer: the
    /// recorded origin of a matching outbound query if there is one,
    /// otherwise the registered target service.
    pub(crate) async fn route_inbound(&self, header: Header) {
        let origin = self.callbacks.read().await.get(&header.id).copied();
        if let Some(port) = origin {
            // Response to a locally-originated query. The correlation
            // entry is deliberately retained after delivery.
            self.bus.send(self.bus_port, port, header).await;
            return;
        }
        let service = self.services.read().await.get(&header.service).copied();
        match service {
            Some(port) => self.bus.send(self.bus_port, port, header).await,
            None => info!(
                id = header.id,
                service = header.service,
                "no service or callback for message"
            ),
        }
    }

    // ------------------------------------------------------------------
    // Bus handling
    // ------------------------------------------------------------------

    async fn handle_bus_packet(self: &Arc<Self>, pkt: BusPacket) {
        let header = pkt.header;
        if header.from_net() {
            self.handle_net_delivered(header).await;
        } else if header.addr.is_some() && !matches!(header.msg_type, MsgType::AddBeacon) {
            // Local traffic declaring a network destination is outbound;
            // AddBeacon is the one command that also carries an address.
            self.route_to_network(pkt.from, header).await;
        } else if header.is_query() {
            self.handle_local_query(pkt.from, header).await;
        } else {
            self.handle_command(pkt.from, header).await;
        }
    }

    /// Network-originated messages addressed to the overlay's own
    /// service: the session-data sub-protocol.
    async fn handle_net_delivered(self: &Arc<Self>, header: Header) {
        match header.msg_type {
            MsgType::SessionData if header.is_query() => {
                self.handle_session_data_query(header).await
            }
            MsgType::SessionData if header.is_response() => {
                self.handle_session_data_response(header).await
            }
            other => debug!(?other, "unhandled network message for overlay service"),
        }
    }

    async fn handle_local_query(&self, from: LocalPort, header: Header) {
        let body: Vec<u8> = match header.msg_type {
            MsgType::Ping => {
                vec![header.body.first().copied().unwrap_or(0).wrapping_add(1)]
            }
            MsgType::GetPubKey => self.keypair.read().await.public_key_bytes().to_vec(),
            MsgType::GetPort => (self.local_addr.port() as u32).to_le_bytes().to_vec(),
            MsgType::GetId => {
                let keypair = self.keypair.read().await;
                let mut body = keypair.public_key_bytes().to_vec();
                body.extend_from_slice(keypair.identity().as_bytes());
                body
            }
            other => {
                info!(?other, "unknown query type");
                return;
            }
        };
        self.bus.send(self.bus_port, from, header.respond(body)).await;
    }

    async fn handle_command(self: &Arc<Self>, from: LocalPort, header: Header) {
        match header.msg_type {
            MsgType::RegisterService => {
                let service = match header.body_to_u32() {
                    Some(service) => service,
                    None => {
                        info!("register service without a service id");
                        return;
                    }
                };
                self.services.write().await.insert(service, from);
                info!(service, %from, "registered service");
            }
            MsgType::AddBeacon => {
                let addr = match header.addr {
                    Some(addr) => addr,
                    None => {
                        info!("cannot add beacon without an address");
                        return;
                    }
                };
                let key: [u8; 32] = match header.body.as_slice().try_into() {
                    Ok(key) => key,
                    Err(_) => {
                        info!("beacon public key has wrong length");
                        return;
                    }
                };
                let sign_pub = match VerifyingKey::from_bytes(&key) {
                    Ok(sign_pub) => sign_pub,
                    Err(err) => {
                        info!(%err, "beacon public key is invalid");
                        return;
                    }
                };
                self.add_beacon(sign_pub, addr).await;
            }
            MsgType::SetKey => {
                if let Err(err) = self.set_key().await {
                    error!(%err, "identity key rotation failed");
                }
            }
            MsgType::StaticKey => {
                let flag = header.body.first().copied().unwrap_or(0) != 0;
                if let Err(err) = self.set_static_key(flag) {
                    error!(%err, "persisting static key flag failed");
                }
            }
            MsgType::Die => {
                info!("terminate command received");
                self.shutdown.notify_one();
            }
            other => info!(?other, "unknown bus message type"),
        }
    }

    /// Forward a local service's message to the network, resolving the
    /// destination node by its declared address.
    async fn route_to_network(self: &Arc<Self>, from: LocalPort, header: Header) {
        let addr = header.addr.expect("checked by caller");
        let node = match self.nodes.by_addr(&addr).await {
            Some(node) => node,
            None => {
                info!(%addr, "cannot send to unknown address");
                return;
            }
        };
        if let Err(err) = self.net_send(header, node, true, from).await {
            error!(%addr, %err, "network send rejected");
        }
    }

    // ------------------------------------------------------------------
    // Beacons
    // ------------------------------------------------------------------

    /// Register a bootstrap peer, persist it, and start a handshake so
    /// the session is ready before traffic needs it.
    pub async fn add_beacon(self: &Arc<Self>, sign_pub: VerifyingKey, addr: SocketAddr) {
        let node = Node::new(sign_pub, addr).with_from_addr(addr);
        let id = node.identity;
        let node = self.nodes.insert(node).await;
        self.nodes.mark_beacon(id).await;
        if let Err(err) = self.save_beacon(&sign_pub, addr) {
            error!(%err, "failed to persist beacon");
        }
        info!(%id, %addr, "added beacon");
        if let Err(err) = self.send_handshake_request(&node, None).await {
            error!(%id, %err, "beacon handshake failed");
        }
    }

    fn save_beacon(&self, sign_pub: &VerifyingKey, addr: SocketAddr) -> Result<()> {
        let value = crate::messages::serialize(&addr)?;
        self.store.set(BEACON_BUCKET, sign_pub.as_bytes(), &value)
    }

    /// Replay the persisted beacon bucket into the registry.
    pub(crate) async fn load_beacons(&self) -> Result<()> {
        let mut cursor = self.store.first(BEACON_BUCKET)?;
        while let Some((key, value)) = cursor {
            match Self::decode_beacon(&key, &value) {
                Ok((sign_pub, addr)) => {
                    let node = Node::new(sign_pub, addr).with_from_addr(addr);
                    let id = node.identity;
                    self.nodes.insert(node).await;
                    self.nodes.mark_beacon(id).await;
                    debug!(%id, %addr, "reloaded beacon");
                }
                Err(err) => warn!(%err, "skipping corrupt beacon record"),
            }
            cursor = self.store.next(BEACON_BUCKET, &key)?;
        }
        Ok(())
    }

    fn decode_beacon(key: &[u8], value: &[u8]) -> Result<(VerifyingKey, SocketAddr)> {
        let key: [u8; 32] = key
            .try_into()
            .map_err(|_| anyhow!("beacon key has wrong length"))?;
        let sign_pub = VerifyingKey::from_bytes(&key).context("beacon key is invalid")?;
        let addr: SocketAddr = crate::messages::deserialize_bounded(value)
            .context("beacon address is undecodable")?;
        Ok((sign_pub, addr))
    }

    // ------------------------------------------------------------------
    // Identity key management
    // ------------------------------------------------------------------

    /// Whether the identity key is persisted across restarts.
    pub fn static_key(&self) -> Result<bool> {
        Ok(self
            .store
            .get(CONFIG_BUCKET, STATIC_KEY_FLAG)?
            .map(|v| v.first() == Some(&1))
            .unwrap_or(false))
    }

    pub fn set_static_key(&self, static_key: bool) -> Result<()> {
        self.store
            .set(CONFIG_BUCKET, STATIC_KEY_FLAG, &[static_key as u8])
    }

    /// Install the identity key: the persisted one when the static flag
    /// is set (generating and persisting it on first use), a fresh one
    /// otherwise.
    pub async fn set_key(&self) -> Result<()> {
        let keypair = if self.static_key()? {
            match self.store.get(CONFIG_BUCKET, IDENTITY_KEY)? {
                Some(bytes) => {
                    let secret: [u8; 32] = bytes
                        .as_slice()
                        .try_into()
                        .map_err(|_| anyhow!("stored identity key has wrong length"))?;
                    Keypair::from_secret_key_bytes(&secret)
                }
                None => {
                    let keypair = Keypair::generate();
                    self.store
                        .set(CONFIG_BUCKET, IDENTITY_KEY, &keypair.secret_key_bytes())?;
                    keypair
                }
            }
        } else {
            Keypair::generate()
        };
        *self.keypair.write().await = keypair;
        Ok(())
    }

    /// Install a fresh identity key without consulting the store.
    pub async fn random_key(&self) {
        *self.keypair.write().await = Keypair::generate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::FLAG_QUERY;
    use crate::store::MemStore;
    use crate::transport::SendError;

    async fn test_server() -> (Arc<OverlayServer>, Arc<LocalBus>) {
        let bus = Arc::new(LocalBus::new());
        let store = Arc::new(MemStore::new());
        let server = OverlayServer::bind("127.0.0.1:0", bus.clone(), LocalPort(1), store)
            .await
            .expect("bind failed");
        (server, bus)
    }

    #[tokio::test]
    async fn ping_query_over_bus() {
        let (server, bus) = test_server().await;
        let mut rx = bus.attach(LocalPort(50)).await;
        let query = Header::query(MsgType::Ping, bus.next_query_id(), vec![41]);
        bus.send(LocalPort(50), server.bus_port(), query).await;
        let reply = rx.recv().await.unwrap();
        assert!(reply.header.is_response());
        assert_eq!(reply.header.body, vec![42]);
    }

    #[tokio::test]
    async fn get_id_query_returns_key_and_digest() {
        let (server, bus) = test_server().await;
        let mut rx = bus.attach(LocalPort(51)).await;
        let query = Header::query(MsgType::GetId, bus.next_query_id(), vec![]);
        bus.send(LocalPort(51), server.bus_port(), query).await;
        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.header.body.len(), 64);
        assert_eq!(
            reply.header.body[..32],
            server.verifying_key().await.to_bytes()
        );
        assert_eq!(
            reply.header.body[32..],
            *server.identity().await.as_bytes()
        );
    }

    #[tokio::test]
    async fn register_service_maps_sender_port() {
        let (server, bus) = test_server().await;
        let cmd = Header::new(MsgType::RegisterService, 777u32.to_le_bytes().to_vec());
        bus.send(LocalPort(60), server.bus_port(), cmd).await;
        // The bus worker handles the command asynchronously.
        for _ in 0..50 {
            if server.services.read().await.get(&777) == Some(&LocalPort(60)) {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
        panic!("service registration did not land");
    }

    #[tokio::test]
    async fn static_key_survives_set_key() {
        let (server, _bus) = test_server().await;
        assert!(!server.static_key().unwrap());

        server.set_static_key(true).unwrap();
        server.set_key().await.unwrap();
        let first = server.identity().await;
        server.set_key().await.unwrap();
        assert_eq!(server.identity().await, first);

        server.set_static_key(false).unwrap();
        server.set_key().await.unwrap();
        assert_ne!(server.identity().await, first);
    }

    #[tokio::test]
    async fn zero_correlation_id_send_is_rejected() {
        let (server, _bus) = test_server().await;
        let peer = Keypair::generate();
        let node = server
            .add_node(peer.verifying_key(), "127.0.0.1:9".parse().unwrap())
            .await;
        {
            // Fabricate a live session so the send reaches the id check.
            let mut n = node.write().await;
            n.session_key = Some(crate::crypto::SessionKey::from_bytes([9u8; 32]));
            n.refresh();
        }
        let mut msg = Header::new(MsgType::Test, b"x".to_vec());
        msg.flags = FLAG_QUERY;
        let err = server
            .net_send(msg, node, false, LocalPort(2))
            .await
            .unwrap_err();
        assert_eq!(err, SendError::ZeroId);
        // No query callback was recorded for the rejected send.
        assert!(server.callbacks.read().await.is_empty());
    }

    #[tokio::test]
    async fn beacons_reload_from_store() {
        let bus = Arc::new(LocalBus::new());
        let store = Arc::new(MemStore::new());
        let peer = Keypair::generate();
        let addr: SocketAddr = "127.0.0.1:4242".parse().unwrap();

        let first = OverlayServer::bind("127.0.0.1:0", bus.clone(), LocalPort(1), store.clone())
            .await
            .unwrap();
        first.add_beacon(peer.verifying_key(), addr).await;

        // A second server over the same store sees the beacon at startup.
        let second = OverlayServer::bind("127.0.0.1:0", bus.clone(), LocalPort(2), store)
            .await
            .unwrap();
        let node = second
            .node_by_identity(&peer.identity())
            .await
            .expect("beacon should be reloaded");
        assert_eq!(node.read().await.to_addr, addr);
        assert_eq!(second.nodes.beacons().await.len(), 1);
    }
}
