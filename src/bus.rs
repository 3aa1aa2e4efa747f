//! # Local Bus Collaborator
//!
//! In-process message bus connecting the overlay to local services.
//! Each service attaches under a numeric local port and receives
//! [`BusPacket`]s on an mpsc channel; the envelope carries the sending
//! port so queries can be answered to their origin.
//!
//! The overlay consumes this as a black box: it attaches like any other
//! participant and drains its own receiver on a dedicated worker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use tokio::sync::{mpsc, RwLock};
use tracing::debug;

use crate::messages::Header;

/// Depth of each attached port's delivery channel.
const PORT_CHANNEL_DEPTH: usize = 256;

/// Address of a local bus participant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalPort(pub u32);

impl std::fmt::Display for LocalPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "port:{}", self.0)
    }
}

/// Envelope delivered to an attached port.
#[derive(Debug)]
pub struct BusPacket {
    pub from: LocalPort,
    pub header: Header,
}

/// The bus itself: a registry of attached ports.
pub struct LocalBus {
    ports: RwLock<HashMap<LocalPort, mpsc::Sender<BusPacket>>>,
    next_id: AtomicU32,
}

impl LocalBus {
    pub fn new() -> Self {
        Self {
            ports: RwLock::new(HashMap::new()),
            // Correlation ids start at 1; zero is reserved as invalid.
            next_id: AtomicU32::new(1),
        }
    }

    /// Attach a participant under `port`, replacing any previous
    /// attachment for that port.
    pub async fn attach(&self, port: LocalPort) -> mpsc::Receiver<BusPacket> {
        let (tx, rx) = mpsc::channel(PORT_CHANNEL_DEPTH);
        self.ports.write().await.insert(port, tx);
        rx
    }

    /// Deliver `header` to `to`, recording `from` as the origin.
    /// Undeliverable messages are dropped and logged; the bus makes no
    /// delivery guarantees to detached ports.
    pub async fn send(&self, from: LocalPort, to: LocalPort, header: Header) {
        let tx = self.ports.read().await.get(&to).cloned();
        match tx {
            Some(tx) => {
                if tx.send(BusPacket { from, header }).await.is_err() {
                    debug!(%to, "bus receiver dropped, message discarded");
                }
            }
            None => debug!(%to, "no attachment for port, message discarded"),
        }
    }

    /// Allocate a fresh, non-zero correlation identifier.
    pub fn next_query_id(&self) -> u32 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::MsgType;

    #[tokio::test]
    async fn attach_and_deliver() {
        let bus = LocalBus::new();
        let mut rx = bus.attach(LocalPort(10)).await;
        bus.send(LocalPort(1), LocalPort(10), Header::new(MsgType::Test, b"hi".to_vec()))
            .await;
        let pkt = rx.recv().await.unwrap();
        assert_eq!(pkt.from, LocalPort(1));
        assert_eq!(pkt.header.body, b"hi");
    }

    #[tokio::test]
    async fn send_to_unattached_port_is_dropped() {
        let bus = LocalBus::new();
        // Must not hang or panic.
        bus.send(LocalPort(1), LocalPort(99), Header::new(MsgType::Test, vec![]))
            .await;
    }

    #[test]
    fn query_ids_are_nonzero_and_distinct() {
        let bus = LocalBus::new();
        let a = bus.next_query_id();
        let b = bus.next_query_id();
        assert_ne!(a, 0);
        assert_ne!(b, 0);
        assert_ne!(a, b);
    }
}
