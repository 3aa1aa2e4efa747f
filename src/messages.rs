//! # Application Messages
//!
//! This module defines the application-level header that rides inside the
//! encrypted transport, plus the bounded bincode helpers used everywhere a
//! network-supplied buffer is deserialized.
//!
//! ## Header Lifecycle
//!
//! A header is built by a local service (or by the overlay itself for its
//! session sub-protocol), serialized and encrypted by the transport, and
//! reconstructed on the far side where the transport stamps it with the
//! sender's identity, the observed source address, and the `FROM_NET`
//! flag before routing.
//!
//! ## Security Limits
//!
//! All deserialization goes through [`deserialize_bounded`] so a hostile
//! peer cannot force an allocation larger than [`MAX_DESERIALIZE_SIZE`].

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::net::SocketAddr;

use crate::identity::Identity;

/// Maximum size of an application message body (1 MiB).
pub const MAX_BODY_SIZE: usize = 1024 * 1024;

/// Maximum buffer size for deserialization.
/// Slightly larger than MAX_BODY_SIZE to allow for header framing.
pub const MAX_DESERIALIZE_SIZE: u64 = (MAX_BODY_SIZE as u64) + 4096;

/// Returns bincode options with size limits enforced.
/// SECURITY: Always use this for deserialization to prevent OOM attacks.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

/// Serialize with the same options used for bounded deserialization.
pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

/// Message type carried by every header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MsgType {
    /// Liveness probe; responder echoes body[0] + 1.
    Ping,
    /// Test payload, used by the integration suite.
    Test,
    /// Session TTL negotiation, the overlay's own sub-protocol.
    SessionData,
    /// Query for the overlay's signing public key.
    GetPubKey,
    /// Query for the overlay's network port.
    GetPort,
    /// Query for the overlay's signing key and identity digest.
    GetId,
    /// Bus command: map a service id to a local port.
    RegisterService,
    /// Bus command: add a bootstrap peer.
    AddBeacon,
    /// Bus command: load or rotate the identity key.
    SetKey,
    /// Bus command: persist whether the identity key is static.
    StaticKey,
    /// Bus command: terminate the process (handled by the host binary).
    Die,
}

// Header flag bits.
pub const FLAG_QUERY: u32 = 1 << 0;
pub const FLAG_RESPONSE: u32 = 1 << 1;
pub const FLAG_FROM_NET: u32 = 1 << 2;

/// Application message header.
///
/// `id` is the correlation identifier matching a query to its response
/// across the network and bus boundaries. It is never zero on an
/// outbound network send; the transport rejects that as a programming
/// error.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Header {
    pub msg_type: MsgType,
    pub id: u32,
    pub service: u32,
    pub flags: u32,
    pub body: Vec<u8>,
    /// Sender identity, stamped by the transport on receipt.
    pub node_id: Option<Identity>,
    /// Network address: destination on outbound sends, observed source
    /// on inbound messages.
    pub addr: Option<SocketAddr>,
}

impl Header {
    pub fn new(msg_type: MsgType, body: impl Into<Vec<u8>>) -> Self {
        Self {
            msg_type,
            id: 0,
            service: 0,
            flags: 0,
            body: body.into(),
            node_id: None,
            addr: None,
        }
    }

    /// Build a query header with a caller-allocated correlation id.
    pub fn query(msg_type: MsgType, id: u32, body: impl Into<Vec<u8>>) -> Self {
        let mut h = Self::new(msg_type, body);
        h.id = id;
        h.flags |= FLAG_QUERY;
        h
    }

    /// Build the response to this header, preserving type and
    /// correlation id.
    pub fn respond(&self, body: impl Into<Vec<u8>>) -> Self {
        let mut h = Self::new(self.msg_type, body);
        h.id = self.id;
        h.flags = FLAG_RESPONSE;
        h.addr = self.addr;
        h
    }

    pub fn is_query(&self) -> bool {
        self.flags & FLAG_QUERY != 0
    }

    pub fn is_response(&self) -> bool {
        self.flags & FLAG_RESPONSE != 0
    }

    pub fn from_net(&self) -> bool {
        self.flags & FLAG_FROM_NET != 0
    }

    /// Interpret the body as a little-endian u32 (bus commands carrying
    /// a single numeric argument).
    pub fn body_to_u32(&self) -> Option<u32> {
        let bytes: [u8; 4] = self.body.get(..4)?.try_into().ok()?;
        Some(u32::from_le_bytes(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let mut h = Header::query(MsgType::Test, 42, b"hello".to_vec());
        h.service = 7;
        let bytes = serialize(&h).unwrap();
        let back: Header = deserialize_bounded(&bytes).unwrap();
        assert_eq!(back.msg_type, MsgType::Test);
        assert_eq!(back.id, 42);
        assert_eq!(back.service, 7);
        assert!(back.is_query());
        assert_eq!(back.body, b"hello");
    }

    #[test]
    fn respond_preserves_correlation() {
        let q = Header::query(MsgType::Ping, 9, vec![1]);
        let r = q.respond(vec![2]);
        assert_eq!(r.id, 9);
        assert!(r.is_response());
        assert!(!r.is_query());
    }

    #[test]
    fn bounded_deserialize_rejects_oversized() {
        let h = Header::new(MsgType::Test, vec![0u8; MAX_BODY_SIZE + 8192]);
        let bytes = bincode::serialize(&h).unwrap();
        assert!(deserialize_bounded::<Header>(&bytes).is_err());
    }

    #[test]
    fn body_to_u32_reads_le() {
        let h = Header::new(MsgType::RegisterService, 513u32.to_le_bytes().to_vec());
        assert_eq!(h.body_to_u32(), Some(513));
        let short = Header::new(MsgType::RegisterService, vec![1, 2]);
        assert_eq!(short.body_to_u32(), None);
    }
}
