//! # Causeway - Secure P2P Overlay Node
//!
//! Causeway is the public-facing node of a peer-to-peer overlay. It
//! establishes authenticated, encrypted sessions with other nodes over
//! an unreliable datagram network and multiplexes application messages
//! between local services and remote peers:
//!
//! - **Identity**: Ed25519 signing keypair; nodes are addressed by the
//!   blake3 digest of the signing public key
//! - **Handshake**: signed exchange of single-use X25519 values,
//!   derived into a per-peer symmetric session key
//! - **Transport**: gzip-opportunistic framing, MTU fragmentation, and
//!   ChaCha20-Poly1305 encryption of every fragment
//! - **Routing**: one-byte wire tags demultiplex raw datagrams; a
//!   service/query router delivers decrypted messages to local ports
//!
//! ## Architecture
//!
//! All mutable state lives on a single [`OverlayServer`], each registry
//! behind its own reader/writer lock, shared by `Arc` with every
//! handler. Two workers drive the node: one drains the UDP socket, one
//! drains the local bus; per-message handlers run on their own tasks.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `server` | `OverlayServer` facade: dispatch, routing, bus commands |
//! | `identity` | keypairs, identity digests, ephemeral key cache |
//! | `crypto` | signatures, session-key derivation, packet encryption |
//! | `registry` | known peers by identity/address, liveness, beacons |
//! | `handshake` | handshake packets and session establishment |
//! | `transport` | encrypt/fragment outbound, reassemble/decrypt inbound |
//! | `packeter` | fragmentation collaborator |
//! | `messages` | application header and bounded serialization |
//! | `bus` | local inter-process message bus collaborator |
//! | `store` | keyed bucket persistence collaborator |

pub mod bus;
pub mod crypto;
pub mod handshake;
pub mod identity;
pub mod messages;
pub mod packeter;
pub mod registry;
pub mod server;
pub mod store;
pub mod transport;

pub use bus::{BusPacket, LocalBus, LocalPort};
pub use identity::{Identity, Keypair};
pub use messages::{Header, MsgType};
pub use server::{OverlayServer, OVERLAY_SERVICE_ID};
pub use store::{BucketStore, MemStore};
pub use transport::{SendError, SendState};
