//! # Fragmentation Collaborator
//!
//! Splits an outbound byte payload into network-sized fragments tagged
//! with the message's correlation identifier, and reassembles inbound
//! fragments into complete payloads. This is the seam to the real
//! fragmentation engine; the framing here is deliberately minimal
//! (no forward error correction, no retransmission).
//!
//! Fragment layout: `id: u32 | seq: u16 | total: u16 | chunk`, all
//! big-endian.

use std::collections::HashMap;

/// Fragment frame header width.
const FRAME_LEN: usize = 8;

/// Maximum fragment size handed to the network, frame included.
pub const DEFAULT_MTU: usize = 1024;

/// A fully reassembled message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completed {
    /// Correlation identifier carried by every fragment.
    pub id: u32,
    pub body: Vec<u8>,
}

/// Error type for malformed or inconsistent fragments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentError {
    /// Shorter than the frame header.
    Truncated,
    /// total == 0 or seq >= total.
    BadFrame,
    /// Fragment disagrees with previously seen fragments of the same id.
    Inconsistent,
}

impl std::fmt::Display for FragmentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FragmentError::Truncated => write!(f, "fragment is truncated"),
            FragmentError::BadFrame => write!(f, "fragment frame is invalid"),
            FragmentError::Inconsistent => write!(f, "fragment conflicts with earlier fragments"),
        }
    }
}

impl std::error::Error for FragmentError {}

/// Split `payload` into fragments of at most `mtu` bytes, each carrying
/// the correlation `id`.
pub fn split(id: u32, payload: &[u8], mtu: usize) -> Vec<Vec<u8>> {
    let chunk_len = mtu.saturating_sub(FRAME_LEN).max(1);
    let total = payload.len().div_ceil(chunk_len).max(1) as u16;
    let mut fragments = Vec::with_capacity(total as usize);
    let mut chunks = payload.chunks(chunk_len);
    for seq in 0..total {
        let chunk = chunks.next().unwrap_or(&[]);
        let mut frag = Vec::with_capacity(FRAME_LEN + chunk.len());
        frag.extend_from_slice(&id.to_be_bytes());
        frag.extend_from_slice(&seq.to_be_bytes());
        frag.extend_from_slice(&total.to_be_bytes());
        frag.extend_from_slice(chunk);
        fragments.push(frag);
    }
    fragments
}

struct Partial {
    total: u16,
    received: u16,
    chunks: Vec<Option<Vec<u8>>>,
}

/// Reassembles fragments into complete payloads, keyed by correlation id.
#[derive(Default)]
pub struct Reassembler {
    pending: HashMap<u32, Partial>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one fragment. Returns the completed message once the last
    /// missing fragment of its id arrives.
    pub fn receive(&mut self, fragment: &[u8]) -> Result<Option<Completed>, FragmentError> {
        if fragment.len() < FRAME_LEN {
            return Err(FragmentError::Truncated);
        }
        let id = u32::from_be_bytes(fragment[0..4].try_into().unwrap());
        let seq = u16::from_be_bytes(fragment[4..6].try_into().unwrap());
        let total = u16::from_be_bytes(fragment[6..8].try_into().unwrap());
        if total == 0 || seq >= total {
            return Err(FragmentError::BadFrame);
        }

        let partial = self.pending.entry(id).or_insert_with(|| Partial {
            total,
            received: 0,
            chunks: vec![None; total as usize],
        });
        if partial.total != total {
            return Err(FragmentError::Inconsistent);
        }
        if partial.chunks[seq as usize].is_none() {
            partial.chunks[seq as usize] = Some(fragment[FRAME_LEN..].to_vec());
            partial.received += 1;
        }
        if partial.received < partial.total {
            return Ok(None);
        }

        let partial = self.pending.remove(&id).expect("entry just updated");
        let mut body = Vec::new();
        for chunk in partial.chunks {
            body.extend_from_slice(&chunk.expect("all fragments received"));
        }
        Ok(Some(Completed { id, body }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_fragment_round_trip() {
        let fragments = split(7, b"short", DEFAULT_MTU);
        assert_eq!(fragments.len(), 1);
        let mut r = Reassembler::new();
        let done = r.receive(&fragments[0]).unwrap().unwrap();
        assert_eq!(done.id, 7);
        assert_eq!(done.body, b"short");
    }

    #[test]
    fn multi_fragment_out_of_order() {
        let payload: Vec<u8> = (0..5000).map(|i| i as u8).collect();
        let mut fragments = split(99, &payload, 256);
        assert!(fragments.len() > 1);
        fragments.reverse();
        let mut r = Reassembler::new();
        let mut done = None;
        for frag in &fragments {
            if let Some(c) = r.receive(frag).unwrap() {
                done = Some(c);
            }
        }
        let done = done.expect("message should complete");
        assert_eq!(done.id, 99);
        assert_eq!(done.body, payload);
    }

    #[test]
    fn duplicate_fragments_are_ignored() {
        let payload = vec![1u8; 600];
        let fragments = split(5, &payload, 256);
        let mut r = Reassembler::new();
        assert!(r.receive(&fragments[0]).unwrap().is_none());
        assert!(r.receive(&fragments[0]).unwrap().is_none());
        let mut done = None;
        for frag in &fragments[1..] {
            if let Some(c) = r.receive(frag).unwrap() {
                done = Some(c);
            }
        }
        assert_eq!(done.unwrap().body, payload);
    }

    #[test]
    fn empty_payload_still_produces_one_fragment() {
        let fragments = split(3, &[], DEFAULT_MTU);
        assert_eq!(fragments.len(), 1);
        let mut r = Reassembler::new();
        let done = r.receive(&fragments[0]).unwrap().unwrap();
        assert!(done.body.is_empty());
    }

    #[test]
    fn malformed_fragments_are_rejected() {
        let mut r = Reassembler::new();
        assert_eq!(r.receive(&[1, 2, 3]), Err(FragmentError::Truncated));
        // seq >= total
        let mut bad = Vec::new();
        bad.extend_from_slice(&1u32.to_be_bytes());
        bad.extend_from_slice(&2u16.to_be_bytes());
        bad.extend_from_slice(&1u16.to_be_bytes());
        assert_eq!(r.receive(&bad), Err(FragmentError::BadFrame));
    }
}
