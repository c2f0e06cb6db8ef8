//! Payload structs for each message type.
//!
//! These are transient: built right before encoding or right after
//! decoding, then handed to the next stage. Sequence numbers and
//! incarnations are carried through untouched.

use serde::{Deserialize, Serialize};

/// Maximum size for node metadata.
pub const META_MAX_SIZE: usize = 128;

/// Direct liveness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    pub seq_no: u32,
}

/// Ask the recipient to probe `target` on our behalf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndirectPingReq {
    pub seq_no: u32,
    /// Raw address bytes, see [`super::addr`]
    pub target: Vec<u8>,
}

/// Response to a ping, matched by sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckResp {
    pub seq_no: u32,
}

/// Broadcast when we suspect a node is dead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suspect {
    pub incarnation: u32,
    pub node: String,
}

/// Broadcast when we know a node is alive. Also used for joins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alive {
    pub incarnation: u32,
    pub node: String,
    pub addr: Vec<u8>,
    pub meta: Vec<u8>,
}

/// Broadcast when we confirm a node is dead. Also used for leaving.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dead {
    pub incarnation: u32,
    pub node: String,
}

/// Tells the other side how many node states and user bytes follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushPullHeader {
    pub nodes: u32,
    pub user_state_len: u32,
}

/// Lifecycle state of a node as seen by the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeStateKind {
    Alive,
    Suspect,
    Dead,
}

/// One row of a full-state push/pull exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushNodeState {
    pub name: String,
    pub addr: Vec<u8>,
    pub meta: Vec<u8>,
    pub incarnation: u32,
    pub state: NodeStateKind,
}

impl PushNodeState {
    /// Create an alive row.
    pub fn alive(name: impl Into<String>, addr: Vec<u8>, incarnation: u32) -> Self {
        Self {
            name: name.into(),
            addr,
            meta: Vec::new(),
            incarnation,
            state: NodeStateKind::Alive,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::wire::{self, MessageType, VersionTable};

    #[test]
    fn test_alive_preserves_fields() {
        let versions = VersionTable::current();
        let alive = Alive {
            incarnation: u32::MAX,
            node: "node-a".into(),
            addr: vec![127, 0, 0, 1, 0x1f, 0x0a],
            meta: vec![0xAB; META_MAX_SIZE],
        };

        let encoded = wire::encode(&versions, MessageType::Alive, &alive).unwrap();
        let (kind, body) = wire::split_header(&encoded, &versions).unwrap();
        assert_eq!(kind, MessageType::Alive);

        let decoded: Alive = wire::decode(body).unwrap();
        assert_eq!(decoded, alive);
    }

    #[test]
    fn test_push_node_state_stream_decode() {
        let rows = vec![
            PushNodeState::alive("a", vec![10, 0, 0, 1], 1),
            PushNodeState {
                state: NodeStateKind::Dead,
                ..PushNodeState::alive("b", vec![10, 0, 0, 2], 7)
            },
        ];
        let mut buf = Vec::new();
        for row in &rows {
            wire::encode_into(&mut buf, row).unwrap();
        }

        let mut reader = &buf[..];
        let first: PushNodeState = wire::decode_from(&mut reader).unwrap();
        let second: PushNodeState = wire::decode_from(&mut reader).unwrap();
        assert_eq!(vec![first, second], rows);
        assert!(reader.is_empty());
    }

    #[test]
    fn test_suspect_wrong_payload_fails() {
        // A ping body is too short to be a suspect message
        let result: Result<Suspect, _> = wire::decode(&[1, 0, 0, 0]);
        assert!(result.is_err());
    }
}
