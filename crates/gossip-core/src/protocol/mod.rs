//! Wire protocol for cluster membership traffic.
//!
//! This module defines what goes on the wire:
//! - Two byte `[type, version]` header and version table ([`wire`])
//! - Payload structs for each message type ([`messages`])
//! - Compound batching of several messages per datagram ([`compound`])
//! - Compression wrapping ([`compress`])
//! - Raw address encoding ([`addr`])

pub mod addr;
pub mod compound;
pub mod compress;
pub mod messages;
pub mod wire;

pub use addr::{decode_addr, encode_addr};
pub use compound::{CompoundError, COMPOUND_HEADER_OVERHEAD, COMPOUND_PART_OVERHEAD};
pub use compress::{CompressionAlgo, CompressionError};
pub use messages::{
    AckResp, Alive, Dead, IndirectPingReq, NodeStateKind, Ping, PushNodeState, PushPullHeader,
    Suspect, META_MAX_SIZE,
};
pub use wire::{MessageType, MessageVersion, VersionTable, WireError, HEADER_LEN};
