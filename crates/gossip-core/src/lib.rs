//! gossip-core: Wire protocol and message dispatch for SWIM-style cluster membership.
//!
//! This crate provides everything that does not own a socket:
//! - Message framing, compound batching and compression ([`protocol`])
//! - Inbound datagram dispatch and indirect probe relay ([`dispatch`])
//! - Outbound piggybacking pipeline ([`outbound`])
//! - Push/pull full state exchange over any blocking stream ([`pushpull`])
//! - Collaborator traits plus minimal node table and broadcast queue

pub mod ack;
pub mod broadcast;
pub mod config;
pub mod delegate;
pub mod dispatch;
pub mod membership;
pub mod outbound;
pub mod protocol;
pub mod pushpull;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use ack::{AckRegistry, SequenceGenerator};
pub use broadcast::TransmitQueue;
pub use config::TransportConfig;
pub use delegate::{BroadcastSource, Delegate, MembershipHandler, NoBroadcasts, NoopDelegate, PacketTransport};
pub use dispatch::{DispatchError, Dispatcher};
pub use membership::{NodeState, NodeTable};
pub use outbound::{Outbound, SendError};
pub use protocol::{MessageType, NodeStateKind, PushNodeState, VersionTable};
pub use pushpull::{PushPullError, RemoteState, StateExchange};
