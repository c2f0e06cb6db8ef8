//! Collaborator traits injected into the transport.
//!
//! The transport moves bytes; everything that decides what those bytes
//! mean for cluster state lives behind these traits:
//! - [`MembershipHandler`]: the membership state machine and node table
//! - [`BroadcastSource`]: the queue of pending gossip to piggyback
//! - [`Delegate`]: the user extension point for opaque payloads
//! - [`PacketTransport`]: the datagram socket write path

use crate::protocol::{Alive, Dead, PushNodeState, Suspect};
use std::io;
use std::net::SocketAddr;

/// Receives membership messages and owns the node table.
///
/// Incarnation ordering is the implementor's concern; values arrive
/// exactly as they were sent.
pub trait MembershipHandler: Send + Sync {
    fn on_suspect(&self, msg: Suspect);

    fn on_alive(&self, msg: Alive);

    fn on_dead(&self, msg: Dead);

    /// Snapshot every known node, in table order.
    fn snapshot_nodes(&self) -> Vec<PushNodeState>;

    /// Merge the node list received from a push/pull exchange.
    fn merge_remote_nodes(&self, nodes: Vec<PushNodeState>);
}

/// Source of pending broadcasts to piggyback on outgoing datagrams.
pub trait BroadcastSource: Send + Sync {
    /// Take as many pre-encoded messages as fit in `limit` bytes, where
    /// each message costs its own length plus `overhead`.
    fn take_broadcasts(&self, overhead: usize, limit: usize) -> Vec<Vec<u8>>;
}

/// User extension point for opaque state and messages.
pub trait Delegate: Send + Sync {
    /// Opaque local state to send during a push/pull exchange.
    fn local_state(&self) -> Vec<u8>;

    /// Remote opaque state received during a push/pull exchange.
    fn merge_remote_state(&self, buf: &[u8]);

    /// A user message arrived. `msg` is exactly what the sender passed in.
    fn notify_msg(&self, msg: &[u8]);
}

/// Datagram write path.
///
/// Must not block: it is called inline from the receive loop.
pub trait PacketTransport: Send + Sync {
    fn write_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<()>;
}

/// Delegate that carries no user state and ignores user messages.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDelegate;

impl Delegate for NoopDelegate {
    fn local_state(&self) -> Vec<u8> {
        Vec::new()
    }

    fn merge_remote_state(&self, _buf: &[u8]) {}

    fn notify_msg(&self, _msg: &[u8]) {}
}

/// Broadcast source that never has anything queued.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoBroadcasts;

impl BroadcastSource for NoBroadcasts {
    fn take_broadcasts(&self, _overhead: usize, _limit: usize) -> Vec<Vec<u8>> {
        Vec::new()
    }
}
