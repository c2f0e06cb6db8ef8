//! Recording collaborator fakes for tests.

use crate::delegate::{Delegate, MembershipHandler, PacketTransport};
use crate::protocol::{Alive, Dead, PushNodeState, Suspect};
use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;

/// Packet transport that records every datagram instead of sending it.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
    fail: bool,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport whose every write fails.
    pub fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    /// Drain the recorded datagrams.
    pub fn take(&self) -> Vec<(SocketAddr, Vec<u8>)> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }
}

impl PacketTransport for RecordingTransport {
    fn write_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<()> {
        if self.fail {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "write refused"));
        }
        self.sent.lock().push((addr, buf.to_vec()));
        Ok(())
    }
}

/// Membership event seen by [`RecordingMembership`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    Suspect(Suspect),
    Alive(Alive),
    Dead(Dead),
    Merged(Vec<PushNodeState>),
}

/// Membership handler with a fixed snapshot that records what it receives.
#[derive(Default)]
pub struct RecordingMembership {
    nodes: Vec<PushNodeState>,
    events: Mutex<Vec<MembershipEvent>>,
}

impl RecordingMembership {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `nodes` from [`MembershipHandler::snapshot_nodes`].
    pub fn with_nodes(nodes: Vec<PushNodeState>) -> Self {
        Self {
            nodes,
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<MembershipEvent> {
        self.events.lock().clone()
    }
}

impl MembershipHandler for RecordingMembership {
    fn on_suspect(&self, msg: Suspect) {
        self.events.lock().push(MembershipEvent::Suspect(msg));
    }

    fn on_alive(&self, msg: Alive) {
        self.events.lock().push(MembershipEvent::Alive(msg));
    }

    fn on_dead(&self, msg: Dead) {
        self.events.lock().push(MembershipEvent::Dead(msg));
    }

    fn snapshot_nodes(&self) -> Vec<PushNodeState> {
        self.nodes.clone()
    }

    fn merge_remote_nodes(&self, nodes: Vec<PushNodeState>) {
        self.events.lock().push(MembershipEvent::Merged(nodes));
    }
}

/// Delegate with fixed local state that records remote state and user messages.
#[derive(Default)]
pub struct RecordingDelegate {
    local: Vec<u8>,
    remote_states: Mutex<Vec<Vec<u8>>>,
    messages: Mutex<Vec<Vec<u8>>>,
}

impl RecordingDelegate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_local_state(local: Vec<u8>) -> Self {
        Self {
            local,
            ..Self::default()
        }
    }

    pub fn remote_states(&self) -> Vec<Vec<u8>> {
        self.remote_states.lock().clone()
    }

    pub fn messages(&self) -> Vec<Vec<u8>> {
        self.messages.lock().clone()
    }
}

impl Delegate for RecordingDelegate {
    fn local_state(&self) -> Vec<u8> {
        self.local.clone()
    }

    fn merge_remote_state(&self, buf: &[u8]) {
        self.remote_states.lock().push(buf.to_vec());
    }

    fn notify_msg(&self, msg: &[u8]) {
        self.messages.lock().push(msg.to_vec());
    }
}
