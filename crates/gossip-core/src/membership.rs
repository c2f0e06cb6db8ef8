//! Node table for tracking cluster members.
//!
//! A minimal membership handler so a node can run on its own. It keeps
//! one row per known node and applies the usual incarnation rules:
//! - Alive wins only with a newer incarnation (or for an unknown node)
//! - Suspect and Dead win with the same or a newer incarnation
//! - Claims that we are suspect or dead are refuted by bumping our own
//!   incarnation and gossiping Alive
//!
//! Accepted changes are re-encoded and queued for piggybacking when a
//! broadcast queue is attached.

use crate::broadcast::TransmitQueue;
use crate::delegate::MembershipHandler;
use crate::protocol::wire::{self, MessageType, VersionTable};
use crate::protocol::{Alive, Dead, NodeStateKind, PushNodeState, Suspect, META_MAX_SIZE};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A member row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeState {
    pub name: String,
    pub addr: Vec<u8>,
    pub meta: Vec<u8>,
    pub incarnation: u32,
    pub state: NodeStateKind,
}

impl NodeState {
    fn to_push(&self) -> PushNodeState {
        PushNodeState {
            name: self.name.clone(),
            addr: self.addr.clone(),
            meta: self.meta.clone(),
            incarnation: self.incarnation,
            state: self.state,
        }
    }

    fn to_alive(&self) -> Alive {
        Alive {
            incarnation: self.incarnation,
            node: self.name.clone(),
            addr: self.addr.clone(),
            meta: self.meta.clone(),
        }
    }
}

#[derive(Default)]
struct Rows {
    /// Rows in insertion order, which is also snapshot order
    nodes: Vec<NodeState>,
    index: HashMap<String, usize>,
}

impl Rows {
    fn get_mut(&mut self, name: &str) -> Option<&mut NodeState> {
        let idx = *self.index.get(name)?;
        self.nodes.get_mut(idx)
    }

    fn insert(&mut self, node: NodeState) {
        self.index.insert(node.name.clone(), self.nodes.len());
        self.nodes.push(node);
    }
}

/// Outcome of applying one membership message.
enum Change {
    None,
    Updated,
    Refuted(Alive),
}

/// `RwLock`-guarded member table.
pub struct NodeTable {
    local_name: String,
    rows: RwLock<Rows>,
    gossip: Option<(Arc<TransmitQueue>, VersionTable)>,
}

impl NodeTable {
    /// Create a table containing only the local node, alive at `incarnation`.
    pub fn new(local_name: impl Into<String>, local_addr: Vec<u8>, incarnation: u32) -> Self {
        let local_name = local_name.into();
        let mut rows = Rows::default();
        rows.insert(NodeState {
            name: local_name.clone(),
            addr: local_addr,
            meta: Vec::new(),
            incarnation,
            state: NodeStateKind::Alive,
        });
        Self {
            local_name,
            rows: RwLock::new(rows),
            gossip: None,
        }
    }

    /// Queue accepted changes on `queue` for dissemination.
    pub fn with_broadcasts(mut self, queue: Arc<TransmitQueue>, versions: VersionTable) -> Self {
        self.gossip = Some((queue, versions));
        self
    }

    /// Set the local node's metadata. Longer values are rejected.
    pub fn set_local_meta(&self, meta: Vec<u8>) -> bool {
        if meta.len() > META_MAX_SIZE {
            warn!("Node metadata of {} bytes exceeds {}", meta.len(), META_MAX_SIZE);
            return false;
        }
        if let Some(local) = self.rows.write().get_mut(&self.local_name) {
            local.meta = meta;
        }
        true
    }

    pub fn local_name(&self) -> &str {
        &self.local_name
    }

    /// The local node's row.
    pub fn local_node(&self) -> Option<NodeState> {
        self.get(&self.local_name)
    }

    pub fn get(&self, name: &str) -> Option<NodeState> {
        let rows = self.rows.read();
        rows.index.get(name).and_then(|&idx| rows.nodes.get(idx)).cloned()
    }

    /// All rows, local node included.
    pub fn members(&self) -> Vec<NodeState> {
        self.rows.read().nodes.clone()
    }

    /// Number of rows in the given state.
    pub fn count(&self, state: NodeStateKind) -> usize {
        self.rows.read().nodes.iter().filter(|n| n.state == state).count()
    }

    pub fn len(&self) -> usize {
        self.rows.read().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().nodes.is_empty()
    }

    /// Queue our own Alive for dissemination.
    pub fn announce(&self) {
        if let Some(local) = self.local_node() {
            self.gossip(MessageType::Alive, &local.to_alive());
        }
    }

    fn gossip<T: Serialize>(&self, kind: MessageType, msg: &T) {
        let Some((queue, versions)) = &self.gossip else {
            return;
        };
        match wire::encode(versions, kind, msg) {
            Ok(buf) => queue.push(buf),
            Err(e) => warn!("Failed to encode {} broadcast: {}", kind, e),
        }
    }

    fn apply_alive(&self, msg: &Alive) -> Change {
        if msg.node == self.local_name {
            return Change::None;
        }
        let mut rows = self.rows.write();
        match rows.get_mut(&msg.node) {
            Some(existing) if msg.incarnation <= existing.incarnation => Change::None,
            Some(existing) => {
                existing.incarnation = msg.incarnation;
                existing.addr = msg.addr.clone();
                existing.meta = msg.meta.clone();
                existing.state = NodeStateKind::Alive;
                Change::Updated
            }
            None => {
                info!("Node {} joined", msg.node);
                rows.insert(NodeState {
                    name: msg.node.clone(),
                    addr: msg.addr.clone(),
                    meta: msg.meta.clone(),
                    incarnation: msg.incarnation,
                    state: NodeStateKind::Alive,
                });
                Change::Updated
            }
        }
    }

    /// Apply a suspect or dead claim.
    fn apply_failure(&self, node: &str, incarnation: u32, to: NodeStateKind) -> Change {
        let mut rows = self.rows.write();
        let Some(existing) = rows.get_mut(node) else {
            return Change::None;
        };
        if incarnation < existing.incarnation {
            return Change::None;
        }

        if node == self.local_name {
            existing.incarnation = incarnation.wrapping_add(1);
            warn!(
                "Refuting {:?} claim about ourselves, incarnation now {}",
                to, existing.incarnation
            );
            return Change::Refuted(existing.to_alive());
        }

        match (existing.state, to) {
            (NodeStateKind::Dead, _) | (NodeStateKind::Suspect, NodeStateKind::Suspect) => Change::None,
            _ => {
                debug!("Marking {} as {:?} at incarnation {}", node, to, incarnation);
                existing.incarnation = incarnation;
                existing.state = to;
                Change::Updated
            }
        }
    }

    fn finish_failure<T: Serialize>(&self, change: Change, kind: MessageType, msg: &T) {
        match change {
            Change::None => {}
            Change::Updated => self.gossip(kind, msg),
            Change::Refuted(alive) => self.gossip(MessageType::Alive, &alive),
        }
    }
}

impl MembershipHandler for NodeTable {
    fn on_suspect(&self, msg: Suspect) {
        let change = self.apply_failure(&msg.node, msg.incarnation, NodeStateKind::Suspect);
        self.finish_failure(change, MessageType::Suspect, &msg);
    }

    fn on_alive(&self, msg: Alive) {
        if let Change::Updated = self.apply_alive(&msg) {
            self.gossip(MessageType::Alive, &msg);
        }
    }

    fn on_dead(&self, msg: Dead) {
        let change = self.apply_failure(&msg.node, msg.incarnation, NodeStateKind::Dead);
        self.finish_failure(change, MessageType::Dead, &msg);
    }

    fn snapshot_nodes(&self) -> Vec<PushNodeState> {
        self.rows.read().nodes.iter().map(NodeState::to_push).collect()
    }

    fn merge_remote_nodes(&self, nodes: Vec<PushNodeState>) {
        for node in nodes {
            match node.state {
                NodeStateKind::Alive => self.on_alive(Alive {
                    incarnation: node.incarnation,
                    node: node.name,
                    addr: node.addr,
                    meta: node.meta,
                }),
                // A remote Dead is only a suspicion to us until our own probes agree
                NodeStateKind::Suspect | NodeStateKind::Dead => self.on_suspect(Suspect {
                    incarnation: node.incarnation,
                    node: node.name,
                }),
            }
        }
    }
}
