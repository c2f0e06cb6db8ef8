//! Inbound datagram dispatch.
//!
//! A datagram is parsed as one wire message. Compound and compress
//! messages are wrappers: their payload is unwrapped into one or more
//! fresh wire messages that are dispatched again with the same source
//! address. Everything else is decoded and handed to the matching
//! collaborator.
//!
//! Failures are scoped to the message that caused them. A bad part in a
//! compound batch is logged and skipped; its siblings are still handled.

use crate::ack::{AckRegistry, SequenceGenerator};
use crate::config::TransportConfig;
use crate::delegate::{Delegate, MembershipHandler};
use crate::outbound::{Outbound, SendError};
use crate::protocol::compound::{self, CompoundError};
use crate::protocol::compress::{self, CompressionError};
use crate::protocol::wire::{self, MessageType, VersionTable, WireError};
use crate::protocol::{addr, AckResp, Alive, Dead, IndirectPingReq, Ping, Suspect};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, warn};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Message nesting exceeds depth {0}")]
    TooDeep(usize),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("Failed to unpack compound message: {0}")]
    Compound(#[from] CompoundError),

    #[error("Failed to decompress message: {0}")]
    Compression(#[from] CompressionError),

    #[error("Failed to send reply: {0}")]
    Send(#[from] SendError),

    #[error("Invalid target address ({0} bytes)")]
    BadAddress(usize),

    #[error("{0} is not supported over UDP")]
    Unsupported(MessageType),
}

/// Demultiplexes inbound datagrams to their handlers.
pub struct Dispatcher {
    versions: VersionTable,
    udp_port: u16,
    probe_timeout: Duration,
    max_nesting_depth: usize,
    outbound: Arc<Outbound>,
    membership: Arc<dyn MembershipHandler>,
    delegate: Arc<dyn Delegate>,
    acks: Arc<AckRegistry>,
    seq: Arc<SequenceGenerator>,
}

impl Dispatcher {
    pub fn new(
        config: &TransportConfig,
        outbound: Arc<Outbound>,
        membership: Arc<dyn MembershipHandler>,
        delegate: Arc<dyn Delegate>,
        acks: Arc<AckRegistry>,
        seq: Arc<SequenceGenerator>,
    ) -> Self {
        Self {
            versions: *outbound.versions(),
            udp_port: config.udp_port,
            probe_timeout: config.probe_timeout,
            max_nesting_depth: config.max_nesting_depth,
            outbound,
            membership,
            delegate,
            acks,
            seq,
        }
    }

    /// Handle one raw datagram. Errors are logged, never returned.
    pub fn handle_datagram(&self, buf: &[u8], from: SocketAddr) {
        if let Err(e) = self.handle_command(buf, from, 0) {
            error!("Failed to handle message from {}: {}", from, e);
        }
    }

    /// Dispatch one wire message. `depth` counts the wrappers already unwrapped.
    fn handle_command(&self, buf: &[u8], from: SocketAddr, depth: usize) -> Result<(), DispatchError> {
        let (kind, body) = wire::split_header(buf, &self.versions)?;
        debug!("Received {} ({} bytes) from {}", kind, buf.len(), from);

        match kind {
            MessageType::Compound => self.handle_compound(body, from, depth),
            MessageType::Compress => self.handle_compressed(body, from, depth),
            MessageType::Ping => self.handle_ping(body, from),
            MessageType::IndirectPing => self.handle_indirect_ping(body, from),
            MessageType::Ack => self.handle_ack(body, from),
            MessageType::Suspect => {
                self.membership.on_suspect(wire::decode::<Suspect>(body)?);
                Ok(())
            }
            MessageType::Alive => {
                self.membership.on_alive(wire::decode::<Alive>(body)?);
                Ok(())
            }
            MessageType::Dead => {
                self.membership.on_dead(wire::decode::<Dead>(body)?);
                Ok(())
            }
            MessageType::User => {
                self.delegate.notify_msg(body);
                Ok(())
            }
            MessageType::PushPull => Err(DispatchError::Unsupported(kind)),
        }
    }

    fn check_depth(&self, depth: usize) -> Result<(), DispatchError> {
        if depth >= self.max_nesting_depth {
            return Err(DispatchError::TooDeep(self.max_nesting_depth));
        }
        Ok(())
    }

    fn handle_compound(&self, body: &[u8], from: SocketAddr, depth: usize) -> Result<(), DispatchError> {
        self.check_depth(depth)?;
        let unpacked = compound::unpack(body)?;

        if unpacked.truncated > 0 {
            warn!(
                "Compound message from {} had {} truncated parts",
                from, unpacked.truncated
            );
        }

        for part in unpacked.parts {
            if let Err(e) = self.handle_command(part, from, depth + 1) {
                error!("Failed to handle compound part from {}: {}", from, e);
            }
        }
        Ok(())
    }

    fn handle_compressed(&self, body: &[u8], from: SocketAddr, depth: usize) -> Result<(), DispatchError> {
        self.check_depth(depth)?;
        let inner = compress::decompress_payload(body)?;
        self.handle_command(&inner, from, depth + 1)
    }

    fn handle_ping(&self, body: &[u8], from: SocketAddr) -> Result<(), DispatchError> {
        let ping: Ping = wire::decode(body)?;
        let ack = AckResp {
            seq_no: ping.seq_no,
        };
        self.outbound.encode_and_send(from, MessageType::Ack, &ack)?;
        Ok(())
    }

    /// Probe the requested target and relay its ack back under the caller's sequence number.
    fn handle_indirect_ping(&self, body: &[u8], from: SocketAddr) -> Result<(), DispatchError> {
        let req: IndirectPingReq = wire::decode(body)?;
        let target = addr::decode_addr(&req.target, self.udp_port)
            .ok_or(DispatchError::BadAddress(req.target.len()))?;

        let local_seq = self.seq.next();
        let original = AckResp { seq_no: req.seq_no };
        let outbound = Arc::clone(&self.outbound);
        self.acks.register(
            local_seq,
            move || {
                if let Err(e) = outbound.encode_and_send(from, MessageType::Ack, &original) {
                    error!("Failed to forward ack to {}: {}", from, e);
                }
            },
            self.probe_timeout,
        );

        debug!(
            "Relaying probe {} for {} to {} as {}",
            req.seq_no, from, target, local_seq
        );
        let ping = Ping { seq_no: local_seq };
        self.outbound.encode_and_send(target, MessageType::Ping, &ping)?;
        Ok(())
    }

    fn handle_ack(&self, body: &[u8], from: SocketAddr) -> Result<(), DispatchError> {
        let ack: AckResp = wire::decode(body)?;
        if !self.acks.invoke(ack.seq_no) {
            debug!("No pending handler for ack {} from {}", ack.seq_no, from);
        }
        Ok(())
    }
}
