//! Outbound datagram pipeline.
//!
//! Every message we send is a free carrier for pending gossip: before
//! writing, we ask the broadcast source for whatever fits in the rest of
//! the datagram budget and pack it all into one compound message. If
//! compression is enabled the final bytes are compressed just before the
//! socket write.

use crate::config::TransportConfig;
use crate::delegate::{BroadcastSource, PacketTransport};
use crate::protocol::compound::{self, CompoundError};
use crate::protocol::compress;
use crate::protocol::wire::{self, MessageType, VersionTable, WireError};
use crate::protocol::{COMPOUND_HEADER_OVERHEAD, COMPOUND_PART_OVERHEAD};
use serde::Serialize;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum SendError {
    #[error("Failed to encode message: {0}")]
    Encode(#[from] WireError),

    #[error("Failed to build compound message: {0}")]
    Compound(#[from] CompoundError),

    #[error("Failed to write datagram: {0}")]
    Io(#[from] io::Error),
}

/// Builds and writes outgoing datagrams.
pub struct Outbound {
    versions: VersionTable,
    udp_send_budget: usize,
    enable_compression: bool,
    transport: Arc<dyn PacketTransport>,
    broadcasts: Arc<dyn BroadcastSource>,
}

impl Outbound {
    pub fn new(
        config: &TransportConfig,
        versions: VersionTable,
        transport: Arc<dyn PacketTransport>,
        broadcasts: Arc<dyn BroadcastSource>,
    ) -> Self {
        Self {
            versions,
            udp_send_budget: config.udp_send_budget,
            enable_compression: config.enable_compression,
            transport,
            broadcasts,
        }
    }

    /// Version table used to encode outgoing messages.
    pub fn versions(&self) -> &VersionTable {
        &self.versions
    }

    /// Encode `msg` as `kind` and send it.
    pub fn encode_and_send<T: Serialize>(
        &self,
        to: SocketAddr,
        kind: MessageType,
        msg: &T,
    ) -> Result<(), SendError> {
        let out = wire::encode(&self.versions, kind, msg)?;
        self.send_msg(to, &out)
    }

    /// Send an opaque user payload. The receiver's delegate sees exactly `payload`.
    pub fn send_user_msg(&self, to: SocketAddr, payload: &[u8]) -> Result<(), SendError> {
        let mut out = self.versions.header(MessageType::User).to_vec();
        out.extend_from_slice(payload);
        self.send_msg(to, &out)
    }

    /// Send an encoded message, piggybacking any broadcasts that fit.
    pub fn send_msg(&self, to: SocketAddr, msg: &[u8]) -> Result<(), SendError> {
        // The carrier needs its own length table entry once compounded
        let bytes_avail = self
            .udp_send_budget
            .saturating_sub(msg.len() + COMPOUND_HEADER_OVERHEAD + COMPOUND_PART_OVERHEAD);
        let extra = self
            .broadcasts
            .take_broadcasts(COMPOUND_PART_OVERHEAD, bytes_avail);

        // Fast path if nothing to piggyback
        if extra.is_empty() {
            return self.raw_send_msg(to, msg);
        }

        debug!("Piggybacking {} broadcast(s) to {}", extra.len(), to);
        let mut msgs: Vec<&[u8]> = Vec::with_capacity(1 + extra.len());
        msgs.push(msg);
        msgs.extend(extra.iter().map(Vec::as_slice));

        for compound in compound::pack_many(&self.versions, &msgs)? {
            self.raw_send_msg(to, &compound)?;
        }
        Ok(())
    }

    /// Write a datagram without piggybacking, compressing it if enabled.
    ///
    /// A compression failure falls back to the uncompressed bytes.
    pub fn raw_send_msg(&self, to: SocketAddr, msg: &[u8]) -> Result<(), SendError> {
        if self.enable_compression {
            match compress::compress_payload(&self.versions, msg) {
                Ok(compressed) => {
                    self.transport.write_to(&compressed, to)?;
                    return Ok(());
                }
                Err(e) => warn!("Failed to compress payload: {}", e),
            }
        }
        self.transport.write_to(msg, to)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::TransmitQueue;
    use crate::delegate::NoBroadcasts;
    use crate::protocol::messages::{AckResp, Ping};
    use crate::protocol::HEADER_LEN;
    use crate::config::UDP_SEND_BUF as UDP_BUDGET;
    use crate::testing::RecordingTransport;

    fn dest() -> SocketAddr {
        "127.0.0.1:7946".parse().unwrap()
    }

    fn outbound(
        config: TransportConfig,
        transport: &Arc<RecordingTransport>,
        broadcasts: Arc<dyn BroadcastSource>,
    ) -> Outbound {
        Outbound::new(
            &config,
            VersionTable::current(),
            Arc::clone(transport) as Arc<dyn PacketTransport>,
            broadcasts,
        )
    }

    fn ping_bytes(seq_no: u32) -> Vec<u8> {
        wire::encode(&VersionTable::current(), MessageType::Ping, &Ping { seq_no }).unwrap()
    }

    // ==================== Piggybacking ====================

    #[test]
    fn test_sends_alone_without_broadcasts() {
        let transport = Arc::new(RecordingTransport::new());
        let out = outbound(TransportConfig::default(), &transport, Arc::new(NoBroadcasts));

        out.send_msg(dest(), &ping_bytes(1)).unwrap();

        let sent = transport.take();
        assert_eq!(sent, vec![(dest(), ping_bytes(1))]);
    }

    #[test]
    fn test_piggybacks_into_compound() {
        let transport = Arc::new(RecordingTransport::new());
        let queue = Arc::new(TransmitQueue::new());
        queue.push(ping_bytes(100));
        queue.push(ping_bytes(101));
        let out = outbound(TransportConfig::default(), &transport, queue.clone());

        out.send_msg(dest(), &ping_bytes(1)).unwrap();

        let sent = transport.take();
        assert_eq!(sent.len(), 1);
        let (kind, body) = wire::split_header(&sent[0].1, &VersionTable::current()).unwrap();
        assert_eq!(kind, MessageType::Compound);

        let unpacked = compound::unpack(body).unwrap();
        assert_eq!(unpacked.truncated, 0);
        assert_eq!(
            unpacked.parts,
            vec![&ping_bytes(1)[..], &ping_bytes(100)[..], &ping_bytes(101)[..]]
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn test_respects_budget() {
        let transport = Arc::new(RecordingTransport::new());
        let queue = Arc::new(TransmitQueue::new());
        queue.push(vec![8, 0, 1, 2, 3, 4, 5, 6, 7, 8]);
        let config = TransportConfig {
            // msg (6) + compound header (3) + its length (2) leaves 9, the broadcast needs 12
            udp_send_budget: 20,
            ..TransportConfig::default()
        };
        let out = outbound(config, &transport, queue.clone());

        out.send_msg(dest(), &ping_bytes(1)).unwrap();

        assert_eq!(transport.take(), vec![(dest(), ping_bytes(1))]);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_full_piggyback_stays_within_budget() {
        let versions = VersionTable::current();
        let carrier = ping_bytes(1);
        // Header (3) + two length entries (4) + carrier leaves this much for one broadcast
        let room = UDP_BUDGET - COMPOUND_HEADER_OVERHEAD - 2 * COMPOUND_PART_OVERHEAD - carrier.len();

        let transport = Arc::new(RecordingTransport::new());
        let queue = Arc::new(TransmitQueue::new());
        queue.push(vec![0xAB; room]);
        let out = outbound(TransportConfig::default(), &transport, queue.clone());
        out.send_msg(dest(), &carrier).unwrap();

        let sent = transport.take();
        assert_eq!(sent[0].1.len(), UDP_BUDGET);
        let (kind, _) = wire::split_header(&sent[0].1, &versions).unwrap();
        assert_eq!(kind, MessageType::Compound);
        assert!(queue.is_empty());

        // One byte more and the broadcast waits for another carrier
        queue.push(vec![0xAB; room + 1]);
        out.send_msg(dest(), &carrier).unwrap();

        let sent = transport.take();
        assert_eq!(sent, vec![(dest(), carrier)]);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_oversized_message_still_sent() {
        let transport = Arc::new(RecordingTransport::new());
        let queue = Arc::new(TransmitQueue::new());
        queue.push(ping_bytes(5));
        let config = TransportConfig {
            udp_send_budget: 4,
            ..TransportConfig::default()
        };
        let out = outbound(config, &transport, queue);

        out.send_msg(dest(), &ping_bytes(1)).unwrap();
        assert_eq!(transport.take(), vec![(dest(), ping_bytes(1))]);
    }

    // ==================== Compression ====================

    #[test]
    fn test_compresses_final_bytes() {
        let transport = Arc::new(RecordingTransport::new());
        let config = TransportConfig::default().with_compression(true);
        let out = outbound(config, &transport, Arc::new(NoBroadcasts));

        out.encode_and_send(dest(), MessageType::Ack, &AckResp { seq_no: 9 })
            .unwrap();

        let sent = transport.take();
        let (kind, body) = wire::split_header(&sent[0].1, &VersionTable::current()).unwrap();
        assert_eq!(kind, MessageType::Compress);

        let inner = compress::decompress_payload(body).unwrap();
        let (kind, body) = wire::split_header(&inner, &VersionTable::current()).unwrap();
        assert_eq!(kind, MessageType::Ack);
        assert_eq!(wire::decode::<AckResp>(body).unwrap(), AckResp { seq_no: 9 });
    }

    // ==================== User messages ====================

    #[test]
    fn test_user_msg_is_raw() {
        let transport = Arc::new(RecordingTransport::new());
        let out = outbound(TransportConfig::default(), &transport, Arc::new(NoBroadcasts));

        out.send_user_msg(dest(), b"hello").unwrap();

        let sent = transport.take();
        assert_eq!(sent[0].1[0], MessageType::User.as_u8());
        assert_eq!(&sent[0].1[HEADER_LEN..], b"hello");
    }

    #[test]
    fn test_transport_error_propagates() {
        let transport = Arc::new(RecordingTransport::failing());
        let out = outbound(TransportConfig::default(), &transport, Arc::new(NoBroadcasts));

        let err = out.send_msg(dest(), &ping_bytes(1)).unwrap_err();
        assert!(matches!(err, SendError::Io(_)));
    }
}
