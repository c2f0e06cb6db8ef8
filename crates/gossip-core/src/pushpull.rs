//! Push/pull anti-entropy exchange.
//!
//! Both sides of a stream connection send the same frame:
//!
//! ```text
//! [push-pull, version] PushPullHeader PushNodeState * nodes user_state_len raw bytes
//! ```
//!
//! optionally wrapped whole in a compress message. The initiator sends
//! first and then reads; the responder reads first and then sends. This
//! module only deals with `Read`/`Write` so it runs over any blocking
//! stream, including in-memory buffers in tests.

use crate::config::TransportConfig;
use crate::delegate::{Delegate, MembershipHandler};
use crate::protocol::compress::{self, Compressed, CompressionError};
use crate::protocol::wire::{self, MessageType, VersionTable, WireError, HEADER_LEN};
use crate::protocol::{PushNodeState, PushPullHeader};
use std::io::{self, BufReader, Cursor, ErrorKind, Read, Write};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error};

/// Largest opaque user state accepted from a peer.
pub const MAX_USER_STATE: usize = 32 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum PushPullError {
    #[error("Connection error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("Failed to decompress remote state: {0}")]
    Compression(#[from] CompressionError),

    #[error("Expected a push-pull message, got type {0}")]
    InvalidMessageType(u8),

    #[error("Failed to decode node {} of {expected}: {source}", .decoded.len() + 1)]
    ShortNodeRead {
        /// Rows decoded before the failure
        decoded: Vec<PushNodeState>,
        expected: u32,
        source: WireError,
    },

    #[error("State too large to exchange: {0} bytes")]
    StateTooLarge(usize),

    #[error("Failed to read remote user state, got {read} of {expected} bytes")]
    ShortUserState { read: usize, expected: usize },
}

impl PushPullError {
    /// Node rows decoded before a short read, if any.
    pub fn partial_nodes(&self) -> &[PushNodeState] {
        match self {
            Self::ShortNodeRead { decoded, .. } => decoded,
            _ => &[],
        }
    }
}

/// State received from the other side of an exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteState {
    pub nodes: Vec<PushNodeState>,
    pub user_state: Vec<u8>,
}

/// Encode a complete push/pull frame.
///
/// The frame is compressed when `compression` is set. A compression
/// failure falls back to the plain frame.
pub fn encode_local_state(
    versions: &VersionTable,
    nodes: &[PushNodeState],
    user_state: &[u8],
    compression: bool,
) -> Result<Vec<u8>, PushPullError> {
    let header = PushPullHeader {
        nodes: u32::try_from(nodes.len()).map_err(|_| PushPullError::StateTooLarge(nodes.len()))?,
        user_state_len: u32::try_from(user_state.len())
            .map_err(|_| PushPullError::StateTooLarge(user_state.len()))?,
    };

    let mut buf = wire::encode(versions, MessageType::PushPull, &header)?;
    for node in nodes {
        wire::encode_into(&mut buf, node)?;
    }
    buf.extend_from_slice(user_state);

    if compression {
        match compress::compress_payload(versions, &buf) {
            Ok(compressed) => return Ok(compressed),
            Err(e) => error!("Failed to compress local state: {}", e),
        }
    }
    Ok(buf)
}

/// Read one push/pull frame from `conn`.
///
/// On a short node read the rows decoded so far are returned inside the
/// error, see [`PushPullError::partial_nodes`].
pub fn read_remote_state<R: Read>(conn: R, versions: &VersionTable) -> Result<RemoteState, PushPullError> {
    let mut conn = BufReader::new(conn);
    let mut header = [0u8; HEADER_LEN];
    conn.read_exact(&mut header)?;

    if header[0] == MessageType::Compress.as_u8() {
        versions.check(header[0], header[1])?;
        let msg: Compressed = wire::decode_from(&mut conn)?;
        let mut inner = Cursor::new(compress::decompress_buffer(&msg)?);
        inner.read_exact(&mut header)?;
        return read_frame(header, inner, versions);
    }
    read_frame(header, conn, versions)
}

fn read_frame<R: Read>(
    header: [u8; HEADER_LEN],
    mut reader: R,
    versions: &VersionTable,
) -> Result<RemoteState, PushPullError> {
    if header[0] != MessageType::PushPull.as_u8() {
        return Err(PushPullError::InvalidMessageType(header[0]));
    }
    versions.check(header[0], header[1])?;

    let head: PushPullHeader = wire::decode_from(&mut reader)?;
    let mut nodes = Vec::with_capacity(head.nodes.min(1024) as usize);
    for _ in 0..head.nodes {
        match wire::decode_from::<PushNodeState, _>(&mut reader) {
            Ok(node) => nodes.push(node),
            Err(source) => {
                return Err(PushPullError::ShortNodeRead {
                    decoded: nodes,
                    expected: head.nodes,
                    source,
                });
            }
        }
    }

    let user_state = read_user_state(&mut reader, head.user_state_len as usize)?;
    Ok(RemoteState { nodes, user_state })
}

/// Read exactly `expected` bytes, tolerating partial reads until EOF.
fn read_user_state<R: Read>(reader: &mut R, expected: usize) -> Result<Vec<u8>, PushPullError> {
    if expected > MAX_USER_STATE {
        return Err(PushPullError::StateTooLarge(expected));
    }

    let mut buf = vec![0u8; expected];
    let mut read = 0;
    while read < expected {
        match reader.read(&mut buf[read..]) {
            Ok(0) => return Err(PushPullError::ShortUserState { read, expected }),
            Ok(n) => read += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(buf)
}

/// Runs push/pull exchanges against the local node table and delegate.
pub struct StateExchange {
    versions: VersionTable,
    enable_compression: bool,
    membership: Arc<dyn MembershipHandler>,
    delegate: Arc<dyn Delegate>,
}

impl StateExchange {
    pub fn new(
        config: &TransportConfig,
        versions: VersionTable,
        membership: Arc<dyn MembershipHandler>,
        delegate: Arc<dyn Delegate>,
    ) -> Self {
        Self {
            versions,
            enable_compression: config.enable_compression,
            membership,
            delegate,
        }
    }

    /// Snapshot local state and write it to `conn`.
    pub fn send_local_state<W: Write>(&self, conn: &mut W) -> Result<(), PushPullError> {
        let nodes = self.membership.snapshot_nodes();
        let user_state = self.delegate.local_state();
        let buf = encode_local_state(&self.versions, &nodes, &user_state, self.enable_compression)?;

        debug!(
            "Sending {} nodes and {} bytes of user state",
            nodes.len(),
            user_state.len()
        );
        conn.write_all(&buf)?;
        conn.flush()?;
        Ok(())
    }

    pub fn read_remote_state<R: Read>(&self, conn: R) -> Result<RemoteState, PushPullError> {
        read_remote_state(conn, &self.versions)
    }

    /// Hand received state to the membership handler and delegate.
    pub fn merge_remote(&self, remote: RemoteState) {
        debug!(
            "Merging {} remote nodes and {} bytes of user state",
            remote.nodes.len(),
            remote.user_state.len()
        );
        self.membership.merge_remote_nodes(remote.nodes);
        self.delegate.merge_remote_state(&remote.user_state);
    }

    /// Responder side: read, reply, then merge.
    ///
    /// Remote state is merged even if our reply could not be written; the
    /// write error is still returned.
    pub fn respond<S: Read + Write>(&self, conn: &mut S) -> Result<(), PushPullError> {
        let remote = self.read_remote_state(&mut *conn)?;
        let sent = self.send_local_state(conn);
        self.merge_remote(remote);
        sent
    }

    /// Initiator side: send, then read. The caller decides whether to merge.
    pub fn initiate<S: Read + Write>(&self, conn: &mut S) -> Result<RemoteState, PushPullError> {
        self.send_local_state(conn)?;
        self.read_remote_state(conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::NodeStateKind;
    use crate::testing::{MembershipEvent, RecordingDelegate, RecordingMembership};

    /// In-memory duplex stream: reads from `input`, writes to `output`.
    struct MemoryConn {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl MemoryConn {
        fn new(input: Vec<u8>) -> Self {
            Self {
                input: Cursor::new(input),
                output: Vec::new(),
            }
        }
    }

    impl Read for MemoryConn {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for MemoryConn {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Hands out one byte per read call.
    struct Trickle<R>(R);

    impl<R: Read> Read for Trickle<R> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let end = buf.len().min(1);
            self.0.read(&mut buf[..end])
        }
    }

    fn nodes(names: &[&str]) -> Vec<PushNodeState> {
        names
            .iter()
            .enumerate()
            .map(|(i, name)| PushNodeState::alive(*name, vec![10, 0, 0, i as u8, 0x1f, 0x0a], i as u32))
            .collect()
    }

    fn exchange(
        nodes: Vec<PushNodeState>,
        user_state: Vec<u8>,
        compression: bool,
    ) -> (StateExchange, Arc<RecordingMembership>, Arc<RecordingDelegate>) {
        let membership = Arc::new(RecordingMembership::with_nodes(nodes));
        let delegate = Arc::new(RecordingDelegate::with_local_state(user_state));
        let config = TransportConfig::default().with_compression(compression);
        let exchange = StateExchange::new(
            &config,
            VersionTable::current(),
            membership.clone(),
            delegate.clone(),
        );
        (exchange, membership, delegate)
    }

    fn frame(nodes: &[PushNodeState], user_state: &[u8]) -> Vec<u8> {
        encode_local_state(&VersionTable::current(), nodes, user_state, false).unwrap()
    }

    // ==================== Full exchange ====================

    fn run_exchange(compression: bool) {
        let (initiator, initiator_members, initiator_delegate) =
            exchange(nodes(&["a", "b"]), vec![7; 10], compression);
        let (responder, responder_members, responder_delegate) =
            exchange(nodes(&["c", "d", "e"]), Vec::new(), compression);

        // Initiator's opening frame
        let mut opening = Vec::new();
        initiator.send_local_state(&mut opening).unwrap();

        // Responder reads it, replies and merges
        let mut responder_conn = MemoryConn::new(opening);
        responder.respond(&mut responder_conn).unwrap();

        // Initiator sends again and reads the reply
        let mut initiator_conn = MemoryConn::new(responder_conn.output);
        let remote = initiator.initiate(&mut initiator_conn).unwrap();

        assert_eq!(remote.nodes, nodes(&["c", "d", "e"]));
        assert!(remote.user_state.is_empty());

        assert_eq!(
            responder_members.events(),
            vec![MembershipEvent::Merged(nodes(&["a", "b"]))]
        );
        assert_eq!(responder_delegate.remote_states(), vec![vec![7; 10]]);

        // Initiator has not merged anything yet
        assert!(initiator_members.events().is_empty());
        assert!(initiator_delegate.remote_states().is_empty());
    }

    #[test]
    fn test_exchange_plain() {
        run_exchange(false);
    }

    #[test]
    fn test_exchange_compressed() {
        run_exchange(true);
    }

    #[test]
    fn test_compressed_frame_is_wrapped() {
        let buf = encode_local_state(&VersionTable::current(), &nodes(&["a"]), b"xyz", true).unwrap();
        assert_eq!(buf[0], MessageType::Compress.as_u8());

        let remote = read_remote_state(&buf[..], &VersionTable::current()).unwrap();
        assert_eq!(remote.nodes, nodes(&["a"]));
        assert_eq!(remote.user_state, b"xyz".to_vec());
    }

    #[test]
    fn test_node_fields_preserved() {
        let node = PushNodeState {
            name: "node-x".into(),
            addr: vec![192, 168, 1, 1, 0x1f, 0x0a],
            meta: vec![1, 2, 3, 4],
            incarnation: u32::MAX,
            state: NodeStateKind::Suspect,
        };
        let buf = frame(std::slice::from_ref(&node), &[]);

        let remote = read_remote_state(&buf[..], &VersionTable::current()).unwrap();
        assert_eq!(remote.nodes, vec![node]);
    }

    // ==================== Short reads ====================

    #[test]
    fn test_user_state_partial_reads() {
        let buf = frame(&nodes(&["a"]), &[9; 64]);
        let remote = read_remote_state(Trickle(&buf[..]), &VersionTable::current()).unwrap();
        assert_eq!(remote.user_state, vec![9; 64]);
    }

    #[test]
    fn test_short_user_state() {
        let mut buf = frame(&nodes(&["a"]), &[9; 10]);
        buf.truncate(buf.len() - 3);

        let err = read_remote_state(&buf[..], &VersionTable::current()).unwrap_err();
        assert!(matches!(
            err,
            PushPullError::ShortUserState {
                read: 7,
                expected: 10
            }
        ));
    }

    #[test]
    fn test_short_node_read_keeps_decoded() {
        let mut buf = frame(&nodes(&["a", "b"]), &[9; 10]);
        // Drop the user state and part of the second node
        buf.truncate(buf.len() - 13);

        let err = read_remote_state(&buf[..], &VersionTable::current()).unwrap_err();
        assert!(matches!(err, PushPullError::ShortNodeRead { expected: 2, .. }));
        assert_eq!(err.partial_nodes(), &nodes(&["a"])[..]);
    }

    #[test]
    fn test_oversized_user_state_rejected() {
        let header = PushPullHeader {
            nodes: 0,
            user_state_len: u32::MAX,
        };
        let buf = wire::encode(&VersionTable::current(), MessageType::PushPull, &header).unwrap();

        let err = read_remote_state(&buf[..], &VersionTable::current()).unwrap_err();
        assert!(matches!(err, PushPullError::StateTooLarge(_)));
    }

    // ==================== Framing errors ====================

    #[test]
    fn test_wrong_kind_rejected() {
        let buf = wire::encode(
            &VersionTable::current(),
            MessageType::Ping,
            &crate::protocol::Ping { seq_no: 1 },
        )
        .unwrap();

        let err = read_remote_state(&buf[..], &VersionTable::current()).unwrap_err();
        assert!(matches!(
            err,
            PushPullError::InvalidMessageType(0)
        ));
    }

    #[test]
    fn test_wrong_kind_inside_compression_rejected() {
        let versions = VersionTable::current();
        let ping = wire::encode(&versions, MessageType::Ping, &crate::protocol::Ping { seq_no: 1 }).unwrap();
        let buf = compress::compress_payload(&versions, &ping).unwrap();

        let err = read_remote_state(&buf[..], &versions).unwrap_err();
        assert!(matches!(
            err,
            PushPullError::InvalidMessageType(0)
        ));
    }

    #[test]
    fn test_unknown_kind_rejected_with_raw_byte() {
        let buf = [200u8, 0, 1, 2, 3];

        let err = read_remote_state(&buf[..], &VersionTable::current()).unwrap_err();
        assert!(matches!(err, PushPullError::InvalidMessageType(200)));
        assert_eq!(err.to_string(), "Expected a push-pull message, got type 200");
    }

    #[test]
    fn test_incompatible_version_rejected() {
        let mut buf = frame(&nodes(&["a"]), &[]);
        buf[1] = 3;

        let err = read_remote_state(&buf[..], &VersionTable::current()).unwrap_err();
        assert!(matches!(
            err,
            PushPullError::Wire(WireError::IncompatibleVersion { .. })
        ));
    }

    #[test]
    fn test_empty_stream_is_io_error() {
        let err = read_remote_state(&[][..], &VersionTable::current()).unwrap_err();
        assert!(matches!(err, PushPullError::Io(_)));
    }
}
