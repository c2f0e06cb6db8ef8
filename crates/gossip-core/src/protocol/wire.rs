//! Byte-level framing shared by every message.
//!
//! Each independently dispatchable unit starts with a two byte header:
//! the message type followed by the message version. The rest of the unit
//! is the bincode encoding of the type's payload struct.
//!
//! Versioning works as a one-step rolling upgrade window: a receiver
//! accepts a message whose version equals the version it expects for that
//! type, or is exactly one behind it. Senders always encode with the
//! latest version from their [`VersionTable`].

use bincode::Options;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt::{self, Display, Formatter};
use std::io::Read;
use thiserror::Error;

/// Length of the `[type, version]` header.
pub const HEADER_LEN: usize = 2;

/// Upper bound for a single decoded payload, guarding against hostile length prefixes.
pub const MAX_DECODE_SIZE: u64 = 32 * 1024 * 1024;

/// Version number of a message type.
pub type MessageVersion = u8;

const TYPE_COUNT: usize = 10;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("Message too short: {0} bytes, need at least 2")]
    TooShort(usize),

    #[error("Unknown message type: {0}")]
    UnknownType(u8),

    #[error("Incompatible version {version} for {kind} (expected {expected})")]
    IncompatibleVersion {
        kind: MessageType,
        version: MessageVersion,
        expected: MessageVersion,
    },

    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),
}

/// Integer ID of a type of message that can be received from other members.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Ping = 0,
    IndirectPing = 1,
    Ack = 2,
    Suspect = 3,
    Alive = 4,
    Dead = 5,
    PushPull = 6,
    Compound = 7,
    /// Opaque user payload, never decoded by this crate
    User = 8,
    Compress = 9,
}

impl MessageType {
    /// Every message type, in discriminant order.
    pub const ALL: [MessageType; TYPE_COUNT] = [
        Self::Ping,
        Self::IndirectPing,
        Self::Ack,
        Self::Suspect,
        Self::Alive,
        Self::Dead,
        Self::PushPull,
        Self::Compound,
        Self::User,
        Self::Compress,
    ];

    /// The on-wire byte for this type.
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for MessageType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::ALL
            .get(value as usize)
            .copied()
            .ok_or(WireError::UnknownType(value))
    }
}

impl Display for MessageType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ping => "ping",
            Self::IndirectPing => "indirect-ping",
            Self::Ack => "ack",
            Self::Suspect => "suspect",
            Self::Alive => "alive",
            Self::Dead => "dead",
            Self::PushPull => "push-pull",
            Self::Compound => "compound",
            Self::User => "user",
            Self::Compress => "compress",
        };
        f.write_str(name)
    }
}

/// Expected version per message type.
///
/// Built once at startup and passed by reference to the encode and
/// dispatch paths. There is no global version state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionTable {
    versions: [MessageVersion; TYPE_COUNT],
}

impl VersionTable {
    /// The versions this build speaks.
    pub fn current() -> Self {
        Self {
            versions: [0; TYPE_COUNT],
        }
    }

    /// Override the version for one message type.
    pub fn with_version(mut self, kind: MessageType, version: MessageVersion) -> Self {
        self.versions[kind as usize] = version;
        self
    }

    /// The version we encode with and expect for `kind`.
    pub fn expected(&self, kind: MessageType) -> MessageVersion {
        self.versions[kind as usize]
    }

    /// Check whether a received version can be processed.
    ///
    /// Accepts our version or the one immediately before it. The
    /// subtraction does not wrap: at version 0 only 0 is accepted.
    pub fn is_valid(&self, kind: MessageType, version: MessageVersion) -> bool {
        let ours = self.expected(kind);
        version == ours || ours.checked_sub(1) == Some(version)
    }

    /// Header bytes to prefix an outgoing message of `kind`.
    pub fn header(&self, kind: MessageType) -> [u8; HEADER_LEN] {
        [kind.as_u8(), self.expected(kind)]
    }

    /// Validate a raw `[type, version]` pair.
    pub fn check(&self, kind: u8, version: MessageVersion) -> Result<MessageType, WireError> {
        let kind = MessageType::try_from(kind)?;
        if !self.is_valid(kind, version) {
            return Err(WireError::IncompatibleVersion {
                kind,
                version,
                expected: self.expected(kind),
            });
        }
        Ok(kind)
    }
}

impl Default for VersionTable {
    fn default() -> Self {
        Self::current()
    }
}

/// Strip and validate the header, returning the message type and payload.
pub fn split_header<'a>(
    buf: &'a [u8],
    versions: &VersionTable,
) -> Result<(MessageType, &'a [u8]), WireError> {
    if buf.len() < HEADER_LEN {
        return Err(WireError::TooShort(buf.len()));
    }
    let kind = versions.check(buf[0], buf[1])?;
    Ok((kind, &buf[HEADER_LEN..]))
}

/// Bincode settings used for every structured payload.
fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .allow_trailing_bytes()
        .with_limit(MAX_DECODE_SIZE)
}

/// Encode a message with its header using the latest version for `kind`.
pub fn encode<T: Serialize>(
    versions: &VersionTable,
    kind: MessageType,
    msg: &T,
) -> Result<Vec<u8>, WireError> {
    let mut out = versions.header(kind).to_vec();
    codec().serialize_into(&mut out, msg)?;
    Ok(out)
}

/// Append the bare payload encoding of `msg` (no header) to `out`.
pub fn encode_into<T: Serialize>(out: &mut Vec<u8>, msg: &T) -> Result<(), WireError> {
    codec().serialize_into(out, msg)?;
    Ok(())
}

/// Decode a payload that has already had its header stripped.
pub fn decode<T: DeserializeOwned>(buf: &[u8]) -> Result<T, WireError> {
    Ok(codec().deserialize(buf)?)
}

/// Decode the next payload from a stream.
pub fn decode_from<T: DeserializeOwned, R: Read>(reader: R) -> Result<T, WireError> {
    Ok(codec().deserialize_from(reader)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::Ping;

    // ==================== Version compatibility ====================

    #[test]
    fn test_current_and_previous_version_valid() {
        for kind in MessageType::ALL {
            let versions = VersionTable::current().with_version(kind, 3);
            assert!(versions.is_valid(kind, 3));
            assert!(versions.is_valid(kind, 2));
        }
    }

    #[test]
    fn test_other_versions_rejected() {
        let versions = VersionTable::current().with_version(MessageType::Alive, 3);
        for version in (0..=u8::MAX).filter(|v| *v != 3 && *v != 2) {
            assert!(!versions.is_valid(MessageType::Alive, version));
        }
    }

    #[test]
    fn test_version_zero_does_not_wrap() {
        let versions = VersionTable::current();
        assert!(versions.is_valid(MessageType::Ping, 0));
        assert!(!versions.is_valid(MessageType::Ping, u8::MAX));
        assert!(!versions.is_valid(MessageType::Ping, 1));
    }

    // ==================== Header handling ====================

    #[test]
    fn test_split_header() {
        let versions = VersionTable::current();
        let (kind, body) = split_header(&[2, 0, 9, 9], &versions).unwrap();
        assert_eq!(kind, MessageType::Ack);
        assert_eq!(body, &[9, 9]);
    }

    #[test]
    fn test_split_header_too_short() {
        let versions = VersionTable::current();
        assert!(matches!(
            split_header(&[0], &versions),
            Err(WireError::TooShort(1))
        ));
        assert!(matches!(
            split_header(&[], &versions),
            Err(WireError::TooShort(0))
        ));
    }

    #[test]
    fn test_split_header_unknown_type() {
        let versions = VersionTable::current();
        assert!(matches!(
            split_header(&[200, 0], &versions),
            Err(WireError::UnknownType(200))
        ));
    }

    #[test]
    fn test_split_header_bad_version() {
        let versions = VersionTable::current();
        let err = split_header(&[0, 7], &versions).unwrap_err();
        assert!(matches!(
            err,
            WireError::IncompatibleVersion {
                kind: MessageType::Ping,
                version: 7,
                expected: 0
            }
        ));
    }

    #[test]
    fn test_message_type_discriminants() {
        for (idx, kind) in MessageType::ALL.iter().enumerate() {
            assert_eq!(kind.as_u8() as usize, idx);
            assert_eq!(MessageType::try_from(idx as u8).unwrap(), *kind);
        }
        assert!(MessageType::try_from(10).is_err());
    }

    // ==================== Encoding ====================

    #[test]
    fn test_encode_uses_latest_version() {
        let versions = VersionTable::current().with_version(MessageType::Ping, 4);
        let out = encode(&versions, MessageType::Ping, &Ping { seq_no: 1 }).unwrap();
        assert_eq!(&out[..HEADER_LEN], &[0, 4]);
    }

    #[test]
    fn test_ping_wire_layout() {
        let versions = VersionTable::current();
        let out = encode(&versions, MessageType::Ping, &Ping { seq_no: 0x01020304 }).unwrap();
        // Fixed-width little-endian u32
        assert_eq!(out, vec![0, 0, 0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn test_decode_truncated_payload() {
        let result: Result<Ping, _> = decode(&[1, 2]);
        assert!(matches!(result, Err(WireError::Codec(_))));
    }
}
