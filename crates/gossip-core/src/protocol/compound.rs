//! Compound messages: several wire messages packed into one datagram.
//!
//! Layout after the `[compound, version]` header:
//!
//! ```text
//! +-------+-----------------+-----+-----------------+--------+-----+--------+
//! | count | len_0 (u16, BE) | ... | len_n (u16, BE) | body_0 | ... | body_n |
//! +-------+-----------------+-----+-----------------+--------+-----+--------+
//! ```
//!
//! Every body is itself a complete wire message with its own header.

use super::wire::{MessageType, VersionTable};
use thiserror::Error;

/// Assumed header overhead: type, version and part count.
pub const COMPOUND_HEADER_OVERHEAD: usize = 3;

/// Assumed overhead per entry in the length table.
pub const COMPOUND_PART_OVERHEAD: usize = 2;

/// Most parts a single compound message can declare.
pub const MAX_PARTS: usize = u8::MAX as usize;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CompoundError {
    #[error("Missing compound length byte")]
    MissingCount,

    #[error("Truncated length table: {parts} parts declared, {available} bytes available")]
    TruncatedLengths { parts: usize, available: usize },

    #[error("Too many parts for one compound message: {0}")]
    TooManyParts(usize),

    #[error("Part {index} is {len} bytes, over the u16 limit")]
    PartTooLarge { index: usize, len: usize },
}

/// Result of unpacking a compound body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unpacked<'a> {
    /// Parts declared in the length table but missing from the buffer
    pub truncated: usize,
    /// Fully present parts, in encoded order
    pub parts: Vec<&'a [u8]>,
}

/// Pack messages into a single compound wire message (header included).
pub fn pack<B: AsRef<[u8]>>(versions: &VersionTable, msgs: &[B]) -> Result<Vec<u8>, CompoundError> {
    if msgs.len() > MAX_PARTS {
        return Err(CompoundError::TooManyParts(msgs.len()));
    }

    let body_len: usize = msgs.iter().map(|m| m.as_ref().len()).sum();
    let mut out =
        Vec::with_capacity(COMPOUND_HEADER_OVERHEAD + msgs.len() * COMPOUND_PART_OVERHEAD + body_len);
    out.extend_from_slice(&versions.header(MessageType::Compound));
    out.push(msgs.len() as u8);

    for (index, msg) in msgs.iter().enumerate() {
        let len = msg.as_ref().len();
        let len = u16::try_from(len).map_err(|_| CompoundError::PartTooLarge { index, len })?;
        out.extend_from_slice(&len.to_be_bytes());
    }
    for msg in msgs {
        out.extend_from_slice(msg.as_ref());
    }
    Ok(out)
}

/// Pack any number of messages, splitting into as many compound messages as needed.
pub fn pack_many<B: AsRef<[u8]>>(
    versions: &VersionTable,
    msgs: &[B],
) -> Result<Vec<Vec<u8>>, CompoundError> {
    msgs.chunks(MAX_PARTS)
        .map(|chunk| pack(versions, chunk))
        .collect()
}

/// Unpack a compound body (header already stripped).
///
/// Parts that the declared lengths promise but the buffer does not hold
/// are counted as truncated rather than treated as an error, so a peer
/// that clipped a batch to fit an MTU still gets its leading parts through.
pub fn unpack(buf: &[u8]) -> Result<Unpacked<'_>, CompoundError> {
    let (&count, rest) = buf.split_first().ok_or(CompoundError::MissingCount)?;
    let count = count as usize;

    if rest.len() < count * COMPOUND_PART_OVERHEAD {
        return Err(CompoundError::TruncatedLengths {
            parts: count,
            available: rest.len(),
        });
    }
    let (table, mut bodies) = rest.split_at(count * COMPOUND_PART_OVERHEAD);

    let mut parts = Vec::with_capacity(count);
    for (idx, raw_len) in table.chunks_exact(COMPOUND_PART_OVERHEAD).enumerate() {
        let len = u16::from_be_bytes([raw_len[0], raw_len[1]]) as usize;
        if bodies.len() < len {
            return Ok(Unpacked {
                truncated: count - idx,
                parts,
            });
        }
        let (part, remaining) = bodies.split_at(len);
        parts.push(part);
        bodies = remaining;
    }

    Ok(Unpacked {
        truncated: 0,
        parts,
    })
}
