//! Compression wrapper for arbitrary payloads.
//!
//! A compressed message is `[compress, version]` followed by the encoding
//! of [`Compressed`]: an algorithm tag and the compressed bytes. The
//! decompressed bytes are a complete wire message with their own header.

use super::wire::{self, MessageType, VersionTable, WireError};
use flate2::Compression;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};
use thiserror::Error;

/// Largest payload we are willing to inflate.
pub const MAX_DECOMPRESSED_SIZE: u64 = 32 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum CompressionError {
    #[error("Unknown compression algorithm: {0}")]
    UnknownAlgorithm(u8),

    #[error("Deflate stream error: {0}")]
    Io(#[from] io::Error),

    #[error("Decompressed payload exceeds the size limit")]
    TooLarge,

    #[error(transparent)]
    Wire(#[from] WireError),
}

/// Compression algorithm tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompressionAlgo {
    Deflate = 0,
}

impl TryFrom<u8> for CompressionAlgo {
    type Error = CompressionError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Deflate),
            other => Err(CompressionError::UnknownAlgorithm(other)),
        }
    }
}

/// Payload of a compress message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Compressed {
    pub algo: u8,
    pub buf: Vec<u8>,
}

/// Compress `payload` and wrap it as a complete compress message.
pub fn compress_payload(versions: &VersionTable, payload: &[u8]) -> Result<Vec<u8>, CompressionError> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(payload)?;
    let buf = encoder.finish()?;

    let msg = Compressed {
        algo: CompressionAlgo::Deflate as u8,
        buf,
    };
    Ok(wire::encode(versions, MessageType::Compress, &msg)?)
}

/// Decode a compress message body (header stripped) and inflate it.
pub fn decompress_payload(body: &[u8]) -> Result<Vec<u8>, CompressionError> {
    let msg: Compressed = wire::decode(body)?;
    decompress_buffer(&msg)
}

/// Inflate an already decoded [`Compressed`] payload.
pub fn decompress_buffer(msg: &Compressed) -> Result<Vec<u8>, CompressionError> {
    match CompressionAlgo::try_from(msg.algo)? {
        CompressionAlgo::Deflate => {
            let mut out = Vec::new();
            DeflateDecoder::new(&msg.buf[..])
                .take(MAX_DECOMPRESSED_SIZE + 1)
                .read_to_end(&mut out)?;
            if out.len() as u64 > MAX_DECOMPRESSED_SIZE {
                return Err(CompressionError::TooLarge);
            }
            Ok(out)
        }
    }
}
