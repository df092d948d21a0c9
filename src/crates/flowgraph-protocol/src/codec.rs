//! Length-prefixed binary frame codec.
//!
//! A frame is a little-endian `u32` byte count followed by the bincode
//! serialization of one value. The prefix makes every frame self-delimiting,
//! so readers can pull exactly one logical record out of a byte stream and
//! short-read cleanly when a frame has not fully arrived yet.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Size of the `u32` length prefix.
pub const FRAME_HEADER_LEN: usize = 4;

/// Upper bound on a single frame body. A peer announcing more than this is
/// treated as corrupt rather than allocated for.
pub const MAX_FRAME_LEN: usize = 1 << 30;

/// Convenience result type using [`CodecError`].
pub type Result<T> = std::result::Result<T, CodecError>;

/// Errors raised while encoding or decoding frames.
#[derive(Error, Debug)]
pub enum CodecError {
    /// The value could not be serialized or deserialized.
    #[error("binary serialization failed: {0}")]
    Bincode(#[from] bincode::Error),

    /// A frame header announced a body larger than [`MAX_FRAME_LEN`].
    #[error("frame of {len} bytes exceeds the {max} byte limit", max = MAX_FRAME_LEN)]
    FrameTooLarge { len: usize },
}

/// Serialize one value into a self-delimiting frame.
pub fn encode_frame<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + 64);
    frame.extend_from_slice(&[0u8; FRAME_HEADER_LEN]);
    bincode::serialize_into(&mut frame, value)?;
    let body = frame.len() - FRAME_HEADER_LEN;
    if body > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge { len: body });
    }
    frame[..FRAME_HEADER_LEN].copy_from_slice(&(body as u32).to_le_bytes());
    Ok(frame)
}

/// Try to decode one frame from the front of `bytes`.
///
/// Returns the value and the total number of bytes consumed (header
/// included), or `Ok(None)` when `bytes` does not yet hold a complete frame.
pub fn decode_frame<T: DeserializeOwned>(bytes: &[u8]) -> Result<Option<(T, usize)>> {
    if bytes.len() < FRAME_HEADER_LEN {
        return Ok(None);
    }
    let mut header = [0u8; FRAME_HEADER_LEN];
    header.copy_from_slice(&bytes[..FRAME_HEADER_LEN]);
    let body = u32::from_le_bytes(header) as usize;
    if body > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge { len: body });
    }
    let total = FRAME_HEADER_LEN + body;
    if bytes.len() < total {
        return Ok(None);
    }
    let value = bincode::deserialize(&bytes[FRAME_HEADER_LEN..total])?;
    Ok(Some((value, total)))
}
