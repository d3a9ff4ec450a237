//! Codec for encoding/decoding agent frames

use bytes::{Bytes, BytesMut};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),
}

/// Length-prefixed bincode codec shared by both directions of the stream
pub struct FrameCodec;

impl FrameCodec {
    /// Maximum frame size (16MB)
    pub const MAX_FRAME_SIZE: usize = crate::MAX_FRAME_SIZE as usize;

    /// Encode a frame to bytes
    ///
    /// Format: [length: u32][payload: bincode serialized frame]
    pub fn encode<T: Serialize>(frame: &T) -> Result<Bytes, CodecError> {
        let payload = bincode::serialize(frame)?;

        if payload.len() > Self::MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(payload.len()));
        }

        let mut buf = BytesMut::with_capacity(4 + payload.len());
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&payload);

        Ok(buf.freeze())
    }

    /// Decode a frame from bytes
    ///
    /// Returns Ok(Some(frame)) if a complete frame was decoded,
    /// Ok(None) if more data is needed,
    /// Err on error
    pub fn decode<T: DeserializeOwned>(buf: &mut BytesMut) -> Result<Option<T>, CodecError> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&buf[..4]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > Self::MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(length));
        }

        if buf.len() < 4 + length {
            return Ok(None);
        }

        let _ = buf.split_to(4);
        let frame_bytes = buf.split_to(length);

        let frame: T = bincode::deserialize(&frame_bytes)?;

        Ok(Some(frame))
    }
}
