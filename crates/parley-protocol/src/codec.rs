//! Codec for encoding and decoding Parley frames.
//!
//! Frames travel as MessagePack payloads behind a 4-byte big-endian length
//! prefix. The decoder is incremental: feeding it a partial frame yields
//! `Ok(None)` and leaves the buffer untouched until the rest arrives, so the
//! transport never has to guess message boundaries.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::frames::Frame;

/// Default maximum frame size (64 KiB). The broker can lower or raise this
/// per deployment via its message-size limit.
pub const DEFAULT_MAX_FRAME: usize = 64 * 1024;

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum WireError {
    /// Frame exceeds the configured maximum size.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge {
        /// Observed frame size.
        size: usize,
        /// Configured limit.
        max: usize,
    },

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Streaming frame codec with a configurable frame-size limit.
#[derive(Debug, Clone, Copy)]
pub struct WireCodec {
    max_frame: usize,
}

impl Default for WireCodec {
    fn default() -> Self {
        Self {
            max_frame: DEFAULT_MAX_FRAME,
        }
    }
}

impl WireCodec {
    /// Create a codec with a specific frame-size limit.
    #[must_use]
    pub fn with_max_frame(max_frame: usize) -> Self {
        Self { max_frame }
    }

    /// Get the configured frame-size limit.
    #[must_use]
    pub fn max_frame(&self) -> usize {
        self.max_frame
    }

    /// Encode a frame to a standalone buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is too large or serialization fails.
    pub fn encode(&self, frame: &Frame) -> Result<Bytes, WireError> {
        let mut buf = BytesMut::new();
        self.encode_into(frame, &mut buf)?;
        Ok(buf.freeze())
    }

    /// Encode a frame into an existing buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is too large or serialization fails.
    pub fn encode_into(&self, frame: &Frame, buf: &mut BytesMut) -> Result<(), WireError> {
        let payload = rmp_serde::to_vec_named(frame)?;

        if payload.len() > self.max_frame {
            return Err(WireError::FrameTooLarge {
                size: payload.len(),
                max: self.max_frame,
            });
        }

        buf.reserve(LENGTH_PREFIX_SIZE + payload.len());
        buf.put_u32(payload.len() as u32);
        buf.extend_from_slice(&payload);

        Ok(())
    }

    /// Try to decode one frame from the buffer, consuming it on success.
    ///
    /// Returns `Ok(None)` when the buffer holds less than one complete
    /// frame. This is the would-block case, not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the announced frame exceeds the size limit or the
    /// payload is not a valid frame.
    pub fn decode_from(&self, buf: &mut BytesMut) -> Result<Option<Frame>, WireError> {
        if buf.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

        if length > self.max_frame {
            return Err(WireError::FrameTooLarge {
                size: length,
                max: self.max_frame,
            });
        }

        if buf.len() < LENGTH_PREFIX_SIZE + length {
            return Ok(None);
        }

        buf.advance(LENGTH_PREFIX_SIZE);
        let payload = buf.split_to(length);
        let frame = rmp_serde::from_slice(&payload)?;

        Ok(Some(frame))
    }
}

/// Encode a frame with the default size limit.
///
/// # Errors
///
/// Returns an error if the frame is too large or serialization fails.
pub fn encode(frame: &Frame) -> Result<Bytes, WireError> {
    WireCodec::default().encode(frame)
}

/// Try to decode one frame from a buffer with the default size limit.
///
/// # Errors
///
/// Returns an error if the frame is too large or invalid.
pub fn decode_from(buf: &mut BytesMut) -> Result<Option<Frame>, WireError> {
    WireCodec::default().decode_from(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::SystemEvent;

    #[test]
    fn test_encode_decode_roundtrip() {
        let frames = vec![
            Frame::hello(Some("alice".to_string())),
            Frame::welcome("peer-1", 30_000),
            Frame::chat(b"hi there".to_vec()),
            Frame::relay("alice", b"hi there".to_vec(), 1_700_000_000_000),
            Frame::system(SystemEvent::Left, "bob"),
            Frame::error(1002, "server full"),
            Frame::ping(Some(42)),
            Frame::pong(Some(42)),
            Frame::Bye,
        ];

        for frame in frames {
            let encoded = encode(&frame).unwrap();
            let mut buf = BytesMut::from(&encoded[..]);
            let decoded = decode_from(&mut buf).unwrap().unwrap();
            assert_eq!(frame, decoded);
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_decode_partial_input() {
        let encoded = encode(&Frame::chat(b"partial".to_vec())).unwrap();

        // Feed the frame one byte short; nothing should be consumed.
        let mut buf = BytesMut::from(&encoded[..encoded.len() - 1]);
        let before = buf.len();
        assert!(decode_from(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), before);

        // Completing the frame decodes it.
        buf.extend_from_slice(&encoded[encoded.len() - 1..]);
        assert!(decode_from(&mut buf).unwrap().is_some());
    }

    #[test]
    fn test_frame_too_large() {
        let codec = WireCodec::with_max_frame(128);
        let frame = Frame::chat(vec![0u8; 256]);

        match codec.encode(&frame) {
            Err(WireError::FrameTooLarge { max: 128, .. }) => {}
            other => panic!("Expected FrameTooLarge, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_oversized_prefix() {
        let codec = WireCodec::with_max_frame(16);
        let mut buf = BytesMut::new();
        buf.put_u32(1024);
        buf.extend_from_slice(&[0u8; 8]);

        assert!(matches!(
            codec.decode_from(&mut buf),
            Err(WireError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_streaming_decode() {
        let frame1 = Frame::chat(b"first".to_vec());
        let frame2 = Frame::chat(b"second".to_vec());

        let codec = WireCodec::default();
        let mut buf = BytesMut::new();
        codec.encode_into(&frame1, &mut buf).unwrap();
        codec.encode_into(&frame2, &mut buf).unwrap();

        assert_eq!(codec.decode_from(&mut buf).unwrap().unwrap(), frame1);
        assert_eq!(codec.decode_from(&mut buf).unwrap().unwrap(), frame2);
        assert!(buf.is_empty());
    }
}
