//! Length-prefixed frame codec for the API socket.
//!
//! Every message travels in one frame with a 4-byte big-endian length prefix,
//! giving reliable message delimitation over stream sockets.
//!
//! Frame format:
//! ```text
//! +----------------+------------------+
//! |  4 bytes       |  N bytes         |
//! |  (length BE)   |  (payload)       |
//! +----------------+------------------+
//! ```
//!
//! Payloads are raw bytes: JSON-RPC documents, or the liveness
//! [`PING`]/[`PONG`] control messages which never reach the dispatcher.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

/// Maximum message size (16 MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Length prefix size in bytes
const LENGTH_PREFIX_SIZE: usize = 4;

/// Liveness ping payload
pub const PING: &[u8] = b"ping";

/// Answer to [`PING`]
pub const PONG: &[u8] = b"pong";

/// Codec for length-prefixed frames
#[derive(Debug, Default)]
pub struct FrameCodec {
    current_length: Option<usize>,
}

impl FrameCodec {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.current_length.is_none() {
            if src.len() < LENGTH_PREFIX_SIZE {
                return Ok(None);
            }

            let len = src.get_u32() as usize;

            if len > MAX_MESSAGE_SIZE {
                return Err(CodecError::MessageTooLarge(len));
            }

            self.current_length = Some(len);
        }

        let Some(length) = self.current_length else {
            return Ok(None);
        };

        if src.len() < length {
            src.reserve(length - src.len());
            return Ok(None);
        }

        let payload = src.split_to(length).freeze();
        self.current_length = None;

        Ok(Some(payload))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = CodecError;

    // Payload size is checked against MAX_MESSAGE_SIZE (fits in u32)
    #[allow(clippy::cast_possible_truncation)]
    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() > MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(item.len()));
        }

        dst.reserve(LENGTH_PREFIX_SIZE + item.len());
        dst.put_u32(item.len() as u32);
        dst.put_slice(&item);

        Ok(())
    }
}

/// Errors that can occur during codec operations
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Message too large: {0} bytes (max: {MAX_MESSAGE_SIZE})")]
    MessageTooLarge(usize),
}

#[cfg(test)]
mod tests {
    #![allow(clippy::cast_possible_truncation)] // Test constants bounded to u32

    use super::*;

    fn encode(payload: &'static [u8]) -> BytesMut {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Bytes::from_static(payload), &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_encode_decode_ping() {
        let mut codec = FrameCodec::new();
        let mut buf = encode(PING);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&decoded[..], PING);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_decode() {
        let mut codec = FrameCodec::new();
        let full_buf = encode(br#"{"jsonrpc":"2.0","method":"sen0395.status"}"#);

        let mut partial = BytesMut::new();
        partial.extend_from_slice(&full_buf[..2]); // Only 2 bytes of length prefix
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&full_buf[2..6]); // Rest of prefix + some payload
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&full_buf[6..]);
        let decoded = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(&decoded[..], &full_buf[4..]);
    }

    #[test]
    fn test_decode_empty_buffer() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        let result = codec.decode(&mut buf).unwrap();
        assert!(result.is_none(), "Empty buffer should return None");
    }

    #[test]
    fn test_decode_insufficient_length_prefix() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0, 0, 0]);

        let result = codec.decode(&mut buf).unwrap();
        assert!(
            result.is_none(),
            "Incomplete length prefix should return None"
        );
    }

    #[test]
    fn test_multiple_frames_in_buffer() {
        let mut codec = FrameCodec::new();
        let mut buf = encode(b"first");
        buf.extend_from_slice(&encode(b"second"));

        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"first");
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"second");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_passes_malformed_payload_through() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        let invalid = [0xff, 0xfe, 0x00, 0x01];
        buf.put_u32(invalid.len() as u32);
        buf.extend_from_slice(&invalid);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&decoded[..], &invalid);
    }

    #[test]
    fn test_empty_frame() {
        let mut codec = FrameCodec::new();
        let mut buf = encode(b"");
        assert_eq!(buf.len(), 4);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn test_message_too_large() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_MESSAGE_SIZE + 1) as u32);

        let result = codec.decode(&mut buf);
        assert!(matches!(result, Err(CodecError::MessageTooLarge(_))));
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        let payload = Bytes::from(vec![b'x'; MAX_MESSAGE_SIZE + 1]);

        let result = codec.encode(payload, &mut buf);
        assert!(matches!(result, Err(CodecError::MessageTooLarge(_))));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_codec_error_display() {
        let err = CodecError::MessageTooLarge(20_000_000);
        let msg = err.to_string();
        assert!(msg.contains("20000000"));
        assert!(msg.contains("too large"));

        let err = CodecError::Io(io::Error::new(
            io::ErrorKind::ConnectionReset,
            "connection reset",
        ));
        assert!(err.to_string().contains("connection reset"));
    }

    #[test]
    fn test_length_prefix_format() {
        let buf = encode(PONG);
        let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        assert_eq!(length, buf.len() - 4);
        assert_eq!(&buf[4..], PONG);
    }
}
