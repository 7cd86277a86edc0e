//! Length-prefixed frame codec.
//!
//! Each frame is a 4-byte big-endian length followed by that many payload
//! bytes. The frame length is validated before any allocation so a hostile
//! peer cannot trigger memory exhaustion with a forged prefix.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::{Message, ProtocolError};

/// Length of the frame header.
const HEADER_LEN: usize = 4;

/// Maximum accepted frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Raw byte-frame codec: 4-byte big-endian length prefix, bounded reads.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    /// Codec with the default frame cap.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, ProtocolError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if length > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: length,
                max: self.max_frame_size,
            });
        }

        let total = HEADER_LEN + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        Ok(Some(src.split_to(length).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        if item.len() > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: item.len(),
                max: self.max_frame_size,
            });
        }
        dst.reserve(HEADER_LEN + item.len());
        #[allow(clippy::cast_possible_truncation)] // bounded above
        dst.put_u32(item.len() as u32);
        dst.extend_from_slice(&item);
        Ok(())
    }
}

/// [`Message`]-level codec: JSON inside length-prefixed frames.
#[derive(Debug, Clone, Default)]
pub struct MessageCodec {
    frames: FrameCodec,
}

impl MessageCodec {
    /// Codec with the default frame cap.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            frames: FrameCodec::new(),
        }
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, ProtocolError> {
        let Some(frame) = self.frames.decode(src)? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(&frame)?))
    }
}

impl Encoder<&Message> for MessageCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: &Message, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let json = serde_json::to_vec(item)?;
        self.frames.encode(Bytes::from(json), dst)
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        self.encode(&item, dst)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn byte_frames_round_trip_identically() {
        let mut codec = FrameCodec::new();
        let payloads: [&[u8]; 4] = [b"", b"x", b"hello world", &[0xFF; 1024]];

        for payload in payloads {
            let mut buf = BytesMut::new();
            codec.encode(Bytes::copy_from_slice(payload), &mut buf).unwrap();
            assert_eq!(&buf[..4], (payload.len() as u32).to_be_bytes());
            let decoded = codec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(&decoded[..], payload);
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn partial_header_and_payload_wait_for_more() {
        let mut codec = FrameCodec::new();

        let mut buf = BytesMut::from(&[0u8, 0, 0][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 3);

        let mut buf = BytesMut::from(&[0u8, 0, 0, 10, 1, 2, 3][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 7);
    }

    #[test]
    fn oversized_length_rejected_before_allocation() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32(64 * 1024 * 1024);
        buf.extend_from_slice(&[0u8; 16]);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::FrameTooLarge { size, max })
                if size == 64 * 1024 * 1024 && max == MAX_FRAME_SIZE
        ));
    }

    #[test]
    fn consecutive_frames_decode_in_order() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Bytes::from_static(b"first"), &mut buf).unwrap();
        codec.encode(Bytes::from_static(b"second"), &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), "first");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), "second");
        assert!(buf.is_empty());
    }

    #[test]
    fn messages_round_trip() {
        let mut codec = MessageCodec::new();
        let msg = Message::new("ping", json!(42));

        let mut buf = BytesMut::new();
        codec.encode(&msg, &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn garbage_frame_is_a_json_error() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32(3);
        buf.extend_from_slice(b"{{{");

        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::Json(_))
        ));
    }
}
