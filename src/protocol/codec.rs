//! Protocol codec for encoding/decoding messages
//!
//! Handles serialization and framing of protocol messages.

use bytes::{Buf, BufMut, BytesMut};
use std::io;
use thiserror::Error;

use super::{FrameKind, Message, MAGIC_BYTES};

/// Maximum payload size (64 KiB). Input and control traffic is tiny.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Header size: magic(4) + type(1) + length(4) + sequence(4) = 13 bytes
pub const HEADER_SIZE: usize = 13;

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Invalid magic bytes")]
    InvalidMagic,

    #[error("Message too large: {0} bytes (max: {1})")]
    MessageTooLarge(usize, usize),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

/// Message frame with metadata
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Sequence number for ordering
    pub sequence: u32,
    /// The actual message
    pub message: Message,
}

impl Frame {
    pub fn new(sequence: u32, message: Message) -> Self {
        Self { sequence, message }
    }
}

/// Encodes messages into the wire format
pub struct Encoder {
    sequence: u32,
}

impl Encoder {
    pub fn new() -> Self {
        Self { sequence: 0 }
    }

    /// Encode a message into a buffer, returning the sequence number it got.
    /// Heartbeats carry the next number without consuming it, so a receiver
    /// that drops them sees consecutive numbers on every other frame.
    pub fn encode(&mut self, message: &Message, buf: &mut BytesMut) -> Result<u32, CodecError> {
        let payload = match message {
            Message::Handshake(body) => bincode::serialize(body)?,
            Message::Heartbeat(body) => bincode::serialize(body)?,
            Message::Control(body) => bincode::serialize(body)?,
            Message::Input(body) => bincode::serialize(body)?,
        };

        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(payload.len(), MAX_MESSAGE_SIZE));
        }

        let sequence = self.sequence;

        buf.reserve(HEADER_SIZE + payload.len());
        buf.put_slice(&MAGIC_BYTES);
        buf.put_u8(message.kind().tag());
        buf.put_u32(payload.len() as u32);
        buf.put_u32(sequence);
        buf.put_slice(&payload);

        if !matches!(message, Message::Heartbeat(_)) {
            self.sequence = self.sequence.wrapping_add(1);
        }
        Ok(sequence)
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Decodes messages from the wire format
pub struct Decoder {
    state: DecodeState,
    skipped: u64,
}

#[derive(Default)]
enum DecodeState {
    #[default]
    Header,
    Payload {
        tag: u8,
        length: usize,
        sequence: u32,
    },
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            state: DecodeState::Header,
            skipped: 0,
        }
    }

    /// Attempt to decode a frame from the buffer.
    /// Returns Ok(None) if more data is needed. Frames with an unknown type
    /// tag are consumed and skipped.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        loop {
            match self.state {
                DecodeState::Header => {
                    if buf.len() < HEADER_SIZE {
                        return Ok(None);
                    }

                    if buf[0..4] != MAGIC_BYTES {
                        return Err(CodecError::InvalidMagic);
                    }

                    let tag = buf[4];
                    let length = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) as usize;
                    let sequence = u32::from_be_bytes([buf[9], buf[10], buf[11], buf[12]]);

                    if length > MAX_MESSAGE_SIZE {
                        return Err(CodecError::MessageTooLarge(length, MAX_MESSAGE_SIZE));
                    }

                    buf.advance(HEADER_SIZE);

                    self.state = DecodeState::Payload {
                        tag,
                        length,
                        sequence,
                    };
                }
                DecodeState::Payload {
                    tag,
                    length,
                    sequence,
                } => {
                    if buf.len() < length {
                        return Ok(None);
                    }

                    let payload = buf.split_to(length);
                    self.state = DecodeState::Header;

                    let Some(kind) = FrameKind::from_tag(tag) else {
                        self.skipped += 1;
                        tracing::debug!(tag, sequence, length, "skipping frame with unknown type tag");
                        continue;
                    };

                    let message = match kind {
                        FrameKind::Handshake => Message::Handshake(bincode::deserialize(&payload)?),
                        FrameKind::Heartbeat => Message::Heartbeat(bincode::deserialize(&payload)?),
                        FrameKind::Control => Message::Control(bincode::deserialize(&payload)?),
                        FrameKind::Input => Message::Input(bincode::deserialize(&payload)?),
                    };

                    return Ok(Some(Frame::new(sequence, message)));
                }
            }
        }
    }

    /// Number of frames dropped because of an unknown type tag
    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::InputEvent;
    use crate::protocol::{ControlMessage, Heartbeat, MouseButton, ScreenEdge};

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut encoder = Encoder::new();
        let mut decoder = Decoder::new();
        let mut buf = BytesMut::new();

        let original = Message::Input(InputEvent::mouse_delta(100, -50));
        encoder.encode(&original, &mut buf).unwrap();

        let frame = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.message, original);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_multiple_messages_keep_order() {
        let mut encoder = Encoder::new();
        let mut decoder = Decoder::new();
        let mut buf = BytesMut::new();

        let messages = vec![
            Message::Heartbeat(Heartbeat { timestamp_us: 12345 }),
            Message::Input(InputEvent::button(MouseButton::Left, true)),
            Message::Control(ControlMessage::TransferRequest {
                transfer_id: 7,
                edge: ScreenEdge::Left,
                x: 0,
                y: 540,
            }),
            Message::Input(InputEvent::key(0x04, true)),
        ];

        for msg in &messages {
            encoder.encode(msg, &mut buf).unwrap();
        }

        for (original, sequence) in messages.iter().zip([0, 0, 1, 2]) {
            let frame = decoder.decode(&mut buf).unwrap().unwrap();
            assert_eq!(frame.sequence, sequence);
            assert_eq!(&frame.message, original);
        }
        assert!(decoder.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_heartbeats_leave_sequence_unchanged() {
        let mut encoder = Encoder::new();
        let mut buf = BytesMut::new();

        let first = encoder
            .encode(&Message::Input(InputEvent::key(0x04, true)), &mut buf)
            .unwrap();
        for _ in 0..5 {
            assert_eq!(encoder.encode(&Message::heartbeat(), &mut buf).unwrap(), first + 1);
        }
        let second = encoder
            .encode(&Message::Input(InputEvent::key(0x04, false)), &mut buf)
            .unwrap();
        assert_eq!(second, first + 1);
    }

    #[test]
    fn test_partial_frames() {
        let mut encoder = Encoder::new();
        let mut decoder = Decoder::new();
        let mut wire = BytesMut::new();
        encoder
            .encode(&Message::Input(InputEvent::scroll(0, -3)), &mut wire)
            .unwrap();

        let mut buf = BytesMut::new();
        let bytes = wire.to_vec();
        for (i, byte) in bytes.iter().enumerate() {
            buf.put_u8(*byte);
            let result = decoder.decode(&mut buf).unwrap();
            if i + 1 < bytes.len() {
                assert!(result.is_none());
            } else {
                assert!(result.is_some());
            }
        }
    }

    #[test]
    fn test_unknown_tag_is_skipped() {
        let mut encoder = Encoder::new();
        let mut decoder = Decoder::new();
        let mut buf = BytesMut::new();

        // Hand-built frame with a tag from a future protocol revision
        buf.put_slice(&MAGIC_BYTES);
        buf.put_u8(0x42);
        buf.put_u32(3);
        buf.put_u32(0);
        buf.put_slice(&[1, 2, 3]);

        let heartbeat = Message::Heartbeat(Heartbeat { timestamp_us: 1 });
        encoder.encode(&heartbeat, &mut buf).unwrap();

        let frame = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.message, heartbeat);
        assert_eq!(decoder.skipped(), 1);
    }

    #[test]
    fn test_invalid_magic() {
        let mut decoder = Decoder::new();
        let mut buf = BytesMut::from(&b"NOPE\x01\x00\x00\x00\x00\x00\x00\x00\x00"[..]);
        assert!(matches!(decoder.decode(&mut buf), Err(CodecError::InvalidMagic)));
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut decoder = Decoder::new();
        let mut buf = BytesMut::new();
        buf.put_slice(&MAGIC_BYTES);
        buf.put_u8(FrameKind::Input.tag());
        buf.put_u32((MAX_MESSAGE_SIZE + 1) as u32);
        buf.put_u32(0);
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(CodecError::MessageTooLarge(_, _))
        ));
    }

    #[test]
    fn test_garbage_payload_for_known_tag() {
        let mut decoder = Decoder::new();
        let mut buf = BytesMut::new();
        buf.put_slice(&MAGIC_BYTES);
        buf.put_u8(FrameKind::Control.tag());
        buf.put_u32(1);
        buf.put_u32(0);
        buf.put_u8(0xFF);
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(CodecError::Serialization(_))
        ));
    }
}
