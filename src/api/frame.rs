// src/api/frame.rs

//! Implements the length-prefixed API frame structure and the corresponding
//! `Encoder` and `Decoder` for network communication.
//!
//! Wire layout of one frame:
//!
//! ```text
//! [0x00 indicator][varint payload_len][varint message_type][payload bytes]
//! ```
//!
//! Varints are LEB128 (7 data bits per byte, continuation in the high bit),
//! at most 5 bytes / 32 bits. Partial frames persist in the decoder's input
//! buffer across event-loop ticks until completed by a later read.

use crate::core::EmberlinkError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// First byte of every plaintext frame. A nonzero indicator would mean an
/// encrypted transport frame, which this codec does not speak.
const INDICATOR_PLAINTEXT: u8 = 0x00;

// Protocol-level limits to prevent resource-exhaustion by a hostile peer.
const MAX_PAYLOAD_SIZE: usize = 64 * 1024;
const MAX_MESSAGE_TYPE: u32 = u16::MAX as u32;
const MAX_VARINT_BYTES: usize = 5;

/// A single length-delimited unit of the wire protocol, carrying exactly one
/// encoded message of the given type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: u16,
    pub payload: Bytes,
}

/// A `tokio_util::codec` implementation for encoding and decoding [`Frame`]s.
#[derive(Debug, Default)]
pub struct FrameCodec;

impl Encoder<Frame> for FrameCodec {
    type Error = EmberlinkError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(EmberlinkError::FrameTooLarge);
        }
        dst.reserve(1 + 2 * MAX_VARINT_BYTES + item.payload.len());
        dst.put_u8(INDICATOR_PLAINTEXT);
        put_varint(dst, item.payload.len() as u32);
        put_varint(dst, item.msg_type as u32);
        dst.extend_from_slice(&item.payload);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = EmberlinkError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        if src[0] != INDICATOR_PLAINTEXT {
            return Err(EmberlinkError::ProtocolViolation(format!(
                "invalid frame indicator 0x{:02X}",
                src[0]
            )));
        }

        let mut header = &src[1..];
        let Some(payload_len) = get_varint(&mut header)? else {
            return Ok(None);
        };
        let payload_len = payload_len as usize;
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(EmberlinkError::FrameTooLarge);
        }

        let Some(msg_type) = get_varint(&mut header)? else {
            return Ok(None);
        };
        if msg_type > MAX_MESSAGE_TYPE {
            return Err(EmberlinkError::ProtocolViolation(format!(
                "message type {msg_type} out of range"
            )));
        }

        let header_len = src.len() - header.len();
        if header.len() < payload_len {
            // Partial frame; hint at how much more we expect.
            src.reserve(header_len + payload_len - src.len());
            return Ok(None);
        }

        src.advance(header_len);
        let payload = src.split_to(payload_len).freeze();
        Ok(Some(Frame {
            msg_type: msg_type as u16,
            payload,
        }))
    }
}

/// Appends `value` as a LEB128 varint.
pub fn put_varint(dst: &mut BytesMut, mut value: u32) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            dst.put_u8(byte);
            return;
        }
        dst.put_u8(byte | 0x80);
    }
}

/// Parses a LEB128 varint from the front of `src`, advancing it.
///
/// Returns `Ok(None)` when the buffer ends mid-varint (more data needed) and
/// an error when the encoding exceeds 32 bits.
pub fn get_varint(src: &mut &[u8]) -> Result<Option<u32>, EmberlinkError> {
    let mut value: u32 = 0;
    for i in 0..MAX_VARINT_BYTES {
        let Some(&byte) = src.get(i) else {
            return Ok(None);
        };
        let bits = (byte & 0x7F) as u32;
        if i == MAX_VARINT_BYTES - 1 && (byte & 0x80 != 0 || bits > 0x0F) {
            return Err(EmberlinkError::ProtocolViolation(
                "varint exceeds 32 bits".to_string(),
            ));
        }
        value |= bits << (7 * i);
        if byte & 0x80 == 0 {
            *src = &src[i + 1..];
            return Ok(Some(value));
        }
    }
    unreachable!("varint loop covers all exits");
}
