// src/api/codec.rs

//! The message-body encoding seam.
//!
//! The rest of the API layer treats payload encoding as an opaque
//! `encode(message) -> bytes` capability. Concretely it is bincode with the
//! standard configuration; swapping the codec means touching only this file.

use crate::api::frame::{Frame, FrameCodec};
use crate::api::message::ApiMessage;
use crate::core::EmberlinkError;
use bytes::{Bytes, BytesMut};
use tokio_util::codec::Encoder;

/// Encodes a message body into payload bytes.
pub fn encode_payload(msg: &ApiMessage) -> Result<Vec<u8>, EmberlinkError> {
    Ok(bincode::encode_to_vec(msg, bincode::config::standard())?)
}

/// Decodes a frame's payload back into a typed message.
///
/// The frame header's message type must agree with the decoded message; a
/// mismatch means the peer framed one message as another and is treated as a
/// protocol violation.
pub fn decode_payload(frame: &Frame) -> Result<ApiMessage, EmberlinkError> {
    let (msg, consumed): (ApiMessage, usize) =
        bincode::decode_from_slice(&frame.payload, bincode::config::standard())?;
    if consumed != frame.payload.len() {
        return Err(EmberlinkError::ProtocolViolation(format!(
            "{} trailing payload bytes",
            frame.payload.len() - consumed
        )));
    }
    if msg.message_type() != frame.msg_type {
        return Err(EmberlinkError::ProtocolViolation(format!(
            "frame type {} does not match payload type {}",
            frame.msg_type,
            msg.message_type()
        )));
    }
    Ok(msg)
}

/// Encodes a message into a complete, ready-to-send frame.
///
/// Fan-out paths call this once per broadcast and hand the resulting `Bytes`
/// to each connection, so the encoding cost is paid once, not per client.
pub fn encode_frame(msg: &ApiMessage) -> Result<Bytes, EmberlinkError> {
    let payload = encode_payload(msg)?;
    let mut buf = BytesMut::with_capacity(payload.len() + 8);
    FrameCodec.encode(
        Frame {
            msg_type: msg.message_type(),
            payload: payload.into(),
        },
        &mut buf,
    )?;
    Ok(buf.freeze())
}
