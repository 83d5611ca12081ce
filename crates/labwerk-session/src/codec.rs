// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Frame codec: length-delimited envelopes of `u32 header_len | JSON | body`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Deserialize;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use labwerk_core::error::{LabwerkError, Result};

use crate::protocol::{Frame, Message};

/// Largest envelope accepted from the wire.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

const HEADER_LEN_PREFIX: usize = 4;

pub struct EnvelopeCodec {
    inner: LengthDelimitedCodec,
}

impl EnvelopeCodec {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .max_frame_length(MAX_FRAME_LEN)
                .new_codec(),
        }
    }
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Message;
    type Error = LabwerkError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        let Some(mut envelope) = self.inner.decode(src)? else {
            return Ok(None);
        };
        if envelope.len() < HEADER_LEN_PREFIX {
            return Err(LabwerkError::Protocol(format!(
                "envelope of {} bytes has no header length",
                envelope.len()
            )));
        }
        let header_len = envelope.get_u32() as usize;
        if header_len > envelope.len() {
            return Err(LabwerkError::Protocol(format!(
                "header length {header_len} exceeds envelope ({} bytes left)",
                envelope.len()
            )));
        }
        let header = envelope.split_to(header_len);
        let frame = match serde_json::from_slice::<Frame>(&header) {
            Ok(frame) => frame,
            Err(e) => rejected_call(&header, e)?,
        };
        Ok(Some(Message {
            frame,
            body: envelope.freeze(),
        }))
    }
}

/// The part of a call header needed to answer it.
#[derive(Deserialize)]
struct CallEnvelope {
    #[serde(rename = "type")]
    kind: String,
    id: u64,
}

/// A call with unusable arguments is answered, not fatal. Anything else
/// that fails to parse is a protocol violation.
fn rejected_call(header: &[u8], err: serde_json::Error) -> Result<Frame> {
    match serde_json::from_slice::<CallEnvelope>(header) {
        Ok(envelope) if envelope.kind == "call" => Ok(Frame::Malformed {
            id: envelope.id,
            reason: format!("bad call arguments: {err}"),
        }),
        _ => Err(LabwerkError::Protocol(format!("bad frame header: {err}"))),
    }
}

impl Encoder<Message> for EnvelopeCodec {
    type Error = LabwerkError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<()> {
        let header = serde_json::to_vec(&item.frame)?;
        let mut envelope = BytesMut::with_capacity(HEADER_LEN_PREFIX + header.len() + item.body.len());
        envelope.put_u32(header.len() as u32);
        envelope.extend_from_slice(&header);
        envelope.extend_from_slice(&item.body);
        let envelope: Bytes = envelope.freeze();
        self.inner.encode(envelope, dst)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Call, PayloadDescriptor};

    #[test]
    fn partial_input_waits_for_more() {
        let mut codec = EnvelopeCodec::new();
        let mut wire = BytesMut::new();
        codec
            .encode(
                Message::with_body(
                    Frame::Call {
                        id: 3,
                        call: Call::Print {
                            selector: labwerk_core::DeviceSelector::Index(0),
                            copies: serde_json::json!(1),
                        },
                        payload: PayloadDescriptor::Inline,
                    },
                    Bytes::from_static(b"^XA^FDlabel^XZ"),
                ),
                &mut wire,
            )
            .unwrap();

        let mut head = wire.split_to(wire.len() / 2);
        assert!(codec.decode(&mut head).unwrap().is_none());
        head.unsplit(wire);
        let msg = codec.decode(&mut head).unwrap().expect("full frame");
        assert_eq!(&msg.body[..], b"^XA^FDlabel^XZ");
        assert!(matches!(msg.frame, Frame::Call { id: 3, .. }));
        assert!(head.is_empty());
    }

    #[test]
    fn two_frames_in_one_read() {
        let mut codec = EnvelopeCodec::new();
        let mut wire = BytesMut::new();
        codec.encode(Message::new(Frame::HeartbeatAck { seq: 1 }), &mut wire).unwrap();
        codec.encode(Message::new(Frame::HeartbeatAck { seq: 2 }), &mut wire).unwrap();

        let first = codec.decode(&mut wire).unwrap().unwrap();
        let second = codec.decode(&mut wire).unwrap().unwrap();
        assert_eq!(first.frame, Frame::HeartbeatAck { seq: 1 });
        assert_eq!(second.frame, Frame::HeartbeatAck { seq: 2 });
        assert!(second.body.is_empty());
    }

    #[test]
    fn oversized_header_length_is_a_protocol_error() {
        let mut inner = LengthDelimitedCodec::new();
        let mut bogus = BytesMut::new();
        bogus.put_u32(1000);
        bogus.extend_from_slice(b"{}");
        let mut wire = BytesMut::new();
        inner.encode(bogus.freeze(), &mut wire).unwrap();

        let err = EnvelopeCodec::new().decode(&mut wire).unwrap_err();
        assert!(matches!(err, LabwerkError::Protocol(_)));
    }

    fn raw(header: &serde_json::Value) -> BytesMut {
        let header = serde_json::to_vec(header).unwrap();
        let mut envelope = BytesMut::new();
        envelope.put_u32(header.len() as u32);
        envelope.extend_from_slice(&header);
        let mut wire = BytesMut::new();
        LengthDelimitedCodec::new()
            .encode(envelope.freeze(), &mut wire)
            .unwrap();
        wire
    }

    #[test]
    fn call_with_bad_arguments_is_kept_for_an_answer() {
        let mut wire = raw(&serde_json::json!({
            "type": "call",
            "id": 9,
            "call": {"method": "print", "selector": {"shelf": 2}, "copies": 1}
        }));
        let msg = EnvelopeCodec::new().decode(&mut wire).unwrap().unwrap();
        assert!(matches!(msg.frame, Frame::Malformed { id: 9, .. }));
    }

    #[test]
    fn unknown_frame_type_is_a_protocol_error() {
        let mut wire = raw(&serde_json::json!({"type": "teleport", "id": 1}));
        let err = EnvelopeCodec::new().decode(&mut wire).unwrap_err();
        assert!(matches!(err, LabwerkError::Protocol(_)));
    }

    #[test]
    fn garbage_header_is_a_protocol_error() {
        let mut inner = LengthDelimitedCodec::new();
        let mut bogus = BytesMut::new();
        bogus.put_u32(5);
        bogus.extend_from_slice(b"hello");
        let mut wire = BytesMut::new();
        inner.encode(bogus.freeze(), &mut wire).unwrap();

        let err = EnvelopeCodec::new().decode(&mut wire).unwrap_err();
        assert!(matches!(err, LabwerkError::Protocol(_)));
    }
}
