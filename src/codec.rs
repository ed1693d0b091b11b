// Copyright 2026 Branch Mesh Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Length-prefixed framing for [`Envelope`]s over a [`tokio_util::codec::Framed`]
//! stream: a `u32` big-endian byte count followed by a JSON-encoded body.
//! JSON keeps the wire format legible for the key-value payloads replicated
//! log entries carry, without needing a schema registry.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::TransportError;
use crate::message::Envelope;

/// Frames larger than this are treated as corrupt rather than read into
/// memory; no envelope this crate constructs approaches the limit.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;
const LENGTH_PREFIX_LEN: usize = 4;

#[derive(Debug, Clone, Default)]
pub struct EnvelopeCodec;

impl EnvelopeCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Envelope>, TransportError> {
        if src.len() < LENGTH_PREFIX_LEN {
            return Ok(None);
        }

        let len = u32::from_be_bytes(src[..LENGTH_PREFIX_LEN].try_into().expect("checked len")) as usize;
        if len > MAX_FRAME_LEN {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("frame of {len} bytes exceeds max frame length {MAX_FRAME_LEN}"),
            )));
        }

        if src.len() < LENGTH_PREFIX_LEN + len {
            src.reserve(LENGTH_PREFIX_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_LEN);
        let body = src.split_to(len);
        let envelope: Envelope = serde_json::from_slice(&body)?;
        Ok(Some(envelope))
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = TransportError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), TransportError> {
        let body = serde_json::to_vec(&item)?;
        if body.len() > MAX_FRAME_LEN {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("encoded envelope of {} bytes exceeds max frame length", body.len()),
            )));
        }
        dst.reserve(LENGTH_PREFIX_LEN + body.len());
        dst.put_u32(body.len() as u32);
        dst.extend_from_slice(&body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Payload;

    fn sample() -> Envelope {
        Envelope::new("A", 3, Payload::StockTransferRequest { quantity: 4 }).to("B")
    }

    #[test]
    fn round_trips_a_single_frame() {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(sample(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.sender_id, "A");
        assert!(buf.is_empty());
    }

    #[test]
    fn returns_none_on_partial_frame() {
        let mut codec = EnvelopeCodec::new();
        let mut full = BytesMut::new();
        codec.encode(sample(), &mut full).unwrap();

        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn decodes_two_frames_back_to_back() {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(sample(), &mut buf).unwrap();
        codec.encode(sample(), &mut buf).unwrap();

        assert!(codec.decode(&mut buf).unwrap().is_some());
        assert!(codec.decode(&mut buf).unwrap().is_some());
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn oversized_length_prefix_is_rejected() {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_LEN + 1) as u32);
        assert!(codec.decode(&mut buf).is_err());
    }
}
