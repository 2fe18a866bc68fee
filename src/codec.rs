//! Wire codec for device protocol frames.
//!
//! [`FrameCodec`] implements Tokio's [`Decoder`] and [`Encoder`] so the
//! connection halves can be wrapped in `FramedRead` and `FramedWrite`. The
//! decoder waits for a complete header, validates the message type and then
//! waits for the announced body before yielding a [`Frame`].
//!
//! # Error Handling
//!
//! Decoding fails with a [`CodecError`]: unknown message types surface as
//! [`ProtocolError::UnknownMessageType`], oversized bodies as
//! [`FramingError::OversizedFrame`], and a connection that closes inside a
//! frame as an [`EofError`]. A close at a frame boundary ends the stream
//! without an error.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::frame::{Frame, FrameHeader, HEADER_LEN, MAX_BODY_LEN, MessageType};

pub mod error;

pub use error::{CodecError, EofError, FramingError, ProtocolError};

/// Decode a frame header from its on-wire representation.
///
/// # Errors
///
/// Returns [`ProtocolError::UnknownMessageType`] if the type byte is not a
/// known [`MessageType`].
pub fn decode_header(bytes: [u8; HEADER_LEN]) -> Result<FrameHeader, ProtocolError> {
    let mut buf = &bytes[..];
    let kind = MessageType::try_from(buf.get_u8())?;
    let id = buf.get_u16();
    let length = buf.get_u16();
    Ok(FrameHeader { kind, id, length })
}

/// Append the wire representation of `frame` to `dst`.
pub fn encode_into(frame: &Frame, dst: &mut BytesMut) {
    let header = frame.header();
    dst.reserve(frame.wire_len());
    dst.put_u8(header.kind.code());
    dst.put_u16(header.id);
    dst.put_u16(header.length);
    dst.extend_from_slice(frame.body());
}

/// Encode `frame` into a fresh buffer.
#[must_use]
pub fn encode(frame: &Frame) -> Bytes {
    let mut dst = BytesMut::with_capacity(frame.wire_len());
    encode_into(frame, &mut dst);
    dst.freeze()
}

/// Tokio codec for device protocol frames.
#[derive(Clone, Copy, Debug)]
pub struct FrameCodec {
    max_body_len: usize,
}

impl FrameCodec {
    /// Construct a codec accepting bodies of at most `max_body_len` bytes.
    ///
    /// Values above the 16-bit length field limit are clamped.
    #[must_use]
    pub fn new(max_body_len: usize) -> Self {
        Self {
            max_body_len: max_body_len.min(MAX_BODY_LEN),
        }
    }

    /// Return the maximum body length accepted by this codec.
    #[must_use]
    pub fn max_body_len(&self) -> usize { self.max_body_len }
}

impl Default for FrameCodec {
    fn default() -> Self { Self::new(MAX_BODY_LEN) }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(raw) = src
            .get(..HEADER_LEN)
            .and_then(|slice| <[u8; HEADER_LEN]>::try_from(slice).ok())
        else {
            return Ok(None);
        };
        let header = decode_header(raw)?;
        let body_len = header.body_len();
        if body_len > self.max_body_len {
            return Err(FramingError::OversizedFrame {
                size: body_len,
                max: self.max_body_len,
            }
            .into());
        }

        let total = HEADER_LEN + body_len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let mut frame_bytes = src.split_to(total);
        frame_bytes.advance(HEADER_LEN);
        Ok(Some(Frame::from_parts(header, frame_bytes.freeze())))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None => Err(build_eof_error(src).into()),
        }
    }
}

/// Describe where in a frame the peer hung up.
fn build_eof_error(src: &BytesMut) -> EofError {
    let bytes_received = src.len();
    let expected = src
        .get(..HEADER_LEN)
        .and_then(|slice| <[u8; HEADER_LEN]>::try_from(slice).ok())
        .and_then(|raw| decode_header(raw).ok())
        .map(|header| header.body_len());

    match expected {
        Some(expected) => EofError::MidFrame {
            bytes_received: bytes_received.saturating_sub(HEADER_LEN),
            expected,
        },
        None => EofError::MidHeader {
            bytes_received,
            header_size: HEADER_LEN,
        },
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.body().len() > self.max_body_len {
            return Err(FramingError::OversizedFrame {
                size: item.body().len(),
                max: self.max_body_len,
            }
            .into());
        }
        encode_into(&item, dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests;
