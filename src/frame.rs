//! Frame model for the device protocol.
//!
//! Every frame starts with a fixed five byte header: a one byte message
//! type, a big-endian `u16` message id and a big-endian `u16` length. For
//! every type except [`MessageType::Response`] the length counts the body
//! bytes that follow the header. Responses carry no body; their length field
//! holds the [`Status`] of the request they acknowledge.
//!
//! Bodies of `HW` and `BRIDGE` frames are sequences of fields separated by a
//! single NUL byte.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::{FramingError, ProtocolError};

/// Size of the fixed frame header in bytes.
pub const HEADER_LEN: usize = 5;

/// Byte separating fields inside `HW` and `BRIDGE` bodies.
pub const FIELD_SEPARATOR: u8 = 0;

/// Largest body a single frame can describe.
pub const MAX_BODY_LEN: usize = u16::MAX as usize;

/// Identifier correlating a request with its response.
pub type MessageId = u16;

/// Message types understood by the bridge.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Acknowledgement of an earlier request, carrying a status.
    Response = 0,
    /// Authentication request whose body is the access token.
    Login = 2,
    /// Keepalive probe.
    Ping = 6,
    /// Traffic addressed to, or bound for, a sibling device session.
    Bridge = 15,
    /// Hardware command (`vw`, `vr`, `info`, ...).
    Hardware = 20,
}

impl MessageType {
    /// Return the on-wire code of this message type.
    #[must_use]
    pub const fn code(self) -> u8 { self as u8 }

    /// Short upper-case name used in logs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Response => "RSP",
            Self::Login => "LOGIN",
            Self::Ping => "PING",
            Self::Bridge => "BRIDGE",
            Self::Hardware => "HW",
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Response),
            2 => Ok(Self::Login),
            6 => Ok(Self::Ping),
            15 => Ok(Self::Bridge),
            20 => Ok(Self::Hardware),
            type_id => Err(ProtocolError::UnknownMessageType { type_id }),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.name()) }
}

/// Status code carried by a response frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Status(u16);

impl Status {
    /// The request succeeded.
    pub const OK: Self = Self(200);

    /// Wrap a raw status code.
    #[must_use]
    pub const fn new(code: u16) -> Self { Self(code) }

    /// Return the raw status code.
    #[must_use]
    pub const fn code(self) -> u16 { self.0 }

    /// Whether this status reports success.
    #[must_use]
    pub const fn is_ok(self) -> bool { self.0 == Self::OK.0 }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
}

/// Decoded frame header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    /// Message type.
    pub kind: MessageType,
    /// Message id.
    pub id: MessageId,
    /// Body length, or the status code for responses.
    pub length: u16,
}

impl FrameHeader {
    /// Number of body bytes following this header on the wire.
    #[must_use]
    pub fn body_len(&self) -> usize {
        match self.kind {
            MessageType::Response => 0,
            _ => usize::from(self.length),
        }
    }
}

/// A single protocol frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    header: FrameHeader,
    body: Bytes,
}

impl Frame {
    /// Build a body-carrying frame.
    ///
    /// # Errors
    ///
    /// Returns [`FramingError::OversizedFrame`] if `body` does not fit the
    /// 16-bit length field and [`FramingError::ResponseBody`] if `kind` is
    /// [`MessageType::Response`]; use [`Frame::response`] for those.
    pub fn new(kind: MessageType, id: MessageId, body: impl Into<Bytes>) -> Result<Self, FramingError> {
        if kind == MessageType::Response {
            return Err(FramingError::ResponseBody);
        }
        let body = body.into();
        let length = u16::try_from(body.len()).map_err(|_| FramingError::OversizedFrame {
            size: body.len(),
            max: MAX_BODY_LEN,
        })?;
        Ok(Self {
            header: FrameHeader { kind, id, length },
            body,
        })
    }

    /// Build a response acknowledging `id` with `status`.
    #[must_use]
    pub fn response(id: MessageId, status: Status) -> Self {
        Self {
            header: FrameHeader {
                kind: MessageType::Response,
                id,
                length: status.code(),
            },
            body: Bytes::new(),
        }
    }

    /// Build an empty keepalive frame.
    #[must_use]
    pub fn ping(id: MessageId) -> Self {
        Self {
            header: FrameHeader {
                kind: MessageType::Ping,
                id,
                length: 0,
            },
            body: Bytes::new(),
        }
    }

    /// Build a login frame carrying `token` as its body.
    ///
    /// # Errors
    ///
    /// Returns [`FramingError::OversizedFrame`] if the token is too long.
    pub fn login(id: MessageId, token: &str) -> Result<Self, FramingError> {
        Self::new(MessageType::Login, id, Bytes::copy_from_slice(token.as_bytes()))
    }

    /// Build a `HW` frame from NUL-joined `fields`.
    ///
    /// # Errors
    ///
    /// Returns [`FramingError::OversizedFrame`] if the joined body is too long.
    pub fn hardware<I>(id: MessageId, fields: I) -> Result<Self, FramingError>
    where
        I: IntoIterator,
        I::Item: AsRef<[u8]>,
    {
        Self::new(MessageType::Hardware, id, join_fields(fields))
    }

    /// Build a `BRIDGE` frame from NUL-joined `fields`.
    ///
    /// # Errors
    ///
    /// Returns [`FramingError::OversizedFrame`] if the joined body is too long.
    pub fn bridge<I>(id: MessageId, fields: I) -> Result<Self, FramingError>
    where
        I: IntoIterator,
        I::Item: AsRef<[u8]>,
    {
        Self::new(MessageType::Bridge, id, join_fields(fields))
    }

    pub(crate) fn from_parts(header: FrameHeader, body: Bytes) -> Self { Self { header, body } }

    /// Frame header.
    #[must_use]
    pub fn header(&self) -> FrameHeader { self.header }

    /// Message type.
    #[must_use]
    pub fn kind(&self) -> MessageType { self.header.kind }

    /// Message id.
    #[must_use]
    pub fn id(&self) -> MessageId { self.header.id }

    /// Body bytes, empty for responses.
    #[must_use]
    pub fn body(&self) -> &Bytes { &self.body }

    /// Status carried by a response frame.
    #[must_use]
    pub fn status(&self) -> Option<Status> {
        (self.header.kind == MessageType::Response).then_some(Status::new(self.header.length))
    }

    /// Total number of bytes this frame occupies on the wire.
    #[must_use]
    pub fn wire_len(&self) -> usize { HEADER_LEN + self.body.len() }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status() {
            Some(status) => write!(f, "{} id={} status={status}", self.kind(), self.id()),
            None => write!(
                f,
                "{} id={} len={} [{}]",
                self.kind(),
                self.id(),
                self.body.len(),
                render_fields(&self.body)
            ),
        }
    }
}

/// Join `fields` with the NUL separator.
pub fn join_fields<I>(fields: I) -> Bytes
where
    I: IntoIterator,
    I::Item: AsRef<[u8]>,
{
    let mut buf = BytesMut::new();
    for (i, field) in fields.into_iter().enumerate() {
        if i > 0 {
            buf.put_u8(FIELD_SEPARATOR);
        }
        buf.extend_from_slice(field.as_ref());
    }
    buf.freeze()
}

/// Split a body on the NUL separator.
///
/// An empty body yields a single empty field.
#[must_use]
pub fn split_fields(body: &[u8]) -> Vec<&[u8]> { body.split(|b| *b == FIELD_SEPARATOR).collect() }

/// Render a body for logs with separators shown as spaces.
#[must_use]
pub fn render_fields(body: &[u8]) -> String {
    split_fields(body)
        .into_iter()
        .map(String::from_utf8_lossy)
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(0, MessageType::Response)]
    #[case(2, MessageType::Login)]
    #[case(6, MessageType::Ping)]
    #[case(15, MessageType::Bridge)]
    #[case(20, MessageType::Hardware)]
    fn message_type_codes_match_wire_values(#[case] code: u8, #[case] kind: MessageType) {
        assert_eq!(MessageType::try_from(code).expect("known type"), kind);
        assert_eq!(kind.code(), code);
    }

    #[test]
    fn unknown_message_type_is_a_protocol_error() {
        let err = MessageType::try_from(7).expect_err("7 is not a message type");
        assert_eq!(err, ProtocolError::UnknownMessageType { type_id: 7 });
    }

    #[test]
    fn response_carries_status_in_length_field() {
        let frame = Frame::response(42, Status::new(403));
        assert_eq!(frame.header().length, 403);
        assert_eq!(frame.header().body_len(), 0);
        assert_eq!(frame.status(), Some(Status::new(403)));
        assert!(frame.body().is_empty());
    }

    #[test]
    fn body_frames_have_no_status() {
        let frame = Frame::hardware(3, ["vw", "1", "on"]).expect("small body");
        assert_eq!(frame.status(), None);
        assert_eq!(frame.body().as_ref(), b"vw\x001\x00on");
        assert_eq!(usize::from(frame.header().length), frame.body().len());
    }

    #[test]
    fn new_rejects_response_kind() {
        let err = Frame::new(MessageType::Response, 1, Bytes::new()).expect_err("responses have no body");
        assert_eq!(err, FramingError::ResponseBody);
    }

    #[test]
    fn new_rejects_bodies_longer_than_length_field() {
        let body = vec![b'x'; MAX_BODY_LEN + 1];
        let err = Frame::new(MessageType::Hardware, 1, body).expect_err("body too long");
        assert_eq!(
            err,
            FramingError::OversizedFrame {
                size: MAX_BODY_LEN + 1,
                max: MAX_BODY_LEN,
            }
        );
    }

    #[rstest]
    #[case(b"vw\x007\x0023.5".as_slice(), vec![b"vw".as_slice(), b"7", b"23.5"])]
    #[case(b"info".as_slice(), vec![b"info".as_slice()])]
    #[case(b"vw\x00\x00x".as_slice(), vec![b"vw".as_slice(), b"", b"x"])]
    #[case(b"".as_slice(), vec![b"".as_slice()])]
    fn split_fields_keeps_empty_fields(#[case] body: &[u8], #[case] expected: Vec<&[u8]>) {
        assert_eq!(split_fields(body), expected);
    }

    #[test]
    fn render_fields_uses_spaces() {
        assert_eq!(render_fields(b"1\x00vw\x002\x00on"), "1 vw 2 on");
    }
}
