//! Error types for the codec layer.
//!
//! The taxonomy separates framing errors (the header or length cannot be
//! honoured), protocol errors (a well-framed message that the bridge does not
//! accept), I/O errors, and premature end-of-stream conditions.
//!
//! A clean close at a frame boundary is not an error: the decoder simply
//! yields no further frames.

use std::io;

use thiserror::Error;

use crate::frame::MessageType;

/// Framing-level errors.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FramingError {
    /// Body length exceeds what the codec or the length field allows.
    #[error("frame exceeds max length: {size} > {max}")]
    OversizedFrame {
        /// Body size that was requested or announced.
        size: usize,
        /// Maximum allowed body size.
        max: usize,
    },

    /// Responses carry a status in place of a body.
    #[error("response frames cannot carry a body")]
    ResponseBody,
}

/// Protocol-level errors found after a frame has been extracted.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The header names a message type the bridge does not know.
    #[error("unknown message type: {type_id}")]
    UnknownMessageType {
        /// Raw type byte.
        type_id: u8,
    },

    /// A known message type arrived where it is not allowed.
    #[error("unexpected {kind} frame")]
    UnexpectedMessageType {
        /// Offending message type.
        kind: MessageType,
    },

    /// A command carried the wrong number of fields.
    #[error("command `{command}` expects {expected} parameters, got {actual}")]
    FieldCount {
        /// Command name.
        command: String,
        /// Number of parameters required.
        expected: usize,
        /// Number of parameters received.
        actual: usize,
    },

    /// A pin field was not a decimal pin number.
    #[error("invalid pin number: {value:?}")]
    InvalidPin {
        /// Field as received.
        value: String,
    },

    /// A field that must be text was not valid UTF-8.
    #[error("field is not valid UTF-8")]
    InvalidText,
}

/// Premature end-of-stream conditions.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum EofError {
    /// The peer closed the connection while a body was being read.
    #[error("premature EOF: {bytes_received} bytes of {expected} byte body received")]
    MidFrame {
        /// Body bytes received before EOF.
        bytes_received: usize,
        /// Body size announced by the header.
        expected: usize,
    },

    /// The peer closed the connection while a header was being read.
    #[error("premature EOF during header: {bytes_received} of {header_size} header bytes")]
    MidHeader {
        /// Header bytes received before EOF.
        bytes_received: usize,
        /// Full header size.
        header_size: usize,
    },
}

/// Top-level codec error.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Framing layer error.
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    /// Protocol layer error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Transport layer I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// End-of-stream handling.
    #[error("EOF: {0}")]
    Eof(#[from] EofError),
}

impl CodecError {
    /// Returns the error category as a string for logging and metrics.
    ///
    /// One of: `"framing"`, `"protocol"`, `"io"`, or `"eof"`.
    #[must_use]
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Framing(_) => "framing",
            Self::Protocol(_) => "protocol",
            Self::Io(_) => "io",
            Self::Eof(_) => "eof",
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(CodecError::Framing(FramingError::ResponseBody), "framing")]
    #[case(CodecError::Protocol(ProtocolError::InvalidText), "protocol")]
    #[case(CodecError::Io(io::Error::other("reset")), "io")]
    #[case(
        CodecError::Eof(EofError::MidHeader { bytes_received: 2, header_size: 5 }),
        "eof"
    )]
    fn error_type_names_category(#[case] err: CodecError, #[case] expected: &str) {
        assert_eq!(err.error_type(), expected);
    }

    #[test]
    fn field_count_message_names_command() {
        let err = ProtocolError::FieldCount {
            command: "vw".into(),
            expected: 2,
            actual: 1,
        };
        assert_eq!(err.to_string(), "command `vw` expects 2 parameters, got 1");
    }
}
