//! Canonical error and result types for the bridge.
//!
//! Each fallible operation reports a [`BridgeError`]. Which variants are
//! fatal depends on the call site: during bring-up every error ends the
//! process, while in the concurrent phase bridge forwards and best-effort
//! replies log the error and carry on.

use std::time::Duration;

use thiserror::Error;

use crate::{
    codec::{CodecError, FramingError, ProtocolError},
    frame::{MessageId, Status},
};

/// Top-level error type exposed by `pinbridge`.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The connection failed or the write path is gone.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Framing or protocol violation.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// No correlated response arrived in time.
    #[error("request {id} timed out after {after:?}")]
    Timeout {
        /// Id of the request that went unanswered.
        id: MessageId,
        /// How long the requester waited.
        after: Duration,
    },

    /// The server refused the access token.
    #[error("authentication failed with status {0}")]
    AuthFailure(Status),

    /// A bridge link could not be bound during bring-up.
    #[error("bridge {index} failed to bind: {reason}")]
    BindFailure {
        /// 1-based link index.
        index: usize,
        /// Underlying failure.
        #[source]
        reason: Box<BridgeError>,
    },

    /// The peer answered a request with a non-OK status.
    #[error("request {id} rejected with status {status}")]
    Rejected {
        /// Id of the rejected request.
        id: MessageId,
        /// Status carried by the response.
        status: Status,
    },

    /// A forward named a link that is not configured or not bound.
    #[error("no bound bridge link at position {0}")]
    UnknownLink(usize),

    /// The session ended before the operation completed.
    #[error("session closed")]
    SessionClosed,

    /// The message bus refused an operation.
    #[error("message bus error: {0}")]
    Bus(String),
}

impl BridgeError {
    /// Whether this error stems from a protocol violation.
    #[must_use]
    pub fn is_protocol(&self) -> bool { matches!(self, Self::Codec(CodecError::Protocol(_))) }
}

impl From<ProtocolError> for BridgeError {
    fn from(error: ProtocolError) -> Self { Self::Codec(CodecError::Protocol(error)) }
}

impl From<FramingError> for BridgeError {
    fn from(error: FramingError) -> Self { Self::Codec(CodecError::Framing(error)) }
}

/// Canonical result alias used by `pinbridge` APIs.
pub type Result<T, E = BridgeError> = std::result::Result<T, E>;
