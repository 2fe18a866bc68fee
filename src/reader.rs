//! The single consumer of inbound bytes.
//!
//! Exactly one [`ConnectionReader`] exists per session and it reads for the
//! session's whole lifetime. Other components that need a correlated reply
//! register with the [`PendingTable`] and wait; they never touch the read
//! half.

use std::sync::Arc;

use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio_util::{codec::FramedRead, sync::CancellationToken};
use tracing::{debug, warn};

use crate::{
    codec::{CodecError, FrameCodec, ProtocolError},
    correlation::PendingTable,
    dispatch::CommandDispatcher,
    frame::{Frame, MessageType, Status},
    heartbeat::Liveness,
    writer::FrameSink,
};

/// How the reader loop ended without an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReaderExit {
    /// The peer closed the connection between frames.
    PeerClosed,
    /// Teardown cancelled the reader or the write path went away.
    Cancelled,
}

/// Reads frames and routes them by message type.
pub struct ConnectionReader<R> {
    frames: FramedRead<R, FrameCodec>,
    pending: Arc<PendingTable>,
    sink: FrameSink,
    dispatcher: CommandDispatcher,
    liveness: Arc<Liveness>,
}

impl<R> std::fmt::Debug for ConnectionReader<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionReader")
            .field("pending", &self.pending)
            .field("buffered", &self.frames.read_buffer().len())
            .finish_non_exhaustive()
    }
}

impl<R> ConnectionReader<R>
where
    R: AsyncRead + Unpin,
{
    /// Create a reader over `frames`.
    ///
    /// `frames` may already hold bytes read during the handshake.
    #[must_use]
    pub fn new(
        frames: FramedRead<R, FrameCodec>,
        pending: Arc<PendingTable>,
        sink: FrameSink,
        dispatcher: CommandDispatcher,
        liveness: Arc<Liveness>,
    ) -> Self {
        Self {
            frames,
            pending,
            sink,
            dispatcher,
            liveness,
        }
    }

    /// Read until the peer disconnects, a protocol violation occurs, or
    /// `shutdown` fires.
    ///
    /// # Errors
    ///
    /// Returns the codec error that ended the session: an I/O failure, a
    /// truncated frame, an unknown message type, or a frame type the server
    /// must never send.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<ReaderExit, CodecError> {
        loop {
            let next = tokio::select! {
                biased;
                () = shutdown.cancelled() => return Ok(ReaderExit::Cancelled),
                next = self.frames.next() => next,
            };
            let Some(frame) = next else {
                debug!("peer closed connection");
                return Ok(ReaderExit::PeerClosed);
            };
            let frame = frame?;
            self.liveness.touch();
            #[cfg(feature = "metrics")]
            crate::metrics::inc_frames(crate::metrics::Direction::Inbound);
            debug!("> {frame}");

            if !self.handle(frame).await? {
                return Ok(ReaderExit::Cancelled);
            }
        }
    }

    /// Route one frame. Returns `false` once the write path is gone.
    async fn handle(&mut self, frame: Frame) -> Result<bool, CodecError> {
        let id = frame.id();
        match frame.kind() {
            MessageType::Response => {
                let status = frame.status().unwrap_or(Status::OK);
                if !self.pending.resolve(id, status) {
                    debug!(id, %status, "unmatched response discarded");
                }
            }
            MessageType::Ping => {
                if self.sink.submit(Frame::response(id, Status::OK)).await.is_err() {
                    return Ok(false);
                }
            }
            kind @ (MessageType::Hardware | MessageType::Bridge) => {
                if let Err(error) = self.dispatcher.dispatch(kind, frame.body().clone()).await {
                    warn!(%kind, id, %error, "device command not applied");
                }
            }
            kind @ MessageType::Login => {
                return Err(ProtocolError::UnexpectedMessageType { kind }.into());
            }
        }
        Ok(true)
    }
}
