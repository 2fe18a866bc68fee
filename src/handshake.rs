//! Login and bridge binding during bring-up.
//!
//! The handshake runs before any concurrent task exists, so it owns the
//! whole framed connection and is the only reader and writer. Requests are
//! still correlated through the [`PendingTable`]: each step registers a
//! pending entry, writes its frame and reads until the matching `RSP`
//! resolves the entry or the response timeout expires. Pings from the
//! server are answered while waiting; anything else is dropped.
//!
//! Bring-up is the one place outside the connection reader that answers
//! inbound pings, because the reader has not been started yet.

use std::{sync::Arc, time::Duration};

use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    time::Instant,
};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::{
    bridge::BridgeLink,
    codec::FrameCodec,
    correlation::PendingTable,
    error::{BridgeError, Result},
    frame::{Frame, MessageId, MessageType, Status},
};

/// Sequential request/response exchange over an exclusively held connection.
pub struct Handshake<'a, T> {
    framed: &'a mut Framed<T, FrameCodec>,
    pending: &'a Arc<PendingTable>,
    timeout: Duration,
}

impl<'a, T> Handshake<'a, T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    /// Borrow `framed` for the duration of the handshake.
    pub fn new(
        framed: &'a mut Framed<T, FrameCodec>,
        pending: &'a Arc<PendingTable>,
        timeout: Duration,
    ) -> Self {
        Self {
            framed,
            pending,
            timeout,
        }
    }

    /// Authenticate with `token`.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::AuthFailure`] when the server answers with a
    /// non-OK status, [`BridgeError::Timeout`] when it does not answer, and
    /// transport or codec errors if the connection fails.
    pub async fn login(&mut self, token: &str) -> Result<()> {
        let (id, status) = self.call(|id| Ok(Frame::login(id, token)?)).await?;
        if status.is_ok() {
            info!(id, "authenticated");
            Ok(())
        } else {
            warn!(id, %status, "login refused");
            Err(BridgeError::AuthFailure(status))
        }
    }

    /// Bind every link in order, stopping at the first failure.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::BindFailure`] naming the first link that was
    /// refused or timed out. Links after it are never sent.
    pub async fn bind_links<I>(&mut self, links: I) -> Result<Vec<BridgeLink>>
    where
        I: IntoIterator<Item = BridgeLink>,
    {
        let mut bound = Vec::new();
        for link in links {
            let index = link.index();
            let outcome = self.call(|id| link.bind_frame(id)).await.and_then(|(id, status)| {
                if status.is_ok() {
                    Ok(())
                } else {
                    Err(BridgeError::Rejected { id, status })
                }
            });
            if let Err(reason) = outcome {
                warn!(bridge = index, remote = link.remote_id(), error = %reason, "bridge bind failed");
                return Err(BridgeError::BindFailure {
                    index,
                    reason: Box::new(reason),
                });
            }
            info!(bridge = index, remote = link.remote_id(), "bridge bound");
            bound.push(link.into_bound());
        }
        Ok(bound)
    }

    async fn call<F>(&mut self, build: F) -> Result<(MessageId, Status)>
    where
        F: FnOnce(MessageId) -> Result<Frame>,
    {
        let request = self.pending.register()?;
        let id = request.id();
        let frame = build(id)?;
        debug!("< {frame}");
        self.framed.send(frame).await?;

        let deadline = Instant::now() + self.timeout;
        while self.pending.is_pending(id) {
            let Ok(next) = tokio::time::timeout_at(deadline, self.framed.next()).await else {
                return Err(BridgeError::Timeout {
                    id,
                    after: self.timeout,
                });
            };
            let Some(frame) = next else {
                return Err(BridgeError::Transport(std::io::ErrorKind::UnexpectedEof.into()));
            };
            self.handle(frame?).await?;
        }
        let status = request.wait(self.timeout).await?;
        Ok((id, status))
    }

    async fn handle(&mut self, frame: Frame) -> Result<()> {
        debug!("> {frame}");
        match (frame.kind(), frame.status()) {
            (MessageType::Response, Some(status)) => {
                if !self.pending.resolve(frame.id(), status) {
                    debug!(id = frame.id(), %status, "unmatched response during handshake");
                }
            }
            (MessageType::Ping, _) => {
                let reply = Frame::response(frame.id(), Status::OK);
                debug!("< {reply}");
                self.framed.send(reply).await?;
            }
            (kind, _) => debug!(%kind, id = frame.id(), "frame dropped during handshake"),
        }
        Ok(())
    }
}
