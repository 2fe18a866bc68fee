//! Single-writer path onto the device connection.
//!
//! Every producer (heartbeat, bus handler, the reader's ping replies,
//! bridge forwards) submits frames through a cloneable [`FrameSink`]. The
//! sink feeds a bounded queue drained by exactly one [`FrameWriter`] task,
//! which owns the write half of the connection. Each frame is encoded and
//! flushed as a unit, so concurrently submitted frames never interleave on
//! the wire. Ordering between concurrent submitters is unspecified.

use std::{sync::Arc, time::Duration};

use futures::SinkExt;
use leaky_bucket::RateLimiter;
use tokio::{io::AsyncWrite, sync::mpsc};
use tokio_util::{codec::FramedWrite, sync::CancellationToken};
use tracing::{debug, trace};

use crate::{
    codec::{CodecError, FrameCodec},
    error::{BridgeError, Result},
    frame::Frame,
};

/// Default number of frames that may wait for the writer.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Cloneable handle used by producers to submit frames.
#[derive(Clone)]
pub struct FrameSink {
    tx: mpsc::Sender<Frame>,
    limiter: Option<Arc<RateLimiter>>,
}

impl std::fmt::Debug for FrameSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameSink")
            .field("closed", &self.tx.is_closed())
            .field("rate_limited", &self.limiter.is_some())
            .finish()
    }
}

impl FrameSink {
    /// Queue `frame` for writing.
    ///
    /// Waits while the queue is full or the rate limiter has no tokens.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::SessionClosed`] if the writer has stopped.
    pub async fn submit(&self, frame: Frame) -> Result<()> {
        let permit = self
            .tx
            .clone()
            .reserve_owned()
            .await
            .map_err(|_| BridgeError::SessionClosed)?;

        if let Some(limiter) = &self.limiter {
            limiter.acquire(1).await;
        }

        trace!(%frame, "frame queued");
        let returned_tx = permit.send(frame);
        if returned_tx.is_closed() {
            return Err(BridgeError::SessionClosed);
        }
        Ok(())
    }

    /// Whether the writer has stopped accepting frames.
    #[must_use]
    pub fn is_closed(&self) -> bool { self.tx.is_closed() }
}

/// Owner of the connection's write half.
#[derive(Debug)]
pub struct FrameWriter {
    rx: mpsc::Receiver<Frame>,
}

/// Create a connected sink/writer pair.
///
/// `max_rate` throttles frames per second when set.
#[must_use]
pub fn frame_channel(capacity: usize, max_rate: Option<usize>) -> (FrameSink, FrameWriter) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let limiter = max_rate.map(|rate| {
        Arc::new(
            RateLimiter::builder()
                .initial(rate)
                .refill(rate)
                .interval(Duration::from_secs(1))
                .max(rate)
                .build(),
        )
    });
    (FrameSink { tx, limiter }, FrameWriter { rx })
}

impl FrameWriter {
    /// Take the next queued frame without writing it anywhere.
    #[cfg(any(test, feature = "test-helpers"))]
    pub async fn recv(&mut self) -> Option<Frame> { self.rx.recv().await }

    /// Drain queued frames into `io` until cancelled or every sink is gone.
    ///
    /// # Errors
    ///
    /// Returns the first encode or I/O failure; the session treats it as
    /// fatal for the connection.
    pub async fn run<W>(mut self, io: W, shutdown: CancellationToken) -> Result<(), CodecError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut framed = FramedWrite::new(io, FrameCodec::default());
        loop {
            let frame = tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                frame = self.rx.recv() => frame,
            };
            let Some(frame) = frame else { break };
            debug!("< {frame}");
            framed.send(frame).await?;
            #[cfg(feature = "metrics")]
            crate::metrics::inc_frames(crate::metrics::Direction::Outbound);
        }
        self.rx.close();
        framed.close().await?;
        Ok(())
    }
}
