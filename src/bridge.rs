//! Bridge links to sibling device sessions.
//!
//! A link is bound once during bring-up and then used to forward virtual
//! pin writes through the primary connection. Forwards are correlated
//! requests: the forwarder registers a pending entry, submits a `BRIDGE`
//! frame through the write path and waits a bounded time for the reader to
//! deliver the response. Failures are reported to the caller and never
//! touch other links or the session.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use tracing::{debug, warn};

use crate::{
    correlation::PendingTable,
    error::{BridgeError, Result},
    frame::{Frame, MessageId},
    pins::PinNumber,
    writer::FrameSink,
};

/// A configured bridge link.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BridgeLink {
    index: usize,
    remote_id: String,
    bound: bool,
}

impl BridgeLink {
    /// Describe an unbound link with a 1-based `index`.
    #[must_use]
    pub fn new(index: usize, remote_id: impl Into<String>) -> Self {
        Self {
            index,
            remote_id: remote_id.into(),
            bound: false,
        }
    }

    /// 1-based index used on the wire.
    #[must_use]
    pub fn index(&self) -> usize { self.index }

    /// Identifier of the remote device session.
    #[must_use]
    pub fn remote_id(&self) -> &str { &self.remote_id }

    /// Whether the link was bound during bring-up.
    #[must_use]
    pub fn is_bound(&self) -> bool { self.bound }

    /// Mark the link as bound.
    #[must_use]
    pub(crate) fn into_bound(self) -> Self { Self { bound: true, ..self } }

    /// Whether a topic segment addresses this link, by identifier or index.
    #[must_use]
    pub fn matches(&self, segment: &str) -> bool {
        segment == self.remote_id || segment.parse::<usize>().is_ok_and(|i| i == self.index)
    }

    /// Frame binding this link to its remote session.
    ///
    /// # Errors
    ///
    /// Returns a framing error if the identifier does not fit a frame.
    pub fn bind_frame(&self, id: MessageId) -> Result<Frame> {
        let index = self.index.to_string();
        Ok(Frame::bridge(id, [index.as_bytes(), b"i".as_slice(), self.remote_id.as_bytes()])?)
    }

    /// Frame forwarding a pin write to the remote session.
    ///
    /// # Errors
    ///
    /// Returns a framing error if the value does not fit a frame.
    pub fn write_frame(&self, id: MessageId, pin: PinNumber, value: &[u8]) -> Result<Frame> {
        let index = self.index.to_string();
        let pin = pin.to_string();
        Ok(Frame::bridge(id, [index.as_bytes(), b"vw".as_slice(), pin.as_bytes(), value])?)
    }
}

/// Forwards pin writes through bound bridge links.
#[derive(Clone, Debug)]
pub struct BridgeForwarder {
    links: Arc<[BridgeLink]>,
    pending: Arc<PendingTable>,
    sink: FrameSink,
    timeout: Duration,
}

impl BridgeForwarder {
    /// Create a forwarder over `links`.
    #[must_use]
    pub fn new(
        links: Arc<[BridgeLink]>,
        pending: Arc<PendingTable>,
        sink: FrameSink,
        timeout: Duration,
    ) -> Self {
        Self {
            links,
            pending,
            sink,
            timeout,
        }
    }

    /// Links available for forwarding.
    #[must_use]
    pub fn links(&self) -> &[BridgeLink] { &self.links }

    /// Forward a write of `value` to `pin` through link `link`.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Timeout`] when the response is late,
    /// [`BridgeError::Rejected`] on a non-OK status and
    /// [`BridgeError::SessionClosed`] if the session has ended.
    pub async fn forward(&self, link: usize, pin: PinNumber, value: &Bytes) -> Result<()> {
        let target = self
            .links
            .get(link)
            .filter(|target| target.is_bound())
            .ok_or(BridgeError::UnknownLink(link))?;

        let request = self.pending.register()?;
        let id = request.id();
        let frame = target.write_frame(id, pin, value)?;
        debug!(
            link = target.index(),
            remote = target.remote_id(),
            pin,
            "forwarding pin write over bridge"
        );
        self.sink.submit(frame).await?;

        let status = request.wait(self.timeout).await?;
        if status.is_ok() {
            Ok(())
        } else {
            Err(BridgeError::Rejected { id, status })
        }
    }

    /// Forward and log any failure instead of returning it.
    pub async fn forward_logged(&self, link: usize, pin: PinNumber, value: &Bytes) {
        if let Err(error) = self.forward(link, pin, value).await {
            let index = self.links.get(link).map_or(link + 1, BridgeLink::index);
            warn!(bridge = index, pin, %error, "bridge forward dropped");
        }
    }
}
