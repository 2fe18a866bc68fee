#![cfg(any(test, feature = "test-helpers"))]
//! Test-only helpers shared by unit and integration tests.

use std::{sync::Mutex, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::{
    io::DuplexStream,
    sync::Notify,
};
use tokio_util::codec::Framed;

use crate::{
    bus::{BusMessage, MessageBus},
    codec::FrameCodec,
    error::Result,
    frame::{Frame, MessageId, MessageType, Status},
};

/// In-memory [`MessageBus`] that records every call.
#[derive(Debug, Default)]
pub struct RecordingBus {
    published: Mutex<Vec<BusMessage>>,
    subscriptions: Mutex<Vec<String>>,
    changed: Notify,
}

impl RecordingBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Messages published so far.
    ///
    /// # Panics
    ///
    /// Panics if a recording thread panicked.
    #[must_use]
    pub fn published(&self) -> Vec<BusMessage> {
        self.published.lock().expect("bus lock poisoned").clone()
    }

    /// Patterns subscribed so far.
    ///
    /// # Panics
    ///
    /// Panics if a recording thread panicked.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().expect("bus lock poisoned").clone()
    }

    /// Wait until at least `count` messages were published.
    ///
    /// # Panics
    ///
    /// Panics if they do not arrive within five seconds.
    pub async fn wait_for_published(&self, count: usize) -> Vec<BusMessage> {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let changed = self.changed.notified();
                let published = self.published();
                if published.len() >= count {
                    return published;
                }
                changed.await;
            }
        })
        .await
        .expect("expected publishes did not arrive")
    }
}

#[async_trait]
impl MessageBus for RecordingBus {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        self.published
            .lock()
            .expect("bus lock poisoned")
            .push(BusMessage::new(topic, payload));
        self.changed.notify_waiters();
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<()> {
        self.subscriptions
            .lock()
            .expect("bus lock poisoned")
            .push(pattern.to_owned());
        Ok(())
    }
}

/// Server side of an in-memory device connection.
#[derive(Debug)]
pub struct DevicePeer {
    framed: Framed<DuplexStream, FrameCodec>,
}

/// Build a connected client stream and server-side peer.
#[must_use]
pub fn device_pair() -> (DuplexStream, DevicePeer) {
    let (client, server) = tokio::io::duplex(64 * 1024);
    (
        client,
        DevicePeer {
            framed: Framed::new(server, FrameCodec::default()),
        },
    )
}

impl DevicePeer {
    /// Read the next frame sent by the bridge.
    ///
    /// # Panics
    ///
    /// Panics if nothing arrives within five seconds, the bridge hangs up,
    /// or the bytes do not decode.
    pub async fn recv(&mut self) -> Frame {
        tokio::time::timeout(Duration::from_secs(5), self.framed.next())
            .await
            .expect("no frame from bridge")
            .expect("bridge closed the connection")
            .expect("bridge sent a malformed frame")
    }

    /// Read frames until one of `kind` arrives, skipping others.
    pub async fn recv_kind(&mut self, kind: MessageType) -> Frame {
        loop {
            let frame = self.recv().await;
            if frame.kind() == kind {
                return frame;
            }
        }
    }

    /// Read the next frame, or `None` if nothing arrives within `wait`.
    pub async fn try_recv(&mut self, wait: Duration) -> Option<Frame> {
        match tokio::time::timeout(wait, self.framed.next()).await {
            Ok(Some(Ok(frame))) => Some(frame),
            _ => None,
        }
    }

    /// Send a frame to the bridge.
    ///
    /// # Panics
    ///
    /// Panics if the bridge side is gone.
    pub async fn send(&mut self, frame: Frame) {
        self.framed.send(frame).await.expect("bridge connection open");
    }

    /// Answer request `id` with `status`.
    pub async fn respond(&mut self, id: MessageId, status: Status) {
        self.send(Frame::response(id, status)).await;
    }

    /// Write raw bytes, bypassing the codec.
    ///
    /// # Panics
    ///
    /// Panics if the bridge side is gone.
    pub async fn send_raw(&mut self, bytes: &[u8]) {
        use tokio::io::AsyncWriteExt;
        let io = self.framed.get_mut();
        io.write_all(bytes).await.expect("bridge connection open");
        io.flush().await.expect("bridge connection open");
    }

    /// Accept the login and answer every bridge bind with `OK`.
    ///
    /// # Panics
    ///
    /// Panics if the bridge does not log in first.
    pub async fn accept(&mut self, binds: usize) {
        let login = self.recv().await;
        assert_eq!(login.kind(), MessageType::Login, "first frame is a login");
        self.respond(login.id(), Status::OK).await;
        for _ in 0..binds {
            let bind = self.recv_kind(MessageType::Bridge).await;
            self.respond(bind.id(), Status::OK).await;
        }
    }

    /// Drain frames until the bridge closes its side; `false` if it is
    /// still open after `wait`.
    pub async fn closed_within(&mut self, wait: Duration) -> bool {
        tokio::time::timeout(wait, async {
            while let Some(Ok(_)) = self.framed.next().await {}
        })
        .await
        .is_ok()
    }
}
