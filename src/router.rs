//! Bus-to-device direction of the bridge.
//!
//! [`TopicRouter`] consumes inbound bus messages, resolves them with the
//! [`TopicMapping`] and either writes the pin on the device or hands the
//! write to the [`BridgeForwarder`]. Bridge forwards wait for a correlated
//! response, so [`TopicRouter::run`] spawns each one on its own task and
//! keeps consuming bus traffic meanwhile.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info};

use crate::{
    bridge::BridgeForwarder,
    bus::BusMessage,
    correlation::PendingTable,
    error::Result,
    frame::Frame,
    pins::{PinCache, PinNumber},
    topics::{Route, TopicMapping},
    writer::FrameSink,
};

/// Routes bus messages to the device or to bridge links.
#[derive(Clone, Debug)]
pub struct TopicRouter {
    mapping: Arc<TopicMapping>,
    pins: Arc<PinCache>,
    sink: FrameSink,
    pending: Arc<PendingTable>,
    forwarder: BridgeForwarder,
}

impl TopicRouter {
    /// Create a router writing through `sink`.
    #[must_use]
    pub fn new(
        mapping: Arc<TopicMapping>,
        pins: Arc<PinCache>,
        sink: FrameSink,
        pending: Arc<PendingTable>,
        forwarder: BridgeForwarder,
    ) -> Self {
        Self {
            mapping,
            pins,
            sink,
            pending,
            forwarder,
        }
    }

    /// Resolve `topic` without acting on it.
    #[must_use]
    pub fn route(&self, topic: &str) -> Option<Route> {
        self.mapping.route(topic, self.forwarder.links())
    }

    /// Handle one bus message, waiting for bridge forwards to finish.
    ///
    /// # Errors
    ///
    /// Returns an error if a direct pin write cannot be queued. Bridge
    /// forward failures are logged, not returned.
    pub async fn on_message(&self, topic: &str, payload: Bytes) -> Result<()> {
        match self.route(topic) {
            Some(Route::Pin(pin)) => self.write_pin(pin, payload).await,
            Some(Route::Bridge { link, pin }) => {
                self.forwarder.forward_logged(link, pin, &payload).await;
                Ok(())
            }
            None => {
                debug!(topic, "bus message not routed");
                Ok(())
            }
        }
    }

    /// Store `value` for `pin` and write it to the device.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame cannot be built or queued.
    pub async fn write_pin(&self, pin: PinNumber, value: Bytes) -> Result<()> {
        info!(pin, value = %String::from_utf8_lossy(&value), "bus write to device");
        self.pins.update(pin, value.clone());
        let pin_field = pin.to_string();
        let frame = Frame::hardware(
            self.pending.allocate_id(),
            [b"vw".as_slice(), pin_field.as_bytes(), value.as_ref()],
        )?;
        self.sink.submit(frame).await
    }

    /// Consume `inbound` until it closes, `shutdown` fires, or the device
    /// write path is gone.
    pub async fn run(self, mut inbound: mpsc::Receiver<BusMessage>, shutdown: CancellationToken) {
        let forwards = TaskTracker::new();
        loop {
            let message = tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                message = inbound.recv() => message,
            };
            let Some(BusMessage { topic, payload }) = message else { break };

            match self.route(&topic) {
                Some(Route::Bridge { link, pin }) => {
                    let forwarder = self.forwarder.clone();
                    forwards.spawn(async move {
                        forwarder.forward_logged(link, pin, &payload).await;
                    });
                }
                Some(Route::Pin(pin)) => {
                    if let Err(error) = self.write_pin(pin, payload).await {
                        info!(%error, "device write path closed; router stopping");
                        break;
                    }
                }
                None => debug!(topic, "bus message not routed"),
            }
        }
        forwards.close();
        forwards.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rstest::{fixture, rstest};

    use super::*;
    use crate::{
        bridge::BridgeLink,
        frame::MessageType,
        writer::{FrameWriter, frame_channel},
    };

    struct Harness {
        router: TopicRouter,
        pins: Arc<PinCache>,
        writer: FrameWriter,
    }

    #[fixture]
    fn harness() -> Harness {
        let pins = Arc::new(PinCache::new());
        let pending = Arc::new(PendingTable::default());
        let (sink, writer) = frame_channel(8, None);
        let links: Arc<[BridgeLink]> =
            vec![BridgeLink::new(1, "AnotherAppToken").into_bound()].into();
        let forwarder = BridgeForwarder::new(
            links,
            Arc::clone(&pending),
            sink.clone(),
            Duration::from_millis(10),
        );
        let router = TopicRouter::new(
            Arc::new(TopicMapping::with_defaults("/blynk")),
            Arc::clone(&pins),
            sink,
            pending,
            forwarder,
        );
        Harness {
            router,
            pins,
            writer,
        }
    }

    async fn next_frame(writer: &mut FrameWriter) -> Frame {
        writer.recv().await.expect("frame queued")
    }

    #[rstest]
    #[tokio::test]
    async fn pin_write_updates_cache_and_device(harness: Harness) {
        let Harness {
            router,
            pins,
            mut writer,
        } = harness;
        router
            .on_message("/blynk/vw/4", Bytes::from_static(b"on"))
            .await
            .expect("queued");
        let frame = next_frame(&mut writer).await;
        assert_eq!(frame.kind(), MessageType::Hardware);
        assert_eq!(frame.body().as_ref(), b"vw\x004\0on");
        assert_eq!(pins.value(4), Some(Bytes::from_static(b"on")));
    }

    #[rstest]
    #[tokio::test]
    async fn legacy_topic_writes_mapped_pin(harness: Harness) {
        let Harness {
            router, mut writer, ..
        } = harness;
        router
            .on_message("/blynk/sensors/dhtt1", Bytes::from_static(b"21.0"))
            .await
            .expect("queued");
        assert_eq!(next_frame(&mut writer).await.body().as_ref(), b"vw\x002\x0021.0");
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn bridge_topic_sends_bridge_frame(harness: Harness) {
        let Harness {
            router, mut writer, ..
        } = harness;
        router
            .on_message("/blynk/AnotherAppToken/vw/3", Bytes::from_static(b"1"))
            .await
            .expect("forward failures are logged");
        let frame = next_frame(&mut writer).await;
        assert_eq!(frame.kind(), MessageType::Bridge);
        assert_eq!(frame.body().as_ref(), b"1\0vw\x003\x001");
    }

    #[rstest]
    #[tokio::test]
    async fn unrouted_topic_is_ignored(harness: Harness) {
        let Harness { router, pins, .. } = harness;
        router
            .on_message("/blynk/vr/1", Bytes::new())
            .await
            .expect("ignored");
        assert!(pins.is_empty());
    }
}
