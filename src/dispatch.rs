//! Interpretation of `HW` and `BRIDGE` payloads from the device.
//!
//! A body is split on NUL into a command name and its parameters. Virtual
//! pin writes are cached and republished on the bus; virtual pin reads are
//! announced on the bus and answered from the cache when a value is known.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::{
    bus::MessageBus,
    codec::ProtocolError,
    correlation::PendingTable,
    error::Result,
    frame::{Frame, MessageType, split_fields},
    pins::{PinCache, PinNumber, parse_pin},
    topics::TopicMapping,
    writer::FrameSink,
};

/// A parsed device command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Device information report; accepted and ignored.
    Info,
    /// The device wrote `value` to `pin`.
    VirtualWrite {
        /// Pin number.
        pin: PinNumber,
        /// Raw value.
        value: Bytes,
    },
    /// The device asks for the value of `pin`.
    VirtualRead {
        /// Pin number.
        pin: PinNumber,
    },
    /// Any other command name.
    Unknown(String),
}

impl Command {
    /// Parse a NUL-separated command body.
    ///
    /// # Errors
    ///
    /// Returns a [`ProtocolError`] when a known command carries the wrong
    /// number of parameters or a malformed pin.
    pub fn parse(body: &Bytes) -> Result<Self, ProtocolError> {
        let fields = split_fields(body);
        let Some((name, params)) = fields.split_first() else {
            return Ok(Self::Unknown(String::new()));
        };
        let name = std::str::from_utf8(name).map_err(|_| ProtocolError::InvalidText)?;
        match name {
            "info" => Ok(Self::Info),
            "vw" => {
                let [pin, value] = expect_params::<2>(name, params)?;
                Ok(Self::VirtualWrite {
                    pin: parse_pin(pin)?,
                    value: body.slice_ref(value),
                })
            }
            "vr" => {
                let [pin] = expect_params::<1>(name, params)?;
                Ok(Self::VirtualRead {
                    pin: parse_pin(pin)?,
                })
            }
            other => Ok(Self::Unknown(other.to_owned())),
        }
    }
}

fn expect_params<'a, const N: usize>(
    command: &str,
    params: &[&'a [u8]],
) -> Result<[&'a [u8]; N], ProtocolError> {
    <[&[u8]; N]>::try_from(params).map_err(|_| ProtocolError::FieldCount {
        command: command.to_owned(),
        expected: N,
        actual: params.len(),
    })
}

/// Applies device commands to the pin cache and the bus.
#[derive(Clone)]
pub struct CommandDispatcher {
    mapping: Arc<TopicMapping>,
    pins: Arc<PinCache>,
    bus: Arc<dyn MessageBus>,
    sink: FrameSink,
    pending: Arc<PendingTable>,
}

impl std::fmt::Debug for CommandDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandDispatcher")
            .field("base", &self.mapping.base())
            .field("pins", &self.pins.len())
            .finish_non_exhaustive()
    }
}

impl CommandDispatcher {
    /// Create a dispatcher publishing through `bus` and replying through `sink`.
    #[must_use]
    pub fn new(
        mapping: Arc<TopicMapping>,
        pins: Arc<PinCache>,
        bus: Arc<dyn MessageBus>,
        sink: FrameSink,
        pending: Arc<PendingTable>,
    ) -> Self {
        Self {
            mapping,
            pins,
            bus,
            sink,
            pending,
        }
    }

    /// Handle one `HW` or `BRIDGE` body.
    ///
    /// # Errors
    ///
    /// Returns protocol errors for malformed commands and bus errors for
    /// failed publishes. Neither ends the session; the reader logs them.
    pub async fn dispatch(&self, kind: MessageType, body: Bytes) -> Result<()> {
        match Command::parse(&body)? {
            Command::Info => {
                debug!(%kind, "device info received");
                Ok(())
            }
            Command::VirtualWrite { pin, value } => {
                info!(pin, value = %String::from_utf8_lossy(&value), "virtual write");
                self.pins.update(pin, value.clone());
                self.bus.publish(&self.mapping.write_topic(pin), value).await
            }
            Command::VirtualRead { pin } => {
                info!(pin, "virtual read");
                let announced = self
                    .bus
                    .publish(&self.mapping.read_topic(pin), Bytes::new())
                    .await;
                self.reply_cached(pin).await;
                announced
            }
            Command::Unknown(name) => {
                warn!(%kind, command = %name, "unknown command ignored");
                Ok(())
            }
        }
    }

    /// Best-effort: send the cached value of `pin` back to the device.
    async fn reply_cached(&self, pin: PinNumber) {
        let Some(value) = self.pins.value(pin) else {
            return;
        };
        let pin_field = pin.to_string();
        let reply = match Frame::hardware(
            self.pending.allocate_id(),
            [b"vw".as_slice(), pin_field.as_bytes(), value.as_ref()],
        ) {
            Ok(frame) => frame,
            Err(error) => {
                debug!(pin, %error, "cached value does not fit a frame");
                return;
            }
        };
        if let Err(error) = self.sink.submit(reply).await {
            debug!(pin, %error, "cached value reply not sent");
        }
    }
}
