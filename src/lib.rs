//! Public API for the `pinbridge` library.
//!
//! `pinbridge` connects to a device protocol server as a single device
//! session and mirrors its virtual pins onto a publish/subscribe bus.
//! Frames are read by exactly one reader task and written by exactly one
//! writer task; every other component talks to the connection through the
//! [`writer::FrameSink`] and the [`correlation::PendingTable`].

pub mod bridge;
pub mod bus;
pub mod codec;
pub mod config;
pub mod correlation;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod heartbeat;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod pins;
pub mod reader;
pub mod router;
pub mod session;
pub mod test_helpers;
pub mod topics;
pub mod transport;
pub mod writer;

pub use bus::{BusMessage, MessageBus, MqttBus, MqttPump, MqttSettings};
pub use config::{BridgeConfig, ConfigError, SessionConfig};
pub use error::{BridgeError, Result};
pub use frame::{Frame, MessageId, MessageType, Status};
pub use session::{Session, SessionEnd, SessionHandle, SessionState};
pub use topics::TopicMapping;
