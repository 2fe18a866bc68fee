//! Metric helpers for `pinbridge`.
//!
//! This module defines metric names and small helpers wrapping the
//! [`metrics`](https://docs.rs/metrics) crate. Nothing is exported unless a
//! recorder is installed, see [`install_exporter`].

use std::net::SocketAddr;

use metrics::{counter, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Name of the gauge tracking live device sessions.
pub const SESSIONS_ACTIVE: &str = "pinbridge_sessions_active";
/// Name of the counter tracking frames read or written.
pub const FRAMES_PROCESSED: &str = "pinbridge_frames_processed_total";
/// Name of the counter tracking correlated requests that timed out.
pub const REQUEST_TIMEOUTS: &str = "pinbridge_request_timeouts_total";
/// Name of the counter tracking session-ending errors.
pub const ERRORS_TOTAL: &str = "pinbridge_errors_total";

/// Direction of frame processing.
#[derive(Clone, Copy, Debug)]
pub enum Direction {
    /// Frames read from the device connection.
    Inbound,
    /// Frames written to the device connection.
    Outbound,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

/// Increment the active sessions gauge.
pub fn inc_sessions() { gauge!(SESSIONS_ACTIVE).increment(1.0); }

/// Decrement the active sessions gauge.
pub fn dec_sessions() { gauge!(SESSIONS_ACTIVE).decrement(1.0); }

/// Record a frame for the given direction.
pub fn inc_frames(direction: Direction) {
    counter!(FRAMES_PROCESSED, "direction" => direction.as_str()).increment(1);
}

/// Record a correlated request that went unanswered.
pub fn inc_timeouts() { counter!(REQUEST_TIMEOUTS).increment(1); }

/// Record a session-ending error of the given kind.
pub fn inc_errors(kind: &'static str) { counter!(ERRORS_TOTAL, "kind" => kind).increment(1); }

/// Serve Prometheus metrics over HTTP on `addr`.
///
/// Must be called from within a Tokio runtime.
///
/// # Errors
///
/// Returns an error if the listener cannot be bound or a recorder is
/// already installed.
pub fn install_exporter(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()
}
