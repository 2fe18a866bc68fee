//! Shared utilities for integration tests.
//!
//! Sessions run over an in-memory duplex stream; the test drives the
//! server side through a [`DevicePeer`].

// Items in this shared module may not be used by all test binaries that import it.
#![allow(
    dead_code,
    reason = "shared test utilities are not used by all test binaries"
)]

use std::{sync::Arc, time::Duration};

use pinbridge::{
    SessionConfig,
    SessionHandle,
    TopicMapping,
    session::Session,
    test_helpers::{DevicePeer, RecordingBus, device_pair},
};
use rstest::fixture;
use tokio::io::DuplexStream;

/// Session settings for the default `/blynk` layout.
#[fixture]
pub fn config() -> SessionConfig {
    let mut config = SessionConfig::new("secret-token", TopicMapping::with_defaults("/blynk"));
    config.response_timeout = Duration::from_millis(500);
    config
}

/// A session that has not logged in yet, and the server side of its link.
pub fn unstarted(config: SessionConfig) -> (Session<DuplexStream>, DevicePeer) {
    let (client, peer) = device_pair();
    (Session::new(config, client), peer)
}

/// A running session plus the server side and the bus it publishes to.
pub struct Running {
    pub handle: SessionHandle,
    pub peer: DevicePeer,
    pub bus: Arc<RecordingBus>,
}

/// Bring a session up against a peer that accepts every request.
///
/// # Panics
///
/// Panics if bring-up fails.
pub async fn running(config: SessionConfig) -> Running {
    let binds = config.bridges.len();
    let (mut session, mut peer) = unstarted(config);
    let (established, ()) = tokio::join!(session.establish(), peer.accept(binds));
    established.expect("session established");
    let bus = Arc::new(RecordingBus::new());
    let handle = session.start(bus.clone()).expect("authenticated session starts");
    Running { handle, peer, bus }
}
