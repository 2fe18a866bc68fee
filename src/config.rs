//! Bridge configuration.
//!
//! Built once at startup from the command line and immutable afterwards.
//! [`BridgeConfig::validate`] rejects combinations that could never work
//! before any connection is attempted.

use std::{collections::HashSet, net::SocketAddr, time::Duration};

use thiserror::Error;

use crate::{
    bridge::BridgeLink,
    bus::MqttSettings,
    heartbeat::DEFAULT_HEARTBEAT_PERIOD,
    topics::TopicMapping,
    transport::{ServerAddress, SocketOptions},
    writer::DEFAULT_QUEUE_CAPACITY,
};

/// Default wait for a correlated response.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(3);

/// Default wait for the device connection to open.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Errors raised while validating configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// No access token was given.
    #[error("access token must not be empty")]
    EmptyToken,

    /// The base topic has no usable characters.
    #[error("base topic must not be empty")]
    EmptyTopic,

    /// A duration that must be positive is zero.
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    /// The send rate limit is zero.
    #[error("send rate must allow at least one frame per second")]
    ZeroSendRate,

    /// The same bridge identifier was configured twice.
    #[error("bridge `{0}` configured more than once")]
    DuplicateBridge(String),

    /// A bridge identifier is empty or would clash with topic routing.
    #[error("bridge identifier `{0}` is not usable in topics")]
    InvalidBridge(String),
}

/// Settings for one device session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    /// Access token sent at login.
    pub token: String,
    /// Topic layout.
    pub mapping: TopicMapping,
    /// Remote identifiers of bridge links, in binding order.
    pub bridges: Vec<String>,
    /// Interval between heartbeats.
    pub heartbeat_period: Duration,
    /// Wait for each correlated response.
    pub response_timeout: Duration,
    /// Heartbeat periods of silence tolerated before ending the session.
    pub max_missed_heartbeats: Option<u32>,
    /// Upper bound on frames written per second.
    pub max_send_rate: Option<usize>,
    /// Frames that may wait for the writer.
    pub queue_capacity: usize,
}

impl SessionConfig {
    /// Session settings with defaults for everything but the token and topic.
    #[must_use]
    pub fn new(token: impl Into<String>, mapping: TopicMapping) -> Self {
        Self {
            token: token.into(),
            mapping,
            bridges: Vec::new(),
            heartbeat_period: DEFAULT_HEARTBEAT_PERIOD,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            max_missed_heartbeats: None,
            max_send_rate: None,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    /// Bridge links described by [`Self::bridges`], numbered from 1.
    #[must_use]
    pub fn links(&self) -> Vec<BridgeLink> {
        self.bridges
            .iter()
            .enumerate()
            .map(|(i, remote)| BridgeLink::new(i + 1, remote.clone()))
            .collect()
    }

    /// Check the settings for values that can never work.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.token.trim().is_empty() {
            return Err(ConfigError::EmptyToken);
        }
        if self.mapping.base().is_empty() {
            return Err(ConfigError::EmptyTopic);
        }
        if self.heartbeat_period.is_zero() {
            return Err(ConfigError::ZeroDuration("heartbeat period"));
        }
        if self.response_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("response timeout"));
        }
        if self.max_send_rate == Some(0) {
            return Err(ConfigError::ZeroSendRate);
        }
        let mut seen = HashSet::new();
        for remote in &self.bridges {
            if remote.is_empty() || remote.contains(['/', '+', '#']) || remote == "vw" {
                return Err(ConfigError::InvalidBridge(remote.clone()));
            }
            if !seen.insert(remote.as_str()) {
                return Err(ConfigError::DuplicateBridge(remote.clone()));
            }
        }
        Ok(())
    }
}

/// Complete process configuration.
#[derive(Clone, Debug)]
pub struct BridgeConfig {
    /// Device protocol server.
    pub server: ServerAddress,
    /// Socket tuning for the device connection.
    pub socket: SocketOptions,
    /// Wait for the device connection to open.
    pub connect_timeout: Duration,
    /// Message bus connection.
    pub mqtt: MqttSettings,
    /// Session behaviour.
    pub session: SessionConfig,
    /// Log every frame.
    pub dump: bool,
    /// Prometheus listener address.
    pub metrics_addr: Option<SocketAddr>,
}

impl BridgeConfig {
    /// Check the whole configuration.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("connect timeout"));
        }
        self.session.validate()
    }
}

#[cfg(test)]
mod tests {
    use rstest::{fixture, rstest};

    use super::*;

    #[fixture]
    fn session() -> SessionConfig {
        SessionConfig::new("token", TopicMapping::with_defaults("/blynk"))
    }

    #[rstest]
    fn defaults_are_valid(session: SessionConfig) {
        assert_eq!(session.validate(), Ok(()));
        assert_eq!(session.heartbeat_period, Duration::from_secs(10));
    }

    #[rstest]
    fn links_are_numbered_from_one(mut session: SessionConfig) {
        session.bridges = vec!["A".into(), "B".into()];
        let links = session.links();
        assert_eq!(links[0].index(), 1);
        assert_eq!(links[1].remote_id(), "B");
        assert!(links.iter().all(|link| !link.is_bound()));
    }

    #[rstest]
    #[case::token(|c: &mut SessionConfig| c.token = " ".into(), ConfigError::EmptyToken)]
    #[case::topic(
        |c: &mut SessionConfig| c.mapping = TopicMapping::with_defaults("/"),
        ConfigError::EmptyTopic
    )]
    #[case::heartbeat(
        |c: &mut SessionConfig| c.heartbeat_period = Duration::ZERO,
        ConfigError::ZeroDuration("heartbeat period")
    )]
    #[case::rate(|c: &mut SessionConfig| c.max_send_rate = Some(0), ConfigError::ZeroSendRate)]
    #[case::duplicate(
        |c: &mut SessionConfig| c.bridges = vec!["A".into(), "A".into()],
        ConfigError::DuplicateBridge("A".into())
    )]
    #[case::wildcard(
        |c: &mut SessionConfig| c.bridges = vec!["a/b".into()],
        ConfigError::InvalidBridge("a/b".into())
    )]
    fn rejects_unusable_settings(
        mut session: SessionConfig,
        #[case] edit: fn(&mut SessionConfig),
        #[case] expected: ConfigError,
    ) {
        edit(&mut session);
        assert_eq!(session.validate(), Err(expected));
    }
}
