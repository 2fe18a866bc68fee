//! Publish/subscribe message bus seam.
//!
//! The bridge only needs three things from a bus: `publish`, `subscribe`,
//! and a stream of inbound `(topic, payload)` messages. [`MessageBus`]
//! captures the first two; inbound messages arrive as [`BusMessage`] values
//! on a channel fed by the bus client's own event loop.
//!
//! [`MqttBus`] implements the seam over an MQTT broker with `rumqttc`.
//! Connection upkeep is left to `rumqttc`; the [`MqttPump`] keeps polling
//! after errors and renews subscriptions on every reconnect.

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{BridgeError, Result};

/// A message delivered by the bus.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BusMessage {
    /// Topic the message was published on.
    pub topic: String,
    /// Raw payload.
    pub payload: Bytes,
}

impl BusMessage {
    /// Build a message.
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Outbound half of a publish/subscribe bus.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish `payload` on `topic`.
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()>;

    /// Subscribe to every topic matching `pattern`.
    async fn subscribe(&self, pattern: &str) -> Result<()>;
}

/// Connection settings for the MQTT broker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MqttSettings {
    /// Broker host name or address.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Client identifier presented to the broker.
    pub client_id: String,
    /// MQTT keep-alive interval.
    pub keep_alive: Duration,
    /// How long to wait for the broker's `CONNACK`.
    pub connect_timeout: Duration,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: "test.mosquitto.org".to_owned(),
            port: 1883,
            client_id: "blynk.cc".to_owned(),
            keep_alive: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

const REQUEST_CAPACITY: usize = 100;
const RETRY_DELAY: Duration = Duration::from_secs(1);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

type Subscriptions = Arc<Mutex<Vec<String>>>;

/// MQTT implementation of [`MessageBus`].
#[derive(Clone, Debug)]
pub struct MqttBus {
    client: AsyncClient,
    subscriptions: Subscriptions,
}

/// Drives the MQTT event loop and forwards inbound publishes.
pub struct MqttPump {
    event_loop: EventLoop,
    client: AsyncClient,
    subscriptions: Subscriptions,
}

impl std::fmt::Debug for MqttPump {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttPump").finish_non_exhaustive()
    }
}

impl MqttBus {
    /// Connect to the broker and wait for it to accept the session.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Bus`] if the broker refuses or cannot be
    /// reached, and [`BridgeError::Timeout`] if no `CONNACK` arrives in time.
    pub async fn connect(settings: &MqttSettings) -> Result<(Self, MqttPump)> {
        let mut options = MqttOptions::new(&settings.client_id, &settings.host, settings.port);
        options.set_keep_alive(settings.keep_alive);
        let (client, mut event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);

        let connected = tokio::time::timeout(settings.connect_timeout, async {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => break Ok(ack),
                    Ok(event) => debug!(?event, "MQTT event before CONNACK"),
                    Err(e) => break Err(BridgeError::Bus(e.to_string())),
                }
            }
        })
        .await
        .map_err(|_| BridgeError::Timeout {
            id: 0,
            after: settings.connect_timeout,
        })??;
        info!(
            host = %settings.host,
            port = settings.port,
            code = ?connected.code,
            "connected to MQTT broker"
        );

        let subscriptions = Subscriptions::default();
        let pump = MqttPump {
            event_loop,
            client: client.clone(),
            subscriptions: Arc::clone(&subscriptions),
        };
        Ok((
            Self {
                client,
                subscriptions,
            },
            pump,
        ))
    }
}

#[async_trait]
impl MessageBus for MqttBus {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        self.client
            .publish(topic, QoS::AtMostOnce, false, payload.to_vec())
            .await
            .map_err(|e| BridgeError::Bus(e.to_string()))
    }

    async fn subscribe(&self, pattern: &str) -> Result<()> {
        self.client
            .subscribe(pattern, QoS::AtMostOnce)
            .await
            .map_err(|e| BridgeError::Bus(e.to_string()))?;
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(pattern.to_owned());
        info!(pattern, "subscribed to bus topics");
        Ok(())
    }
}

impl MqttPump {
    /// Poll the broker connection until cancelled or `inbound` closes.
    ///
    /// Connection errors are logged and retried with exponential backoff.
    pub async fn run(mut self, inbound: mpsc::Sender<BusMessage>, shutdown: CancellationToken) {
        let mut retry_delay = RETRY_DELAY;
        loop {
            let event = tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                event = self.event_loop.poll() => event,
            };
            match event {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    retry_delay = RETRY_DELAY;
                    debug!(topic = %publish.topic, len = publish.payload.len(), "bus message");
                    let message = BusMessage::new(publish.topic, publish.payload);
                    if inbound.send(message).await.is_err() {
                        break;
                    }
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    retry_delay = RETRY_DELAY;
                    info!("reconnected to MQTT broker");
                    renew_subscriptions(&self.client, &self.subscriptions);
                }
                Ok(event) => debug!(?event, "MQTT event"),
                Err(e) => {
                    error!(error = %e, retry_in_secs = retry_delay.as_secs(), "MQTT connection error");
                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        () = tokio::time::sleep(retry_delay) => {}
                    }
                    retry_delay = (retry_delay * 2).min(MAX_RETRY_DELAY);
                }
            }
        }
        if let Err(e) = self.client.try_disconnect() {
            debug!(error = %e, "MQTT disconnect request not queued");
        }
    }
}

/// Queue a subscribe request for every recorded pattern.
///
/// Requests are queued without waiting: the pump that drains the request
/// queue is the caller.
fn renew_subscriptions(client: &AsyncClient, subscriptions: &Mutex<Vec<String>>) {
    let patterns = subscriptions
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    for pattern in patterns {
        if let Err(e) = client.try_subscribe(&pattern, QoS::AtMostOnce) {
            warn!(pattern, error = %e, "failed to renew subscription");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_target_public_broker() {
        let settings = MqttSettings::default();
        assert_eq!(settings.host, "test.mosquitto.org");
        assert_eq!(settings.port, 1883);
        assert_eq!(settings.client_id, "blynk.cc");
    }

    #[tokio::test]
    async fn cancelled_pump_runs_on_spawned_task() {
        let options = MqttOptions::new("pump-test", "127.0.0.1", 1);
        let (client, event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let pump = MqttPump {
            event_loop,
            client,
            subscriptions: Subscriptions::default(),
        };
        let (inbound, _rx) = mpsc::channel(1);
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        tokio::spawn(pump.run(inbound, shutdown))
            .await
            .expect("pump task");
    }

    #[test]
    fn renewal_queues_every_recorded_pattern() {
        let options = MqttOptions::new("renew-test", "127.0.0.1", 1);
        let (client, _event_loop) = AsyncClient::new(options, 2);
        let subscriptions = Mutex::new(vec!["/blynk/#".to_owned(), "/other/#".to_owned()]);

        renew_subscriptions(&client, &subscriptions);

        assert!(
            client.try_subscribe("/third/#", QoS::AtMostOnce).is_err(),
            "both renewals occupy the request queue"
        );
    }

    #[tokio::test]
    async fn unreachable_broker_fails_connect() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);
        let settings = MqttSettings {
            host: "127.0.0.1".into(),
            port,
            connect_timeout: Duration::from_secs(2),
            ..MqttSettings::default()
        };
        let err = MqttBus::connect(&settings).await.expect_err("nothing listening");
        assert!(matches!(err, BridgeError::Bus(_) | BridgeError::Timeout { .. }));
    }
}
