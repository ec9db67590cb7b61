//! Bus client abstraction.
//!
//! The coordination loop never speaks a wire protocol directly.  It holds an
//! `Arc<dyn BusClient>` handed over by a [`BusConnector`] and only ever calls
//! [`BusClient::publish`].  The process-level teardown watcher calls
//! [`BusClient::disconnect`] once the loop has stopped.
//!
//! # Implementations
//!
//! - [`LocalBusClient`] – publishes straight onto an in-process [`EventBus`].
//! - [`MqttBusClient`][crate::mqtt_client::MqttBusClient] – any MQTT 3.1.1
//!   broker.
//! - [`WsBusClient`][crate::ws_client::WsBusClient] – talks to a
//!   [`Broker`][crate::broker::Broker] over a WebSocket.
//!
//! [`SchemeConnector`] picks between the network clients by endpoint scheme.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use airmeter_types::{AirError, BusMessage, Payload};
use async_trait::async_trait;
use tracing::debug;

use crate::bus::{EventBus, TopicSubscriber};
use crate::mqtt_client::MqttConnector;
use crate::ws_client::WsConnector;

/// A live connection to the message bus.
///
/// # Contract
///
/// * `publish` – resolves once the client has handed the message to the bus
///   (its own delivery acknowledgement).  Publishing with no subscribers is
///   not an error.
/// * `subscribe` – returns a [`TopicSubscriber`] fed with every message the
///   bus delivers for `filter`.
/// * `disconnect` – tears the connection down.  Calling it more than once is
///   a no-op.
#[async_trait]
pub trait BusClient: Send + Sync {
    async fn publish(&self, topic: &str, payload: Payload) -> Result<(), AirError>;

    async fn subscribe(&self, filter: &str) -> Result<TopicSubscriber, AirError>;

    async fn disconnect(&self) -> Result<(), AirError>;
}

/// Performs a single connection attempt.  Retrying is layered on top by
/// [`connect_with_retry`][crate::retry::connect_with_retry].
#[async_trait]
pub trait BusConnector: Send + Sync {
    async fn connect(&self, endpoint: &str, identity: &str) -> Result<Arc<dyn BusClient>, AirError>;
}

// ---------------------------------------------------------------------------
// In-process client
// ---------------------------------------------------------------------------

/// Client bound to an in-process [`EventBus`].
pub struct LocalBusClient {
    bus: EventBus,
    identity: String,
    connected: AtomicBool,
}

impl LocalBusClient {
    pub fn new(bus: EventBus, identity: impl Into<String>) -> Self {
        Self {
            bus,
            identity: identity.into(),
            connected: AtomicBool::new(true),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

#[async_trait]
impl BusClient for LocalBusClient {
    async fn publish(&self, topic: &str, payload: Payload) -> Result<(), AirError> {
        if !self.is_connected() {
            return Err(AirError::Publish(format!(
                "client {} is disconnected",
                self.identity
            )));
        }
        // No subscribers is a normal condition for a broker.
        let _ = self.bus.publish(BusMessage::new(topic, payload));
        Ok(())
    }

    async fn subscribe(&self, filter: &str) -> Result<TopicSubscriber, AirError> {
        Ok(self.bus.subscribe(filter))
    }

    async fn disconnect(&self) -> Result<(), AirError> {
        if self.connected.swap(false, Ordering::AcqRel) {
            debug!(client_id = %self.identity, "local bus client disconnected");
        }
        Ok(())
    }
}

/// Connector handing out [`LocalBusClient`]s that share one [`EventBus`].
/// The endpoint is ignored.
#[derive(Clone, Default)]
pub struct LocalConnector {
    bus: EventBus,
}

impl LocalConnector {
    pub fn new(bus: EventBus) -> Self {
        Self { bus }
    }

    pub fn bus(&self) -> EventBus {
        self.bus.clone()
    }
}

#[async_trait]
impl BusConnector for LocalConnector {
    async fn connect(&self, _endpoint: &str, identity: &str) -> Result<Arc<dyn BusClient>, AirError> {
        Ok(Arc::new(LocalBusClient::new(self.bus.clone(), identity)))
    }
}

/// Connector choosing the transport from the endpoint scheme:
/// `tcp://` and `mqtt://` go to MQTT, `ws://` and `wss://` to the WebSocket
/// broker protocol.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchemeConnector;

#[async_trait]
impl BusConnector for SchemeConnector {
    async fn connect(&self, endpoint: &str, identity: &str) -> Result<Arc<dyn BusClient>, AirError> {
        match endpoint.split_once("://").map(|(scheme, _)| scheme) {
            Some("tcp" | "mqtt") => MqttConnector.connect(endpoint, identity).await,
            Some("ws" | "wss") => WsConnector.connect(endpoint, identity).await,
            _ => Err(AirError::Config(format!(
                "bus endpoint '{endpoint}' must start with tcp://, mqtt://, ws:// or wss://"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_client_round_trip() -> Result<(), Box<dyn std::error::Error>> {
        let connector = LocalConnector::default();
        let client = connector.connect("local", "test-client").await?;
        let mut sub = client.subscribe("airmeter/#").await?;

        client
            .publish("airmeter/home", Payload::from(r#"{"Humidity":40}"#))
            .await?;

        let message = sub.recv().await.ok_or("no message")?;
        assert_eq!(message.topic, "airmeter/home");
        assert_eq!(message.payload.as_bytes(), br#"{"Humidity":40}"#);
        Ok(())
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_ok() {
        let client = LocalBusClient::new(EventBus::default(), "lonely");
        assert!(client.publish("airmeter/home", Payload::from("{}")).await.is_ok());
    }

    #[tokio::test]
    async fn publish_after_disconnect_fails() {
        let client = LocalBusClient::new(EventBus::default(), "gone");
        client.disconnect().await.unwrap();
        // Second disconnect is a no-op.
        client.disconnect().await.unwrap();
        assert!(!client.is_connected());
        let result = client.publish("airmeter/home", Payload::from("{}")).await;
        assert!(matches!(result, Err(AirError::Publish(_))));
    }

    #[tokio::test]
    async fn scheme_connector_routes_by_scheme() -> Result<(), Box<dyn std::error::Error>> {
        assert!(matches!(
            SchemeConnector.connect("http://localhost:8000", "agent").await,
            Err(AirError::Config(_))
        ));
        assert!(matches!(
            SchemeConnector.connect("localhost:1883", "agent").await,
            Err(AirError::Config(_))
        ));

        // Nothing listens here; both transports report a transient failure.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        drop(listener);
        for scheme in ["tcp", "mqtt", "ws"] {
            let error = SchemeConnector
                .connect(&format!("{scheme}://{addr}"), "agent")
                .await
                .err();
            assert!(matches!(error, Some(AirError::Connect(_))), "{scheme}: {error:?}");
        }
        Ok(())
    }
}
