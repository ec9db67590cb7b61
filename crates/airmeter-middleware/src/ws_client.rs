//! WebSocket bus client.
//!
//! [`WsBusClient`] keeps one WebSocket to a [`Broker`][crate::broker::Broker]:
//!
//! * **Outbound** – `publish` and `subscribe` write [`Frame`]s through a
//!   shared sink.  `publish` resolves once the frame has been flushed, which
//!   is the client's delivery acknowledgement.
//! * **Inbound** – a reader task decodes publish frames pushed by the broker
//!   and fans them out on a private [`EventBus`] so every local
//!   [`TopicSubscriber`] sees the messages matching its filter.
//!
//! Only `ws://` and `wss://` endpoints are accepted; anything else is an
//! [`AirError::Config`] that the retry layer treats as permanent.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use airmeter_types::{AirError, BusMessage, Payload};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::bus::{EventBus, TopicSubscriber};
use crate::client::{BusClient, BusConnector};
use crate::frame::Frame;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A live WebSocket connection to the bus broker.
pub struct WsBusClient {
    identity: String,
    sink: Mutex<SplitSink<WsStream, Message>>,
    inbound: EventBus,
    reader: AbortHandle,
    closed: AtomicBool,
}

impl WsBusClient {
    /// Open a connection and announce `identity` to the broker.
    ///
    /// # Errors
    ///
    /// * [`AirError::Config`] – the endpoint is not a WebSocket URL.
    /// * [`AirError::Connect`] – the handshake or the announcement failed.
    pub async fn connect(endpoint: &str, identity: &str) -> Result<Self, AirError> {
        validate_endpoint(endpoint)?;

        let (stream, _response) = connect_async(endpoint)
            .await
            .map_err(|e| AirError::Connect(format!("{endpoint}: {e}")))?;
        let (mut sink, source) = stream.split();

        let hello = Frame::Connect {
            client_id: identity.to_string(),
        }
        .encode()?;
        sink.send(Message::Text(hello.into()))
            .await
            .map_err(|e| AirError::Connect(format!("{endpoint}: {e}")))?;

        let inbound = EventBus::default();
        let reader = tokio::spawn(read_frames(source, inbound.clone(), identity.to_string()));

        info!(endpoint, client_id = identity, "bus connection established");
        Ok(Self {
            identity: identity.to_string(),
            sink: Mutex::new(sink),
            inbound,
            reader: reader.abort_handle(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    async fn send_frame(&self, frame: &Frame) -> Result<(), AirError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AirError::Publish(format!(
                "client {} is disconnected",
                self.identity
            )));
        }
        let text = frame.encode()?;
        self.sink
            .lock()
            .await
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| AirError::Publish(format!("frame write error: {e}")))
    }
}

#[async_trait]
impl BusClient for WsBusClient {
    async fn publish(&self, topic: &str, payload: Payload) -> Result<(), AirError> {
        self.send_frame(&Frame::publish(topic, &payload)?).await
    }

    async fn subscribe(&self, filter: &str) -> Result<TopicSubscriber, AirError> {
        // Register locally first so nothing the broker sends back is missed.
        let subscriber = self.inbound.subscribe(filter);
        self.send_frame(&Frame::Subscribe {
            topic: filter.to_string(),
        })
        .await?;
        Ok(subscriber)
    }

    async fn disconnect(&self) -> Result<(), AirError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let result = self.sink.lock().await.close().await;
        self.reader.abort();
        result.map_err(|e| AirError::Connect(format!("close error: {e}")))
    }
}

impl Drop for WsBusClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Connector producing [`WsBusClient`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl BusConnector for WsConnector {
    async fn connect(&self, endpoint: &str, identity: &str) -> Result<Arc<dyn BusClient>, AirError> {
        Ok(Arc::new(WsBusClient::connect(endpoint, identity).await?))
    }
}

fn validate_endpoint(endpoint: &str) -> Result<(), AirError> {
    if endpoint.starts_with("ws://") || endpoint.starts_with("wss://") {
        Ok(())
    } else {
        Err(AirError::Config(format!(
            "bus endpoint '{endpoint}' must start with ws:// or wss://"
        )))
    }
}

async fn read_frames(mut source: SplitStream<WsStream>, inbound: EventBus, identity: String) {
    while let Some(msg) = source.next().await {
        match msg {
            Ok(Message::Text(text)) => match Frame::decode(text.as_str()) {
                Ok(Frame::Publish { topic, msg }) => {
                    // No local subscriber is fine.
                    let _ = inbound.publish(BusMessage::new(topic, Payload::from(msg)));
                }
                Ok(other) => debug!(frame = ?other, "ignoring frame from broker"),
                Err(e) => warn!(client_id = %identity, error = %e, "undecodable frame from broker"),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(client_id = %identity, error = %e, "bus connection error");
                break;
            }
        }
    }
    debug!(client_id = %identity, "bus reader stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_scheme_is_validated() {
        assert!(validate_endpoint("ws://localhost:9090").is_ok());
        assert!(validate_endpoint("wss://broker.example:443/bus").is_ok());
        assert!(matches!(
            validate_endpoint("tcp://iot.eclipse.org:1883"),
            Err(AirError::Config(_))
        ));
    }

    #[tokio::test]
    async fn connector_rejects_non_websocket_endpoint() {
        let result = WsConnector.connect("tcp://localhost:1883", "agent").await;
        assert!(matches!(result, Err(AirError::Config(_))));
    }

    #[tokio::test]
    async fn connect_to_closed_port_is_transient() -> Result<(), Box<dyn std::error::Error>> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        drop(listener);

        let result = WsConnector.connect(&format!("ws://{addr}"), "agent").await;
        assert!(matches!(result, Err(AirError::Connect(_))));
        Ok(())
    }
}
