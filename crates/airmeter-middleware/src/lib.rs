//! `airmeter-middleware` – message bus plumbing.
//!
//! Moves opaque payloads between the coordination loop and whoever is
//! listening, without caring what the payloads mean.
//!
//! # Modules
//!
//! - [`bus`] – in-process topic-based publish/subscribe built on Tokio
//!   broadcast channels, with MQTT-style `+`/`#` filters.
//! - [`client`] – the [`BusClient`]/[`BusConnector`] seams the runtime
//!   depends on, the in-process implementation, and [`SchemeConnector`].
//! - [`mqtt_client`] – MQTT client for standard brokers.
//! - [`frame`] – JSON frames spoken on the WebSocket transport.
//! - [`ws_client`] – WebSocket bus client.
//! - [`broker`] – embedded WebSocket broker.
//! - [`retry`] – bounded jittered backoff and `connect_with_retry`.

pub mod broker;
pub mod bus;
pub mod client;
pub mod frame;
pub mod mqtt_client;
pub mod retry;
pub mod ws_client;

pub use broker::Broker;
pub use bus::{EventBus, TopicSubscriber, topic_matches};
pub use client::{BusClient, BusConnector, LocalBusClient, LocalConnector, SchemeConnector};
pub use frame::Frame;
pub use mqtt_client::{MqttBusClient, MqttConnector, MqttEndpoint};
pub use retry::{BackoffPolicy, RetryError, connect_with_retry, retry};
pub use ws_client::{WsBusClient, WsConnector};
