//! Embedded WebSocket bus broker.
//!
//! [`Broker`] accepts [`WsBusClient`][crate::ws_client::WsBusClient]
//! connections and relays every publish frame to every connection holding a
//! matching subscription, including the publisher itself.  It is agnostic
//! about what the payloads mean; it only handles framing and routing.
//!
//! Internally each connection subscribes to the broker's [`EventBus`] and
//! filters against its own subscription list, so slow clients lag (and are
//! told about it in the log) rather than stalling the others.

use std::net::SocketAddr;

use airmeter_types::{AirError, BusMessage, Payload};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::{EventBus, topic_matches};
use crate::frame::Frame;

/// Routes publish frames between connected clients.
#[derive(Clone, Default)]
pub struct Broker {
    bus: EventBus,
}

/// Per-connection routing state.
#[derive(Debug, Default)]
struct Session {
    client_id: Option<String>,
    filters: Vec<String>,
}

impl Session {
    fn wants(&self, topic: &str) -> bool {
        self.filters.iter().any(|f| topic_matches(f, topic))
    }

    fn name(&self) -> &str {
        self.client_id.as_deref().unwrap_or("<anonymous>")
    }
}

impl Broker {
    pub fn new() -> Self {
        Self::default()
    }

    /// The bus carrying every message routed by this broker.
    pub fn bus(&self) -> EventBus {
        self.bus.clone()
    }

    /// Bind `addr` and serve until `shutdown` is cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`AirError::Config`] if the TCP listener cannot be bound.
    pub async fn run(self, addr: SocketAddr, shutdown: CancellationToken) -> Result<(), AirError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| AirError::Config(format!("broker bind error on {addr}: {e}")))?;
        self.serve(listener, shutdown).await;
        Ok(())
    }

    /// Serve connections from an already-bound listener until `shutdown` is
    /// cancelled.
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "bus broker listening");
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("bus broker stopping");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let broker = self.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = broker.handle_client(stream, peer, shutdown).await {
                                error!(%peer, error = %e, "broker client error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "broker accept error");
                    }
                }
            }
        }
    }

    async fn handle_client(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        shutdown: CancellationToken,
    ) -> Result<(), AirError> {
        let ws_stream = accept_async(stream)
            .await
            .map_err(|e| AirError::Connect(format!("ws handshake from {peer}: {e}")))?;

        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        let mut rx = self.bus.subscribe_all();
        let mut session = Session::default();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    let _ = ws_tx.close().await;
                    break;
                }
                // Forward routed messages to the client.
                result = rx.recv() => {
                    match result {
                        Ok(message) if session.wants(&message.topic) => {
                            let text = match Frame::publish(&message.topic, &message.payload)
                                .and_then(|frame| frame.encode())
                            {
                                Ok(text) => text,
                                Err(e) => {
                                    warn!(%peer, error = %e, "dropping unroutable message");
                                    continue;
                                }
                            };
                            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(%peer, client_id = session.name(), lagged_by = n, "broker client lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                // Handle frames sent by the client.
                msg = ws_rx.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.handle_frame(&mut session, text.as_str(), peer);
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(_)) => break,
                        _ => {}
                    }
                }
            }
        }

        debug!(%peer, client_id = session.name(), "broker client disconnected");
        Ok(())
    }

    fn handle_frame(&self, session: &mut Session, text: &str, peer: SocketAddr) {
        match Frame::decode(text) {
            Ok(Frame::Connect { client_id }) => {
                info!(%peer, client_id = %client_id, "bus client connected");
                session.client_id = Some(client_id);
            }
            Ok(Frame::Subscribe { topic }) => {
                debug!(%peer, client_id = session.name(), filter = %topic, "subscribe");
                if !session.filters.contains(&topic) {
                    session.filters.push(topic);
                }
            }
            Ok(Frame::Unsubscribe { topic }) => {
                session.filters.retain(|f| f != &topic);
            }
            Ok(Frame::Publish { topic, msg }) => {
                // Publishing to a topic nobody watches is normal.
                let _ = self.bus.publish(BusMessage::new(topic, Payload::from(msg)));
            }
            Err(e) => {
                warn!(%peer, error = %e, "ignoring malformed frame");
            }
        }
    }
}
