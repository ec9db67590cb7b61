//! Headless, topic-filtered publish/subscribe event bus.
//!
//! Uses a [`tokio::sync::broadcast`] channel under the hood so that every
//! subscriber receives every message without any single subscriber blocking
//! the others.  Each [`TopicSubscriber`] then keeps only the messages whose
//! topic matches its filter.
//!
//! # Topic filters
//!
//! Filters follow the MQTT conventions for `/`-separated topics:
//!
//! | Filter | Matches |
//! |---|---|
//! | `airmeter/home` | exactly `airmeter/home` |
//! | `airmeter/+` | `airmeter/home`, `airmeter/garage` (one level) |
//! | `airmeter/#` | `airmeter`, `airmeter/home`, `airmeter/home/attic` |
//! | `#` | every topic |

use airmeter_types::{AirError, BusMessage};
use tokio::sync::broadcast;
use tracing::warn;

/// Default channel capacity (number of buffered messages before old ones are
/// dropped for slow subscribers).
const DEFAULT_CAPACITY: usize = 256;

/// Shared event bus. Clone it cheaply – all clones share the same underlying
/// broadcast channel.
#[derive(Clone, Debug)]
pub struct EventBus {
    sender: broadcast::Sender<BusMessage>,
}

impl EventBus {
    /// Create a new bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish a message to every current subscriber.
    ///
    /// Returns the number of receivers that were handed the message, or
    /// [`AirError::Channel`] when nobody is listening.  Callers that treat
    /// "no listeners" as normal should ignore that case.
    pub fn publish(&self, message: BusMessage) -> Result<usize, AirError> {
        self.sender
            .send(message)
            .map_err(|e| AirError::Channel(format!("no subscribers for topic {}", e.0.topic)))
    }

    /// Subscribe to every message whose topic matches `filter`.
    pub fn subscribe(&self, filter: impl Into<String>) -> TopicSubscriber {
        TopicSubscriber {
            filter: filter.into(),
            receiver: self.sender.subscribe(),
        }
    }

    /// Raw access to the broadcast stream, unfiltered.
    pub fn subscribe_all(&self) -> broadcast::Receiver<BusMessage> {
        self.sender.subscribe()
    }

    /// Number of live receivers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Filtered subscriber
// ---------------------------------------------------------------------------

/// A subscriber that only delivers messages whose topic matches its filter.
pub struct TopicSubscriber {
    filter: String,
    receiver: broadcast::Receiver<BusMessage>,
}

impl TopicSubscriber {
    /// Wait for the next message that matches this subscriber's filter.
    ///
    /// Returns `None` when the bus is closed and no further messages will
    /// arrive.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        loop {
            match self.receiver.recv().await {
                Ok(message) if topic_matches(&self.filter, &message.topic) => {
                    return Some(message);
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    // Subscriber fell behind; log and continue.
                    warn!(filter = %self.filter, lagged_by = n, "TopicSubscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// `true` if `topic` matches the MQTT-style `filter`.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
