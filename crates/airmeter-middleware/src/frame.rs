//! JSON wire frames exchanged between [`WsBusClient`][crate::ws_client::WsBusClient]
//! and the [`Broker`][crate::broker::Broker].
//!
//! Frames are rosbridge-style objects tagged by `op`:
//!
//! ```json
//! {"op":"connect","client_id":"7d1c…"}
//! {"op":"subscribe","topic":"airmeter/#"}
//! {"op":"publish","topic":"airmeter/home","msg":"{\"Temperature\":21.4}"}
//! ```

use airmeter_types::{AirError, Payload};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Frame {
    Connect { client_id: String },
    Publish { topic: String, msg: String },
    Subscribe { topic: String },
    Unsubscribe { topic: String },
}

impl Frame {
    /// Build a publish frame.  The payload travels as text.
    ///
    /// # Errors
    ///
    /// Returns [`AirError::Serialization`] if the payload is not UTF-8.
    pub fn publish(topic: &str, payload: &Payload) -> Result<Self, AirError> {
        Ok(Frame::Publish {
            topic: topic.to_string(),
            msg: payload.as_str()?.to_string(),
        })
    }

    pub fn encode(&self) -> Result<String, AirError> {
        serde_json::to_string(self)
            .map_err(|e| AirError::Serialization(format!("frame encode error: {e}")))
    }

    pub fn decode(text: &str) -> Result<Self, AirError> {
        serde_json::from_str(text)
            .map_err(|e| AirError::Serialization(format!("frame decode error: {e}")))
    }
}
