//! `airmeter-types` – shared vocabulary for the AirMeter workspace.
//!
//! Every crate in the workspace speaks in these types: the opaque
//! [`Payload`] that flows from the sensor to the bus or to a waiting HTTP
//! caller, the [`Reading`] drivers produce before it is serialized, the
//! [`CommandName`] understood by the coordination loop, and the single
//! [`AirError`] taxonomy.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use uuid::Uuid;

// ─────────────────────────────────────────────────────────────────────────────
// Payload
// ─────────────────────────────────────────────────────────────────────────────

/// A serialized reading as produced by one sample operation.
///
/// The coordination loop never looks inside; it forwards the bytes to the bus
/// or hands them back to a synchronous requester unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Payload(Vec<u8>);

impl Payload {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// Borrow the payload as UTF-8 text.
    ///
    /// # Errors
    ///
    /// Returns [`AirError::Serialization`] when the bytes are not valid UTF-8.
    pub fn as_str(&self) -> Result<&str, AirError> {
        std::str::from_utf8(&self.0)
            .map_err(|e| AirError::Serialization(format!("payload is not UTF-8: {e}")))
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self(text.as_bytes().to_vec())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self(text.into_bytes())
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Reading
// ─────────────────────────────────────────────────────────────────────────────

/// One environmental sample.
///
/// Temperature is in the configured [`TemperatureUnit`], humidity in %RH and
/// pressure in Pa.  Fields a driver cannot measure stay `None` and are left
/// out of the JSON form, e.g. `{"Temperature":21.5,"Humidity":40.2}`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Reading {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub humidity: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pressure: Option<f32>,
}

impl Reading {
    /// Serialize the reading into its wire form.
    ///
    /// # Errors
    ///
    /// Returns [`AirError::Serialization`] if a field is NaN or infinite.
    /// JSON has no such numbers and would otherwise carry `null`.
    pub fn to_payload(&self) -> Result<Payload, AirError> {
        for (field, value) in [
            ("Temperature", self.temperature),
            ("Humidity", self.humidity),
            ("Pressure", self.pressure),
        ] {
            if let Some(v) = value
                && !v.is_finite()
            {
                return Err(AirError::Serialization(format!(
                    "reading encode error: {field} is {v}"
                )));
            }
        }
        serde_json::to_vec(self)
            .map(Payload::from)
            .map_err(|e| AirError::Serialization(format!("reading encode error: {e}")))
    }
}

/// Unit the temperature field is reported in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TemperatureUnit {
    #[default]
    #[serde(rename = "C", alias = "c")]
    Celsius,
    #[serde(rename = "F", alias = "f")]
    Fahrenheit,
}

impl TemperatureUnit {
    /// Convert a Celsius value into this unit.
    pub fn convert(self, celsius: f32) -> f32 {
        match self {
            TemperatureUnit::Celsius => celsius,
            TemperatureUnit::Fahrenheit => celsius * 9.0 / 5.0 + 32.0,
        }
    }
}

impl FromStr for TemperatureUnit {
    type Err = AirError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "C" | "c" => Ok(TemperatureUnit::Celsius),
            "F" | "f" => Ok(TemperatureUnit::Fahrenheit),
            other => Err(AirError::Config(format!(
                "invalid temperature unit '{other}' (expected C or F)"
            ))),
        }
    }
}

/// Static additive correction applied to every reading after unit
/// conversion, e.g. to compensate for a sensor mounted near a heat source.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Corrections {
    #[serde(default)]
    pub temperature: f32,
    #[serde(default)]
    pub humidity: f32,
    #[serde(default)]
    pub pressure: f32,
}

/// Which sensor backend to open at startup.
///
/// Written in lowercase; read in any case, like [`FromStr`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorKind {
    /// Random values, no hardware required.
    Dummy,
    /// Bosch BME280 (temperature, humidity, pressure).
    #[default]
    Bme280,
    /// Sensirion SHT3x (temperature, humidity).
    Sht3x,
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorKind::Dummy => write!(f, "dummy"),
            SensorKind::Bme280 => write!(f, "bme280"),
            SensorKind::Sht3x => write!(f, "sht3x"),
        }
    }
}

impl FromStr for SensorKind {
    type Err = AirError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dummy" => Ok(SensorKind::Dummy),
            "bme280" => Ok(SensorKind::Bme280),
            "sht3x" => Ok(SensorKind::Sht3x),
            other => Err(AirError::SensorConfig(format!("invalid driver '{other}'"))),
        }
    }
}

impl<'de> Deserialize<'de> for SensorKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        name.parse().map_err(serde::de::Error::custom)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Commands
// ─────────────────────────────────────────────────────────────────────────────

/// Name of a command submitted by the control surface.
///
/// Anything other than `"shutdown"` or `"reading"` is kept verbatim as
/// [`CommandName::Unrecognized`] so the loop can log what it rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CommandName {
    Shutdown,
    Reading,
    Unrecognized(String),
}

impl From<&str> for CommandName {
    fn from(name: &str) -> Self {
        match name {
            "shutdown" => CommandName::Shutdown,
            "reading" => CommandName::Reading,
            other => CommandName::Unrecognized(other.to_string()),
        }
    }
}

impl fmt::Display for CommandName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandName::Shutdown => write!(f, "shutdown"),
            CommandName::Reading => write!(f, "reading"),
            CommandName::Unrecognized(name) => write!(f, "{name}"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Bus messages
// ─────────────────────────────────────────────────────────────────────────────

/// A message observed on the bus.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g. "airmeter/home"
    pub topic: String,
    pub payload: Payload,
}

impl BusMessage {
    pub fn new(topic: impl Into<String>, payload: Payload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            topic: topic.into(),
            payload,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Global error type spanning sensor failures, bus connectivity, request
/// timeouts, and configuration problems.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AirError {
    #[error("Sensor Read Error: {0}")]
    SensorRead(String),

    #[error("Sensor Configuration Error: {0}")]
    SensorConfig(String),

    #[error("Bus Connection Error: {0}")]
    Connect(String),

    #[error("Bus Publish Error: {0}")]
    Publish(String),

    #[error("Channel Error: {0}")]
    Channel(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Request Rejected: {0}")]
    Busy(String),

    #[error("Serialization Error: {0}")]
    Serialization(String),

    #[error("Configuration Error: {0}")]
    Config(String),
}
