//! Configuration file – reads/writes `~/.airmeter/config.toml`.
//!
//! Every field has a default, so a missing file (or a file with only a few
//! keys) is valid.  `AIRMETER_CONFIG` points at an alternative file and
//! `AIRMETER_*` variables override individual fields after the file is read.

use std::fmt;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use airmeter_hal::SensorConfig;
use airmeter_middleware::BackoffPolicy;
use airmeter_runtime::{AgentConfig, BusSettings, LoopConfig};
use airmeter_types::{AirError, Corrections, SensorKind, TemperatureUnit};
use serde::{Deserialize, Serialize};
use tracing::warn;

// ─────────────────────────────────────────────────────────────────────────────
// Sections
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorSection {
    #[serde(default)]
    pub driver: SensorKind,
    #[serde(default = "default_i2c_device")]
    pub i2c_device: PathBuf,
    /// 7-bit I2C address; omitted means the driver default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<u8>,
    #[serde(default)]
    pub units: TemperatureUnit,
    #[serde(default)]
    pub corrections: Corrections,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingSection {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// How long a synchronous read waits for the loop.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_max_pending_reads")]
    pub max_pending_reads: usize,
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct BusSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_topic_root")]
    pub topic_root: String,
    #[serde(default = "default_location")]
    pub location: String,
    /// Fixed client identity; a random UUID is used when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Log every message seen on the reading topic.
    #[serde(default)]
    pub subscribe: bool,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Run a broker inside this process.
    #[serde(default)]
    pub embedded_broker: bool,
    #[serde(default = "default_broker_addr")]
    pub broker_addr: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpSection {
    #[serde(default = "default_http_enabled")]
    pub enabled: bool,
    #[serde(default = "default_http_addr")]
    pub addr: String,
}

/// Persisted configuration stored in `~/.airmeter/config.toml`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub sensor: SensorSection,
    #[serde(default)]
    pub sampling: SamplingSection,
    #[serde(default)]
    pub bus: BusSection,
    #[serde(default)]
    pub http: HttpSection,
}

impl fmt::Debug for BusSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusSection")
            .field("enabled", &self.enabled)
            .field("endpoint", &redact_endpoint(&self.endpoint))
            .field("topic_root", &self.topic_root)
            .field("location", &self.location)
            .field("client_id", &self.client_id)
            .field("subscribe", &self.subscribe)
            .field("retry_base_ms", &self.retry_base_ms)
            .field("retry_attempts", &self.retry_attempts)
            .field("embedded_broker", &self.embedded_broker)
            .field("broker_addr", &self.broker_addr)
            .finish()
    }
}

fn default_i2c_device() -> PathBuf {
    PathBuf::from(airmeter_hal::factory::DEFAULT_I2C_DEVICE)
}
fn default_interval_ms() -> u64 {
    5000
}
fn default_read_timeout_ms() -> u64 {
    30_000
}
fn default_max_pending_reads() -> usize {
    1
}
fn default_endpoint() -> String {
    "tcp://localhost:1883".to_string()
}
fn default_topic_root() -> String {
    "airmeter".to_string()
}
fn default_location() -> String {
    "home".to_string()
}
fn default_retry_base_ms() -> u64 {
    30_000
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_broker_addr() -> String {
    "0.0.0.0:9090".to_string()
}
fn default_http_enabled() -> bool {
    true
}
fn default_http_addr() -> String {
    format!("0.0.0.0:{}", airmeter_cockpit::DEFAULT_PORT)
}

impl Default for SensorSection {
    fn default() -> Self {
        Self {
            driver: SensorKind::default(),
            i2c_device: default_i2c_device(),
            address: None,
            units: TemperatureUnit::default(),
            corrections: Corrections::default(),
        }
    }
}

impl Default for SamplingSection {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            max_pending_reads: default_max_pending_reads(),
        }
    }
}

impl Default for BusSection {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_endpoint(),
            topic_root: default_topic_root(),
            location: default_location(),
            client_id: None,
            subscribe: false,
            retry_base_ms: default_retry_base_ms(),
            retry_attempts: default_retry_attempts(),
            embedded_broker: false,
            broker_addr: default_broker_addr(),
        }
    }
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            enabled: default_http_enabled(),
            addr: default_http_addr(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Derived values
// ─────────────────────────────────────────────────────────────────────────────

impl Config {
    /// `{topic_root}/{location}`
    pub fn topic(&self) -> String {
        format!("{}/{}", self.bus.topic_root, self.bus.location)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.sampling.read_timeout_ms)
    }

    pub fn http_addr(&self) -> Result<SocketAddr, AirError> {
        parse_addr("http.addr", &self.http.addr)
    }

    pub fn broker_addr(&self) -> Result<SocketAddr, AirError> {
        parse_addr("bus.broker_addr", &self.bus.broker_addr)
    }

    /// Reject values that would only fail later at runtime.
    pub fn validate(&self) -> Result<(), AirError> {
        if self.sampling.interval_ms == 0 {
            return Err(invalid("sampling.interval_ms must be greater than zero"));
        }
        if self.sampling.read_timeout_ms == 0 {
            return Err(invalid("sampling.read_timeout_ms must be greater than zero"));
        }
        if self.sampling.max_pending_reads == 0 {
            return Err(invalid("sampling.max_pending_reads must be at least 1"));
        }
        for (key, value) in [
            ("bus.topic_root", &self.bus.topic_root),
            ("bus.location", &self.bus.location),
        ] {
            if value.is_empty() || value.contains(['+', '#']) {
                return Err(invalid(&format!(
                    "{key} must be non-empty and free of '+' and '#'"
                )));
            }
        }
        if self.bus.enabled && !BUS_SCHEMES.iter().any(|s| self.bus.endpoint.starts_with(s)) {
            return Err(invalid(
                "bus.endpoint must start with tcp://, mqtt://, ws:// or wss://",
            ));
        }
        if let Some(id) = &self.bus.client_id
            && (id.is_empty() || id.starts_with(' '))
        {
            return Err(invalid("bus.client_id must not be empty or start with a space"));
        }
        if self.bus.retry_attempts == 0 {
            return Err(invalid("bus.retry_attempts must be at least 1"));
        }
        if self.bus.embedded_broker {
            self.broker_addr()?;
        }
        if self.http.enabled {
            self.http_addr()?;
        }
        Ok(())
    }

    pub fn sensor_config(&self) -> SensorConfig {
        SensorConfig {
            driver: self.sensor.driver,
            i2c_device: self.sensor.i2c_device.clone(),
            address: self.sensor.address,
            units: self.sensor.units,
            corrections: self.sensor.corrections,
        }
    }

    pub fn agent_config(&self) -> AgentConfig {
        let bus = self.bus.enabled.then(|| {
            let mut settings = BusSettings::new(self.bus.endpoint.clone());
            if let Some(id) = &self.bus.client_id {
                settings.identity = id.clone();
            }
            settings.backoff = BackoffPolicy {
                base_delay: Duration::from_millis(self.bus.retry_base_ms),
                max_attempts: self.bus.retry_attempts,
                ..BackoffPolicy::default()
            };
            if self.bus.subscribe {
                settings.diagnostics_filter = Some(self.topic());
            }
            settings
        });

        AgentConfig {
            loop_config: LoopConfig {
                interval: Duration::from_millis(self.sampling.interval_ms),
                topic: self.topic(),
            },
            bus,
            max_pending_reads: self.sampling.max_pending_reads,
            ..AgentConfig::default()
        }
    }
}

const BUS_SCHEMES: [&str; 4] = ["tcp://", "mqtt://", "ws://", "wss://"];

fn invalid(message: &str) -> AirError {
    AirError::Config(message.to_string())
}

fn parse_addr(key: &str, value: &str) -> Result<SocketAddr, AirError> {
    value
        .parse()
        .map_err(|e| AirError::Config(format!("{key} '{value}' is not a socket address: {e}")))
}

/// Hide `user:password@` in an endpoint URL.  Only the authority (up to
/// the first `/`) is inspected.
pub fn redact_endpoint(endpoint: &str) -> String {
    let Some((scheme, rest)) = endpoint.split_once("://") else {
        return endpoint.to_string();
    };
    let (authority, path) = rest.split_at(rest.find('/').unwrap_or(rest.len()));
    match authority.rsplit_once('@') {
        Some((_, host)) => format!("{scheme}://<redacted>@{host}{path}"),
        None => endpoint.to_string(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Load / save
// ─────────────────────────────────────────────────────────────────────────────

/// `$AIRMETER_CONFIG`, or `~/.airmeter/config.toml`.
pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("AIRMETER_CONFIG") {
        return PathBuf::from(path);
    }
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".airmeter").join("config.toml")
}

/// Load, apply environment overrides, and validate.
pub fn load() -> Result<Config, AirError> {
    load_from(&config_path())
}

pub(crate) fn load_from(path: &Path) -> Result<Config, AirError> {
    let mut cfg = if path.exists() {
        let raw = fs::read_to_string(path)
            .map_err(|e| AirError::Config(format!("failed to read {}: {e}", path.display())))?;
        toml::from_str(&raw)
            .map_err(|e| AirError::Config(format!("failed to parse {}: {e}", path.display())))?
    } else {
        Config::default()
    };
    apply_env_overrides(&mut cfg);
    cfg.validate()?;
    Ok(cfg)
}

/// Apply `AIRMETER_*` environment variable overrides to `cfg`.
///
/// | Variable                 | Field               |
/// |--------------------------|---------------------|
/// | `AIRMETER_DRIVER`        | `sensor.driver`     |
/// | `AIRMETER_I2C_DEVICE`    | `sensor.i2c_device` |
/// | `AIRMETER_UNITS`         | `sensor.units`      |
/// | `AIRMETER_INTERVAL_MS`   | `sampling.interval_ms` |
/// | `AIRMETER_BUS_ENABLED`   | `bus.enabled`       |
/// | `AIRMETER_BUS_ENDPOINT`  | `bus.endpoint`      |
/// | `AIRMETER_TOPIC_ROOT`    | `bus.topic_root`    |
/// | `AIRMETER_LOCATION`      | `bus.location`      |
/// | `AIRMETER_HTTP_ADDR`     | `http.addr`         |
///
/// Values that do not parse are ignored with a warning.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("AIRMETER_DRIVER") {
        match v.parse::<SensorKind>() {
            Ok(kind) => cfg.sensor.driver = kind,
            Err(e) => warn!(value = %v, error = %e, "ignoring AIRMETER_DRIVER"),
        }
    }
    if let Ok(v) = std::env::var("AIRMETER_I2C_DEVICE") {
        cfg.sensor.i2c_device = PathBuf::from(v);
    }
    if let Ok(v) = std::env::var("AIRMETER_UNITS") {
        match v.parse::<TemperatureUnit>() {
            Ok(units) => cfg.sensor.units = units,
            Err(e) => warn!(value = %v, error = %e, "ignoring AIRMETER_UNITS"),
        }
    }
    if let Ok(v) = std::env::var("AIRMETER_INTERVAL_MS") {
        match v.parse::<u64>() {
            Ok(ms) => cfg.sampling.interval_ms = ms,
            Err(e) => warn!(value = %v, error = %e, "ignoring AIRMETER_INTERVAL_MS"),
        }
    }
    if let Ok(v) = std::env::var("AIRMETER_BUS_ENABLED") {
        match v.parse::<bool>() {
            Ok(enabled) => cfg.bus.enabled = enabled,
            Err(e) => warn!(value = %v, error = %e, "ignoring AIRMETER_BUS_ENABLED"),
        }
    }
    if let Ok(v) = std::env::var("AIRMETER_BUS_ENDPOINT") {
        cfg.bus.endpoint = v;
    }
    if let Ok(v) = std::env::var("AIRMETER_TOPIC_ROOT") {
        cfg.bus.topic_root = v;
    }
    if let Ok(v) = std::env::var("AIRMETER_LOCATION") {
        cfg.bus.location = v;
    }
    if let Ok(v) = std::env::var("AIRMETER_HTTP_ADDR") {
        cfg.http.addr = v;
    }
}

/// Write `cfg` to `path`, creating the parent directory if necessary.
///
/// On Unix the file is `rw-------`, and a directory created here is
/// `rwx------`; the bus endpoint may embed credentials.  An existing
/// directory keeps its mode.
pub fn save_to(cfg: &Config, path: &Path) -> Result<(), AirError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
    {
        fs::create_dir_all(parent)
            .map_err(|e| AirError::Config(format!("failed to create {}: {e}", parent.display())))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700)).map_err(|e| {
                AirError::Config(format!("failed to restrict {}: {e}", parent.display()))
            })?;
        }
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| AirError::Config(format!("failed to serialize config: {e}")))?;
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .map_err(|e| AirError::Config(format!("failed to write {}: {e}", path.display())))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| AirError::Config(format!("failed to write {}: {e}", path.display())))?;
    Ok(())
}
