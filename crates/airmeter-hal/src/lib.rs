//! `airmeter-hal` – sensor access.
//!
//! Drivers implement [`Sensor`]; the rest of the workspace only ever holds a
//! [`Sampler`] obtained from [`open_sampler`], so backends can be swapped by
//! configuration without touching the coordination loop.
//!
//! | Driver        | Fields                           | Bus          |
//! |---------------|----------------------------------|--------------|
//! | `dummy`       | temperature, humidity, pressure  | none         |
//! | `bme280`      | temperature, humidity, pressure  | I2C `0x76`   |
//! | `sht3x`       | temperature, humidity            | I2C `0x44`   |
//!
//! On Linux the I2C drivers run over `/dev/i2c-N` through
//! [`linux_embedded_hal::I2cdev`].

pub mod bme280;
pub mod dummy;
pub mod factory;
pub mod sensor;
pub mod sht3x;

#[cfg(test)]
mod mock_i2c;

pub use bme280::Bme280;
pub use dummy::DummySensor;
pub use factory::{SensorConfig, open_sampler};
pub use sensor::{AirMeter, Sampler, Sensor};
pub use sht3x::Sht3x;
