//! Startup selection of the sensor backend.
//!
//! [`open_sampler`] turns a [`SensorConfig`] into the boxed [`Sampler`] the
//! coordination loop owns for the rest of the process.

use std::path::PathBuf;

use airmeter_types::{AirError, Corrections, SensorKind, TemperatureUnit};
use tracing::info;

use crate::dummy::DummySensor;
use crate::sensor::{AirMeter, Sampler};

pub const DEFAULT_I2C_DEVICE: &str = "/dev/i2c-1";

/// Immutable sensor configuration built once at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorConfig {
    pub driver: SensorKind,
    pub i2c_device: PathBuf,
    /// 7-bit device address; `None` uses the driver default.
    pub address: Option<u8>,
    pub units: TemperatureUnit,
    pub corrections: Corrections,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            driver: SensorKind::default(),
            i2c_device: PathBuf::from(DEFAULT_I2C_DEVICE),
            address: None,
            units: TemperatureUnit::default(),
            corrections: Corrections::default(),
        }
    }
}

impl SensorConfig {
    /// The address that will actually be used, if the driver has one.
    pub fn effective_address(&self) -> Option<u8> {
        match self.driver {
            SensorKind::Dummy => None,
            SensorKind::Bme280 => Some(self.address.unwrap_or(crate::bme280::DEFAULT_ADDRESS)),
            SensorKind::Sht3x => Some(self.address.unwrap_or(crate::sht3x::DEFAULT_ADDRESS)),
        }
    }
}

/// Open the configured sensor and wrap it for sampling.
///
/// # Errors
///
/// Returns [`AirError::SensorConfig`] when the I2C device cannot be opened,
/// when the chip does not answer as expected, or when an I2C driver is
/// requested on a platform without `/dev/i2c-*`.
pub fn open_sampler(config: &SensorConfig) -> Result<Box<dyn Sampler>, AirError> {
    let sampler: Box<dyn Sampler> = match config.driver {
        SensorKind::Dummy => Box::new(AirMeter::new(
            DummySensor::new(),
            config.units,
            config.corrections,
        )),
        SensorKind::Bme280 | SensorKind::Sht3x => open_i2c(config)?,
    };

    info!(
        driver = %config.driver,
        device = %config.i2c_device.display(),
        address = ?config.effective_address(),
        units = ?config.units,
        "sensor opened"
    );
    Ok(sampler)
}

#[cfg(target_os = "linux")]
fn open_i2c(config: &SensorConfig) -> Result<Box<dyn Sampler>, AirError> {
    use linux_embedded_hal::I2cdev;

    use crate::bme280::Bme280;
    use crate::sht3x::Sht3x;

    let bus = I2cdev::new(&config.i2c_device).map_err(|e| {
        AirError::SensorConfig(format!(
            "cannot open {}: {e}",
            config.i2c_device.display()
        ))
    })?;
    let address = config.effective_address().unwrap_or_default();

    let sampler: Box<dyn Sampler> = match config.driver {
        SensorKind::Bme280 => {
            let sensor = Bme280::new(bus, address).map_err(|e| match e {
                AirError::SensorRead(msg) => AirError::SensorConfig(msg),
                other => other,
            })?;
            Box::new(AirMeter::new(sensor, config.units, config.corrections))
        }
        SensorKind::Sht3x => Box::new(AirMeter::new(
            Sht3x::new(bus, address),
            config.units,
            config.corrections,
        )),
        SensorKind::Dummy => Box::new(AirMeter::new(
            DummySensor::new(),
            config.units,
            config.corrections,
        )),
    };
    Ok(sampler)
}

#[cfg(not(target_os = "linux"))]
fn open_i2c(config: &SensorConfig) -> Result<Box<dyn Sampler>, AirError> {
    Err(AirError::SensorConfig(format!(
        "driver '{}' needs Linux i2c-dev support",
        config.driver
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_addresses_follow_driver() {
        let mut config = SensorConfig::default();
        assert_eq!(config.effective_address(), Some(0x76));
        config.driver = SensorKind::Sht3x;
        assert_eq!(config.effective_address(), Some(0x44));
        config.address = Some(0x45);
        assert_eq!(config.effective_address(), Some(0x45));
        config.driver = SensorKind::Dummy;
        assert_eq!(config.effective_address(), None);
    }

    #[test]
    fn dummy_sampler_produces_json() {
        let config = SensorConfig {
            driver: SensorKind::Dummy,
            ..SensorConfig::default()
        };
        let mut sampler = open_sampler(&config).unwrap();
        let payload = sampler.sample().unwrap();
        let json: serde_json::Value = serde_json::from_slice(payload.as_bytes()).unwrap();
        assert!(json["Temperature"].is_number());
        assert!(json["Humidity"].is_number());
        assert!(json["Pressure"].is_number());
        assert!(sampler.cleanup().is_ok());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn i2c_drivers_accept_linux_i2cdev() {
        fn is_sensor<S: crate::sensor::Sensor>() {}
        is_sensor::<crate::bme280::Bme280<linux_embedded_hal::I2cdev>>();
        is_sensor::<crate::sht3x::Sht3x<linux_embedded_hal::I2cdev>>();
    }

    #[test]
    fn missing_i2c_device_is_a_config_error() {
        let config = SensorConfig {
            driver: SensorKind::Bme280,
            i2c_device: PathBuf::from("/dev/i2c-does-not-exist"),
            ..SensorConfig::default()
        };
        assert!(matches!(open_sampler(&config), Err(AirError::SensorConfig(_))));
    }
}
