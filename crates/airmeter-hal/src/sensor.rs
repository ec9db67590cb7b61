//! The sensor capability seam.
//!
//! Drivers implement [`Sensor`] and report raw physical values (temperature in
//! °C, humidity in %RH, pressure in Pa).  The coordination loop never sees a
//! driver directly; it holds a [`Sampler`], which [`AirMeter`] provides by
//! converting units, applying static corrections, and serializing the result
//! into an opaque [`Payload`].

use airmeter_types::{AirError, Corrections, Payload, Reading, TemperatureUnit};
use tracing::debug;

/// An environmental sensor driver.
///
/// `read` is blocking and may take tens of milliseconds; callers run it off
/// the async executor.
pub trait Sensor: Send {
    /// Short model name used in logs, e.g. `"bme280"`.
    fn model(&self) -> &'static str;

    /// Take one measurement.  Temperature is always reported in Celsius.
    ///
    /// # Errors
    ///
    /// Returns [`AirError::SensorRead`] when the device cannot be read or
    /// returns corrupt data.
    fn read(&mut self) -> Result<Reading, AirError>;

    /// Put the device into a quiescent state before the process exits.
    fn cleanup(&mut self) -> Result<(), AirError> {
        Ok(())
    }
}

/// What the coordination loop samples: one call, one serialized reading.
pub trait Sampler: Send {
    /// Sample once.
    ///
    /// # Errors
    ///
    /// Any error means "no reading this time"; the caller logs and moves on.
    fn sample(&mut self) -> Result<Payload, AirError>;

    fn cleanup(&mut self) -> Result<(), AirError>;
}

impl<S: Sampler + ?Sized> Sampler for Box<S> {
    fn sample(&mut self) -> Result<Payload, AirError> {
        (**self).sample()
    }

    fn cleanup(&mut self) -> Result<(), AirError> {
        (**self).cleanup()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// AirMeter
// ────────────────────────────────────────────────────────────────────────────

/// Wraps a [`Sensor`] into a [`Sampler`].
///
/// Each sample converts the temperature into the configured unit, then adds
/// the [`Corrections`] to every field the driver reported.  Fields the driver
/// does not measure stay absent and are never corrected into existence.
pub struct AirMeter<S> {
    sensor: S,
    units: TemperatureUnit,
    corrections: Corrections,
    current: Option<Reading>,
}

impl<S: Sensor> AirMeter<S> {
    pub fn new(sensor: S, units: TemperatureUnit, corrections: Corrections) -> Self {
        Self {
            sensor,
            units,
            corrections,
            current: None,
        }
    }

    /// The most recent successful reading, after conversion and corrections.
    pub fn current(&self) -> Option<Reading> {
        self.current
    }

    /// Take one reading and apply conversion and corrections.
    ///
    /// # Errors
    ///
    /// Propagates the driver's error; `current()` is left unchanged.
    pub fn read(&mut self) -> Result<Reading, AirError> {
        let raw = self.sensor.read()?;
        let reading = Reading {
            temperature: raw
                .temperature
                .map(|c| self.units.convert(c) + self.corrections.temperature),
            humidity: raw.humidity.map(|h| h + self.corrections.humidity),
            pressure: raw.pressure.map(|p| p + self.corrections.pressure),
        };
        self.current = Some(reading);
        Ok(reading)
    }
}

impl<S: Sensor> Sampler for AirMeter<S> {
    fn sample(&mut self) -> Result<Payload, AirError> {
        let reading = self.read()?;
        let payload = reading.to_payload()?;
        debug!(model = self.sensor.model(), payload = %payload, "sampled sensor");
        Ok(payload)
    }

    fn cleanup(&mut self) -> Result<(), AirError> {
        self.sensor.cleanup()
    }
}
