//! Sensirion SHT3x temperature / humidity driver.
//!
//! Uses single-shot, high-repeatability measurements without clock
//! stretching.  Every 16-bit word the sensor returns is followed by a CRC-8
//! that is checked before the value is trusted.

use std::thread;
use std::time::Duration;

use airmeter_types::{AirError, Reading};
use embedded_hal::i2c::I2c;

use crate::sensor::Sensor;

pub const DEFAULT_ADDRESS: u8 = 0x44;

const CMD_MEASURE_HIGH: [u8; 2] = [0x24, 0x00];
const CMD_SOFT_RESET: [u8; 2] = [0x30, 0xA2];

/// Max conversion time for high repeatability is 15.5 ms.
const MEASUREMENT_TIME: Duration = Duration::from_millis(16);

pub struct Sht3x<I2C> {
    i2c: I2C,
    address: u8,
}

impl<I2C: I2c> Sht3x<I2C> {
    pub fn new(i2c: I2C, address: u8) -> Self {
        Self { i2c, address }
    }

    pub fn release(self) -> I2C {
        self.i2c
    }

    fn command(&mut self, cmd: [u8; 2]) -> Result<(), AirError> {
        self.i2c
            .write(self.address, &cmd)
            .map_err(|e| AirError::SensorRead(format!("sht3x command {cmd:02x?}: {e:?}")))
    }
}

impl<I2C: I2c + Send> Sensor for Sht3x<I2C> {
    fn model(&self) -> &'static str {
        "sht3x"
    }

    fn read(&mut self) -> Result<Reading, AirError> {
        self.command(CMD_MEASURE_HIGH)?;
        thread::sleep(MEASUREMENT_TIME);

        let mut buf = [0u8; 6];
        self.i2c
            .read(self.address, &mut buf)
            .map_err(|e| AirError::SensorRead(format!("sht3x read: {e:?}")))?;

        let raw_t = checked_word(&buf[0..3])?;
        let raw_h = checked_word(&buf[3..6])?;

        Ok(Reading {
            temperature: Some(-45.0 + 175.0 * f32::from(raw_t) / 65535.0),
            humidity: Some(100.0 * f32::from(raw_h) / 65535.0),
            pressure: None,
        })
    }

    fn cleanup(&mut self) -> Result<(), AirError> {
        self.command(CMD_SOFT_RESET)
    }
}

fn checked_word(chunk: &[u8]) -> Result<u16, AirError> {
    let expected = crc8(&chunk[..2]);
    if chunk[2] != expected {
        return Err(AirError::SensorRead(format!(
            "sht3x crc mismatch: got {:#04x}, expected {expected:#04x}",
            chunk[2]
        )));
    }
    Ok(u16::from_be_bytes([chunk[0], chunk[1]]))
}

/// CRC-8, polynomial 0x31, init 0xFF, no reflection.
pub fn crc8(data: &[u8]) -> u8 {
    let mut crc = 0xFFu8;
    for byte in data {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ 0x31
            } else {
                crc << 1
            };
        }
    }
    crc
}
