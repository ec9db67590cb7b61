//! Bosch BME280 temperature / humidity / pressure driver.
//!
//! Generic over any [`embedded_hal::i2c::I2c`] bus.  Each [`Sensor::read`]
//! triggers one forced-mode conversion with ×1 oversampling on all three
//! channels, waits for it to finish, and compensates the raw ADC values with
//! the floating-point formulas from the datasheet.
//!
//! | Register | Address       | Use                               |
//! |----------|---------------|-----------------------------------|
//! | id       | `0xD0`        | must read `0x60`                  |
//! | reset    | `0xE0`        | write `0xB6` for a soft reset     |
//! | calib    | `0x88`–`0xA1` | T1–T3, P1–P9, H1                  |
//! | calib    | `0xE1`–`0xE7` | H2–H6                             |
//! | ctrl_hum | `0xF2`        | humidity oversampling             |
//! | status   | `0xF3`        | bit 3 measuring, bit 0 NVM update |
//! | ctrl_meas| `0xF4`        | T/P oversampling + mode           |
//! | data     | `0xF7`–`0xFE` | press[3] temp[3] hum[2]           |

use std::thread;
use std::time::Duration;

use airmeter_types::{AirError, Reading};
use embedded_hal::i2c::I2c;
use tracing::debug;

use crate::sensor::Sensor;

pub const DEFAULT_ADDRESS: u8 = 0x76;

const CHIP_ID: u8 = 0x60;

const REG_CHIP_ID: u8 = 0xD0;
const REG_RESET: u8 = 0xE0;
const REG_CALIB_00: u8 = 0x88;
const REG_CALIB_26: u8 = 0xE1;
const REG_CTRL_HUM: u8 = 0xF2;
const REG_STATUS: u8 = 0xF3;
const REG_CTRL_MEAS: u8 = 0xF4;
const REG_DATA: u8 = 0xF7;

const RESET_COMMAND: u8 = 0xB6;
/// Humidity oversampling ×1.
const CTRL_HUM_X1: u8 = 0x01;
/// Temperature ×1, pressure ×1, forced mode.
const CTRL_MEAS_FORCED_X1: u8 = 0b001_001_01;

const STATUS_MEASURING: u8 = 0x08;
const STATUS_IM_UPDATE: u8 = 0x01;

/// Raw value the chip reports for a channel that was skipped.
const SKIPPED_20BIT: i32 = 0x80000;

const POLL_INTERVAL: Duration = Duration::from_millis(2);
const POLL_LIMIT: u32 = 50;

/// Factory trimming parameters read once at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Calibration {
    pub t1: u16,
    pub t2: i16,
    pub t3: i16,
    pub p1: u16,
    pub p2: i16,
    pub p3: i16,
    pub p4: i16,
    pub p5: i16,
    pub p6: i16,
    pub p7: i16,
    pub p8: i16,
    pub p9: i16,
    pub h1: u8,
    pub h2: i16,
    pub h3: u8,
    pub h4: i16,
    pub h5: i16,
    pub h6: i8,
}

impl Calibration {
    /// Decode the two calibration blocks.  `tp` is `0x88..=0xA1` (26 bytes),
    /// `h` is `0xE1..=0xE7` (7 bytes).
    pub fn from_registers(tp: &[u8; 26], h: &[u8; 7]) -> Self {
        let u16_at = |i: usize| u16::from_le_bytes([tp[i], tp[i + 1]]);
        let i16_at = |i: usize| i16::from_le_bytes([tp[i], tp[i + 1]]);

        // H4 and H5 are signed 12-bit values sharing the nibbles of 0xE5.
        let h4 = (i16::from(h[3] as i8) << 4) | i16::from(h[4] & 0x0F);
        let h5 = (i16::from(h[5] as i8) << 4) | i16::from(h[4] >> 4);

        Self {
            t1: u16_at(0),
            t2: i16_at(2),
            t3: i16_at(4),
            p1: u16_at(6),
            p2: i16_at(8),
            p3: i16_at(10),
            p4: i16_at(12),
            p5: i16_at(14),
            p6: i16_at(16),
            p7: i16_at(18),
            p8: i16_at(20),
            p9: i16_at(22),
            h1: tp[25],
            h2: i16::from_le_bytes([h[0], h[1]]),
            h3: h[2],
            h4,
            h5,
            h6: h[6] as i8,
        }
    }

    /// Returns `(temperature °C, t_fine)`.
    pub fn compensate_temperature(&self, adc_t: i32) -> (f64, f64) {
        let adc = f64::from(adc_t);
        let t1 = f64::from(self.t1);
        let var1 = (adc / 16384.0 - t1 / 1024.0) * f64::from(self.t2);
        let d = adc / 131072.0 - t1 / 8192.0;
        let var2 = d * d * f64::from(self.t3);
        let t_fine = var1 + var2;
        (t_fine / 5120.0, t_fine)
    }

    /// Pressure in Pa.
    pub fn compensate_pressure(&self, adc_p: i32, t_fine: f64) -> f64 {
        let mut var1 = t_fine / 2.0 - 64000.0;
        let mut var2 = var1 * var1 * f64::from(self.p6) / 32768.0;
        var2 += var1 * f64::from(self.p5) * 2.0;
        var2 = var2 / 4.0 + f64::from(self.p4) * 65536.0;
        var1 = (f64::from(self.p3) * var1 * var1 / 524288.0 + f64::from(self.p2) * var1) / 524288.0;
        var1 = (1.0 + var1 / 32768.0) * f64::from(self.p1);
        if var1 == 0.0 {
            return 0.0;
        }
        let mut p = 1048576.0 - f64::from(adc_p);
        p = (p - var2 / 4096.0) * 6250.0 / var1;
        let var1 = f64::from(self.p9) * p * p / 2147483648.0;
        let var2 = p * f64::from(self.p8) / 32768.0;
        p + (var1 + var2 + f64::from(self.p7)) / 16.0
    }

    /// Relative humidity in %, clamped to `[0, 100]`.
    pub fn compensate_humidity(&self, adc_h: i32, t_fine: f64) -> f64 {
        let var_h = t_fine - 76800.0;
        let var_h = (f64::from(adc_h)
            - (f64::from(self.h4) * 64.0 + f64::from(self.h5) / 16384.0 * var_h))
            * (f64::from(self.h2) / 65536.0
                * (1.0
                    + f64::from(self.h6) / 67108864.0
                        * var_h
                        * (1.0 + f64::from(self.h3) / 67108864.0 * var_h)));
        let var_h = var_h * (1.0 - f64::from(self.h1) * var_h / 524288.0);
        var_h.clamp(0.0, 100.0)
    }
}

pub struct Bme280<I2C> {
    i2c: I2C,
    address: u8,
    calibration: Calibration,
}

impl<I2C: I2c> Bme280<I2C> {
    /// Check the chip id, soft-reset it, and load its calibration.
    ///
    /// # Errors
    ///
    /// * [`AirError::SensorConfig`] – the device at `address` is not a BME280.
    /// * [`AirError::SensorRead`] – the bus transfer failed.
    pub fn new(i2c: I2C, address: u8) -> Result<Self, AirError> {
        let mut sensor = Self {
            i2c,
            address,
            calibration: Calibration::default(),
        };

        let mut id = [0u8; 1];
        sensor.read_registers(REG_CHIP_ID, &mut id)?;
        if id[0] != CHIP_ID {
            return Err(AirError::SensorConfig(format!(
                "device at {address:#04x} reports chip id {:#04x}, expected {CHIP_ID:#04x}",
                id[0]
            )));
        }

        sensor.soft_reset()?;
        sensor.wait_while(STATUS_IM_UPDATE)?;

        let mut tp = [0u8; 26];
        let mut h = [0u8; 7];
        sensor.read_registers(REG_CALIB_00, &mut tp)?;
        sensor.read_registers(REG_CALIB_26, &mut h)?;
        sensor.calibration = Calibration::from_registers(&tp, &h);
        debug!(address, calibration = ?sensor.calibration, "bme280 initialised");

        Ok(sensor)
    }

    pub fn calibration(&self) -> &Calibration {
        &self.calibration
    }

    pub fn release(self) -> I2C {
        self.i2c
    }

    fn read_registers(&mut self, register: u8, buf: &mut [u8]) -> Result<(), AirError> {
        self.i2c
            .write_read(self.address, &[register], buf)
            .map_err(|e| AirError::SensorRead(format!("bme280 read {register:#04x}: {e:?}")))
    }

    fn write_register(&mut self, register: u8, value: u8) -> Result<(), AirError> {
        self.i2c
            .write(self.address, &[register, value])
            .map_err(|e| AirError::SensorRead(format!("bme280 write {register:#04x}: {e:?}")))
    }

    fn soft_reset(&mut self) -> Result<(), AirError> {
        self.write_register(REG_RESET, RESET_COMMAND)?;
        thread::sleep(POLL_INTERVAL);
        Ok(())
    }

    fn wait_while(&mut self, mask: u8) -> Result<(), AirError> {
        let mut status = [0u8; 1];
        for _ in 0..POLL_LIMIT {
            self.read_registers(REG_STATUS, &mut status)?;
            if status[0] & mask == 0 {
                return Ok(());
            }
            thread::sleep(POLL_INTERVAL);
        }
        Err(AirError::SensorRead(format!(
            "bme280 status bit {mask:#04x} stuck"
        )))
    }
}

impl<I2C: I2c + Send> Sensor for Bme280<I2C> {
    fn model(&self) -> &'static str {
        "bme280"
    }

    fn read(&mut self) -> Result<Reading, AirError> {
        // ctrl_hum only takes effect after a write to ctrl_meas.
        self.write_register(REG_CTRL_HUM, CTRL_HUM_X1)?;
        self.write_register(REG_CTRL_MEAS, CTRL_MEAS_FORCED_X1)?;
        self.wait_while(STATUS_MEASURING)?;

        let mut data = [0u8; 8];
        self.read_registers(REG_DATA, &mut data)?;

        let adc_p = (i32::from(data[0]) << 12) | (i32::from(data[1]) << 4) | (i32::from(data[2]) >> 4);
        let adc_t = (i32::from(data[3]) << 12) | (i32::from(data[4]) << 4) | (i32::from(data[5]) >> 4);
        let adc_h = (i32::from(data[6]) << 8) | i32::from(data[7]);

        if adc_t == SKIPPED_20BIT {
            return Err(AirError::SensorRead(
                "bme280 returned no temperature sample".to_string(),
            ));
        }

        let (temperature, t_fine) = self.calibration.compensate_temperature(adc_t);
        let pressure = self.calibration.compensate_pressure(adc_p, t_fine);
        let humidity = self.calibration.compensate_humidity(adc_h, t_fine);

        Ok(Reading {
            temperature: Some(temperature as f32),
            humidity: Some(humidity as f32),
            pressure: Some(pressure as f32),
        })
    }

    fn cleanup(&mut self) -> Result<(), AirError> {
        self.soft_reset()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_i2c::MockI2c;

    /// Trimming values from the Bosch datasheet worked example.
    fn datasheet_tp_block() -> [u8; 26] {
        let words: [i32; 12] = [
            27504, 26435, -1000, // T1..T3
            36477, -10685, 3024, 2855, 140, -7, 15500, -14600, 6000, // P1..P9
        ];
        let mut block = [0u8; 26];
        for (i, w) in words.iter().enumerate() {
            let bytes = (*w as u16).to_le_bytes();
            block[i * 2] = bytes[0];
            block[i * 2 + 1] = bytes[1];
        }
        block[25] = 75; // H1
        block
    }

    fn humidity_block() -> [u8; 7] {
        // H2 = 362, H3 = 0, H4 = 324 (0x144), H5 = 50 (0x032), H6 = 30
        [0x6A, 0x01, 0x00, 0x14, 0x24, 0x03, 30]
    }

    fn mock_device() -> MockI2c {
        let mut i2c = MockI2c::new();
        i2c.set(REG_CHIP_ID, &[CHIP_ID]);
        i2c.set(REG_CALIB_00, &datasheet_tp_block());
        i2c.set(REG_CALIB_26, &humidity_block());
        i2c
    }

    fn set_sample(i2c: &mut MockI2c, adc_p: u32, adc_t: u32, adc_h: u16) {
        let [h_msb, h_lsb] = adc_h.to_be_bytes();
        i2c.set(
            REG_DATA,
            &[
                (adc_p >> 12) as u8,
                (adc_p >> 4) as u8,
                ((adc_p & 0x0F) << 4) as u8,
                (adc_t >> 12) as u8,
                (adc_t >> 4) as u8,
                ((adc_t & 0x0F) << 4) as u8,
                h_msb,
                h_lsb,
            ],
        );
    }

    #[test]
    fn calibration_decodes_split_humidity_nibbles() {
        let cal = Calibration::from_registers(&datasheet_tp_block(), &humidity_block());
        assert_eq!(cal.t1, 27504);
        assert_eq!(cal.t3, -1000);
        assert_eq!(cal.p9, 6000);
        assert_eq!(cal.h2, 362);
        assert_eq!(cal.h4, 324);
        assert_eq!(cal.h5, 50);
        assert_eq!(cal.h6, 30);
    }

    #[test]
    fn negative_h4_is_sign_extended() {
        // 0xE4 = 0xFF, low nibble of 0xE5 = 0xF  →  -1
        let cal = Calibration::from_registers(&[0; 26], &[0, 0, 0, 0xFF, 0x0F, 0, 0]);
        assert_eq!(cal.h4, -1);
    }

    #[test]
    fn datasheet_example_compensates() {
        let cal = Calibration::from_registers(&datasheet_tp_block(), &humidity_block());
        let (t, t_fine) = cal.compensate_temperature(519888);
        assert!((t - 25.08).abs() < 0.01, "temperature {t}");
        let p = cal.compensate_pressure(415148, t_fine);
        assert!((p - 100653.27).abs() < 1.0, "pressure {p}");
    }

    #[test]
    fn humidity_is_clamped() {
        let cal = Calibration::from_registers(&datasheet_tp_block(), &humidity_block());
        let (_, t_fine) = cal.compensate_temperature(519888);
        assert_eq!(cal.compensate_humidity(0, t_fine), 0.0);
        assert_eq!(cal.compensate_humidity(65535, t_fine), 100.0);
    }

    #[test]
    fn forced_read_produces_all_fields() {
        let mut i2c = mock_device();
        set_sample(&mut i2c, 415148, 519888, 30000);

        let mut sensor = Bme280::new(i2c, DEFAULT_ADDRESS).unwrap();
        let reading = sensor.read().unwrap();

        assert!((reading.temperature.unwrap() - 25.08).abs() < 0.01);
        assert!((reading.pressure.unwrap() - 100653.27).abs() < 1.0);
        let h = reading.humidity.unwrap();
        assert!((0.0..=100.0).contains(&h));

        let i2c = sensor.release();
        let writes: Vec<&[u8]> = i2c.writes.iter().map(|(_, w)| w.as_slice()).collect();
        assert!(writes.contains(&[REG_RESET, RESET_COMMAND].as_slice()));
        assert!(writes.contains(&[REG_CTRL_MEAS, CTRL_MEAS_FORCED_X1].as_slice()));
        assert!(i2c.writes.iter().all(|(addr, _)| *addr == DEFAULT_ADDRESS));
    }

    #[test]
    fn wrong_chip_id_is_a_config_error() {
        let mut i2c = mock_device();
        i2c.set(REG_CHIP_ID, &[0x58]); // BMP280
        assert!(matches!(
            Bme280::new(i2c, DEFAULT_ADDRESS),
            Err(AirError::SensorConfig(_))
        ));
    }

    #[test]
    fn skipped_temperature_is_a_read_error() {
        let mut i2c = mock_device();
        set_sample(&mut i2c, 415148, SKIPPED_20BIT as u32, 30000);
        let mut sensor = Bme280::new(i2c, DEFAULT_ADDRESS).unwrap();
        assert!(matches!(sensor.read(), Err(AirError::SensorRead(_))));
    }

    #[test]
    fn bus_failure_surfaces_as_read_error() {
        let mut sensor = Bme280::new(mock_device(), DEFAULT_ADDRESS).unwrap();
        sensor.i2c.fail = true;
        assert!(matches!(sensor.read(), Err(AirError::SensorRead(_))));
    }
}
