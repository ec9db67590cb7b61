//! Hardware-free sensor producing uniform random values.
//!
//! Useful for running the whole agent on a laptop or in CI: every field is
//! drawn from `[0, 100)` on each read.

use airmeter_types::{AirError, Reading};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::sensor::Sensor;

pub struct DummySensor {
    rng: StdRng,
}

impl DummySensor {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Deterministic sequence, for tests.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn draw(&mut self) -> f32 {
        self.rng.gen_range(0.0..100.0)
    }
}

impl Default for DummySensor {
    fn default() -> Self {
        Self::new()
    }
}

impl Sensor for DummySensor {
    fn model(&self) -> &'static str {
        "dummy"
    }

    fn read(&mut self) -> Result<Reading, AirError> {
        Ok(Reading {
            temperature: Some(self.draw()),
            humidity: Some(self.draw()),
            pressure: Some(self.draw()),
        })
    }
}
