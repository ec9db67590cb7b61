//! Scriptable I2C bus for driver tests.
//!
//! Behaves like a register-file device: the first byte of a write sets the
//! register pointer and any following bytes are stored from there on; reads
//! return bytes from the pointer onward.  Queued responses, when present,
//! take priority over the register file so command-style devices (SHT3x)
//! can be scripted too.

use std::collections::VecDeque;

use embedded_hal::i2c::{self, ErrorKind, ErrorType, I2c, Operation, SevenBitAddress};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockError;

impl i2c::Error for MockError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Other
    }
}

pub struct MockI2c {
    pub registers: [u8; 256],
    pub responses: VecDeque<Vec<u8>>,
    pub writes: Vec<(SevenBitAddress, Vec<u8>)>,
    pub fail: bool,
    pointer: u8,
}

impl MockI2c {
    pub fn new() -> Self {
        Self {
            registers: [0; 256],
            responses: VecDeque::new(),
            writes: Vec::new(),
            fail: false,
            pointer: 0,
        }
    }

    pub fn set(&mut self, register: u8, bytes: &[u8]) {
        for (offset, b) in bytes.iter().enumerate() {
            self.registers[register as usize + offset] = *b;
        }
    }
}

impl ErrorType for MockI2c {
    type Error = MockError;
}

impl I2c for MockI2c {
    fn transaction(
        &mut self,
        address: SevenBitAddress,
        operations: &mut [Operation<'_>],
    ) -> Result<(), Self::Error> {
        if self.fail {
            return Err(MockError);
        }
        for op in operations {
            match op {
                Operation::Write(bytes) => {
                    self.writes.push((address, bytes.to_vec()));
                    if let Some((first, rest)) = bytes.split_first() {
                        self.pointer = *first;
                        for b in rest {
                            self.registers[self.pointer as usize] = *b;
                            self.pointer = self.pointer.wrapping_add(1);
                        }
                    }
                }
                Operation::Read(buf) => {
                    if let Some(response) = self.responses.pop_front() {
                        let n = buf.len().min(response.len());
                        buf[..n].copy_from_slice(&response[..n]);
                    } else {
                        for slot in buf.iter_mut() {
                            *slot = self.registers[self.pointer as usize];
                            self.pointer = self.pointer.wrapping_add(1);
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
